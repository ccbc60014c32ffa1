//! Bounded queue of resource ids feeding the worker pool

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Ids are deduplicated from enqueue until the worker calls [`WorkQueue::done`]
#[derive(Debug)]
pub struct WorkQueue {
    tx: mpsc::Sender<Uuid>,
    rx: AsyncMutex<mpsc::Receiver<Uuid>>,
    pending: Mutex<HashSet<Uuid>>,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: AsyncMutex::new(rx),
            pending: Mutex::new(HashSet::new()),
        }
    }

    fn pending_set(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `id`, waiting for capacity. Returns false when the id is already
    /// queued or in flight, or when shutdown began first.
    pub async fn enqueue(&self, id: Uuid, shutdown: &CancellationToken) -> bool {
        if !self.pending_set().insert(id) {
            return false;
        }
        let sent = tokio::select! {
            _ = shutdown.cancelled() => false,
            res = self.tx.send(id) => res.is_ok(),
        };
        if !sent {
            self.pending_set().remove(&id);
        }
        sent
    }

    /// Next id to work on, or `None` once shutdown is signalled
    pub async fn next(&self, shutdown: &CancellationToken) -> Option<Uuid> {
        tokio::select! {
            _ = shutdown.cancelled() => None,
            id = async { self.rx.lock().await.recv().await } => id,
        }
    }

    pub fn done(&self, id: Uuid) {
        self.pending_set().remove(&id);
    }

    pub fn pending(&self) -> usize {
        self.pending_set().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_duplicate_ids_are_dropped_until_done() {
        let queue = WorkQueue::new(4);
        let token = CancellationToken::new();
        let id = Uuid::new_v4();

        assert!(queue.enqueue(id, &token).await);
        assert!(!queue.enqueue(id, &token).await);
        assert_eq!(queue.next(&token).await, Some(id));
        // still in flight
        assert!(!queue.enqueue(id, &token).await);
        queue.done(id);
        assert!(queue.enqueue(id, &token).await);
    }

    #[tokio::test]
    async fn test_enqueue_gives_up_on_shutdown_when_full() {
        let queue = WorkQueue::new(1);
        let token = CancellationToken::new();
        assert!(queue.enqueue(Uuid::new_v4(), &token).await);

        let blocked = Uuid::new_v4();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        assert!(!queue.enqueue(blocked, &token).await);
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test]
    async fn test_next_returns_none_after_shutdown() {
        let queue = WorkQueue::new(1);
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(queue.next(&token).await, None);
    }
}
