//! In-memory backoff tracking for failed reconciliations
//!
//! Entries live only in process memory and are lost on restart.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Longest delay ever scheduled between retries
pub const BACKOFF_CEILING: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponential backoff: `base * 2^(retry_count - 1)`, capped at `max`
pub fn calculate_backoff(retry_count: u32, base: Duration, max: Duration) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryEntry {
    pub retry_count: u32,
    pub next_retry: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Count at which a resource is reported as persistently failing
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
            max_retries: 10,
        }
    }
}

/// Resource id → backoff state
#[derive(Debug)]
pub struct RetryQueue {
    policy: RetryPolicy,
    entries: Mutex<HashMap<Uuid, RetryEntry>>,
}

impl RetryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, RetryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while the resource is inside its backoff window
    pub fn should_skip(&self, id: Uuid) -> bool {
        self.should_skip_at(id, Instant::now())
    }

    pub fn should_skip_at(&self, id: Uuid, now: Instant) -> bool {
        self.lock()
            .get(&id)
            .is_some_and(|entry| now < entry.next_retry)
    }

    /// Record a failure and return the updated entry
    pub fn add(&self, id: Uuid) -> RetryEntry {
        self.add_at(id, Instant::now())
    }

    pub fn add_at(&self, id: Uuid, now: Instant) -> RetryEntry {
        let mut entries = self.lock();
        let retry_count = entries.get(&id).map_or(1, |e| e.retry_count.saturating_add(1));
        let backoff = calculate_backoff(retry_count, self.policy.base, self.policy.max)
            .min(BACKOFF_CEILING);
        let entry = RetryEntry {
            retry_count,
            next_retry: now.checked_add(backoff).unwrap_or(now),
        };
        entries.insert(id, entry);
        entry
    }

    /// Forget the resource after a successful reconciliation
    pub fn remove(&self, id: Uuid) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn get(&self, id: Uuid) -> Option<RetryEntry> {
        self.lock().get(&id).copied()
    }

    pub fn exhausted(&self, entry: &RetryEntry) -> bool {
        entry.retry_count >= self.policy.max_retries
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(5);
    const MAX: Duration = Duration::from_secs(300);

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(1, BASE, MAX), Duration::from_secs(5));
        assert_eq!(calculate_backoff(2, BASE, MAX), Duration::from_secs(10));
        assert_eq!(calculate_backoff(4, BASE, MAX), Duration::from_secs(40));
        // capped at 5 min
        assert_eq!(calculate_backoff(7, BASE, MAX), MAX);
        assert_eq!(calculate_backoff(10, BASE, MAX), MAX);
        assert_eq!(calculate_backoff(u32::MAX, BASE, MAX), MAX);
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let mut previous = Duration::ZERO;
        for count in 1..64 {
            let delay = calculate_backoff(count, BASE, MAX);
            assert!(delay >= previous, "backoff shrank at retry {count}");
            assert!(delay <= MAX);
            previous = delay;
        }
    }

    #[test]
    fn test_add_increments_and_schedules() {
        let queue = RetryQueue::new(RetryPolicy::default());
        let id = Uuid::new_v4();
        let now = Instant::now();

        let first = queue.add_at(id, now);
        assert_eq!(first.retry_count, 1);
        assert_eq!(first.next_retry, now + Duration::from_secs(5));

        let second = queue.add_at(id, now);
        assert_eq!(second.retry_count, 2);
        assert_eq!(second.next_retry, now + Duration::from_secs(10));

        queue.add_at(id, now);
        let fourth = queue.add_at(id, now);
        assert_eq!(fourth.retry_count, 4);
        assert_eq!(fourth.next_retry, now + Duration::from_secs(40));
    }

    #[test]
    fn test_huge_backoff_is_capped() {
        let huge = Duration::from_secs(u64::MAX / 2);
        let queue = RetryQueue::new(RetryPolicy {
            base: huge,
            max: huge,
            max_retries: 10,
        });
        let id = Uuid::new_v4();
        let now = Instant::now();

        let first = queue.add_at(id, now);
        assert_eq!(first.next_retry, now + BACKOFF_CEILING);
        let second = queue.add_at(id, now);
        assert_eq!(second.retry_count, 2);
        assert_eq!(second.next_retry, now + BACKOFF_CEILING);
    }

    #[test]
    fn test_should_skip_only_inside_window() {
        let queue = RetryQueue::new(RetryPolicy::default());
        let id = Uuid::new_v4();
        let now = Instant::now();

        assert!(!queue.should_skip_at(id, now));
        queue.add_at(id, now);
        assert!(queue.should_skip_at(id, now));
        assert!(queue.should_skip_at(id, now + Duration::from_secs(4)));
        assert!(!queue.should_skip_at(id, now + Duration::from_secs(5)));
    }

    #[test]
    fn test_remove_resets_state() {
        let queue = RetryQueue::new(RetryPolicy::default());
        let id = Uuid::new_v4();
        let now = Instant::now();

        queue.add_at(id, now);
        queue.add_at(id, now);
        assert!(queue.remove(id));
        assert!(!queue.remove(id));
        assert!(queue.is_empty());
        assert!(!queue.should_skip_at(id, now));
        assert_eq!(queue.add_at(id, now).retry_count, 1);
    }

    #[test]
    fn test_exhausted_after_max_retries() {
        let queue = RetryQueue::new(RetryPolicy {
            max_retries: 3,
            ..Default::default()
        });
        let id = Uuid::new_v4();
        let now = Instant::now();
        let first = queue.add_at(id, now);
        assert!(!queue.exhausted(&first));
        queue.add_at(id, now);
        let third = queue.add_at(id, now);
        assert!(queue.exhausted(&third));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_entries_are_independent() {
        let queue = RetryQueue::new(RetryPolicy::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Instant::now();
        queue.add_at(a, now);
        assert!(queue.should_skip_at(a, now));
        assert!(!queue.should_skip_at(b, now));
        assert_eq!(queue.get(a).map(|e| e.retry_count), Some(1));
        assert_eq!(queue.get(b), None);
    }
}
