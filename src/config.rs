//! Controller configuration
//!
//! Every setting is read from the environment (or the matching command-line
//! flag) once at startup and validated before any collaborator is built.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, ValueEnum};
use sqlx::postgres::PgSslMode;
use tracing::Level;

use crate::controller::retry::BACKOFF_CEILING;
use crate::error::{Error, Result};

/// Full controller configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(flatten)]
    pub database: DatabaseConfig,

    #[command(flatten)]
    pub cluster: ClusterConfig,

    #[command(flatten)]
    pub reconcile: ReconcileConfig,

    #[command(flatten)]
    pub logging: LoggingConfig,

    #[command(flatten)]
    pub endpoints: EndpointConfig,

    /// YAML file that adds or overrides resource type definitions
    #[arg(long, env = "RESOURCE_TYPES_FILE")]
    pub resource_types_file: Option<PathBuf>,
}

/// Desired-state database connection parameters
#[derive(Args, Debug, Clone)]
pub struct DatabaseConfig {
    #[arg(long = "db-host", env = "DB_HOST", default_value = "localhost")]
    pub host: String,

    #[arg(long = "db-port", env = "DB_PORT", default_value_t = 5432)]
    pub port: u16,

    #[arg(long = "db-user", env = "DB_USER", default_value = "postgres")]
    pub user: String,

    /// Required; startup fails without it
    #[arg(long = "db-password", env = "DB_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long = "db-name", env = "DB_NAME", default_value = "provisioner")]
    pub name: String,

    /// libpq-style ssl mode (disable, allow, prefer, require, verify-ca, verify-full)
    #[arg(long = "db-sslmode", env = "DB_SSLMODE", default_value = "disable")]
    pub ssl_mode: String,

    #[arg(long = "db-max-connections", env = "DB_MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: u32,
}

/// How to reach the Kubernetes API and which namespaces to watch
#[derive(Args, Debug, Clone)]
pub struct ClusterConfig {
    /// Use the pod's service-account credentials
    #[arg(long, env = "K8S_IN_CLUSTER", default_value_t = true, action = ArgAction::Set)]
    pub in_cluster: bool,

    /// Credentials file used when not running in-cluster
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Only namespaces starting with this prefix are watched
    #[arg(long, env = "NAMESPACE_PREFIX", default_value = "team-")]
    pub namespace_prefix: String,

    /// DNS suffix used when computing in-cluster service addresses
    #[arg(long, env = "CLUSTER_DOMAIN", default_value = "cluster.local")]
    pub cluster_domain: String,
}

/// Reconcile loop, worker pool and backoff tunables
#[derive(Args, Debug, Clone)]
pub struct ReconcileConfig {
    #[arg(long, env = "RECONCILE_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    pub reconcile_interval: Duration,

    #[arg(long, env = "WORKER_COUNT", default_value_t = 5)]
    pub worker_count: usize,

    /// Retry count after which a failing resource is reported as persistently failing
    #[arg(long, env = "MAX_RETRIES", default_value_t = 10)]
    pub max_retries: u32,

    #[arg(long, env = "RETRY_BACKOFF_BASE", default_value = "5s", value_parser = parse_duration)]
    pub retry_backoff_base: Duration,

    #[arg(long, env = "RETRY_BACKOFF_MAX", default_value = "5m", value_parser = parse_duration)]
    pub retry_backoff_max: Duration,

    /// Fixed delay before a closed or failed watch stream is reopened
    #[arg(long, env = "WATCH_RETRY_DELAY", default_value = "5s", value_parser = parse_duration)]
    pub watch_retry_delay: Duration,

    /// Capacity of the shared watch event channel
    #[arg(long, env = "EVENT_BUFFER_SIZE", default_value_t = 1000)]
    pub event_buffer_size: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingConfig {
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Health and metrics HTTP listeners
#[derive(Args, Debug, Clone)]
pub struct EndpointConfig {
    #[arg(long, env = "HEALTH_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub health_enabled: bool,

    #[arg(long, env = "HEALTH_PORT", default_value_t = 8081)]
    pub health_port: u16,

    #[arg(long, env = "METRICS_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub metrics_enabled: bool,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,
}

/// Cluster credential source selected from [`ClusterConfig`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterConnection {
    /// Service-account token mounted into the pod
    InCluster,
    /// Kubeconfig file; `None` falls back to the client's default discovery
    Kubeconfig(Option<PathBuf>),
}

impl Config {
    /// Parse configuration from environment variables only
    pub fn from_env() -> Result<Self> {
        let config = Config::try_parse_from(["provisioner-controller"])
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that clap cannot express
    pub fn validate(&self) -> Result<()> {
        match self.database.password.as_deref() {
            Some(p) if !p.is_empty() => {}
            _ => return Err(Error::ConfigError("DB_PASSWORD is required".to_string())),
        }
        self.database.ssl_mode()?;
        self.logging.level()?;

        let r = &self.reconcile;
        if r.worker_count == 0 {
            return Err(Error::ConfigError(
                "WORKER_COUNT must be at least 1".to_string(),
            ));
        }
        if r.event_buffer_size == 0 {
            return Err(Error::ConfigError(
                "EVENT_BUFFER_SIZE must be at least 1".to_string(),
            ));
        }
        if r.reconcile_interval.is_zero() {
            return Err(Error::ConfigError(
                "RECONCILE_INTERVAL must be greater than zero".to_string(),
            ));
        }
        if r.retry_backoff_base.is_zero() {
            return Err(Error::ConfigError(
                "RETRY_BACKOFF_BASE must be greater than zero".to_string(),
            ));
        }
        if r.retry_backoff_max > BACKOFF_CEILING {
            return Err(Error::ConfigError(format!(
                "RETRY_BACKOFF_MAX ({:?}) must not exceed {:?}",
                r.retry_backoff_max, BACKOFF_CEILING
            )));
        }
        if r.retry_backoff_max < r.retry_backoff_base {
            return Err(Error::ConfigError(format!(
                "RETRY_BACKOFF_MAX ({:?}) must not be smaller than RETRY_BACKOFF_BASE ({:?})",
                r.retry_backoff_max, r.retry_backoff_base
            )));
        }

        let e = &self.endpoints;
        if e.health_enabled && e.metrics_enabled && e.health_port == e.metrics_port {
            return Err(Error::ConfigError(format!(
                "HEALTH_PORT and METRICS_PORT must differ (both {})",
                e.health_port
            )));
        }
        Ok(())
    }

    /// Human-readable settings listing with the database password redacted
    pub fn summary(&self) -> String {
        let d = &self.database;
        let c = &self.cluster;
        let r = &self.reconcile;
        let e = &self.endpoints;
        let password = if d.password.as_deref().is_some_and(|p| !p.is_empty()) {
            "<redacted>"
        } else {
            "<unset>"
        };
        let kubeconfig = c
            .kubeconfig
            .as_ref()
            .map_or_else(|| "<default>".to_string(), |p| p.display().to_string());
        let types_file = self
            .resource_types_file
            .as_ref()
            .map_or_else(|| "<builtin only>".to_string(), |p| p.display().to_string());

        [
            format!("database:            {}@{}:{}/{} (sslmode {}, pool {})", d.user, d.host, d.port, d.name, d.ssl_mode, d.max_connections),
            format!("database password:   {password}"),
            format!("in-cluster:          {}", c.in_cluster),
            format!("kubeconfig:          {kubeconfig}"),
            format!("namespace prefix:    {}", c.namespace_prefix),
            format!("cluster domain:      {}", c.cluster_domain),
            format!("reconcile interval:  {:?}", r.reconcile_interval),
            format!("workers:             {}", r.worker_count),
            format!("retry backoff:       {:?}..{:?}, report after {} retries", r.retry_backoff_base, r.retry_backoff_max, r.max_retries),
            format!("watch retry delay:   {:?}", r.watch_retry_delay),
            format!("event buffer:        {}", r.event_buffer_size),
            format!("log:                 {} ({:?})", self.logging.log_level, self.logging.log_format),
            format!("health endpoint:     {} (port {})", e.health_enabled, e.health_port),
            format!("metrics endpoint:    {} (port {})", e.metrics_enabled, e.metrics_port),
            format!("resource types file: {types_file}"),
        ]
        .join("\n")
    }
}

impl DatabaseConfig {
    pub fn ssl_mode(&self) -> Result<PgSslMode> {
        PgSslMode::from_str(&self.ssl_mode)
            .map_err(|_| Error::ConfigError(format!("invalid DB_SSLMODE: {}", self.ssl_mode)))
    }
}

impl ClusterConfig {
    pub fn connection(&self) -> ClusterConnection {
        if self.in_cluster {
            ClusterConnection::InCluster
        } else {
            ClusterConnection::Kubeconfig(self.kubeconfig.clone())
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<Level> {
        Level::from_str(&self.log_level)
            .map_err(|_| Error::ConfigError(format!("invalid LOG_LEVEL: {}", self.log_level)))
    }
}

/// Parse a duration such as `30s`, `5m`, `1m 30s`, `250ms` or a bare number of seconds
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let s = input.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration '{input}': {e}"))
}
