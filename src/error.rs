//! Error types for the provisioning controller

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API call failed
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Query against the desired-state database failed
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No image/port mapping registered for the resource type
    #[error("unsupported resource type: {0}")]
    UnsupportedResourceType(String),

    /// The resource's free-form config could not be interpreted
    #[error("invalid resource config: {0}")]
    InvalidResourceConfig(String),

    /// A database row held a value this controller does not understand
    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// A watch stream reported an error event
    #[error("Watch error: {0}")]
    WatchError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Cluster-side failure that did not originate from the kube client
    #[error("Cluster error: {0}")]
    ClusterError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// True for "object does not exist" responses from the cluster
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            Error::NotFound(_) => true,
            _ => false,
        }
    }

    /// True for "object already exists" responses from the cluster
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Whether retrying the same operation can succeed without a change in
    /// desired state or code.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Error::UnsupportedResourceType(_)
                | Error::InvalidResourceConfig(_)
                | Error::DecodeError(_)
                | Error::ConfigError(_)
        )
    }

    /// Short category used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::DatabaseError(_) => "database",
            Error::ConfigError(_) => "config",
            Error::UnsupportedResourceType(_) => "unsupported_type",
            Error::InvalidResourceConfig(_) => "invalid_config",
            Error::DecodeError(_) => "decode",
            Error::SerializationError(_) | Error::YamlError(_) => "serialization",
            Error::WatchError(_) => "watch",
            Error::NotFound(_) => "not_found",
            Error::ClusterError(_) => "cluster",
        }
    }
}
