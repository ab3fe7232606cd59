use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures shared by the registry, the rule engine and the cluster layer
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input; never touches the firewall
    #[error("{0}")]
    InvalidArgument(String),

    /// Chain, rule set or peer identity already present
    #[error("{0}")]
    Conflict(String),

    /// Chain or rule set missing
    #[error("{0}")]
    NotFound(String),

    /// The iptables invocation did not succeed
    #[error("{0}")]
    ExternalCommandFailed(String),

    /// Persisted state cannot be trusted
    #[error("{0}")]
    Storage(String),

    #[error("{}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::ExternalCommandFailed(msg.into())
    }

    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    /// True for errors caused by the caller's input rather than by the host
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::Conflict(_) | Self::NotFound(_)
        )
    }
}
