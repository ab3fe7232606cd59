use thiserror::Error;
use tokio_tungstenite::tungstenite;

pub type Result<T, E = ClusterError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Core(#[from] ipm_core::Error),

    #[error("websocket error: {0}")]
    Axum(#[from] axum::Error),

    #[error("websocket error: {0}")]
    Tungstenite(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid handshake: {0}")]
    Handshake(String),

    /// Peer refused the connection with this HTTP status
    #[error("connection refused by {host} (HTTP {status})")]
    Refused { host: String, status: u16 },

    #[error("hub is not running")]
    HubClosed,
}
