use thiserror::Error;

/// Result type for QRC operations
pub type Result<T> = std::result::Result<T, QrcError>;

/// Errors that can occur when talking to a Q-SYS core
#[derive(Error, Debug)]
pub enum QrcError {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Operation attempted with no open session
    #[error("Not connected to a core")]
    NotConnected,

    /// Connection was closed while a request was outstanding
    #[error("Connection closed")]
    ConnectionClosed,

    /// Request timed out waiting for response
    #[error("Request timeout")]
    Timeout,

    /// Core returned a JSON-RPC error object
    #[error("Core error {code}: {message}")]
    Remote {
        /// Numeric error code from the core
        code: i64,
        /// Error message from the core
        message: String,
    },

    /// Write attempted on a control that is not read/write
    #[error("Control is read-only: {0}")]
    ReadOnly(String),

    /// Core address could not be turned into a QRC URL
    #[error("Invalid core address: {0}")]
    InvalidAddress(String),

    /// Named component does not exist in the running design
    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or unexpected response from the core
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Channel receive error
    #[error("Channel error: {0}")]
    Channel(String),
}
