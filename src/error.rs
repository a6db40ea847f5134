use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed matrix topology or mismatched dimensions. Never retried.
    #[error("Structural error: {0}")]
    Structural(String),

    /// Device context, allocation or transfer failure. Fatal for the session.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Invalid solver parameters or an unknown/unavailable backend.
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
