/// Result alias that carries the custom [`BeatSyncError`] type.
pub type Result<T> = std::result::Result<T, BeatSyncError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum BeatSyncError {
    /// A configuration value that can never produce a working session.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The audio backend refused an operation on the track instance.
    #[error("audio engine error: {0}")]
    Engine(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration files that fail to parse.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl BeatSyncError {
    pub fn engine<T: Into<String>>(msg: T) -> Self {
        Self::Engine(msg.into())
    }
}
