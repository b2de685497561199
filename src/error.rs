//! Error types for framing, protocol and session operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The peer closed the stream before the expected byte count arrived.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("frame too large: {size} bytes (max: {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    /// A well-formed frame carried an `action` tag this side does not know.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// A complete frame that is not valid JSON or lacks a usable `action`.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("not connected")]
    NotConnected,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SyncError {
    /// True for errors that leave a JSON-only stream unusable. Decode
    /// failures happen after the whole frame was read, so such a stream
    /// stays aligned. Raw file bodies break that, see `ClientSession`.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SyncError::UnknownAction(_) | SyncError::InvalidMessage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
