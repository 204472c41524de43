//! Error types for the funnel tracker
//!
//! Every fallible boundary (storage, HTTP, selector parsing, JSON) returns a
//! [`TrackerResult`]. Nothing is allowed to escape into the host: callers go
//! through [`degrade`], which logs the failure and yields `None`.

use thiserror::Error;
use tracing::warn;

/// Errors that can occur inside the tracker
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request to {url} returned status {status}")]
    HttpStatus { status: u16, url: String },

    #[error("Invalid selector '{selector}': {reason}")]
    Selector { selector: String, reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

/// Result type alias for tracker operations
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Log-and-degrade policy applied at every boundary the host can reach.
pub fn degrade<T>(result: TrackerResult<T>, context: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{} failed, continuing without it: {}", context, e);
            None
        }
    }
}
