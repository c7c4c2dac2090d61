//! Recoverable error taxonomy for the control loop
//!
//! None of these end the loop. A missing echo is not an error at all; it is
//! the `Reading::NoEcho` value.

use thiserror::Error;

/// Peer serial link failures
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("peer link unavailable: {0}")]
    Unavailable(String),
    #[error("peer link closed")]
    Closed,
}

/// Event sink failures
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event sink unavailable: {0}")]
    Unavailable(String),
    #[error("event sink closed")]
    Closed,
}
