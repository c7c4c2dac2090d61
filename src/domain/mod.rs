//! Domain models - core types shared by sensing, control, and egress
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - distances, seat tokens, posture, pin identifiers
//! - `event` - `StateChangeEvent`, the record handed to event sinks
//! - `error` - recoverable link and sink errors

pub mod error;
pub mod event;
pub mod types;

// Re-export commonly used types at module level
pub use error::{LinkError, SinkError};
pub use event::StateChangeEvent;
pub use types::{DistanceSample, Level, PeerCommand, PinId, Posture, Reading, SeatToken};
