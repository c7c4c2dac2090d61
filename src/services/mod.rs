//! Services - control logic and state management
//!
//! This module contains the core control services:
//! - `alert` - Local buzzer alert with timed release
//! - `posture` - Seat-status / posture state machine
//! - `controller` - Fixed-period control loop with shutdown cleanup

pub mod alert;
pub mod controller;
pub mod posture;

// Re-export commonly used types
pub use alert::{AlertActuator, AlertWindow};
pub use controller::Controller;
pub use posture::{PostureSnapshot, PostureStateMachine};
