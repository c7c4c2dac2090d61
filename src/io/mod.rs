//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `gpio` - Digital pin and clock traits, Linux sysfs backend
//! - `ultrasonic` - Trigger/echo rangefinder driver
//! - `peer_link` - Line-oriented serial link to the seat module
//! - `event_sink` - Non-blocking hand-off of state-change events
//! - `publisher` - Delivery of queued events to the remote store
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod event_sink;
pub mod gpio;
pub mod peer_link;
pub mod prometheus;
pub mod publisher;
pub mod ultrasonic;

// Re-export commonly used types
pub use event_sink::{create_event_channel, ChannelSink, EventSink};
pub use gpio::{Clock, InputPin, MonotonicClock, OutputPin, SysfsGpio};
pub use peer_link::{open_serial_link, PeerLink, PeerLinkTasks, SerialPeerLink};
pub use publisher::{build_backend, EventBackend, EventPublisher};
pub use ultrasonic::{DistanceSource, RangeSensor};
