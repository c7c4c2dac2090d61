//! Event sink boundary
//!
//! The state machine hands each `StateChangeEvent` to an [`EventSink`]. The
//! production sink is a bounded channel in front of the publisher task, so
//! `emit` never waits on the network. A full or closed queue drops the event.

use crate::domain::error::SinkError;
use crate::domain::event::StateChangeEvent;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Receiver of seat-session boundary events
pub trait EventSink: Send {
    fn emit(&mut self, event: &StateChangeEvent) -> Result<(), SinkError>;
}

/// Non-blocking sink feeding the publisher task
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<StateChangeEvent>,
    site: String,
}

impl ChannelSink {
    /// Stamp events with the site id before queueing
    fn stamp(&self, event: &StateChangeEvent) -> StateChangeEvent {
        match event.site {
            Some(_) => event.clone(),
            None => event.clone().with_site(&self.site),
        }
    }
}

impl EventSink for ChannelSink {
    fn emit(&mut self, event: &StateChangeEvent) -> Result<(), SinkError> {
        self.tx.try_send(self.stamp(event)).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Unavailable("event queue full".to_string()),
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Create the event queue
///
/// Returns the sink (for the state machine) and the receiver (for the publisher)
pub fn create_event_channel(
    buffer_size: usize,
    site: String,
) -> (ChannelSink, mpsc::Receiver<StateChangeEvent>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (ChannelSink { tx, site }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Posture, SeatToken};

    #[test]
    fn test_emit_stamps_site() {
        let (mut sink, mut rx) = create_event_channel(4, "desk-7".to_string());
        let event = StateChangeEvent::new(SeatToken::Empty, Posture::Empty, None);

        sink.emit(&event).unwrap();
        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.site.as_deref(), Some("desk-7"));
        assert_eq!(queued.id, event.id);
    }

    #[test]
    fn test_full_queue_is_unavailable() {
        let (mut sink, _rx) = create_event_channel(1, "desk".to_string());
        let event = StateChangeEvent::new(SeatToken::Empty, Posture::Empty, None);

        sink.emit(&event).unwrap();
        assert!(matches!(sink.emit(&event), Err(SinkError::Unavailable(_))));
    }

    #[test]
    fn test_closed_queue() {
        let (mut sink, rx) = create_event_channel(1, "desk".to_string());
        drop(rx);
        let event = StateChangeEvent::new(SeatToken::Seated, Posture::Good, None);
        assert!(matches!(sink.emit(&event), Err(SinkError::Closed)));
    }
}
