//! Seat-status / posture state machine
//!
//! State is the tuple (seat_status, posture, calibration, alert_active):
//! - `Seated` token: take one distance sample. The first sample of a session
//!   becomes the calibration; later samples more than the slouch threshold
//!   above it mean `Bad` (alert started, vibrate sent).
//! - `Empty` token: stop the alert, send stop-vibrate, clear calibration.
//! - A `NoEcho` reading skips the cycle entirely.
//!
//! Events are emitted only when the seat status changes, so the store sees
//! session boundaries and not every posture flip inside a session. The alert
//! is released by its timer alone; recovering posture does not cut it short.

use crate::domain::error::LinkError;
use crate::domain::event::StateChangeEvent;
use crate::domain::types::{DistanceSample, PeerCommand, Posture, Reading, SeatToken};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::event_sink::EventSink;
use crate::io::peer_link::PeerLink;
use crate::io::ultrasonic::DistanceSource;
use crate::services::alert::AlertActuator;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Point-in-time view of the machine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostureSnapshot {
    pub seat_status: SeatToken,
    pub posture: Posture,
    pub calibration: Option<DistanceSample>,
    pub alert_active: bool,
}

pub struct PostureStateMachine {
    sensor: Box<dyn DistanceSource>,
    link: Box<dyn PeerLink>,
    alert: AlertActuator,
    sink: Box<dyn EventSink>,
    threshold_cm: f64,
    alert_duration: Duration,
    /// Seat status of the last processed token, which is also the last
    /// status an event was emitted for
    seat_status: SeatToken,
    posture: Posture,
    calibration: Option<DistanceSample>,
    metrics: Option<Arc<Metrics>>,
}

impl PostureStateMachine {
    pub fn new(
        sensor: Box<dyn DistanceSource>,
        link: Box<dyn PeerLink>,
        alert: AlertActuator,
        sink: Box<dyn EventSink>,
        config: &Config,
    ) -> Self {
        Self {
            sensor,
            link,
            alert,
            sink,
            threshold_cm: config.slouch_threshold_cm(),
            alert_duration: config.alert_duration(),
            seat_status: SeatToken::Empty,
            posture: Posture::Empty,
            calibration: None,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// One control cycle: expire the alert, then process at most one token
    pub fn tick(&mut self, now: Instant) {
        if self.alert.tick(now) {
            if let Some(ref metrics) = self.metrics {
                metrics.record_alert_expired();
            }
            self.send(PeerCommand::StopVibrate);
        }

        if let Some(token) = self.link.poll() {
            self.handle_token(token, now);
        }

        self.publish_state();
    }

    /// Apply one seat token
    pub fn handle_token(&mut self, token: SeatToken, now: Instant) {
        if let Some(ref metrics) = self.metrics {
            match token {
                SeatToken::Seated => metrics.record_seated_token(),
                SeatToken::Empty => metrics.record_empty_token(),
            }
        }

        match token {
            SeatToken::Seated => self.on_seated(now),
            SeatToken::Empty => self.on_empty(),
        }
    }

    fn on_seated(&mut self, now: Instant) {
        let sample = match self.sensor.measure() {
            Reading::Distance(sample) => sample,
            Reading::NoEcho => {
                debug!("seated_cycle_skipped_no_echo");
                return;
            }
        };

        match self.calibration {
            None => {
                self.calibration = Some(sample);
                self.posture = Posture::Good;
                info!(calibration_cm = %sample, "calibration_set");
            }
            Some(calibration) => {
                let diff = sample.cm() - calibration.cm();
                if diff > self.threshold_cm {
                    self.posture = Posture::Bad;
                    debug!(
                        distance_cm = %sample,
                        calibration_cm = %calibration,
                        diff_cm = format!("{:.2}", diff),
                        "posture_bad"
                    );
                    if self.alert.start(now, self.alert_duration) {
                        if let Some(ref metrics) = self.metrics {
                            metrics.record_alert_started();
                        }
                    }
                    self.send(PeerCommand::Vibrate);
                } else {
                    self.posture = Posture::Good;
                }
            }
        }

        self.enter(SeatToken::Seated);
    }

    fn on_empty(&mut self) {
        self.alert.stop();
        self.send(PeerCommand::StopVibrate);
        self.posture = Posture::Empty;
        if self.calibration.take().is_some() {
            debug!("calibration_cleared");
        }
        self.enter(SeatToken::Empty);
    }

    /// Record the seat status, emitting an event when it changed
    fn enter(&mut self, seat_status: SeatToken) {
        if self.seat_status == seat_status {
            return;
        }
        self.seat_status = seat_status;

        let event = StateChangeEvent::new(seat_status, self.posture, self.calibration);
        info!(
            seat_status = seat_status.as_str(),
            posture = self.posture.as_str(),
            distance_cm = %event.distance,
            "seat_status_changed"
        );

        // At-most-once: a failed emit is not retried on a later cycle
        match self.sink.emit(&event) {
            Ok(()) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.record_event_emitted();
                }
            }
            Err(e) => {
                warn!(id = %event.id, error = %e, "event_sink_unavailable");
                if let Some(ref metrics) = self.metrics {
                    metrics.record_event_dropped();
                }
            }
        }
    }

    /// Best-effort command to the seat module
    fn send(&mut self, command: PeerCommand) {
        match self.link.send(command) {
            Ok(()) => {
                if let Some(ref metrics) = self.metrics {
                    match command {
                        PeerCommand::Vibrate => metrics.record_vibrate_cmd(),
                        PeerCommand::StopVibrate => metrics.record_stop_cmd(),
                    }
                }
            }
            Err(e) => {
                warn!(
                    command = command.as_str(),
                    closed = matches!(e, LinkError::Closed),
                    error = %e,
                    "peer_link_unavailable"
                );
                if let Some(ref metrics) = self.metrics {
                    metrics.record_peer_error();
                }
            }
        }
    }

    fn publish_state(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics.set_state(
                self.posture.gauge(),
                self.alert.is_active(),
                self.calibration.map(|c| c.cm()),
            );
        }
    }

    pub fn snapshot(&self) -> PostureSnapshot {
        PostureSnapshot {
            seat_status: self.seat_status,
            posture: self.posture,
            calibration: self.calibration,
            alert_active: self.alert.is_active(),
        }
    }

    /// Deassert every actuator and release the peer link
    pub fn shutdown(&mut self) {
        let was_active = self.alert.stop();
        self.send(PeerCommand::StopVibrate);
        self.link.close();
        self.publish_state();
        info!(alert_was_active = was_active, "posture_machine_shutdown");
    }
}
