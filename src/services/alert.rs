//! Local buzzer alert with a timed, non-blocking release
//!
//! `start` asserts the buzzers and arms a window; `tick` releases them once
//! the window has elapsed. Nothing here sleeps, so the control loop keeps
//! polling while an alert is sounding.

use crate::domain::types::Level;
use crate::io::gpio::OutputPin;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Alert window state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertWindow {
    Inactive,
    Active { started_at: Instant, duration: Duration },
}

pub struct AlertActuator {
    outputs: Vec<Box<dyn OutputPin>>,
    window: AlertWindow,
}

impl AlertActuator {
    pub fn new(outputs: Vec<Box<dyn OutputPin>>) -> Self {
        Self { outputs, window: AlertWindow::Inactive }
    }

    /// Assert the outputs and arm the window. Returns false if already active
    /// (the running window is not extended).
    pub fn start(&mut self, now: Instant, duration: Duration) -> bool {
        if self.is_active() {
            debug!("alert_already_active");
            return false;
        }
        self.drive(Level::High);
        self.window = AlertWindow::Active { started_at: now, duration };
        info!(duration_ms = %duration.as_millis(), buzzers = self.outputs.len(), "alert_started");
        true
    }

    /// Deassert the outputs and clear the window. Returns false if inactive.
    pub fn stop(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.drive(Level::Low);
        self.window = AlertWindow::Inactive;
        info!("alert_stopped");
        true
    }

    /// Release the alert once `now - started_at` exceeds the duration.
    /// Returns true only on the tick that released it.
    pub fn tick(&mut self, now: Instant) -> bool {
        match self.window {
            AlertWindow::Active { started_at, duration }
                if now.saturating_duration_since(started_at) > duration =>
            {
                info!("alert_expired");
                self.stop()
            }
            _ => false,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self.window, AlertWindow::Active { .. })
    }

    pub fn window(&self) -> AlertWindow {
        self.window
    }

    fn drive(&mut self, level: Level) {
        for pin in self.outputs.iter_mut() {
            if let Err(e) = pin.set(level) {
                warn!(pin = %pin.id(), level = level.is_high(), error = %e, "alert_pin_error");
            }
        }
    }
}

impl Drop for AlertActuator {
    fn drop(&mut self) {
        // Buzzers are never left sounding, even if the window was still armed
        self.drive(Level::Low);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::PinId;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;

    struct RecordingPin {
        id: PinId,
        level: Arc<Mutex<Level>>,
        writes: Arc<Mutex<usize>>,
    }

    impl OutputPin for RecordingPin {
        fn id(&self) -> PinId {
            self.id
        }

        fn set(&mut self, level: Level) -> io::Result<()> {
            *self.level.lock() = level;
            *self.writes.lock() += 1;
            Ok(())
        }
    }

    struct BrokenPin;

    impl OutputPin for BrokenPin {
        fn id(&self) -> PinId {
            PinId(99)
        }

        fn set(&mut self, _level: Level) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "no access"))
        }
    }

    fn actuator() -> (AlertActuator, Arc<Mutex<Level>>, Arc<Mutex<usize>>) {
        let level = Arc::new(Mutex::new(Level::Low));
        let writes = Arc::new(Mutex::new(0));
        let pin = RecordingPin { id: PinId(22), level: level.clone(), writes: writes.clone() };
        (AlertActuator::new(vec![Box::new(pin)]), level, writes)
    }

    #[test]
    fn test_timed_release_schedule() {
        let (mut alert, level, _) = actuator();
        let t0 = Instant::now();

        assert!(alert.start(t0, Duration::from_secs(3)));
        assert_eq!(*level.lock(), Level::High);

        assert!(!alert.tick(t0 + Duration::from_secs(1)));
        assert_eq!(*level.lock(), Level::High);
        assert!(!alert.tick(t0 + Duration::from_secs(2)));
        assert_eq!(*level.lock(), Level::High);

        assert!(alert.tick(t0 + Duration::from_secs(4)));
        assert_eq!(*level.lock(), Level::Low);
        assert!(!alert.is_active());
    }

    #[test]
    fn test_release_boundary_is_exclusive() {
        let (mut alert, _, _) = actuator();
        let t0 = Instant::now();
        let d = Duration::from_secs(3);

        alert.start(t0, d);
        assert!(!alert.tick(t0 + d));
        assert!(alert.tick(t0 + d + Duration::from_millis(1)));
    }

    #[test]
    fn test_expiry_fires_once() {
        let (mut alert, _, writes) = actuator();
        let t0 = Instant::now();

        alert.start(t0, Duration::from_millis(100));
        assert!(alert.tick(t0 + Duration::from_millis(150)));
        let after_release = *writes.lock();

        for ms in [200, 300, 10_000] {
            assert!(!alert.tick(t0 + Duration::from_millis(ms)));
        }
        assert_eq!(*writes.lock(), after_release);
    }

    #[test]
    fn test_start_does_not_extend_window() {
        let (mut alert, _, _) = actuator();
        let t0 = Instant::now();
        let d = Duration::from_secs(3);

        assert!(alert.start(t0, d));
        assert!(!alert.start(t0 + Duration::from_secs(2), d));
        assert_eq!(alert.window(), AlertWindow::Active { started_at: t0, duration: d });
        assert!(alert.tick(t0 + Duration::from_millis(3001)));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut alert, level, _) = actuator();
        assert!(!alert.stop());

        alert.start(Instant::now(), Duration::from_secs(3));
        assert!(alert.stop());
        assert!(!alert.stop());
        assert_eq!(*level.lock(), Level::Low);
    }

    #[test]
    fn test_pin_error_keeps_window_consistent() {
        let mut alert = AlertActuator::new(vec![Box::new(BrokenPin)]);
        assert!(alert.start(Instant::now(), Duration::from_secs(1)));
        assert!(alert.is_active());
        assert!(alert.stop());
        assert!(!alert.is_active());
    }

    #[test]
    fn test_drop_deasserts() {
        let (mut alert, level, _) = actuator();
        alert.start(Instant::now(), Duration::from_secs(60));
        drop(alert);
        assert_eq!(*level.lock(), Level::Low);
    }
}
