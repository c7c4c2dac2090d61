//! Fixed-period control loop
//!
//! Ticks the posture machine every `poll_interval` until the shutdown watch
//! flips, then runs the machine's cleanup before returning. A measurement can
//! spin for up to twice the echo timeout, so the tick runs on the blocking
//! pool instead of stalling a runtime worker.

use crate::infra::metrics::Metrics;
use crate::services::posture::PostureStateMachine;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// Warn when one cycle takes longer than this share of the period
const SLOW_TICK_PCT: u128 = 80;

pub struct Controller {
    machine: Option<PostureStateMachine>,
    poll_interval: Duration,
    metrics: Arc<Metrics>,
}

impl Controller {
    pub fn new(
        machine: PostureStateMachine,
        poll_interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { machine: Some(machine), poll_interval, metrics }
    }

    /// Run until shutdown. Buzzers are released and the peer link closed
    /// before this returns, however the loop ended.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_interval_ms = %self.poll_interval.as_millis(), "controller_started");

        let mut timer = interval(self.poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("controller_shutdown");
                        break;
                    }
                }
                _ = timer.tick() => {
                    if !self.step().await {
                        break;
                    }
                }
            }
        }

        if let Some(mut machine) = self.machine.take() {
            machine.shutdown();
        }
        info!(ticks_total = %self.metrics.ticks_total(), "controller_stopped");
    }

    /// One cycle on the blocking pool. Returns false if the machine was lost.
    async fn step(&mut self) -> bool {
        let Some(mut machine) = self.machine.take() else {
            return false;
        };

        let result = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            machine.tick(started);
            (machine, started.elapsed())
        })
        .await;

        match result {
            Ok((machine, elapsed)) => {
                self.machine = Some(machine);
                self.metrics.record_tick(elapsed.as_micros() as u64);
                if elapsed.as_millis() * 100 > self.poll_interval.as_millis() * SLOW_TICK_PCT {
                    warn!(
                        elapsed_ms = %elapsed.as_millis(),
                        poll_interval_ms = %self.poll_interval.as_millis(),
                        "controller_slow_tick"
                    );
                }
                true
            }
            Err(e) => {
                // The machine (and its buzzer handles) dropped with the task;
                // AlertActuator deasserts its outputs on drop.
                error!(error = %e, "controller_tick_panicked");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::{LinkError, SinkError};
    use crate::domain::event::StateChangeEvent;
    use crate::domain::types::{DistanceSample, Level, PeerCommand, PinId, Reading, SeatToken};
    use crate::infra::config::Config;
    use crate::io::event_sink::EventSink;
    use crate::io::gpio::OutputPin;
    use crate::io::peer_link::PeerLink;
    use crate::io::ultrasonic::DistanceSource;
    use crate::services::alert::AlertActuator;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;

    struct FixedSensor(f64);

    impl DistanceSource for FixedSensor {
        fn measure(&mut self) -> Reading {
            DistanceSample::from_cm(self.0).map(Reading::Distance).unwrap_or(Reading::NoEcho)
        }
    }

    struct QueueLink {
        inbound: VecDeque<SeatToken>,
        sent: Arc<Mutex<Vec<PeerCommand>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl PeerLink for QueueLink {
        fn poll(&mut self) -> Option<SeatToken> {
            self.inbound.pop_front()
        }

        fn send(&mut self, command: PeerCommand) -> Result<(), LinkError> {
            self.sent.lock().push(command);
            Ok(())
        }

        fn close(&mut self) {
            *self.closed.lock() = true;
        }
    }

    struct CountingSink(Arc<Mutex<usize>>);

    impl EventSink for CountingSink {
        fn emit(&mut self, _event: &StateChangeEvent) -> Result<(), SinkError> {
            *self.0.lock() += 1;
            Ok(())
        }
    }

    struct Buzzer(Arc<Mutex<Level>>);

    impl OutputPin for Buzzer {
        fn id(&self) -> PinId {
            PinId(22)
        }

        fn set(&mut self, level: Level) -> io::Result<()> {
            *self.0.lock() = level;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_ticks_and_cleans_up() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let emitted = Arc::new(Mutex::new(0));
        let buzzer = Arc::new(Mutex::new(Level::Low));
        let metrics = Arc::new(Metrics::new());

        let link = QueueLink {
            inbound: VecDeque::from(vec![SeatToken::Seated]),
            sent: sent.clone(),
            closed: closed.clone(),
        };
        let machine = PostureStateMachine::new(
            Box::new(FixedSensor(30.0)),
            Box::new(link),
            AlertActuator::new(vec![Box::new(Buzzer(buzzer.clone()))]),
            Box::new(CountingSink(emitted.clone())),
            &Config::default(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = Controller::new(machine, Duration::from_millis(5), metrics.clone());
        let handle = tokio::spawn(controller.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(metrics.ticks_total() >= 2);
        assert_eq!(*emitted.lock(), 1);
        assert!(*closed.lock());
        assert_eq!(*buzzer.lock(), Level::Low);
        assert_eq!(sent.lock().last(), Some(&PeerCommand::StopVibrate));
    }
}
