//! HC-SR04 style ultrasonic rangefinder
//!
//! Protocol:
//! - Trigger: drive high for ~10µs, then low
//! - Echo: goes high when the burst is sent, low when the reflection returns
//! - A line still high from an earlier echo must drop before a rise counts
//! - Distance: echo high-time × 34300 cm/s / 2
//!
//! Both edge waits are bounded; a missing edge yields `Reading::NoEcho`
//! instead of stalling the control loop.

use crate::domain::types::{DistanceSample, Level, Reading};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::gpio::{Clock, InputPin, OutputPin};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Anything that yields one distance reading per call
pub trait DistanceSource: Send {
    fn measure(&mut self) -> Reading;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EchoEdge {
    Rise,
    Fall,
}

impl EchoEdge {
    fn as_str(&self) -> &'static str {
        match self {
            EchoEdge::Rise => "rise",
            EchoEdge::Fall => "fall",
        }
    }
}

pub struct RangeSensor {
    trigger: Box<dyn OutputPin>,
    echo: Box<dyn InputPin>,
    clock: Box<dyn Clock>,
    pulse: Duration,
    settle: Duration,
    timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl RangeSensor {
    pub fn new(
        trigger: Box<dyn OutputPin>,
        echo: Box<dyn InputPin>,
        clock: Box<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self {
            trigger,
            echo,
            clock,
            pulse: config.trigger_pulse(),
            settle: config.settle_time(),
            timeout: config.echo_timeout(),
            metrics: None,
        }
    }

    /// Attach metrics for sample/no-echo counters
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Emit the trigger pulse, returns the time the pulse ended
    fn fire(&mut self) -> io::Result<Instant> {
        if !self.settle.is_zero() {
            self.trigger.set(Level::Low)?;
            std::thread::sleep(self.settle);
        }
        self.trigger.set(Level::High)?;
        std::thread::sleep(self.pulse);
        self.trigger.set(Level::Low)?;
        Ok(self.clock.now())
    }

    /// Spin until the echo line goes low then high, or the deadline passes
    fn wait_for_rise(&mut self, deadline: Instant) -> io::Result<Option<Instant>> {
        let mut armed = false;
        loop {
            let level = self.echo.read()?;
            let now = self.clock.now();
            match level {
                Level::Low => armed = true,
                Level::High if armed => return Ok(Some(now)),
                Level::High => {}
            }
            if now > deadline {
                return Ok(None);
            }
            std::hint::spin_loop();
        }
    }

    /// Spin until the echo line reaches `target`, or the deadline passes
    fn wait_for(&mut self, target: Level, deadline: Instant) -> io::Result<Option<Instant>> {
        loop {
            let level = self.echo.read()?;
            let now = self.clock.now();
            if level == target {
                return Ok(Some(now));
            }
            if now > deadline {
                return Ok(None);
            }
            std::hint::spin_loop();
        }
    }

    fn try_measure(&mut self) -> io::Result<Result<Duration, EchoEdge>> {
        let fired_at = self.fire()?;

        let Some(t_start) = self.wait_for_rise(fired_at + self.timeout)? else {
            return Ok(Err(EchoEdge::Rise));
        };
        let Some(t_stop) = self.wait_for(Level::Low, t_start + self.timeout)? else {
            return Ok(Err(EchoEdge::Fall));
        };

        Ok(Ok(t_stop.saturating_duration_since(t_start)))
    }

    fn no_echo(&self) -> Reading {
        if let Some(ref metrics) = self.metrics {
            metrics.record_no_echo();
        }
        Reading::NoEcho
    }
}

impl DistanceSource for RangeSensor {
    fn measure(&mut self) -> Reading {
        match self.try_measure() {
            Ok(Ok(high_time)) => match DistanceSample::from_echo_secs(high_time.as_secs_f64()) {
                Some(sample) => {
                    let echo_us = high_time.as_micros() as u64;
                    trace!(distance_cm = %sample, echo_us = %echo_us, "range_sample");
                    if let Some(ref metrics) = self.metrics {
                        metrics.record_sample(echo_us);
                    }
                    Reading::Distance(sample)
                }
                None => self.no_echo(),
            },
            Ok(Err(edge)) => {
                debug!(
                    edge = edge.as_str(),
                    timeout_ms = %self.timeout.as_millis(),
                    "range_no_echo"
                );
                self.no_echo()
            }
            Err(e) => {
                warn!(
                    trigger = %self.trigger.id(),
                    echo = %self.echo.id(),
                    error = %e,
                    "range_pin_error"
                );
                // Leave the trigger low for the next attempt
                let _ = self.trigger.set(Level::Low);
                self.no_echo()
            }
        }
    }
}
