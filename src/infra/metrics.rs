//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations so the control loop never waits on
//! a reporter. Reporting is the only operation that resets anything (via
//! atomic swap). Scrapes go through `snapshot()`, which only loads, and read
//! lifetime histograms so the periodic log and the scraper never steal each
//! other's data.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters
//! only; do NOT use them for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a duration value using binary search
#[inline]
fn bucket_index(value_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < value_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

#[inline]
fn average(sum: u64, buckets: &[u64; NUM_BUCKETS]) -> u64 {
    let count: u64 = buckets.iter().sum();
    if count > 0 {
        sum / count
    } else {
        0
    }
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps periodic counters to get a snapshot.
pub struct Metrics {
    /// Control loop ticks (monotonic)
    ticks_total: AtomicU64,
    /// Tick processing latency histogram (reset on report)
    tick_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Max tick latency (reset on report)
    tick_latency_max_us: AtomicU64,
    /// Sum of tick latencies (reset on report)
    tick_latency_sum_us: AtomicU64,
    /// Tick latency histogram since start (never reset)
    tick_latency_lifetime_buckets: [AtomicU64; NUM_BUCKETS],
    tick_latency_lifetime_sum_us: AtomicU64,
    /// SEATED tokens received (monotonic)
    seated_tokens_total: AtomicU64,
    /// EMPTY tokens received (monotonic)
    empty_tokens_total: AtomicU64,
    /// Unrecognized lines from the seat module (monotonic)
    ignored_tokens_total: AtomicU64,
    /// Tokens dropped because the token queue was full (monotonic)
    tokens_dropped_total: AtomicU64,
    /// Valid distance samples (monotonic)
    samples_total: AtomicU64,
    /// Measurements without an echo (monotonic)
    no_echo_total: AtomicU64,
    /// Echo high-time histogram in µs (reset on report)
    echo_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of echo high-times (reset on report)
    echo_sum_us: AtomicU64,
    /// Echo high-time histogram since start (never reset)
    echo_lifetime_buckets: [AtomicU64; NUM_BUCKETS],
    echo_lifetime_sum_us: AtomicU64,
    /// Alerts started (monotonic)
    alerts_started_total: AtomicU64,
    /// Alerts released by timed expiry (monotonic)
    alerts_expired_total: AtomicU64,
    /// Vibrate commands queued to the seat module (monotonic)
    vibrate_cmds_total: AtomicU64,
    /// Stop-vibrate commands queued to the seat module (monotonic)
    stop_cmds_total: AtomicU64,
    /// Peer link write/enqueue failures (monotonic)
    peer_errors_total: AtomicU64,
    /// State-change events accepted by the sink (monotonic)
    events_emitted_total: AtomicU64,
    /// State-change events dropped by the sink or its backend (monotonic)
    events_dropped_total: AtomicU64,
    /// Current posture (0=empty, 1=good, 2=bad)
    posture: AtomicU64,
    /// Alert output asserted (0/1)
    alert_active: AtomicU64,
    /// Calibration distance in hundredths of a cm (0 when unset)
    calibration_centi_cm: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks_total: AtomicU64::new(0),
            tick_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            tick_latency_max_us: AtomicU64::new(0),
            tick_latency_sum_us: AtomicU64::new(0),
            tick_latency_lifetime_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            tick_latency_lifetime_sum_us: AtomicU64::new(0),
            seated_tokens_total: AtomicU64::new(0),
            empty_tokens_total: AtomicU64::new(0),
            ignored_tokens_total: AtomicU64::new(0),
            tokens_dropped_total: AtomicU64::new(0),
            samples_total: AtomicU64::new(0),
            no_echo_total: AtomicU64::new(0),
            echo_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            echo_sum_us: AtomicU64::new(0),
            echo_lifetime_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            echo_lifetime_sum_us: AtomicU64::new(0),
            alerts_started_total: AtomicU64::new(0),
            alerts_expired_total: AtomicU64::new(0),
            vibrate_cmds_total: AtomicU64::new(0),
            stop_cmds_total: AtomicU64::new(0),
            peer_errors_total: AtomicU64::new(0),
            events_emitted_total: AtomicU64::new(0),
            events_dropped_total: AtomicU64::new(0),
            posture: AtomicU64::new(0),
            alert_active: AtomicU64::new(0),
            calibration_centi_cm: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record one control loop tick and its processing latency
    #[inline]
    pub fn record_tick(&self, latency_us: u64) {
        let bucket = bucket_index(latency_us);
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
        self.tick_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.tick_latency_lifetime_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.tick_latency_max_us, latency_us);
        self.tick_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.tick_latency_lifetime_sum_us.fetch_add(latency_us, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_seated_token(&self) {
        self.seated_tokens_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_empty_token(&self) {
        self.empty_tokens_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ignored_token(&self) {
        self.ignored_tokens_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_token_dropped(&self) {
        self.tokens_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a valid sample with its echo high-time
    #[inline]
    pub fn record_sample(&self, echo_us: u64) {
        let bucket = bucket_index(echo_us);
        self.samples_total.fetch_add(1, Ordering::Relaxed);
        self.echo_sum_us.fetch_add(echo_us, Ordering::Relaxed);
        self.echo_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.echo_lifetime_sum_us.fetch_add(echo_us, Ordering::Relaxed);
        self.echo_lifetime_buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_no_echo(&self) {
        self.no_echo_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_started(&self) {
        self.alerts_started_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_expired(&self) {
        self.alerts_expired_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_vibrate_cmd(&self) {
        self.vibrate_cmds_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stop_cmd(&self) {
        self.stop_cmds_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_peer_error(&self) {
        self.peer_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_emitted(&self) {
        self.events_emitted_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_dropped(&self) {
        self.events_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish the current state tuple as gauges
    #[inline]
    pub fn set_state(&self, posture: u64, alert_active: bool, calibration_cm: Option<f64>) {
        self.posture.store(posture, Ordering::Relaxed);
        self.alert_active.store(alert_active as u64, Ordering::Relaxed);
        let centi = calibration_cm.map(|cm| (cm * 100.0).round().max(0.0) as u64).unwrap_or(0);
        self.calibration_centi_cm.store(centi, Ordering::Relaxed);
    }

    #[inline]
    pub fn ticks_total(&self) -> u64 {
        self.ticks_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn no_echo_total(&self) -> u64 {
        self.no_echo_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn events_dropped_total(&self) -> u64 {
        self.events_dropped_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn peer_errors_total(&self) -> u64 {
        self.peer_errors_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let tick_buckets = swap_buckets(&self.tick_latency_buckets);
        let tick_max_us = self.tick_latency_max_us.swap(0, Ordering::Relaxed);
        let tick_sum = self.tick_latency_sum_us.swap(0, Ordering::Relaxed);
        let echo_buckets = swap_buckets(&self.echo_buckets);
        let echo_sum = self.echo_sum_us.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        MetricsSummary {
            ticks_per_sec: per_sec(tick_buckets.iter().sum(), elapsed),
            tick_lat_buckets: tick_buckets,
            tick_lat_max_us: tick_max_us,
            tick_lat_sum_us: tick_sum,
            tick_lat_avg_us: average(tick_sum, &tick_buckets),
            tick_lat_p99_us: percentile_from_buckets(&tick_buckets, 0.99),
            echo_buckets,
            echo_sum_us: echo_sum,
            echo_avg_us: average(echo_sum, &echo_buckets),
            echo_p50_us: percentile_from_buckets(&echo_buckets, 0.50),
            ..self.totals()
        }
    }

    /// Read everything without resetting
    ///
    /// Histograms (buckets and sums) cover the whole process lifetime, as
    /// Prometheus expects. Rate, max and percentiles describe the current
    /// reporting period so far.
    pub fn snapshot(&self) -> MetricsSummary {
        let period_ticks = load_buckets(&self.tick_latency_buckets);
        let period_echo = load_buckets(&self.echo_buckets);
        let tick_buckets = load_buckets(&self.tick_latency_lifetime_buckets);
        let tick_sum = self.tick_latency_lifetime_sum_us.load(Ordering::Relaxed);
        let echo_buckets = load_buckets(&self.echo_lifetime_buckets);
        let echo_sum = self.echo_lifetime_sum_us.load(Ordering::Relaxed);
        let elapsed = self.last_report_time.lock().elapsed();

        MetricsSummary {
            ticks_per_sec: per_sec(period_ticks.iter().sum(), elapsed),
            tick_lat_buckets: tick_buckets,
            tick_lat_max_us: self.tick_latency_max_us.load(Ordering::Relaxed),
            tick_lat_sum_us: tick_sum,
            tick_lat_avg_us: average(tick_sum, &tick_buckets),
            tick_lat_p99_us: percentile_from_buckets(&period_ticks, 0.99),
            echo_buckets,
            echo_sum_us: echo_sum,
            echo_avg_us: average(echo_sum, &echo_buckets),
            echo_p50_us: percentile_from_buckets(&period_echo, 0.50),
            ..self.totals()
        }
    }

    /// Monotonic counters and gauges; histogram fields left empty
    fn totals(&self) -> MetricsSummary {
        MetricsSummary {
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            ticks_per_sec: 0.0,
            tick_lat_buckets: [0; NUM_BUCKETS],
            tick_lat_max_us: 0,
            tick_lat_sum_us: 0,
            tick_lat_avg_us: 0,
            tick_lat_p99_us: 0,
            seated_tokens_total: self.seated_tokens_total.load(Ordering::Relaxed),
            empty_tokens_total: self.empty_tokens_total.load(Ordering::Relaxed),
            ignored_tokens_total: self.ignored_tokens_total.load(Ordering::Relaxed),
            tokens_dropped_total: self.tokens_dropped_total.load(Ordering::Relaxed),
            samples_total: self.samples_total.load(Ordering::Relaxed),
            no_echo_total: self.no_echo_total.load(Ordering::Relaxed),
            echo_buckets: [0; NUM_BUCKETS],
            echo_sum_us: 0,
            echo_avg_us: 0,
            echo_p50_us: 0,
            alerts_started_total: self.alerts_started_total.load(Ordering::Relaxed),
            alerts_expired_total: self.alerts_expired_total.load(Ordering::Relaxed),
            vibrate_cmds_total: self.vibrate_cmds_total.load(Ordering::Relaxed),
            stop_cmds_total: self.stop_cmds_total.load(Ordering::Relaxed),
            peer_errors_total: self.peer_errors_total.load(Ordering::Relaxed),
            events_emitted_total: self.events_emitted_total.load(Ordering::Relaxed),
            events_dropped_total: self.events_dropped_total.load(Ordering::Relaxed),
            posture: self.posture.load(Ordering::Relaxed),
            alert_active: self.alert_active.load(Ordering::Relaxed) == 1,
            calibration_cm: self.calibration_centi_cm.load(Ordering::Relaxed) as f64 / 100.0,
        }
    }
}

fn per_sec(count: u64, elapsed: std::time::Duration) -> f64 {
    if elapsed.as_secs_f64() > 0.0 {
        count as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub ticks_total: u64,
    pub ticks_per_sec: f64,
    /// Tick latency histogram buckets (µs)
    pub tick_lat_buckets: [u64; NUM_BUCKETS],
    pub tick_lat_max_us: u64,
    pub tick_lat_sum_us: u64,
    pub tick_lat_avg_us: u64,
    pub tick_lat_p99_us: u64,
    pub seated_tokens_total: u64,
    pub empty_tokens_total: u64,
    pub ignored_tokens_total: u64,
    pub tokens_dropped_total: u64,
    pub samples_total: u64,
    pub no_echo_total: u64,
    /// Echo high-time histogram buckets (µs)
    pub echo_buckets: [u64; NUM_BUCKETS],
    pub echo_sum_us: u64,
    pub echo_avg_us: u64,
    pub echo_p50_us: u64,
    pub alerts_started_total: u64,
    pub alerts_expired_total: u64,
    pub vibrate_cmds_total: u64,
    pub stop_cmds_total: u64,
    pub peer_errors_total: u64,
    pub events_emitted_total: u64,
    pub events_dropped_total: u64,
    /// Current posture (0=empty, 1=good, 2=bad)
    pub posture: u64,
    pub alert_active: bool,
    pub calibration_cm: f64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            ticks_total = %self.ticks_total,
            ticks_per_sec = format!("{:.1}", self.ticks_per_sec),
            tick_max_us = %self.tick_lat_max_us,
            tick_p99_us = %self.tick_lat_p99_us,
            samples = %self.samples_total,
            no_echo = %self.no_echo_total,
            echo_avg_us = %self.echo_avg_us,
            alerts = %self.alerts_started_total,
            peer_errors = %self.peer_errors_total,
            events = %self.events_emitted_total,
            events_dropped = %self.events_dropped_total,
            posture = %self.posture,
            calibration_cm = format!("{:.2}", self.calibration_cm),
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.ticks_total(), 0);
        assert_eq!(metrics.no_echo_total(), 0);
    }

    #[test]
    fn test_record_tick() {
        let metrics = Metrics::new();

        metrics.record_tick(100);
        metrics.record_tick(500);
        metrics.record_tick(50);
        assert_eq!(metrics.ticks_total(), 3);
        assert_eq!(metrics.tick_latency_max_us.load(Ordering::Relaxed), 500);
    }

    #[test]
    fn test_report_resets_periodic_counters() {
        let metrics = Metrics::new();

        metrics.record_tick(100);
        metrics.record_sample(1000);
        metrics.record_sample(3000);
        metrics.record_no_echo();

        let summary = metrics.report();
        assert_eq!(summary.ticks_total, 1);
        assert_eq!(summary.samples_total, 2);
        assert_eq!(summary.no_echo_total, 1);
        assert_eq!(summary.echo_avg_us, 2000);
        assert_eq!(summary.tick_lat_max_us, 100);

        // Periodic counters reset, monotonic counters kept
        assert_eq!(metrics.tick_latency_max_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.echo_sum_us.load(Ordering::Relaxed), 0);
        let summary = metrics.report();
        assert_eq!(summary.samples_total, 2);
        assert_eq!(summary.echo_avg_us, 0);
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let metrics = Metrics::new();

        metrics.record_tick(150);
        metrics.record_sample(1000);

        let scraped = metrics.snapshot();
        assert_eq!(scraped.tick_lat_buckets.iter().sum::<u64>(), 1);
        assert_eq!(scraped.echo_sum_us, 1000);

        // A scrape leaves the period intact for the periodic log
        let summary = metrics.report();
        assert_eq!(summary.tick_lat_max_us, 150);
        assert_eq!(summary.echo_avg_us, 1000);

        // Lifetime histograms survive the report
        metrics.record_sample(3000);
        let scraped = metrics.snapshot();
        assert_eq!(scraped.echo_buckets.iter().sum::<u64>(), 2);
        assert_eq!(scraped.echo_sum_us, 4000);
        assert_eq!(scraped.tick_lat_sum_us, 150);
        assert_eq!(scraped.tick_lat_max_us, 0);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();

        // 1.75ms echo = ~30cm, lands in the ≤3200µs bucket
        for _ in 0..100 {
            metrics.record_sample(1750);
        }

        let summary = metrics.report();
        assert_eq!(summary.echo_p50_us, 3200);
    }

    #[test]
    fn test_state_gauges() {
        let metrics = Metrics::new();

        metrics.set_state(2, true, Some(30.456));
        let summary = metrics.report();
        assert_eq!(summary.posture, 2);
        assert!(summary.alert_active);
        assert!((summary.calibration_cm - 30.46).abs() < 1e-9);

        metrics.set_state(0, false, None);
        let summary = metrics.report();
        assert_eq!(summary.calibration_cm, 0.0);
        assert!(!summary.alert_active);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_tick(i as u64);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.ticks_total(), 10_000);
    }
}
