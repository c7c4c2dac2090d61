//! Prometheus metrics HTTP endpoint
//!
//! Exposes controller metrics in Prometheus text format at /metrics and a
//! liveness probe at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

fn write_gauge_f64(output: &mut String, name: &str, help: &str, site: &str, val: f64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val:.2}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_loop_metrics(&mut output, site_id, &summary);
    write_sensor_metrics(&mut output, site_id, &summary);
    write_peer_metrics(&mut output, site_id, &summary);
    write_event_metrics(&mut output, site_id, &summary);
    write_state_metrics(&mut output, site_id, &summary);

    output
}

fn write_loop_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "backbeacon_ticks_total",
        "Control loop cycles run",
        MetricType::Counter,
        site,
        summary.ticks_total,
    );
    write_gauge_f64(
        output,
        "backbeacon_ticks_per_sec",
        "Control loop cycles per second",
        site,
        summary.ticks_per_sec,
    );
    write_histogram(
        output,
        "backbeacon_tick_latency_us",
        "Control loop cycle duration in microseconds",
        site,
        &summary.tick_lat_buckets,
        summary.tick_lat_sum_us,
    );
    write_metric(
        output,
        "backbeacon_tick_latency_p99_us",
        "99th percentile control loop cycle duration",
        MetricType::Gauge,
        site,
        summary.tick_lat_p99_us,
    );
    write_metric(
        output,
        "backbeacon_tick_latency_max_us",
        "Longest control loop cycle in the period",
        MetricType::Gauge,
        site,
        summary.tick_lat_max_us,
    );
}

fn write_sensor_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "backbeacon_samples_total",
        "Distance samples taken",
        MetricType::Counter,
        site,
        summary.samples_total,
    );
    write_metric(
        output,
        "backbeacon_no_echo_total",
        "Measurements that timed out or failed",
        MetricType::Counter,
        site,
        summary.no_echo_total,
    );
    write_histogram(
        output,
        "backbeacon_echo_us",
        "Echo high-time in microseconds",
        site,
        &summary.echo_buckets,
        summary.echo_sum_us,
    );
}

fn write_peer_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "backbeacon_seated_tokens_total",
        "SEATED tokens received from the seat peer",
        MetricType::Counter,
        site,
        summary.seated_tokens_total,
    );
    write_metric(
        output,
        "backbeacon_empty_tokens_total",
        "EMPTY tokens received from the seat peer",
        MetricType::Counter,
        site,
        summary.empty_tokens_total,
    );
    write_metric(
        output,
        "backbeacon_ignored_tokens_total",
        "Unrecognized lines from the seat peer",
        MetricType::Counter,
        site,
        summary.ignored_tokens_total,
    );
    write_metric(
        output,
        "backbeacon_tokens_dropped_total",
        "Tokens dropped because the inbound queue was full",
        MetricType::Counter,
        site,
        summary.tokens_dropped_total,
    );
    write_metric(
        output,
        "backbeacon_vibrate_cmds_total",
        "Vibrate commands sent to the seat peer",
        MetricType::Counter,
        site,
        summary.vibrate_cmds_total,
    );
    write_metric(
        output,
        "backbeacon_stop_cmds_total",
        "Stop-vibrate commands sent to the seat peer",
        MetricType::Counter,
        site,
        summary.stop_cmds_total,
    );
    write_metric(
        output,
        "backbeacon_peer_errors_total",
        "Commands the peer link could not take",
        MetricType::Counter,
        site,
        summary.peer_errors_total,
    );
}

fn write_event_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "backbeacon_alerts_started_total",
        "Local alerts started",
        MetricType::Counter,
        site,
        summary.alerts_started_total,
    );
    write_metric(
        output,
        "backbeacon_alerts_expired_total",
        "Local alerts ended by timeout",
        MetricType::Counter,
        site,
        summary.alerts_expired_total,
    );
    write_metric(
        output,
        "backbeacon_events_emitted_total",
        "State-change events handed to the sink",
        MetricType::Counter,
        site,
        summary.events_emitted_total,
    );
    write_metric(
        output,
        "backbeacon_events_dropped_total",
        "State-change events lost before reaching the store",
        MetricType::Counter,
        site,
        summary.events_dropped_total,
    );
}

fn write_state_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "backbeacon_posture",
        "Current posture (0=empty, 1=good, 2=bad)",
        MetricType::Gauge,
        site,
        summary.posture,
    );
    write_metric(
        output,
        "backbeacon_alert_active",
        "Local alert output asserted",
        MetricType::Gauge,
        site,
        u64::from(summary.alert_active),
    );
    write_gauge_f64(
        output,
        "backbeacon_calibration_cm",
        "Calibrated upright distance (0 when unset)",
        site,
        summary.calibration_cm,
    );
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &site_id),
        ),
        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain", "ok".to_string()),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_tick(150);
        metrics.record_tick(250);
        metrics.record_seated_token();
        metrics.record_vibrate_cmd();
        metrics.set_state(2, true, Some(30.0));

        let output = format_prometheus_metrics(&metrics, "desk-7");

        assert!(output.contains("backbeacon_ticks_total{site=\"desk-7\"} 2"));
        assert!(output.contains("backbeacon_tick_latency_us_bucket{site=\"desk-7\""));
        assert!(output.contains("backbeacon_tick_latency_us_count{site=\"desk-7\"} 2"));
        assert!(output.contains("backbeacon_seated_tokens_total{site=\"desk-7\"} 1"));
        assert!(output.contains("backbeacon_vibrate_cmds_total{site=\"desk-7\"} 1"));
        assert!(output.contains("backbeacon_posture{site=\"desk-7\"} 2"));
        assert!(output.contains("backbeacon_alert_active{site=\"desk-7\"} 1"));
        assert!(output.contains("backbeacon_calibration_cm{site=\"desk-7\"} 30.00"));
        assert!(output.contains("backbeacon_tick_latency_us_sum{site=\"desk-7\"} 400"));
    }

    #[test]
    fn test_scrape_keeps_periodic_report() {
        let metrics = Metrics::new();
        metrics.record_tick(900);
        metrics.record_sample(1750);

        let first = format_prometheus_metrics(&metrics, "desk-7");
        let second = format_prometheus_metrics(&metrics, "desk-7");
        assert!(first.contains("backbeacon_echo_us_count{site=\"desk-7\"} 1"));
        assert!(second.contains("backbeacon_echo_us_count{site=\"desk-7\"} 1"));
        assert!(second.contains("backbeacon_tick_latency_max_us{site=\"desk-7\"} 900"));

        let summary = metrics.report();
        assert_eq!(summary.tick_lat_max_us, 900);
        assert_eq!(summary.echo_avg_us, 1750);
    }

    #[test]
    fn test_histogram_is_cumulative() {
        let mut buckets = [0u64; METRICS_NUM_BUCKETS];
        buckets[0] = 2;
        buckets[METRICS_NUM_BUCKETS - 1] = 1;

        let mut output = String::new();
        write_histogram(&mut output, "x", "help", "s", &buckets, 30);

        assert!(output.contains("x_bucket{site=\"s\",le=\"+Inf\"} 3"));
        assert!(output.contains("x_count{site=\"s\"} 3"));
        assert!(output.contains("x_sum{site=\"s\"} 30"));
    }
}
