//! BackBeacon - headrest posture controller
//!
//! Measures head distance with an ultrasonic rangefinder, follows seat
//! occupancy reported by the seat module over serial, sounds the headrest
//! buzzer (and the seat's vibration motor) on slouching, and reports seat
//! session changes to a remote store.
//!
//! Module structure:
//! - `domain/` - Core types (distances, tokens, posture, events)
//! - `io/` - External interfaces (GPIO, rangefinder, serial peer, event delivery)
//! - `services/` - Control logic (alert, posture state machine, control loop)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use backbeacon::infra::{Config, Metrics};
use backbeacon::io::gpio::OutputPin;
use backbeacon::io::{
    build_backend, create_event_channel, open_serial_link, EventPublisher, MonotonicClock,
    RangeSensor, SysfsGpio,
};
use backbeacon::services::{AlertActuator, Controller, PostureStateMachine};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// BackBeacon - headrest posture controller
#[derive(Parser, Debug)]
#[command(name = "backbeacon", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Structured logging, level via RUST_LOG (default INFO)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "backbeacon starting");

    let args = Args::parse();
    let config_path = Config::resolve_config_path(args.config);
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        trigger_pin = %config.trigger_pin(),
        echo_pin = %config.echo_pin(),
        buzzer_pins = ?config.buzzer_pins(),
        echo_timeout_ms = %config.echo_timeout().as_millis(),
        slouch_threshold_cm = %config.slouch_threshold_cm(),
        alert_duration_ms = %config.alert_duration().as_millis(),
        poll_interval_ms = %config.poll_interval().as_millis(),
        serial_device = %config.serial_device(),
        sink = config.sink_kind().as_str(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Pins
    let gpio = SysfsGpio::new(config.gpio_root());
    let trigger = gpio.output(config.trigger_pin())?;
    let echo = gpio.input(config.echo_pin())?;
    let mut buzzers: Vec<Box<dyn OutputPin>> = Vec::with_capacity(config.buzzer_pins().len());
    for &pin in config.buzzer_pins() {
        buzzers.push(Box::new(gpio.output(pin)?));
    }

    let sensor =
        RangeSensor::new(Box::new(trigger), Box::new(echo), Box::new(MonotonicClock), &config)
            .with_metrics(metrics.clone());
    let alert = AlertActuator::new(buzzers);

    // Seat module link
    let (link, link_tasks) = open_serial_link(&config, metrics.clone(), shutdown_rx.clone())?;

    // Event delivery
    let (sink, event_rx) =
        create_event_channel(config.sink_queue_size(), config.site_id().to_string());
    let backend = build_backend(&config).context("Failed to create event backend")?;
    let publisher = EventPublisher::new(event_rx, backend, metrics.clone());
    // Stopped only after the controller, so a cycle finishing during shutdown still delivers
    let (publisher_stop_tx, publisher_stop_rx) = watch::channel(false);
    let publisher_handle = tokio::spawn(publisher.run(publisher_stop_rx));

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = backbeacon::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "prometheus_metrics_server_error");
            }
        });
    }

    // Periodic metrics summary
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    let mut metrics_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => metrics_clone.report().log(),
                _ = metrics_shutdown.changed() => {
                    if *metrics_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let machine = PostureStateMachine::new(
        Box::new(sensor),
        Box::new(link),
        alert,
        Box::new(sink),
        &config,
    )
    .with_metrics(metrics.clone());

    // Runs until shutdown; buzzers are released and the link closed on return
    Controller::new(machine, config.poll_interval(), metrics.clone()).run(shutdown_rx).await;

    // Let the writer flush the final stop command, then drain queued events
    link_tasks.join().await;
    let _ = publisher_stop_tx.send(true);
    if let Err(e) = publisher_handle.await {
        tracing::warn!(error = %e, "event_publisher_join_failed");
    }

    metrics.report().log();
    info!("backbeacon shutdown complete");
    Ok(())
}
