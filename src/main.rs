//! Telemetry Relay - client-resident usage telemetry pipeline
//!
//! This binary drives the pipeline with simulated user activity: events are
//! recorded locally, buffered in a durable on-disk document and delivered in
//! batches to the analytics collector.
//!
//! ## Features
//!
//! - Durable buffering with crash recovery across restarts
//! - Size-based and time-based flush triggers
//! - Offline operation with automatic delivery on reconnect
//! - Graceful shutdown with a final bounded delivery attempt
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `TELEMETRY_RELAY_ENABLED`: Whether events are recorded (default: true)
//! - `TELEMETRY_RELAY_BACKEND_URL`: Collector URL (default: http://localhost:3000)
//! - `TELEMETRY_RELAY_STORAGE_PATH`: Buffer document location (default: per-OS data dir)
//! - `TELEMETRY_RELAY_BATCH_SIZE`: Events per delivery (default: 50)
//! - `TELEMETRY_RELAY_FLUSH_INTERVAL_SECS`: Seconds between scheduled flushes (default: 30)
//! - `TELEMETRY_RELAY_RETRY_DELAY_MS`: Delay before retrying a failed delivery (default: 5000)
//! - `TELEMETRY_RELAY_DEBUG`: Log delivery failures (default: false)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::time::Duration;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde_json::json;
use tokio::time::interval;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use telemetry_relay::config::Config;
use telemetry_relay::event::{anonymize_user_id, EventDetails, EventType};
use telemetry_relay::pipeline::TelemetryPipeline;

/// Interval between simulated user actions in milliseconds
const ACTIVITY_INTERVAL_MS: u64 = 250;

/// Interval between pipeline status reports in seconds
const STATUS_REPORT_INTERVAL_SECS: u64 = 10;

/// Event kinds the simulated session produces, with their relative weights.
const ACTIVITY_TYPES: [EventType; 6] = [
    EventType::PageView,
    EventType::UiInteraction,
    EventType::AppOpened,
    EventType::AppCreated,
    EventType::AppDeleted,
    EventType::Error,
];
const ACTIVITY_WEIGHTS: [u32; 6] = [40, 35, 12, 6, 4, 3];

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Telemetry Relay...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                backend_url = %config.backend_url,
                storage_path = %config.storage_path.display(),
                batch_size = config.batch_size,
                enabled = config.enabled,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };
    let enable_dashboard = config.enable_dashboard;

    // Start the pipeline; the delivery dispatcher runs in the background
    let pipeline = match TelemetryPipeline::init(config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(error = %e, "Failed to start telemetry pipeline");
            std::process::exit(1);
        }
    };

    // Stand in for a signed-in user; only the derived identifier is recorded
    pipeline.set_user(anonymize_user_id("demo-account"));

    let mut details = EventDetails::new();
    details.insert("app_version".to_string(), json!(env!("CARGO_PKG_VERSION")));
    pipeline.record(EventType::SessionStart, details);

    // Spawn status reporter - periodically logs pipeline counters
    let dashboard_handle = if enable_dashboard {
        let mut stats_rx = pipeline.subscribe_stats();
        Some(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(STATUS_REPORT_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                let stats = stats_rx.borrow_and_update().clone();
                info!(
                    recorded = stats.events_recorded,
                    delivered = stats.events_delivered,
                    pending = stats.pending_events,
                    failed_attempts = stats.failed_attempts,
                    retries = stats.retries_scheduled,
                    "Pipeline status"
                );
            }
        }))
    } else {
        None
    };

    // Simulate user activity until a shutdown signal arrives
    info!("Telemetry Relay running. Press Ctrl+C to stop.");
    tokio::select! {
        _ = run_activity(&pipeline) => {}
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    }

    if let Some(handle) = dashboard_handle {
        handle.abort();
    }

    // Close out the session and make a final delivery attempt
    pipeline.record(EventType::SessionEnd, EventDetails::new());
    pipeline.dispose().await;

    info!("Telemetry Relay stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Records simulated user activity at a steady rate until the task is
/// dropped at shutdown.
async fn run_activity(pipeline: &TelemetryPipeline) {
    let activity = WeightedIndex::new(&ACTIVITY_WEIGHTS).expect("Invalid weights");
    let mut ticker = interval(Duration::from_millis(ACTIVITY_INTERVAL_MS));
    let mut alternate_language = false;

    loop {
        ticker.tick().await;

        let (event_type, details) = synthesize_activity(&activity);
        pipeline.record(event_type, details);

        // The occasional language switch, like a user flipping the UI locale
        if rand::thread_rng().gen_ratio(1, 200) {
            alternate_language = !alternate_language;
            pipeline.set_language(if alternate_language { "de" } else { "en" });
        }
    }
}

/// Produces one plausible user action with event-specific details.
fn synthesize_activity(activity: &WeightedIndex<u32>) -> (EventType, EventDetails) {
    const PAGES: &[&str] = &["home", "editor", "gallery", "settings"];
    const CONTROLS: &[&str] = &["toolbar", "canvas", "palette", "menu"];

    let mut rng = rand::thread_rng();
    let event_type = ACTIVITY_TYPES[activity.sample(&mut rng)];

    let mut details = EventDetails::new();
    match event_type {
        EventType::PageView => {
            details.insert(
                "page".to_string(),
                json!(PAGES[rng.gen_range(0..PAGES.len())]),
            );
        }
        EventType::UiInteraction => {
            details.insert(
                "control".to_string(),
                json!(CONTROLS[rng.gen_range(0..CONTROLS.len())]),
            );
            details.insert("action".to_string(), json!("click"));
        }
        EventType::AppCreated | EventType::AppOpened | EventType::AppDeleted => {
            details.insert(
                "app_id".to_string(),
                json!(format!("app-{:04x}", rng.gen_range(0..0x1_0000))),
            );
        }
        EventType::Error => {
            details.insert("code".to_string(), json!("E_RENDER"));
            details.insert("message".to_string(), json!("Canvas render failed"));
        }
        _ => {}
    }

    (event_type, details)
}
