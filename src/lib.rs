//! Telemetry Relay Library
//!
//! This library provides components for a client-resident usage telemetry
//! pipeline:
//!
//! - **config**: Environment-based configuration for the pipeline
//! - **event**: Event model, categories and reportability rules
//! - **store**: Durable event buffer backed by a single JSON document
//! - **client**: HTTP client for the analytics collector
//! - **scheduler**: Periodic flush triggering
//! - **monitor**: Connectivity tracking with flush-on-reconnect
//! - **dispatcher**: Batched delivery with chunking and retry
//! - **pipeline**: Host-facing facade tying the parts together
//!
//! # Example
//!
//! ```no_run
//! use telemetry_relay::config::Config;
//! use telemetry_relay::event::{EventDetails, EventType};
//! use telemetry_relay::pipeline::TelemetryPipeline;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Start the pipeline; delivery runs in a background task
//!     let pipeline = TelemetryPipeline::init(config).expect("Failed to start pipeline");
//!
//!     // Record host events as they happen
//!     let mut details = EventDetails::new();
//!     details.insert("page".to_string(), serde_json::json!("home"));
//!     pipeline.record(EventType::PageView, details);
//!
//!     // Deliver anything still pending before exit
//!     pipeline.dispose().await;
//! }
//! ```

// Module declarations
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod monitor;
pub mod pipeline;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testutil;

// Re-export commonly used types at crate root for convenience
pub use client::{ClientError, CollectorClient};
pub use config::{Config, ConfigError};
pub use dispatcher::FlushReason;
pub use event::{anonymize_user_id, Event, EventCategory, EventDetails, EventType};
pub use monitor::NetworkMonitor;
pub use pipeline::{PipelineStats, TelemetryPipeline};
pub use scheduler::FlushScheduler;
pub use store::{EventStore, StoreError};
