//! HTTP client module for delivering event batches to the collector.
//!
//! This module provides an async HTTP client with connection pooling and
//! proper error handling. Each call is a single delivery attempt; retry
//! scheduling is owned by the dispatcher so there is never more than one
//! retry timer alive for the pipeline.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::config::Config;
use crate::event::{Event, EventsBody};

/// Upper bound on a teardown delivery, so an unload path cannot hang on a
/// dead network.
pub(crate) const UNLOAD_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur during HTTP client operations.
#[derive(Debug)]
pub enum ClientError {
    /// HTTP request failed
    Request(reqwest::Error),

    /// Server returned an error status code
    Status {
        code: StatusCode,
        message: String,
    },

    /// Request timeout
    Timeout,

    /// Client configuration error
    Config(String),
}

impl ClientError {
    /// Whether the collector refused the request for being too large.
    ///
    /// This is the signal to fall back to chunked delivery.
    pub fn is_payload_too_large(&self) -> bool {
        matches!(
            self,
            ClientError::Status { code, .. } if *code == StatusCode::PAYLOAD_TOO_LARGE
        )
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Request(e) => write!(f, "HTTP request failed: {}", e),
            ClientError::Status { code, message } => {
                write!(f, "Collector error ({}): {}", code, message)
            }
            ClientError::Timeout => write!(f, "Request timed out"),
            ClientError::Config(e) => write!(f, "Client configuration error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Request(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

/// HTTP client for posting event batches to the collector.
///
/// The client reuses connections via reqwest's internal pool and respects
/// the configured request timeout. Any 2xx response is a full acknowledgment
/// of the posted events; the response body is not inspected.
///
/// # Example
///
/// ```no_run
/// use telemetry_relay::client::CollectorClient;
/// use telemetry_relay::config::Config;
/// use telemetry_relay::event::{Event, EventDetails, EventType};
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::default();
///     let client = CollectorClient::new(&config).expect("Failed to create client");
///
///     let events = vec![Event::new(
///         EventType::PageView,
///         "session-1",
///         None,
///         "en",
///         EventDetails::new(),
///     )];
///
///     match client.post_events(&events).await {
///         Ok(()) => println!("Delivered {} events", events.len()),
///         Err(e) => eprintln!("Failed to deliver: {}", e),
///     }
/// }
/// ```
pub struct CollectorClient {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// URL for the analytics ingest endpoint
    events_url: String,

    /// Request timeout duration
    timeout: Duration,
}

impl CollectorClient {
    /// Create a new collector client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Self::with_settings(config.events_url.clone(), config.request_timeout)
    }

    /// Create a new collector client with custom settings.
    ///
    /// This is useful for testing or when you need more control over the client.
    pub fn with_settings(
        events_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            events_url: events_url.into(),
            timeout,
        })
    }

    /// Post a batch of events to the collector in a single attempt.
    ///
    /// The body is the `{"events": [...]}` envelope. Any 2xx status counts
    /// as a full acknowledgment; every other outcome is an error for the
    /// caller to handle.
    pub async fn post_events(&self, events: &[Event]) -> Result<(), ClientError> {
        debug!(
            events = events.len(),
            url = %self.events_url,
            "Posting event batch"
        );

        let response = self
            .client
            .post(&self.events_url)
            .timeout(self.timeout)
            .json(&EventsBody { events })
            .send()
            .await?;

        let status = response.status();

        if status.is_success() {
            debug!(events = events.len(), "Event batch acknowledged");
            Ok(())
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            Err(ClientError::Status {
                code: status,
                message,
            })
        }
    }

    /// Deliver events during teardown without keeping the caller alive.
    ///
    /// Inside a runtime the request is spawned and never awaited, matching
    /// beacon-style unload semantics. Outside a runtime a scratch
    /// current-thread runtime drives the request to completion, bounded by
    /// `UNLOAD_SEND_TIMEOUT`. Either way the outcome is ignored: the
    /// events stay pending and will be resent by the next session if this
    /// delivery is lost.
    pub fn send_unload(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }

        let client = self.client.clone();
        let url = self.events_url.clone();
        let count = events.len();

        let request = async move {
            let outcome = client
                .post(&url)
                .json(&EventsBody { events: &events })
                .send()
                .await;

            match outcome {
                Ok(response) if response.status().is_success() => {
                    debug!(events = count, "Unload delivery acknowledged");
                }
                Ok(response) => {
                    debug!(status = %response.status(), "Unload delivery rejected");
                }
                Err(e) => {
                    debug!(error = %e, "Unload delivery failed");
                }
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(request);
            }
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build();
                if let Ok(runtime) = runtime {
                    // timeout() must be constructed inside the runtime context,
                    // so build it lazily within the block_on future.
                    let _ = runtime.block_on(async {
                        tokio::time::timeout(UNLOAD_SEND_TIMEOUT, request).await
                    });
                }
            }
        }
    }

    /// Get the configured ingest URL.
    pub fn events_url(&self) -> &str {
        &self.events_url
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
