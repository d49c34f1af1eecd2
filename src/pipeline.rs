//! Pipeline facade: the host-facing surface of the telemetry relay.
//!
//! A [`TelemetryPipeline`] owns every moving part: the durable buffer, the
//! flush scheduler, the connectivity monitor and the background delivery
//! dispatcher. Hosts record events and the pipeline takes care of batching,
//! persistence, retries and shutdown flushing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{ClientError, CollectorClient, UNLOAD_SEND_TIMEOUT};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, FlushReason};
use crate::event::{Event, EventDetails, EventType};
use crate::monitor::NetworkMonitor;
use crate::scheduler::FlushScheduler;
use crate::store::EventStore;

/// How long `dispose` waits for the delivery dispatcher to finish its
/// current attempt before giving up on a clean stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters describing what the pipeline has done since startup.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Events accepted by the recorder
    pub events_recorded: u64,
    /// Events refused by the recorder
    pub events_rejected: u64,
    /// Events acknowledged by the collector
    pub events_delivered: u64,
    /// Delivery attempts started
    pub flush_attempts: u64,
    /// Delivery attempts that failed
    pub failed_attempts: u64,
    /// Flushes that went out in chunks
    pub chunked_flushes: u64,
    /// Retry timers armed after failures
    pub retries_scheduled: u64,
    /// Events currently awaiting delivery
    pub pending_events: usize,
}

/// Shared publisher for pipeline counters, observable through a watch
/// channel so dashboards see updates without polling.
pub(crate) struct StatsPublisher {
    tx: watch::Sender<PipelineStats>,
}

impl StatsPublisher {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(PipelineStats::default());
        Self { tx }
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut PipelineStats)) {
        self.tx.send_modify(f);
    }

    pub(crate) fn snapshot(&self) -> PipelineStats {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<PipelineStats> {
        self.tx.subscribe()
    }
}

/// Ambient attributes stamped onto every recorded event.
#[derive(Debug, Clone)]
struct RecorderContext {
    user_id: Option<String>,
    language: String,
}

impl Default for RecorderContext {
    fn default() -> Self {
        Self {
            user_id: None,
            language: "en".to_string(),
        }
    }
}

/// Client-side telemetry pipeline with durable buffering and batched
/// delivery.
///
/// # Example
///
/// ```no_run
/// use telemetry_relay::config::Config;
/// use telemetry_relay::event::{EventDetails, EventType};
/// use telemetry_relay::pipeline::TelemetryPipeline;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pipeline = TelemetryPipeline::init(Config::from_env()?)?;
///
/// let mut details = EventDetails::new();
/// details.insert("page".to_string(), serde_json::json!("home"));
/// pipeline.record(EventType::PageView, details);
///
/// pipeline.dispose().await;
/// # Ok(())
/// # }
/// ```
pub struct TelemetryPipeline {
    config: Config,
    session_id: String,
    context: Mutex<RecorderContext>,
    store: Arc<Mutex<EventStore>>,
    client: Arc<CollectorClient>,
    monitor: NetworkMonitor,
    stats: Arc<StatsPublisher>,
    flush_tx: mpsc::Sender<FlushReason>,
    scheduler: FlushScheduler,
    dispatcher_handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TelemetryPipeline {
    /// Starts the pipeline: recovers the persisted buffer, begins the flush
    /// schedule and spawns the delivery dispatcher on the current Tokio
    /// runtime. Must be called from within a runtime.
    ///
    /// When telemetry is disabled the pipeline comes up inert: the buffer
    /// document is not read, no tasks are spawned and recording is a no-op.
    ///
    /// Fails only when the HTTP client cannot be constructed.
    pub fn init(config: Config) -> Result<Self, ClientError> {
        let session_id = Uuid::new_v4().to_string();
        let client = Arc::new(CollectorClient::new(&config)?);

        let (flush_tx, flush_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = NetworkMonitor::new(flush_tx.clone());
        let stats = Arc::new(StatsPublisher::new());

        let store = if config.enabled {
            EventStore::open(
                &config.storage_path,
                session_id.as_str(),
                config.max_local_events,
                config.debug_mode,
            )
        } else {
            EventStore::new(
                &config.storage_path,
                session_id.as_str(),
                config.max_local_events,
                config.debug_mode,
            )
        };
        let recovered = store.pending_len();
        let store = Arc::new(Mutex::new(store));
        stats.update(|s| s.pending_events = recovered);

        let mut scheduler = FlushScheduler::new(config.flush_interval);
        let mut dispatcher_handle = None;

        if config.enabled {
            scheduler.start(flush_tx.clone());
            let dispatcher = Dispatcher::new(
                config.clone(),
                store.clone(),
                client.clone(),
                monitor.clone(),
                stats.clone(),
                flush_tx.clone(),
            );
            dispatcher_handle = Some(tokio::spawn(dispatcher.run(flush_rx, shutdown_rx)));

            info!(
                session_id = %session_id,
                backend = %config.backend_url,
                batch_size = config.batch_size,
                flush_interval_secs = config.flush_interval.as_secs(),
                max_retries = config.max_retries,
                recovered_events = recovered,
                "Telemetry pipeline started"
            );
        } else {
            info!("Telemetry disabled, events will not be recorded");
        }

        Ok(Self {
            config,
            session_id,
            context: Mutex::new(RecorderContext::default()),
            store,
            client,
            monitor,
            stats,
            flush_tx,
            scheduler,
            dispatcher_handle,
            shutdown_tx,
        })
    }

    /// Records one event: stamps it with the session, user and language
    /// context, persists it and triggers a flush once the pending queue
    /// reaches the batch size.
    ///
    /// Recording never fails from the caller's point of view; persistence
    /// problems are logged and the event stays in memory.
    pub fn record(&self, event_type: EventType, details: EventDetails) {
        if !self.config.enabled {
            return;
        }
        if !event_type.is_reportable() {
            if self.config.debug_mode {
                warn!(event_type = %event_type, "Refusing to record non-reportable event");
            }
            self.stats.update(|s| s.events_rejected += 1);
            return;
        }

        let context = self
            .context
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();
        let event = Event::new(
            event_type,
            self.session_id.clone(),
            context.user_id,
            context.language,
            details,
        );

        let (save_result, pending_len) = match self.store.lock() {
            Ok(mut store) => {
                store.append(event);
                (store.save(), store.pending_len())
            }
            Err(_) => return,
        };
        if let Err(e) = save_result {
            if self.config.debug_mode {
                warn!(error = %e, "Failed to persist buffer after recording");
            }
        }

        self.stats.update(|s| {
            s.events_recorded += 1;
            s.pending_events = pending_len;
        });

        if pending_len >= self.config.batch_size {
            // A full channel means a flush is already queued and the new
            // events ride along with it.
            let _ = self.flush_tx.try_send(FlushReason::Threshold);
        }
    }

    /// Attaches a user identifier to subsequently recorded events.
    ///
    /// Callers pass an already anonymized identifier, typically from
    /// [`crate::event::anonymize_user_id`]; raw account identifiers must
    /// never reach the pipeline.
    pub fn set_user(&self, user_id: impl Into<String>) {
        if let Ok(mut context) = self.context.lock() {
            context.user_id = Some(user_id.into());
        }
    }

    /// Detaches the user identifier; later events record as signed-out.
    pub fn clear_user(&self) {
        if let Ok(mut context) = self.context.lock() {
            context.user_id = None;
        }
    }

    /// Switches the interface language and records the transition. Setting
    /// the language already in effect does nothing.
    pub fn set_language(&self, language: impl Into<String>) {
        let language = language.into();
        let previous = match self.context.lock() {
            Ok(mut context) => {
                if context.language == language {
                    return;
                }
                std::mem::replace(&mut context.language, language.clone())
            }
            Err(_) => return,
        };

        let mut details = EventDetails::new();
        details.insert("from".to_string(), json!(previous));
        details.insert("to".to_string(), json!(language));
        self.record(EventType::LanguageChanged, details);
    }

    /// Requests an immediate flush of the pending queue.
    ///
    /// Delivery happens on the dispatcher; if a flush is already queued the
    /// request coalesces into it.
    pub fn flush(&self) {
        if !self.config.enabled {
            return;
        }
        let _ = self.flush_tx.try_send(FlushReason::Requested);
    }

    /// Discards all buffered events and erases the durable document.
    ///
    /// Works even when telemetry is disabled so hosts can honor a data
    /// deletion request unconditionally.
    pub fn clear(&self) {
        let cleared = match self.store.lock() {
            Ok(mut store) => store.clear(),
            Err(_) => return,
        };
        if let Err(e) = cleared {
            if self.config.debug_mode {
                warn!(error = %e, "Failed to erase buffer document");
            }
        }
        self.stats.update(|s| s.pending_events = 0);
        info!("Telemetry buffer cleared");
    }

    /// Identifier of this process-lifetime session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether recording is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Current counter snapshot.
    pub fn stats(&self) -> PipelineStats {
        self.stats.snapshot()
    }

    /// Watch channel that sees every counter update.
    pub fn subscribe_stats(&self) -> watch::Receiver<PipelineStats> {
        self.stats.subscribe()
    }

    /// Handle for reporting connectivity changes, for hosts that wire the
    /// pipeline to a platform network watcher.
    pub fn network(&self) -> NetworkMonitor {
        self.monitor.clone()
    }

    /// Reports a connectivity change; reconnecting triggers a flush.
    pub fn set_online(&self, online: bool) {
        self.monitor.set_online(online);
    }

    /// Last reported connectivity state.
    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Recent events retained for local inspection, oldest first.
    pub fn history(&self) -> Vec<Event> {
        self.store
            .lock()
            .map(|store| store.history().to_vec())
            .unwrap_or_default()
    }

    /// Number of events awaiting delivery.
    pub fn pending_len(&self) -> usize {
        self.store
            .lock()
            .map(|store| store.pending_len())
            .unwrap_or_default()
    }

    /// Stops the pipeline and makes a final bounded delivery attempt.
    ///
    /// Anything still pending afterwards stays in the buffer document and is
    /// recovered by the next session, so shutdown can never lose events,
    /// only deliver them twice.
    pub async fn dispose(mut self) {
        self.scheduler.stop();
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.dispatcher_handle.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!("Delivery dispatcher stopped cleanly"),
                Ok(Err(e)) => warn!(error = %e, "Delivery dispatcher task failed"),
                Err(_) => warn!("Timed out waiting for delivery dispatcher to stop"),
            }
        }

        let pending = self
            .store
            .lock()
            .map(|store| store.snapshot_pending())
            .unwrap_or_default();
        if !pending.is_empty() {
            info!(events = pending.len(), "Delivering remaining events before shutdown");
            match tokio::time::timeout(UNLOAD_SEND_TIMEOUT, self.client.post_events(&pending)).await
            {
                Ok(Ok(())) => debug!("Final delivery acknowledged"),
                Ok(Err(e)) => {
                    if self.config.debug_mode {
                        warn!(error = %e, "Final delivery failed, events remain buffered");
                    }
                }
                Err(_) => {
                    if self.config.debug_mode {
                        warn!("Final delivery timed out, events remain buffered");
                    }
                }
            }
        }

        info!(session_id = %self.session_id, "Telemetry pipeline stopped");
    }

    /// Synchronous teardown for hosts without an async context, e.g. a
    /// panic hook or a foreign runtime. The dispatcher is aborted rather
    /// than joined and the final delivery uses the unload-safe send.
    pub fn dispose_blocking(mut self) {
        self.scheduler.stop();
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.dispatcher_handle.take() {
            handle.abort();
        }

        let pending = self
            .store
            .lock()
            .map(|store| store.snapshot_pending())
            .unwrap_or_default();
        if !pending.is_empty() {
            info!(events = pending.len(), "Delivering remaining events before shutdown");
            self.client.send_unload(pending);
        }

        info!(session_id = %self.session_id, "Telemetry pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::anonymize_user_id;
    use crate::testutil::{test_config, wait_until, MockCollector, MockResponse};
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;
    use tokio::time::{sleep, timeout};

    fn page_view(n: usize) -> EventDetails {
        let mut details = EventDetails::new();
        details.insert("n".to_string(), json!(n));
        details
    }

    #[tokio::test]
    async fn test_batch_threshold_triggers_delivery() {
        let mock = MockCollector::start(Vec::new()).await;
        let dir = tempdir().unwrap();
        let mut config = test_config(&mock.backend_url(), dir.path().join("events.json"));
        config.batch_size = 10;

        let pipeline = TelemetryPipeline::init(config).unwrap();
        for n in 0..9 {
            pipeline.record(EventType::PageView, page_view(n));
        }

        sleep(Duration::from_millis(100)).await;
        assert_eq!(mock.request_count(), 0, "flushed before the threshold");
        assert_eq!(pipeline.pending_len(), 9);

        pipeline.record(EventType::PageView, page_view(9));
        timeout(Duration::from_secs(2), mock.wait_for_requests(1))
            .await
            .expect("threshold flush never arrived");

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].events.len(), 10);
        for (n, event) in requests[0].events.iter().enumerate() {
            assert_eq!(event.details["n"], json!(n));
            assert_eq!(event.session_id, pipeline.session_id());
        }

        timeout(Duration::from_secs(2), wait_until(|| pipeline.pending_len() == 0))
            .await
            .expect("pending queue never drained");

        let stats = pipeline.stats();
        assert_eq!(stats.events_recorded, 10);
        assert_eq!(stats.events_delivered, 10);
        assert_eq!(stats.flush_attempts, 1);
        assert_eq!(stats.pending_events, 0);
    }

    #[tokio::test]
    async fn test_failed_delivery_retries_and_succeeds() {
        let mock = MockCollector::start(vec![MockResponse::Status(500)]).await;
        let dir = tempdir().unwrap();
        let mut config = test_config(&mock.backend_url(), dir.path().join("events.json"));
        config.batch_size = 2;

        let pipeline = TelemetryPipeline::init(config).unwrap();
        pipeline.record(EventType::PageView, page_view(0));
        pipeline.record(EventType::PageView, page_view(1));

        // First attempt fails, the armed retry succeeds.
        timeout(Duration::from_secs(3), mock.wait_for_requests(2))
            .await
            .expect("retry never arrived");
        let requests = mock.requests();
        assert_eq!(requests[0].events.len(), 2);
        assert_eq!(requests[1].events.len(), 2);

        timeout(Duration::from_secs(2), wait_until(|| pipeline.pending_len() == 0))
            .await
            .expect("pending queue never drained");

        let stats = pipeline.stats();
        assert_eq!(stats.failed_attempts, 1);
        assert_eq!(stats.retries_scheduled, 1);
        assert_eq!(stats.events_delivered, 2);
    }

    #[tokio::test]
    async fn test_offline_defers_delivery_until_reconnect() {
        let mock = MockCollector::start(Vec::new()).await;
        let dir = tempdir().unwrap();
        let mut config = test_config(&mock.backend_url(), dir.path().join("events.json"));
        config.batch_size = 2;

        let pipeline = TelemetryPipeline::init(config).unwrap();
        pipeline.set_online(false);

        for n in 0..3 {
            pipeline.record(EventType::PageView, page_view(n));
        }
        sleep(Duration::from_millis(100)).await;
        assert_eq!(mock.request_count(), 0, "delivered while offline");
        assert_eq!(pipeline.pending_len(), 3);

        pipeline.set_online(true);
        timeout(Duration::from_secs(2), mock.wait_for_requests(1))
            .await
            .expect("reconnect flush never arrived");

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].events.len(), 3);
        timeout(Duration::from_secs(2), wait_until(|| pipeline.pending_len() == 0))
            .await
            .expect("pending queue never drained");
    }

    #[tokio::test]
    async fn test_pending_events_survive_restart_and_resend() {
        let dir = tempdir().unwrap();
        let storage = dir.path().join("events.json");

        // First session records against an unreachable collector.
        let mut config = test_config("http://127.0.0.1:1", storage.clone());
        config.batch_size = 2;
        let first = TelemetryPipeline::init(config).unwrap();
        let first_session = first.session_id().to_string();

        first.record(EventType::PageView, page_view(0));
        first.record(EventType::PageView, page_view(1));
        timeout(
            Duration::from_secs(2),
            wait_until(|| first.stats().failed_attempts >= 1),
        )
        .await
        .expect("delivery never failed");
        first.dispose().await;

        // Second session recovers the buffer but does not flush on its own.
        let mock = MockCollector::start(Vec::new()).await;
        let second =
            TelemetryPipeline::init(test_config(&mock.backend_url(), storage.clone())).unwrap();
        assert_ne!(second.session_id(), first_session);
        assert_eq!(second.pending_len(), 2);
        assert_eq!(second.stats().pending_events, 2);

        sleep(Duration::from_millis(150)).await;
        assert_eq!(mock.request_count(), 0, "flushed without a trigger");

        second.flush();
        timeout(Duration::from_secs(2), mock.wait_for_requests(1))
            .await
            .expect("requested flush never arrived");

        // Recovered events still carry the session that recorded them.
        let requests = mock.requests();
        assert_eq!(requests[0].events.len(), 2);
        for event in &requests[0].events {
            assert_eq!(event.session_id, first_session);
        }
        timeout(Duration::from_secs(2), wait_until(|| second.pending_len() == 0))
            .await
            .expect("pending queue never drained");
    }

    #[tokio::test]
    async fn test_delivery_failure_events_are_rejected() {
        let dir = tempdir().unwrap();
        let storage = dir.path().join("events.json");
        let pipeline =
            TelemetryPipeline::init(test_config("http://127.0.0.1:1", storage.clone())).unwrap();

        pipeline.record(EventType::DeliveryFailure, EventDetails::new());

        assert_eq!(pipeline.pending_len(), 0);
        assert_eq!(pipeline.stats().events_rejected, 1);
        assert_eq!(pipeline.stats().events_recorded, 0);
        assert!(!storage.exists(), "rejected event reached the buffer");
    }

    #[tokio::test]
    async fn test_disabled_pipeline_touches_nothing() {
        let dir = tempdir().unwrap();
        let storage = dir.path().join("events.json");

        // A document left behind by an earlier, enabled session.
        let mut seeded = EventStore::new(&storage, "old-session", 100, false);
        seeded.append(crate::testutil::sample_event(0));
        seeded.save().unwrap();
        let before = fs::read_to_string(&storage).unwrap();

        let mut config = test_config("http://127.0.0.1:1", storage.clone());
        config.enabled = false;
        let pipeline = TelemetryPipeline::init(config).unwrap();

        assert!(!pipeline.is_enabled());
        assert_eq!(pipeline.pending_len(), 0, "disabled pipeline read the buffer");

        pipeline.record(EventType::PageView, page_view(0));
        pipeline.flush();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(pipeline.stats().events_recorded, 0);
        assert_eq!(fs::read_to_string(&storage).unwrap(), before);

        pipeline.dispose().await;
        assert_eq!(fs::read_to_string(&storage).unwrap(), before);
    }

    #[tokio::test]
    async fn test_language_change_records_single_transition() {
        let dir = tempdir().unwrap();
        let pipeline = TelemetryPipeline::init(test_config(
            "http://127.0.0.1:1",
            dir.path().join("events.json"),
        ))
        .unwrap();

        pipeline.set_language("de");
        pipeline.set_language("de");

        let history = pipeline.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, EventType::LanguageChanged);
        assert_eq!(history[0].language, "de");
        assert_eq!(history[0].details["from"], json!("en"));
        assert_eq!(history[0].details["to"], json!("de"));
    }

    #[tokio::test]
    async fn test_user_identity_is_attached_and_cleared() {
        let dir = tempdir().unwrap();
        let pipeline = TelemetryPipeline::init(test_config(
            "http://127.0.0.1:1",
            dir.path().join("events.json"),
        ))
        .unwrap();

        let anonymized = anonymize_user_id("account-123");
        pipeline.set_user(anonymized.clone());
        pipeline.record(EventType::AppOpened, EventDetails::new());

        pipeline.clear_user();
        pipeline.record(EventType::AppOpened, EventDetails::new());

        let history = pipeline.history();
        assert_eq!(history[0].user_id.as_deref(), Some(anonymized.as_str()));
        assert_eq!(history[1].user_id, None);
        assert_ne!(anonymized, "account-123");
    }

    #[tokio::test]
    async fn test_clear_erases_buffer_and_document() {
        let dir = tempdir().unwrap();
        let storage = dir.path().join("events.json");
        let pipeline =
            TelemetryPipeline::init(test_config("http://127.0.0.1:1", storage.clone())).unwrap();

        for n in 0..3 {
            pipeline.record(EventType::PageView, page_view(n));
        }
        assert!(storage.exists());

        pipeline.clear();
        assert_eq!(pipeline.pending_len(), 0);
        assert_eq!(pipeline.stats().pending_events, 0);
        assert!(!storage.exists());
    }

    #[tokio::test]
    async fn test_dispose_delivers_pending_without_removal() {
        let mock = MockCollector::start(Vec::new()).await;
        let dir = tempdir().unwrap();
        let storage = dir.path().join("events.json");
        let pipeline = TelemetryPipeline::init(test_config(&mock.backend_url(), storage.clone()))
            .unwrap();

        pipeline.record(EventType::PageView, page_view(0));
        pipeline.record(EventType::PageView, page_view(1));
        pipeline.dispose().await;

        // The final delivery reached the collector.
        assert_eq!(mock.request_count(), 1);
        assert_eq!(mock.requests()[0].events.len(), 2);

        // But the document still holds the events; the next session would
        // resend them rather than risk losing an unacknowledged batch.
        let reopened = EventStore::open(&storage, "next", 100, false);
        assert_eq!(reopened.pending_len(), 2);
    }

    #[tokio::test]
    async fn test_stats_subscription_observes_updates() {
        let dir = tempdir().unwrap();
        let pipeline = TelemetryPipeline::init(test_config(
            "http://127.0.0.1:1",
            dir.path().join("events.json"),
        ))
        .unwrap();

        let mut stats_rx = pipeline.subscribe_stats();
        pipeline.record(EventType::UiInteraction, EventDetails::new());

        timeout(Duration::from_secs(1), stats_rx.changed())
            .await
            .expect("no stats update arrived")
            .expect("stats channel closed");
        let stats = stats_rx.borrow().clone();
        assert_eq!(stats.events_recorded, 1);
        assert_eq!(stats.pending_events, 1);
    }
}
