//! Delivery dispatcher: drains the pending queue to the collector.
//!
//! The dispatcher is the single consumer of flush requests. Every trigger
//! (scheduler tick, batch threshold, connectivity regained, retry timer,
//! explicit request) funnels into one bounded channel, so at most one
//! delivery attempt runs at a time and bursts of triggers coalesce into one
//! flush instead of queueing up.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{ClientError, CollectorClient};
use crate::config::Config;
use crate::event::{Event, EventsBody};
use crate::monitor::NetworkMonitor;
use crate::pipeline::StatsPublisher;
use crate::store::EventStore;

/// Serialized payloads above this size are delivered in chunks instead of a
/// single request.
const MAX_PAYLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Pause between consecutive chunk requests.
const CHUNK_DELAY: Duration = Duration::from_millis(100);

/// Why a flush attempt was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Periodic timer tick
    Scheduled,
    /// Pending queue reached the batch threshold
    Threshold,
    /// Connectivity transitioned from offline to online
    ConnectivityRegained,
    /// A previously failed delivery is being retried
    Retry,
    /// The host asked for an immediate flush
    Requested,
}

/// Consumes flush requests and posts pending events to the collector.
pub(crate) struct Dispatcher {
    config: Config,
    store: Arc<Mutex<EventStore>>,
    client: Arc<CollectorClient>,
    monitor: NetworkMonitor,
    stats: Arc<StatsPublisher>,
    /// Used by the retry timer to request another flush.
    flush_tx: mpsc::Sender<FlushReason>,
    /// The one outstanding retry timer, if any.
    retry: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub(crate) fn new(
        config: Config,
        store: Arc<Mutex<EventStore>>,
        client: Arc<CollectorClient>,
        monitor: NetworkMonitor,
        stats: Arc<StatsPublisher>,
        flush_tx: mpsc::Sender<FlushReason>,
    ) -> Self {
        Self {
            config,
            store,
            client,
            monitor,
            stats,
            flush_tx,
            retry: None,
        }
    }

    /// Consumes flush requests until the channel closes or shutdown flips.
    pub(crate) async fn run(
        mut self,
        mut flush_rx: mpsc::Receiver<FlushReason>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!("Delivery dispatcher started");
        loop {
            tokio::select! {
                request = flush_rx.recv() => match request {
                    Some(reason) => self.flush_attempt(reason).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        if let Some(handle) = self.retry.take() {
            handle.abort();
        }
        debug!("Delivery dispatcher stopped");
    }

    /// Runs one delivery attempt against the current pending queue.
    pub(crate) async fn flush_attempt(&mut self, reason: FlushReason) {
        if !self.monitor.is_online() {
            debug!(reason = ?reason, "Skipping flush while offline");
            return;
        }

        let snapshot = self
            .store
            .lock()
            .map(|store| store.snapshot_pending())
            .unwrap_or_default();
        if snapshot.is_empty() {
            return;
        }

        debug!(reason = ?reason, events = snapshot.len(), "Starting flush");
        self.stats.update(|s| s.flush_attempts += 1);

        let payload_bytes = serde_json::to_vec(&EventsBody { events: &snapshot })
            .map(|body| body.len())
            .unwrap_or(0);
        if payload_bytes > MAX_PAYLOAD_BYTES {
            debug!(payload_bytes, "Payload over size threshold, sending chunked");
            self.send_chunked(&snapshot).await;
            return;
        }

        match self.client.post_events(&snapshot).await {
            Ok(()) => self.acknowledge(snapshot.len()),
            Err(e) if e.is_payload_too_large() => {
                debug!(payload_bytes, "Collector rejected payload size, sending chunked");
                self.send_chunked(&snapshot).await;
            }
            Err(e) => self.handle_failure(e),
        }
    }

    /// Delivers an oversized snapshot as a series of half-batch requests.
    ///
    /// Chunks go out in queue order and delivery stops at the first failed
    /// chunk, so the acknowledged events always form a prefix of the queue
    /// and front removal stays correct.
    async fn send_chunked(&mut self, snapshot: &[Event]) {
        let chunk_size = (self.config.batch_size / 2).max(1);
        self.stats.update(|s| s.chunked_flushes += 1);

        let total_chunks = snapshot.len().div_ceil(chunk_size);
        for (index, chunk) in snapshot.chunks(chunk_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(CHUNK_DELAY).await;
            }
            debug!(
                chunk = index + 1,
                total_chunks,
                events = chunk.len(),
                "Sending chunk"
            );
            match self.client.post_events(chunk).await {
                Ok(()) => self.acknowledge(chunk.len()),
                Err(e) => {
                    self.handle_failure(e);
                    return;
                }
            }
        }
    }

    /// Removes acknowledged events from the front of the queue and persists
    /// the shrunken document.
    fn acknowledge(&self, delivered: usize) {
        let (save_result, pending_len) = match self.store.lock() {
            Ok(mut store) => {
                let removed = store.remove_delivered(delivered);
                if removed < delivered {
                    debug!(delivered, removed, "Queue shrank during delivery");
                }
                (store.save(), store.pending_len())
            }
            Err(_) => return,
        };

        if let Err(e) = save_result {
            if self.config.debug_mode {
                warn!(error = %e, "Failed to persist buffer after delivery");
            }
        }

        self.stats.update(|s| {
            s.events_delivered += delivered as u64;
            s.pending_events = pending_len;
        });
    }

    /// Records a failed delivery and arms the retry timer.
    ///
    /// Failures are logged, never recorded as events; an event about a
    /// delivery failure would join the very queue that cannot drain.
    fn handle_failure(&mut self, error: ClientError) {
        if self.config.debug_mode {
            warn!(error = %error, "Delivery failed, retry scheduled");
        }
        self.stats.update(|s| s.failed_attempts += 1);
        self.arm_retry();
    }

    /// Schedules a retry flush after the configured delay.
    ///
    /// Arming again replaces the prior timer, so at most one retry is ever
    /// outstanding and its delay restarts from the latest failure.
    fn arm_retry(&mut self) {
        if let Some(handle) = self.retry.take() {
            handle.abort();
        }
        self.stats.update(|s| s.retries_scheduled += 1);

        let flush_tx = self.flush_tx.clone();
        let delay = self.config.retry_delay;
        self.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = flush_tx.try_send(FlushReason::Retry);
        }));
    }
}
