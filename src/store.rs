//! Durable event buffer backed by a single JSON document.
//!
//! The buffer keeps two queues: a capped `history` of recent events for local
//! inspection and an unbounded `pending` queue of events awaiting delivery.
//! Every mutation is followed by a save so a crash or abrupt exit loses at
//! most the in-flight call. The document is written atomically (temp file
//! plus rename) so a torn write can never corrupt the previous state.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::Event;

/// Persisted shape of the buffer document.
///
/// Field names are camelCase on disk and must stay stable across versions;
/// a document that fails to parse is discarded, not migrated.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredState {
    session_id: String,
    events: Vec<Event>,
    pending_events: Vec<Event>,
    last_updated: DateTime<Utc>,
}

/// Error type for buffer persistence failures
#[derive(Debug)]
pub enum StoreError {
    /// Filesystem operation failed
    Io(io::Error),
    /// The buffer document could not be serialized
    Serialize(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "Storage I/O error: {}", e),
            StoreError::Serialize(e) => write!(f, "Storage serialization error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialize(e)
    }
}

/// In-memory event buffer with a durable JSON document behind it.
///
/// The store itself is synchronous and single-threaded; callers share it
/// behind a mutex and must not hold the guard across await points.
#[derive(Debug)]
pub struct EventStore {
    path: PathBuf,
    session_id: String,
    max_local_events: usize,
    debug_logging: bool,
    history: Vec<Event>,
    pending: Vec<Event>,
    last_updated: DateTime<Utc>,
}

impl EventStore {
    /// Creates an empty store that will persist to `path`.
    ///
    /// Nothing is read from disk; use [`EventStore::open`] to recover a
    /// previously persisted buffer.
    pub fn new(
        path: impl Into<PathBuf>,
        session_id: impl Into<String>,
        max_local_events: usize,
        debug_logging: bool,
    ) -> Self {
        Self {
            path: path.into(),
            session_id: session_id.into(),
            max_local_events,
            debug_logging,
            history: Vec::new(),
            pending: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Creates a store and loads any previously persisted document.
    pub fn open(
        path: impl Into<PathBuf>,
        session_id: impl Into<String>,
        max_local_events: usize,
        debug_logging: bool,
    ) -> Self {
        let mut store = Self::new(path, session_id, max_local_events, debug_logging);
        store.load();
        store
    }

    /// Loads the persisted document, replacing in-memory contents.
    ///
    /// A missing document starts an empty buffer. A document that cannot be
    /// read or parsed also resets to empty; recorded telemetry is never worth
    /// failing the host application over.
    pub fn load(&mut self) {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no buffer document yet, starting empty");
                return;
            }
            Err(e) => {
                if self.debug_logging {
                    warn!(error = %e, path = %self.path.display(), "failed to read buffer document, starting empty");
                }
                return;
            }
        };

        match serde_json::from_str::<StoredState>(&text) {
            Ok(state) => {
                debug!(
                    history = state.events.len(),
                    pending = state.pending_events.len(),
                    "recovered buffer document"
                );
                self.history = state.events;
                self.pending = state.pending_events;
                self.last_updated = state.last_updated;
                self.trim_history();
            }
            Err(e) => {
                if self.debug_logging {
                    warn!(error = %e, path = %self.path.display(), "buffer document corrupt, resetting");
                }
                self.history.clear();
                self.pending.clear();
            }
        }
    }

    /// Appends an event to both the history and the pending queue.
    ///
    /// History is trimmed to the retention cap; the pending queue is never
    /// trimmed so unsent events survive until acknowledged.
    pub fn append(&mut self, event: Event) {
        self.history.push(event.clone());
        self.pending.push(event);
        self.trim_history();
    }

    /// Drops the oldest history entries beyond the retention cap.
    pub fn trim_history(&mut self) {
        if self.history.len() > self.max_local_events {
            let drop_count = self.history.len() - self.max_local_events;
            self.history.drain(0..drop_count);
        }
    }

    /// Returns a copy of the pending queue for a delivery attempt.
    pub fn snapshot_pending(&self) -> Vec<Event> {
        self.pending.clone()
    }

    /// Removes the first `count` pending events after an acknowledged
    /// delivery. Returns the number actually removed, which saturates when
    /// the queue shrank underneath the caller (e.g. a concurrent clear).
    pub fn remove_delivered(&mut self, count: usize) -> usize {
        let removed = count.min(self.pending.len());
        self.pending.drain(0..removed);
        removed
    }

    /// Persists the buffer document, atomically replacing the previous one.
    pub fn save(&mut self) -> Result<(), StoreError> {
        self.last_updated = Utc::now();
        let state = StoredState {
            session_id: self.session_id.clone(),
            events: self.history.clone(),
            pending_events: self.pending.clone(),
            last_updated: self.last_updated,
        };
        let json = serde_json::to_string(&state)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        atomic_write(&self.path, &json)?;
        Ok(())
    }

    /// Clears all buffered events and erases the durable record.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.history.clear();
        self.pending.clear();
        self.last_updated = Utc::now();

        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Number of events awaiting delivery.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of events in the local history window.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Whether the pending queue is empty.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Recent events retained for local inspection, oldest first.
    pub fn history(&self) -> &[Event] {
        &self.history
    }

    /// Time of the last successful mutation, as stamped into the document.
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }
}

/// Writes `contents` to `path` via a uniquely named temp file and a rename,
/// so readers never observe a partially written document.
fn atomic_write(path: &Path, contents: &str) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("events.json");
    let tmp_path = path.with_file_name(format!("{}.tmp-{:08x}", file_name, rand::random::<u32>()));

    fs::write(&tmp_path, contents)?;
    match fs::rename(&tmp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}
