//! Connectivity tracking for the delivery side of the pipeline.
//!
//! The host application reports online/offline transitions it observes (OS
//! callbacks, failed health checks, whatever it has). The pipeline treats
//! the reported state as authoritative: delivery attempts are skipped while
//! offline, and the offline-to-online edge requests a single flush to drain
//! whatever accumulated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::dispatcher::FlushReason;

/// Shared connectivity state with flush-on-reconnect behavior.
///
/// Cheap to clone; all clones observe and update the same state. The state
/// starts online, matching a freshly launched application that has not heard
/// otherwise.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    online: Arc<AtomicBool>,
    flush_tx: mpsc::Sender<FlushReason>,
}

impl NetworkMonitor {
    pub(crate) fn new(flush_tx: mpsc::Sender<FlushReason>) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(true)),
            flush_tx,
        }
    }

    /// Records the connectivity state reported by the host.
    ///
    /// Exactly one flush is requested per offline-to-online edge; repeated
    /// reports of the same state do nothing. The request coalesces with any
    /// flush already queued.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return;
        }

        info!(online, "Connectivity changed");
        if online {
            debug!("Connectivity regained, requesting flush");
            let _ = self.flush_tx.try_send(FlushReason::ConnectivityRegained);
        }
    }

    /// Current connectivity state.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
