//! Periodic flush scheduling.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::dispatcher::FlushReason;

/// Interval timer that requests a background flush on each tick.
///
/// At most one timer task is ever alive: starting again cancels the previous
/// task first, and each tick goes through the single-slot flush channel so a
/// slow delivery never stacks up requests behind itself.
#[derive(Debug)]
pub struct FlushScheduler {
    interval: Duration,
    handle: Option<JoinHandle<()>>,
}

impl FlushScheduler {
    /// Creates a scheduler that will tick at the given interval once started.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            handle: None,
        }
    }

    /// Starts (or restarts) the periodic timer.
    pub fn start(&mut self, flush_tx: mpsc::Sender<FlushReason>) {
        self.stop();

        let interval = self.interval;
        debug!(interval_secs = interval.as_secs(), "Flush scheduler started");
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the first immediate tick so a fresh start waits a full
            // interval before flushing.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let _ = flush_tx.try_send(FlushReason::Scheduled);
            }
        }));
    }

    /// Cancels the timer if one is running.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("Flush scheduler stopped");
        }
    }

    /// Whether a timer task is currently alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_ticks_request_scheduled_flushes() {
        let (flush_tx, mut flush_rx) = mpsc::channel(1);
        let mut scheduler = FlushScheduler::new(Duration::from_millis(50));
        scheduler.start(flush_tx);

        let first = timeout(Duration::from_secs(1), flush_rx.recv())
            .await
            .expect("no tick arrived")
            .expect("channel closed");
        assert_eq!(first, FlushReason::Scheduled);

        let second = timeout(Duration::from_secs(1), flush_rx.recv())
            .await
            .expect("no second tick arrived")
            .expect("channel closed");
        assert_eq!(second, FlushReason::Scheduled);
    }

    #[tokio::test]
    async fn test_first_tick_waits_a_full_interval() {
        let (flush_tx, mut flush_rx) = mpsc::channel(1);
        let mut scheduler = FlushScheduler::new(Duration::from_millis(200));
        scheduler.start(flush_tx);

        sleep(Duration::from_millis(50)).await;
        assert!(
            flush_rx.try_recv().is_err(),
            "flush requested before the interval elapsed"
        );
    }

    #[tokio::test]
    async fn test_restart_cancels_previous_timer() {
        let (old_tx, mut old_rx) = mpsc::channel(1);
        let (new_tx, mut new_rx) = mpsc::channel(1);

        let mut scheduler = FlushScheduler::new(Duration::from_millis(50));
        scheduler.start(old_tx);
        scheduler.start(new_tx);

        // The old task was aborted, so its sender is gone and its channel
        // closes without ever delivering a tick.
        let old_outcome = timeout(Duration::from_secs(1), old_rx.recv())
            .await
            .expect("old channel neither closed nor ticked");
        assert!(old_outcome.is_none());

        let tick = timeout(Duration::from_secs(1), new_rx.recv())
            .await
            .expect("restarted timer never ticked")
            .expect("channel closed");
        assert_eq!(tick, FlushReason::Scheduled);
    }

    #[tokio::test]
    async fn test_stop_halts_ticking() {
        let (flush_tx, mut flush_rx) = mpsc::channel(1);
        let mut scheduler = FlushScheduler::new(Duration::from_millis(50));
        scheduler.start(flush_tx);
        assert!(scheduler.is_running());

        scheduler.stop();
        assert!(!scheduler.is_running());

        sleep(Duration::from_millis(150)).await;
        assert!(flush_rx.try_recv().is_err(), "tick arrived after stop");
    }

    #[tokio::test]
    async fn test_ticks_coalesce_into_single_slot() {
        let (flush_tx, mut flush_rx) = mpsc::channel(1);
        let mut scheduler = FlushScheduler::new(Duration::from_millis(30));
        scheduler.start(flush_tx);

        // Nobody drains the channel for several intervals.
        sleep(Duration::from_millis(200)).await;

        assert!(flush_rx.try_recv().is_ok());
        assert!(
            flush_rx.try_recv().is_err(),
            "undelivered ticks piled up instead of coalescing"
        );
    }
}
