use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::relay::{OutboxRelay, SweepReport};
use crate::config::SweeperConfig;
use crate::error::HandlerError;
use crate::traits::DistributedLock;

// ---------------------------------------------------------------------------
// OutboxSweeper
// ---------------------------------------------------------------------------

/// Relays outbox entries that no explicit clear has dispatched.
///
/// Each sweep holds the distributed lock for its duration, so at most one instance in the
/// cluster sweeps at a time.
pub struct OutboxSweeper {
    relay: Arc<OutboxRelay>,
    lock: Arc<dyn DistributedLock>,
    config: SweeperConfig,
}

impl OutboxSweeper {
    #[must_use]
    pub fn new(
        relay: Arc<OutboxRelay>,
        lock: Arc<dyn DistributedLock>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            relay,
            lock,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Runs one sweep. Returns `None` without relaying anything if another sweeper holds the
    /// lock.
    ///
    /// # Errors
    ///
    /// Returns a lock or store error. The lock is released on every path once obtained.
    pub async fn sweep(&self) -> Result<Option<SweepReport>, HandlerError> {
        let resource = self.config.lock_resource.as_str();
        let Some(token) = self.lock.obtain_lock(resource).await? else {
            info!(resource, "outbox sweeper still running - abandoning attempt");
            return Ok(None);
        };

        let result = self
            .relay
            .clear_outstanding(self.config.min_message_age(), self.config.batch_size)
            .await;

        match self.lock.release_lock(resource, &token).await {
            Ok(true) => {}
            Ok(false) => warn!(resource, "sweeper lock lease expired before release"),
            Err(e) => warn!(resource, error = %e, "failed to release sweeper lock"),
        }

        let report = result?;
        if report.relayed > 0 || report.failed > 0 {
            info!(relayed = report.relayed, failed = report.failed, "outbox sweep finished");
        }
        Ok(Some(report))
    }
}

// ---------------------------------------------------------------------------
// TimedOutboxSweeper
// ---------------------------------------------------------------------------

type SweepResult = anyhow::Result<Option<SweepReport>>;

/// Room for on-demand requests queued while a sweep is in flight.
const REQUEST_CAPACITY: usize = 64;

/// Runs an [`OutboxSweeper`] every `interval_ms` on a background task.
///
/// On-demand requests that queue up while a sweep is running are served together by the
/// next sweep, and every waiting caller receives its report. An on-demand sweep pushes the
/// next periodic one a full interval out.
pub struct TimedOutboxSweeper {
    requests: Option<mpsc::Sender<oneshot::Sender<SweepResult>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TimedOutboxSweeper {
    /// Starts sweeping. Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(sweeper: Arc<OutboxSweeper>) -> Self {
        let interval = Duration::from_millis(sweeper.config().interval_ms.max(1));
        info!(interval_ms = sweeper.config().interval_ms, "starting timed outbox sweeper");
        let (requests, rx) = mpsc::channel(REQUEST_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(sweep_loop(sweeper, interval, rx, shutdown_rx));
        Self {
            requests: Some(requests),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Sweeps ahead of the next tick and returns that sweep's report. `None` means another
    /// instance held the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweep failed or the sweeper has been stopped.
    pub async fn sweep_now(&self) -> SweepResult {
        let Some(requests) = &self.requests else {
            anyhow::bail!("outbox sweeper not running");
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .send(reply_tx)
            .await
            .map_err(|_| anyhow::anyhow!("outbox sweeper stopped"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("outbox sweeper stopped before replying"))?
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the loop and waits for an in-flight sweep to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("timed outbox sweeper stopped");
    }
}

async fn sweep_loop(
    sweeper: Arc<OutboxSweeper>,
    interval: Duration,
    mut requests: mpsc::Receiver<oneshot::Sender<SweepResult>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticks.tick().await;

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(first) = request else { break };
                let mut waiting = vec![first];
                while let Ok(next) = requests.try_recv() {
                    waiting.push(next);
                }
                if waiting.len() > 1 {
                    debug!(requests = waiting.len(), "coalescing on-demand sweeps");
                }
                let result = sweeper.sweep().await;
                for reply in waiting {
                    let shared = match &result {
                        Ok(report) => Ok(*report),
                        Err(e) => Err(anyhow::anyhow!("outbox sweep failed: {e}")),
                    };
                    let _ = reply.send(shared);
                }
                ticks.reset();
            }
            _ = ticks.tick() => {
                if let Err(e) = sweeper.sweep().await {
                    warn!(error = %e, "outbox sweep failed");
                }
            }
            _ = &mut shutdown_rx => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use herald_core::{Message, MessageBody, MessageHeader, MessageType};

    use super::*;
    use crate::lock::InMemoryLock;
    use crate::outbox::InMemoryOutbox;
    use crate::traits::Outbox;
    use crate::transport::{InMemoryProducer, InternalBus, ProducerRegistry};

    struct Fixture {
        bus: Arc<InternalBus>,
        outbox: Arc<InMemoryOutbox>,
        lock: Arc<InMemoryLock>,
        sweeper: Arc<OutboxSweeper>,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(InternalBus::new());
        let outbox = Arc::new(InMemoryOutbox::new());
        let lock = Arc::new(InMemoryLock::default());
        let relay = Arc::new(OutboxRelay::new(
            outbox.clone(),
            Arc::new(ProducerRegistry::single(Arc::new(InMemoryProducer::new(
                bus.clone(),
            )))),
            Duration::from_secs(30),
        ));
        let config = SweeperConfig {
            interval_ms: 50,
            min_message_age_ms: 0,
            ..SweeperConfig::default()
        };
        let sweeper = Arc::new(OutboxSweeper::new(relay, lock.clone(), config));
        Fixture {
            bus,
            outbox,
            lock,
            sweeper,
        }
    }

    fn message() -> Message {
        Message::new(
            MessageHeader::new("audit", MessageType::Event),
            MessageBody::new("{}", "application/json"),
        )
    }

    #[tokio::test]
    async fn sweep_relays_pending_entries_and_releases_the_lock() {
        let f = fixture();
        f.outbox.add(message()).await.unwrap();
        f.outbox.add(message()).await.unwrap();

        let report = f.sweeper.sweep().await.unwrap().unwrap();
        assert_eq!(report.relayed, 2);
        assert_eq!(f.bus.stream_len("audit"), 2);
        assert!(!f.lock.is_held("OutboxSweeper"));
    }

    #[tokio::test]
    async fn sweep_is_skipped_while_another_instance_holds_the_lock() {
        let f = fixture();
        f.outbox.add(message()).await.unwrap();
        let token = f.lock.obtain_lock("OutboxSweeper").await.unwrap().unwrap();

        assert!(f.sweeper.sweep().await.unwrap().is_none());
        assert_eq!(f.bus.stream_len("audit"), 0);

        assert!(f.lock.release_lock("OutboxSweeper", &token).await.unwrap());
        assert_eq!(f.sweeper.sweep().await.unwrap().unwrap().relayed, 1);
    }

    #[tokio::test]
    async fn young_entries_are_left_alone() {
        let f = fixture();
        let sweeper = OutboxSweeper::new(
            Arc::clone(&f.sweeper.relay),
            f.lock.clone(),
            SweeperConfig::default(),
        );
        f.outbox.add(message()).await.unwrap();
        assert_eq!(sweeper.sweep().await.unwrap().unwrap().relayed, 0);
    }

    #[tokio::test]
    async fn sweep_now_returns_the_report_and_ticks_keep_sweeping() {
        let f = fixture();
        let mut timed = TimedOutboxSweeper::start(f.sweeper.clone());

        f.outbox.add(message()).await.unwrap();
        let report = timed.sweep_now().await.unwrap().unwrap();
        assert_eq!(report.relayed, 1);
        assert_eq!(f.bus.stream_len("audit"), 1);

        f.outbox.add(message()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(f.bus.stream_len("audit"), 2);

        timed.stop().await;
        assert!(!timed.is_running());
        assert!(timed.sweep_now().await.is_err());
    }

    #[tokio::test]
    async fn every_queued_caller_gets_a_report() {
        let f = fixture();
        // Hold the lock so the sweeps in flight report `None` instead of relaying.
        let token = f.lock.obtain_lock("OutboxSweeper").await.unwrap().unwrap();
        let timed = Arc::new(TimedOutboxSweeper::start(f.sweeper.clone()));
        f.outbox.add(message()).await.unwrap();

        let callers: Vec<_> = (0..3)
            .map(|_| {
                let timed = Arc::clone(&timed);
                tokio::spawn(async move { timed.sweep_now().await })
            })
            .collect();
        for caller in callers {
            assert!(caller.await.unwrap().unwrap().is_none());
        }
        assert_eq!(f.bus.stream_len("audit"), 0);

        assert!(f.lock.release_lock("OutboxSweeper", &token).await.unwrap());
        assert_eq!(timed.sweep_now().await.unwrap().unwrap().relayed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_sweep_postpones_the_next_tick() {
        let f = fixture();
        let mut timed = TimedOutboxSweeper::start(f.sweeper.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        timed.sweep_now().await.unwrap();
        f.outbox.add(message()).await.unwrap();

        // The original tick at 50ms was pushed to 80ms.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.bus.stream_len("audit"), 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.bus.stream_len("audit"), 1);

        timed.stop().await;
    }
}
