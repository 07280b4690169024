//! Replay scheduling - manual requests and periodic mode.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use deferq_common::{Error, Result};

use crate::connectivity::ConnectivityState;
use crate::engine::{ReplayResult, SyncEngine};
use crate::transport::DeliveryTransport;

/// Replay mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplayMode {
    /// Replay on request and on reconnect only.
    #[default]
    Manual,
    /// Additionally replay at regular intervals while online.
    Periodic { interval: Duration },
}

impl ReplayMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            ReplayMode::Manual => None,
            ReplayMode::Periodic { interval } => Some(*interval),
        }
    }
}

/// Replay request types.
#[derive(Debug)]
pub enum ReplayRequest {
    /// Replay the queue now.
    Replay,
    /// Shutdown the scheduler.
    Shutdown,
}

type Request = (ReplayRequest, oneshot::Sender<Result<ReplayResult>>);

/// Front end for requesting replays from the scheduler task.
pub struct ReplayScheduler {
    /// Current replay mode.
    mode: Arc<RwLock<ReplayMode>>,
    /// Channel to send replay requests.
    request_tx: mpsc::Sender<Request>,
}

impl ReplayScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: ReplayMode) -> (Self, ReplaySchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };

        let handle = ReplaySchedulerHandle { mode, request_rx };

        (scheduler, handle)
    }

    /// Request a replay and wait for its result.
    ///
    /// # Errors
    /// - `ReplayInProgress` if a replay was already running
    /// - `NotFound` if the scheduler task is not running
    pub async fn request_replay(&self) -> Result<ReplayResult> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((ReplayRequest::Replay, response_tx))
            .await
            .map_err(|_| Error::NotFound("Replay scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::NotFound("Replay scheduler dropped the request".to_string()))?
    }

    /// Change the replay mode; takes effect on the next loop iteration.
    pub async fn set_mode(&self, mode: ReplayMode) {
        let mut current_mode = self.mode.write().await;
        *current_mode = mode;
    }

    /// Get current replay mode.
    pub async fn mode(&self) -> ReplayMode {
        self.mode.read().await.clone()
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((ReplayRequest::Shutdown, response_tx))
            .await;
    }
}

/// Background half of the scheduler.
pub struct ReplaySchedulerHandle {
    mode: Arc<RwLock<ReplayMode>>,
    request_rx: mpsc::Receiver<Request>,
}

impl ReplaySchedulerHandle {
    /// Run the scheduler loop against `engine`.
    ///
    /// Should be spawned in a tokio task. Exits on shutdown or once every
    /// [`ReplayScheduler`] has been dropped.
    pub async fn run<T>(mut self, engine: Arc<SyncEngine<T>>)
    where
        T: DeliveryTransport + ?Sized + 'static,
    {
        let mut connectivity = engine.connectivity().subscribe();
        let mut current = self.mode.read().await.interval();
        let mut periodic = current.map(periodic_interval);

        info!("Replay scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    let Some((request, response_tx)) = request else {
                        debug!("All scheduler fronts dropped");
                        break;
                    };
                    match request {
                        ReplayRequest::Shutdown => {
                            info!("Received shutdown request");
                            break;
                        }
                        ReplayRequest::Replay => {
                            debug!("Processing replay request");
                            let _ = response_tx.send(engine.replay().await);
                        }
                    }
                }

                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *connectivity.borrow_and_update();
                    // Reconnect replay is spawned by the engine; restart the tick after it
                    if state == ConnectivityState::Online {
                        if let Some(period) = current {
                            periodic = Some(periodic_interval(period));
                        }
                    }
                }

                _ = wait_for_periodic(&mut periodic) => {
                    Self::periodic_replay(&engine).await;
                }
            }

            // Recreate interval if mode changed
            let expected = self.mode.read().await.interval();
            if expected != current {
                debug!("Replay mode changed, period now {:?}", expected);
                current = expected;
                periodic = current.map(periodic_interval);
            }
        }

        info!("Replay scheduler stopped");
    }

    async fn periodic_replay<T>(engine: &SyncEngine<T>)
    where
        T: DeliveryTransport + ?Sized + 'static,
    {
        if !engine.connectivity().is_online() || engine.queue_len().await == 0 {
            return;
        }

        debug!("Triggering periodic replay");
        match engine.replay().await {
            Ok(result) => {
                info!(
                    "Periodic replay completed: {} synced, {} conflicts, {} failed",
                    result.succeeded.len(),
                    result.conflicted.len(),
                    result.failed.len()
                );
            }
            Err(Error::ReplayInProgress) => debug!("Periodic replay skipped: run in progress"),
            Err(e) => error!("Periodic replay failed: {}", e),
        }
    }
}

fn periodic_interval(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn wait_for_periodic(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        // No periodic replay; let the other branches drive the loop
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyncConfig;
    use crate::transport::ScriptedTransport;
    use deferq_storage::MemoryStore;
    use serde_json::Value;

    async fn engine() -> Arc<SyncEngine<ScriptedTransport>> {
        let config = SyncConfig {
            max_retries: 0,
            auto_replay_on_reconnect: false,
            ..Default::default()
        };
        Arc::new(
            SyncEngine::open(Arc::new(MemoryStore::new()), ScriptedTransport::new(), config)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_scheduler_creation() {
        let (scheduler, _handle) = ReplayScheduler::new(ReplayMode::Manual);
        assert_eq!(scheduler.mode().await, ReplayMode::Manual);
    }

    #[tokio::test]
    async fn test_mode_change() {
        let (scheduler, _handle) = ReplayScheduler::new(ReplayMode::Manual);

        scheduler
            .set_mode(ReplayMode::Periodic {
                interval: Duration::from_secs(60),
            })
            .await;

        assert!(matches!(scheduler.mode().await, ReplayMode::Periodic { .. }));
    }

    #[tokio::test]
    async fn test_replay_request() {
        let engine = engine().await;
        engine.capture("grade.update", Value::Null).await.unwrap();

        let (scheduler, handle) = engine.init_scheduler();
        let task = tokio::spawn(handle.run(engine.clone()));

        let result = scheduler.request_replay().await.unwrap();
        assert_eq!(result.succeeded.len(), 1);
        assert_eq!(engine.queue_len().await, 0);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_after_shutdown() {
        let engine = engine().await;
        let (scheduler, handle) = engine.init_scheduler();
        let task = tokio::spawn(handle.run(engine));

        scheduler.shutdown().await;
        task.await.unwrap();

        assert!(matches!(
            scheduler.request_replay().await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_periodic_replays_only_while_online() {
        let engine = engine().await;
        engine.capture("grade.update", Value::Null).await.unwrap();

        let (scheduler, handle) = ReplayScheduler::new(ReplayMode::Periodic {
            interval: Duration::from_millis(20),
        });
        let task = tokio::spawn(handle.run(engine.clone()));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(engine.queue_len().await, 1);

        engine.set_online(true).await;
        let mut drained = false;
        for _ in 0..50 {
            if engine.queue_len().await == 0 {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(drained);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[test]
    fn test_mode_serialization() {
        let mode: ReplayMode =
            serde_json::from_str(r#"{"Periodic":{"interval":{"secs":30,"nanos":0}}}"#).unwrap();
        assert_eq!(
            mode,
            ReplayMode::Periodic {
                interval: Duration::from_secs(30)
            }
        );
        assert_eq!(ReplayMode::default(), ReplayMode::Manual);
    }
}
