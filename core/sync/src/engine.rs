//! Sync engine owning the offline queue, replay and conflict adjudication.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use deferq_common::{ActionId, Error, Result};
use deferq_storage::KeyValueStore;

use crate::conflict::{ConflictSet, Resolution, Resolved, SyncConflict};
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::events::{EventBus, SyncEvent, DEFAULT_EVENT_CAPACITY};
use crate::log::{LogLevel, SyncLog, SyncLogEntry, DEFAULT_LOG_CAPACITY};
use crate::queue::QueueStore;
use crate::retry::RetryPolicy;
use crate::scheduler::{ReplayMode, ReplayScheduler, ReplaySchedulerHandle};
use crate::state::{QueuedAction, DEFAULT_VERSION};
use crate::transport::{DeliveryOutcome, DeliveryTransport};

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Storage key the queue is persisted under.
    pub storage_key: String,
    /// Number of sync log entries kept.
    pub log_capacity: usize,
    /// Events buffered per subscriber.
    pub event_capacity: usize,
    /// Retries of a transient delivery failure within one run.
    pub max_retries: u32,
    /// First retry delay in milliseconds.
    pub retry_initial_delay_ms: u64,
    /// Retry delay cap in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Replay scheduling mode.
    pub replay_mode: ReplayMode,
    /// Replay automatically when connectivity comes back.
    pub auto_replay_on_reconnect: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            storage_key: "offline_queue".to_string(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_retries: 2,
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            replay_mode: ReplayMode::Manual,
            auto_replay_on_reconnect: true,
        }
    }
}

impl SyncConfig {
    /// Storage key of the pending conflict set.
    pub fn conflicts_key(&self) -> String {
        format!("{}.conflicts", self.storage_key)
    }

    /// Delivery retry policy derived from this config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_initial_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

/// Outcome of one replay run.
#[derive(Debug, Clone, Default)]
pub struct ReplayResult {
    /// Delivered and removed, in replay order.
    pub succeeded: Vec<ActionId>,
    /// Conflicts produced by this run, in replay order.
    pub conflicted: Vec<SyncConflict>,
    /// Transiently failed and still queued, in replay order.
    pub failed: Vec<ActionId>,
    /// Queue length after the run.
    pub remaining: usize,
    pub duration: Duration,
}

impl ReplayResult {
    /// Whether the run touched nothing.
    pub fn is_noop(&self) -> bool {
        self.succeeded.is_empty() && self.conflicted.is_empty() && self.failed.is_empty()
    }
}

/// Result of [`SyncEngine::submit`].
#[derive(Debug, Clone)]
pub enum Submitted {
    /// Written straight through to the remote system.
    Delivered(ActionId),
    /// Captured for a later replay.
    Queued(QueuedAction),
    /// Captured and immediately parked for adjudication.
    Conflicted(SyncConflict),
}

/// What [`SyncEngine::purge`] discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeSummary {
    pub actions: usize,
    pub conflicts: usize,
}

/// A connectivity transition observed by [`SyncEngine::set_online`].
#[derive(Debug)]
pub struct ConnectivityTransition {
    pub state: ConnectivityState,
    /// Replay started because of this transition, if any.
    pub replay: Option<JoinHandle<Result<ReplayResult>>>,
}

/// Queue and conflicts, mutated only together under one lock.
struct Ledger {
    queue: QueueStore,
    conflicts: ConflictSet,
}

/// Offline action queue and replay engine.
///
/// Construct once per process and share as `Arc<SyncEngine<_>>`. Every
/// queue mutation goes through the ledger lock; transport calls never run
/// while it is held.
pub struct SyncEngine<T: DeliveryTransport + ?Sized> {
    /// Transport for remote delivery.
    transport: Arc<T>,
    /// Durable queue plus pending conflicts.
    ledger: Mutex<Ledger>,
    /// Held for the duration of a replay run.
    replay_lock: Mutex<()>,
    /// Reachability of the remote system.
    connectivity: ConnectivityMonitor,
    /// Published notifications.
    events: EventBus,
    /// Rolling status lines.
    log: RwLock<SyncLog>,
    /// Per-action delivery retry.
    retry: RetryPolicy,
    config: SyncConfig,
}

impl<T: DeliveryTransport + 'static> SyncEngine<T> {
    /// Open the engine over `store`, loading any persisted queue.
    pub async fn open(store: Arc<dyn KeyValueStore>, transport: T, config: SyncConfig) -> Result<Self> {
        Self::from_arc(store, Arc::new(transport), config).await
    }
}

impl<T: DeliveryTransport + ?Sized + 'static> SyncEngine<T> {
    /// Open the engine with an Arc-wrapped transport.
    pub async fn from_arc(
        store: Arc<dyn KeyValueStore>,
        transport: Arc<T>,
        config: SyncConfig,
    ) -> Result<Self> {
        if config.storage_key.trim().is_empty() {
            return Err(Error::InvalidInput("storage_key cannot be empty".to_string()));
        }

        let queue = QueueStore::open(store.clone(), config.storage_key.clone()).await?;
        let conflicts = ConflictSet::open(store, config.conflicts_key(), &queue).await?;

        info!(
            "Opened offline queue '{}' ({} queued, {} conflicts) via {} transport",
            config.storage_key,
            queue.len(),
            conflicts.len(),
            transport.name()
        );

        Ok(Self {
            transport,
            ledger: Mutex::new(Ledger { queue, conflicts }),
            replay_lock: Mutex::new(()),
            connectivity: ConnectivityMonitor::default(),
            events: EventBus::new(config.event_capacity),
            log: RwLock::new(SyncLog::new(config.log_capacity)),
            retry: config.retry_policy(),
            config,
        })
    }

    /// Create the replay scheduler for this engine's configured mode.
    pub fn init_scheduler(&self) -> (ReplayScheduler, ReplaySchedulerHandle) {
        ReplayScheduler::new(self.config.replay_mode.clone())
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn transport(&self) -> Arc<T> {
        self.transport.clone()
    }

    /// Connectivity monitor; read-only for collaborators, fed through [`SyncEngine::set_online`].
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Append a line to the sync log.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.log.write().await.push(level, message);
    }

    /// Retained sync log lines, oldest first.
    pub async fn log_entries(&self) -> Vec<SyncLogEntry> {
        self.log.read().await.entries()
    }

    /// Authoritative queue length.
    pub async fn queue_len(&self) -> usize {
        self.ledger.lock().await.queue.len()
    }

    /// Point-in-time copy of the queue in capture order.
    pub async fn queue_snapshot(&self) -> Vec<QueuedAction> {
        self.ledger.lock().await.queue.snapshot()
    }

    /// Pending conflicts in detection order.
    pub async fn conflicts(&self) -> Vec<SyncConflict> {
        self.ledger.lock().await.conflicts.snapshot()
    }

    /// Look up one pending conflict.
    pub async fn conflict(&self, id: &ActionId) -> Option<SyncConflict> {
        self.ledger.lock().await.conflicts.get(id).cloned()
    }

    /// Capture an action with a generated id.
    ///
    /// Never touches the network. The caller has already decided the write
    /// cannot reach the remote system now.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty type
    /// - `StorageWrite` if the queue could not be persisted; the action is dropped
    pub async fn capture(&self, action_type: &str, payload: Value) -> Result<QueuedAction> {
        self.capture_versioned(None, action_type, payload, DEFAULT_VERSION)
            .await
    }

    /// Capture an action under a caller-chosen id.
    ///
    /// # Errors
    /// - `AlreadyExists` if the id is already queued
    pub async fn capture_with_id(
        &self,
        id: ActionId,
        action_type: &str,
        payload: Value,
    ) -> Result<QueuedAction> {
        self.capture_versioned(Some(id), action_type, payload, DEFAULT_VERSION)
            .await
    }

    /// Capture an action declaring the local revision of its entity.
    pub async fn capture_versioned(
        &self,
        id: Option<ActionId>,
        action_type: &str,
        payload: Value,
        version: u64,
    ) -> Result<QueuedAction> {
        let action = Self::build_action(id, action_type, payload, version)?;
        self.enqueue(action.clone()).await?;
        Ok(action)
    }

    fn build_action(
        id: Option<ActionId>,
        action_type: &str,
        payload: Value,
        version: u64,
    ) -> Result<QueuedAction> {
        let action_type = action_type.trim();
        if action_type.is_empty() {
            return Err(Error::InvalidInput("Action type cannot be empty".to_string()));
        }
        if version == 0 {
            return Err(Error::InvalidInput("Action version starts at 1".to_string()));
        }
        Ok(QueuedAction::new(
            id.unwrap_or_else(ActionId::generate),
            action_type,
            payload,
            version,
        ))
    }

    async fn enqueue(&self, action: QueuedAction) -> Result<()> {
        let length = {
            let mut ledger = self.ledger.lock().await;
            ledger.queue.append(action.clone()).await?;
            ledger.queue.len()
        };

        debug!("Captured {} ({})", action.id, action.action_type);
        self.events.publish(SyncEvent::QueueChanged { length });
        self.log(
            LogLevel::Info,
            format!("buffered offline: {} ({} queued)", action.action_type, length),
        )
        .await;
        Ok(())
    }

    /// Write through when online, otherwise capture.
    ///
    /// A direct delivery that fails transiently falls back to capture; one
    /// that conflicts is captured and parked for adjudication at once.
    pub async fn submit(&self, action_type: &str, payload: Value) -> Result<Submitted> {
        let action = Self::build_action(None, action_type, payload, DEFAULT_VERSION)?;

        if !self.connectivity.is_online() {
            self.enqueue(action.clone()).await?;
            return Ok(Submitted::Queued(action));
        }

        match self.deliver(&action, false).await {
            Ok(DeliveryOutcome::Delivered) => {
                self.log(
                    LogLevel::Success,
                    format!("delivered directly: {}", action.action_type),
                )
                .await;
                Ok(Submitted::Delivered(action.id))
            }
            Ok(DeliveryOutcome::Conflict {
                remote_version,
                remote_data,
            }) => {
                let conflict = SyncConflict::from_action(&action, remote_version, remote_data);
                let (length, pending) = {
                    let mut ledger = self.ledger.lock().await;
                    ledger.queue.append(action.clone()).await?;
                    ledger.conflicts.insert(conflict.clone());
                    if let Err(e) = ledger.conflicts.persist().await {
                        warn!("Failed to persist conflict for {}: {}", action.id, e);
                    }
                    (ledger.queue.len(), ledger.conflicts.len())
                };
                self.events.publish(SyncEvent::QueueChanged { length });
                self.events.publish(SyncEvent::ConflictsPending { count: pending });
                self.log(
                    LogLevel::Error,
                    format!("conflict on direct write {}; awaiting decision", action.id),
                )
                .await;
                Ok(Submitted::Conflicted(conflict))
            }
            Err(err) => {
                debug!("Direct delivery of {} failed: {}", action.id, err);
                self.enqueue(action.clone()).await?;
                Ok(Submitted::Queued(action))
            }
        }
    }

    /// Deliver one action, retrying transient failures under the retry policy.
    ///
    /// When `queued`, every transport try is counted on the queued record.
    async fn deliver(&self, action: &QueuedAction, queued: bool) -> Result<DeliveryOutcome> {
        let mut retries = 0;
        loop {
            let outcome = self.transport.deliver(action).await;

            if queued {
                let error = outcome.as_ref().err().map(|e| e.to_string());
                let mut ledger = self.ledger.lock().await;
                if let Some(record) = ledger.queue.get_mut(&action.id) {
                    record.record_attempt(error);
                }
            }

            match outcome {
                Err(err) if err.is_transient() && self.retry.allows(retries) => {
                    let delay = self.retry.delay_for(retries);
                    retries += 1;
                    warn!(
                        "Delivery of {} failed (retry {}/{}): {}. Retrying in {:?}",
                        action.id, retries, self.retry.max_retries, err, delay
                    );
                    sleep(delay).await;
                }
                Ok(outcome) => {
                    if retries > 0 {
                        debug!("Delivered {} after {} retries", action.id, retries);
                    }
                    return Ok(outcome);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Replay every queued action against the transport, in capture order.
    ///
    /// Works on a snapshot taken at the start; actions captured meanwhile
    /// wait for the next run. Actions with a pending conflict are skipped.
    /// Per-action failures never abort the run and are reported through
    /// the result and the sync log.
    ///
    /// # Errors
    /// - `ReplayInProgress` if another run has not finished
    pub async fn replay(&self) -> Result<ReplayResult> {
        let _run = self
            .replay_lock
            .try_lock()
            .map_err(|_| Error::ReplayInProgress)?;
        let start = Instant::now();

        let (batch, queued) = {
            let mut ledger = self.ledger.lock().await;
            // Left behind by a run that was dropped mid-flight
            let recovered = ledger.queue.recover_interrupted();
            if recovered > 0 {
                warn!("Recovered {} actions from an interrupted replay", recovered);
            }
            let batch: Vec<QueuedAction> = ledger
                .queue
                .iter()
                .filter(|a| a.is_replayable() && !ledger.conflicts.contains(&a.id))
                .cloned()
                .collect();
            (batch, ledger.queue.len())
        };

        if queued == 0 {
            self.log(LogLevel::Info, "buffer verified empty").await;
            return Ok(ReplayResult {
                duration: start.elapsed(),
                ..Default::default()
            });
        }

        info!("Replaying {} of {} queued actions", batch.len(), queued);

        let mut result = ReplayResult::default();
        let mut failures: Vec<(ActionId, String)> = Vec::new();

        for action in batch {
            {
                let mut ledger = self.ledger.lock().await;
                match ledger.queue.get_mut(&action.id) {
                    Some(queued) => queued.mark_syncing(),
                    // Resolved or purged while this run was going
                    None => continue,
                }
            }
            self.log(LogLevel::Info, format!("handshaking: {}", action.action_type))
                .await;

            match self.deliver(&action, true).await {
                Ok(DeliveryOutcome::Delivered) => {
                    self.log(
                        LogLevel::Success,
                        format!("synced: {} ({})", action.action_type, action.id),
                    )
                    .await;
                    result.succeeded.push(action.id);
                }
                Ok(DeliveryOutcome::Conflict {
                    remote_version,
                    remote_data,
                }) => {
                    let conflict = SyncConflict::from_action(&action, remote_version, remote_data);
                    self.log(
                        LogLevel::Error,
                        format!(
                            "version conflict on {} (local v{}, remote v{})",
                            action.id, conflict.local_version, conflict.remote_version
                        ),
                    )
                    .await;
                    result.conflicted.push(conflict);
                }
                Err(err) => {
                    self.log(
                        LogLevel::Error,
                        format!("delivery failed for {}: {}", action.id, err),
                    )
                    .await;
                    failures.push((action.id, err.to_string()));
                }
            }
        }

        let pending_conflicts = {
            let mut ledger = self.ledger.lock().await;
            let Ledger { queue, conflicts } = &mut *ledger;

            for conflict in &result.conflicted {
                if let Some(action) = queue.get_mut(&conflict.id) {
                    action.mark_pending();
                    conflicts.insert(conflict.clone());
                }
            }
            for (id, message) in &failures {
                if let Some(action) = queue.get_mut(id) {
                    action.mark_failed(message.clone());
                }
            }

            if let Err(e) = queue.remove_many(&result.succeeded).await {
                error!("Failed to persist replay batch: {}", e);
            }
            if !result.conflicted.is_empty() {
                if let Err(e) = conflicts.persist().await {
                    warn!("Failed to persist conflicts: {}", e);
                }
            }

            result.remaining = queue.len();
            conflicts.len()
        };

        result.failed = failures.into_iter().map(|(id, _)| id).collect();
        result.duration = start.elapsed();

        self.events.publish(SyncEvent::QueueChanged {
            length: result.remaining,
        });
        if result.remaining == 0 {
            self.events.publish(SyncEvent::SyncComplete);
            self.log(LogLevel::Success, "sync complete: buffer drained").await;
        }
        if !result.conflicted.is_empty() {
            self.events.publish(SyncEvent::ConflictsPending {
                count: pending_conflicts,
            });
        }

        info!(
            "Replay completed in {:?}: {} synced, {} conflicts, {} failed, {} remaining",
            result.duration,
            result.succeeded.len(),
            result.conflicted.len(),
            result.failed.len(),
            result.remaining
        );

        Ok(result)
    }

    /// Apply a human decision to a pending conflict.
    ///
    /// Removes the conflict and its queued action. The winning data is
    /// returned for the owning collaborator to materialize; nothing is
    /// applied here.
    ///
    /// # Errors
    /// - `UnknownConflict` if no conflict is pending for `id`
    /// - `StorageWrite` if the queue could not be persisted; nothing changes
    pub async fn resolve(&self, id: &ActionId, resolution: Resolution) -> Result<Resolved> {
        let (conflict, length) = {
            let mut ledger = self.ledger.lock().await;
            let Ledger { queue, conflicts } = &mut *ledger;

            let (index, conflict) = conflicts
                .take(id)
                .ok_or_else(|| Error::UnknownConflict(id.to_string()))?;

            if let Err(err) = queue.remove(id).await {
                conflicts.restore(index, conflict);
                return Err(err);
            }
            if let Err(e) = conflicts.persist().await {
                // Reopening prunes conflicts without an action
                warn!("Failed to persist conflict set: {}", e);
            }
            (conflict, queue.len())
        };

        self.events.publish(SyncEvent::QueueChanged { length });
        self.log(
            LogLevel::Success,
            format!("resolved {}: kept {}", id, resolution.side()),
        )
        .await;
        if length == 0 {
            self.events.publish(SyncEvent::SyncComplete);
        }

        Ok(Resolved {
            conflict,
            resolution,
        })
    }

    /// Discard every queued action and pending conflict.
    ///
    /// Operator escape hatch; bypasses replay and adjudication entirely.
    /// Conflicts go first so a failure never leaves one without its action.
    ///
    /// # Errors
    /// - `StorageWrite` if either key could not be dropped; both are kept
    pub async fn purge(&self) -> Result<PurgeSummary> {
        let summary = {
            let mut ledger = self.ledger.lock().await;
            let Ledger { queue, conflicts } = &mut *ledger;

            let cleared = conflicts.clear().await?;
            let actions = match queue.clear().await {
                Ok(actions) => actions,
                Err(err) => {
                    conflicts.reinstate(cleared);
                    if let Err(e) = conflicts.persist().await {
                        warn!("Failed to restore conflicts after aborted purge: {}", e);
                    }
                    return Err(err);
                }
            };
            PurgeSummary {
                actions,
                conflicts: cleared.len(),
            }
        };

        self.events.publish(SyncEvent::QueueChanged { length: 0 });
        self.log(
            LogLevel::Info,
            format!(
                "queue purged: {} actions and {} conflicts discarded",
                summary.actions, summary.conflicts
            ),
        )
        .await;
        Ok(summary)
    }

    /// Feed the host's reachability signal.
    ///
    /// On a transition to `Online` with a non-empty queue, one replay is
    /// spawned (unless disabled in the config). Overlapping replays from
    /// flapping are rejected by the engine and only logged.
    ///
    /// # Returns
    /// `None` when the state did not change.
    pub async fn set_online(self: &Arc<Self>, online: bool) -> Option<ConnectivityTransition> {
        if !self.connectivity.set_online(online) {
            return None;
        }
        let state = self.connectivity.state();
        self.events
            .publish(SyncEvent::ConnectivityChanged { state });

        if state == ConnectivityState::Offline {
            self.log(LogLevel::Info, "connection lost; buffering actions locally")
                .await;
            return Some(ConnectivityTransition {
                state,
                replay: None,
            });
        }

        let queued = self.queue_len().await;
        self.log(
            LogLevel::Info,
            format!("connection restored; {} actions buffered", queued),
        )
        .await;

        let replay = if queued > 0 && self.config.auto_replay_on_reconnect {
            let engine = Arc::clone(self);
            Some(tokio::spawn(async move {
                let result = engine.replay().await;
                if let Err(Error::ReplayInProgress) = &result {
                    debug!("Reconnect replay skipped: another run is in progress");
                }
                result
            }))
        } else {
            None
        };

        Some(ConnectivityTransition { state, replay })
    }
}
