//! Queued action records and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use deferq_common::ActionId;

/// Revision assigned to an action when the caller does not declare one.
pub const DEFAULT_VERSION: u64 = 1;

/// Lifecycle of a queued action.
///
/// `Pending → Syncing → {removed | Pending | Failed}`. Both `Pending` and
/// `Failed` are eligible for the next replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Waiting for replay.
    #[default]
    Pending,
    /// A delivery attempt is in flight.
    Syncing,
    /// The last delivery attempt failed transiently.
    Failed,
}

impl LifecycleState {
    /// Whether an action in this state may be picked up by a replay run.
    pub fn is_replayable(&self) -> bool {
        matches!(self, LifecycleState::Pending | LifecycleState::Failed)
    }
}

/// A deferred write captured while the remote system was unreachable.
///
/// Persisted as one element of the queue's JSON array. Every field except
/// `id` and `type` is defaulted on read so records written by older
/// producers still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    /// Unique, stable identifier.
    pub id: ActionId,
    /// Business operation tag, opaque to the queue.
    #[serde(rename = "type")]
    pub action_type: String,
    /// Opaque structured payload.
    #[serde(default)]
    pub payload: Value,
    /// When the action was captured.
    #[serde(default = "Utc::now")]
    pub captured_at: DateTime<Utc>,
    /// Current lifecycle state.
    #[serde(default)]
    pub lifecycle_state: LifecycleState,
    /// Local revision of the entity this action mutates.
    #[serde(default = "default_version")]
    pub version: u64,
    /// Transport tries made so far, retries included.
    #[serde(default)]
    pub attempts: u32,
    /// Message of the last transient failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn default_version() -> u64 {
    DEFAULT_VERSION
}

impl QueuedAction {
    /// Create a new pending action captured now.
    pub fn new(id: ActionId, action_type: impl Into<String>, payload: Value, version: u64) -> Self {
        Self {
            id,
            action_type: action_type.into(),
            payload,
            captured_at: Utc::now(),
            lifecycle_state: LifecycleState::Pending,
            version,
            attempts: 0,
            last_error: None,
        }
    }

    /// Mark as syncing.
    pub fn mark_syncing(&mut self) {
        self.lifecycle_state = LifecycleState::Syncing;
    }

    /// Count one transport try, keeping the failure message if it failed.
    pub fn record_attempt(&mut self, error: Option<String>) {
        self.attempts = self.attempts.saturating_add(1);
        if error.is_some() {
            self.last_error = error;
        }
    }

    /// Return to pending (conflict awaiting adjudication, or crash recovery).
    pub fn mark_pending(&mut self) {
        self.lifecycle_state = LifecycleState::Pending;
    }

    /// Mark as failed after a transient delivery failure.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.lifecycle_state = LifecycleState::Failed;
        self.last_error = Some(error.into());
    }

    /// Whether a replay run may attempt this action.
    pub fn is_replayable(&self) -> bool {
        self.lifecycle_state.is_replayable()
    }
}
