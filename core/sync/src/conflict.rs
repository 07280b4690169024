//! Conflict detection records and the pending conflict set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use deferq_common::{ActionId, Error, Result};
use deferq_storage::KeyValueStore;

use crate::queue::QueueStore;
use crate::state::QueuedAction;

/// Human decision on a conflicting write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// Keep the locally captured version.
    KeepLocal,
    /// Accept the version held by the remote system.
    AcceptRemote,
}

impl Resolution {
    /// Audit label for the chosen side.
    pub fn side(&self) -> &'static str {
        match self {
            Resolution::KeepLocal => "Local Client",
            Resolution::AcceptRemote => "Cloud Master",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::KeepLocal => write!(f, "keep-local"),
            Resolution::AcceptRemote => write!(f, "accept-remote"),
        }
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keep-local" | "local" => Ok(Resolution::KeepLocal),
            "accept-remote" | "remote" => Ok(Resolution::AcceptRemote),
            other => Err(Error::InvalidInput(format!(
                "Unknown resolution '{}'; use keep-local or accept-remote",
                other
            ))),
        }
    }
}

/// A version mismatch detected while replaying a queued action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    /// Id of the originating queued action.
    pub id: ActionId,
    /// Type of the originating action.
    pub action_type: String,
    /// Classification of the entity in conflict.
    pub entity_type: String,
    /// Revision the action was captured against.
    pub local_version: u64,
    /// Revision held by the remote system; always greater than `local_version`.
    pub remote_version: u64,
    /// Locally captured representation.
    pub local_data: Value,
    /// Remote representation.
    pub remote_data: Value,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

impl SyncConflict {
    /// Build a conflict for `action`.
    ///
    /// A missing remote revision, or one that is not ahead of the local
    /// one, is replaced by `local_version + 1`.
    pub fn from_action(action: &QueuedAction, remote_version: Option<u64>, remote_data: Value) -> Self {
        let local_version = action.version;
        let remote_version = match remote_version {
            Some(remote) if remote > local_version => remote,
            Some(remote) => {
                warn!(
                    "Remote revision {} for {} is not ahead of local {}",
                    remote, action.id, local_version
                );
                local_version + 1
            }
            None => local_version + 1,
        };

        Self {
            id: action.id.clone(),
            action_type: action.action_type.clone(),
            entity_type: entity_type_for(&action.action_type),
            local_version,
            remote_version,
            local_data: action.payload.clone(),
            remote_data,
            detected_at: Utc::now(),
        }
    }
}

/// A conflict removed from the pending set together with the decision taken.
///
/// Materializing the winning side into application state is up to the
/// collaborator that owns the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolved {
    pub conflict: SyncConflict,
    pub resolution: Resolution,
}

impl Resolved {
    /// Data of the side the adjudicator chose.
    pub fn winning_data(&self) -> &Value {
        match self.resolution {
            Resolution::KeepLocal => &self.conflict.local_data,
            Resolution::AcceptRemote => &self.conflict.remote_data,
        }
    }
}

/// Derive the entity classification from an action type.
///
/// Lowercased leading segment before the first `.`, `:`, `/`, `_` or `-`;
/// e.g. `grade.update` → `grade`, `ENROLL_STUDENT` → `enroll`.
pub fn entity_type_for(action_type: &str) -> String {
    let trimmed = action_type.trim();
    let head = trimmed
        .split(['.', ':', '/', '_', '-'])
        .find(|segment| !segment.is_empty())
        .unwrap_or(trimmed);
    head.to_lowercase()
}

/// Conflicts awaiting a human decision, in detection order.
///
/// Persisted under its own key so adjudication survives restarts. A
/// conflict is only meaningful while its action is queued, so loading
/// drops conflicts whose action is gone.
pub struct ConflictSet {
    store: Arc<dyn KeyValueStore>,
    key: String,
    conflicts: Vec<SyncConflict>,
}

impl ConflictSet {
    /// Open the conflict set persisted under `key`, pruned against `queue`.
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        queue: &QueueStore,
    ) -> Result<Self> {
        let key = key.into();

        let mut conflicts: Vec<SyncConflict> = match store.get(&key).await? {
            Some(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            _ => Vec::new(),
        };

        let before = conflicts.len();
        conflicts.retain(|c| queue.contains(&c.id));
        if conflicts.len() != before {
            debug!("Pruned {} orphaned conflicts", before - conflicts.len());
        }

        Ok(Self {
            store,
            key,
            conflicts,
        })
    }

    /// Add a conflict, replacing any earlier one for the same action.
    pub fn insert(&mut self, conflict: SyncConflict) {
        match self.conflicts.iter().position(|c| c.id == conflict.id) {
            Some(index) => self.conflicts[index] = conflict,
            None => self.conflicts.push(conflict),
        }
    }

    /// Take a conflict out of the set, returning its position for [`ConflictSet::restore`].
    pub fn take(&mut self, id: &ActionId) -> Option<(usize, SyncConflict)> {
        let index = self.conflicts.iter().position(|c| &c.id == id)?;
        Some((index, self.conflicts.remove(index)))
    }

    /// Put a taken conflict back where it was.
    pub fn restore(&mut self, index: usize, conflict: SyncConflict) {
        let index = index.min(self.conflicts.len());
        self.conflicts.insert(index, conflict);
    }

    /// Get a conflict by action id.
    pub fn get(&self, id: &ActionId) -> Option<&SyncConflict> {
        self.conflicts.iter().find(|c| &c.id == id)
    }

    /// Check whether an action has a pending conflict.
    pub fn contains(&self, id: &ActionId) -> bool {
        self.get(id).is_some()
    }

    /// Copy of all pending conflicts.
    pub fn snapshot(&self) -> Vec<SyncConflict> {
        self.conflicts.clone()
    }

    /// Number of pending conflicts.
    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    /// Check if no conflicts are pending.
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Drop every conflict and the stored key.
    ///
    /// # Returns
    /// The dropped conflicts, for [`ConflictSet::reinstate`].
    pub async fn clear(&mut self) -> Result<Vec<SyncConflict>> {
        let previous = std::mem::take(&mut self.conflicts);
        if let Err(err) = self.store.remove(&self.key).await {
            self.conflicts = previous;
            return Err(err);
        }
        Ok(previous)
    }

    /// Put back conflicts returned by [`ConflictSet::clear`], ahead of any added since.
    pub fn reinstate(&mut self, conflicts: Vec<SyncConflict>) {
        let added = std::mem::replace(&mut self.conflicts, conflicts);
        for conflict in added {
            self.insert(conflict);
        }
    }

    /// Persist the current set.
    pub async fn persist(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.conflicts)?;
        self.store.put(&self.key, json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DEFAULT_VERSION;
    use deferq_storage::MemoryStore;
    use serde_json::json;

    fn action(id: &str, version: u64) -> QueuedAction {
        QueuedAction::new(
            ActionId::new(id).unwrap(),
            "grade.update",
            json!({"grade": "B"}),
            version,
        )
    }

    #[test]
    fn test_entity_type_derivation() {
        assert_eq!(entity_type_for("grade.update"), "grade");
        assert_eq!(entity_type_for("ENROLL_STUDENT"), "enroll");
        assert_eq!(entity_type_for("invoice:pay"), "invoice");
        assert_eq!(entity_type_for("hr/record-edit"), "hr");
        assert_eq!(entity_type_for("Payment"), "payment");
        assert_eq!(entity_type_for("_leading"), "leading");
    }

    #[test]
    fn test_synthetic_remote_version() {
        let conflict = SyncConflict::from_action(&action("a1", DEFAULT_VERSION), None, Value::Null);
        assert_eq!(conflict.local_version, 1);
        assert_eq!(conflict.remote_version, 2);
        assert_eq!(conflict.entity_type, "grade");
        assert_eq!(conflict.local_data, json!({"grade": "B"}));
    }

    #[test]
    fn test_reported_remote_version() {
        let conflict = SyncConflict::from_action(&action("a1", 3), Some(7), json!({"grade": "C"}));
        assert_eq!(conflict.local_version, 3);
        assert_eq!(conflict.remote_version, 7);
    }

    #[test]
    fn test_stale_remote_version_is_bumped() {
        let conflict = SyncConflict::from_action(&action("a1", 5), Some(2), Value::Null);
        assert_eq!(conflict.remote_version, 6);
    }

    #[test]
    fn test_resolution_labels_and_parsing() {
        assert_eq!(Resolution::KeepLocal.side(), "Local Client");
        assert_eq!(Resolution::AcceptRemote.side(), "Cloud Master");
        assert_eq!("keep-local".parse::<Resolution>().unwrap(), Resolution::KeepLocal);
        assert_eq!("remote".parse::<Resolution>().unwrap(), Resolution::AcceptRemote);
        assert!("both".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_winning_data() {
        let conflict = SyncConflict::from_action(&action("a1", 1), None, json!({"grade": "C"}));
        let resolved = Resolved {
            conflict: conflict.clone(),
            resolution: Resolution::AcceptRemote,
        };
        assert_eq!(resolved.winning_data(), &json!({"grade": "C"}));
    }

    #[tokio::test]
    async fn test_take_and_restore() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = QueueStore::open(store.clone(), "q").await.unwrap();
        let mut set = ConflictSet::open(store, "q.conflicts", &queue).await.unwrap();

        set.insert(SyncConflict::from_action(&action("a1", 1), None, Value::Null));
        set.insert(SyncConflict::from_action(&action("a2", 1), None, Value::Null));

        let (index, conflict) = set.take(&ActionId::new("a1").unwrap()).unwrap();
        assert_eq!(index, 0);
        assert_eq!(set.len(), 1);
        assert!(set.take(&ActionId::new("a1").unwrap()).is_none());

        set.restore(index, conflict);
        let order: Vec<String> = set.snapshot().iter().map(|c| c.id.to_string()).collect();
        assert_eq!(order, vec!["a1", "a2"]);
    }

    #[tokio::test]
    async fn test_insert_replaces_same_action() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = QueueStore::open(store.clone(), "q").await.unwrap();
        let mut set = ConflictSet::open(store, "q.conflicts", &queue).await.unwrap();

        set.insert(SyncConflict::from_action(&action("a1", 1), None, Value::Null));
        set.insert(SyncConflict::from_action(&action("a1", 1), Some(9), Value::Null));

        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&ActionId::new("a1").unwrap()).unwrap().remote_version, 9);
    }

    #[tokio::test]
    async fn test_open_prunes_orphans() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut queue = QueueStore::open(store.clone(), "q").await.unwrap();
        queue.append(action("kept", 1)).await.unwrap();

        {
            let mut set = ConflictSet::open(store.clone(), "q.conflicts", &queue).await.unwrap();
            set.insert(SyncConflict::from_action(&action("kept", 1), None, Value::Null));
            set.insert(SyncConflict::from_action(&action("gone", 1), None, Value::Null));
            set.persist().await.unwrap();
        }

        let set = ConflictSet::open(store, "q.conflicts", &queue).await.unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&ActionId::new("kept").unwrap()));
    }

    #[tokio::test]
    async fn test_clear_and_reinstate() {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn KeyValueStore> = memory.clone();
        let queue = QueueStore::open(store.clone(), "q").await.unwrap();
        let mut set = ConflictSet::open(store.clone(), "q.conflicts", &queue).await.unwrap();
        set.insert(SyncConflict::from_action(&action("a1", 1), None, Value::Null));
        set.insert(SyncConflict::from_action(&action("a2", 1), None, Value::Null));
        set.persist().await.unwrap();

        memory.set_fail_writes(true);
        assert!(set.clear().await.is_err());
        assert_eq!(set.len(), 2);

        memory.set_fail_writes(false);
        let cleared = set.clear().await.unwrap();
        assert_eq!(cleared.len(), 2);
        assert!(set.is_empty());
        assert_eq!(store.get("q.conflicts").await.unwrap(), None);

        set.insert(SyncConflict::from_action(&action("a3", 1), None, Value::Null));
        set.reinstate(cleared);
        let order: Vec<String> = set.snapshot().iter().map(|c| c.id.to_string()).collect();
        assert_eq!(order, vec!["a1", "a2", "a3"]);
    }
}
