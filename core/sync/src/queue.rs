//! Durable queue store for captured actions.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use deferq_common::{ActionId, Error, Result};
use deferq_storage::KeyValueStore;

use crate::state::{LifecycleState, QueuedAction};

/// Ordered, persisted list of queued actions.
///
/// The whole list is written under a single storage key after every
/// mutation. The in-memory list mirrors what was last written, except
/// for `Syncing` markers, which only live in memory until the replay run
/// that set them commits its batch.
pub struct QueueStore {
    /// Backing key-value store.
    store: Arc<dyn KeyValueStore>,
    /// Key the queue is persisted under.
    key: String,
    /// Actions in capture order.
    actions: Vec<QueuedAction>,
}

impl QueueStore {
    /// Open the queue persisted under `key`, or start an empty one.
    ///
    /// Actions persisted as `Syncing` belong to a run that never finished
    /// and come back as `Pending`. Duplicate ids keep their first record.
    pub async fn open(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Result<Self> {
        let key = key.into();

        let mut actions: Vec<QueuedAction> = match store.get(&key).await? {
            Some(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            _ => Vec::new(),
        };

        let mut seen = HashSet::new();
        actions.retain(|action| {
            let fresh = seen.insert(action.id.clone());
            if !fresh {
                warn!("Dropping duplicate queued action {}", action.id);
            }
            fresh
        });

        let mut queue = Self {
            store,
            key,
            actions,
        };
        queue.recover_interrupted();

        debug!("Opened queue '{}' with {} actions", queue.key, queue.len());
        Ok(queue)
    }

    /// Return actions left `Syncing` by a run that never finished to `Pending`.
    ///
    /// Only valid while no replay run is in flight.
    pub fn recover_interrupted(&mut self) -> usize {
        let mut recovered = 0;
        for action in self.actions.iter_mut() {
            if action.lifecycle_state == LifecycleState::Syncing {
                debug!("Recovering interrupted action {}", action.id);
                action.mark_pending();
                recovered += 1;
            }
        }
        recovered
    }

    /// Storage key of this queue.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append an action and persist.
    ///
    /// # Errors
    /// - `AlreadyExists` if an action with the same id is queued
    /// - `StorageWrite` if the store rejects the write; the action is not kept
    pub async fn append(&mut self, action: QueuedAction) -> Result<()> {
        if self.contains(&action.id) {
            return Err(Error::AlreadyExists(format!(
                "Action already queued: {}",
                action.id
            )));
        }

        self.actions.push(action);
        if let Err(err) = self.persist().await {
            self.actions.pop();
            return Err(err);
        }
        Ok(())
    }

    /// Remove one action and persist.
    ///
    /// On a failed write the action is put back and the error returned.
    pub async fn remove(&mut self, id: &ActionId) -> Result<Option<QueuedAction>> {
        let Some(index) = self.position(id) else {
            return Ok(None);
        };

        let action = self.actions.remove(index);
        if let Err(err) = self.persist().await {
            self.actions.insert(index, action);
            return Err(err);
        }
        Ok(Some(action))
    }

    /// Remove every listed action and persist the resulting list in one write.
    ///
    /// The write also carries any in-memory updates made through
    /// [`QueueStore::get_mut`]. Missing ids are ignored. The in-memory list
    /// stays updated even if the write fails; the next successful write
    /// brings storage back in line.
    pub async fn remove_many(&mut self, ids: &[ActionId]) -> Result<usize> {
        let doomed: HashSet<&ActionId> = ids.iter().collect();
        let before = self.actions.len();
        self.actions.retain(|action| !doomed.contains(&action.id));
        let removed = before - self.actions.len();

        self.persist().await?;
        Ok(removed)
    }

    /// Remove every action and drop the stored key.
    pub async fn clear(&mut self) -> Result<usize> {
        let previous = std::mem::take(&mut self.actions);
        if let Err(err) = self.store.remove(&self.key).await {
            self.actions = previous;
            return Err(err);
        }
        Ok(previous.len())
    }

    /// Get an action by id.
    pub fn get(&self, id: &ActionId) -> Option<&QueuedAction> {
        self.actions.iter().find(|a| &a.id == id)
    }

    /// Get a mutable action by id. Changes are in memory until the next write.
    pub fn get_mut(&mut self, id: &ActionId) -> Option<&mut QueuedAction> {
        self.actions.iter_mut().find(|a| &a.id == id)
    }

    /// Check whether an action is queued.
    pub fn contains(&self, id: &ActionId) -> bool {
        self.position(id).is_some()
    }

    /// Point-in-time copy of the queue in capture order.
    pub fn snapshot(&self) -> Vec<QueuedAction> {
        self.actions.clone()
    }

    /// Iterate the queue in capture order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedAction> {
        self.actions.iter()
    }

    /// Number of queued actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    fn position(&self, id: &ActionId) -> Option<usize> {
        self.actions.iter().position(|a| &a.id == id)
    }

    /// Persist the current list.
    pub async fn persist(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.actions)?;
        self.store.put(&self.key, json).await
    }
}
