//! Connectivity state tracking.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

/// Reachability of the remote system of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn from_online(online: bool) -> Self {
        if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Online => write!(f, "online"),
            ConnectivityState::Offline => write!(f, "offline"),
        }
    }
}

/// Process-wide connectivity state fed by the host's reachability signal.
///
/// Hosts feed it through `SyncEngine::set_online`, which owns the
/// reconnect replay; the monitor itself is read-only outside the crate.
/// The current state is readable synchronously; transitions can be
/// observed through [`ConnectivityMonitor::subscribe`]. Only real
/// transitions wake subscribers.
pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    /// Create a monitor starting in `initial`.
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Current state.
    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    /// Whether the remote system is currently considered reachable.
    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    /// Record a reachability change.
    ///
    /// # Returns
    /// `true` if this changed the state.
    pub(crate) fn set_online(&self, online: bool) -> bool {
        let next = ConnectivityState::from_online(online);
        let changed = self.tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!("Connectivity changed to {}", next);
        }
        changed
    }

    /// Observe transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Offline)
    }
}
