//! Deferq Sync Engine
//!
//! Offline action queue with replay and conflict reconciliation:
//! - Durable FIFO queue of actions captured while disconnected
//! - Connectivity tracking with replay on reconnect
//! - Replay against a pluggable delivery transport
//! - Version conflict detection and human adjudication
//! - Retry strategy with exponential backoff
//! - Manual and periodic replay scheduling

pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod events;
pub mod log;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod transport;

// Re-export main types
pub use conflict::{entity_type_for, ConflictSet, Resolution, Resolved, SyncConflict};
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use engine::{
    ConnectivityTransition, PurgeSummary, ReplayResult, Submitted, SyncConfig, SyncEngine,
};
pub use events::{EventBus, SyncEvent};
pub use log::{LogLevel, SyncLog, SyncLogEntry};
pub use queue::QueueStore;
pub use retry::RetryPolicy;
pub use scheduler::{ReplayMode, ReplayRequest, ReplayScheduler, ReplaySchedulerHandle};
pub use state::{LifecycleState, QueuedAction, DEFAULT_VERSION};
pub use transport::{
    DeliveryOutcome, DeliveryTransport, Scripted, ScriptedTransport, SimulatedTransport,
    SimulationConfig, MAX_SIMULATED_LATENCY_MS,
};
