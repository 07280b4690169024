//! Remote delivery transports.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use deferq_common::{ActionId, Error, Result};

use crate::state::QueuedAction;

/// Non-failing outcome of a delivery attempt.
///
/// Together with `Err(Error::TransientDelivery)` this forms the three-way
/// delivery contract: delivered, conflicted, or transiently failed.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// The remote system accepted the write.
    Delivered,
    /// The remote entity moved past the action's revision.
    Conflict {
        /// Remote revision, when the remote system reports one.
        remote_version: Option<u64>,
        /// Remote representation of the entity.
        remote_data: Value,
    },
}

/// Transport delivering queued actions to the remote system of record.
///
/// Implementations enforce their own per-call timeout; a call that never
/// returns leaves the action marked `Syncing` until the next run starts.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Transport name for logs (e.g., "simulated", "scripted").
    fn name(&self) -> &str;

    /// Attempt to deliver one action.
    ///
    /// # Errors
    /// - `Error::TransientDelivery` (or `Error::Io`) when the attempt failed
    ///   without a verdict; the action stays queued
    async fn deliver(&self, action: &QueuedAction) -> Result<DeliveryOutcome>;
}

/// Longest simulated round trip accepted, in milliseconds.
pub const MAX_SIMULATED_LATENCY_MS: u64 = 60_000;

/// Knobs for [`SimulatedTransport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Lower bound of the simulated round trip, in milliseconds.
    pub min_latency_ms: u64,
    /// Upper bound of the simulated round trip, in milliseconds.
    pub max_latency_ms: u64,
    /// Probability in `[0, 1]` that a delivery reports a version conflict.
    pub conflict_probability: f64,
    /// Probability in `[0, 1]` that a delivery fails transiently.
    pub failure_probability: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            min_latency_ms: 200,
            max_latency_ms: 800,
            conflict_probability: 0.2,
            failure_probability: 0.0,
        }
    }
}

impl SimulationConfig {
    /// Validate probabilities and latency bounds.
    pub fn validate(&self) -> Result<()> {
        for (name, p) in [
            ("conflict_probability", self.conflict_probability),
            ("failure_probability", self.failure_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::InvalidInput(format!(
                    "{} must be within [0, 1], got {}",
                    name, p
                )));
            }
        }
        if self.conflict_probability + self.failure_probability > 1.0 {
            return Err(Error::InvalidInput(
                "conflict_probability + failure_probability must not exceed 1".to_string(),
            ));
        }
        if self.min_latency_ms > self.max_latency_ms {
            return Err(Error::InvalidInput(
                "min_latency_ms must not exceed max_latency_ms".to_string(),
            ));
        }
        if self.max_latency_ms > MAX_SIMULATED_LATENCY_MS {
            return Err(Error::InvalidInput(format!(
                "max_latency_ms must not exceed {}, got {}",
                MAX_SIMULATED_LATENCY_MS, self.max_latency_ms
            )));
        }
        Ok(())
    }
}

/// Stand-in for a real backend: random latency and a random verdict.
pub struct SimulatedTransport {
    config: SimulationConfig,
}

impl SimulatedTransport {
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    fn latency(&self) -> Duration {
        let span = self.config.max_latency_ms - self.config.min_latency_ms;
        let jitter = if span == 0 {
            0
        } else {
            rand::random::<u64>() % (span + 1)
        };
        Duration::from_millis(self.config.min_latency_ms + jitter)
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self {
            config: SimulationConfig::default(),
        }
    }
}

#[async_trait]
impl DeliveryTransport for SimulatedTransport {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn deliver(&self, action: &QueuedAction) -> Result<DeliveryOutcome> {
        sleep(self.latency()).await;

        let draw = rand::random::<f64>();
        if draw < self.config.failure_probability {
            debug!("Simulated timeout for {}", action.id);
            return Err(Error::TransientDelivery(format!(
                "simulated timeout delivering {}",
                action.id
            )));
        }

        if draw < self.config.failure_probability + self.config.conflict_probability {
            debug!("Simulated conflict for {}", action.id);
            return Ok(DeliveryOutcome::Conflict {
                remote_version: None,
                remote_data: json!({
                    "source": "remote",
                    "payload": action.payload.clone(),
                    "modifiedAt": Utc::now(),
                }),
            });
        }

        Ok(DeliveryOutcome::Delivered)
    }
}

/// Scripted verdict for [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum Scripted {
    Deliver,
    Conflict { remote_version: Option<u64>, remote_data: Value },
    Fail(String),
}

impl Scripted {
    /// Conflict without a reported remote revision or data.
    pub fn conflict() -> Self {
        Scripted::Conflict {
            remote_version: None,
            remote_data: Value::Null,
        }
    }
}

/// Deterministic transport for tests and demos.
///
/// Verdicts are queued per action id and consumed one per attempt; ids
/// without a script get the default verdict. Every attempt is recorded in
/// order.
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<ActionId, VecDeque<Scripted>>>,
    default: Scripted,
    attempts: Mutex<Vec<ActionId>>,
    latency: Duration,
}

impl ScriptedTransport {
    /// Transport that delivers everything not scripted otherwise.
    pub fn new() -> Self {
        Self::with_default(Scripted::Deliver)
    }

    /// Transport with a custom default verdict.
    pub fn with_default(default: Scripted) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default,
            attempts: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    /// Delay every delivery by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue verdicts for the next attempts on `id`.
    pub fn script(&self, id: &ActionId, verdicts: impl IntoIterator<Item = Scripted>) -> Result<()> {
        let mut scripts = self
            .scripts
            .lock()
            .map_err(|_| Error::InvalidInput("Script lock poisoned".to_string()))?;
        scripts.entry(id.clone()).or_default().extend(verdicts);
        Ok(())
    }

    /// Ids attempted so far, in attempt order.
    pub fn attempts(&self) -> Vec<ActionId> {
        self.attempts
            .lock()
            .map(|attempts| attempts.clone())
            .unwrap_or_default()
    }

    fn next_verdict(&self, id: &ActionId) -> Result<Scripted> {
        let mut scripts = self
            .scripts
            .lock()
            .map_err(|_| Error::TransientDelivery("Script lock poisoned".to_string()))?;
        Ok(scripts
            .get_mut(id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default.clone()))
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn deliver(&self, action: &QueuedAction) -> Result<DeliveryOutcome> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(action.id.clone());
        }
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        match self.next_verdict(&action.id)? {
            Scripted::Deliver => Ok(DeliveryOutcome::Delivered),
            Scripted::Conflict {
                remote_version,
                remote_data,
            } => Ok(DeliveryOutcome::Conflict {
                remote_version,
                remote_data,
            }),
            Scripted::Fail(message) => Err(Error::TransientDelivery(message)),
        }
    }
}
