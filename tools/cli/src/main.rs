//! Deferq CLI - Command line interface for the offline action queue.
//!
//! Every invocation opens the queue from the data directory, runs one
//! command and exits. Replays go through a simulated remote system so the
//! reconciliation flow can be exercised without a backend.

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use deferq_common::ActionId;
use deferq_storage::{create_default_registry, KeyValueStore, LocalStore};
use deferq_sync::{
    DeliveryTransport, Resolution, Scripted, ScriptedTransport, SimulatedTransport,
    SimulationConfig, SyncConfig, SyncEngine,
};

#[derive(Parser)]
#[command(name = "deferq")]
#[command(about = "Deferq - Offline action queue and sync reconciliation")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the persisted queue.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON file with engine settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Storage backend: "local" or "memory".
    #[arg(long, global = true, default_value = "local")]
    store: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture an action into the offline queue.
    Capture {
        /// Action type, e.g. "grade.update".
        #[arg(short = 't', long = "type")]
        action_type: String,

        /// JSON payload.
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Explicit action id (generated if omitted).
        #[arg(long)]
        id: Option<String>,

        /// Local revision of the target entity.
        #[arg(long, default_value_t = 1)]
        version: u64,
    },

    /// List queued actions in replay order.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Show queue and conflict counts.
    Status,

    /// Go online and replay the queue against a simulated remote.
    Replay {
        /// Probability that a delivery conflicts.
        #[arg(long, default_value_t = 0.2)]
        conflict_rate: f64,

        /// Probability that a delivery fails transiently.
        #[arg(long, default_value_t = 0.0)]
        failure_rate: f64,

        /// Minimum simulated latency in milliseconds.
        #[arg(long, default_value_t = 200)]
        min_latency_ms: u64,

        /// Maximum simulated latency in milliseconds.
        #[arg(long, default_value_t = 800)]
        max_latency_ms: u64,
    },

    /// List conflicts awaiting a decision.
    Conflicts {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Resolve a pending conflict.
    Resolve {
        /// Id of the conflicting action.
        #[arg(long)]
        id: String,

        /// "keep-local" or "accept-remote".
        #[arg(long)]
        keep: Resolution,
    },

    /// Discard every queued action and conflict.
    Purge {
        /// Confirm the purge.
        #[arg(long)]
        yes: bool,
    },

    /// Walk through capture, conflicting replay and resolution in memory.
    Demo,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Capture {
            action_type,
            payload,
            id,
            version,
        } => {
            let store = open_store(&cli.store, cli.data_dir.as_ref())?;
            cmd_capture(store, config, &action_type, &payload, id, version).await
        }

        Commands::List { json } => {
            let store = open_store(&cli.store, cli.data_dir.as_ref())?;
            cmd_list(store, config, json).await
        }

        Commands::Status => {
            let store = open_store(&cli.store, cli.data_dir.as_ref())?;
            cmd_status(store, config).await
        }

        Commands::Replay {
            conflict_rate,
            failure_rate,
            min_latency_ms,
            max_latency_ms,
        } => {
            let store = open_store(&cli.store, cli.data_dir.as_ref())?;
            let simulation = SimulationConfig {
                min_latency_ms,
                max_latency_ms,
                conflict_probability: conflict_rate,
                failure_probability: failure_rate,
            };
            cmd_replay(store, config, simulation).await
        }

        Commands::Conflicts { json } => {
            let store = open_store(&cli.store, cli.data_dir.as_ref())?;
            cmd_conflicts(store, config, json).await
        }

        Commands::Resolve { id, keep } => {
            let store = open_store(&cli.store, cli.data_dir.as_ref())?;
            cmd_resolve(store, config, &id, keep).await
        }

        Commands::Purge { yes } => {
            let store = open_store(&cli.store, cli.data_dir.as_ref())?;
            cmd_purge(store, config, yes).await
        }

        Commands::Demo => cmd_demo(config).await,

        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "deferq", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let raw = std::fs::read(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("Invalid config file {}", path.display()))
}

fn open_store(name: &str, data_dir: Option<&PathBuf>) -> Result<Arc<dyn KeyValueStore>> {
    let registry = create_default_registry().context("Failed to set up store registry")?;
    let store_config = match name {
        "local" => {
            let root = match data_dir {
                Some(dir) => dir.clone(),
                None => LocalStore::default_root()
                    .context("No data directory available; pass --data-dir")?,
            };
            debug!("Using data directory {}", root.display());
            let root = root
                .to_str()
                .context("Data directory path is not valid UTF-8")?;
            json!({ "root": root })
        }
        _ => Value::Null,
    };

    registry
        .resolve(name, store_config)
        .with_context(|| format!("Failed to open '{}' store", name))
}

async fn open_engine<T>(
    store: Arc<dyn KeyValueStore>,
    transport: T,
    config: SyncConfig,
) -> Result<Arc<SyncEngine<T>>>
where
    T: DeliveryTransport + 'static,
{
    let engine = SyncEngine::open(store, transport, config)
        .await
        .context("Failed to open offline queue")?;
    Ok(Arc::new(engine))
}

async fn cmd_capture(
    store: Arc<dyn KeyValueStore>,
    config: SyncConfig,
    action_type: &str,
    payload: &str,
    id: Option<String>,
    version: u64,
) -> Result<()> {
    let payload: Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let id = id.map(ActionId::new).transpose().context("Invalid action id")?;

    let engine = open_engine(store, SimulatedTransport::default(), config).await?;
    let action = engine
        .capture_versioned(id, action_type, payload, version)
        .await
        .context("Failed to capture action")?;

    println!("Captured {} ({})", action.id, action.action_type);
    println!("Queued: {}", engine.queue_len().await);
    Ok(())
}

async fn cmd_list(store: Arc<dyn KeyValueStore>, config: SyncConfig, json: bool) -> Result<()> {
    let engine = open_engine(store, SimulatedTransport::default(), config).await?;
    let actions = engine.queue_snapshot().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&actions)?);
        return Ok(());
    }

    if actions.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }

    println!(
        "{:<32} {:<24} {:>4} {:<8} {:>8}  CAPTURED",
        "ID", "TYPE", "VER", "STATE", "ATTEMPTS"
    );
    for action in actions {
        println!(
            "{:<32} {:<24} {:>4} {:<8} {:>8}  {}",
            action.id,
            action.action_type,
            action.version,
            format!("{:?}", action.lifecycle_state),
            action.attempts,
            action.captured_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(err) = &action.last_error {
            println!("    last error: {}", err);
        }
    }
    Ok(())
}

async fn cmd_status(store: Arc<dyn KeyValueStore>, config: SyncConfig) -> Result<()> {
    let backend = store.name().to_string();
    let engine = open_engine(store, SimulatedTransport::default(), config).await?;

    println!("Store:      {} ({})", backend, engine.config().storage_key);
    println!("Queued:     {}", engine.queue_len().await);
    println!("Conflicts:  {}", engine.conflicts().await.len());
    Ok(())
}

async fn cmd_replay(
    store: Arc<dyn KeyValueStore>,
    config: SyncConfig,
    simulation: SimulationConfig,
) -> Result<()> {
    let transport = SimulatedTransport::new(simulation).context("Invalid simulation settings")?;
    let engine = open_engine(store, transport, config).await?;

    let transition = engine.set_online(true).await;
    let result = match transition.and_then(|t| t.replay) {
        Some(replay) => replay.await.context("Replay task panicked")?,
        None => engine.replay().await,
    }
    .context("Replay failed")?;

    println!(
        "Replay finished in {:?}: {} synced, {} conflicts, {} failed, {} remaining",
        result.duration,
        result.succeeded.len(),
        result.conflicted.len(),
        result.failed.len(),
        result.remaining
    );
    for conflict in &result.conflicted {
        println!(
            "  conflict {} ({}): local v{} vs remote v{}",
            conflict.id, conflict.entity_type, conflict.local_version, conflict.remote_version
        );
    }
    if !result.conflicted.is_empty() {
        println!("Run `deferq resolve --id <ID> --keep <keep-local|accept-remote>` to settle them");
    }
    Ok(())
}

async fn cmd_conflicts(
    store: Arc<dyn KeyValueStore>,
    config: SyncConfig,
    json: bool,
) -> Result<()> {
    let engine = open_engine(store, SimulatedTransport::default(), config).await?;
    let conflicts = engine.conflicts().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No pending conflicts");
        return Ok(());
    }

    for conflict in conflicts {
        println!("{} [{}] {}", conflict.id, conflict.entity_type, conflict.action_type);
        println!("  local  v{}: {}", conflict.local_version, conflict.local_data);
        println!("  remote v{}: {}", conflict.remote_version, conflict.remote_data);
    }
    Ok(())
}

async fn cmd_resolve(
    store: Arc<dyn KeyValueStore>,
    config: SyncConfig,
    id: &str,
    resolution: Resolution,
) -> Result<()> {
    let id = ActionId::new(id).context("Invalid action id")?;
    let engine = open_engine(store, SimulatedTransport::default(), config).await?;

    let resolved = engine
        .resolve(&id, resolution)
        .await
        .with_context(|| format!("Failed to resolve {}", id))?;

    println!("Resolved {}: kept {}", id, resolution.side());
    println!("{}", serde_json::to_string_pretty(resolved.winning_data())?);
    Ok(())
}

async fn cmd_purge(store: Arc<dyn KeyValueStore>, config: SyncConfig, yes: bool) -> Result<()> {
    if !yes {
        bail!("Purging discards every queued action; re-run with --yes to confirm");
    }

    let engine = open_engine(store, SimulatedTransport::default(), config).await?;
    let summary = engine.purge().await.context("Failed to purge queue")?;

    println!(
        "Purged {} actions and {} conflicts",
        summary.actions, summary.conflicts
    );
    Ok(())
}

async fn cmd_demo(config: SyncConfig) -> Result<()> {
    let store = create_default_registry()
        .and_then(|registry| registry.resolve("memory", Value::Null))
        .context("Failed to open memory store")?;
    let transport = ScriptedTransport::new().with_latency(Duration::from_millis(150));
    let engine = open_engine(store, transport, config).await?;

    info!("Offline: capturing three actions");
    engine
        .capture("enroll.student", json!({"student": "Ada", "course": "CS101"}))
        .await?;
    let contested = engine
        .capture("grade.update", json!({"student": "Ada", "grade": "A"}))
        .await?;
    engine
        .capture("payment.create", json!({"amount": 120}))
        .await?;
    engine.transport().script(
        &contested.id,
        [Scripted::Conflict {
            remote_version: None,
            remote_data: json!({"student": "Ada", "grade": "B+"}),
        }],
    )?;

    let result = match engine.set_online(true).await.and_then(|t| t.replay) {
        Some(replay) => replay.await.context("Replay task panicked")??,
        None => engine.replay().await?,
    };
    info!(
        "Replay: {} synced, {} conflicts, {} queued",
        result.succeeded.len(),
        result.conflicted.len(),
        result.remaining
    );

    let resolved = engine
        .resolve(&contested.id, Resolution::AcceptRemote)
        .await?;
    info!("Accepted remote grade: {}", resolved.winning_data());

    println!();
    for entry in engine.log_entries().await {
        println!(
            "{} [{:<7}] {}",
            entry.timestamp.format("%H:%M:%S%.3f"),
            entry.level,
            entry.message
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_resolution_argument() {
        let cli = Cli::try_parse_from(["deferq", "resolve", "--id", "a1", "--keep", "remote"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Resolve {
                keep: Resolution::AcceptRemote,
                ..
            }
        ));
    }

    #[test]
    fn test_load_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"storage_key": "classroom"}"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.storage_key, "classroom");
        assert_eq!(config.max_retries, 2);
    }
}
