use clap::{Parser, ValueEnum};
use pkg_constants::controller::{
    BACKOFF_BASE_MS, BACKOFF_MAX_SECS, RESYNC_INTERVAL_SECS, STALL_THRESHOLD_SECS,
};
use pkg_constants::paths::{DEFAULT_CONFIG_PATH, DEFAULT_DATA_DIR};
use pkg_controllers::backoff::Backoff;
use pkg_controllers::memory::{MemoryDns, MemoryProvisioner, MemoryRuntime};
use pkg_controllers::{
    Backends, ControllerOptions, OrderedSetManager, ReconcilerConfig, apply_set,
};
use pkg_state::StateStore;
use pkg_types::config::{ControllerConfigFile, load_config_file, load_manifest};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "ordset", about = "Ordered replica set controller")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Keep all state in memory instead of SlateDB
    #[arg(long)]
    in_memory: bool,

    /// Manifest with OrderedSets to apply on startup
    #[arg(long, short)]
    manifest: Option<String>,

    /// Delay before the in-memory runtime reports an instance Ready
    #[arg(long)]
    ready_delay_ms: Option<u64>,

    /// Seconds between status reports
    #[arg(long, default_value_t = 5)]
    status_interval: u64,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    // Load config file (returns defaults if file not found)
    let file_cfg: ControllerConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let data_dir = cli
        .data_dir
        .or(file_cfg.data_dir)
        .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
    let ready_delay = cli.ready_delay_ms.or(file_cfg.ready_delay_ms).unwrap_or(500);
    let options = ControllerOptions {
        reconciler: ReconcilerConfig {
            stall_threshold: Duration::from_secs(
                file_cfg.stall_threshold_secs.unwrap_or(STALL_THRESHOLD_SECS),
            ),
            backoff: Backoff {
                base: Duration::from_millis(file_cfg.backoff_base_ms.unwrap_or(BACKOFF_BASE_MS)),
                max: Duration::from_secs(file_cfg.backoff_max_secs.unwrap_or(BACKOFF_MAX_SECS)),
            },
        },
        resync_interval: Duration::from_secs(
            file_cfg.resync_interval_secs.unwrap_or(RESYNC_INTERVAL_SECS),
        ),
    };

    info!("Starting ordset");
    if cli.in_memory {
        info!("  State:        in-memory");
    } else {
        info!("  Data dir:     {}", data_dir);
    }
    info!("  Resync:       {}s", options.resync_interval.as_secs());
    info!("  Stall after:  {}s", options.reconciler.stall_threshold.as_secs());
    info!("  Ready delay:  {}ms", ready_delay);

    let store = if cli.in_memory {
        StateStore::in_memory()
    } else {
        StateStore::new(&data_dir).await?
    };

    if let Some(path) = &cli.manifest {
        for set in load_manifest(path)? {
            apply_set(&store, set).await?;
        }
    }

    let backends = Backends {
        runtime: Arc::new(MemoryRuntime::new(Some(Duration::from_millis(ready_delay)))),
        provisioner: Arc::new(MemoryProvisioner::new()),
        dns: Arc::new(MemoryDns::new()),
    };
    let manager = OrderedSetManager::new(store.clone(), backends, options);
    let registry = manager.registry();
    let manager_task = manager.start();

    let mut report = tokio::time::interval(Duration::from_secs(cli.status_interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                for (set, status) in registry.statuses().await {
                    info!(
                        "{}: {}/{} ready, {} updated, revision {}",
                        set,
                        status.ready_replicas,
                        status.replicas,
                        status.updated_replicas,
                        status.current_revision
                    );
                    for condition in &status.conditions {
                        warn!("{}: {}: {}", set, condition.kind, condition.message);
                    }
                }
            }
        }
    }

    info!("Shutting down");
    manager_task.abort();
    registry.abort_all().await;
    store.close().await?;
    Ok(())
}
