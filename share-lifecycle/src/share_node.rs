use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use share_lifecycle::engine::{JsonEngineClient, WebSocketTransport};
use share_lifecycle::{
    BackendId, BackendSet, BackupBlob, Curve, FileShareRepository, LifecycleConfig, LifecycleError,
    Notification, ProgressReporter, ProgressStatus, ShareLifecycle,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Manage the threshold wallet shares held on this device", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the share repository and local backup keys
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Engine WebSocket URL, overrides `host` from the configuration
    #[arg(short, long)]
    engine: Option<String>,

    /// Password for the password backend
    #[arg(long)]
    password: Option<String>,

    /// Curves to operate on, overrides `curves` from the configuration
    #[arg(long, value_enum, value_delimiter = ',')]
    curves: Vec<Curve>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new wallet
    Generate,

    /// Back up the current signing shares
    Backup {
        #[arg(long, value_enum)]
        method: BackendId,

        /// Write the backup blob here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Restore signing shares from a backup blob
    Recover {
        #[arg(long)]
        blob: PathBuf,
    },

    /// Extract the private keys and retire the wallet
    Eject {
        #[arg(long)]
        blob: PathBuf,

        /// Custodian backup share as `curve=hex`, once per curve
        #[arg(long = "custodian-share", value_parser = parse_custodian_share)]
        custodian_shares: Vec<(Curve, String)>,
    },

    /// Re-send notifications left pending by an earlier run
    Retry,

    /// Show the wallet held by this device
    Status,
}

fn parse_custodian_share(s: &str) -> Result<(Curve, String), String> {
    let (curve, share) = s
        .split_once('=')
        .ok_or_else(|| format!("expected curve=share, got {}", s))?;
    Ok((curve.parse()?, share.to_string()))
}

/// File holding notifications the engine has not acknowledged yet
const PENDING_FILE: &str = "pending.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".share_lifecycle"),
    };

    let mut config = match &args.config {
        Some(path) => LifecycleConfig::from_file(path)?,
        None => {
            let default_path = data_dir.join("config.json");
            if default_path.exists() {
                LifecycleConfig::from_file(&default_path)?
            } else {
                LifecycleConfig::default()
            }
        }
    };
    if let Some(engine) = &args.engine {
        config.host = engine.clone();
    }
    if args.password.is_some() {
        config.password = args.password.clone();
    }
    if !args.curves.is_empty() {
        config.curves = args.curves.clone();
    }

    info!(engine = %config.host, data_dir = %data_dir.display(), "starting share node");
    let engine = Arc::new(JsonEngineClient::new(WebSocketTransport::new(config.host.clone())));
    let backends = BackendSet::from_config(&config, &data_dir);
    let repository = Arc::new(FileShareRepository::new(data_dir.join("repository")));
    let reporter: Arc<dyn ProgressReporter> =
        Arc::new(|status: ProgressStatus| info!("{}", status.display_status()));

    let lifecycle = ShareLifecycle::new(config, engine, backends, repository)?.with_reporter(reporter);

    let outcome = run(&lifecycle, args.command, &data_dir).await;
    if let Err(e) = &outcome {
        record_pending(&data_dir, e)?;
    }
    outcome?;
    Ok(())
}

/// Keeps the notifications a partial success left undelivered so `retry`
/// can send them later. Ejections are only ever resent by hand.
fn record_pending(data_dir: &Path, err: &LifecycleError) -> anyhow::Result<()> {
    if let Some(pending) = err.pending_notifications() {
        save_pending(data_dir, pending)?;
        warn!("run `share_node retry` to resend {} notification(s)", pending.len());
    }
    Ok(())
}

async fn run(lifecycle: &ShareLifecycle, command: Command, data_dir: &Path) -> Result<(), LifecycleError> {
    match command {
        Command::Generate => {
            let address = lifecycle.generate().await?;
            println!("{}", address);
        }
        Command::Backup { method, out } => {
            let blob = lifecycle.backup(method).await?;
            let json = serde_json::to_string_pretty(&blob).map_err(|e| LifecycleError::Config(e.to_string()))?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json).map_err(|e| LifecycleError::Config(e.to_string()))?;
                    println!("Backup written to {}", path.display());
                }
                None => println!("{}", json),
            }
        }
        Command::Recover { blob } => {
            let blob = read_blob(&blob)?;
            let password = lifecycle.config().password.clone();
            let recovered = lifecycle.recover(&blob, password.as_deref()).await?;
            println!("{}", recovered.address);
            if let Some(refreshed) = recovered.refreshed_backup {
                let json =
                    serde_json::to_string_pretty(&refreshed).map_err(|e| LifecycleError::Config(e.to_string()))?;
                println!("Replacement backup (the old one is no longer current):\n{}", json);
            }
        }
        Command::Eject { blob, custodian_shares } => {
            let blob = read_blob(&blob)?;
            let custodian: BTreeMap<Curve, String> = custodian_shares.into_iter().collect();
            let password = lifecycle.config().password.clone();
            let outcome = lifecycle.eject(&blob, password.as_deref(), &custodian).await;
            let keys = match &outcome {
                Ok(keys) => Some(keys),
                Err(e) => e.ejected_keys(),
            };
            for (curve, key) in keys.into_iter().flatten() {
                println!("{}: {}", curve, key.expose());
            }
            outcome?;
        }
        Command::Retry => {
            let pending = load_pending(data_dir)?;
            if pending.is_empty() {
                println!("Nothing to retry");
                return Ok(());
            }
            lifecycle.retry_notifications(&pending).await?;
            save_pending(data_dir, &[]).map_err(|e| LifecycleError::Config(e.to_string()))?;
            println!("Resent {} notification(s)", pending.len());
        }
        Command::Status => {
            let record = lifecycle.status().await?;
            println!("State:   {:?}", record.state());
            println!("Address: {}", record.address().unwrap_or("-"));
            println!(
                "Curves:  {}",
                record.curves().iter().map(Curve::as_str).collect::<Vec<_>>().join(", ")
            );
            println!(
                "Backup:  {}",
                record.backup_method().map(|m| m.as_str()).unwrap_or("none")
            );
            if lifecycle.is_mutating() {
                println!("A wallet operation is in progress");
            }
        }
    }
    Ok(())
}

fn read_blob(path: &Path) -> Result<BackupBlob, LifecycleError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| LifecycleError::Config(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&text).map_err(|e| LifecycleError::Config(format!("{}: {}", path.display(), e)))
}

fn save_pending(data_dir: &Path, pending: &[Notification]) -> anyhow::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(PENDING_FILE);
    if pending.is_empty() {
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        return Ok(());
    }
    std::fs::write(&path, serde_json::to_string_pretty(pending)?)
        .with_context(|| format!("failed to save pending notifications to {}", path.display()))?;
    Ok(())
}

fn load_pending(data_dir: &Path) -> Result<Vec<Notification>, LifecycleError> {
    let path = data_dir.join(PENDING_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(&path).map_err(|e| LifecycleError::Config(e.to_string()))?;
    let pending: Vec<Notification> =
        serde_json::from_str(&text).map_err(|e| LifecycleError::Config(e.to_string()))?;
    if pending.iter().any(|n| matches!(n, Notification::Ejected { .. })) {
        warn!("pending notifications include an ejection");
    }
    Ok(pending)
}
