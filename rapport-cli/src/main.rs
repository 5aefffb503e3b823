use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rapport_core::backup::{BackupOrchestrator, Collaborators, ProgressEvent};
use rapport_core::config::BackupConfig;
use rapport_core::crypto::{HkdfKeyDerivation, PasswordCipher};
use rapport_core::platform;
use rapport_core::storage::memory::{
    MemoryDeviceFs, MemoryLocalStore, MemoryRemoteStorage, StaticAuth,
};
use rapport_core::storage::{Collection, DeviceFs, DriveClient, LocalDeviceFs};
use rapport_core::{DeviceClass, SqliteStore};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Rapport backup CLI - encrypted backups of your CRM data
#[derive(Parser)]
#[command(name = "rapport")]
#[command(about = "Encrypted backup and restore for Rapport", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Account to act as (overrides `account_id` in the config)
    #[arg(long)]
    account: Option<String>,

    /// Use in-memory storage with sample data
    #[arg(long)]
    dev: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new backup
    Backup,

    /// Restore a backup, replacing local data
    Restore {
        /// Remote backup ID
        id: String,
    },

    /// List available backups
    List,

    /// Delete a backup and its attachments
    Delete {
        /// Remote backup ID
        id: String,
    },

    /// Remove all but the newest backups
    Prune {
        /// Number of backups to keep
        #[arg(long)]
        keep: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(platform::get_default_config_path);
    let mut config = BackupConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(account) = &cli.account {
        config.account_id = Some(account.clone());
    }
    config.validate()?;

    let orchestrator = if cli.dev {
        info!("Running in development mode (in-memory storage)");
        dev_orchestrator(config)?
    } else {
        orchestrator(config)?
    };

    let printer = spawn_progress_printer(&orchestrator);

    let outcome = match cli.command {
        Commands::Backup => print_json(&orchestrator.create_backup().await?),
        Commands::Restore { id } => print_json(&orchestrator.restore_backup(&id).await?),
        Commands::List => print_json(&orchestrator.list_available_backups().await?),
        Commands::Delete { id } => print_json(&orchestrator.delete_backup(&id).await?),
        Commands::Prune { keep } => print_json(&orchestrator.prune(keep).await?),
    };

    // Dropping the orchestrator closes the channel once buffered events are read
    drop(orchestrator);
    if tokio::time::timeout(Duration::from_secs(2), printer).await.is_err() {
        warn!("Progress output did not finish");
    }
    outcome
}

fn auth_for(config: &BackupConfig) -> Arc<StaticAuth> {
    match &config.account_id {
        Some(account) => Arc::new(StaticAuth::signed_in(account)),
        None => {
            warn!("No account configured; backup and restore will require sign-in");
            Arc::new(StaticAuth::signed_out())
        }
    }
}

fn orchestrator(config: BackupConfig) -> Result<BackupOrchestrator> {
    let token = std::env::var(&config.remote.token_env)
        .with_context(|| format!("{} is not set", config.remote.token_env))?;
    let remote = DriveClient::new(&config.remote.api_base, &config.remote.upload_base, &token)?;

    platform::ensure_parent_dir(&config.database_path)
        .with_context(|| format!("creating directory for {}", config.database_path.display()))?;
    let store = SqliteStore::open(&config.database_path)?;

    let device_fs: Option<Arc<dyn DeviceFs>> = match config.device_class {
        DeviceClass::Mobile => Some(Arc::new(LocalDeviceFs::new(config.attachments_root.clone()))),
        DeviceClass::Desktop => None,
    };

    let collaborators = Collaborators {
        store: Arc::new(store),
        remote: Arc::new(remote),
        cipher: Arc::new(PasswordCipher::new(config.kdf)?),
        keys: Arc::new(HkdfKeyDerivation::new(config.app_salt.clone())),
        auth: auth_for(&config),
        device_fs,
    };
    Ok(BackupOrchestrator::new(config, collaborators))
}

fn dev_orchestrator(mut config: BackupConfig) -> Result<BackupOrchestrator> {
    if config.account_id.is_none() {
        config.account_id = Some("dev@rapport.local".to_string());
    }

    let store = MemoryLocalStore::new();
    for (id, name) in [("c1", "Ada Lovelace"), ("c2", "Grace Hopper"), ("c3", "Alan Turing")] {
        store.insert(Collection::Clients, serde_json::json!({ "id": id, "name": name }));
    }
    store.insert(
        Collection::Tasks,
        serde_json::json!({ "id": "t1", "title": "Send proposal", "clientId": "c1" }),
    );

    let device_fs: Option<Arc<dyn DeviceFs>> = match config.device_class {
        DeviceClass::Mobile => Some(Arc::new(MemoryDeviceFs::new())),
        DeviceClass::Desktop => None,
    };

    let collaborators = Collaborators {
        store: Arc::new(store),
        remote: Arc::new(MemoryRemoteStorage::new()),
        cipher: Arc::new(PasswordCipher::new(config.kdf)?),
        keys: Arc::new(HkdfKeyDerivation::new(config.app_salt.clone())),
        auth: auth_for(&config),
        device_fs,
    };
    Ok(BackupOrchestrator::new(config, collaborators))
}

fn spawn_progress_printer(orchestrator: &BackupOrchestrator) -> tokio::task::JoinHandle<()> {
    let mut rx = orchestrator.progress().subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ProgressEvent::Update {
                    percent,
                    message,
                    pulsing,
                }) => {
                    let marker = if pulsing { "~" } else { " " };
                    eprintln!("[{:>3}%{}] {}", percent, marker, message);
                }
                Ok(ProgressEvent::Failed { message }) => eprintln!("error: {}", message),
                Ok(ProgressEvent::Closed) => {}
                Ok(ProgressEvent::ReloadRequested) => eprintln!("Local data replaced; reload the app"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
