use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fitsync_core::config::{Config, FeatureManager};
use fitsync_core::core_connection::ResilientConnection;
use fitsync_core::core_groups::{GroupId, GroupStore, ResyncOptions, ResyncOutcome, UserId};
use fitsync_core::core_ids::{ChannelId, IdentifierTable};
use fitsync_core::core_sync::SyncOrchestrator;
use fitsync_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use fitsync_core::metrics::init_metrics;
use fitsync_core::persistence::{FileKvStore, KvStore};
use fitsync_core::shutdown::ShutdownCoordinator;
use fitsync_core::HttpGroupApi;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fitsync")]
#[command(author, version, about = "Group and chat sync client", long_about = None)]
struct Args {
    /// Configuration file (TOML); defaults plus FITSYNC_* variables otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Keep groups in sync until interrupted
    Run,
    /// Run one reconciliation pass and print the outcome
    Resync {
        /// Replace local state instead of merging into it
        #[arg(long)]
        hard: bool,
    },
    /// Print the chat channel for a group id
    Resolve { group_id: u64 },
    /// Print the group id owning a chat channel
    Reverse { channel: String },
    /// Regenerate every channel identifier on the server
    ResetIds,
    /// List cached groups as JSON
    Groups {
        /// Only groups this user participates in
        #[arg(long)]
        user: Option<u64>,
    },
    /// Write a default configuration file
    ConfigInit { path: PathBuf },
}

/// Everything a command needs, wired from configuration
struct Client {
    config: Config,
    store: Arc<GroupStore>,
    ids: Arc<IdentifierTable>,
}

impl Client {
    fn build(config: Config) -> Result<Self> {
        let data_dir = PathBuf::from(shellexpand::tilde(&config.store.data_dir.to_string_lossy()).into_owned());
        let storage: Arc<dyn KvStore> =
            Arc::new(FileKvStore::open(&data_dir).with_context(|| format!("opening {}", data_dir.display()))?);
        let api = Arc::new(HttpGroupApi::new(&config.server)?);
        let ids = Arc::new(IdentifierTable::with_storage(storage.clone()));
        let store = Arc::new(GroupStore::new(
            api,
            ids.clone(),
            Some(storage),
            config.store.clone(),
            FeatureManager::with_flags(config.features.clone()),
        ));
        Ok(Self { config, store, ids })
    }

    async fn rehydrate(&self) -> Result<()> {
        let report = self.store.rehydrate().await?;
        info!(groups = report.groups, mappings = report.mappings, stale = report.stale, "Local state loaded");
        Ok(())
    }

    /// Refresh identifiers, falling back to the cached table
    async fn refresh_ids(&self) {
        if let Err(e) = self.ids.refresh(self.store.api().as_ref()).await {
            warn!(error = %e, "Using cached identifier table");
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            let path = shellexpand::tilde(&path.to_string_lossy()).into_owned();
            let mut config = Config::from_file(&path).with_context(|| format!("loading {}", path))?;
            config.apply_env()?;
            config.validate()?;
            config
        }
        None => Config::from_env()?,
    };
    Ok(config)
}

fn log_config(args: &Args, config: &Config) -> Result<LogConfig> {
    let mut log = LogConfig::try_from(&config.logging)?;
    if let Some(level) = &args.log_level {
        log.level = level.parse::<LogLevel>().unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', using 'info'", level);
            LogLevel::Info
        });
    }
    if args.json_logs {
        log = log.json_format(true);
    }
    Ok(log)
}

async fn run(client: Client) -> Result<()> {
    client.rehydrate().await?;

    let config = &client.config;
    let features = FeatureManager::with_flags(config.features.clone());
    let connection = Arc::new(ResilientConnection::websocket(config.server.push_url(), config.connection.clone()));
    let shutdown = Arc::new(ShutdownCoordinator::new(config.sync.shutdown_timeout));
    let sync = SyncOrchestrator::new(
        client.store.clone(),
        Some(connection),
        features,
        config.sync.clone(),
        shutdown,
    );

    let mode = sync.start().await?;
    info!(mode = %mode, "Sync running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    sync.stop().await;
    client.store.persist().await?;
    Ok(())
}

fn write_default_config(path: &Path) -> Result<()> {
    Config::default().save_to_file(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

async fn execute(command: Command, config: Config) -> Result<()> {
    if let Command::ConfigInit { path } = &command {
        return write_default_config(path);
    }

    let client = Client::build(config)?;
    match command {
        Command::Run => run(client).await?,
        Command::Resync { hard } => {
            client.rehydrate().await?;
            let options = if hard { ResyncOptions::hard_reset() } else { ResyncOptions::forced() };
            match client.store.resync(options).await? {
                ResyncOutcome::Completed(report) => println!(
                    "{} groups ({} fetched, {} virtual, {} roster failures) in {:?}",
                    report.groups, report.fetched, report.virtual_groups, report.roster_failures, report.duration
                ),
                ResyncOutcome::Skipped => println!("resync skipped"),
            }
        }
        Command::Resolve { group_id } => {
            client.rehydrate().await?;
            client.refresh_ids().await;
            println!("{}", client.ids.resolve(GroupId(group_id)));
        }
        Command::Reverse { channel } => {
            client.rehydrate().await?;
            client.refresh_ids().await;
            match client.ids.reverse_resolve(&ChannelId::new(channel.clone())) {
                Some(id) => println!("{}", id),
                None => anyhow::bail!("no group owns channel {}", channel),
            }
        }
        Command::ResetIds => {
            let count = client.ids.reset(client.store.api().as_ref()).await?;
            println!("{} identifiers regenerated", count);
        }
        Command::Groups { user } => {
            client.rehydrate().await?;
            let groups = match user {
                Some(user) => client.store.groups_for_user(UserId(user)),
                None => client.store.list(),
            };
            println!("{}", serde_json::to_string_pretty(&groups)?);
        }
        Command::ConfigInit { path } => write_default_config(&path)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_ref())?;
    init_logging_with_config(log_config(&args, &config)?)?;

    if let Some(addr) = args.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        init_metrics();
        info!(%addr, "Serving metrics");
    }

    info!("fitsync started");
    execute(args.command, config).await?;
    info!("fitsync finished");

    Ok(())
}
