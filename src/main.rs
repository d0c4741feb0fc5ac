use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use fixsync::config::SessionConfig;
use fixsync::queue::FixQueue;
use fixsync::replay::{self, ReplayStats};
use fixsync::sync::{SessionSettings, SyncSession};
use fixsync::upload::{DeadlineGrants, HttpEndpoint};

#[derive(Parser)]
#[command(name = "fixsync", version)]
#[command(about = "Queue location fixes durably and deliver them in throttled batches")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Session config file (TOML)
    #[arg(short, long, global = true, env = "FIXSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Queue directory, overrides the config file
    #[arg(long, global = true)]
    queue: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a tracking session fed from a JSON-lines event stream
    Track {
        /// Event file, or - for stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Upload URL, overrides the config file
        #[arg(long)]
        endpoint: Option<String>,

        /// Device identifier, overrides the config file
        #[arg(long)]
        device_id: Option<String>,

        /// Start with power saving enabled
        #[arg(long)]
        power_saving: bool,
    },
    /// Show queue contents
    Status,
    /// Delete delivered fixes
    Prune {
        /// Number of most recent delivered fixes to keep
        #[arg(long, default_value_t = 0)]
        keep: usize,
    },
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(queue) = cli.queue {
        config.queue_dir = Some(queue);
    }

    match cli.command {
        Commands::Track {
            input,
            endpoint,
            device_id,
            power_saving,
        } => {
            if endpoint.is_some() {
                config.endpoint_url = endpoint;
            }
            if device_id.is_some() {
                config.device_id = device_id;
            }
            config.validate()?;
            track(&config, &input, power_saving).await
        }
        Commands::Status => status(&config),
        Commands::Prune { keep } => prune(&config, keep),
    }
}

fn open_queue(config: &SessionConfig) -> Result<FixQueue> {
    let dir = config.queue_dir()?;
    FixQueue::open(&dir, config.durability)
        .with_context(|| format!("Failed to open fix queue at {}", dir.display()))
}

async fn track(config: &SessionConfig, input: &str, power_saving: bool) -> Result<()> {
    let url = config
        .endpoint_url
        .clone()
        .context("No endpoint_url configured (use --endpoint or the config file)")?;

    let queue = Arc::new(open_queue(config)?);
    let device_id = match &config.device_id {
        Some(id) => id.clone(),
        None => queue.device_id()?,
    };

    let endpoint = Arc::new(HttpEndpoint::new(url, config.request_timeout())?);
    let throttle = Arc::new(config.throttle()?);
    throttle.set_power_saving(power_saving);
    let grants = Arc::new(DeadlineGrants::new(config.grant_budget()));

    let session = SyncSession::start(
        queue,
        throttle,
        endpoint,
        grants.clone(),
        SessionSettings {
            device_id,
            max_batch_size: config.max_batch_size,
        },
    )?;

    let fed = tokio::select! {
        result = feed(input, &session) => Some(result),
        _ = tokio::signal::ctrl_c() => {
            // Treated like the host suspending us: in-flight work loses its grant
            let revoked = grants.expire_all();
            tracing::info!("Interrupted; revoked {} execution grant(s)", revoked);
            None
        }
    };

    let stats = session.stop().await;

    println!(
        "captured {}  rejected {}  delivered {}  unsent {}",
        stats.fixes_captured,
        stats.fixes_rejected,
        stats.fixes_delivered,
        session.unsent_count()
    );

    if let Some(result) = fed {
        let replay_stats = result?;
        if replay_stats.malformed > 0 {
            tracing::warn!("{} malformed event lines skipped", replay_stats.malformed);
        }
    }
    Ok(())
}

async fn feed(input: &str, session: &SyncSession) -> Result<ReplayStats> {
    if input == "-" {
        replay::replay(BufReader::new(tokio::io::stdin()), session).await
    } else {
        let file = tokio::fs::File::open(input)
            .await
            .with_context(|| format!("Failed to open {}", input))?;
        replay::replay(BufReader::new(file), session).await
    }
}

fn status(config: &SessionConfig) -> Result<()> {
    let queue = open_queue(config)?;

    let device_id = match &config.device_id {
        Some(id) => id.clone(),
        None => queue.device_id()?,
    };
    let last_sync = match queue.last_sync()? {
        Some(time) => time.to_rfc3339(),
        None => "never".to_string(),
    };

    println!("queue:     {}", queue.path().display());
    println!("device:    {}", device_id);
    println!(
        "fixes:     {} ({} unsent)",
        queue.total_count()?,
        queue.unsent_count()
    );
    println!("last sync: {}", last_sync);
    Ok(())
}

fn prune(config: &SessionConfig, keep: usize) -> Result<()> {
    let queue = open_queue(config)?;

    let mut kept = 0;
    let removed = queue.prune(|_| {
        kept += 1;
        kept <= keep
    })?;

    println!("removed {} delivered fixes", removed);
    Ok(())
}
