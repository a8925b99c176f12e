//! Meterstore CLI
//!
//! Maintenance commands for a metering store:
//! - Expire samples older than the configured time to live
//! - Create or upgrade the database schema
//! - Generate a default config file

use anyhow::Context;
use clap::{Parser, Subcommand};
use meterstore::config::{generate_default_config, Config, LoggingConfig};
use meterstore::storage;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "meterstore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Storage maintenance for metering samples, alarms and events")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Remove samples older than the time to live
    Expire {
        /// Maximum sample age in seconds, overriding the config
        #[arg(long, allow_hyphen_values = true)]
        ttl: Option<i64>,
    },

    /// Open the configured backend, creating its schema
    Dbsync,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        return write_default_config(output.as_ref());
    }

    let config = load_config(cli.config.as_ref(), std::io::stderr)?;
    init_logging(&config.logging)?;

    tracing::info!("Meterstore v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Expire { ttl } => expire(&config, ttl).await?,
        Commands::Dbsync => {
            let conn = storage::open(&config.storage, config.connection_options())?;
            tracing::info!(
                backend = %config.storage.backend,
                capabilities = ?conn.capabilities(),
                "Storage ready"
            );
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}

async fn expire(config: &Config, ttl: Option<i64>) -> anyhow::Result<()> {
    let max_age = match ttl {
        Some(t) => u64::try_from(t).ok().filter(|t| *t > 0),
        None => config.retention.max_age(),
    };
    let Some(max_age) = max_age else {
        tracing::info!("Nothing to clean, database time to live is disabled");
        return Ok(());
    };

    let conn = storage::open(&config.storage, config.connection_options())?;
    match conn.purge_expired(max_age).await {
        Ok(removed) => {
            tracing::info!(removed, max_age, "Expired samples removed");
        }
        Err(e) if e.is_not_supported() => {
            tracing::warn!(backend = %config.storage.backend, "Backend cannot expire data: {}", e);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Load the config, logging discovery to `writer` since the configured
/// subscriber cannot exist yet
fn load_config<W>(path: Option<&PathBuf>, writer: W) -> anyhow::Result<Config>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("meterstore=info"))
        .with_writer(writer)
        .finish();

    tracing::subscriber::with_default(bootstrap, || -> anyhow::Result<Config> {
        match path {
            Some(path) => {
                let config = Config::load_with_env(path)
                    .with_context(|| format!("loading config {}", path.display()))?;
                tracing::info!(path = %path.display(), "Loaded config");
                Ok(config)
            }
            None => Ok(Config::load_default()),
        }
    })
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("meterstore={}", config.level)));

    let writer = match &config.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(writer))
            .init();
    }
    Ok(())
}

fn write_default_config(output: Option<&PathBuf>) -> anyhow::Result<()> {
    let config = generate_default_config();

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &config)?;
            println!("Config written to {:?}", path);
        }
        None => {
            print!("{}", config);
        }
    }
    Ok(())
}
