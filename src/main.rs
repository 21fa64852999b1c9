//! Binary entrypoint for the meshrelay maintenance CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml`
//! - `check-config` - load and validate the configuration
//! - `db-stats` - print message map and name cache statistics
//! - `wipe-map` - clear the radio/Matrix message map
//!
//! The relay itself runs inside an application that provides the Matrix
//! session and radio library; see `meshrelay::relay::service`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info};

use meshrelay::config::Config;
use meshrelay::storage::MessageStore;

#[derive(Parser)]
#[command(name = "meshrelay")]
#[command(about = "Relay between Meshtastic radio meshes and Matrix rooms")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Load and validate the configuration
    CheckConfig,
    /// Show message map statistics
    DbStats,
    /// Delete every stored message mapping
    WipeMap,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init { .. } => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init { force } => {
            if !force && tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                return Err(anyhow!("{} already exists (use --force to overwrite)", cli.config));
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::CheckConfig => {
            let config = load_config(pre_config, &cli.config).await?;
            if let Err(e) = config.validate() {
                error!("Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!(
                "{}: ok (meshnet '{}', {} rooms, connection {})",
                cli.config,
                config.meshnet_name(),
                config.matrix_rooms.len(),
                config.meshtastic.connection_type.as_str()
            );
        }
        Commands::DbStats => {
            let config = load_config(pre_config, &cli.config).await?;
            let store = MessageStore::open(&config.database.path)?;
            let payload = serde_json::json!({
                "path": config.database.path,
                "message_map_rows": store.message_map_len(),
                "msgs_to_keep": config.database.msg_map.msgs_to_keep,
                "wipe_on_restart": config.database.msg_map.wipe_on_restart,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::WipeMap => {
            let config = load_config(pre_config, &cli.config).await?;
            let store = MessageStore::open(&config.database.path)?;
            let before = store.message_map_len();
            store.wipe_message_map()?;
            store.flush()?;
            info!("Removed {} message mappings from {}", before, config.database.path);
        }
    }

    Ok(())
}

async fn load_config(pre: Option<Config>, path: &str) -> Result<Config> {
    match pre {
        Some(config) => Ok(config),
        None => Config::load(path).await,
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| std::fs::OpenOptions::new().create(true).append(true).open(path).ok());

    match log_file {
        Some(f) => {
            let file = std::sync::Arc::new(std::sync::Mutex::new(f));
            // When not attached to a terminal the file is the only sink.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = file.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
