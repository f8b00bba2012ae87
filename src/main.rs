//! Binary entrypoint for the meshtrack CLI.
//!
//! Commands:
//! - `start` - run discovery, polling, status reporting and the MQTT consumer until Ctrl-C
//! - `init` - write a starter `config.toml`
//! - `status` - print a JSON summary of the node store
//! - `smoketest --device <address> [--serial]` - poll one device once
//! - `decode --hex <frame> [--topic <t>]` - decode one bus frame offline
//!
//! See the library crate docs for module-level details: `meshtrack::`.
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{error, info};

use meshtrack::config::Config;
use meshtrack::devices::DeviceKind;
use meshtrack::ingest::BusDecoder;
use meshtrack::meshtastic::transport::{fetch_node_table, LinkOptions};
use meshtrack::service::Tracker;
use meshtrack::storage::NodeStore;

#[derive(Parser)]
#[command(name = "meshtrack")]
#[command(about = "Node tracker for Meshtastic mesh networks")]
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
    /// Run every ingestion task until Ctrl-C
    Start,
    /// Write a default configuration file
    Init,
    /// Print a JSON summary of the node store
    Status,
    /// Poll one device once and print what it returned
    #[command(name = "smoketest")]
    SmokeTest {
        /// Serial port path or host[:port]
        #[arg(short, long)]
        device: String,
        /// Treat the device as a serial port instead of a TCP host
        #[arg(long)]
        serial: bool,
    },
    /// Decode one bus frame given as hex
    Decode {
        #[arg(long)]
        hex: String,
        /// Topic the frame arrived on (only used for display)
        #[arg(long, default_value = "msh/cli")]
        topic: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            init_logging(&None, cli.verbose);
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Start => {
            let config = load_config(&cli.config, cli.verbose).await?;
            info!("Starting meshtrack v{}", env!("CARGO_PKG_VERSION"));
            let tracker = Tracker::new(config).await?;
            tracker.run().await?;
        }
        Commands::Status => {
            let config = load_config(&cli.config, cli.verbose).await?;
            let store = NodeStore::open(&config.store.data_dir)
                .with_context(|| format!("opening store at {}", config.store.data_dir))?;
            let summary = store.summary(&config.staleness, Utc::now())?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::SmokeTest { device, serial } => {
            let config = load_config(&cli.config, cli.verbose).await?;
            let kind = if serial { DeviceKind::Serial } else { DeviceKind::Tcp };
            let opts = LinkOptions::from_config(&config.devices);
            info!("Starting smoke test on {} ({})", device, kind);
            match fetch_node_table(kind, &device, &opts).await {
                Ok(table) => {
                    let payload = serde_json::json!({
                        "status": "ok",
                        "device": device,
                        "kind": kind,
                        "my_node_num": table.my_node_num.map(|n| format!("!{:08x}", n)),
                        "region": table.region_name(),
                        "fixed_position": table.fixed_position,
                        "node_count": table.len(),
                    });
                    println!("{}", payload);
                }
                Err(e) => {
                    error!("Smoke test failed: {}", e);
                    let payload = serde_json::json!({
                        "status": "failed",
                        "device": device,
                        "kind": kind,
                        "error": e.to_string(),
                    });
                    println!("{}", payload);
                    std::process::exit(1);
                }
            }
        }
        Commands::Decode { hex, topic } => {
            let config = load_config(&cli.config, cli.verbose).await?;
            let frame = hex::decode(hex.trim()).map_err(|e| anyhow!("invalid hex: {}", e))?;
            let keys = config.decryption.key_table()?;
            let decoder = BusDecoder::new(Arc::new(keys));
            let payload = match decoder.process(&frame, Utc::now()) {
                Ok((decoded, classified, ingested)) => serde_json::json!({
                    "status": "ok",
                    "topic": topic,
                    "from": format!("!{:08x}", decoded.from),
                    "to": format!("!{:08x}", decoded.to),
                    "packet_id": decoded.packet_id,
                    "channel_id": decoded.channel_id,
                    "gateway_id": decoded.gateway_id,
                    "encrypted": decoded.was_encrypted,
                    "kind": classified.kind(),
                    "detail": format!("{:?}", ingested),
                }),
                Err(discard) => serde_json::json!({
                    "status": "discarded",
                    "topic": topic,
                    "reason": discard.to_string(),
                }),
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
    }

    Ok(())
}

/// Load and validate the config, then start logging with it.
async fn load_config(path: &str, verbosity: u8) -> Result<Config> {
    let config = Config::load(path).await?;
    init_logging(&Some(config.clone()), verbosity);
    Ok(config)
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
    // sled and rumqttc are chatty at debug
    builder.filter_module("sled", log::LevelFilter::Info);
    builder.filter_module("rumqttc", log::LevelFilter::Info);

    let file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    let security_path = config.as_ref().and_then(|c| c.logging.security_file.clone());

    if let Some(f) = file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // a daemonised process has no TTY; the file alone gets the lines
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if record.target() == "security" {
                if let Some(ref sec_path) = security_path {
                    if let Ok(mut sf) = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(sec_path)
                    {
                        let _ = writeln!(sf, "{}", line);
                    }
                }
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
