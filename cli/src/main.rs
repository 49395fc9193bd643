// blesc — scanner node host CLI
//
// Provisions the node store, reports node status and drives the engine
// against scripted peers.

mod config;
mod sim;

use anyhow::{Context, Result};
use blesc_core::transport::ble::format_mac;
use blesc_core::{
    Action, Configuration, Engine, Event, NodeKeys, PeerKey, RecordsExt, RetainedFault,
    SledStore,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "blesc")]
#[command(about = "BLE scanner node host tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Record store to use instead of the configured one
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Log filter, overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a node key pair and a backend key pair
    Keygen {
        #[arg(long)]
        json: bool,
    },
    /// Store a node configuration
    Provision {
        /// Node id, decimal or 0x-prefixed hex
        #[arg(long)]
        node_id: String,
        /// Node private key, 32 bytes hex
        #[arg(long)]
        private_key: String,
        /// Backend public key, 64 bytes hex
        #[arg(long)]
        peer_public_key: String,
    },
    /// Boot the node over its store and show what it would do
    Status,
    /// Run the engine against scripted peers
    Simulate {
        /// Scenario file (JSON); a built-in scenario otherwise
        #[arg(short, long)]
        scenario: Option<PathBuf>,
        /// Override the scenario duration
        #[arg(short, long)]
        duration: Option<u32>,
        #[arg(long, default_value = "1")]
        seed: u64,
        /// Pace virtual seconds with the wall clock
        #[arg(long)]
        realtime: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show every value
    Show,
    /// Write the defaults to the config file
    Init {
        #[arg(long)]
        force: bool,
    },
    Set { key: String, value: String },
    Get { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::Config::config_file()?,
    };
    let mut config = config::Config::load_from(&config_path)?;
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(store) = &cli.store {
        config.storage_path = Some(store.display().to_string());
    }
    let _guard = init_logging(&config)?;

    match cli.command {
        Commands::Keygen { json } => cmd_keygen(json),
        Commands::Provision {
            node_id,
            private_key,
            peer_public_key,
        } => cmd_provision(&config, &node_id, &private_key, &peer_public_key),
        Commands::Status => cmd_status(&config),
        Commands::Simulate {
            scenario,
            duration,
            seed,
            realtime,
            json,
        } => cmd_simulate(&config, scenario, duration, seed, realtime, json).await,
        Commands::Config { action } => cmd_config(config, &config_path, action),
    }
}

/// Install the subscriber. The guard flushes the file writer on drop.
fn init_logging(config: &config::Config) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "blesc.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    let json_layer = config
        .log_json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!config.log_json).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install log subscriber")?;
    Ok(guard)
}

fn open_store(config: &config::Config) -> Result<SledStore> {
    let path = config.store_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create store directory")?;
    }
    let path = path.to_str().context("Store path is not valid UTF-8")?;
    SledStore::open(path).context("Failed to open record store")
}

fn parse_node_id(text: &str) -> Result<u32> {
    let id = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    id.with_context(|| format!("Invalid node id: {}", text))
}

fn cmd_keygen(json: bool) -> Result<()> {
    let node = NodeKeys::generate();
    let backend = NodeKeys::generate();

    if json {
        let out = serde_json::json!({
            "node": {
                "private_key": hex::encode(node.to_bytes().as_slice()),
                "public_key": hex::encode(node.public_key()),
            },
            "backend": {
                "private_key": hex::encode(backend.to_bytes().as_slice()),
                "public_key": hex::encode(backend.public_key()),
            },
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{}", "Node Key Pair".bold());
    println!("  Private Key: {}", hex::encode(node.to_bytes().as_slice()).bright_yellow());
    println!("  Public Key:  {}", hex::encode(node.public_key()).bright_cyan());
    println!();
    println!("{}", "Backend Key Pair".bold());
    println!("  Private Key: {}", hex::encode(backend.to_bytes().as_slice()).bright_yellow());
    println!("  Public Key:  {}", hex::encode(backend.public_key()).bright_cyan());
    println!();
    println!("{}", "⚠️  Keep the private keys secure!".bright_red().bold());
    println!();
    println!("{}", "Next step:".bold());
    println!(
        "  • {}",
        "blesc provision --node-id <id> --private-key <node> --peer-public-key <backend>"
            .bright_green()
    );
    Ok(())
}

fn cmd_provision(
    config: &config::Config,
    node_id: &str,
    private_key: &str,
    peer_public_key: &str,
) -> Result<()> {
    let configuration = Configuration {
        node_id: parse_node_id(node_id)?,
        private_key: hex::decode(private_key).context("Private key is not hex")?,
        peer_public_key: hex::decode(peer_public_key).context("Peer public key is not hex")?,
    };
    configuration.validate().context("Rejected configuration")?;
    NodeKeys::from_bytes(&configuration.private_key).context("Unusable private key")?;
    PeerKey::from_raw(&configuration.peer_public_key).context("Unusable peer public key")?;

    let store = open_store(config)?;
    let mut engine = Engine::new(
        config.scanner.clone(),
        Box::new(store),
        RetainedFault::default(),
        config.node_mac()?,
    )
    .context("Invalid scanner settings")?;
    engine.handle_event(Event::Boot);

    let actions = engine.commit_config(&configuration);
    let stored = engine.store().load_config().context("Failed to read back configuration")?;
    if stored.as_ref() != Some(&configuration) {
        anyhow::bail!("Configuration was not stored, records erased");
    }
    if actions.contains(&Action::Reboot) {
        println!("{} Configuration stored", "✓".green());
        println!("  Node ID:   {}", format!("0x{:08X}", configuration.node_id).bright_cyan());
        println!(
            "  Store:     {}",
            config.store_path()?.display().to_string().bright_cyan()
        );
        println!("  The node reboots into the new configuration.");
    }
    Ok(())
}

fn cmd_status(config: &config::Config) -> Result<()> {
    let store = open_store(config)?;
    let node_mac = config.node_mac()?;
    let mut engine = Engine::new(
        config.scanner.clone(),
        Box::new(store),
        RetainedFault::default(),
        node_mac,
    )
    .context("Invalid scanner settings")?;
    let actions = engine.handle_event(Event::Boot);

    println!("{}", "Node Status".bold());
    println!("  Version:     {}", blesc_core::version());
    println!("  MAC:         {}", format_mac(&node_mac).bright_cyan());
    println!(
        "  State:       {:?} ({})",
        engine.state(),
        sim::describe(engine.state())
    );
    if engine.is_provisioned() {
        println!("  Provisioned: {}", "yes".green());
    } else {
        println!("  Provisioned: {}", "no".yellow());
    }
    if let Some(key) = engine.node_public_key() {
        println!("  Public Key:  {}", hex::encode(key).bright_yellow());
    }
    println!("  RSSI limit:  {} dBm", engine.params().rssi_lower_limit);
    if actions.contains(&Action::Reboot) {
        println!("  {} Storage failed during boot, records erased", "✗".red());
    }
    println!();

    println!("{}", "Scanner".bold());
    for (key, value) in config.list().into_iter().skip(5) {
        println!("  {:<26} {}", key, value);
    }
    Ok(())
}

async fn cmd_simulate(
    config: &config::Config,
    scenario: Option<PathBuf>,
    duration: Option<u32>,
    seed: u64,
    realtime: bool,
    json: bool,
) -> Result<()> {
    let mut scenario = match scenario {
        Some(path) => sim::Scenario::load(&path)?,
        None => sim::Scenario::default(),
    };
    if let Some(duration) = duration {
        scenario.duration_secs = duration;
    }
    let duration = scenario.duration_secs;

    let mut simulator =
        sim::Simulator::new(scenario, config.scanner.clone(), config.node_mac()?, seed)?;

    if !json {
        println!(
            "{} Simulating {}s with node {}",
            "→".bright_blue(),
            duration,
            format!("0x{:08X}", sim::SIM_NODE_ID).bright_cyan()
        );
    }

    let mut pacer = realtime.then(|| tokio::time::interval(Duration::from_secs(1)));
    while !simulator.is_finished() {
        if let Some(pacer) = pacer.as_mut() {
            pacer.tick().await;
        }
        simulator.step()?;
    }

    let report = simulator.report();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("{}", "Simulation Report".bold());
    println!("  Seconds:      {}", report.seconds);
    println!("  Final state:  {}", report.final_state);
    println!(
        "  Connections:  {} ({} failed)",
        report.connections, report.failed_connections
    );
    println!("  Disconnects:  {}", report.disconnects);
    if let Some(halt) = &report.halted_by {
        println!("  {} Node left with {}", "!".yellow(), halt);
    }
    println!();
    println!("{}", "Peers".bold());
    for peer in &report.peers {
        println!(
            "  • {:<12} {} connections, {} samples, {} health, {} verified, {} commands",
            peer.name.bright_cyan(),
            peer.connections,
            peer.samples_uploaded,
            peer.health_records,
            peer.signatures_verified,
            peer.commands_sent
        );
    }
    Ok(())
}

fn cmd_config(
    mut config: config::Config,
    path: &std::path::Path,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!("  File: {}", path.display().to_string().bright_cyan());
            println!();
            for (key, value) in config.list() {
                println!("  {:<26} {}", key.bright_green(), value);
            }
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!("{} exists, use --force to overwrite", path.display());
            }
            config::Config::default().save_to(path)?;
            println!("{} Wrote defaults to {}", "✓".green(), path.display());
        }
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save_to(path)?;
            println!("{} {} = {}", "✓".green(), key, value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
    }
    Ok(())
}
