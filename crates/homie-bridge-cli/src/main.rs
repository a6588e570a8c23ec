//! Command-line interface for the Homie bridge.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use homie_bridge::{BridgeConfig, DisassemblerConfig, MqttBridge, PayloadDisassembler};

/// Homie Bridge - Republish vendor MQTT devices as Homie devices.
#[derive(Parser, Debug)]
#[command(name = "homie-bridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file.
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge until interrupted.
    Run,
    /// Load and validate the configuration, then print it.
    CheckConfig,
    /// Show the properties a payload disassembles into.
    Disassemble {
        /// The raw payload.
        payload: String,
        /// Context hint, usually the last topic segment.
        #[arg(long, default_value = "")]
        hint: String,
    },
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "homie_bridge=debug" } else { "homie_bridge=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // JSON output for container deployments
    let json_logging = std::env::var("HOMIE_BRIDGE_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Run => run(&args.config).await,
        Command::CheckConfig => check_config(&args.config),
        Command::Disassemble { payload, hint } => disassemble(&args.config, &payload, &hint),
    }
}

async fn run(path: &Path) -> Result<()> {
    let config = BridgeConfig::from_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    let bridge = MqttBridge::start(&config).context("Failed to start bridge")?;
    tracing::info!(version = homie_bridge::VERSION, "Bridge running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Stopping bridge");
    bridge.shutdown().await;
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = BridgeConfig::from_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    println!("Configuration OK: {}", path.display());
    println!("  profile:        {}", config.source.profile);
    println!("  homie broker:   {}", config.homie.mqtt.full_broker_addr());
    println!("  source broker:  {}", config.source_broker().full_broker_addr());
    println!("  base topic:     {}", config.homie.base_topic);
    println!("  source topics:  {}", config.base_topics().join(", "));
    println!("  required nodes: {}", config.required_nodes().join(", "));
    Ok(())
}

/// Uses the configured disassembler settings when the config file exists.
fn disassemble(path: &Path, payload: &str, hint: &str) -> Result<()> {
    let config = if path.exists() {
        BridgeConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?
            .engine_config()
            .disassembler
    } else {
        DisassemblerConfig::default()
    };
    let disassembler = PayloadDisassembler::new(config);
    let result = disassembler
        .disassemble(payload.as_bytes(), hint)
        .context("Failed to disassemble payload")?;

    let output = serde_json::json!({
        "group": result.group(),
        "properties": result.properties(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
