//! iotlink - device client entry point

use clap::{Parser, Subcommand};
use iotlink::clock::{Clock, SystemClock};
use iotlink::credentials::{CredentialMaterial, TokenSigner, TransportConfig};
use iotlink::lifecycle_span;
use iotlink::manager::HealthMonitor;
use iotlink::observability::{init_default_logging, init_logging, LogFormat};
use iotlink::telemetry::TelemetrySample;
use iotlink::transport::RumqttConnector;
use iotlink::{ConnectionManager, DeviceConfig, DeviceError, DeviceResult, InboundMessage};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Instrument, Level};

/// Authenticated MQTT device client
#[derive(Parser)]
#[command(name = "iotlink")]
#[command(about = "Authenticated MQTT device client with self-healing connections")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "IOTLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, follow config and commands, publish telemetry until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Print the resolved configuration
        #[arg(long)]
        show: bool,
    },
    /// Mint a credential and print its metadata
    Token,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    };

    info!("Starting iotlink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_device(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Token => handle_token_command(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: Option<&PathBuf>) -> DeviceResult<DeviceConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(DeviceConfig::load_from_file(path)?);
    }

    for candidate in ["iotlink.toml", "config/iotlink.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(DeviceConfig::load_from_file(&path)?);
        }
    }

    Err(DeviceError::internal(
        "No configuration file found. Provide one with -c/--config or create iotlink.toml",
    ))
}

fn load_signer(config: &DeviceConfig) -> DeviceResult<(TokenSigner, TransportConfig)> {
    let material = CredentialMaterial::load(
        &config.credentials.roots_path,
        &config.credentials.private_key_path,
    )?;
    let signer = TokenSigner::from_pem(&material.private_key, config.credentials.algorithm)?;
    let tls = TransportConfig::build(&material.root_ca_bundle)?;
    info!(pinned_roots = tls.pinned_roots(), "Loaded credential material");
    Ok((signer, tls))
}

async fn run_device(config: DeviceConfig) -> DeviceResult<()> {
    let identity = config.identity()?;
    let (signer, tls) = load_signer(&config)?;
    let span = lifecycle_span!(client_id = %identity.client_id());

    async move {
        let manager = ConnectionManager::spawn(
            identity,
            signer,
            tls,
            config.manager_settings(),
            Arc::new(RumqttConnector),
            Arc::new(SystemClock),
        )?;

        manager
            .subscribe_config(|message: InboundMessage| {
                if message.payload.is_empty() {
                    return;
                }
                info!(
                    topic = %message.topic,
                    payload = %String::from_utf8_lossy(&message.payload),
                    "Received configuration"
                );
            })
            .await?;
        manager
            .subscribe_commands(|message: InboundMessage| {
                info!(
                    topic = %message.topic,
                    bytes = message.payload.len(),
                    "Received command"
                );
            })
            .await?;

        manager.connect().await?;
        info!("Device connected, publishing telemetry");

        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .map_err(|e| DeviceError::internal(format!("SIGINT handler: {e}")))?;
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(|e| DeviceError::internal(format!("SIGTERM handler: {e}")))?;

        let mut ticker = tokio::time::interval(config.telemetry_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sequence = 0u64;

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully...");
                    break;
                }
                _ = ticker.tick() => {
                    sequence += 1;
                    let payload = TelemetrySample::numbered(sequence, SystemClock.now()).to_payload()?;
                    match manager.publish_telemetry(payload).await {
                        Ok(()) => info!(sequence, "Published telemetry"),
                        Err(e) if e.is_retryable() => {
                            warn!(sequence, error = %e, state = %manager.state(), "Telemetry not published");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        manager.close().await;
        let health = manager.health();
        info!(
            reconnects = health.reconnect_count,
            credential_renewals = health.credential_renewals,
            quality = ?HealthMonitor::assess_connection_quality(&health),
            "Device client stopped"
        );
        Ok(())
    }
    .instrument(span)
    .await
}

fn handle_config_command(config: &DeviceConfig, show: bool) -> DeviceResult<()> {
    if show {
        println!("{}", config.to_toml()?);
    }

    info!(client_id = %config.identity()?.client_id(), "Configuration is valid");
    Ok(())
}

fn handle_token_command(config: &DeviceConfig) -> DeviceResult<()> {
    let identity = config.identity()?;
    let (signer, _) = load_signer(config)?;
    let credential = signer.sign(&identity, SystemClock.now(), config.token_lifetime())?;

    println!("client_id:  {}", identity.client_id());
    println!("audience:   {}", identity.audience());
    println!("algorithm:  {}", signer.algorithm());
    println!("issued_at:  {}", credential.issued_at());
    println!("expires_at: {}", credential.expires_at());
    Ok(())
}
