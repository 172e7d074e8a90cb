mod console;

use std::{path::PathBuf, sync::Arc};

use {
    clap::{Parser, Subcommand},
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    moobridge_bridge::Bridge,
    moobridge_chat::{ChatApi, ChatPlatform, OutboundChunker},
    moobridge_config::{BridgeConfig, discover_and_load, load_config, read_token_file},
    moobridge_moo::{MooClient, UnresolvedPlayers},
};

#[derive(Parser)]
#[command(name = "moobridge", about = "Moobridge — chat platform to MOO relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file path; standard locations are searched when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge against a console chat adapter.
    Run,
    /// Load and print the effective configuration.
    CheckConfig,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load(cli: &Cli) -> anyhow::Result<BridgeConfig> {
    match &cli.config {
        Some(path) => load_config(path),
        None => Ok(discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "moobridge starting");

    match cli.command {
        Commands::Run => run(&cli).await,
        Commands::CheckConfig => {
            let config = load(&cli)?;
            println!("{}", toml_pretty(&config)?);
            Ok(())
        },
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = load(cli)?;

    match &config.chat.token_file {
        Some(path) => {
            // The console adapter has no use for the token; loading it here
            // still validates the credential setup for a real deployment.
            let token = read_token_file(path)?;
            info!(bytes = token.len(), "bot token loaded");
        },
        None => warn!("no chat.token_file configured, running unauthenticated"),
    }

    let moo = Arc::new(MooClient::new(
        &config.moo.address,
        config.moo.service_login.clone(),
        Arc::new(UnresolvedPlayers),
    )?);
    let platform = console::ConsolePlatform::new();
    let chunker = Arc::new(OutboundChunker::new(
        Arc::clone(&platform) as Arc<dyn ChatApi>,
        config.chat.message_char_limit,
    ));
    let bridge = Bridge::new(
        Arc::clone(&platform) as Arc<dyn ChatPlatform>,
        moo,
        chunker,
    );

    info!(address = %config.moo.address, "bridging console to MOO");
    tokio::join!(bridge.run(), platform.pump_stdin());
    Ok(())
}

fn toml_pretty(config: &BridgeConfig) -> anyhow::Result<String> {
    Ok(toml::to_string_pretty(config)?)
}
