//! hedge-bot: multi-venue funding-rate arbitrage and hedge engine.
//!
//! Usage:
//!   hedge-bot [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>     Config file path (default: config/hedge.toml)
//!   --auto-hedge            Enable automatic hedge opens (overrides config)
//!   --paper                 Run against mock venues instead of live adapters
//!   --log-level <LEVEL>     Log level (overrides config)

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rust_decimal_macros::dec;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use hedge_bot::config::BotConfig;
use hedge_bot::engine::Engine;
use hedge_bot::venue::{MockVenue, MockVenueConfig, VenueAdapter};

/// CLI arguments for hedge-bot.
#[derive(Parser, Debug)]
#[command(name = "hedge-bot")]
#[command(about = "Multi-venue funding-rate arbitrage and hedge engine")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/hedge.toml")]
    config: PathBuf,

    /// Enable automatic hedge opens (overrides config)
    #[arg(long)]
    auto_hedge: bool,

    /// Run against mock venues instead of live adapters
    #[arg(long)]
    paper: bool,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: failed to load .env file: {}", e);
        }
    }

    let args = Args::parse();

    // Config errors are fatal; transient venue errors never are.
    let mut config = if args.config.exists() {
        BotConfig::from_file(&args.config)
            .with_context(|| format!("failed to load config from {:?}", args.config))?
    } else {
        warn!("config file not found at {:?}, using defaults", args.config);
        BotConfig::default()
    };
    config.apply_env_overrides();

    if args.auto_hedge {
        config.auto_hedge = true;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let level: Level = config
        .log_level
        .parse()
        .with_context(|| format!("invalid log level {:?}", config.log_level))?;
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let venues = build_venues(&config, args.paper)?;
    info!(
        venues = venues.len(),
        auto_hedge = config.auto_hedge,
        paper = args.paper,
        "starting hedge-bot"
    );

    let engine = Arc::new(Engine::new(config, venues));

    // SIGINT triggers graceful shutdown; hedges stay open on the venues.
    let signal_engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("SIGINT received");
            signal_engine.shutdown();
        }
    });

    engine.run().await;
    Ok(())
}

/// Instantiate the configured venues.
///
/// Live adapters are out-of-tree SDK crates wired in by deployments; this
/// binary ships the paper set for end-to-end dry runs.
fn build_venues(
    config: &BotConfig,
    paper: bool,
) -> Result<HashMap<String, Arc<dyn VenueAdapter>>> {
    if !paper {
        bail!(
            "no live venue adapters are linked into this binary; \
             run with --paper or embed the engine as a library"
        );
    }

    // Each configured venue keeps its symbol map, so canonical names are
    // translated at the adapter boundary exactly as a live SDK would.
    let mock_configs: Vec<MockVenueConfig> = if config.venues.is_empty() {
        vec![
            MockVenueConfig::new("binance"),
            MockVenueConfig::new("okx"),
        ]
    } else {
        config
            .venues
            .iter()
            .map(|(name, creds)| {
                MockVenueConfig::new(name.clone()).with_symbol_map(creds.symbol_map.clone())
            })
            .collect()
    };

    let mut venues: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
    for mock_config in mock_configs {
        let name = mock_config.name.clone();
        let mock = MockVenue::new(mock_config);
        mock.set_balances(dec!(10000), dec!(10000));
        venues.insert(name, Arc::new(mock));
    }
    Ok(venues)
}
