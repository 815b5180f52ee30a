//! Grid bot binary.
//!
//! Loads the bot configuration, builds the engine, and runs it until
//! interrupted. In dry-run mode the engine plans against a seeded in-memory
//! exchange and never broadcasts, which makes it safe to try a config out:
//!
//! ```bash
//! cargo run --bin grid_bot -- --config config.toml
//! ```
//!
//! Settings in the file can be overridden with `APP_*` environment
//! variables, e.g. `APP_BOT__DRY_RUN=true`.

use std::env;
use std::sync::Arc;

use log::{error, info};
use tokio::sync::{mpsc, watch};

use gridcrawl::exchange::mock::MockExchange;
use gridcrawl::fees::FeeParams;
use gridcrawl::{BotConfig, GridEngine, Settings, Side};

#[tokio::main]
async fn main() {
    // .env is optional; system environment always applies.
    match dotenvy::dotenv() {
        Ok(path) => println!("loaded environment from {}", path.display()),
        Err(_) => {}
    }

    let args: Vec<String> = env::args().collect();
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => args[i + 1].clone(),
        _ => "config".to_string(),
    };

    let settings = match Settings::load(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load configuration '{config_path}': {e}");
            std::process::exit(2);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log.level.clone()),
    )
    .init();

    let config = match BotConfig::from_settings(&settings) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    info!(
        "grid bot for {}/{} on {} (account {})",
        config.pair.base.symbol, config.pair.quote.symbol, settings.network.node_url,
        settings.network.account
    );

    if !config.dry_run {
        error!("live trading requires an exchange client wired through gridcrawl::Exchange;");
        error!("set bot.dry_run = true to plan against the in-memory paper exchange");
        std::process::exit(2);
    }

    // Paper session: a seeded in-memory exchange, generous balances.
    let exchange = Arc::new(MockExchange::new());
    for side in [Side::Buy, Side::Sell] {
        let asset = config.pair.asset_sold(side);
        let seeded = asset.to_units(1_000_000.0);
        exchange.set_balance(&asset.id, seeded, seeded).await;
    }
    exchange
        .set_fee_params(
            &config.native_asset.id,
            FeeParams {
                create_fee: 50,
                cancel_fee: 5,
                update_fee: 50,
                maker_fee_percent: 0.1,
                taker_fee_percent: 0.2,
            },
        )
        .await;

    let engine = match GridEngine::bootstrap(config, exchange).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("engine bootstrap failed: {e}");
            std::process::exit(1);
        }
    };

    let (_fill_tx, fill_rx) = mpsc::channel(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            let _ = shutdown_tx.send(true);
        }
    });

    match engine.run(fill_rx, shutdown_rx).await {
        Ok(()) => info!("grid bot stopped"),
        Err(e) => {
            error!("grid bot error: {e}");
            std::process::exit(1);
        }
    }
}
