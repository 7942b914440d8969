/// live_main.rs — Live Trading Entry Point
///
/// FLOW:
///   1. Load config from .env (BINANCE_API_KEY, BINANCE_API_SECRET, ...)
///   2. Build the exchange: Binance REST, or PaperExchange fed with real
///      market data when PAPER_TRADING is set
///   3. Sync server time, set leverage / margin type on every symbol
///   4. Start Telegram notifier and the dashboard
///   5. Cycle every CYCLE_SECONDS until Ctrl-C
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use perp_engine::bot::Bot;
use perp_engine::config::AppConfig;
use perp_engine::dashboard::{self, DashboardState};
use perp_engine::exchange::{BinanceFutures, FuturesExchange, PaperExchange};
use perp_engine::notify::Notifier;
use perp_engine::state::BotState;
use perp_engine::trade_log::Journal;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Arc::new(AppConfig::from_env()?);
    cfg.validate()?;

    info!("╔══════════════════════════════════════════════╗");
    info!("║       PERP ENGINE  —  LIVE TRADING MODE      ║");
    info!("╚══════════════════════════════════════════════╝");
    if cfg.paper_trading {
        info!("📝 PAPER TRADING: simulated fills on real market data");
    } else if cfg.use_testnet {
        info!("🧪 TESTNET active, no real funds at risk");
    } else {
        warn!("⚠️  LIVE MODE with REAL MONEY, ensure all parameters are correct!");
    }

    // ── Exchange ──────────────────────────────────────────────────────────
    let binance = Arc::new(BinanceFutures::from_config(&cfg).context("building Binance client")?);
    match binance.sync_time().await {
        Ok(offset) => info!("⏱️ Server time offset {} ms", offset),
        Err(e) => warn!("⚠️ Time sync failed ({}), signing with local clock", e),
    }
    let exchange: Arc<dyn FuturesExchange> = if cfg.paper_trading {
        Arc::new(PaperExchange::with_market_data(binance, cfg.initial_capital, cfg.taker_fee))
    } else {
        binance
    };

    // ── Shared state, journal, notifications ─────────────────────────────
    let state = BotState::shared(&cfg);
    let journal = Arc::new(Journal::new(&cfg.trade_log_path, &cfg.log_dir));
    let (notifier, _notify_task) = Notifier::spawn(cfg.telegram());

    // ── Dashboard ─────────────────────────────────────────────────────────
    let dash = DashboardState::new(exchange.clone(), state.clone(), cfg.clone());
    let addr = cfg.dashboard_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = dashboard::serve(dash, &addr).await {
            error!("🚨 Dashboard stopped: {:#}", e);
        }
    });

    // ── Trading loop ──────────────────────────────────────────────────────
    let bot = Bot::new(exchange, state, journal, notifier, cfg);
    bot.startup().await;
    bot.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("🚨 Ctrl-C handler failed: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await;

    info!("👋 Bye");
    Ok(())
}
