/// main.rs — Backtesting Entry Point
///
///   1. Load config from .env
///   2. Load klines for each symbol: BACKTEST_DATA_DIR parquet files when
///      set, otherwise BACKTEST_LIMIT bars downloaded from Binance
///   3. Derive confirm / trend frames by resampling the entry interval
///   4. Replay every symbol in parallel and print the reports
///
/// Symbols come from the command line, falling back to BACKTEST_SYMBOL.
use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use perp_engine::backtest::{print_trade_log, run_many, BacktestConfig, SymbolData};
use perp_engine::config::{parse_symbols, AppConfig};
use perp_engine::exchange::BinanceFutures;
use perp_engine::market_data::{fetch_history, load_klines_dir};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════╗");
    info!("║      PERP ENGINE  —  BACKTEST MODE           ║");
    info!("╚══════════════════════════════════════════════╝");

    // ── Config ───────────────────────────────────────────────────────────
    let cfg = AppConfig::from_env()?;
    cfg.validate()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let symbols = if args.is_empty() {
        vec![cfg.backtest_symbol.clone()]
    } else {
        parse_symbols(&args.join(","))
    };
    info!(
        "Config: strategy={} symbols={:?} interval={} leverage={}x risk={:.1}%",
        cfg.strategy, symbols, cfg.kline_interval, cfg.leverage, cfg.risk_per_trade * 100.0
    );

    // ── Load Data ────────────────────────────────────────────────────────
    let mut data = Vec::with_capacity(symbols.len());
    let client = BinanceFutures::from_config(&cfg)?;
    for symbol in &symbols {
        let klines = match &cfg.backtest_data_dir {
            Some(dir) => load_klines_dir(Path::new(dir), symbol, &cfg.kline_interval)?,
            None => {
                info!("Fetching {} {} klines of {} from {}...", cfg.backtest_limit, cfg.kline_interval, symbol, cfg.rest_url);
                fetch_history(&client, symbol, &cfg.kline_interval, cfg.backtest_limit).await?
            }
        };
        if klines.is_empty() {
            bail!("No kline data for {}.  Check symbol, interval, and connectivity.", symbol);
        }
        info!("{}: {} bars ({} → {})",
            symbol,
            klines.len(),
            klines.first().map(|k| k.open_time).unwrap_or(0),
            klines.last().map(|k| k.open_time).unwrap_or(0)
        );
        data.push(SymbolData::from_entry(symbol, klines, &cfg).with_context(|| format!("resampling {symbol}"))?);
    }

    // ── Run Backtests ─────────────────────────────────────────────────────
    let bt_cfg = BacktestConfig { verbose: true, ..BacktestConfig::for_interval(&cfg.kline_interval) };
    for (symbol, result) in run_many(&data, &cfg, &bt_cfg) {
        match result {
            Ok(report) => {
                println!("\n{}  ({} signals, {} rejected)", symbol, report.signals, report.rejections);
                print_trade_log(&report.trades, 50);
                println!("\n{}", report.perf);
            }
            Err(e) => error!("{} backtest failed: {:#}", symbol, e),
        }
    }

    Ok(())
}
