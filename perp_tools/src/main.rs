/// main.rs — Maintenance CLI
///
/// Usage:
///   perp_tools fetch --symbol BTCUSDT --interval 15m --limit 5000 --out data
///   perp_tools analyze --log trade_logs.json
///   perp_tools orders UNIUSDT --cancel
///   perp_tools pairs --recommended --out symbols.txt
///
/// Exchange access uses the same .env keys as the bot.
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use perp_engine::config::AppConfig;
use perp_engine::exchange::{BinanceFutures, FuturesExchange};
use perp_engine::market_data::{fetch_history, write_parquet_klines};
use perp_engine::metrics::analyze_trades;
use perp_engine::trade_log::read_records;
use perp_tools::symbols;

#[derive(Parser)]
#[command(name = "perp_tools")]
#[command(about = "Perp engine maintenance: data download, log analysis, order housekeeping")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download klines to parquet (out/SYMBOL/SYMBOL_<ts>.parquet)
    Fetch {
        /// Trading symbol (e.g., BTCUSDT)
        #[arg(short, long, default_value = "BTCUSDT")]
        symbol: String,

        /// Kline interval
        #[arg(short, long, default_value = "15m")]
        interval: String,

        /// Number of bars (fetched in batches of 1000)
        #[arg(short, long, default_value = "5000")]
        limit: u64,

        /// Output directory
        #[arg(short, long, default_value = "data")]
        out: PathBuf,
    },

    /// Performance report from the JSON trade log
    Analyze {
        #[arg(short, long, default_value = "trade_logs.json")]
        log: PathBuf,
    },

    /// List (and optionally cancel) open orders for a symbol
    Orders {
        symbol: String,

        /// Cancel every listed order
        #[arg(long)]
        cancel: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// List PERPETUAL USDT-M symbols
    Pairs {
        /// Write one symbol per line to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Only the curated recommended tiers that are currently listed
        #[arg(long)]
        recommended: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Fetch { symbol, interval, limit, out } => fetch(&symbol.to_uppercase(), &interval, limit, &out).await,
        Commands::Analyze { log } => analyze(&log),
        Commands::Orders { symbol, cancel, yes } => orders(&symbol.to_uppercase(), cancel, yes).await,
        Commands::Pairs { out, recommended } => pairs(out, recommended).await,
    }
}

fn client() -> Result<BinanceFutures> {
    let cfg = AppConfig::from_env()?;
    BinanceFutures::from_config(&cfg).context("building Binance client")
}

async fn fetch(symbol: &str, interval: &str, limit: u64, out: &PathBuf) -> Result<()> {
    let client = client()?;
    let klines = fetch_history(&client, symbol, interval, limit).await?;
    if klines.is_empty() {
        anyhow::bail!("no klines returned for {symbol} {interval}");
    }
    let path = out
        .join(symbol)
        .join(format!("{}_{}.parquet", symbol, Utc::now().format("%Y%m%d_%H%M%S")));
    write_parquet_klines(&klines, &path)?;
    info!("💾 {} bars written to {}", klines.len(), path.display());
    Ok(())
}

fn analyze(log: &PathBuf) -> Result<()> {
    let records = read_records(log)?;
    info!("Loaded {} records from {}", records.len(), log.display());
    print!("{}", analyze_trades(&records));
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} (yes/no): ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let answer = line.trim().to_lowercase();
    Ok(answer == "yes" || answer == "y")
}

async fn orders(symbol: &str, cancel: bool, yes: bool) -> Result<()> {
    let client = client()?;
    if let Err(e) = client.sync_time().await {
        warn!("⚠️ Time sync failed: {}", e);
    }
    let open = client.open_orders(Some(symbol)).await?;
    if open.is_empty() {
        println!("✅ No open orders found for {symbol}");
        return Ok(());
    }

    println!("\n📋 Found {} open order(s) for {}:\n", open.len(), symbol);
    for (i, o) in open.iter().enumerate() {
        let price = if o.price > 0.0 { o.price } else { o.stop_price };
        println!(
            "{}. #{} {} {} price {} qty {} {}{}",
            i + 1,
            o.order_id,
            o.order_type,
            o.side,
            price,
            o.orig_qty,
            o.status,
            if o.close_position { " closePosition" } else if o.reduce_only { " reduceOnly" } else { "" }
        );
    }

    if !cancel {
        return Ok(());
    }
    if !yes && !confirm(&format!("Cancel ALL {} order(s)?", open.len()))? {
        println!("❌ Nothing cancelled.");
        return Ok(());
    }
    for o in &open {
        match client.cancel_order(symbol, o.order_id).await {
            Ok(()) => println!("✅ Cancelled {} order {}", o.order_type, o.order_id),
            Err(e) => error!("❌ Failed to cancel order {}: {}", o.order_id, e),
        }
    }
    Ok(())
}

async fn pairs(out: Option<PathBuf>, recommended: bool) -> Result<()> {
    let listed = client()?.perpetual_symbols().await?;
    let list: Vec<String> = if recommended {
        symbols::listed_recommended(&listed).into_iter().map(str::to_owned).collect()
    } else {
        listed
    };

    match out {
        Some(path) => {
            let mut text = list.join("\n");
            text.push('\n');
            std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
            info!("{} symbols saved to {}", list.len(), path.display());
        }
        None => list.iter().for_each(|s| println!("{s}")),
    }
    Ok(())
}
