/// backtest.rs — Bar-replay backtesting engine
///
/// Replays closed entry-interval bars through the same strategy, sizing and
/// stop-management code the live bot runs.  Higher timeframes only see bars
/// that had closed by the current entry bar, so nothing leaks from the
/// future.
///
/// PER BAR
/// ┌──────────────────────────────────────────────────────────┐
/// │  open trade?                                             │
/// │   ├─ stop-loss   (low / high touched; checked first)     │
/// │   ├─ take-profit (high / low touched)                    │
/// │   ├─ ROI / indicator exits on the close                  │
/// │   └─ breakeven / trailing → new stop, live from next bar │
/// │  flat and breaker not paused?                            │
/// │   └─ Snapshot → Strategy::evaluate → size → fill @ close │
/// │  equity_curve[t] = cash + unrealised PnL at close        │
/// └──────────────────────────────────────────────────────────┘
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::{bars_per_year, AppConfig};
use crate::exchange::{Direction, Kline, SymbolFilters};
use crate::execution::ClosedTrade;
use crate::market_data::{closed_by, resample};
use crate::metrics::{compute_metrics, PerfReport};
use crate::risk::{roi_pct, size_position, CircuitBreaker};
use crate::state::{ManagedTrade, TradePhase};
use crate::strategy::{build_strategy, exit_decision, Decision, ExitReason, Snapshot, Strategy};
use crate::time_filter::entries_allowed;

/// Backtest run parameters (separate from strategy config).
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    /// Log every entry and exit (true) or only the summary (false)
    pub verbose:       bool,
    /// Bars per year (for annualisation in metrics)
    pub bars_per_year: f64,
    /// Contract grid used for sizing
    pub filters:       SymbolFilters,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self { verbose: false, bars_per_year: 35_040.0, filters: SymbolFilters::default() }
    }
}

impl BacktestConfig {
    pub fn for_interval(interval: &str) -> Self {
        Self { bars_per_year: bars_per_year(interval), ..Self::default() }
    }
}

/// Klines for one symbol on the three configured intervals.
#[derive(Debug, Clone)]
pub struct SymbolData {
    pub symbol:  String,
    pub entry:   Vec<Kline>,
    pub confirm: Vec<Kline>,
    pub trend:   Vec<Kline>,
}

impl SymbolData {
    /// Derive confirm and trend frames by resampling the entry klines.
    pub fn from_entry(symbol: &str, entry: Vec<Kline>, cfg: &AppConfig) -> Result<Self> {
        Ok(Self {
            symbol:  symbol.to_owned(),
            confirm: resample(&entry, &cfg.confirm_interval)?,
            trend:   resample(&entry, &cfg.trend_interval)?,
            entry,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub symbol:       String,
    pub trades:       Vec<ClosedTrade>,
    pub equity_curve: Vec<f64>,
    pub signals:      usize,
    pub rejections:   usize,
    pub perf:         PerfReport,
}

fn bar_time(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Last `n` elements of a slice.
fn tail<T>(v: &[T], n: usize) -> &[T] {
    &v[v.len().saturating_sub(n)..]
}

/// Exit a trade on this bar?  Returns (exit price, reason).
///
/// The stop is checked before the target: a bar that spans both is
/// counted as a loss.  A bar opening beyond a level fills at the open.
fn bar_exit(
    trade: &ManagedTrade,
    bar:   &Kline,
    snap:  Option<&Snapshot>,
    cfg:   &AppConfig,
) -> Option<(f64, ExitReason)> {
    let (adverse, favourable) = match trade.direction {
        Direction::Long  => (bar.low, bar.high),
        Direction::Short => (bar.high, bar.low),
    };

    if trade.stop_hit(adverse) {
        let px = if trade.stop_hit(bar.open) { bar.open } else { trade.stop_loss };
        return Some((px, ExitReason::StopLoss));
    }
    if trade.target_hit(favourable) {
        let px = if trade.target_hit(bar.open) { bar.open } else { trade.take_profit };
        return Some((px, ExitReason::TakeProfit));
    }

    let amount = trade.quantity_f64() * trade.direction.sign();
    let roi = roi_pct(trade.entry_price, bar.close, amount, trade.leverage);
    exit_decision(trade.direction, roi, snap, cfg).map(|reason| (bar.close, reason))
}

/// Run a complete backtest over one symbol.
pub fn run_backtest(
    data:     &SymbolData,
    strategy: &dyn Strategy,
    cfg:      &AppConfig,
    bt_cfg:   &BacktestConfig,
) -> Result<BacktestReport> {
    let bars = &data.entry;
    if bars.len() < 2 {
        bail!("{}: backtest requires at least 2 bars, got {}", data.symbol, bars.len());
    }

    let lookback = cfg.kline_lookback.max(2) as usize;
    let mut cash = cfg.initial_capital;
    let mut breaker = CircuitBreaker::from_config(cfg);
    let mut position: Option<ManagedTrade> = None;
    let mut trades: Vec<ClosedTrade> = Vec::new();
    let mut equity_curve: Vec<f64> = Vec::with_capacity(bars.len());
    let (mut signals, mut rejections) = (0usize, 0usize);

    info!("═══════════════════════════════════════════════");
    info!("  PERP ENGINE BACKTEST  {} | {} bars | {}", data.symbol, bars.len(), strategy.name());
    info!("═══════════════════════════════════════════════");

    // ── Main event loop ───────────────────────────────────────────────────
    for (i, bar) in bars.iter().enumerate() {
        let now = bar_time(bar.close_time);
        let window = tail(&bars[..=i], lookback);
        let confirm = tail(closed_by(&data.confirm, bar.close_time), lookback);
        let trend = tail(closed_by(&data.trend, bar.close_time), lookback);
        let snap = Snapshot::build(window, confirm, trend, cfg);

        // ── Manage the open trade ─────────────────────────────────────────
        if let Some(trade) = position.as_mut() {
            if let Some((exit, reason)) = bar_exit(trade, bar, snap.as_ref(), cfg) {
                let closed = ClosedTrade::from_trade(trade, exit, cfg.taker_fee, reason, now);
                cash += closed.pnl;
                if bt_cfg.verbose {
                    info!(
                        "  [Bar {:>5}] CLOSE {:<5} @ {:.4}  PnL {:+.2}  {}",
                        i, closed.direction, closed.exit_price, closed.pnl, closed.reason
                    );
                }
                if breaker.record(closed.pnl, now) {
                    warn!("🛑 {} breaker tripped at bar {}, paused until {:?}", data.symbol, i, breaker.paused_until);
                }
                trades.push(closed);
                position = None;
            } else {
                let atr = snap.as_ref().map(|s| s.atr).unwrap_or(trade.atr);
                if let Some(update) = trade.next_stop(bar.close, atr, cfg) {
                    trade.apply(update, None);
                }
            }
        }

        // ── Entries ───────────────────────────────────────────────────────
        if position.is_none() && !breaker.is_paused(now) && entries_allowed(cfg, now).0 {
            if let Some(snap) = snap.as_ref() {
                match strategy.evaluate(snap, cfg) {
                    Decision::Enter(signal) => {
                        signals += 1;
                        match size_position(cash, signal.entry_price, signal.stop_loss, cfg.leverage, cfg, &bt_cfg.filters) {
                            Ok(sizing) => {
                                if bt_cfg.verbose {
                                    info!(
                                        "  [Bar {:>5}] OPEN  {:<5} @ {:.4}  SL {:.4}  TP {:.4}  qty {}",
                                        i, signal.direction, signal.entry_price, signal.stop_loss,
                                        signal.take_profit, sizing.quantity
                                    );
                                }
                                position = Some(ManagedTrade {
                                    symbol:        data.symbol.clone(),
                                    direction:     signal.direction,
                                    entry_price:   signal.entry_price,
                                    quantity:      sizing.quantity,
                                    leverage:      cfg.leverage,
                                    initial_stop:  signal.stop_loss,
                                    stop_loss:     signal.stop_loss,
                                    take_profit:   signal.take_profit,
                                    stop_order_id: None,
                                    tp_order_id:   None,
                                    phase:         TradePhase::Initial,
                                    atr:           signal.atr,
                                    opened_at:     now,
                                    reason:        signal.reason,
                                });
                            }
                            Err(e) => warn!("⚠️ bar {} sizing failed: {}", i, e),
                        }
                    }
                    Decision::Reject(_) => rejections += 1,
                    Decision::Skip(_) => {}
                }
            }
        }

        // Record equity AFTER processing bar
        let open_pnl = position.as_ref().map(|t| t.pnl_at(bar.close)).unwrap_or(0.0);
        equity_curve.push(cash + open_pnl);
    }

    // ── Force-close any remaining open position at last price ─────────────
    if let (Some(trade), Some(last)) = (position.take(), bars.last()) {
        let closed = ClosedTrade::from_trade(&trade, last.close, cfg.taker_fee, ExitReason::EndOfData, bar_time(last.close_time));
        cash += closed.pnl;
        trades.push(closed);
        if let Some(e) = equity_curve.last_mut() {
            *e = cash;
        }
    }

    // ── Compute metrics ───────────────────────────────────────────────────
    let perf = compute_metrics(&trades, &equity_curve, cfg.initial_capital, cash, bt_cfg.bars_per_year);
    info!("{}", perf);

    Ok(BacktestReport {
        symbol: data.symbol.clone(),
        trades,
        equity_curve,
        signals,
        rejections,
        perf,
    })
}

/// Backtest several symbols in parallel with the configured strategy.
pub fn run_many(data: &[SymbolData], cfg: &AppConfig, bt_cfg: &BacktestConfig) -> Vec<(String, Result<BacktestReport>)> {
    let strategy = build_strategy(cfg.strategy);
    data.par_iter()
        .map(|d| (d.symbol.clone(), run_backtest(d, strategy.as_ref(), cfg, bt_cfg)))
        .collect()
}

/// Print a summary table of closed trades (first `top_n`).
pub fn print_trade_log(trades: &[ClosedTrade], top_n: usize) {
    println!(
        "\n{:<5} {:<6} {:<12} {:<12} {:<10} {:<8} {}",
        "N", "DIR", "ENTRY", "EXIT", "PNL", "ROI%", "REASON"
    );
    println!("{}", "─".repeat(78));

    for (i, t) in trades.iter().enumerate().take(top_n) {
        println!(
            "{:<5} {:<6} {:<12.4} {:<12.4} {:<+10.2} {:<+8.2} {}",
            i + 1,
            t.direction,
            t.entry_price,
            t.exit_price,
            t.pnl,
            t.roi_pct(),
            t.reason,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::fixtures::long_trade;
    use crate::strategy::snapshot::fixtures::{klines_from_closes, uptrend};
    use crate::strategy::{atr_bracket, Checks, EntrySignal};

    /// Enters in a fixed direction whenever flat.
    struct Always(Direction);

    impl Strategy for Always {
        fn name(&self) -> &'static str {
            "always"
        }

        fn evaluate(&self, snap: &Snapshot, cfg: &AppConfig) -> Decision {
            let (stop_loss, take_profit) = atr_bracket(self.0, snap.close, snap.atr, cfg);
            Decision::Enter(EntrySignal {
                direction:   self.0,
                entry_price: snap.close,
                stop_loss,
                take_profit,
                atr:         snap.atr,
                reason:      "test".into(),
                checks:      Checks::default(),
            })
        }
    }

    fn cfg() -> AppConfig {
        AppConfig { use_time_filter: false, taker_fee: 0.0, ..AppConfig::default() }
    }

    fn data(n: usize) -> SymbolData {
        let entry = klines_from_closes(&uptrend(n, 100.0, 0.5), 900_000, 0.3);
        SymbolData { symbol: "BTCUSDT".into(), confirm: Vec::new(), trend: entry.clone(), entry }
    }

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Kline {
        Kline { open_time: 0, open, high, low, close, volume: 1.0, close_time: 899_999 }
    }

    #[test]
    fn stop_checked_before_target() {
        let trade = long_trade(100.0, 95.0); // TP 110
        let (px, reason) = bar_exit(&trade, &bar(100.0, 111.0, 94.0, 105.0), None, &cfg()).unwrap();
        assert_eq!(reason, ExitReason::StopLoss);
        assert_eq!(px, 95.0);
    }

    #[test]
    fn gap_through_level_fills_at_open() {
        let trade = long_trade(100.0, 95.0);
        let (px, reason) = bar_exit(&trade, &bar(92.0, 93.0, 91.0, 92.5), None, &cfg()).unwrap();
        assert_eq!(reason, ExitReason::StopLoss);
        assert_eq!(px, 92.0);

        let (px, reason) = bar_exit(&trade, &bar(112.0, 113.0, 111.0, 112.0), None, &cfg()).unwrap();
        assert_eq!(reason, ExitReason::TakeProfit);
        assert_eq!(px, 112.0);
    }

    #[test]
    fn roi_exit_on_close() {
        // 10x: +5% price = +50% ROI, below the 110 target
        let trade = long_trade(100.0, 95.0);
        let (px, reason) = bar_exit(&trade, &bar(104.0, 105.5, 103.5, 105.0), None, &cfg()).unwrap();
        assert_eq!(px, 105.0);
        assert_eq!(reason, ExitReason::RoiTakeProfit(50.0));
        assert!(bar_exit(&trade, &bar(100.0, 101.0, 99.0, 100.5), None, &cfg()).is_none());
    }

    #[test]
    fn too_few_bars_is_an_error() {
        let d = SymbolData { symbol: "X".into(), entry: Vec::new(), confirm: Vec::new(), trend: Vec::new() };
        assert!(run_backtest(&d, &Always(Direction::Long), &cfg(), &BacktestConfig::default()).is_err());
    }

    #[test]
    fn longs_in_an_uptrend_make_money() {
        let d = data(200);
        let report = run_backtest(&d, &Always(Direction::Long), &cfg(), &BacktestConfig::default()).unwrap();
        assert_eq!(report.equity_curve.len(), 200);
        assert!(report.perf.n_trades > 0);
        assert!(report.perf.final_equity > report.perf.initial_equity);
        assert!(report.trades.windows(2).all(|w| w[0].closed_at <= w[1].opened_at));
    }

    #[test]
    fn breaker_pauses_after_consecutive_losses() {
        let cfg = cfg();
        let d = data(400);
        let report = run_backtest(&d, &Always(Direction::Short), &cfg, &BacktestConfig::default()).unwrap();
        let losses = cfg.max_consecutive_losses as usize;
        assert!(report.trades.len() > losses);
        assert!(report.trades[..losses].iter().all(|t| t.pnl < 0.0));
        let gap = report.trades[losses].opened_at - report.trades[losses - 1].closed_at;
        assert!(gap >= chrono::Duration::hours(cfg.loss_pause_hours));
    }

    #[test]
    fn run_many_covers_every_symbol() {
        let cfg = cfg();
        let mut eth = data(150);
        eth.symbol = "ETHUSDT".into();
        let results = run_many(&[data(150), eth], &cfg, &BacktestConfig::default());
        let symbols: Vec<&str> = results.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(symbols, ["BTCUSDT", "ETHUSDT"]);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }
}
