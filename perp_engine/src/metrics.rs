/// metrics.rs — Backtest statistics and trade-log analysis
///
/// Backtest report (`compute_metrics`)
///   bar return     r_t = E_t / E_{t−1} − 1 over the per-bar equity curve
///   Sharpe         mean(r) / sd(r) · √bars_per_year   (sample sd, r_f = 0)
///   Sortino        mean(r) / √mean(min(r, 0)²) · √bars_per_year
///   max drawdown   min_t (E_t − peak_t) / peak_t, a fraction ≤ 0
///   CAGR           (E_end / E_0)^(1 / years) − 1, years = bars / bars_per_year
///   Calmar         CAGR / |max drawdown|
///   profit factor  Σ winning PnL / |Σ losing PnL| in USDT
///
/// Ratios with a zero denominator are `None` rather than ∞ so reports
/// serialise to plain JSON.
///
/// Trade-log analysis (`analyze_trades`, USDT, from the JSON trade log)
///   opens and closes are paired per symbol in time order
///   PnL = close record's pnl, else (close − open) · qty, negated for SELL entries
///   losses are PnL ≤ 0
///   equity = cumulative PnL by close time; drawdown measured on that curve

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::execution::ClosedTrade;
use crate::trade_log::{TradeEvent, TradeRecord};

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerfReport {
    pub n_trades:       usize,
    pub n_bars:         usize,
    pub win_rate:       f64,
    /// Mean winning / losing trade as a fraction of entry notional
    pub avg_win:        f64,
    pub avg_loss:       f64,
    pub profit_factor:  Option<f64>,
    pub total_return:   f64,
    pub cagr:           f64,
    pub sharpe:         f64,
    pub sortino:        Option<f64>,
    pub max_drawdown:   f64,
    pub calmar:         Option<f64>,
    pub initial_equity: f64,
    pub final_equity:   f64,
}

/// `None` ratios print as ∞.
fn ratio(v: Option<f64>) -> String {
    v.map_or_else(|| "∞".to_owned(), |x| format!("{x:.3}"))
}

impl fmt::Display for PerfReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "════════════════════════════════════════════")?;
        writeln!(f, "  PERP ENGINE · BACKTEST REPORT")?;
        writeln!(f, "════════════════════════════════════════════")?;
        writeln!(f, "  Trades / bars  : {} / {}", self.n_trades, self.n_bars)?;
        writeln!(f, "  Win rate       : {:.2}%", self.win_rate * 100.0)?;
        writeln!(f, "  Avg win / loss : {:.3}% / {:.3}%", self.avg_win * 100.0, self.avg_loss * 100.0)?;
        writeln!(f, "  Profit factor  : {}", ratio(self.profit_factor))?;
        writeln!(f, "  Total return   : {:.2}%  (CAGR {:.2}%)", self.total_return * 100.0, self.cagr * 100.0)?;
        writeln!(f, "  Sharpe         : {:.3}", self.sharpe)?;
        writeln!(f, "  Sortino        : {}", ratio(self.sortino))?;
        writeln!(f, "  Max drawdown   : {:.2}%", self.max_drawdown * 100.0)?;
        writeln!(f, "  Calmar         : {}", ratio(self.calmar))?;
        writeln!(f, "  Equity         : ${:.2} → ${:.2}", self.initial_equity, self.final_equity)?;
        writeln!(f, "════════════════════════════════════════════")
    }
}

/// Backtest statistics.  Trade counts and profit factor come from `trades`;
/// risk ratios from the bar-by-bar `equity_curve`, so holding time is
/// reflected in the annualisation.
pub fn compute_metrics(
    trades:         &[ClosedTrade],
    equity_curve:   &[f64],
    initial_equity: f64,
    final_equity:   f64,
    bars_per_year:  f64,
) -> PerfReport {
    let mut report = PerfReport {
        n_trades: trades.len(),
        n_bars: equity_curve.len(),
        initial_equity,
        final_equity,
        ..PerfReport::default()
    };
    if initial_equity > 0.0 {
        report.total_return = final_equity / initial_equity - 1.0;
    }

    // ── Trades ────────────────────────────────────────────────────────────
    if !trades.is_empty() {
        let (wins, losses): (Vec<&ClosedTrade>, Vec<&ClosedTrade>) = trades.iter().partition(|t| t.pnl > 0.0);
        report.win_rate = wins.len() as f64 / trades.len() as f64;
        report.avg_win = mean(&wins.iter().map(|t| t.pnl_frac).collect::<Vec<_>>()).unwrap_or(0.0);
        report.avg_loss = mean(&losses.iter().map(|t| t.pnl_frac.abs()).collect::<Vec<_>>()).unwrap_or(0.0);
        let won: f64 = wins.iter().map(|t| t.pnl).sum();
        let lost: f64 = losses.iter().map(|t| t.pnl).sum::<f64>().abs();
        report.profit_factor = (lost > 0.0).then(|| won / lost);
    }

    // ── Equity curve ──────────────────────────────────────────────────────
    let returns = bar_returns(equity_curve);
    let annual = bars_per_year.sqrt();
    if let Some(mu) = mean(&returns) {
        let sd = std_dev(&returns);
        report.sharpe = if sd > 1e-12 { mu / sd * annual } else { 0.0 };

        let downside = mean(&returns.iter().map(|r| r.min(0.0).powi(2)).collect::<Vec<_>>())
            .unwrap_or(0.0)
            .sqrt();
        report.sortino = (downside > 1e-12).then(|| mu / downside * annual);

        let years = returns.len() as f64 / bars_per_year;
        let growth = equity_curve.last().copied().unwrap_or(0.0) / equity_curve[0];
        if years > 0.0 && growth > 0.0 {
            report.cagr = growth.powf(1.0 / years) - 1.0;
        }
    }
    report.max_drawdown = max_drawdown(equity_curve);
    report.calmar = (report.max_drawdown < 0.0).then(|| report.cagr / report.max_drawdown.abs());
    report
}

/// Simple returns between consecutive equity points; a non-positive
/// previous value ends the series (the account is blown).
fn bar_returns(equity_curve: &[f64]) -> Vec<f64> {
    equity_curve
        .windows(2)
        .map_while(|w| (w[0] > 0.0).then(|| w[1] / w[0] - 1.0))
        .collect()
}

/// Deepest peak-to-trough fall of an equity curve as a fraction (≤ 0).
pub fn max_drawdown(equity_curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    equity_curve.iter().fold(0.0, |worst: f64, &e| {
        peak = peak.max(e);
        if peak > 0.0 { worst.min(e / peak - 1.0) } else { worst }
    })
}

// ── Trade-log analysis ────────────────────────────────────────────────────

/// One open record matched with its close.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedTrade {
    pub symbol:      String,
    pub side:        String,
    pub open_time:   DateTime<Utc>,
    pub close_time:  DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price:  f64,
    pub quantity:    f64,
    pub pnl:         f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EquityPoint {
    pub time:   DateTime<Utc>,
    pub equity: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeAnalysis {
    pub total_trades:  usize,
    pub wins:          usize,
    pub losses:        usize,
    pub win_rate:      f64,
    /// `None` when nothing was lost (serialised as null)
    pub profit_factor: Option<f64>,
    pub net_pnl:       f64,
    pub avg_win:       f64,
    pub avg_loss:      f64,
    pub total_won:     f64,
    pub total_lost:    f64,
    /// Deepest fall of cumulative PnL from its running peak (USDT, ≤ 0)
    pub max_drawdown:  f64,
    pub equity_curve:  Vec<EquityPoint>,
    pub trades:        Vec<CompletedTrade>,
}

impl TradeAnalysis {
    pub fn is_empty(&self) -> bool {
        self.total_trades == 0
    }
}

impl fmt::Display for TradeAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No completed trades (open and close pairs) found to analyze.");
        }
        writeln!(f, "--- Trading Performance Report ---")?;
        writeln!(f, "Total Trades:      {}", self.total_trades)?;
        writeln!(f, "Win Rate:          {:.2}%", self.win_rate * 100.0)?;
        match self.profit_factor {
            Some(pf) => writeln!(f, "Profit Factor:     {:.2}", pf)?,
            None => writeln!(f, "Profit Factor:     ∞ (no losing trades)")?,
        }
        writeln!(f, "Net Profit/Loss:   ${:.2}", self.net_pnl)?;
        writeln!(f, "-----------------------------------")?;
        writeln!(f, "Average Win:       ${:.2}", self.avg_win)?;
        writeln!(f, "Average Loss:      ${:.2}", self.avg_loss)?;
        writeln!(f, "Total Won:         ${:.2}", self.total_won)?;
        writeln!(f, "Total Lost:        ${:.2}", self.total_lost)?;
        writeln!(f, "Max Drawdown:      ${:.2}", self.max_drawdown)?;
        writeln!(f, "-----------------------------------")
    }
}

pub fn analyze_trades(records: &[TradeRecord]) -> TradeAnalysis {
    let mut opens: AHashMap<&str, Vec<(DateTime<Utc>, &TradeRecord)>> = AHashMap::new();
    let mut closes: AHashMap<&str, Vec<(DateTime<Utc>, &TradeRecord)>> = AHashMap::new();
    for rec in records {
        let Some(t) = rec.time() else { continue };
        let bucket = match rec.kind() {
            TradeEvent::Open  => &mut opens,
            TradeEvent::Close => &mut closes,
        };
        bucket.entry(rec.symbol.as_str()).or_default().push((t, rec));
    }

    let mut trades = Vec::new();
    for (symbol, mut sym_opens) in opens {
        let Some(mut sym_closes) = closes.remove(symbol) else { continue };
        sym_opens.sort_by_key(|(t, _)| *t);
        sym_closes.sort_by_key(|(t, _)| *t);

        for ((open_time, open), (close_time, close)) in sym_opens.into_iter().zip(sym_closes) {
            let pnl = close.pnl.unwrap_or_else(|| {
                let raw = (close.trade_price - open.trade_price) * open.trade_quantity;
                if open.trade_side.eq_ignore_ascii_case("SELL") { -raw } else { raw }
            });
            trades.push(CompletedTrade {
                symbol:      symbol.to_owned(),
                side:        open.trade_side.clone(),
                open_time,
                close_time,
                entry_price: open.trade_price,
                exit_price:  close.trade_price,
                quantity:    open.trade_quantity,
                pnl,
            });
        }
    }
    if trades.is_empty() {
        return TradeAnalysis::default();
    }
    trades.sort_by_key(|t| t.close_time);

    let won: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|p| *p > 0.0).collect();
    let lost: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|p| *p <= 0.0).collect();
    let total_won: f64 = won.iter().sum();
    let total_lost: f64 = lost.iter().sum::<f64>().abs();

    let mut equity = 0.0;
    let mut peak = 0.0f64;
    let mut max_dd = 0.0f64;
    let equity_curve = trades
        .iter()
        .map(|t| {
            equity += t.pnl;
            peak = peak.max(equity);
            max_dd = max_dd.min(equity - peak);
            EquityPoint { time: t.close_time, equity }
        })
        .collect();

    TradeAnalysis {
        total_trades:  trades.len(),
        wins:          won.len(),
        losses:        lost.len(),
        win_rate:      won.len() as f64 / trades.len() as f64,
        profit_factor: (total_lost > 0.0).then(|| total_won / total_lost),
        net_pnl:       total_won - total_lost,
        avg_win:       mean(&won).unwrap_or(0.0),
        avg_loss:      mean(&lost).map(f64::abs).unwrap_or(0.0),
        total_won,
        total_lost,
        max_drawdown:  max_dd,
        equity_curve,
        trades,
    }
}

// ── Statistical helpers ───────────────────────────────────────────────────

fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    Some(data.iter().sum::<f64>() / data.len() as f64)
}

fn std_dev(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = data.iter().sum::<f64>() / data.len() as f64;
    let var = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    var.sqrt()
}
