/// strategy/mod.rs — Decision layer
///
/// A strategy maps one `Snapshot` to a `Decision`:
///
///   Enter(signal)    every condition holds; bracket prices attached
///   Reject(..)       the trigger fired but a filter failed (journaled)
///   Skip(reason)     nothing to do this bar
///
/// Exits are strategy-independent (`exit_decision`): ROI on margin first,
/// then the indicator exits (stochastic extreme, support/resistance).
pub mod fibonacci;
pub mod snapshot;
pub mod stochastic;

use serde::Serialize;
use std::fmt;

use crate::config::{AppConfig, StrategyKind};
use crate::exchange::Direction;

pub use fibonacci::FibonacciPullback;
pub use snapshot::Snapshot;
pub use stochastic::StochasticConfluence;

// ── Trend regime ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Trend {
    Up,
    Down,
    Sideways,
}

impl Trend {
    pub fn direction(self) -> Option<Direction> {
        match self {
            Self::Up       => Some(Direction::Long),
            Self::Down     => Some(Direction::Short),
            Self::Sideways => None,
        }
    }
}

/// Trend-frame regime: ADX above MIN_ADX plus close vs SMA.
pub fn detect_trend(snap: &Snapshot, cfg: &AppConfig) -> Trend {
    if snap.trend_adx <= cfg.min_adx {
        Trend::Sideways
    } else if snap.trend_close > snap.trend_sma {
        Trend::Up
    } else if snap.trend_close < snap.trend_sma {
        Trend::Down
    } else {
        Trend::Sideways
    }
}

// ── Decisions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Check {
    pub name:   &'static str,
    pub passed: bool,
}

/// Named pass/fail flags of one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Checks(pub Vec<Check>);

impl Checks {
    pub fn push(&mut self, name: &'static str, passed: bool) {
        self.0.push(Check { name, passed });
    }

    pub fn all_passed(&self) -> bool {
        self.0.iter().all(|c| c.passed)
    }

    pub fn passed_count(&self) -> usize {
        self.0.iter().filter(|c| c.passed).count()
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.0.iter().find(|c| c.name == name).map(|c| c.passed)
    }

    pub fn failed(&self) -> Vec<&'static str> {
        self.0.iter().filter(|c| !c.passed).map(|c| c.name).collect()
    }

    pub fn passed(&self) -> Vec<&'static str> {
        self.0.iter().filter(|c| c.passed).map(|c| c.name).collect()
    }
}

impl fmt::Display for Checks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|c| format!("{}{}", c.name, if c.passed { "✓" } else { "✗" }))
            .collect();
        f.write_str(&parts.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySignal {
    pub direction:   Direction,
    pub entry_price: f64,
    pub stop_loss:   f64,
    pub take_profit: f64,
    pub atr:         f64,
    pub reason:      String,
    pub checks:      Checks,
}

impl EntrySignal {
    pub fn risk_per_unit(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub direction: Direction,
    pub reason:    String,
    pub checks:    Checks,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Decision {
    Enter(EntrySignal),
    Reject(Rejection),
    Skip(String),
}

impl Decision {
    /// "LONG" / "SHORT" / "SKIP" label used in the signal journal.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Enter(s)  => s.direction.as_str(),
            Self::Reject(_) => "REJECTED",
            Self::Skip(_)   => "SKIP",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Enter(s)  => &s.reason,
            Self::Reject(r) => &r.reason,
            Self::Skip(r)   => r,
        }
    }
}

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, snap: &Snapshot, cfg: &AppConfig) -> Decision;
}

pub fn build_strategy(kind: StrategyKind) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::Stochastic => Box::new(StochasticConfluence),
        StrategyKind::Fibonacci  => Box::new(FibonacciPullback),
    }
}

// ── Bracket prices ────────────────────────────────────────────────────────

/// Stop SL_ATR_MULT·ATR away from entry, target RISK_REWARD times the risk.
pub fn atr_bracket(direction: Direction, entry: f64, atr: f64, cfg: &AppConfig) -> (f64, f64) {
    let stop = entry - direction.sign() * cfg.sl_atr_mult * atr;
    (stop, target_for_stop(direction, entry, stop, cfg.risk_reward))
}

pub fn target_for_stop(direction: Direction, entry: f64, stop: f64, risk_reward: f64) -> f64 {
    entry + direction.sign() * risk_reward * (entry - stop).abs()
}

// ── Exits ─────────────────────────────────────────────────────────────────

/// Why a position was closed.  ROI variants carry the configured threshold,
/// indicator variants the value that fired.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ExitReason {
    RoiTakeProfit(f64),
    RoiStopLoss(f64),
    StochOverbought(f64),
    StochOversold(f64),
    Resistance(f64),
    Support(f64),
    StopLoss,
    TakeProfit,
    ExchangeClosed,
    EndOfData,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoiTakeProfit(t)   => write!(f, "ROI >= {t}%"),
            Self::RoiStopLoss(t)     => write!(f, "ROI <= {t}%"),
            Self::StochOverbought(_) => f.write_str("Stochastic overbought threshold"),
            Self::StochOversold(_)   => f.write_str("Stochastic oversold threshold"),
            Self::Resistance(_)      => f.write_str("Price reached resistance level"),
            Self::Support(_)         => f.write_str("Price reached support level"),
            Self::StopLoss           => f.write_str("Stop-loss hit"),
            Self::TakeProfit         => f.write_str("Take-profit hit"),
            Self::ExchangeClosed     => f.write_str("Closed on exchange (stop or target)"),
            Self::EndOfData          => f.write_str("End of data"),
            Self::Manual             => f.write_str("Manual close"),
        }
    }
}

/// First exit rule that fires, in priority order:
///   ROI ≥ ROI_TAKE_PROFIT, ROI ≤ ROI_STOP_LOSS, then (with indicator exits
///   enabled) stochastic beyond the opposite extreme and close through
///   resistance (long) / support (short).
pub fn exit_decision(direction: Direction, roi_pct: f64, snap: Option<&Snapshot>, cfg: &AppConfig) -> Option<ExitReason> {
    if roi_pct >= cfg.roi_take_profit {
        return Some(ExitReason::RoiTakeProfit(cfg.roi_take_profit));
    }
    if roi_pct <= cfg.roi_stop_loss {
        return Some(ExitReason::RoiStopLoss(cfg.roi_stop_loss));
    }
    if !cfg.use_indicator_exits {
        return None;
    }
    let snap = snap?;
    match direction {
        Direction::Long => {
            if snap.stoch_k > cfg.overbought {
                return Some(ExitReason::StochOverbought(snap.stoch_k));
            }
            if let Some(r) = snap.resistance.filter(|r| snap.close >= *r) {
                return Some(ExitReason::Resistance(r));
            }
        }
        Direction::Short => {
            if snap.stoch_k < cfg.oversold {
                return Some(ExitReason::StochOversold(snap.stoch_k));
            }
            if let Some(s) = snap.support.filter(|s| snap.close <= *s) {
                return Some(ExitReason::Support(s));
            }
        }
    }
    None
}

/// Funding filter: longs pay positive funding, shorts pay negative.
pub fn funding_allows(direction: Direction, rate: f64, max: f64) -> bool {
    match direction {
        Direction::Long  => rate <= max,
        Direction::Short => rate >= -max,
    }
}
