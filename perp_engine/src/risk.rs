/// risk.rs — Position sizing, R-multiples and the loss circuit breaker
///
/// SIZING
///   risk      = balance · RISK_PER_TRADE
///   qty       = risk / |entry − stop|
///   cap       = balance · MAX_MARGIN_FRAC · leverage      (max notional)
///   qty       = min(qty, cap / entry), rounded DOWN to stepSize
///   notional below MIN_NOTIONAL → bump to the smallest step multiple that
///   meets it, but only while its margin fits the available balance
///
/// CIRCUIT BREAKER
///   every losing close increments a counter, a winning close resets it;
///   MAX_CONSECUTIVE_LOSSES in a row pauses new entries for LOSS_PAUSE_HOURS.
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::{ExecutionError, FilterError};
use crate::exchange::filters::{to_decimal, to_f64};
use crate::exchange::{Direction, SymbolFilters};

// ── Sizing ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Sizing {
    pub quantity:    Decimal,
    pub notional:    f64,
    pub margin:      f64,
    /// Loss at the stop for `quantity`
    pub risk_amount: f64,
    /// Notional hit the margin cap
    pub capped:      bool,
    /// Raised to meet MIN_NOTIONAL
    pub bumped:      bool,
}

pub fn size_position(
    balance:  f64,
    entry:    f64,
    stop:     f64,
    leverage: u32,
    cfg:      &AppConfig,
    filters:  &SymbolFilters,
) -> Result<Sizing, ExecutionError> {
    let distance = (entry - stop).abs();
    if distance <= 0.0 || !distance.is_finite() {
        return Err(ExecutionError::Sizing(format!("zero stop distance (entry {entry}, stop {stop})")));
    }
    if balance <= 0.0 || entry <= 0.0 {
        return Err(ExecutionError::Sizing(format!("balance {balance:.2} / entry {entry} not positive")));
    }
    let leverage = leverage.max(1) as f64;

    let raw_qty = balance * cfg.risk_per_trade / distance;
    let max_notional = balance * cfg.max_margin_frac * leverage;
    let capped = raw_qty * entry > max_notional;
    let qty = if capped { max_notional / entry } else { raw_qty };

    let mut quantity = filters.round_quantity(qty);
    let mut bumped = false;
    if quantity * to_decimal(entry) < filters.min_notional {
        let needed = filters.min_qty_for_notional(entry);
        let needed_margin = to_f64(needed) * entry / leverage;
        if needed_margin > balance {
            return Err(FilterError::MinNotional {
                notional: (quantity * to_decimal(entry)).round_dp(4).to_string(),
                min:      filters.min_notional.to_string(),
            }
            .into());
        }
        warn!("⚠️ Size {} below min notional, bumped to {}", quantity, needed);
        quantity = needed;
        bumped = true;
    }
    filters.check(quantity, entry)?;

    let q = to_f64(quantity);
    let sizing = Sizing {
        quantity,
        notional: q * entry,
        margin: q * entry / leverage,
        risk_amount: q * distance,
        capped,
        bumped,
    };
    info!(
        "📐 Size {} @ {:.4} | notional ${:.2} | margin ${:.2} | risk ${:.2}{}",
        sizing.quantity,
        entry,
        sizing.notional,
        sizing.margin,
        sizing.risk_amount,
        if capped { " (capped)" } else { "" }
    );
    Ok(sizing)
}

// ── Trade arithmetic ──────────────────────────────────────────────────────

/// PnL of a signed position amount as a percentage of its initial margin.
pub fn roi_pct(entry: f64, mark: f64, amount: f64, leverage: u32) -> f64 {
    let margin = amount.abs() * entry / leverage.max(1) as f64;
    if margin <= 0.0 {
        return 0.0;
    }
    (mark - entry) * amount / margin * 100.0
}

/// Favourable move from entry in units of the initial risk.
pub fn r_multiple(direction: Direction, entry: f64, initial_stop: f64, price: f64) -> f64 {
    let risk = (entry - initial_stop).abs();
    if risk <= 0.0 {
        return 0.0;
    }
    (price - entry) * direction.sign() / risk
}

// ── Circuit breaker ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreaker {
    pub consecutive_losses: u32,
    pub max_losses:         u32,
    #[serde(skip)]
    pub pause:              Duration,
    pub paused_until:       Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(max_losses: u32, pause_hours: i64) -> Self {
        Self {
            consecutive_losses: 0,
            max_losses,
            pause: Duration::hours(pause_hours),
            paused_until: None,
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(cfg.max_consecutive_losses, cfg.loss_pause_hours)
    }

    /// Record a closed trade.  Returns `true` when this close tripped the breaker.
    pub fn record(&mut self, pnl: f64, now: DateTime<Utc>) -> bool {
        if pnl > 0.0 {
            self.consecutive_losses = 0;
            return false;
        }
        if pnl == 0.0 {
            return false;
        }
        self.consecutive_losses += 1;
        if self.max_losses > 0 && self.consecutive_losses >= self.max_losses {
            let until = now + self.pause;
            warn!(
                "🛑 {} consecutive losses, pausing new entries until {}",
                self.consecutive_losses,
                until.format("%Y-%m-%d %H:%M UTC")
            );
            self.paused_until = Some(until);
            self.consecutive_losses = 0;
            return true;
        }
        false
    }

    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.paused_until.is_some_and(|until| now < until)
    }

    /// Time left in the pause; zero when trading.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.paused_until {
            Some(until) if now < until => until - now,
            _ => Duration::zero(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use chrono::TimeZone;

    fn btc_filters() -> SymbolFilters {
        SymbolFilters {
            tick_size:    Decimal::new(10, 2),
            step_size:    Decimal::new(1, 3),
            min_qty:      Decimal::new(1, 3),
            max_qty:      Decimal::new(1000, 0),
            min_notional: Decimal::new(100, 0),
        }
    }

    #[test]
    fn sizes_from_stop_distance() {
        let cfg = AppConfig::default();
        // risk 2% of 10 000 = 200; distance 1 000 → 0.2 BTC, notional 10 000 < cap 64 000
        let s = size_position(10_000.0, 50_000.0, 49_000.0, 20, &cfg, &btc_filters()).unwrap();
        assert_eq!(s.quantity, Decimal::new(200, 3));
        assert!(!s.capped && !s.bumped);
        assert!((s.risk_amount - 200.0).abs() < 1e-6);
        assert!((s.margin - 500.0).abs() < 1e-6);
    }

    #[test]
    fn notional_is_capped_by_margin_fraction() {
        let cfg = AppConfig::default();
        // tiny stop → huge raw size; cap = 1 000 · 0.32 · 10 = 3 200 → 0.064 BTC
        let s = size_position(1_000.0, 50_000.0, 49_990.0, 10, &cfg, &btc_filters()).unwrap();
        assert!(s.capped);
        assert_eq!(s.quantity, Decimal::new(64, 3));
        assert!(s.notional <= 3_200.0 + 1e-9);
    }

    #[test]
    fn bumps_to_min_notional_when_affordable() {
        let cfg = AppConfig::default();
        // risk 2 → 0.001 BTC at 20 000 = $20 notional < $100
        let s = size_position(100.0, 20_000.0, 18_000.0, 20, &cfg, &btc_filters()).unwrap();
        assert!(s.bumped);
        assert_eq!(s.quantity, Decimal::new(5, 3));
    }

    #[test]
    fn min_notional_unaffordable_is_an_error() {
        let cfg = AppConfig::default();
        let err = size_position(2.0, 20_000.0, 18_000.0, 1, &cfg, &btc_filters()).unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Exchange(ExchangeError::Filter(FilterError::MinNotional { .. }))
        ));
    }

    #[test]
    fn zero_distance_is_a_sizing_error() {
        let cfg = AppConfig::default();
        let err = size_position(1_000.0, 100.0, 100.0, 10, &cfg, &btc_filters()).unwrap_err();
        assert!(matches!(err, ExecutionError::Sizing(_)));
    }

    #[test]
    fn roi_and_r() {
        // 0.1 @ 100 with 10x → margin 1; +0.5 move → +0.05 pnl → 5%
        assert!((roi_pct(100.0, 100.5, 0.1, 10) - 5.0).abs() < 1e-9);
        assert!((roi_pct(100.0, 100.5, -0.1, 10) + 5.0).abs() < 1e-9);
        assert!((r_multiple(Direction::Short, 100.0, 102.0, 97.0) - 1.5).abs() < 1e-9);
        assert_eq!(r_multiple(Direction::Long, 100.0, 100.0, 120.0), 0.0);
    }

    #[test]
    fn breaker_trips_after_consecutive_losses() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut cb = CircuitBreaker::new(2, 24);
        assert!(!cb.record(-5.0, t0));
        assert!(!cb.record(0.0, t0));
        assert_eq!(cb.consecutive_losses, 1);
        assert!(cb.record(-1.0, t0));
        assert_eq!(cb.consecutive_losses, 0);
        assert!(cb.is_paused(t0 + Duration::hours(23)));
        assert_eq!(cb.remaining(t0 + Duration::hours(23)), Duration::hours(1));
        assert!(!cb.is_paused(t0 + Duration::hours(24)));
    }

    #[test]
    fn a_win_resets_the_count() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut cb = CircuitBreaker::new(2, 24);
        cb.record(-1.0, t0);
        cb.record(3.0, t0);
        assert!(!cb.record(-1.0, t0));
        assert!(!cb.is_paused(t0));
    }
}
