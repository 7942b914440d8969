/// state.rs — Managed trades and the bot's shared state
///
/// STOP PHASES (never regress)
///
///   Initial ──(R ≥ BREAKEVEN_TRIGGER_R)──▶ Breakeven   stop = entry
///      │                                      │
///      └──────(R ≥ TRAILING_TRIGGER_R)──────▶ Trailing   stop = best ∓ TRAILING_ATR_MULT·ATR
///
/// R is the favourable move from entry measured in initial risk
/// (|entry − initial stop|).  A candidate stop is only accepted when it
/// tightens the current one.
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::AppConfig;
use crate::error::ExecutionError;
use crate::exchange::filters::to_f64;
use crate::exchange::Direction;
use crate::risk::{r_multiple, CircuitBreaker};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TradePhase {
    Initial,
    Breakeven,
    Trailing { best_price: f64 },
}

impl TradePhase {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Initial        => "initial",
            Self::Breakeven      => "breakeven",
            Self::Trailing { .. } => "trailing",
        }
    }
}

/// Proposed stop move produced by `ManagedTrade::next_stop`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopUpdate {
    pub new_stop: f64,
    pub phase:    TradePhase,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagedTrade {
    pub symbol:        String,
    pub direction:     Direction,
    pub entry_price:   f64,
    pub quantity:      Decimal,
    pub leverage:      u32,
    pub initial_stop:  f64,
    pub stop_loss:     f64,
    pub take_profit:   f64,
    pub stop_order_id: Option<i64>,
    pub tp_order_id:   Option<i64>,
    pub phase:         TradePhase,
    pub atr:           f64,
    pub opened_at:     DateTime<Utc>,
    pub reason:        String,
}

impl ManagedTrade {
    pub fn risk_per_unit(&self) -> f64 {
        (self.entry_price - self.initial_stop).abs()
    }

    pub fn quantity_f64(&self) -> f64 {
        to_f64(self.quantity)
    }

    /// Initial margin at entry.
    pub fn margin(&self) -> f64 {
        self.quantity_f64() * self.entry_price / self.leverage.max(1) as f64
    }

    /// Gross PnL if the whole position closed at `price`.
    pub fn pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.direction.sign() * self.quantity_f64()
    }

    pub fn r_at(&self, price: f64) -> f64 {
        r_multiple(self.direction, self.entry_price, self.initial_stop, price)
    }

    /// Whether `price` has reached the current stop.
    pub fn stop_hit(&self, price: f64) -> bool {
        (price - self.stop_loss) * self.direction.sign() <= 0.0
    }

    pub fn target_hit(&self, price: f64) -> bool {
        (price - self.take_profit) * self.direction.sign() >= 0.0
    }

    /// Next stop for a mark price, or `None` when the stop should stay.
    pub fn next_stop(&self, mark: f64, atr: f64, cfg: &AppConfig) -> Option<StopUpdate> {
        let sign = self.direction.sign();
        let tighter = |a: f64, b: f64| if (a - b) * sign > 0.0 { a } else { b };
        let r = self.r_at(mark);

        let mut phase = self.phase;
        let mut stop = self.stop_loss;

        if phase == TradePhase::Initial && r >= cfg.breakeven_trigger_r {
            phase = TradePhase::Breakeven;
            stop = tighter(self.entry_price, stop);
        }

        let best = match self.phase {
            TradePhase::Trailing { best_price } => Some(tighter(mark, best_price)),
            _ if r >= cfg.trailing_trigger_r => Some(mark),
            _ => None,
        };
        if let Some(best_price) = best {
            phase = TradePhase::Trailing { best_price };
            if atr > 0.0 {
                stop = tighter(best_price - sign * cfg.trailing_atr_mult * atr, stop);
            }
        }

        ((stop - self.stop_loss) * sign > 0.0).then_some(StopUpdate { new_stop: stop, phase })
    }

    pub fn apply(&mut self, update: StopUpdate, stop_order_id: Option<i64>) {
        self.stop_loss = update.new_stop;
        self.phase = update.phase;
        self.stop_order_id = stop_order_id;
    }
}

// ── Bot state ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct BotState {
    pub trades:     AHashMap<String, ManagedTrade>,
    pub breaker:    CircuitBreaker,
    /// Toggled from the dashboard; when false cycles do nothing
    pub running:    bool,
    pub last_cycle: Option<DateTime<Utc>>,
    pub cycles:     u64,
}

pub type SharedState = Arc<RwLock<BotState>>;

impl BotState {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            trades:     AHashMap::new(),
            breaker:    CircuitBreaker::from_config(cfg),
            running:    true,
            last_cycle: None,
            cycles:     0,
        }
    }

    pub fn shared(cfg: &AppConfig) -> SharedState {
        Arc::new(RwLock::new(Self::new(cfg)))
    }

    pub fn open(&mut self, trade: ManagedTrade) -> Result<(), ExecutionError> {
        if self.trades.contains_key(&trade.symbol) {
            return Err(ExecutionError::AlreadyOpen(trade.symbol));
        }
        self.trades.insert(trade.symbol.clone(), trade);
        Ok(())
    }

    pub fn close(&mut self, symbol: &str) -> Option<ManagedTrade> {
        self.trades.remove(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<&ManagedTrade> {
        self.trades.get(symbol)
    }

    pub fn open_count(&self) -> usize {
        self.trades.len()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn long_trade(entry: f64, stop: f64) -> ManagedTrade {
        ManagedTrade {
            symbol:        "BTCUSDT".into(),
            direction:     Direction::Long,
            entry_price:   entry,
            quantity:      Decimal::ONE,
            leverage:      10,
            initial_stop:  stop,
            stop_loss:     stop,
            take_profit:   entry + 2.0 * (entry - stop),
            stop_order_id: Some(1),
            tp_order_id:   Some(2),
            phase:         TradePhase::Initial,
            atr:           (entry - stop) / 1.5,
            opened_at:     Utc::now(),
            reason:        "test".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::long_trade;
    use super::*;

    #[test]
    fn below_one_r_keeps_the_stop() {
        let cfg = AppConfig::default();
        let t = long_trade(100.0, 95.0);
        assert_eq!(t.next_stop(104.0, 2.0, &cfg), None);
    }

    #[test]
    fn one_r_moves_to_breakeven() {
        let cfg = AppConfig::default();
        let t = long_trade(100.0, 95.0);
        let up = t.next_stop(105.0, 2.0, &cfg).unwrap();
        assert_eq!(up.new_stop, 100.0);
        assert_eq!(up.phase, TradePhase::Breakeven);
    }

    #[test]
    fn trailing_follows_new_highs_only() {
        let cfg = AppConfig::default();
        let mut t = long_trade(100.0, 95.0);
        // 1.6R → trailing, stop = 108 − 2
        let up = t.next_stop(108.0, 2.0, &cfg).unwrap();
        assert_eq!(up.phase, TradePhase::Trailing { best_price: 108.0 });
        assert_eq!(up.new_stop, 106.0);
        t.apply(up, Some(7));

        // pullback: no move, stop never loosens
        assert_eq!(t.next_stop(107.0, 2.0, &cfg), None);
        let up = t.next_stop(111.0, 2.0, &cfg).unwrap();
        assert_eq!(up.new_stop, 109.0);
        assert_eq!(up.phase, TradePhase::Trailing { best_price: 111.0 });
    }

    #[test]
    fn short_breakeven_and_trail() {
        let cfg = AppConfig::default();
        let mut t = long_trade(100.0, 105.0);
        t.direction = Direction::Short;
        t.take_profit = 90.0;
        let up = t.next_stop(95.0, 2.0, &cfg).unwrap();
        assert_eq!(up.new_stop, 100.0);
        t.apply(up, None);
        let up = t.next_stop(92.0, 2.0, &cfg).unwrap();
        assert_eq!(up.new_stop, 94.0);
        assert!(t.stop_hit(100.5));
        assert!(t.target_hit(89.0));
    }

    #[test]
    fn wide_trail_still_reaches_breakeven() {
        let cfg = AppConfig::default();
        let t = long_trade(100.0, 95.0);
        // trailing candidate 108 − 20 is looser than entry → breakeven stop, trailing phase
        let up = t.next_stop(108.0, 20.0, &cfg).unwrap();
        assert_eq!(up.new_stop, 100.0);
        assert!(matches!(up.phase, TradePhase::Trailing { .. }));
    }

    #[test]
    fn state_rejects_duplicate_symbols() {
        let cfg = AppConfig::default();
        let mut s = BotState::new(&cfg);
        s.open(long_trade(100.0, 95.0)).unwrap();
        assert!(matches!(s.open(long_trade(100.0, 95.0)), Err(ExecutionError::AlreadyOpen(_))));
        assert!(s.close("BTCUSDT").is_some());
        assert_eq!(s.open_count(), 0);
    }

    #[test]
    fn pnl_is_signed_by_direction() {
        let mut t = long_trade(100.0, 95.0);
        assert_eq!(t.pnl_at(110.0), 10.0);
        t.direction = Direction::Short;
        assert_eq!(t.pnl_at(110.0), -10.0);
    }
}
