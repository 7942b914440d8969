/// stochastic.rs — Stochastic cross with trend and momentum confluence
///
/// Trigger (entry frame, direction taken from the trend frame):
///   long   %K_prev ≤ OVERSOLD   < %K  and  %K > %D      (trend Up)
///   short  %K_prev ≥ OVERBOUGHT > %K  and  %K < %D      (trend Down)
///
/// Filters once triggered, all must pass:
///   rsi      30 < RSI < 70
///   sma      close on the trend side of the entry-frame SMA
///   hma      Hull MA sloping with the trade
///   confirm  confirm-frame %K vs %D aligned (only with REQUIRE_CONFIRM_ALIGNMENT)
use super::{atr_bracket, detect_trend, Checks, Decision, EntrySignal, Rejection, Snapshot, Strategy, Trend};
use crate::config::AppConfig;
use crate::exchange::Direction;

const RSI_FLOOR: f64 = 30.0;
const RSI_CEILING: f64 = 70.0;

pub struct StochasticConfluence;

impl StochasticConfluence {
    fn triggered(direction: Direction, snap: &Snapshot, cfg: &AppConfig) -> bool {
        let (k, k_prev, d) = (snap.stoch_k, snap.stoch_k_prev, snap.stoch_d);
        match direction {
            Direction::Long  => k_prev <= cfg.oversold && k > cfg.oversold && k > d,
            Direction::Short => k_prev >= cfg.overbought && k < cfg.overbought && k < d,
        }
    }

    fn filters(direction: Direction, snap: &Snapshot, cfg: &AppConfig) -> Checks {
        let sign = direction.sign();
        let mut checks = Checks::default();
        checks.push("rsi", snap.rsi.is_some_and(|r| r > RSI_FLOOR && r < RSI_CEILING));
        checks.push("sma", snap.price_vs_sma().is_some_and(|p| p * sign > 0.0));
        checks.push("hma", snap.hma_slope().is_some_and(|s| s * sign > 0.0));
        if cfg.require_confirm_alignment {
            let aligned = match (snap.confirm_k, snap.confirm_d) {
                (Some(k), Some(d)) => (k - d) * sign > 0.0,
                _ => false,
            };
            checks.push("confirm", aligned);
        }
        checks
    }
}

impl Strategy for StochasticConfluence {
    fn name(&self) -> &'static str {
        "stochastic"
    }

    fn evaluate(&self, snap: &Snapshot, cfg: &AppConfig) -> Decision {
        let trend = detect_trend(snap, cfg);
        let Some(direction) = trend.direction() else {
            return Decision::Skip(format!("trend {trend:?} (ADX {:.1})", snap.trend_adx));
        };
        if !Self::triggered(direction, snap, cfg) {
            return Decision::Skip(format!(
                "no stochastic cross (K {:.1} → {:.1}, D {:.1})",
                snap.stoch_k_prev, snap.stoch_k, snap.stoch_d
            ));
        }

        let checks = Self::filters(direction, snap, cfg);
        if !checks.all_passed() {
            return Decision::Reject(Rejection {
                direction,
                reason: format!("{direction} cross filtered: {}", checks.failed().join(", ")),
                checks,
            });
        }

        let (stop_loss, take_profit) = atr_bracket(direction, snap.close, snap.atr, cfg);
        let zone = if trend == Trend::Up { "oversold" } else { "overbought" };
        Decision::Enter(EntrySignal {
            direction,
            entry_price: snap.close,
            stop_loss,
            take_profit,
            atr: snap.atr,
            reason: format!("Stochastic {zone} cross K={:.1} D={:.1} [{checks}]", snap.stoch_k, snap.stoch_d),
            checks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::neutral_snapshot;
    use super::*;

    fn long_setup() -> Snapshot {
        let mut s = neutral_snapshot();
        s.trend_adx = 25.0;
        s.trend_close = 110.0;
        s.stoch_k_prev = 18.0;
        s.stoch_k = 24.0;
        s.stoch_d = 21.0;
        s.close = 101.0;
        s.sma = Some(100.0);
        s.hma = Some(100.8);
        s.hma_prev = Some(100.5);
        s
    }

    #[test]
    fn long_cross_enters_with_atr_bracket() {
        let cfg = AppConfig::default();
        match StochasticConfluence.evaluate(&long_setup(), &cfg) {
            Decision::Enter(sig) => {
                assert_eq!(sig.direction, Direction::Long);
                assert!((sig.stop_loss - 98.0).abs() < 1e-9);
                assert!((sig.take_profit - 107.0).abs() < 1e-9);
                assert!(sig.checks.all_passed());
            }
            other => panic!("expected entry, got {other:?}"),
        }
    }

    #[test]
    fn sideways_trend_skips() {
        let cfg = AppConfig::default();
        let mut s = long_setup();
        s.trend_adx = 12.0;
        assert!(matches!(StochasticConfluence.evaluate(&s, &cfg), Decision::Skip(_)));
    }

    #[test]
    fn failed_filter_rejects() {
        let cfg = AppConfig::default();
        let mut s = long_setup();
        s.rsi = Some(75.0);
        match StochasticConfluence.evaluate(&s, &cfg) {
            Decision::Reject(r) => {
                assert_eq!(r.checks.failed(), vec!["rsi"]);
                assert_eq!(r.direction, Direction::Long);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn confirm_alignment_is_optional() {
        let mut s = long_setup();
        s.confirm_k = Some(40.0);
        s.confirm_d = Some(45.0);
        let relaxed = AppConfig::default();
        assert!(matches!(StochasticConfluence.evaluate(&s, &relaxed), Decision::Enter(_)));
        let strict = AppConfig { require_confirm_alignment: true, ..AppConfig::default() };
        assert!(matches!(StochasticConfluence.evaluate(&s, &strict), Decision::Reject(_)));
    }

    #[test]
    fn short_mirror() {
        let cfg = AppConfig::default();
        let mut s = neutral_snapshot();
        s.trend_adx = 30.0;
        s.trend_close = 90.0;
        s.stoch_k_prev = 83.0;
        s.stoch_k = 76.0;
        s.stoch_d = 79.0;
        s.close = 99.0;
        s.hma = Some(99.2);
        s.hma_prev = Some(99.6);
        match StochasticConfluence.evaluate(&s, &cfg) {
            Decision::Enter(sig) => {
                assert_eq!(sig.direction, Direction::Short);
                assert!(sig.stop_loss > sig.entry_price);
                assert!(sig.take_profit < sig.entry_price);
            }
            other => panic!("expected short, got {other:?}"),
        }
    }

    #[test]
    fn no_cross_skips() {
        let cfg = AppConfig::default();
        let mut s = long_setup();
        s.stoch_k_prev = 30.0;
        assert!(matches!(StochasticConfluence.evaluate(&s, &cfg), Decision::Skip(_)));
    }
}
