/// fibonacci.rs — Pullback to the 0.618 retracement in a trending market
///
/// Long  (trend Up):   swing low printed before swing high, price pulled back
///                     to or below the 0.618 level but still above the swing low
/// Short (trend Down): mirror image against the swing high
///
/// Confirmations, at least MIN_CONFIRMATIONS of:
///   hma        Hull MA turning with the trade
///   bollinger  close within 0.5% of the lower (long) / upper (short) band
///   pattern    engulfing candle in the trade direction
///   volume     volume above 1.5× its 20-bar average
///
/// Stop just beyond the swing extreme (0.5% buffer), target RISK_REWARD · risk.
use super::{detect_trend, target_for_stop, Checks, Decision, EntrySignal, Rejection, Snapshot, Strategy};
use crate::config::AppConfig;
use crate::exchange::Direction;
use crate::indicators::Pattern;

const GOLDEN_RATIO: f64 = 0.618;
const BAND_PROXIMITY: f64 = 0.005;
const VOLUME_SPIKE: f64 = 1.5;
const STOP_BUFFER: f64 = 0.005;

pub struct FibonacciPullback;

impl FibonacciPullback {
    fn confirmations(direction: Direction, snap: &Snapshot) -> Checks {
        let sign = direction.sign();
        let band = match direction {
            Direction::Long  => snap.bb_lower,
            Direction::Short => snap.bb_upper,
        };
        // either side of the band; a close far outside it does not count
        let near_band = band.is_some_and(|b| (snap.close - b).abs() / snap.close < BAND_PROXIMITY);
        let pattern = match direction {
            Direction::Long  => snap.pattern == Some(Pattern::BullishEngulfing),
            Direction::Short => snap.pattern == Some(Pattern::BearishEngulfing),
        };

        let mut checks = Checks::default();
        checks.push("hma", snap.hma_slope().is_some_and(|s| s * sign > 0.0));
        checks.push("bollinger", near_band);
        checks.push("pattern", pattern);
        checks.push("volume", snap.volume_sma.is_some_and(|v| snap.volume > VOLUME_SPIKE * v));
        checks
    }
}

impl Strategy for FibonacciPullback {
    fn name(&self) -> &'static str {
        "fibonacci"
    }

    fn evaluate(&self, snap: &Snapshot, cfg: &AppConfig) -> Decision {
        let trend = detect_trend(snap, cfg);
        let Some(direction) = trend.direction() else {
            return Decision::Skip(format!("trend {trend:?} (ADX {:.1})", snap.trend_adx));
        };
        let fib = match direction {
            Direction::Long  => snap.fib_long.as_ref(),
            Direction::Short => snap.fib_short.as_ref(),
        };
        let Some(fib) = fib else {
            return Decision::Skip(format!("no {direction} swing in the last {} bars", cfg.fib_lookback));
        };
        let Some(level) = fib.level(GOLDEN_RATIO) else {
            return Decision::Skip("0.618 level unavailable".into());
        };

        let at_level = match direction {
            Direction::Long  => snap.close <= level && snap.close > fib.swing_low,
            Direction::Short => snap.close >= level && snap.close < fib.swing_high,
        };
        if !at_level {
            return Decision::Skip(format!("price {:.4} not at 0.618 level {level:.4}", snap.close));
        }

        let checks = Self::confirmations(direction, snap);
        let score = checks.passed_count();
        if score < cfg.min_confirmations {
            return Decision::Reject(Rejection {
                direction,
                reason: format!("{direction} pullback with {score}/{} confirmations", cfg.min_confirmations),
                checks,
            });
        }

        let stop_loss = match direction {
            Direction::Long  => fib.swing_low * (1.0 - STOP_BUFFER),
            Direction::Short => fib.swing_high * (1.0 + STOP_BUFFER),
        };
        let take_profit = target_for_stop(direction, snap.close, stop_loss, cfg.risk_reward);
        Decision::Enter(EntrySignal {
            direction,
            entry_price: snap.close,
            stop_loss,
            take_profit,
            atr: snap.atr,
            reason: format!(
                "Fibonacci 0.618 pullback at {level:.4} ({score} confirmations: {})",
                checks.passed().join(", ")
            ),
            checks,
        })
    }
}
