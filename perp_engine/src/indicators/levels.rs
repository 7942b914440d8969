/// levels.rs — Price levels and candle patterns
///
/// FIBONACCI RETRACEMENT
///   Over the last `lookback` bars find the swing high H and swing low L.
///   Long (uptrend pullback):   L must print before H,  level(r) = H − (H − L) · r
///   Short (downtrend rally):   H must print before L,  level(r) = L + (H − L) · r
///
/// ENGULFING
///   bullish: previous bar red, last bar green, last body covers the previous one
///   bearish: mirror image
///
/// SUPPORT / RESISTANCE
///   lowest low / highest high of the `lookback` bars before the last one
use serde::Serialize;

use crate::exchange::Direction;

pub const FIB_RATIOS: [f64; 5] = [0.236, 0.382, 0.5, 0.618, 0.786];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FibLevels {
    pub direction:  Direction,
    pub swing_low:  f64,
    pub swing_high: f64,
    pub levels:     Vec<(f64, f64)>,
}

impl FibLevels {
    pub fn level(&self, ratio: f64) -> Option<f64> {
        self.levels
            .iter()
            .find(|(r, _)| (r - ratio).abs() < 1e-9)
            .map(|(_, price)| *price)
    }

    pub fn range(&self) -> f64 {
        self.swing_high - self.swing_low
    }
}

pub fn fibonacci(high: &[f64], low: &[f64], lookback: usize, direction: Direction) -> Option<FibLevels> {
    let len = high.len().min(low.len());
    if len == 0 || lookback == 0 {
        return None;
    }
    let start = len.saturating_sub(lookback);

    // ties resolve to the most recent extreme
    let (hi_idx, swing_high) = (start..len)
        .map(|i| (i, high[i]))
        .fold((start, f64::MIN), |acc, x| if x.1 >= acc.1 { x } else { acc });
    let (lo_idx, swing_low) = (start..len)
        .map(|i| (i, low[i]))
        .fold((start, f64::MAX), |acc, x| if x.1 <= acc.1 { x } else { acc });

    let range = swing_high - swing_low;
    if range <= 0.0 {
        return None;
    }
    let levels = match direction {
        Direction::Long if lo_idx < hi_idx => {
            FIB_RATIOS.iter().map(|&r| (r, swing_high - range * r)).collect()
        }
        Direction::Short if hi_idx < lo_idx => {
            FIB_RATIOS.iter().map(|&r| (r, swing_low + range * r)).collect()
        }
        _ => return None,
    };
    Some(FibLevels { direction, swing_low, swing_high, levels })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Pattern {
    BullishEngulfing,
    BearishEngulfing,
}

/// Engulfing pattern formed by the last two candles, if any.
pub fn engulfing(open: &[f64], close: &[f64]) -> Option<Pattern> {
    let n = open.len().min(close.len());
    if n < 2 {
        return None;
    }
    let (po, pc) = (open[n - 2], close[n - 2]);
    let (lo, lc) = (open[n - 1], close[n - 1]);

    if pc < po && lc > lo && lo <= pc && lc >= po {
        Some(Pattern::BullishEngulfing)
    } else if pc > po && lc < lo && lo >= pc && lc <= po {
        Some(Pattern::BearishEngulfing)
    } else {
        None
    }
}

/// (support, resistance) from the `lookback` bars preceding the last bar.
pub fn support_resistance(high: &[f64], low: &[f64], lookback: usize) -> Option<(f64, f64)> {
    let n = high.len().min(low.len());
    if lookback == 0 || n < lookback + 1 {
        return None;
    }
    let window = (n - 1 - lookback)..(n - 1);
    let support = low[window.clone()].iter().copied().fold(f64::MAX, f64::min);
    let resistance = high[window].iter().copied().fold(f64::MIN, f64::max);
    Some((support, resistance))
}
