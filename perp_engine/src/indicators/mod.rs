/// indicators/mod.rs — Technical indicators over closed bars
///
/// Every indicator takes plain slices and returns a `Series` of the same
/// length as its input.  `None` marks positions where the value is not
/// defined yet (warm-up) or not defined at all (e.g. stochastic over a flat
/// range); nothing is back-filled or zeroed.
///
///   momentum    SMA, WMA, HMA, RSI, stochastic %K/%D
///   volatility  true range, ATR (Wilder), ADX (Wilder), Bollinger bands
///   levels      Fibonacci swing levels, engulfing candles, support/resistance
pub mod levels;
pub mod momentum;
pub mod volatility;

pub use levels::{engulfing, fibonacci, support_resistance, FibLevels, Pattern, FIB_RATIOS};
pub use momentum::{hma, rsi, sma, sma_opt, stochastic, wma, wma_opt, Stochastic};
pub use volatility::{adx, atr, bollinger, true_range, Bands};

pub type Series = Vec<Option<f64>>;

/// Value at the last position.
pub fn last(series: &[Option<f64>]) -> Option<f64> {
    series.last().copied().flatten()
}

/// Value at the second-to-last position.
pub fn prev(series: &[Option<f64>]) -> Option<f64> {
    series.iter().rev().nth(1).copied().flatten()
}

/// Change between the last two positions.
pub fn slope(series: &[Option<f64>]) -> Option<f64> {
    Some(last(series)? - prev(series)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_and_prev_do_not_skip_gaps() {
        let s = vec![Some(1.0), Some(2.0), None];
        assert_eq!(last(&s), None);
        assert_eq!(prev(&s), Some(2.0));
        assert_eq!(slope(&s), None);
        assert_eq!(slope(&[Some(1.0), Some(3.5)]), Some(2.5));
        assert_eq!(prev(&[Some(1.0)]), None);
    }
}
