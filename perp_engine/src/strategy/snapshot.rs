/// snapshot.rs — Every indicator value a decision needs, computed once
///
/// A `Snapshot` is built per symbol per cycle from closed klines of the
/// three timeframes.  Strategies, exit rules and the CSV journal all read
/// the same snapshot, so a logged signal always shows the numbers the
/// decision was made on.
use serde::Serialize;

use crate::config::AppConfig;
use crate::exchange::{Direction, Kline};
use crate::indicators::{
    self, adx, atr, bollinger, engulfing, fibonacci, hma, rsi, sma, stochastic, support_resistance,
    FibLevels, Pattern,
};
use crate::market_data::{Candles, MultiFrame};

const BOLLINGER_PERIOD: usize = 20;
const BOLLINGER_K: f64 = 2.0;
const VOLUME_SMA_PERIOD: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Open time of the last closed entry bar (ms)
    pub bar_time: i64,

    // ── Entry frame ──────────────────────────────────────────────────
    pub close:        f64,
    pub open:         f64,
    pub atr:          f64,
    pub stoch_k:      f64,
    pub stoch_k_prev: f64,
    pub stoch_d:      f64,
    pub rsi:          Option<f64>,
    pub sma:          Option<f64>,
    pub hma:          Option<f64>,
    pub hma_prev:     Option<f64>,
    pub bb_upper:     Option<f64>,
    pub bb_lower:     Option<f64>,
    pub volume:       f64,
    pub volume_sma:   Option<f64>,
    pub pattern:      Option<Pattern>,
    pub support:      Option<f64>,
    pub resistance:   Option<f64>,
    pub fib_long:     Option<FibLevels>,
    pub fib_short:    Option<FibLevels>,

    // ── Confirm frame ────────────────────────────────────────────────
    pub confirm_k: Option<f64>,
    pub confirm_d: Option<f64>,

    // ── Trend frame ──────────────────────────────────────────────────
    pub trend_adx:   f64,
    pub trend_close: f64,
    pub trend_sma:   f64,
}

impl Snapshot {
    pub fn from_frames(frames: &MultiFrame, cfg: &AppConfig) -> Option<Self> {
        Self::build(&frames.entry, &frames.confirm, &frames.trend, cfg)
    }

    /// `None` when any core value (close, ATR, stochastic, trend ADX/SMA)
    /// is still warming up.
    pub fn build(entry: &[Kline], confirm: &[Kline], trend: &[Kline], cfg: &AppConfig) -> Option<Self> {
        let e = Candles::from_klines(entry);
        let t = Candles::from_klines(trend);
        let last_bar = entry.last()?;

        let st = stochastic(&e.high, &e.low, &e.close, cfg.stoch_period, cfg.stoch_k, cfg.stoch_d);
        let hull = hma(&e.close, cfg.hma_period);
        let bands = bollinger(&e.close, BOLLINGER_PERIOD, BOLLINGER_K);
        let (support, resistance) = match support_resistance(&e.high, &e.low, cfg.sr_lookback) {
            Some((s, r)) => (Some(s), Some(r)),
            None => (None, None),
        };

        let (confirm_k, confirm_d) = if confirm.is_empty() {
            (None, None)
        } else {
            let c = Candles::from_klines(confirm);
            let cst = stochastic(&c.high, &c.low, &c.close, cfg.stoch_period, cfg.stoch_k, cfg.stoch_d);
            (indicators::last(&cst.k), indicators::last(&cst.d))
        };

        Some(Self {
            bar_time:     last_bar.open_time,
            close:        last_bar.close,
            open:         last_bar.open,
            atr:          indicators::last(&atr(&e.high, &e.low, &e.close, cfg.atr_period))?,
            stoch_k:      indicators::last(&st.k)?,
            stoch_k_prev: indicators::prev(&st.k)?,
            stoch_d:      indicators::last(&st.d)?,
            rsi:          indicators::last(&rsi(&e.close, cfg.rsi_period)),
            sma:          indicators::last(&sma(&e.close, cfg.sma_period)),
            hma:          indicators::last(&hull),
            hma_prev:     indicators::prev(&hull),
            bb_upper:     indicators::last(&bands.upper),
            bb_lower:     indicators::last(&bands.lower),
            volume:       last_bar.volume,
            volume_sma:   indicators::last(&sma(&e.volume, VOLUME_SMA_PERIOD)),
            pattern:      engulfing(&e.open, &e.close),
            support,
            resistance,
            fib_long:     fibonacci(&e.high, &e.low, cfg.fib_lookback, Direction::Long),
            fib_short:    fibonacci(&e.high, &e.low, cfg.fib_lookback, Direction::Short),

            confirm_k,
            confirm_d,

            trend_adx:   indicators::last(&adx(&t.high, &t.low, &t.close, cfg.adx_period))?,
            trend_close: t.last_close()?,
            trend_sma:   indicators::last(&sma(&t.close, cfg.sma_period))?,
        })
    }

    pub fn hma_slope(&self) -> Option<f64> {
        Some(self.hma? - self.hma_prev?)
    }

    /// Close relative to the entry-frame SMA, as a fraction.
    pub fn price_vs_sma(&self) -> Option<f64> {
        let sma = self.sma?;
        (sma != 0.0).then(|| (self.close - sma) / sma)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::exchange::Kline;

    /// Klines following `closes`, each bar spanning `step_ms`, with a
    /// symmetric wick of `wick` around the body.
    pub fn klines_from_closes(closes: &[f64], step_ms: i64, wick: f64) -> Vec<Kline> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let open = if i == 0 { c } else { closes[i - 1] };
                Kline {
                    open_time:  i as i64 * step_ms,
                    open,
                    high:       open.max(c) + wick,
                    low:        open.min(c) - wick,
                    close:      c,
                    volume:     100.0,
                    close_time: (i as i64 + 1) * step_ms - 1,
                }
            })
            .collect()
    }

    pub fn uptrend(n: usize, start: f64, step: f64) -> Vec<f64> {
        (0..n).map(|i| start + step * i as f64).collect()
    }
}
