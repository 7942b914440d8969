/// momentum.rs — Moving averages, RSI and the stochastic oscillator
///
/// SMA      mean of the last n values
/// WMA      weights 1..n, newest heaviest, normalised by n(n+1)/2
/// HMA      WMA(2·WMA(n/2) − WMA(n), ⌊√n⌋)   (Hull: smooth but low lag)
///
/// RSI (simple rolling means, not Wilder)
///   Δ_t = C_t − C_{t−1}
///   G = mean(max(Δ, 0)) over n,  L = mean(max(−Δ, 0)) over n
///   RSI = 100 − 100 / (1 + G/L)
///   L = 0: RSI = 100 if G > 0, 50 if the window is perfectly flat
///
/// STOCHASTIC
///   raw%K_t = 100 · (C_t − LL_p) / (HH_p − LL_p)   (undefined when HH = LL)
///   %K = SMA_k(raw%K),  %D = SMA_d(%K)
use super::Series;

/// Simple moving average of a dense series.
pub fn sma(values: &[f64], n: usize) -> Series {
    let mut out = vec![None; values.len()];
    if n == 0 || values.len() < n {
        return out;
    }
    let mut sum: f64 = values[..n].iter().sum();
    out[n - 1] = Some(sum / n as f64);
    for i in n..values.len() {
        sum += values[i] - values[i - n];
        out[i] = Some(sum / n as f64);
    }
    out
}

/// SMA over a gappy series: any gap inside the window yields `None`.
pub fn sma_opt(values: &[Option<f64>], n: usize) -> Series {
    let mut out = vec![None; values.len()];
    if n == 0 {
        return out;
    }
    for i in (n - 1)..values.len() {
        let window = &values[i + 1 - n..=i];
        if window.iter().all(Option::is_some) {
            out[i] = Some(window.iter().flatten().sum::<f64>() / n as f64);
        }
    }
    out
}

pub fn wma(values: &[f64], n: usize) -> Series {
    let opt: Series = values.iter().copied().map(Some).collect();
    wma_opt(&opt, n)
}

pub fn wma_opt(values: &[Option<f64>], n: usize) -> Series {
    let mut out = vec![None; values.len()];
    if n == 0 {
        return out;
    }
    let norm = (n * (n + 1)) as f64 / 2.0;
    for i in (n - 1)..values.len() {
        let window = &values[i + 1 - n..=i];
        let weighted: Option<f64> = window
            .iter()
            .enumerate()
            .map(|(j, v)| v.map(|x| x * (j + 1) as f64))
            .sum();
        out[i] = weighted.map(|w| w / norm);
    }
    out
}

/// Hull moving average.
pub fn hma(values: &[f64], n: usize) -> Series {
    if n < 2 {
        return wma(values, n);
    }
    let half = wma(values, n / 2);
    let full = wma(values, n);
    let raw: Series = half
        .iter()
        .zip(&full)
        .map(|(h, f)| Some(2.0 * (*h)? - (*f)?))
        .collect();
    let root = (n as f64).sqrt().floor() as usize;
    wma_opt(&raw, root.max(1))
}

pub fn rsi(close: &[f64], n: usize) -> Series {
    let mut out = vec![None; close.len()];
    if n == 0 || close.len() <= n {
        return out;
    }
    let gains: Vec<f64> = close.windows(2).map(|w| (w[1] - w[0]).max(0.0)).collect();
    let losses: Vec<f64> = close.windows(2).map(|w| (w[0] - w[1]).max(0.0)).collect();

    // deltas[j] belongs to close[j + 1]
    for i in n..close.len() {
        let g = gains[i - n..i].iter().sum::<f64>() / n as f64;
        let l = losses[i - n..i].iter().sum::<f64>() / n as f64;
        out[i] = Some(if l == 0.0 {
            if g > 0.0 { 100.0 } else { 50.0 }
        } else {
            100.0 - 100.0 / (1.0 + g / l)
        });
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stochastic {
    pub k: Series,
    pub d: Series,
}

pub fn stochastic(high: &[f64], low: &[f64], close: &[f64], period: usize, k: usize, d: usize) -> Stochastic {
    let len = close.len().min(high.len()).min(low.len());
    let mut raw = vec![None; len];
    if period > 0 {
        for i in (period.saturating_sub(1))..len {
            let lo = i + 1 - period;
            let hh = high[lo..=i].iter().copied().fold(f64::MIN, f64::max);
            let ll = low[lo..=i].iter().copied().fold(f64::MAX, f64::min);
            if hh > ll {
                raw[i] = Some(100.0 * (close[i] - ll) / (hh - ll));
            }
        }
    }
    let k_line = sma_opt(&raw, k.max(1));
    let d_line = sma_opt(&k_line, d.max(1));
    Stochastic { k: k_line, d: d_line }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 1e-9)
    }

    #[test]
    fn sma_warmup_and_values() {
        let s = sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert_eq!(s[..2], [None, None]);
        assert!(approx(s[2], 2.0));
        assert!(approx(s[4], 4.0));
        assert_eq!(sma(&[1.0, 2.0], 3), vec![None, None]);
    }

    #[test]
    fn sma_opt_needs_full_window() {
        let s = sma_opt(&[Some(1.0), None, Some(3.0), Some(5.0)], 2);
        assert_eq!(s, vec![None, None, None, Some(4.0)]);
    }

    #[test]
    fn wma_weights_recent_bars() {
        // (1·1 + 2·2 + 3·3) / 6 = 14/6
        let w = wma(&[1.0, 2.0, 3.0], 3);
        assert!(approx(w[2], 14.0 / 6.0));
    }

    #[test]
    fn hma_tracks_linear_trend_without_lag() {
        let x: Vec<f64> = (0..40).map(|i| i as f64).collect();
        let h = hma(&x, 9);
        assert_eq!(h.len(), 40);
        // for a straight line Hull's construction removes the lag entirely
        assert!(approx(h[39], 39.0), "{:?}", h[39]);
        let first = h.iter().position(Option::is_some).unwrap();
        // n − 1 + ⌊√n⌋ − 1 = 8 + 2
        assert_eq!(first, 10);
    }

    #[test]
    fn rsi_extremes_and_flat() {
        let up: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let r = rsi(&up, 14);
        assert_eq!(r[13], None);
        assert!(approx(r[14], 100.0));

        let flat = vec![100.0; 20];
        assert!(approx(rsi(&flat, 14)[19], 50.0));

        let down: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        assert!(approx(rsi(&down, 14)[19], 0.0));
    }

    #[test]
    fn rsi_balanced_moves() {
        // alternating +1 / −1 → G = L → RSI 50
        let x: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 100.0 } else { 101.0 }).collect();
        assert!(approx(rsi(&x, 14)[29], 50.0));
    }

    #[test]
    fn stochastic_position_in_range() {
        let high = vec![10.0, 12.0, 14.0, 16.0, 18.0];
        let low = vec![8.0, 9.0, 10.0, 11.0, 12.0];
        let close = vec![9.0, 11.0, 13.0, 15.0, 18.0];
        let st = stochastic(&high, &low, &close, 3, 1, 2);
        // bar 2: HH 14, LL 8 → 100·(13−8)/6
        assert!(approx(st.k[2], 500.0 / 6.0));
        // bar 4: close at the high of the window
        assert!(approx(st.k[4], 100.0));
        assert_eq!(st.d[2], None);
        assert!(st.d[3].is_some());
    }

    #[test]
    fn stochastic_flat_range_is_undefined() {
        let flat = vec![5.0; 6];
        let st = stochastic(&flat, &flat, &flat, 3, 1, 1);
        assert!(st.k.iter().all(Option::is_none));
    }
}
