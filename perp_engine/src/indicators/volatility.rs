/// volatility.rs — True range, ATR, ADX and Bollinger bands
///
/// TRUE RANGE
///   TR_0 = H_0 − L_0
///   TR_t = max(H_t − L_t, |H_t − C_{t−1}|, |L_t − C_{t−1}|)
///
/// ATR (Wilder)
///   ATR_{n−1} = mean(TR_0 … TR_{n−1})
///   ATR_t     = (ATR_{t−1} · (n − 1) + TR_t) / n
///
/// ADX (Wilder)
///   +DM_t = H_t − H_{t−1} if it exceeds L_{t−1} − L_t and is positive, else 0
///   −DM_t = L_{t−1} − L_t if it exceeds H_t − H_{t−1} and is positive, else 0
///   S_n = Σ_{1..n} x,   S_t = S_{t−1} − S_{t−1}/n + x_t     (for TR, ±DM)
///   ±DI = 100 · S(±DM) / S(TR)
///   DX  = 100 · |+DI − −DI| / (+DI + −DI)       (0 when both are 0)
///   ADX_{2n−1} = mean(DX_n … DX_{2n−1}),  then Wilder-smoothed like ATR
///
/// BOLLINGER
///   middle = SMA_n,  upper/lower = middle ± k · sample σ_n
use statrs::statistics::Statistics;

use super::momentum::sma;
use super::Series;

pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let len = high.len().min(low.len()).min(close.len());
    (0..len)
        .map(|i| {
            let hl = high[i] - low[i];
            if i == 0 {
                hl
            } else {
                let pc = close[i - 1];
                hl.max((high[i] - pc).abs()).max((low[i] - pc).abs())
            }
        })
        .collect()
}

/// Wilder's smoothing seeded with the mean of the first n values of `x`
/// starting at `from`.
fn wilder(x: &[f64], n: usize, from: usize) -> Series {
    let mut out = vec![None; x.len()];
    if n == 0 || x.len() < from + n {
        return out;
    }
    let seed_at = from + n - 1;
    let mut value = x[from..=seed_at].iter().sum::<f64>() / n as f64;
    out[seed_at] = Some(value);
    for i in seed_at + 1..x.len() {
        value = (value * (n - 1) as f64 + x[i]) / n as f64;
        out[i] = Some(value);
    }
    out
}

pub fn atr(high: &[f64], low: &[f64], close: &[f64], n: usize) -> Series {
    wilder(&true_range(high, low, close), n, 0)
}

pub fn adx(high: &[f64], low: &[f64], close: &[f64], n: usize) -> Series {
    let tr = true_range(high, low, close);
    let len = tr.len();
    let mut out = vec![None; len];
    if n == 0 || len < 2 * n {
        return out;
    }

    let mut plus_dm = vec![0.0; len];
    let mut minus_dm = vec![0.0; len];
    for i in 1..len {
        let up = high[i] - high[i - 1];
        let down = low[i - 1] - low[i];
        if up > down && up > 0.0 {
            plus_dm[i] = up;
        }
        if down > up && down > 0.0 {
            minus_dm[i] = down;
        }
    }

    // Wilder running sums, first defined at index n (bars 1..=n)
    let mut s_tr: f64 = tr[1..=n].iter().sum();
    let mut s_p: f64 = plus_dm[1..=n].iter().sum();
    let mut s_m: f64 = minus_dm[1..=n].iter().sum();
    let mut dx = vec![0.0; len];
    for i in n..len {
        if i > n {
            s_tr = s_tr - s_tr / n as f64 + tr[i];
            s_p = s_p - s_p / n as f64 + plus_dm[i];
            s_m = s_m - s_m / n as f64 + minus_dm[i];
        }
        let (pdi, mdi) = if s_tr > 0.0 {
            (100.0 * s_p / s_tr, 100.0 * s_m / s_tr)
        } else {
            (0.0, 0.0)
        };
        dx[i] = if pdi + mdi > 0.0 { 100.0 * (pdi - mdi).abs() / (pdi + mdi) } else { 0.0 };
    }

    let smoothed = wilder(&dx, n, n);
    out[(2 * n - 1)..].copy_from_slice(&smoothed[(2 * n - 1)..]);
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bands {
    pub middle: Series,
    pub upper:  Series,
    pub lower:  Series,
}

pub fn bollinger(close: &[f64], n: usize, k: f64) -> Bands {
    let middle = sma(close, n);
    let mut upper = vec![None; close.len()];
    let mut lower = vec![None; close.len()];
    if n >= 2 {
        for i in (n - 1)..close.len() {
            let sd = close[i + 1 - n..=i].std_dev();
            if let Some(m) = middle[i] {
                upper[i] = Some(m + k * sd);
                lower[i] = Some(m - k * sd);
            }
        }
    }
    Bands { middle, upper, lower }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn true_range_uses_previous_close() {
        let tr = true_range(&[10.0, 12.0, 11.0], &[9.0, 11.5, 8.0], &[9.5, 12.0, 9.0]);
        assert_eq!(tr, vec![1.0, 2.5, 4.0]);
    }

    #[test]
    fn atr_constant_range() {
        let high = vec![11.0; 30];
        let low = vec![9.0; 30];
        let close = vec![10.0; 30];
        let a = atr(&high, &low, &close, 14);
        assert_eq!(a[12], None);
        assert_eq!(a[13], Some(2.0));
        assert!((a[29].unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn atr_wilder_step() {
        let high = vec![2.0, 2.0, 5.0];
        let low = vec![0.0, 0.0, 1.0];
        let close = vec![1.0, 1.0, 3.0];
        // TR = [2, 2, 4]; seed (2+2)/2 = 2; next (2·1 + 4)/2 = 3
        let a = atr(&high, &low, &close, 2);
        assert_eq!(a, vec![None, Some(2.0), Some(3.0)]);
    }

    #[test]
    fn adx_strong_uptrend_is_high() {
        let high: Vec<f64> = (0..60).map(|i| 101.0 + i as f64).collect();
        let low: Vec<f64> = (0..60).map(|i| 99.0 + i as f64).collect();
        let close: Vec<f64> = (0..60).map(|i| 100.5 + i as f64).collect();
        let a = adx(&high, &low, &close, 14);
        assert_eq!(a[26], None);
        assert!(a[27].is_some());
        // −DM is always zero → DX = 100 every bar
        assert!((a[59].unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn adx_choppy_market_is_low() {
        let high: Vec<f64> = (0..80).map(|i| if i % 2 == 0 { 102.0 } else { 101.0 }).collect();
        let low: Vec<f64> = (0..80).map(|i| if i % 2 == 0 { 99.0 } else { 98.0 }).collect();
        let close = vec![100.0; 80];
        let a = adx(&high, &low, &close, 14);
        assert!(a[79].unwrap() < 15.0, "adx = {:?}", a[79]);
    }

    #[test]
    fn bollinger_uses_sample_std() {
        let close = vec![1.0, 2.0, 3.0, 4.0];
        let b = bollinger(&close, 4, 2.0);
        // mean 2.5, sample variance 5/3
        let sd = (5.0f64 / 3.0).sqrt();
        assert!((b.upper[3].unwrap() - (2.5 + 2.0 * sd)).abs() < 1e-9);
        assert!((b.lower[3].unwrap() - (2.5 - 2.0 * sd)).abs() < 1e-9);
        assert_eq!(b.middle[2], None);
    }
}
