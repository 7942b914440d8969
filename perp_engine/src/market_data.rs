/// market_data.rs — Kline plumbing between the exchange and the indicators
///
///   Candles       columnar OHLCV view, what every indicator consumes
///   MultiFrame    entry / confirm / trend klines for one symbol
///   IndicatorCache  slow frames (1h, 4h) are refetched only when stale
///   Parquet I/O   klines saved by `perp_tools fetch`, replayed by backtests
///
/// Only closed bars are ever evaluated: the still-forming last kline is
/// dropped before anything looks at it.
use ahash::AHashMap;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{interval_seconds, AppConfig};
use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::{BinanceFutures, FuturesExchange, Kline};

/// Page size for history downloads.
pub const HISTORY_BATCH: u32 = 1_000;

// ── Candles ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Candles {
    pub open_time: Vec<i64>,
    pub open:      Vec<f64>,
    pub high:      Vec<f64>,
    pub low:       Vec<f64>,
    pub close:     Vec<f64>,
    pub volume:    Vec<f64>,
}

impl Candles {
    pub fn from_klines(klines: &[Kline]) -> Self {
        Self {
            open_time: klines.iter().map(|k| k.open_time).collect(),
            open:      klines.iter().map(|k| k.open).collect(),
            high:      klines.iter().map(|k| k.high).collect(),
            low:       klines.iter().map(|k| k.low).collect(),
            close:     klines.iter().map(|k| k.close).collect(),
            volume:    klines.iter().map(|k| k.volume).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.close.last().copied()
    }
}

/// Drop the last kline if it has not closed yet at `now_ms`.
pub fn drop_open_candle(mut klines: Vec<Kline>, now_ms: i64) -> Vec<Kline> {
    if klines.last().is_some_and(|k| k.close_time > now_ms) {
        klines.pop();
    }
    klines
}

// ── Multi-timeframe fetch ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MultiFrame {
    pub entry:   Vec<Kline>,
    pub confirm: Vec<Kline>,
    pub trend:   Vec<Kline>,
}

struct CachedFrame {
    fetched_at: DateTime<Utc>,
    klines:     Vec<Kline>,
}

/// Per (symbol, interval) kline cache with a max age.
pub struct IndicatorCache {
    ttl:    Duration,
    frames: Mutex<AHashMap<(String, String), CachedFrame>>,
}

impl IndicatorCache {
    pub fn new(ttl_secs: i64) -> Self {
        Self { ttl: Duration::seconds(ttl_secs), frames: Mutex::new(AHashMap::new()) }
    }

    /// Cached klines if younger than the TTL, otherwise a fresh fetch.
    pub async fn get_or_fetch(
        &self,
        exchange: &dyn FuturesExchange,
        symbol:   &str,
        interval: &str,
        limit:    u32,
        now:      DateTime<Utc>,
    ) -> ExchangeResult<Vec<Kline>> {
        let key = (symbol.to_owned(), interval.to_owned());
        if let Some(hit) = self.frames.lock().await.get(&key) {
            if now - hit.fetched_at < self.ttl {
                debug!("cache hit {} {}", symbol, interval);
                return Ok(hit.klines.clone());
            }
        }

        let klines = exchange.klines(symbol, interval, limit).await?;
        self.frames
            .lock()
            .await
            .insert(key, CachedFrame { fetched_at: now, klines: klines.clone() });
        Ok(klines)
    }

    pub async fn invalidate(&self, symbol: &str) {
        self.frames.lock().await.retain(|(s, _), _| s != symbol);
    }

    pub async fn len(&self) -> usize {
        self.frames.lock().await.len()
    }
}

/// Fetch all three timeframes for a symbol concurrently.
///
/// The entry frame is always fresh; confirm and trend frames go through
/// the cache.  Forming candles are dropped from each frame.
pub async fn fetch_multi_frame(
    exchange: &dyn FuturesExchange,
    cache:    &IndicatorCache,
    symbol:   &str,
    cfg:      &AppConfig,
    now:      DateTime<Utc>,
) -> ExchangeResult<MultiFrame> {
    let limit = cfg.kline_lookback;
    let (entry, confirm, trend) = tokio::try_join!(
        exchange.klines(symbol, &cfg.kline_interval, limit),
        cache.get_or_fetch(exchange, symbol, &cfg.confirm_interval, limit, now),
        cache.get_or_fetch(exchange, symbol, &cfg.trend_interval, limit, now),
    )?;
    let now_ms = now.timestamp_millis();
    Ok(MultiFrame {
        entry:   drop_open_candle(entry, now_ms),
        confirm: drop_open_candle(confirm, now_ms),
        trend:   drop_open_candle(trend, now_ms),
    })
}

// ── History download ────────────────────────────────────────────────────

const RATE_LIMIT_BACKOFF_SECS: u64 = 30;
const MAX_RATE_LIMIT_RETRIES: u32 = 5;

/// Download the most recent `total` klines by paging backwards in batches
/// of at most 1000.  A rate-limit answer sleeps and retries the same page.
pub async fn fetch_history(
    client:   &BinanceFutures,
    symbol:   &str,
    interval: &str,
    total:    u64,
) -> Result<Vec<Kline>> {
    let mut out: Vec<Kline> = Vec::new();
    let mut end: Option<i64> = None;
    let mut retries = 0;

    while (out.len() as u64) < total {
        let want = (total - out.len() as u64).min(HISTORY_BATCH as u64) as u32;
        let page = match client.klines_before(symbol, interval, end, want).await {
            Ok(p) => p,
            Err(ExchangeError::RateLimited { status }) if retries < MAX_RATE_LIMIT_RETRIES => {
                retries += 1;
                warn!("⏳ HTTP {} on {} klines, sleeping {}s", status, symbol, RATE_LIMIT_BACKOFF_SECS);
                tokio::time::sleep(std::time::Duration::from_secs(RATE_LIMIT_BACKOFF_SECS)).await;
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("fetching {symbol} {interval} klines")),
        };
        retries = 0;
        let Some(first) = page.first() else { break };
        end = Some(first.open_time - 1);
        let short_page = (page.len() as u32) < want;
        debug!("{} page of {} bars ending {}", symbol, page.len(), first.open_time);

        let mut merged = page;
        merged.extend(out);
        out = merged;
        if short_page {
            break;
        }
    }
    info!("⬇️ Downloaded {} {} bars of {}", out.len(), interval, symbol);
    Ok(out)
}

/// Klines of a higher timeframe that had closed by `t_ms`.
pub fn closed_by(klines: &[Kline], t_ms: i64) -> &[Kline] {
    let n = klines.partition_point(|k| k.close_time <= t_ms);
    &klines[..n]
}

/// Aggregate closed lower-timeframe klines into `interval` bars.
///
/// Bars are bucketed by `open_time / interval_ms`; a trailing partial
/// bucket is dropped.
pub fn resample(klines: &[Kline], interval: &str) -> Result<Vec<Kline>> {
    let Some(secs) = interval_seconds(interval) else {
        bail!("unsupported interval '{interval}'");
    };
    let ms = secs as i64 * 1_000;
    let mut out: Vec<Kline> = Vec::new();
    let mut bucket_of_last = None;

    for k in klines {
        let bucket = k.open_time.div_euclid(ms);
        match out.last_mut() {
            Some(bar) if bucket_of_last == Some(bucket) => {
                bar.high = bar.high.max(k.high);
                bar.low = bar.low.min(k.low);
                bar.close = k.close;
                bar.volume += k.volume;
                bar.close_time = k.close_time;
            }
            _ => {
                out.push(Kline {
                    open_time:  bucket * ms,
                    close_time: k.close_time,
                    ..*k
                });
                bucket_of_last = Some(bucket);
            }
        }
    }
    if let Some(last) = out.last() {
        if last.close_time < last.open_time + ms - 1 {
            out.pop();
        }
    }
    Ok(out)
}

// ── Parquet I/O ───────────────────────────────────────────────────────────

/// Write klines to a parquet file (columns: open_time, open, high, low,
/// close, volume, close_time, timestamp).
pub fn write_parquet_klines(klines: &[Kline], path: &Path) -> Result<()> {
    let timestamps: Vec<String> = klines
        .iter()
        .map(|k| {
            DateTime::<Utc>::from_timestamp_millis(k.open_time)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default()
        })
        .collect();

    let mut df = df!(
        "timestamp"  => timestamps,
        "open"       => klines.iter().map(|k| k.open).collect::<Vec<f64>>(),
        "high"       => klines.iter().map(|k| k.high).collect::<Vec<f64>>(),
        "low"        => klines.iter().map(|k| k.low).collect::<Vec<f64>>(),
        "close"      => klines.iter().map(|k| k.close).collect::<Vec<f64>>(),
        "volume"     => klines.iter().map(|k| k.volume).collect::<Vec<f64>>(),
        "open_time"  => klines.iter().map(|k| k.open_time).collect::<Vec<i64>>(),
        "close_time" => klines.iter().map(|k| k.close_time).collect::<Vec<i64>>()
    )?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    ParquetWriter::new(&mut file).finish(&mut df)?;
    Ok(())
}

fn f64_column(df: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let series = df
        .column(name)
        .with_context(|| format!("missing column '{name}'"))?
        .as_materialized_series()
        .cast(&DataType::Float64)?;
    series
        .f64()?
        .into_iter()
        .map(|v| v.with_context(|| format!("null in column '{name}'")))
        .collect()
}

fn i64_column(df: &DataFrame, name: &str) -> Result<Vec<i64>> {
    let series = df
        .column(name)
        .with_context(|| format!("missing column '{name}'"))?
        .as_materialized_series()
        .cast(&DataType::Int64)?;
    series
        .i64()?
        .into_iter()
        .map(|v| v.with_context(|| format!("null in column '{name}'")))
        .collect()
}

/// Read one parquet file of klines.  Files without a close_time column
/// get it derived from `interval`.
pub fn load_parquet_klines(path: &Path, interval: &str) -> Result<Vec<Kline>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let df = ParquetReader::new(file).finish()?;

    let open_time = i64_column(&df, "open_time")?;
    let open      = f64_column(&df, "open")?;
    let high      = f64_column(&df, "high")?;
    let low       = f64_column(&df, "low")?;
    let close     = f64_column(&df, "close")?;
    let volume    = f64_column(&df, "volume")?;
    let close_time = match i64_column(&df, "close_time") {
        Ok(ct) => ct,
        Err(_) => {
            let ms = interval_seconds(interval)
                .with_context(|| format!("no close_time column and unknown interval '{interval}'"))?
                as i64
                * 1_000;
            open_time.iter().map(|t| t + ms - 1).collect()
        }
    };

    Ok((0..open_time.len())
        .map(|i| Kline {
            open_time:  open_time[i],
            open:       open[i],
            high:       high[i],
            low:        low[i],
            close:      close[i],
            volume:     volume[i],
            close_time: close_time[i],
        })
        .collect())
}

/// All parquet files under `dir/SYMBOL/`, merged, sorted and de-duplicated
/// by open time.
pub fn load_klines_dir(dir: &Path, symbol: &str, interval: &str) -> Result<Vec<Kline>> {
    let pattern = dir.join(symbol).join("*.parquet");
    let pattern = pattern.to_string_lossy();
    let mut files: Vec<PathBuf> = glob::glob(&pattern)?.filter_map(|p| p.ok()).collect();
    files.sort();
    if files.is_empty() {
        bail!("no parquet files match {}", pattern);
    }

    let mut klines = Vec::new();
    for f in &files {
        klines.extend(load_parquet_klines(f, interval)?);
    }
    klines.sort_by_key(|k| k.open_time);
    klines.dedup_by_key(|k| k.open_time);
    info!("📂 Loaded {} bars of {} from {} file(s)", klines.len(), symbol, files.len());
    Ok(klines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;

    fn bar(open_time: i64, close: f64) -> Kline {
        Kline {
            open_time,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            close_time: open_time + 59_999,
        }
    }

    #[test]
    fn forming_candle_is_dropped() {
        let k = vec![bar(0, 1.0), bar(60_000, 2.0)];
        assert_eq!(drop_open_candle(k.clone(), 100_000).len(), 1);
        assert_eq!(drop_open_candle(k, 120_000).len(), 2);
    }

    #[test]
    fn closed_by_respects_close_time() {
        let k = vec![bar(0, 1.0), bar(60_000, 2.0), bar(120_000, 3.0)];
        assert_eq!(closed_by(&k, 119_999).len(), 2);
        assert_eq!(closed_by(&k, 59_998).len(), 0);
    }

    #[test]
    fn resample_to_five_minutes() {
        let k: Vec<Kline> = (0..12).map(|i| bar(i * 60_000, i as f64)).collect();
        let five = resample(&k, "5m").unwrap();
        // 0..5, 5..10 complete; 10, 11 partial and dropped
        assert_eq!(five.len(), 2);
        assert_eq!(five[0].open, 0.0);
        assert_eq!(five[0].close, 4.0);
        assert_eq!(five[0].high, 5.0);
        assert_eq!(five[1].volume, 50.0);
    }

    #[test]
    fn parquet_round_trip_through_directory() {
        let dir = std::env::temp_dir().join(format!("perp-md-{}", uuid::Uuid::new_v4()));
        let k: Vec<Kline> = (0..5).map(|i| bar(i * 60_000, 100.0 + i as f64)).collect();
        write_parquet_klines(&k[..3], &dir.join("BTCUSDT").join("a.parquet")).unwrap();
        write_parquet_klines(&k[2..], &dir.join("BTCUSDT").join("b.parquet")).unwrap();

        let loaded = load_klines_dir(&dir, "BTCUSDT", "1m").unwrap();
        assert_eq!(loaded, k);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn cache_serves_until_stale() {
        let ex = PaperExchange::new(1_000.0, 0.0);
        ex.set_klines("BTCUSDT", "4h", vec![bar(0, 1.0)]);
        let cache = IndicatorCache::new(300);
        let t0 = Utc::now();

        let first = cache.get_or_fetch(&ex, "BTCUSDT", "4h", 10, t0).await.unwrap();
        ex.set_klines("BTCUSDT", "4h", vec![bar(0, 1.0), bar(60_000, 2.0)]);

        let cached = cache.get_or_fetch(&ex, "BTCUSDT", "4h", 10, t0 + Duration::seconds(60)).await.unwrap();
        assert_eq!(cached, first);

        let fresh = cache.get_or_fetch(&ex, "BTCUSDT", "4h", 10, t0 + Duration::seconds(301)).await.unwrap();
        assert_eq!(fresh.len(), 2);
    }
}
