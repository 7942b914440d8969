/// trade_log.rs — JSON trade log and CSV journals
///
///   trade_logs.json          JSON array of TradeRecord, one per open / close
///   logs/trade_log.csv       same records, one row each
///   logs/signal_log.csv      every evaluated symbol with its indicator values
///   logs/rejected_signals.csv triggers that failed a filter, with the checks
///
/// Journal writes never interrupt trading: failures are logged and dropped.
/// The async `Journal` hands file I/O to tokio's blocking pool.
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task;
use tracing::warn;

use crate::execution::ClosedTrade;
use crate::state::ManagedTrade;
use crate::strategy::{Decision, Rejection, Snapshot};

// ── Records ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeEvent {
    Open,
    Close,
}

/// One line of the trade log.  Older logs without `event` / `symbol` and
/// with the `reason`, `closing_*` or balance-before/after keys still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event:           Option<TradeEvent>,
    #[serde(default)]
    pub symbol:          String,
    #[serde(alias = "closing_side")]
    pub trade_side:      String,
    #[serde(alias = "closing_quantity")]
    pub trade_quantity:  f64,
    #[serde(alias = "closing_price")]
    pub trade_price:     f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss:       Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit:     Option<f64>,
    #[serde(default, alias = "reason", skip_serializing_if = "Option::is_none")]
    pub reason_to_open:  Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_to_close: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl:             Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roi:             Option<f64>,
    #[serde(
        default,
        alias = "USDT_balance_before_trade",
        alias = "new_USDT_balance",
        skip_serializing_if = "Option::is_none"
    )]
    pub balance:         Option<f64>,
    pub timestamp:       String,
}

impl TradeRecord {
    pub fn opened(trade: &ManagedTrade, balance: f64) -> Self {
        Self {
            event:           Some(TradeEvent::Open),
            symbol:          trade.symbol.clone(),
            trade_side:      trade.direction.entry_side().as_str().to_owned(),
            trade_quantity:  trade.quantity_f64(),
            trade_price:     trade.entry_price,
            stop_loss:       Some(trade.stop_loss),
            take_profit:     Some(trade.take_profit),
            reason_to_open:  Some(trade.reason.clone()),
            reason_to_close: None,
            pnl:             None,
            roi:             None,
            balance:         Some(balance),
            timestamp:       trade.opened_at.to_rfc3339(),
        }
    }

    pub fn closed(trade: &ClosedTrade, balance: Option<f64>) -> Self {
        Self {
            event:           Some(TradeEvent::Close),
            symbol:          trade.symbol.clone(),
            trade_side:      trade.direction.exit_side().as_str().to_owned(),
            trade_quantity:  trade.quantity,
            trade_price:     trade.exit_price,
            stop_loss:       None,
            take_profit:     None,
            reason_to_open:  None,
            reason_to_close: Some(trade.reason.to_string()),
            pnl:             Some(trade.pnl),
            roi:             Some(trade.roi_pct()),
            balance,
            timestamp:       trade.closed_at.to_rfc3339(),
        }
    }

    /// Explicit event, or inferred from which reason is present.
    pub fn kind(&self) -> TradeEvent {
        self.event.unwrap_or(if self.reason_to_close.is_some() {
            TradeEvent::Close
        } else {
            TradeEvent::Open
        })
    }

    /// RFC 3339, or the naive ISO form older logs used (taken as UTC).
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(&self.timestamp, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|n| n.and_utc())
            })
    }
}

// ── JSON array log ────────────────────────────────────────────────────────

pub struct JsonTradeLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonTradeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every record; an absent file is an empty log, a corrupt one an error.
    pub fn read_all(&self) -> Result<Vec<TradeRecord>> {
        read_records(&self.path)
    }

    /// Append one record, rewriting the array through a temp file + rename.
    pub fn append(&self, record: &TradeRecord) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut records = read_records(&self.path)?;
        records.push(record.clone());

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&records)?)
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

pub fn read_records(path: &Path) -> Result<Vec<TradeRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).with_context(|| format!("{} is not a JSON array of trades", path.display()))
}

// ── CSV journals ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct TradeRow<'a> {
    #[serde(rename = "Timestamp")]
    timestamp:   &'a str,
    #[serde(rename = "Event")]
    event:       &'static str,
    #[serde(rename = "Symbol")]
    symbol:      &'a str,
    #[serde(rename = "Side")]
    side:        &'a str,
    #[serde(rename = "Price")]
    price:       f64,
    #[serde(rename = "Quantity")]
    quantity:    f64,
    #[serde(rename = "Stop_Loss")]
    stop_loss:   Option<f64>,
    #[serde(rename = "Take_Profit")]
    take_profit: Option<f64>,
    #[serde(rename = "PnL_USDT")]
    pnl:         Option<f64>,
    #[serde(rename = "ROI_Percent")]
    roi:         Option<f64>,
    #[serde(rename = "Balance_USDT")]
    balance:     Option<f64>,
    #[serde(rename = "Reason")]
    reason:      &'a str,
}

#[derive(Serialize)]
struct SignalRow<'a> {
    #[serde(rename = "Timestamp")]
    timestamp:      String,
    #[serde(rename = "Symbol")]
    symbol:         &'a str,
    #[serde(rename = "Decision")]
    decision:       &'static str,
    #[serde(rename = "Reason")]
    reason:         &'a str,
    #[serde(rename = "ADX")]
    adx:            Option<f64>,
    #[serde(rename = "Stoch_K")]
    stoch_k:        Option<f64>,
    #[serde(rename = "Stoch_D")]
    stoch_d:        Option<f64>,
    #[serde(rename = "Stoch_K_Confirm")]
    confirm_k:      Option<f64>,
    #[serde(rename = "Stoch_D_Confirm")]
    confirm_d:      Option<f64>,
    #[serde(rename = "RSI")]
    rsi:            Option<f64>,
    #[serde(rename = "Price")]
    price:          Option<f64>,
    #[serde(rename = "SMA")]
    sma:            Option<f64>,
    #[serde(rename = "HMA")]
    hma:            Option<f64>,
    #[serde(rename = "HMA_Slope")]
    hma_slope:      &'static str,
    #[serde(rename = "ATR")]
    atr:            Option<f64>,
    #[serde(rename = "Trend_SMA")]
    trend_sma:      Option<f64>,
    #[serde(rename = "Price_vs_Trend_SMA")]
    vs_trend_sma:   &'static str,
}

#[derive(Serialize)]
struct RejectionRow<'a> {
    #[serde(rename = "Timestamp")]
    timestamp:     String,
    #[serde(rename = "Symbol")]
    symbol:        &'a str,
    #[serde(rename = "Attempted_Side")]
    side:          &'static str,
    #[serde(rename = "Rejection_Reason")]
    reason:        &'a str,
    #[serde(rename = "ADX")]
    adx:           f64,
    #[serde(rename = "Stoch_K")]
    stoch_k:       f64,
    #[serde(rename = "RSI")]
    rsi:           Option<f64>,
    #[serde(rename = "Price_vs_SMA")]
    price_vs_sma:  Option<f64>,
    #[serde(rename = "HMA_Slope")]
    hma_slope:     Option<f64>,
    #[serde(rename = "Passed")]
    passed:        String,
    #[serde(rename = "Failed")]
    failed:        String,
}

fn slope_label(slope: Option<f64>) -> &'static str {
    match slope {
        Some(s) if s > 0.0 => "UP",
        Some(s) if s < 0.0 => "DOWN",
        _ => "FLAT",
    }
}

pub struct CsvJournal {
    dir:  PathBuf,
    lock: Mutex<()>,
}

impl CsvJournal {
    pub const TRADES: &'static str = "trade_log.csv";
    pub const SIGNALS: &'static str = "signal_log.csv";
    pub const REJECTED: &'static str = "rejected_signals.csv";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), lock: Mutex::new(()) }
    }

    pub fn path_of(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Append one row; the header is written only when the file is new.
    fn append_row<T: Serialize>(&self, file: &str, row: &T) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        fs::create_dir_all(&self.dir)?;
        let path = self.path_of(file);
        let is_new = !path.exists() || fs::metadata(&path)?.len() == 0;
        let handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new().has_headers(is_new).from_writer(handle);
        writer.serialize(row)?;
        writer.flush()?;
        Ok(())
    }

    pub fn log_trade(&self, record: &TradeRecord) -> Result<()> {
        let reason = record
            .reason_to_open
            .as_deref()
            .or(record.reason_to_close.as_deref())
            .unwrap_or("");
        let row = TradeRow {
            timestamp:   &record.timestamp,
            event:       match record.kind() {
                TradeEvent::Open  => "OPEN",
                TradeEvent::Close => "CLOSE",
            },
            symbol:      &record.symbol,
            side:        &record.trade_side,
            price:       record.trade_price,
            quantity:    record.trade_quantity,
            stop_loss:   record.stop_loss,
            take_profit: record.take_profit,
            pnl:         record.pnl,
            roi:         record.roi,
            balance:     record.balance,
            reason,
        };
        self.append_row(Self::TRADES, &row)
    }

    pub fn log_signal(&self, symbol: &str, decision: &Decision, snap: Option<&Snapshot>) -> Result<()> {
        let row = SignalRow {
            timestamp:    Utc::now().to_rfc3339(),
            symbol,
            decision:     decision.label(),
            reason:       decision.reason(),
            adx:          snap.map(|s| s.trend_adx),
            stoch_k:      snap.map(|s| s.stoch_k),
            stoch_d:      snap.map(|s| s.stoch_d),
            confirm_k:    snap.and_then(|s| s.confirm_k),
            confirm_d:    snap.and_then(|s| s.confirm_d),
            rsi:          snap.and_then(|s| s.rsi),
            price:        snap.map(|s| s.close),
            sma:          snap.and_then(|s| s.sma),
            hma:          snap.and_then(|s| s.hma),
            hma_slope:    slope_label(snap.and_then(|s| s.hma_slope())),
            atr:          snap.map(|s| s.atr),
            trend_sma:    snap.map(|s| s.trend_sma),
            vs_trend_sma: match snap {
                Some(s) if s.trend_close > s.trend_sma => "ABOVE",
                Some(_) => "BELOW",
                None => "N/A",
            },
        };
        self.append_row(Self::SIGNALS, &row)
    }

    pub fn log_rejection(&self, symbol: &str, rejection: &Rejection, snap: &Snapshot) -> Result<()> {
        let row = RejectionRow {
            timestamp:    Utc::now().to_rfc3339(),
            symbol,
            side:         rejection.direction.as_str(),
            reason:       &rejection.reason,
            adx:          snap.trend_adx,
            stoch_k:      snap.stoch_k,
            rsi:          snap.rsi,
            price_vs_sma: snap.price_vs_sma(),
            hma_slope:    snap.hma_slope(),
            passed:       rejection.checks.passed().join("|"),
            failed:       rejection.checks.failed().join("|"),
        };
        self.append_row(Self::REJECTED, &row)
    }
}

// ── Journal ───────────────────────────────────────────────────────────────

/// The one place trade events are written: JSON log plus CSV journals.
/// File I/O runs on the blocking pool; each call returns once its rows are on disk.
pub struct Journal {
    writers: Arc<Writers>,
}

struct Writers {
    json: JsonTradeLog,
    csv:  CsvJournal,
}

impl Writers {
    fn record(&self, record: &TradeRecord) {
        if let Err(e) = self.json.append(record) {
            warn!("⚠️ trade log append failed: {:#}", e);
        }
        if let Err(e) = self.csv.log_trade(record) {
            warn!("⚠️ trade csv append failed: {:#}", e);
        }
    }

    fn signal(&self, symbol: &str, decision: &Decision, snap: Option<&Snapshot>) {
        if let Err(e) = self.csv.log_signal(symbol, decision, snap) {
            warn!("⚠️ signal csv append failed: {:#}", e);
        }
        if let (Decision::Reject(rejection), Some(snap)) = (decision, snap) {
            if let Err(e) = self.csv.log_rejection(symbol, rejection, snap) {
                warn!("⚠️ rejection csv append failed: {:#}", e);
            }
        }
    }
}

impl Journal {
    pub fn new(json_path: impl Into<PathBuf>, csv_dir: impl Into<PathBuf>) -> Self {
        let writers = Writers { json: JsonTradeLog::new(json_path), csv: CsvJournal::new(csv_dir) };
        Self { writers: Arc::new(writers) }
    }

    pub fn json(&self) -> &JsonTradeLog {
        &self.writers.json
    }

    pub async fn record_open(&self, trade: &ManagedTrade, balance: f64) {
        self.record(TradeRecord::opened(trade, balance)).await;
    }

    pub async fn record_close(&self, trade: &ClosedTrade, balance: Option<f64>) {
        self.record(TradeRecord::closed(trade, balance)).await;
    }

    async fn record(&self, record: TradeRecord) {
        let writers = self.writers.clone();
        if let Err(e) = task::spawn_blocking(move || writers.record(&record)).await {
            warn!("⚠️ trade journal task failed: {}", e);
        }
    }

    pub async fn signal(&self, symbol: &str, decision: &Decision, snap: Option<&Snapshot>) {
        let writers = self.writers.clone();
        let (symbol, decision, snap) = (symbol.to_owned(), decision.clone(), snap.cloned());
        let written = task::spawn_blocking(move || writers.signal(&symbol, &decision, snap.as_ref())).await;
        if let Err(e) = written {
            warn!("⚠️ signal journal task failed: {}", e);
        }
    }
}
