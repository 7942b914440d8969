/// config.rs — Centralised configuration loaded from .env
///
/// Every parameter the bot, the backtester and the dashboard consume is
/// defined here.  Loading happens once at startup; every module borrows
/// &AppConfig (or holds an Arc<AppConfig> when it outlives main).
///
/// `AppConfig::default()` carries the production defaults, `from_env()`
/// overrides them key by key.  Tests build configs from `default()`.
use anyhow::{bail, Result};
use std::env;
use std::fmt;
use std::str::FromStr;

/// Fee model constants (Binance USDT-M Futures defaults)
/// Maker:  0.02% = 0.0002
/// Taker:  0.05% = 0.0005
pub const DEFAULT_MAKER_FEE: f64 = 0.0002;
pub const DEFAULT_TAKER_FEE: f64 = 0.0005;

pub const TESTNET_REST_URL: &str = "https://testnet.binancefuture.com";
pub const MAINNET_REST_URL: &str = "https://fapi.binance.com";

// ── Enumerated settings ───────────────────────────────────────────────────

/// Which entry strategy the bot runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Stochastic oversold/overbought exits with trend + RSI/SMA/HMA filters
    Stochastic,
    /// 0.618 pullback in an ADX trend, scored by confirmations
    Fibonacci,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stochastic" | "stoch" => Ok(Self::Stochastic),
            "fibonacci" | "fib"    => Ok(Self::Fibonacci),
            other => Err(format!("unknown strategy '{other}' (expected stochastic|fibonacci)")),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stochastic => write!(f, "stochastic"),
            Self::Fibonacci  => write!(f, "fibonacci"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginType {
    Isolated,
    Crossed,
}

impl MarginType {
    /// Wire value for /fapi/v1/marginType
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Isolated => "ISOLATED",
            Self::Crossed  => "CROSSED",
        }
    }
}

impl FromStr for MarginType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ISOLATED"          => Ok(Self::Isolated),
            "CROSSED" | "CROSS" => Ok(Self::Crossed),
            other => Err(format!("unknown margin type '{other}' (expected ISOLATED|CROSSED)")),
        }
    }
}

// ── AppConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AppConfig {
    // ── Binance credentials ───────────────────────────────────────────
    pub api_key:     String,
    pub api_secret:  String,
    pub use_testnet: bool,
    pub rest_url:    String,

    // ── Trading universe & timeframes ─────────────────────────────────
    pub trading_pairs:    Vec<String>,
    /// Entry timeframe (signals are evaluated on closed bars of this interval)
    pub kline_interval:   String,
    /// Confirmation timeframe (stochastic K/D alignment)
    pub confirm_interval: String,
    /// Trend timeframe (ADX + SMA50 regime)
    pub trend_interval:   String,
    pub kline_lookback:   u32,

    // ── Strategy selection ────────────────────────────────────────────
    pub strategy: StrategyKind,

    // ── Account settings ──────────────────────────────────────────────
    pub leverage:          u32,
    /// Used when the exchange rejects `leverage` for a symbol (-4028)
    pub fallback_leverage: u32,
    pub margin_type:       MarginType,

    // ── Indicator parameters ──────────────────────────────────────────
    pub stoch_period: usize,
    pub stoch_k:      usize,
    pub stoch_d:      usize,
    pub oversold:     f64,
    pub overbought:   f64,
    pub rsi_period:   usize,
    pub atr_period:   usize,
    pub adx_period:   usize,
    pub sma_period:   usize,
    pub hma_period:   usize,
    /// Bars (before the current one) defining support / resistance
    pub sr_lookback:  usize,
    /// Bars searched for the Fibonacci swing high / low
    pub fib_lookback: usize,
    /// Trend frame needs ADX above this to count as trending
    pub min_adx:      f64,

    // ── Entry filters ─────────────────────────────────────────────────
    /// Stochastic strategy: confirm-frame K must agree with the direction
    pub require_confirm_alignment: bool,
    /// Fibonacci strategy: minimum confirmation score
    pub min_confirmations:         usize,
    /// Skip longs above +x and shorts below −x funding
    pub max_funding_rate:          f64,
    pub use_time_filter:           bool,

    // ── Risk & sizing ─────────────────────────────────────────────────
    /// Fraction of balance risked between entry and stop
    pub risk_per_trade:  f64,
    /// Cap on margin committed to one trade, as a fraction of balance
    pub max_margin_frac: f64,
    pub sl_atr_mult:     f64,
    pub risk_reward:     f64,
    /// Used when the exchange publishes no MIN_NOTIONAL filter
    pub default_min_notional: f64,

    // ── Stop management ───────────────────────────────────────────────
    /// Move stop to entry once price has travelled this many R
    pub breakeven_trigger_r: f64,
    /// Start trailing once price has travelled this many R
    pub trailing_trigger_r:  f64,
    pub trailing_atr_mult:   f64,

    // ── Exits ─────────────────────────────────────────────────────────
    /// Close when ROI on margin reaches this percentage
    pub roi_take_profit:     f64,
    /// Close when ROI on margin falls to this percentage (negative)
    pub roi_stop_loss:       f64,
    pub use_indicator_exits: bool,

    // ── Portfolio limits & circuit breaker ────────────────────────────
    pub max_concurrent_trades:  usize,
    pub max_consecutive_losses: u32,
    pub loss_pause_hours:       i64,

    // ── Loop cadence & caching ────────────────────────────────────────
    pub cycle_seconds:        u64,
    pub indicator_cache_secs: i64,

    // ── Logs ──────────────────────────────────────────────────────────
    pub trade_log_path: String,
    pub log_dir:        String,

    // ── Telegram ──────────────────────────────────────────────────────
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id:   Option<String>,

    // ── Dashboard ─────────────────────────────────────────────────────
    pub dashboard_addr:       String,
    pub dashboard_cache_secs: u64,

    // ── Paper trading / backtesting ───────────────────────────────────
    pub paper_trading:     bool,
    pub initial_capital:   f64,
    pub maker_fee:         f64,
    pub taker_fee:         f64,
    pub backtest_symbol:   String,
    pub backtest_limit:    u64,
    pub backtest_data_dir: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key:     String::new(),
            api_secret:  String::new(),
            use_testnet: true,
            rest_url:    TESTNET_REST_URL.into(),

            trading_pairs:    vec!["BTCUSDT".into(), "ETHUSDT".into(), "SOLUSDT".into()],
            kline_interval:   "15m".into(),
            confirm_interval: "1h".into(),
            trend_interval:   "4h".into(),
            kline_lookback:   250,

            strategy: StrategyKind::Stochastic,

            leverage:          20,
            fallback_leverage: 10,
            margin_type:       MarginType::Isolated,

            stoch_period: 14,
            stoch_k:      3,
            stoch_d:      3,
            oversold:     20.0,
            overbought:   80.0,
            rsi_period:   14,
            atr_period:   14,
            adx_period:   14,
            sma_period:   50,
            hma_period:   14,
            sr_lookback:  20,
            fib_lookback: 50,
            min_adx:      15.0,

            require_confirm_alignment: false,
            min_confirmations:         2,
            max_funding_rate:          0.001,
            use_time_filter:           true,

            risk_per_trade:       0.02,
            max_margin_frac:      0.32,
            sl_atr_mult:          1.5,
            risk_reward:          2.0,
            default_min_notional: 5.0,

            breakeven_trigger_r: 1.0,
            trailing_trigger_r:  1.5,
            trailing_atr_mult:   1.0,

            roi_take_profit:     50.0,
            roi_stop_loss:       -10.0,
            use_indicator_exits: true,

            max_concurrent_trades:  3,
            max_consecutive_losses: 2,
            loss_pause_hours:       24,

            cycle_seconds:        60,
            indicator_cache_secs: 300,

            trade_log_path: "trade_logs.json".into(),
            log_dir:        "logs".into(),

            telegram_bot_token: None,
            telegram_chat_id:   None,

            dashboard_addr:       "127.0.0.1:5000".into(),
            dashboard_cache_secs: 10,

            paper_trading:     true,
            initial_capital:   1000.0,
            maker_fee:         DEFAULT_MAKER_FEE,
            taker_fee:         DEFAULT_TAKER_FEE,
            backtest_symbol:   "BTCUSDT".into(),
            backtest_limit:    1000,
            backtest_data_dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables (after dotenv).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // ignore missing .env

        let d = Self::default();

        let use_testnet = parse_env("BINANCE_USE_TESTNET", d.use_testnet)?;
        let rest_url = env::var("BINANCE_FUTURES_REST_URL").unwrap_or_else(|_| {
            if use_testnet { TESTNET_REST_URL.into() } else { MAINNET_REST_URL.into() }
        });

        let trading_pairs = match env::var("TRADING_PAIRS") {
            Ok(raw) => parse_symbols(&raw),
            Err(_)  => d.trading_pairs.clone(),
        };

        let cfg = Self {
            api_key:    env::var("BINANCE_API_KEY").unwrap_or_default(),
            api_secret: env::var("BINANCE_API_SECRET").unwrap_or_default(),
            use_testnet,
            rest_url,

            trading_pairs,
            kline_interval:   string_env("KLINE_INTERVAL",   &d.kline_interval),
            confirm_interval: string_env("CONFIRM_INTERVAL", &d.confirm_interval),
            trend_interval:   string_env("TREND_INTERVAL",   &d.trend_interval),
            kline_lookback:   parse_env("KLINE_LOOKBACK", d.kline_lookback)?,

            strategy: parse_env("STRATEGY", d.strategy)?,

            leverage:          parse_env("LEVERAGE",          d.leverage)?,
            fallback_leverage: parse_env("FALLBACK_LEVERAGE", d.fallback_leverage)?,
            margin_type:       parse_env("MARGIN_TYPE",       d.margin_type)?,

            stoch_period: parse_env("STOCH_PERIOD", d.stoch_period)?,
            stoch_k:      parse_env("STOCH_K",      d.stoch_k)?,
            stoch_d:      parse_env("STOCH_D",      d.stoch_d)?,
            oversold:     parse_env("OVERSOLD",     d.oversold)?,
            overbought:   parse_env("OVERBOUGHT",   d.overbought)?,
            rsi_period:   parse_env("RSI_PERIOD",   d.rsi_period)?,
            atr_period:   parse_env("ATR_PERIOD",   d.atr_period)?,
            adx_period:   parse_env("ADX_PERIOD",   d.adx_period)?,
            sma_period:   parse_env("SMA_PERIOD",   d.sma_period)?,
            hma_period:   parse_env("HMA_PERIOD",   d.hma_period)?,
            sr_lookback:  parse_env("SR_LOOKBACK",  d.sr_lookback)?,
            fib_lookback: parse_env("FIB_LOOKBACK", d.fib_lookback)?,
            min_adx:      parse_env("MIN_ADX",      d.min_adx)?,

            require_confirm_alignment: parse_env("REQUIRE_CONFIRM_ALIGNMENT", d.require_confirm_alignment)?,
            min_confirmations:         parse_env("MIN_CONFIRMATIONS",         d.min_confirmations)?,
            max_funding_rate:          parse_env("MAX_FUNDING_RATE",          d.max_funding_rate)?,
            use_time_filter:           parse_env("USE_TIME_FILTER",           d.use_time_filter)?,

            risk_per_trade:       parse_env("RISK_PER_TRADE",       d.risk_per_trade)?,
            max_margin_frac:      parse_env("MAX_MARGIN_FRAC",      d.max_margin_frac)?,
            sl_atr_mult:          parse_env("SL_ATR_MULT",          d.sl_atr_mult)?,
            risk_reward:          parse_env("RISK_REWARD",          d.risk_reward)?,
            default_min_notional: parse_env("DEFAULT_MIN_NOTIONAL", d.default_min_notional)?,

            breakeven_trigger_r: parse_env("BREAKEVEN_TRIGGER_R", d.breakeven_trigger_r)?,
            trailing_trigger_r:  parse_env("TRAILING_TRIGGER_R",  d.trailing_trigger_r)?,
            trailing_atr_mult:   parse_env("TRAILING_ATR_MULT",   d.trailing_atr_mult)?,

            roi_take_profit:     parse_env("ROI_TAKE_PROFIT",     d.roi_take_profit)?,
            roi_stop_loss:       parse_env("ROI_STOP_LOSS",       d.roi_stop_loss)?,
            use_indicator_exits: parse_env("USE_INDICATOR_EXITS", d.use_indicator_exits)?,

            max_concurrent_trades:  parse_env("MAX_CONCURRENT_TRADES",  d.max_concurrent_trades)?,
            max_consecutive_losses: parse_env("MAX_CONSECUTIVE_LOSSES", d.max_consecutive_losses)?,
            loss_pause_hours:       parse_env("LOSS_PAUSE_HOURS",       d.loss_pause_hours)?,

            cycle_seconds:        parse_env("CYCLE_SECONDS",        d.cycle_seconds)?,
            indicator_cache_secs: parse_env("INDICATOR_CACHE_SECS", d.indicator_cache_secs)?,

            trade_log_path: string_env("TRADE_LOG_PATH", &d.trade_log_path),
            log_dir:        string_env("LOG_DIR",        &d.log_dir),

            telegram_bot_token: optional_env("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id:   optional_env("TELEGRAM_CHAT_ID"),

            dashboard_addr:       string_env("DASHBOARD_ADDR", &d.dashboard_addr),
            dashboard_cache_secs: parse_env("DASHBOARD_CACHE_SECS", d.dashboard_cache_secs)?,

            paper_trading:     parse_env("PAPER_TRADING",   d.paper_trading)?,
            initial_capital:   parse_env("INITIAL_CAPITAL", d.initial_capital)?,
            maker_fee:         parse_env("MAKER_FEE",       d.maker_fee)?,
            taker_fee:         parse_env("TAKER_FEE",       d.taker_fee)?,
            backtest_symbol:   string_env("BACKTEST_SYMBOL", &d.backtest_symbol),
            backtest_limit:    parse_env("BACKTEST_LIMIT",  d.backtest_limit)?,
            backtest_data_dir: optional_env("BACKTEST_DATA_DIR"),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject combinations that would make the strategy or sizing meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.trading_pairs.is_empty() {
            bail!("TRADING_PAIRS is empty");
        }
        if self.oversold >= self.overbought {
            bail!("OVERSOLD ({}) must be below OVERBOUGHT ({})", self.oversold, self.overbought);
        }
        if self.risk_per_trade <= 0.0 || self.risk_per_trade >= 1.0 {
            bail!("RISK_PER_TRADE must be in (0, 1), got {}", self.risk_per_trade);
        }
        if self.max_margin_frac <= 0.0 || self.max_margin_frac > 1.0 {
            bail!("MAX_MARGIN_FRAC must be in (0, 1], got {}", self.max_margin_frac);
        }
        if self.risk_reward <= 0.0 {
            bail!("RISK_REWARD must be positive, got {}", self.risk_reward);
        }
        if self.sl_atr_mult <= 0.0 {
            bail!("SL_ATR_MULT must be positive, got {}", self.sl_atr_mult);
        }
        if self.leverage == 0 || self.fallback_leverage == 0 {
            bail!("LEVERAGE and FALLBACK_LEVERAGE must be at least 1");
        }
        if self.trailing_trigger_r < self.breakeven_trigger_r {
            bail!(
                "TRAILING_TRIGGER_R ({}) must not be below BREAKEVEN_TRIGGER_R ({})",
                self.trailing_trigger_r, self.breakeven_trigger_r
            );
        }
        if self.max_concurrent_trades == 0 {
            bail!("MAX_CONCURRENT_TRADES must be at least 1");
        }
        for iv in [&self.kline_interval, &self.confirm_interval, &self.trend_interval] {
            if interval_seconds(iv).is_none() {
                bail!("unsupported kline interval '{iv}'");
            }
        }
        Ok(())
    }

    /// Telegram credentials, when both are configured.
    pub fn telegram(&self) -> Option<(&str, &str)> {
        match (&self.telegram_bot_token, &self.telegram_chat_id) {
            (Some(t), Some(c)) => Some((t.as_str(), c.as_str())),
            _ => None,
        }
    }
}

// ── Interval helpers ──────────────────────────────────────────────────────

/// Length of a Binance kline interval in seconds.
pub fn interval_seconds(interval: &str) -> Option<u64> {
    let secs = match interval {
        "1m"  => 60,
        "3m"  => 180,
        "5m"  => 300,
        "15m" => 900,
        "30m" => 1_800,
        "1h"  => 3_600,
        "2h"  => 7_200,
        "4h"  => 14_400,
        "6h"  => 21_600,
        "8h"  => 28_800,
        "12h" => 43_200,
        "1d"  => 86_400,
        _ => return None,
    };
    Some(secs)
}

/// Bars per year for Sharpe annualisation.
pub fn bars_per_year(interval: &str) -> f64 {
    match interval_seconds(interval) {
        Some(s) => 365.0 * 86_400.0 / s as f64,
        None    => 525_600.0,
    }
}

/// Split a comma-separated symbol list: trimmed, upper-cased, empties dropped.
pub fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr + Copy,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Config key {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn string_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().expect("defaults must be consistent");
    }

    #[test]
    fn symbols_are_normalised() {
        assert_eq!(parse_symbols(" btcusdt, ,ETHusdt,"), vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[test]
    fn strategy_and_margin_parse() {
        assert_eq!("FIB".parse::<StrategyKind>().unwrap(), StrategyKind::Fibonacci);
        assert_eq!("cross".parse::<MarginType>().unwrap(), MarginType::Crossed);
        assert!("martingale".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn inverted_stochastic_thresholds_rejected() {
        let cfg = AppConfig { oversold: 80.0, overbought: 20.0, ..AppConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn trailing_below_breakeven_rejected() {
        let cfg = AppConfig { trailing_trigger_r: 0.5, ..AppConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn interval_table() {
        assert_eq!(interval_seconds("15m"), Some(900));
        assert_eq!(interval_seconds("7m"), None);
        assert!((bars_per_year("1h") - 8_760.0).abs() < 1e-9);
    }
}
