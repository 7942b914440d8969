/// exchange/mod.rs — Exchange abstraction
///
/// Everything the bot needs from a USDT-M futures venue, behind one async
/// trait.  `BinanceFutures` talks to the real REST API; `PaperExchange`
/// simulates fills in memory for paper trading and tests.  Strategy,
/// execution and the dashboard only ever see `Arc<dyn FuturesExchange>`.
pub mod binance;
pub mod filters;
pub mod paper;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::MarginType;
use crate::error::ExchangeResult;

pub use binance::BinanceFutures;
pub use filters::SymbolFilters;
pub use paper::PaperExchange;

// ── Sides & directions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy  => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy  => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            Self::Buy  => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn entry_side(self) -> Side {
        match self {
            Self::Long  => Side::Buy,
            Self::Short => Side::Sell,
        }
    }

    pub fn exit_side(self) -> Side {
        self.entry_side().opposite()
    }

    /// +1 for long, −1 for short: `(price − entry) · sign` is favourable movement.
    pub fn sign(self) -> f64 {
        self.entry_side().sign()
    }

    /// Direction of a signed one-way position amount; `None` when flat.
    pub fn from_amount(amount: f64) -> Option<Self> {
        if amount > 0.0 {
            Some(Self::Long)
        } else if amount < 0.0 {
            Some(Self::Short)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long  => "LONG",
            Self::Short => "SHORT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Market data ───────────────────────────────────────────────────────────

/// One OHLCV bar.  Times are Unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time:  i64,
    pub open:       f64,
    pub high:       f64,
    pub low:        f64,
    pub close:      f64,
    pub volume:     f64,
    pub close_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FundingRate {
    pub symbol:            String,
    pub mark_price:        f64,
    /// Last funding rate as a fraction (0.0001 = 0.01%)
    pub rate:              f64,
    pub next_funding_time: i64,
}

// ── Account ───────────────────────────────────────────────────────────────

/// A non-flat one-way position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol:         String,
    /// Signed: positive long, negative short
    pub amount:         f64,
    pub entry_price:    f64,
    pub mark_price:     f64,
    pub unrealized_pnl: f64,
    pub leverage:       u32,
}

impl PositionInfo {
    pub fn direction(&self) -> Option<Direction> {
        Direction::from_amount(self.amount)
    }

    /// Initial margin behind the position: |amount| · entry / leverage.
    pub fn margin_used(&self) -> f64 {
        self.amount.abs() * self.entry_price / self.leverage.max(1) as f64
    }

    /// Unrealised PnL as a percentage of margin (0 when no margin).
    pub fn roi_pct(&self) -> f64 {
        let margin = self.margin_used();
        if margin <= 0.0 {
            0.0
        } else {
            self.unrealized_pnl / margin * 100.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountBalance {
    pub asset:     String,
    pub balance:   f64,
    pub available: f64,
}

// ── Orders ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum OrderKind {
    Market,
    Limit { price: Decimal },
    StopMarket { stop_price: Decimal },
    TakeProfitMarket { stop_price: Decimal },
}

impl OrderKind {
    pub fn wire_type(&self) -> &'static str {
        match self {
            Self::Market                  => "MARKET",
            Self::Limit { .. }            => "LIMIT",
            Self::StopMarket { .. }       => "STOP_MARKET",
            Self::TakeProfitMarket { .. } => "TAKE_PROFIT_MARKET",
        }
    }

    pub fn is_protective(&self) -> bool {
        matches!(self, Self::StopMarket { .. } | Self::TakeProfitMarket { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol:         String,
    pub side:           Side,
    pub kind:           OrderKind,
    /// Omitted for closePosition orders
    pub quantity:       Option<Decimal>,
    pub reduce_only:    bool,
    pub close_position: bool,
    pub client_id:      String,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol:         symbol.to_owned(),
            side,
            kind:           OrderKind::Market,
            quantity:       Some(quantity),
            reduce_only:    false,
            close_position: false,
            client_id:      new_client_id("en"),
        }
    }

    /// Market order that can only shrink the position.
    pub fn reduce_only_market(symbol: &str, side: Side, quantity: Decimal) -> Self {
        Self {
            reduce_only: true,
            client_id:   new_client_id("rx"),
            ..Self::market(symbol, side, quantity)
        }
    }

    /// Stop-loss that closes whatever position is open when triggered.
    pub fn stop_loss(symbol: &str, exit_side: Side, stop_price: Decimal) -> Self {
        Self {
            symbol:         symbol.to_owned(),
            side:           exit_side,
            kind:           OrderKind::StopMarket { stop_price },
            quantity:       None,
            reduce_only:    false,
            close_position: true,
            client_id:      new_client_id("sl"),
        }
    }

    /// Reduce-only stop for a fixed quantity.  Binance allows one
    /// closePosition stop per side, so a replacement stop rests as this
    /// until the old one is cancelled.
    pub fn reduce_only_stop(symbol: &str, exit_side: Side, stop_price: Decimal, quantity: Decimal) -> Self {
        Self {
            quantity:       Some(quantity),
            reduce_only:    true,
            close_position: false,
            client_id:      new_client_id("ts"),
            ..Self::stop_loss(symbol, exit_side, stop_price)
        }
    }

    pub fn take_profit(symbol: &str, exit_side: Side, stop_price: Decimal) -> Self {
        Self {
            kind:      OrderKind::TakeProfitMarket { stop_price },
            client_id: new_client_id("tp"),
            ..Self::stop_loss(symbol, exit_side, stop_price)
        }
    }
}

/// Client order id: `pb-<tag>-<uuid simple>` trimmed to Binance's 36 chars.
pub fn new_client_id(tag: &str) -> String {
    let mut id = format!("pb-{}-{}", tag, uuid::Uuid::new_v4().simple());
    id.truncate(36);
    id
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderAck {
    pub order_id:     i64,
    pub client_id:    String,
    pub status:       String,
    /// Average fill price; 0 for resting orders
    pub avg_price:    f64,
    pub executed_qty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenOrder {
    pub order_id:       i64,
    pub symbol:         String,
    pub side:           String,
    pub order_type:     String,
    pub price:          f64,
    pub stop_price:     f64,
    pub orig_qty:       f64,
    pub status:         String,
    pub reduce_only:    bool,
    pub close_position: bool,
}

// ── The venue trait ───────────────────────────────────────────────────────

#[async_trait]
pub trait FuturesExchange: Send + Sync {
    /// Short label for logs ("binance-testnet", "paper", ...)
    fn name(&self) -> &str;

    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> ExchangeResult<Vec<Kline>>;

    /// Open (non-flat) positions across all symbols.
    async fn positions(&self) -> ExchangeResult<Vec<PositionInfo>>;

    /// USDT wallet balance and available margin.
    async fn balance(&self) -> ExchangeResult<AccountBalance>;

    async fn mark_price(&self, symbol: &str) -> ExchangeResult<f64>;

    async fn funding_rate(&self, symbol: &str) -> ExchangeResult<FundingRate>;

    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters>;

    /// All trading USDT-margined perpetual contracts.
    async fn perpetual_symbols(&self) -> ExchangeResult<Vec<String>>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    /// May return `NoChangeNeeded` when the margin type is already set.
    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> ExchangeResult<()>;

    async fn place_order(&self, req: &OrderRequest) -> ExchangeResult<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> ExchangeResult<()>;

    /// Open orders for one symbol, or for every symbol when `None`.
    async fn open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OpenOrder>>;

    async fn cancel_all(&self, symbol: &str) -> ExchangeResult<()>;

    /// Re-measure the server clock offset used to sign requests.  Venues
    /// without signed requests have nothing to do.
    async fn sync_time(&self) -> ExchangeResult<i64> {
        Ok(0)
    }
}
