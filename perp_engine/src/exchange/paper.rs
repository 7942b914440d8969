/// paper.rs — In-memory futures venue
///
/// Simulates a one-way USDT-M account closely enough to run the bot end to
/// end without touching real funds:
///
///   • MARKET orders fill at the current mark price, taker fee charged
///   • positions net per symbol; reducing realises PnL into the wallet
///   • STOP_MARKET / TAKE_PROFIT_MARKET / LIMIT orders rest until
///     `set_mark_price` crosses them; triggers that would fire immediately
///     are rejected (-2021) the way Binance does
///   • leverage is validated against a per-symbol maximum (-4028)
///   • `fail_next` injects one API error into the next call of a kind
///
/// With `with_market_data` the klines, marks, funding and filters come from
/// a real exchange (public endpoints only) while orders stay simulated.
use ahash::AHashMap;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use super::filters::{to_f64, SymbolFilters};
use super::{
    AccountBalance, Direction, FundingRate, FuturesExchange, Kline, OpenOrder, OrderAck,
    OrderKind, OrderRequest, PositionInfo, Side,
};
use crate::config::MarginType;
use crate::error::{ExchangeError, ExchangeResult};

const DEFAULT_LEVERAGE: u32 = 20;
const DEFAULT_MAX_LEVERAGE: u32 = 125;

/// Which call an injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    Market,
    StopMarket,
    TakeProfit,
    Leverage,
    MarginType,
    Cancel,
}

/// One simulated execution.
#[derive(Debug, Clone, PartialEq)]
pub struct PaperFill {
    pub symbol:       String,
    pub side:         Side,
    pub quantity:     f64,
    pub price:        f64,
    pub realized_pnl: f64,
    pub fee:          f64,
    pub client_id:    String,
}

#[derive(Debug, Clone)]
struct PaperPosition {
    amount:      f64,
    entry_price: f64,
}

#[derive(Debug, Clone)]
struct RestingOrder {
    order_id: i64,
    request:  OrderRequest,
}

#[derive(Default)]
struct Book {
    wallet:        f64,
    marks:         AHashMap<String, f64>,
    klines:        AHashMap<(String, String), Vec<Kline>>,
    funding:       AHashMap<String, f64>,
    filters:       AHashMap<String, SymbolFilters>,
    positions:     AHashMap<String, PaperPosition>,
    leverage:      AHashMap<String, u32>,
    max_leverage:  AHashMap<String, u32>,
    margin_types:  AHashMap<String, MarginType>,
    orders:        Vec<RestingOrder>,
    next_id:       i64,
    failures:      Vec<(FailOn, i64)>,
    fills:         Vec<PaperFill>,
    placed:        Vec<OrderRequest>,
    time_syncs:    u32,
}

pub struct PaperExchange {
    book:        Mutex<Book>,
    taker_fee:   f64,
    market_data: Option<Arc<dyn FuturesExchange>>,
}

impl PaperExchange {
    pub fn new(initial_balance: f64, taker_fee: f64) -> Self {
        Self {
            book: Mutex::new(Book { wallet: initial_balance, next_id: 1, ..Book::default() }),
            taker_fee,
            market_data: None,
        }
    }

    /// Simulated orders over real market data.
    pub fn with_market_data(source: Arc<dyn FuturesExchange>, initial_balance: f64, taker_fee: f64) -> Self {
        Self { market_data: Some(source), ..Self::new(initial_balance, taker_fee) }
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Scenario setup ────────────────────────────────────────────────────

    pub fn set_klines(&self, symbol: &str, interval: &str, klines: Vec<Kline>) {
        if let Some(last) = klines.last() {
            self.book().marks.entry(symbol.to_owned()).or_insert(last.close);
        }
        self.book().klines.insert((symbol.to_owned(), interval.to_owned()), klines);
    }

    pub fn set_funding_rate(&self, symbol: &str, rate: f64) {
        self.book().funding.insert(symbol.to_owned(), rate);
    }

    pub fn set_filters(&self, symbol: &str, filters: SymbolFilters) {
        self.book().filters.insert(symbol.to_owned(), filters);
    }

    pub fn set_max_leverage(&self, symbol: &str, max: u32) {
        self.book().max_leverage.insert(symbol.to_owned(), max);
    }

    /// Make the next call of `kind` fail with Binance error `code`.
    pub fn fail_next(&self, kind: FailOn, code: i64) {
        self.book().failures.push((kind, code));
    }

    /// Move the mark price and fire any resting orders it crosses.
    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        let mut book = self.book();
        book.marks.insert(symbol.to_owned(), price);
        self.trigger_resting(&mut book, symbol, price);
    }

    // ── Inspection ────────────────────────────────────────────────────────

    pub fn fills(&self) -> Vec<PaperFill> {
        self.book().fills.clone()
    }

    /// Every order request accepted or rejected, in call order.
    pub fn placed(&self) -> Vec<OrderRequest> {
        self.book().placed.clone()
    }

    pub fn wallet(&self) -> f64 {
        self.book().wallet
    }

    /// How often the clock was resynced.
    pub fn time_syncs(&self) -> u32 {
        self.book().time_syncs
    }

    pub fn leverage_of(&self, symbol: &str) -> u32 {
        self.book().leverage.get(symbol).copied().unwrap_or(DEFAULT_LEVERAGE)
    }

    pub fn margin_type_of(&self, symbol: &str) -> Option<MarginType> {
        self.book().margin_types.get(symbol).copied()
    }

    // ── Simulation internals ──────────────────────────────────────────────

    fn take_failure(book: &mut Book, kind: FailOn) -> Option<ExchangeError> {
        let idx = book.failures.iter().position(|(k, _)| *k == kind)?;
        let (_, code) = book.failures.remove(idx);
        let body = format!(r#"{{"code":{},"msg":"injected paper failure"}}"#, code);
        Some(ExchangeError::from_api(400, &body))
    }

    fn margin_used(book: &Book) -> f64 {
        book.positions
            .iter()
            .map(|(sym, p)| {
                let lev = book.leverage.get(sym).copied().unwrap_or(DEFAULT_LEVERAGE);
                p.amount.abs() * p.entry_price / lev as f64
            })
            .sum()
    }

    /// Apply a fill to the position book; returns realised PnL.
    fn apply_fill(&self, book: &mut Book, symbol: &str, side: Side, qty: f64, price: f64, client_id: &str) -> f64 {
        let signed = qty * side.sign();
        let pos = book
            .positions
            .remove(symbol)
            .unwrap_or(PaperPosition { amount: 0.0, entry_price: 0.0 });

        let mut realized = 0.0;
        let new_amount = pos.amount + signed;
        let new_pos = if pos.amount == 0.0 || pos.amount.signum() == signed.signum() {
            // open or add: weighted entry
            let total = pos.amount.abs() + qty;
            let entry = (pos.amount.abs() * pos.entry_price + qty * price) / total;
            Some(PaperPosition { amount: new_amount, entry_price: entry })
        } else {
            let closed = qty.min(pos.amount.abs());
            realized = (price - pos.entry_price) * closed * pos.amount.signum();
            if new_amount.abs() < 1e-12 {
                None
            } else if new_amount.signum() == pos.amount.signum() {
                Some(PaperPosition { amount: new_amount, entry_price: pos.entry_price })
            } else {
                Some(PaperPosition { amount: new_amount, entry_price: price })
            }
        };
        if let Some(p) = new_pos {
            book.positions.insert(symbol.to_owned(), p);
        }

        let fee = qty * price * self.taker_fee;
        book.wallet += realized - fee;
        book.fills.push(PaperFill {
            symbol:       symbol.to_owned(),
            side,
            quantity:     qty,
            price,
            realized_pnl: realized,
            fee,
            client_id:    client_id.to_owned(),
        });
        realized
    }

    fn trigger_resting(&self, book: &mut Book, symbol: &str, mark: f64) {
        let (fire, keep): (Vec<RestingOrder>, Vec<RestingOrder>) = std::mem::take(&mut book.orders)
            .into_iter()
            .partition(|o| o.request.symbol == symbol && crosses(&o.request, mark));
        book.orders = keep;

        for order in fire {
            let req = &order.request;
            let position_qty = book.positions.get(symbol).map(|p| p.amount).unwrap_or(0.0);
            let reduces = position_qty * req.side.sign() < 0.0;
            let qty = if req.close_position {
                // only closes a position on the opposite side of the order
                if reduces { position_qty.abs() } else { 0.0 }
            } else if req.reduce_only {
                if reduces { req.quantity.map(to_f64).unwrap_or(0.0).min(position_qty.abs()) } else { 0.0 }
            } else {
                req.quantity.map(to_f64).unwrap_or(0.0)
            };
            if qty <= 0.0 {
                continue;
            }
            let pnl = self.apply_fill(book, symbol, req.side, qty, mark, &req.client_id);
            info!(
                "📄 Paper {} triggered on {} @ {:.4} qty={} pnl={:+.4}",
                req.kind.wire_type(), symbol, mark, qty, pnl
            );
        }
    }

    async fn refresh_marks(&self, symbols: &[String]) {
        let Some(source) = &self.market_data else { return };
        for sym in symbols {
            match source.mark_price(sym).await {
                Ok(px) => self.set_mark_price(sym, px),
                Err(e) => warn!("paper: mark refresh for {} failed: {}", sym, e),
            }
        }
    }
}

/// Does a resting order trigger at `mark`?
fn crosses(req: &OrderRequest, mark: f64) -> bool {
    match (&req.kind, req.side) {
        (OrderKind::StopMarket { stop_price }, Side::Sell)       => mark <= to_f64(*stop_price),
        (OrderKind::StopMarket { stop_price }, Side::Buy)        => mark >= to_f64(*stop_price),
        (OrderKind::TakeProfitMarket { stop_price }, Side::Sell) => mark >= to_f64(*stop_price),
        (OrderKind::TakeProfitMarket { stop_price }, Side::Buy)  => mark <= to_f64(*stop_price),
        (OrderKind::Limit { price }, Side::Sell)                 => mark >= to_f64(*price),
        (OrderKind::Limit { price }, Side::Buy)                  => mark <= to_f64(*price),
        (OrderKind::Market, _)                                   => true,
    }
}

#[async_trait]
impl FuturesExchange for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> ExchangeResult<Vec<Kline>> {
        if let Some(source) = &self.market_data {
            let klines = source.klines(symbol, interval, limit).await?;
            if let Some(last) = klines.last() {
                self.book().marks.entry(symbol.to_owned()).or_insert(last.close);
            }
            return Ok(klines);
        }
        let book = self.book();
        let all = book
            .klines
            .get(&(symbol.to_owned(), interval.to_owned()))
            .cloned()
            .unwrap_or_default();
        let start = all.len().saturating_sub(limit as usize);
        Ok(all[start..].to_vec())
    }

    async fn positions(&self) -> ExchangeResult<Vec<PositionInfo>> {
        let open: Vec<String> = self.book().positions.keys().cloned().collect();
        self.refresh_marks(&open).await;

        let book = self.book();
        let mut out: Vec<PositionInfo> = book
            .positions
            .iter()
            .map(|(sym, p)| {
                let mark = book.marks.get(sym).copied().unwrap_or(p.entry_price);
                PositionInfo {
                    symbol:         sym.clone(),
                    amount:         p.amount,
                    entry_price:    p.entry_price,
                    mark_price:     mark,
                    unrealized_pnl: (mark - p.entry_price) * p.amount,
                    leverage:       book.leverage.get(sym).copied().unwrap_or(DEFAULT_LEVERAGE),
                }
            })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(out)
    }

    async fn balance(&self) -> ExchangeResult<AccountBalance> {
        let book = self.book();
        let used = Self::margin_used(&book);
        Ok(AccountBalance {
            asset:     "USDT".into(),
            balance:   book.wallet,
            available: (book.wallet - used).max(0.0),
        })
    }

    async fn mark_price(&self, symbol: &str) -> ExchangeResult<f64> {
        if let Some(source) = &self.market_data {
            let px = source.mark_price(symbol).await?;
            self.set_mark_price(symbol, px);
            return Ok(px);
        }
        self.book()
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_owned()))
    }

    async fn funding_rate(&self, symbol: &str) -> ExchangeResult<FundingRate> {
        if let Some(source) = &self.market_data {
            return source.funding_rate(symbol).await;
        }
        let mark = self.mark_price(symbol).await?;
        let rate = self.book().funding.get(symbol).copied().unwrap_or(0.0);
        Ok(FundingRate { symbol: symbol.to_owned(), mark_price: mark, rate, next_funding_time: 0 })
    }

    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters> {
        if let Some(source) = &self.market_data {
            return source.symbol_filters(symbol).await;
        }
        Ok(self.book().filters.get(symbol).cloned().unwrap_or_default())
    }

    async fn perpetual_symbols(&self) -> ExchangeResult<Vec<String>> {
        if let Some(source) = &self.market_data {
            return source.perpetual_symbols().await;
        }
        let mut syms: Vec<String> = self.book().marks.keys().cloned().collect();
        syms.sort();
        Ok(syms)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let mut book = self.book();
        if let Some(e) = Self::take_failure(&mut book, FailOn::Leverage) {
            return Err(e);
        }
        let max = book.max_leverage.get(symbol).copied().unwrap_or(DEFAULT_MAX_LEVERAGE);
        if leverage == 0 || leverage > max {
            return Err(ExchangeError::InvalidLeverage {
                code: -4028,
                msg:  format!("Leverage {} is not valid", leverage),
            });
        }
        book.leverage.insert(symbol.to_owned(), leverage);
        Ok(())
    }

    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> ExchangeResult<()> {
        let mut book = self.book();
        if let Some(e) = Self::take_failure(&mut book, FailOn::MarginType) {
            return Err(e);
        }
        if book.margin_types.get(symbol) == Some(&margin_type) {
            return Err(ExchangeError::NoChangeNeeded {
                code: -4046,
                msg:  "No need to change margin type.".into(),
            });
        }
        book.margin_types.insert(symbol.to_owned(), margin_type);
        Ok(())
    }

    async fn place_order(&self, req: &OrderRequest) -> ExchangeResult<OrderAck> {
        // fills and trigger checks use the live mark, not the one seen with the klines
        if let Some(source) = &self.market_data {
            let px = source.mark_price(&req.symbol).await?;
            self.set_mark_price(&req.symbol, px);
        }
        let mut book = self.book();
        book.placed.push(req.clone());

        let fail_kind = match req.kind {
            OrderKind::Market | OrderKind::Limit { .. } => FailOn::Market,
            OrderKind::StopMarket { .. }                => FailOn::StopMarket,
            OrderKind::TakeProfitMarket { .. }          => FailOn::TakeProfit,
        };
        if let Some(e) = Self::take_failure(&mut book, fail_kind) {
            return Err(e);
        }

        let mark = book
            .marks
            .get(&req.symbol)
            .copied()
            .ok_or_else(|| ExchangeError::UnknownSymbol(req.symbol.clone()))?;
        let order_id = book.next_id;
        book.next_id += 1;

        if matches!(req.kind, OrderKind::Market) {
            let mut qty = req.quantity.map(to_f64).unwrap_or(0.0);
            let position = book.positions.get(&req.symbol).map(|p| p.amount).unwrap_or(0.0);
            let reduces = position * req.side.sign() < 0.0;

            if req.reduce_only {
                if !reduces {
                    return Err(ExchangeError::Api {
                        status: 400,
                        code:   -2022,
                        msg:    "ReduceOnly Order is rejected.".into(),
                    });
                }
                qty = qty.min(position.abs());
            } else if !reduces {
                let lev = book.leverage.get(&req.symbol).copied().unwrap_or(DEFAULT_LEVERAGE);
                let needed = qty * mark / lev as f64 + qty * mark * self.taker_fee;
                let available = book.wallet - Self::margin_used(&book);
                if needed > available {
                    return Err(ExchangeError::InsufficientBalance {
                        code: -2019,
                        msg:  "Margin is insufficient.".into(),
                    });
                }
            }
            if qty <= 0.0 {
                return Err(ExchangeError::Api { status: 400, code: -4003, msg: "Quantity less than or equal to zero.".into() });
            }

            self.apply_fill(&mut book, &req.symbol, req.side, qty, mark, &req.client_id);
            return Ok(OrderAck {
                order_id,
                client_id:    req.client_id.clone(),
                status:       "FILLED".into(),
                avg_price:    mark,
                executed_qty: qty,
            });
        }

        if req.kind.is_protective() && crosses(req, mark) {
            return Err(ExchangeError::Api {
                status: 400,
                code:   -2021,
                msg:    "Order would immediately trigger.".into(),
            });
        }
        if let OrderKind::Limit { .. } = req.kind {
            if crosses(req, mark) {
                let qty = req.quantity.map(to_f64).unwrap_or(0.0);
                self.apply_fill(&mut book, &req.symbol, req.side, qty, mark, &req.client_id);
                return Ok(OrderAck {
                    order_id,
                    client_id:    req.client_id.clone(),
                    status:       "FILLED".into(),
                    avg_price:    mark,
                    executed_qty: qty,
                });
            }
        }

        book.orders.push(RestingOrder { order_id, request: req.clone() });
        Ok(OrderAck {
            order_id,
            client_id:    req.client_id.clone(),
            status:       "NEW".into(),
            avg_price:    0.0,
            executed_qty: 0.0,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> ExchangeResult<()> {
        let mut book = self.book();
        if let Some(e) = Self::take_failure(&mut book, FailOn::Cancel) {
            return Err(e);
        }
        let before = book.orders.len();
        book.orders.retain(|o| !(o.order_id == order_id && o.request.symbol == symbol));
        if book.orders.len() == before {
            return Err(ExchangeError::Api { status: 400, code: -2011, msg: "Unknown order sent.".into() });
        }
        Ok(())
    }

    async fn open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OpenOrder>> {
        let book = self.book();
        Ok(book
            .orders
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.request.symbol == s))
            .map(|o| {
                let (price, stop_price) = match &o.request.kind {
                    OrderKind::Limit { price } => (to_f64(*price), 0.0),
                    OrderKind::StopMarket { stop_price } | OrderKind::TakeProfitMarket { stop_price } => {
                        (0.0, to_f64(*stop_price))
                    }
                    OrderKind::Market => (0.0, 0.0),
                };
                OpenOrder {
                    order_id:       o.order_id,
                    symbol:         o.request.symbol.clone(),
                    side:           o.request.side.as_str().to_owned(),
                    order_type:     o.request.kind.wire_type().to_owned(),
                    price,
                    stop_price,
                    orig_qty:       o.request.quantity.map(to_f64).unwrap_or(0.0),
                    status:         "NEW".into(),
                    reduce_only:    o.request.reduce_only,
                    close_position: o.request.close_position,
                }
            })
            .collect())
    }

    async fn cancel_all(&self, symbol: &str) -> ExchangeResult<()> {
        self.book().orders.retain(|o| o.request.symbol != symbol);
        Ok(())
    }

    async fn sync_time(&self) -> ExchangeResult<i64> {
        self.book().time_syncs += 1;
        match &self.market_data {
            Some(source) => source.sync_time().await,
            None => Ok(0),
        }
    }
}

impl PaperExchange {
    /// Direction of the simulated position, if any.
    pub fn position_direction(&self, symbol: &str) -> Option<Direction> {
        self.book().positions.get(symbol).and_then(|p| Direction::from_amount(p.amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn exchange() -> PaperExchange {
        let ex = PaperExchange::new(1_000.0, 0.0);
        ex.set_mark_price("BTCUSDT", 100.0);
        ex
    }

    #[tokio::test]
    async fn market_round_trip_realises_pnl() {
        let ex = exchange();
        ex.place_order(&OrderRequest::market("BTCUSDT", Side::Buy, d("2"))).await.unwrap();
        ex.set_mark_price("BTCUSDT", 110.0);

        let pos = ex.positions().await.unwrap();
        assert_eq!(pos.len(), 1);
        assert!((pos[0].unrealized_pnl - 20.0).abs() < 1e-9);

        ex.place_order(&OrderRequest::reduce_only_market("BTCUSDT", Side::Sell, d("5"))).await.unwrap();
        assert!(ex.positions().await.unwrap().is_empty());
        assert!((ex.wallet() - 1_020.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stop_triggers_when_mark_crosses() {
        let ex = exchange();
        ex.place_order(&OrderRequest::market("BTCUSDT", Side::Buy, d("1"))).await.unwrap();
        ex.place_order(&OrderRequest::stop_loss("BTCUSDT", Side::Sell, d("95"))).await.unwrap();
        assert_eq!(ex.open_orders(Some("BTCUSDT")).await.unwrap().len(), 1);

        ex.set_mark_price("BTCUSDT", 96.0);
        assert_eq!(ex.position_direction("BTCUSDT"), Some(Direction::Long));

        ex.set_mark_price("BTCUSDT", 94.0);
        assert_eq!(ex.position_direction("BTCUSDT"), None);
        assert!(ex.open_orders(None).await.unwrap().is_empty());
        assert!((ex.wallet() - 994.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stop_that_would_trigger_is_rejected() {
        let ex = exchange();
        ex.place_order(&OrderRequest::market("BTCUSDT", Side::Buy, d("1"))).await.unwrap();
        let err = ex
            .place_order(&OrderRequest::stop_loss("BTCUSDT", Side::Sell, d("101")))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Api { code: -2021, .. }));
    }

    #[tokio::test]
    async fn leverage_limit_and_margin_noop() {
        let ex = exchange();
        ex.set_max_leverage("BTCUSDT", 10);
        assert!(matches!(ex.set_leverage("BTCUSDT", 20).await, Err(ExchangeError::InvalidLeverage { .. })));
        ex.set_leverage("BTCUSDT", 10).await.unwrap();
        assert_eq!(ex.leverage_of("BTCUSDT"), 10);

        ex.set_margin_type("BTCUSDT", MarginType::Isolated).await.unwrap();
        assert!(matches!(
            ex.set_margin_type("BTCUSDT", MarginType::Isolated).await,
            Err(ExchangeError::NoChangeNeeded { code: -4046, .. })
        ));
    }

    #[tokio::test]
    async fn insufficient_margin_rejected() {
        let ex = exchange();
        // 1 000 USDT · 20x = 20 000 notional max → 300 BTC at 100 is too much
        let err = ex.place_order(&OrderRequest::market("BTCUSDT", Side::Sell, d("300"))).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn market_data_mode_fills_at_the_live_mark() {
        let source = Arc::new(PaperExchange::new(0.0, 0.0));
        source.set_mark_price("BTCUSDT", 100.0);
        source.set_klines("BTCUSDT", "15m", vec![Kline {
            open_time: 0, open: 100.0, high: 100.0, low: 100.0, close: 100.0, volume: 1.0, close_time: 899_999,
        }]);
        let ex = PaperExchange::with_market_data(source.clone(), 1_000.0, 0.0);

        // the bot reads klines and funding long before it decides to enter
        ex.klines("BTCUSDT", "15m", 10).await.unwrap();
        ex.funding_rate("BTCUSDT").await.unwrap();
        source.set_mark_price("BTCUSDT", 150.0);

        let ack = ex.place_order(&OrderRequest::market("BTCUSDT", Side::Buy, d("1"))).await.unwrap();
        assert_eq!(ack.avg_price, 150.0);
        let pos = ex.positions().await.unwrap();
        assert_eq!(pos[0].entry_price, 150.0);
        assert!(pos[0].unrealized_pnl.abs() < 1e-9);
    }

    #[tokio::test]
    async fn injected_failure_hits_once() {
        let ex = exchange();
        ex.fail_next(FailOn::StopMarket, -1001);
        ex.place_order(&OrderRequest::market("BTCUSDT", Side::Buy, d("1"))).await.unwrap();
        assert!(ex.place_order(&OrderRequest::stop_loss("BTCUSDT", Side::Sell, d("90"))).await.is_err());
        assert!(ex.place_order(&OrderRequest::stop_loss("BTCUSDT", Side::Sell, d("90"))).await.is_ok());
    }
}
