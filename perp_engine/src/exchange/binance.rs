/// binance.rs — Binance USDT-M Futures REST client
///
/// Implements `FuturesExchange` against testnet or mainnet (controlled via
/// BINANCE_USE_TESTNET / BINANCE_FUTURES_REST_URL).
///
/// SIGNED REQUEST FLOW:
///   1. Build query string with the endpoint params
///   2. Append recvWindow and a server-synced timestamp
///   3. Sign the query string with HMAC-SHA256 using the API secret
///   4. GET/DELETE: params + signature in the URL
///      POST:       params + signature as a form body
///      Both carry the X-MBX-APIKEY header
///
/// ENDPOINTS:
///   /fapi/v1/klines         market data (public)
///   /fapi/v1/premiumIndex   mark price + funding (public)
///   /fapi/v1/exchangeInfo   tick/step/notional filters (public, cached)
///   /fapi/v2/positionRisk   open positions
///   /fapi/v2/balance        USDT wallet
///   /fapi/v1/leverage       per-symbol leverage
///   /fapi/v1/marginType     ISOLATED / CROSSED
///   /fapi/v1/order          place (POST) / cancel (DELETE)
///   /fapi/v1/openOrders     resting orders
///   /fapi/v1/allOpenOrders  cancel all for a symbol
///
/// Orders are one-way mode (positionSide = BOTH, the default).
use ahash::AHashMap;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::filters::{parse_decimal, SymbolFilters};
use super::{
    AccountBalance, FundingRate, FuturesExchange, Kline, OpenOrder, OrderAck, OrderKind,
    OrderRequest, PositionInfo,
};
use crate::config::{AppConfig, MarginType};
use crate::error::{ExchangeError, ExchangeResult};
use crate::time_sync::TimeSync;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5_000;
/// Largest page the klines endpoint returns.
pub const MAX_KLINES: u32 = 1_500;

// ── Response types ────────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct RawPosition {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "entryPrice")]
    entry_price: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
    #[serde(rename = "unRealizedProfit")]
    unrealized_profit: String,
    #[serde(default)]
    leverage: String,
}

#[derive(Deserialize, Debug)]
struct RawBalance {
    asset: String,
    balance: String,
    #[serde(rename = "availableBalance")]
    available_balance: String,
}

#[derive(Deserialize, Debug)]
struct RawPremiumIndex {
    symbol: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,
    #[serde(rename = "nextFundingTime")]
    next_funding_time: i64,
}

#[derive(Deserialize, Debug)]
struct RawExchangeInfo {
    symbols: Vec<RawSymbol>,
}

#[derive(Deserialize, Debug)]
struct RawSymbol {
    symbol: String,
    status: String,
    #[serde(rename = "contractType", default)]
    contract_type: String,
    #[serde(rename = "quoteAsset", default)]
    quote_asset: String,
    filters: Vec<RawFilter>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "filterType")]
enum RawFilter {
    #[serde(rename = "PRICE_FILTER")]
    Price {
        #[serde(rename = "tickSize")]
        tick_size: String,
    },
    #[serde(rename = "LOT_SIZE")]
    LotSize {
        #[serde(rename = "stepSize")]
        step_size: String,
        #[serde(rename = "minQty")]
        min_qty: String,
        #[serde(rename = "maxQty")]
        max_qty: String,
    },
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional { notional: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct RawOrder {
    #[serde(rename = "orderId")]
    order_id: i64,
    #[serde(rename = "clientOrderId", default)]
    client_order_id: String,
    status: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
    #[serde(rename = "executedQty", default)]
    executed_qty: String,
}

#[derive(Deserialize, Debug)]
struct RawOpenOrder {
    #[serde(rename = "orderId")]
    order_id: i64,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    price: String,
    #[serde(rename = "stopPrice", default)]
    stop_price: String,
    #[serde(rename = "origQty")]
    orig_qty: String,
    status: String,
    #[serde(rename = "reduceOnly", default)]
    reduce_only: bool,
    #[serde(rename = "closePosition", default)]
    close_position: bool,
}

fn num(s: &str) -> f64 {
    s.trim().parse().unwrap_or(0.0)
}

// ── Client ────────────────────────────────────────────────────────────────

pub struct BinanceFutures {
    client:     Client,
    api_key:    String,
    api_secret: String,
    base_url:   String,
    label:      String,
    time_sync:  TimeSync,
    filters:    RwLock<AHashMap<String, SymbolFilters>>,
}

impl BinanceFutures {
    pub fn new(api_key: &str, api_secret: &str, base_url: &str, testnet: bool) -> ExchangeResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_key:    api_key.to_owned(),
            api_secret: api_secret.to_owned(),
            base_url:   base_url.trim_end_matches('/').to_owned(),
            label:      if testnet { "binance-testnet".into() } else { "binance".into() },
            time_sync:  TimeSync::new(),
            filters:    RwLock::new(AHashMap::new()),
        })
    }

    pub fn from_config(cfg: &AppConfig) -> ExchangeResult<Self> {
        Self::new(&cfg.api_key, &cfg.api_secret, &cfg.rest_url, cfg.use_testnet)
    }

    /// Sign a query string with HMAC-SHA256.
    fn sign(&self, query: &str) -> String {
        sign_query(&self.api_secret, query)
    }

    async fn public_get<T: DeserializeOwned>(&self, path: &str, query: &str) -> ExchangeResult<T> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ExchangeError::from_api(status.as_u16(), &body));
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Send a signed request; returns the raw body of a 2xx response.
    async fn signed(&self, method: Method, path: &str, params: &[(&str, String)]) -> ExchangeResult<String> {
        let mut query = encode_params(params);
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "recvWindow={}&timestamp={}",
            RECV_WINDOW_MS,
            self.time_sync.timestamp_ms()
        ));
        let signature = self.sign(&query);
        let full = format!("{}&signature={}", query, signature);
        let url = format!("{}{}", self.base_url, path);

        let builder = if method == Method::POST {
            self.client
                .post(&url)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(full)
        } else {
            self.client.request(method.clone(), format!("{}?{}", url, full))
        };

        let resp = builder.header("X-MBX-APIKEY", &self.api_key).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            let err = ExchangeError::from_api(status.as_u16(), &body);
            debug!("{} {} → {}", method, path, err);
            return Err(err);
        }
        Ok(body)
    }

    async fn signed_json<T: DeserializeOwned>(&self, method: Method, path: &str, params: &[(&str, String)]) -> ExchangeResult<T> {
        let body = self.signed(method, path, params).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Up to `limit` klines ending at `end_ms` (inclusive); used for
    /// paging back through history.
    pub async fn klines_before(
        &self,
        symbol:   &str,
        interval: &str,
        end_ms:   Option<i64>,
        limit:    u32,
    ) -> ExchangeResult<Vec<Kline>> {
        let mut query = format!("symbol={}&interval={}&limit={}", symbol, interval, limit.min(MAX_KLINES));
        if let Some(end) = end_ms {
            query.push_str(&format!("&endTime={end}"));
        }
        let rows: Vec<Vec<Value>> = self.public_get("/fapi/v1/klines", &query).await?;
        rows.iter().map(|r| parse_kline_row(r)).collect()
    }

    async fn load_exchange_info(&self) -> ExchangeResult<RawExchangeInfo> {
        self.public_get("/fapi/v1/exchangeInfo", "").await
    }
}

#[async_trait]
impl FuturesExchange for BinanceFutures {
    fn name(&self) -> &str {
        &self.label
    }

    /// Sync the signing clock with Binance server time.
    async fn sync_time(&self) -> ExchangeResult<i64> {
        self.time_sync.sync(&self.client, &self.base_url).await
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> ExchangeResult<Vec<Kline>> {
        self.klines_before(symbol, interval, None, limit).await
    }

    async fn positions(&self) -> ExchangeResult<Vec<PositionInfo>> {
        let raw: Vec<RawPosition> = self.signed_json(Method::GET, "/fapi/v2/positionRisk", &[]).await?;
        Ok(raw
            .into_iter()
            .map(|p| PositionInfo {
                amount:         num(&p.position_amt),
                entry_price:    num(&p.entry_price),
                mark_price:     num(&p.mark_price),
                unrealized_pnl: num(&p.unrealized_profit),
                leverage:       p.leverage.parse().unwrap_or(1),
                symbol:         p.symbol,
            })
            .filter(|p| p.amount != 0.0)
            .collect())
    }

    async fn balance(&self) -> ExchangeResult<AccountBalance> {
        let raw: Vec<RawBalance> = self.signed_json(Method::GET, "/fapi/v2/balance", &[]).await?;
        raw.into_iter()
            .find(|b| b.asset == "USDT")
            .map(|b| AccountBalance {
                balance:   num(&b.balance),
                available: num(&b.available_balance),
                asset:     b.asset,
            })
            .ok_or_else(|| ExchangeError::Decode("no USDT balance in /fapi/v2/balance".into()))
    }

    async fn mark_price(&self, symbol: &str) -> ExchangeResult<f64> {
        Ok(self.funding_rate(symbol).await?.mark_price)
    }

    async fn funding_rate(&self, symbol: &str) -> ExchangeResult<FundingRate> {
        let raw: RawPremiumIndex = self
            .public_get("/fapi/v1/premiumIndex", &format!("symbol={}", symbol))
            .await?;
        Ok(FundingRate {
            mark_price:        num(&raw.mark_price),
            rate:              num(&raw.last_funding_rate),
            next_funding_time: raw.next_funding_time,
            symbol:            raw.symbol,
        })
    }

    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters> {
        if let Some(f) = self.filters.read().await.get(symbol) {
            return Ok(f.clone());
        }

        let info = self.load_exchange_info().await?;
        let mut cache = self.filters.write().await;
        for s in &info.symbols {
            cache.insert(s.symbol.clone(), filters_from_raw(&s.filters));
        }
        info!("📐 Cached exchange filters for {} symbols", cache.len());
        cache
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_owned()))
    }

    async fn perpetual_symbols(&self) -> ExchangeResult<Vec<String>> {
        let info = self.load_exchange_info().await?;
        let mut out: Vec<String> = info
            .symbols
            .into_iter()
            .filter(|s| s.contract_type == "PERPETUAL" && s.status == "TRADING" && s.quote_asset == "USDT")
            .map(|s| s.symbol)
            .collect();
        out.sort();
        Ok(out)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let params = [("symbol", symbol.to_owned()), ("leverage", leverage.to_string())];
        self.signed(Method::POST, "/fapi/v1/leverage", &params).await?;
        info!("Set leverage {}x for {}", leverage, symbol);
        Ok(())
    }

    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> ExchangeResult<()> {
        let params = [("symbol", symbol.to_owned()), ("marginType", margin_type.as_str().to_owned())];
        self.signed(Method::POST, "/fapi/v1/marginType", &params).await?;
        info!("Set margin type {} for {}", margin_type.as_str(), symbol);
        Ok(())
    }

    async fn place_order(&self, req: &OrderRequest) -> ExchangeResult<OrderAck> {
        let params = order_params(req);
        info!(
            "Placing {} {} {} qty={} {}",
            req.kind.wire_type(),
            req.side,
            req.symbol,
            req.quantity.map(|q| q.to_string()).unwrap_or_else(|| "close".into()),
            match &req.kind {
                OrderKind::Limit { price } => format!("@ {}", price),
                OrderKind::StopMarket { stop_price } | OrderKind::TakeProfitMarket { stop_price } => {
                    format!("trigger {}", stop_price)
                }
                OrderKind::Market => "@ MARKET".into(),
            }
        );

        let raw: RawOrder = self.signed_json(Method::POST, "/fapi/v1/order", &params).await?;
        let ack = OrderAck {
            order_id:     raw.order_id,
            client_id:    raw.client_order_id,
            status:       raw.status,
            avg_price:    num(&raw.avg_price),
            executed_qty: num(&raw.executed_qty),
        };
        info!(
            "Order accepted: id={} status={} filled={} avgPx={}",
            ack.order_id, ack.status, ack.executed_qty, ack.avg_price
        );
        Ok(ack)
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> ExchangeResult<()> {
        let params = [("symbol", symbol.to_owned()), ("orderId", order_id.to_string())];
        self.signed(Method::DELETE, "/fapi/v1/order", &params).await?;
        info!("Cancelled order {} on {}", order_id, symbol);
        Ok(())
    }

    async fn open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OpenOrder>> {
        let params: Vec<(&str, String)> = symbol.map(|s| ("symbol", s.to_owned())).into_iter().collect();
        let raw: Vec<RawOpenOrder> = self.signed_json(Method::GET, "/fapi/v1/openOrders", &params).await?;
        Ok(raw
            .into_iter()
            .map(|o| OpenOrder {
                order_id:       o.order_id,
                price:          num(&o.price),
                stop_price:     num(&o.stop_price),
                orig_qty:       num(&o.orig_qty),
                symbol:         o.symbol,
                side:           o.side,
                order_type:     o.order_type,
                status:         o.status,
                reduce_only:    o.reduce_only,
                close_position: o.close_position,
            })
            .collect())
    }

    async fn cancel_all(&self, symbol: &str) -> ExchangeResult<()> {
        let params = [("symbol", symbol.to_owned())];
        match self.signed(Method::DELETE, "/fapi/v1/allOpenOrders", &params).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("cancel_all {} failed: {}", symbol, e);
                Err(e)
            }
        }
    }
}

// ── Pure helpers ──────────────────────────────────────────────────────────

pub(crate) fn sign_query(secret: &str, query: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn encode_params(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Form params for POST /fapi/v1/order.
fn order_params(req: &OrderRequest) -> Vec<(&'static str, String)> {
    let mut p = vec![
        ("symbol", req.symbol.clone()),
        ("side", req.side.as_str().to_owned()),
        ("type", req.kind.wire_type().to_owned()),
    ];
    match &req.kind {
        OrderKind::Market => {
            p.push(("newOrderRespType", "RESULT".into()));
        }
        OrderKind::Limit { price } => {
            p.push(("price", price.to_string()));
            p.push(("timeInForce", "GTC".into()));
        }
        OrderKind::StopMarket { stop_price } | OrderKind::TakeProfitMarket { stop_price } => {
            p.push(("stopPrice", stop_price.to_string()));
            p.push(("workingType", "MARK_PRICE".into()));
        }
    }
    if req.close_position {
        p.push(("closePosition", "true".into()));
    } else if let Some(q) = req.quantity {
        p.push(("quantity", q.normalize().to_string()));
        if req.reduce_only {
            p.push(("reduceOnly", "true".into()));
        }
    }
    p.push(("newClientOrderId", req.client_id.clone()));
    p
}

/// `[openTime, "open", "high", "low", "close", "volume", closeTime, ...]`
fn parse_kline_row(row: &[Value]) -> ExchangeResult<Kline> {
    if row.len() < 7 {
        return Err(ExchangeError::Decode(format!("kline row has {} fields", row.len())));
    }
    let int = |i: usize| -> ExchangeResult<i64> {
        row[i]
            .as_i64()
            .ok_or_else(|| ExchangeError::Decode(format!("kline field {} not an integer", i)))
    };
    let float = |i: usize| -> ExchangeResult<f64> {
        match &row[i] {
            Value::String(s) => s
                .parse()
                .map_err(|_| ExchangeError::Decode(format!("kline field {} = {:?}", i, s))),
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| ExchangeError::Decode(format!("kline field {} not numeric", i))),
            other => Err(ExchangeError::Decode(format!("kline field {} = {}", i, other))),
        }
    };
    Ok(Kline {
        open_time:  int(0)?,
        open:       float(1)?,
        high:       float(2)?,
        low:        float(3)?,
        close:      float(4)?,
        volume:     float(5)?,
        close_time: int(6)?,
    })
}

fn filters_from_raw(raw: &[RawFilter]) -> SymbolFilters {
    let mut f = SymbolFilters {
        tick_size:    Default::default(),
        step_size:    Default::default(),
        min_qty:      Default::default(),
        max_qty:      Default::default(),
        min_notional: Default::default(),
    };
    for filter in raw {
        match filter {
            RawFilter::Price { tick_size } => f.tick_size = parse_decimal(tick_size),
            RawFilter::LotSize { step_size, min_qty, max_qty } => {
                f.step_size = parse_decimal(step_size);
                f.min_qty   = parse_decimal(min_qty);
                f.max_qty   = parse_decimal(max_qty);
            }
            RawFilter::MinNotional { notional } => f.min_notional = parse_decimal(notional),
            RawFilter::Other => {}
        }
    }
    f
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Side;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn signature_matches_binance_docs_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn kline_row_parses_mixed_types() {
        let row = vec![
            json!(1_700_000_000_000i64), json!("100.5"), json!("101.0"), json!("99.5"),
            json!("100.0"), json!("1234.5"), json!(1_700_000_899_999i64), json!("0"),
        ];
        let k = parse_kline_row(&row).unwrap();
        assert_eq!(k.open, 100.5);
        assert_eq!(k.close_time, 1_700_000_899_999);
    }

    #[test]
    fn malformed_kline_row_is_an_error() {
        let row = vec![json!(1), json!("abc"), json!("1"), json!("1"), json!("1"), json!("1"), json!(2)];
        assert!(parse_kline_row(&row).is_err());
        assert!(parse_kline_row(&row[..3]).is_err());
    }

    #[test]
    fn stop_order_params_use_close_position() {
        let req = OrderRequest::stop_loss("BTCUSDT", Side::Sell, Decimal::from_str("49000.1").unwrap());
        let p = order_params(&req);
        assert!(p.contains(&("type", "STOP_MARKET".into())));
        assert!(p.contains(&("stopPrice", "49000.1".into())));
        assert!(p.contains(&("closePosition", "true".into())));
        assert!(!p.iter().any(|(k, _)| *k == "quantity" || *k == "reduceOnly"));
    }

    #[test]
    fn reduce_only_market_params() {
        let req = OrderRequest::reduce_only_market("ETHUSDT", Side::Buy, Decimal::from_str("0.250").unwrap());
        let p = order_params(&req);
        assert!(p.contains(&("quantity", "0.25".into())));
        assert!(p.contains(&("reduceOnly", "true".into())));
        assert!(p.contains(&("newOrderRespType", "RESULT".into())));
    }

    #[test]
    fn exchange_info_filters_parse() {
        let body = json!({
            "symbols": [{
                "symbol": "BTCUSDT", "status": "TRADING", "contractType": "PERPETUAL", "quoteAsset": "USDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.10", "minPrice": "556.80", "maxPrice": "4529764"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "1000"},
                    {"filterType": "MARKET_LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "120"},
                    {"filterType": "MIN_NOTIONAL", "notional": "100"}
                ]
            }]
        });
        let info: RawExchangeInfo = serde_json::from_value(body).unwrap();
        let f = filters_from_raw(&info.symbols[0].filters);
        assert_eq!(f.tick_size, Decimal::from_str("0.1").unwrap());
        assert_eq!(f.step_size, Decimal::from_str("0.001").unwrap());
        assert_eq!(f.min_notional, Decimal::from(100));
    }
}
