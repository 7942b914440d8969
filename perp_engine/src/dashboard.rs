/// dashboard.rs — JSON API for monitoring and controlling the bot
///
///   GET  /api/active-trades           live positions + managed trade data
///   GET  /api/account-balance         USDT balance / available
///   GET  /api/trade-analysis          analysis of the JSON trade log
///   GET  /api/price-history/:symbol   entry-interval closes for charting
///   POST /api/bot/start | /api/bot/stop
///   GET  /api/bot/status
///
/// Exchange-backed responses are cached for DASHBOARD_CACHE_SECS behind a
/// single async mutex.  Exchange failures answer 502 `{"error": ...}`.
use ahash::AHashMap;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::ExchangeError;
use crate::exchange::{FuturesExchange, Kline, PositionInfo};
use crate::metrics::{analyze_trades, TradeAnalysis};
use crate::state::SharedState;
use crate::trade_log::read_records;

pub struct DashboardState {
    exchange:  Arc<dyn FuturesExchange>,
    state:     SharedState,
    cfg:       Arc<AppConfig>,
    trade_log: PathBuf,
    cache:     Mutex<AHashMap<String, (Instant, Value)>>,
}

pub type AppState = Arc<DashboardState>;

impl DashboardState {
    pub fn new(exchange: Arc<dyn FuturesExchange>, state: SharedState, cfg: Arc<AppConfig>) -> AppState {
        Arc::new(Self {
            exchange,
            state,
            trade_log: PathBuf::from(&cfg.trade_log_path),
            cfg,
            cache: Mutex::new(AHashMap::new()),
        })
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.cfg.dashboard_cache_secs)
    }

    /// Serve `key` from the cache or run `fetch` and remember the result.
    async fn cached<T, F>(&self, key: &str, fetch: F) -> Result<Value, ApiError>
    where
        T: Serialize,
        F: Future<Output = Result<T, ExchangeError>>,
    {
        let mut cache = self.cache.lock().await;
        if let Some((at, value)) = cache.get(key) {
            if at.elapsed() < self.ttl() {
                return Ok(value.clone());
            }
        }
        let value = serde_json::to_value(fetch.await?).map_err(|e| ApiError::Internal(e.to_string()))?;
        cache.insert(key.to_owned(), (Instant::now(), value.clone()));
        Ok(value)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Exchange(ExchangeError),
    Internal(String),
}

impl From<ExchangeError> for ApiError {
    fn from(e: ExchangeError) -> Self {
        Self::Exchange(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            Self::Exchange(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
            Self::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e),
        };
        warn!("dashboard error {}: {}", status, msg);
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

// ── Responses ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ActiveTrade {
    pub symbol:         String,
    pub direction:      String,
    pub amount:         f64,
    pub entry_price:    f64,
    pub mark_price:     f64,
    pub unrealized_pnl: f64,
    pub roi:            f64,
    pub leverage:       u32,
    pub managed:        bool,
    pub phase:          Option<&'static str>,
    pub stop_loss:      Option<f64>,
    pub take_profit:    Option<f64>,
    pub opened_at:      Option<DateTime<Utc>>,
    pub reason:         Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BotStatus {
    pub running:            bool,
    pub open_trades:        usize,
    pub cycles:             u64,
    pub last_cycle:         Option<DateTime<Utc>>,
    pub consecutive_losses: u32,
    pub paused_until:       Option<DateTime<Utc>>,
    pub strategy:           String,
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub async fn active_trades(State(app): State<AppState>) -> Result<Json<Vec<ActiveTrade>>, ApiError> {
    let positions = app.cached("positions", app.exchange.positions()).await?;
    let positions: Vec<PositionInfo> = serde_json::from_value(positions)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let state = app.state.read().await;
    let trades = positions
        .into_iter()
        .map(|p| {
            let tracked = state.get(&p.symbol);
            ActiveTrade {
                direction:      p.direction().map(|d| d.to_string()).unwrap_or_default(),
                roi:            p.roi_pct(),
                managed:        tracked.is_some(),
                phase:          tracked.map(|t| t.phase.label()),
                stop_loss:      tracked.map(|t| t.stop_loss),
                take_profit:    tracked.map(|t| t.take_profit),
                opened_at:      tracked.map(|t| t.opened_at),
                reason:         tracked.map(|t| t.reason.clone()),
                amount:         p.amount,
                entry_price:    p.entry_price,
                mark_price:     p.mark_price,
                unrealized_pnl: p.unrealized_pnl,
                leverage:       p.leverage,
                symbol:         p.symbol,
            }
        })
        .collect();
    Ok(Json(trades))
}

pub async fn account_balance(State(app): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(app.cached("balance", app.exchange.balance()).await?))
}

pub async fn trade_analysis(State(app): State<AppState>) -> Result<Json<TradeAnalysis>, ApiError> {
    let path = app.trade_log.clone();
    let records = tokio::task::spawn_blocking(move || read_records(&path))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    Ok(Json(analyze_trades(&records)))
}

pub async fn price_history(
    State(app): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let symbol = symbol.to_uppercase();
    let interval = app.cfg.kline_interval.clone();
    let key = format!("klines:{symbol}:{interval}");
    let klines = app
        .cached(&key, app.exchange.klines(&symbol, &interval, app.cfg.kline_lookback))
        .await?;
    let klines: Vec<Kline> =
        serde_json::from_value(klines).map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(json!({
        "symbol":     symbol,
        "interval":   interval,
        "timestamps": klines.iter().map(|k| k.open_time).collect::<Vec<_>>(),
        "closes":     klines.iter().map(|k| k.close).collect::<Vec<_>>(),
    })))
}

pub async fn bot_status(State(app): State<AppState>) -> Json<BotStatus> {
    let state = app.state.read().await;
    Json(BotStatus {
        running:            state.running,
        open_trades:        state.open_count(),
        cycles:             state.cycles,
        last_cycle:         state.last_cycle,
        consecutive_losses: state.breaker.consecutive_losses,
        paused_until:       state.breaker.paused_until.filter(|t| *t > Utc::now()),
        strategy:           app.cfg.strategy.to_string(),
    })
}

pub async fn bot_start(State(app): State<AppState>) -> Json<Value> {
    app.state.write().await.running = true;
    info!("▶️ Bot started from dashboard");
    Json(json!({ "status": "running" }))
}

pub async fn bot_stop(State(app): State<AppState>) -> Json<Value> {
    app.state.write().await.running = false;
    info!("⏸️ Bot stopped from dashboard");
    Json(json!({ "status": "stopped" }))
}

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/api/active-trades", get(active_trades))
        .route("/api/account-balance", get(account_balance))
        .route("/api/trade-analysis", get(trade_analysis))
        .route("/api/price-history/:symbol", get(price_history))
        .route("/api/bot/start", post(bot_start))
        .route("/api/bot/stop", post(bot_stop))
        .route("/api/bot/status", get(bot_status))
        .with_state(app)
}

pub async fn serve(app: AppState, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("📊 Dashboard listening on http://{}", addr);
    axum::serve(listener, router(app)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Kline, OrderRequest, PaperExchange, Side};
    use crate::state::fixtures::long_trade;
    use crate::state::BotState;
    use rust_decimal::Decimal;

    fn app() -> (Arc<PaperExchange>, AppState) {
        let paper = Arc::new(PaperExchange::new(1_000.0, 0.0));
        paper.set_mark_price("BTCUSDT", 100.0);
        let cfg = Arc::new(AppConfig {
            trade_log_path: std::env::temp_dir()
                .join(format!("perp-dash-{}.json", uuid::Uuid::new_v4()))
                .to_string_lossy()
                .into_owned(),
            ..AppConfig::default()
        });
        let state = BotState::shared(&cfg);
        (paper.clone(), DashboardState::new(paper, state, cfg))
    }

    #[tokio::test]
    async fn active_trades_merge_managed_data() {
        let (paper, app) = app();
        paper
            .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, Decimal::ONE))
            .await
            .unwrap();
        app.state.write().await.open(long_trade(100.0, 95.0)).unwrap();

        let Json(trades) = active_trades(State(app.clone())).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert!(trades[0].managed);
        assert_eq!(trades[0].phase, Some("initial"));
        assert_eq!(trades[0].stop_loss, Some(95.0));
    }

    #[tokio::test]
    async fn start_stop_toggles_running() {
        let (_, app) = app();
        bot_stop(State(app.clone())).await;
        let Json(status) = bot_status(State(app.clone())).await;
        assert!(!status.running);
        bot_start(State(app.clone())).await;
        assert!(app.state.read().await.running);
    }

    #[tokio::test]
    async fn balance_is_cached() {
        let (paper, app) = app();
        let Json(first) = account_balance(State(app.clone())).await.unwrap();
        paper
            .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, Decimal::ONE))
            .await
            .unwrap();
        paper.set_mark_price("BTCUSDT", 50.0);
        paper
            .place_order(&OrderRequest::reduce_only_market("BTCUSDT", Side::Sell, Decimal::ONE))
            .await
            .unwrap();
        let Json(second) = account_balance(State(app.clone())).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first["balance"], json!(1_000.0));
    }

    #[tokio::test]
    async fn empty_trade_log_gives_empty_analysis() {
        let (_, app) = app();
        let Json(analysis) = trade_analysis(State(app)).await.unwrap();
        assert!(analysis.is_empty());
    }

    #[test]
    fn exchange_errors_map_to_bad_gateway() {
        let resp = ApiError::from(ExchangeError::Network("timeout".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let resp = ApiError::Internal("corrupt log".into()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn price_history_uses_entry_interval() {
        let (paper, app) = app();
        let bars: Vec<Kline> = (0..3)
            .map(|i| Kline {
                open_time:  i * 60_000,
                open:       100.0,
                high:       101.0,
                low:        99.0,
                close:      100.0 + i as f64,
                volume:     10.0,
                close_time: i * 60_000 + 59_999,
            })
            .collect();
        paper.set_klines("BTCUSDT", &app.cfg.kline_interval, bars);

        let Json(body) = price_history(State(app), Path("btcusdt".into())).await.unwrap();
        assert_eq!(body["symbol"], json!("BTCUSDT"));
        assert_eq!(body["closes"], json!([100.0, 101.0, 102.0]));
    }
}
