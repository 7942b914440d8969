//! End-to-end trade lifecycle against the paper exchange and a scripted
//! failing exchange.
use ahash::AHashMap;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use perp_engine::bot::Bot;
use perp_engine::config::{AppConfig, MarginType};
use perp_engine::error::{ExchangeError, ExchangeResult, ExecutionError};
use perp_engine::exchange::{
    AccountBalance, Direction, FundingRate, FuturesExchange, Kline, OpenOrder, OrderAck, OrderKind,
    OrderRequest, PaperExchange, PositionInfo, SymbolFilters,
};
use perp_engine::execution::Executor;
use perp_engine::manager::PositionManager;
use perp_engine::metrics::analyze_trades;
use perp_engine::notify::NotifySender;
use perp_engine::state::{BotState, SharedState};
use perp_engine::strategy::{Checks, EntrySignal, ExitReason};
use perp_engine::trade_log::Journal;

const SYMBOL: &str = "ETHUSDT";

fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("perp-it-{}", uuid::Uuid::new_v4()))
}

fn config(dir: &PathBuf) -> Arc<AppConfig> {
    Arc::new(AppConfig {
        trading_pairs:  vec![SYMBOL.into()],
        trade_log_path: dir.join("trade_logs.json").to_string_lossy().into_owned(),
        log_dir:        dir.join("logs").to_string_lossy().into_owned(),
        use_time_filter: false,
        ..AppConfig::default()
    })
}

fn long_signal() -> EntrySignal {
    EntrySignal {
        direction:   Direction::Long,
        entry_price: 100.0,
        stop_loss:   97.0,
        take_profit: 106.0,
        atr:         2.0,
        reason:      "integration".into(),
        checks:      Checks::default(),
    }
}

struct Harness {
    executor: Arc<Executor>,
    manager:  PositionManager,
    state:    SharedState,
    journal:  Arc<Journal>,
}

fn harness(exchange: Arc<dyn FuturesExchange>, cfg: Arc<AppConfig>) -> Harness {
    let executor = Arc::new(Executor::new(exchange, cfg.clone()));
    let state = BotState::shared(&cfg);
    let journal = Arc::new(Journal::new(&cfg.trade_log_path, &cfg.log_dir));
    let manager = PositionManager::new(
        executor.clone(),
        state.clone(),
        journal.clone(),
        NotifySender::disabled(),
        cfg,
    );
    Harness { executor, manager, state, journal }
}

#[tokio::test]
async fn stop_fired_on_exchange_is_settled_and_journaled() {
    let dir = temp_dir();
    let cfg = config(&dir);
    let paper = Arc::new(PaperExchange::new(1_000.0, 0.0));
    paper.set_mark_price(SYMBOL, 100.0);
    let h = harness(paper.clone(), cfg);

    let trade = h.executor.open_bracket(&long_signal(), SYMBOL, 1_000.0).await.unwrap();
    assert_eq!(trade.stop_loss, 97.0);
    h.state.write().await.open(trade.clone()).unwrap();
    h.journal.record_open(&trade, 1_000.0).await;

    // the resting stop fires on the exchange
    paper.set_mark_price(SYMBOL, 96.0);
    let positions = paper.positions().await.unwrap();
    assert!(positions.is_empty());

    let closed = h.manager.manage_positions(&positions, &AHashMap::new()).await;
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].reason, ExitReason::ExchangeClosed);
    assert!(closed[0].pnl < 0.0);
    assert_eq!(h.state.read().await.open_count(), 0);
    assert_eq!(h.state.read().await.breaker.consecutive_losses, 1);

    let records = h.journal.json().read_all().unwrap();
    assert_eq!(records.len(), 2);
    let analysis = analyze_trades(&records);
    assert_eq!(analysis.total_trades, 1);
    assert_eq!(analysis.losses, 1);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn consecutive_losses_pause_entries() {
    let dir = temp_dir();
    let cfg = config(&dir);
    let paper = Arc::new(PaperExchange::new(1_000.0, 0.0));
    let h = harness(paper.clone(), cfg.clone());

    for _ in 0..cfg.max_consecutive_losses {
        paper.set_mark_price(SYMBOL, 100.0);
        let trade = h.executor.open_bracket(&long_signal(), SYMBOL, 1_000.0).await.unwrap();
        h.state.write().await.open(trade.clone()).unwrap();
        paper.set_mark_price(SYMBOL, 98.5);
        let closed = h.manager.close(&trade, ExitReason::Manual, 98.5).await.unwrap();
        assert!(closed.pnl < 0.0);
    }

    let state = h.state.read().await;
    assert!(state.breaker.is_paused(Utc::now()));
    assert_eq!(state.breaker.consecutive_losses, 0);
    drop(state);
    let _ = std::fs::remove_dir_all(dir);
}

// ── Scripted failing exchange ────────────────────────────────────────────

/// Paper exchange whose account reads or stop orders can be made to fail.
struct Flaky {
    inner:          PaperExchange,
    fail_positions: AtomicBool,
    fail_stops:     AtomicBool,
}

impl Flaky {
    fn new() -> Self {
        let inner = PaperExchange::new(1_000.0, 0.0);
        inner.set_mark_price(SYMBOL, 100.0);
        Self { inner, fail_positions: AtomicBool::new(false), fail_stops: AtomicBool::new(false) }
    }
}

#[async_trait]
impl FuturesExchange for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> ExchangeResult<Vec<Kline>> {
        self.inner.klines(symbol, interval, limit).await
    }

    async fn positions(&self) -> ExchangeResult<Vec<PositionInfo>> {
        if self.fail_positions.swap(false, Ordering::SeqCst) {
            return Err(ExchangeError::Network("connection reset".into()));
        }
        self.inner.positions().await
    }

    async fn balance(&self) -> ExchangeResult<AccountBalance> {
        self.inner.balance().await
    }

    async fn mark_price(&self, symbol: &str) -> ExchangeResult<f64> {
        self.inner.mark_price(symbol).await
    }

    async fn funding_rate(&self, symbol: &str) -> ExchangeResult<FundingRate> {
        self.inner.funding_rate(symbol).await
    }

    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters> {
        self.inner.symbol_filters(symbol).await
    }

    async fn perpetual_symbols(&self) -> ExchangeResult<Vec<String>> {
        self.inner.perpetual_symbols().await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.inner.set_leverage(symbol, leverage).await
    }

    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> ExchangeResult<()> {
        self.inner.set_margin_type(symbol, margin_type).await
    }

    async fn place_order(&self, req: &OrderRequest) -> ExchangeResult<OrderAck> {
        if matches!(req.kind, OrderKind::StopMarket { .. }) && self.fail_stops.load(Ordering::SeqCst) {
            return Err(ExchangeError::Api { status: 400, code: -2021, msg: "Order would immediately trigger.".into() });
        }
        self.inner.place_order(req).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> ExchangeResult<()> {
        self.inner.cancel_order(symbol, order_id).await
    }

    async fn open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OpenOrder>> {
        self.inner.open_orders(symbol).await
    }

    async fn cancel_all(&self, symbol: &str) -> ExchangeResult<()> {
        self.inner.cancel_all(symbol).await
    }
}

#[tokio::test]
async fn failed_stop_unwinds_the_entry() {
    let dir = temp_dir();
    let flaky = Arc::new(Flaky::new());
    flaky.fail_stops.store(true, Ordering::SeqCst);
    let h = harness(flaky.clone(), config(&dir));

    let err = h.executor.open_bracket(&long_signal(), SYMBOL, 1_000.0).await.unwrap_err();
    assert!(matches!(err, ExecutionError::Unprotected { unwound: true, .. }));
    assert!(flaky.positions().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_account_read_fails_the_cycle_only() {
    let dir = temp_dir();
    let cfg = config(&dir);
    let flaky = Arc::new(Flaky::new());
    flaky.fail_positions.store(true, Ordering::SeqCst);

    let journal = Arc::new(Journal::new(&cfg.trade_log_path, &cfg.log_dir));
    let bot = Bot::new(flaky.clone(), BotState::shared(&cfg), journal, NotifySender::disabled(), cfg);

    let err = bot.cycle().await.unwrap_err();
    assert!(format!("{err:#}").contains("connection reset"));

    // no klines loaded: the next cycle runs and simply finds nothing to trade
    let report = bot.cycle().await.unwrap();
    assert_eq!(report.evaluated, 1);
    assert!(report.opened.is_empty());
    assert_eq!(bot.state().read().await.cycles, 2);
}
