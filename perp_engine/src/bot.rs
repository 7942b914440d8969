/// bot.rs — Orchestration loop
///
/// One cycle:
///   1. account snapshot (positions + balance, fetched once)
///   2. manage open positions (exits, breakeven, trailing, adoption)
///   3. entry gates: free slots, circuit breaker, session filter
///   4. evaluate every flat symbol concurrently and open brackets
///
/// Slots are reserved atomically before an order is sent so concurrent
/// evaluations can never exceed MAX_CONCURRENT_TRADES.  Orders themselves go
/// out one at a time against a shared margin budget, so each entry sizes on
/// what the previous ones left available.
use ahash::{AHashMap, AHashSet};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{ExchangeError, ExecutionError};
use crate::exchange::{FuturesExchange, PositionInfo};
use crate::execution::Executor;
use crate::manager::PositionManager;
use crate::market_data::{fetch_multi_frame, IndicatorCache};
use crate::notify::{Message, NotifySender};
use crate::state::SharedState;
use crate::strategy::{build_strategy, funding_allows, Decision, Snapshot, Strategy};
use crate::time_filter::entries_allowed;
use crate::trade_log::Journal;

/// Pause after a failed cycle before trying again.
pub const RETRY_SECS: u64 = 10;

/// Server clock is re-measured every this many cycles (and after any -1021).
pub const TIME_RESYNC_CYCLES: u64 = 240;

/// What a cycle did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleReport {
    pub closed:    usize,
    pub evaluated: usize,
    pub opened:    Vec<String>,
    /// Why entries were not evaluated this cycle
    pub gated:     Option<String>,
}

pub struct Bot {
    exchange: Arc<dyn FuturesExchange>,
    executor: Arc<Executor>,
    manager:  PositionManager,
    strategy: Box<dyn Strategy>,
    state:    SharedState,
    cfg:      Arc<AppConfig>,
    notifier: NotifySender,
    journal:  Arc<Journal>,
    cache:    IndicatorCache,
}

impl Bot {
    pub fn new(
        exchange: Arc<dyn FuturesExchange>,
        state:    SharedState,
        journal:  Arc<Journal>,
        notifier: NotifySender,
        cfg:      Arc<AppConfig>,
    ) -> Self {
        let executor = Arc::new(Executor::new(exchange.clone(), cfg.clone()));
        let manager = PositionManager::new(
            executor.clone(),
            state.clone(),
            journal.clone(),
            notifier.clone(),
            cfg.clone(),
        );
        Self {
            strategy: build_strategy(cfg.strategy),
            cache: IndicatorCache::new(cfg.indicator_cache_secs),
            exchange,
            executor,
            manager,
            state,
            cfg,
            notifier,
            journal,
        }
    }

    /// Replace the configured strategy.
    pub fn with_strategy(mut self, strategy: Box<dyn Strategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Leverage and margin type for every symbol, then the start message.
    /// A symbol that cannot be prepared is logged and retried on entry.
    pub async fn startup(&self) {
        for symbol in &self.cfg.trading_pairs {
            match self.executor.prepare_symbol(symbol).await {
                Ok(lev) => info!("✅ {} ready at {}x", symbol, lev),
                Err(e) => warn!("⚠️ {} setup failed: {}", symbol, e),
            }
        }
        self.notifier.send(Message::Started {
            mode:     if self.cfg.paper_trading { "paper".into() } else { "live".into() },
            symbols:  self.cfg.trading_pairs.len(),
            strategy: self.strategy.name().to_owned(),
        });
    }

    /// Run cycles until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!(
            "🔁 Cycle every {}s over {} symbols ({} strategy)",
            self.cfg.cycle_seconds,
            self.cfg.trading_pairs.len(),
            self.strategy.name()
        );
        loop {
            let pause = match self.cycle().await {
                Ok(report) => {
                    debug!("cycle done: {:?}", report);
                    Duration::from_secs(self.cfg.cycle_seconds)
                }
                Err(e) => {
                    error!("🚨 Cycle failed: {:#}, retrying in {}s", e, RETRY_SECS);
                    if is_clock_skew(&e) {
                        self.resync_clock().await;
                    }
                    Duration::from_secs(RETRY_SECS)
                }
            };
            tokio::select! {
                _ = &mut shutdown => {
                    info!("🛑 Shutdown requested, leaving open positions to their stops");
                    break;
                }
                _ = sleep(pause) => {}
            }
        }
    }

    /// Re-measure the exchange clock offset; failures keep the old offset.
    pub async fn resync_clock(&self) {
        match self.exchange.sync_time().await {
            Ok(offset) => debug!("clock offset {} ms", offset),
            Err(e) => warn!("⚠️ Time sync failed ({}), keeping previous offset", e),
        }
    }

    pub async fn cycle(&self) -> Result<CycleReport> {
        let now = Utc::now();
        let (cycles, running) = {
            let mut state = self.state.write().await;
            state.last_cycle = Some(now);
            state.cycles += 1;
            (state.cycles, state.running)
        };
        if cycles % TIME_RESYNC_CYCLES == 0 {
            self.resync_clock().await;
        }
        if !running {
            return Ok(CycleReport { gated: Some("bot stopped".into()), ..CycleReport::default() });
        }

        let (positions, balance) = tokio::try_join!(self.exchange.positions(), self.exchange.balance())
            .context("fetching account state")?;

        let snapshots = self.position_snapshots(&positions, now).await;
        let closed = self.manager.manage_positions(&positions, &snapshots).await;
        let mut report = CycleReport { closed: closed.len(), ..CycleReport::default() };

        // closes change both the slot count and the balance
        let (positions, balance) = if closed.is_empty() {
            (positions, balance)
        } else {
            tokio::try_join!(self.exchange.positions(), self.exchange.balance())
                .context("refreshing account state")?
        };

        if let Some(gate) = self.entry_gate(positions.len(), now).await {
            debug!("entries gated: {}", gate);
            report.gated = Some(gate);
            return Ok(report);
        }

        let busy: AHashSet<String> = {
            let state = self.state.read().await;
            positions
                .iter()
                .map(|p| p.symbol.clone())
                .chain(state.trades.keys().cloned())
                .collect()
        };
        let candidates: Vec<&String> = self.cfg.trading_pairs.iter().filter(|s| !busy.contains(*s)).collect();
        let slots = AtomicUsize::new(self.cfg.max_concurrent_trades.saturating_sub(positions.len()));
        let budget = Mutex::new(balance.available);

        let opened = join_all(
            candidates
                .iter()
                .map(|symbol| self.evaluate_symbol(symbol, &budget, &slots, now)),
        )
        .await;

        report.evaluated = candidates.len();
        report.opened = opened.into_iter().flatten().collect();
        if !report.opened.is_empty() {
            info!("📈 Opened {:?} | {} slot(s) left", report.opened, slots.load(Ordering::SeqCst));
        }
        Ok(report)
    }

    async fn entry_gate(&self, open_positions: usize, now: DateTime<Utc>) -> Option<String> {
        if open_positions >= self.cfg.max_concurrent_trades {
            return Some(format!("{} of {} slots in use", open_positions, self.cfg.max_concurrent_trades));
        }
        {
            let state = self.state.read().await;
            if state.breaker.is_paused(now) {
                let left = state.breaker.remaining(now);
                return Some(format!("circuit breaker paused for {}m", left.num_minutes()));
            }
        }
        let (allowed, session) = entries_allowed(&self.cfg, now);
        (!allowed).then(|| session.to_owned())
    }

    /// Entry-frame snapshots for symbols with live positions.
    async fn position_snapshots(&self, positions: &[PositionInfo], now: DateTime<Utc>) -> AHashMap<String, Snapshot> {
        let fetched = join_all(positions.iter().map(|p| async move {
            let frames = fetch_multi_frame(self.exchange.as_ref(), &self.cache, &p.symbol, &self.cfg, now).await;
            match frames {
                Ok(f) => Snapshot::from_frames(&f, &self.cfg).map(|s| (p.symbol.clone(), s)),
                Err(e) => {
                    warn!("⚠️ {} klines unavailable for exit checks: {}", p.symbol, e);
                    None
                }
            }
        }))
        .await;
        fetched.into_iter().flatten().collect()
    }

    /// Evaluate one flat symbol; returns it when a bracket was opened.
    async fn evaluate_symbol(
        &self,
        symbol:  &str,
        budget:  &Mutex<f64>,
        slots:   &AtomicUsize,
        now:     DateTime<Utc>,
    ) -> Option<String> {
        let frames = match fetch_multi_frame(self.exchange.as_ref(), &self.cache, symbol, &self.cfg, now).await {
            Ok(f) => f,
            Err(e) => {
                warn!("⚠️ {} kline fetch failed: {}", symbol, e);
                return None;
            }
        };
        let Some(snap) = Snapshot::from_frames(&frames, &self.cfg) else {
            debug!("{} not enough history for indicators", symbol);
            return None;
        };

        let mut decision = self.strategy.evaluate(&snap, &self.cfg);
        if let Decision::Enter(signal) = &decision {
            match self.exchange.funding_rate(symbol).await {
                Ok(f) if !funding_allows(signal.direction, f.rate, self.cfg.max_funding_rate) => {
                    decision = Decision::Skip(format!(
                        "funding rate {:.4}% against {}",
                        f.rate * 100.0,
                        signal.direction
                    ));
                }
                Ok(_) => {}
                Err(e) => warn!("⚠️ {} funding rate unavailable ({}), not filtering", symbol, e),
            }
        }
        self.journal.signal(symbol, &decision, Some(&snap)).await;

        let signal = match decision {
            Decision::Enter(signal) => signal,
            Decision::Reject(r) => {
                info!("🚫 {} {} rejected: {} [{}]", symbol, r.direction, r.reason, r.checks);
                return None;
            }
            Decision::Skip(why) => {
                debug!("{} skip: {}", symbol, why);
                return None;
            }
        };

        if slots.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_err() {
            info!("⏳ {} {} signal dropped, no free slot", symbol, signal.direction);
            return None;
        }

        info!("🎯 {} {} signal @ {:.4}: {}", symbol, signal.direction, signal.entry_price, signal.reason);
        let mut budget = budget.lock().await;
        let balance = *budget;
        match self.executor.open_bracket(&signal, symbol, balance).await {
            Ok(trade) => {
                *budget = (balance - trade.margin()).max(0.0);
                drop(budget);
                if let Err(e) = self.state.write().await.open(trade.clone()) {
                    warn!("⚠️ {}", e);
                }
                self.journal.record_open(&trade, balance).await;
                self.notifier.send(Message::Opened(trade));
                Some(symbol.to_owned())
            }
            Err(e) => {
                drop(budget);
                slots.fetch_add(1, Ordering::SeqCst);
                match &e {
                    ExecutionError::Unprotected { .. } => {
                        error!("🚨 {}", e);
                        self.notifier.send(Message::Alert(e.to_string()));
                    }
                    _ => warn!("⚠️ {} entry failed: {}", symbol, e),
                }
                self.cache.invalidate(symbol).await;
                None
            }
        }
    }
}

/// Signed requests rejected for a drifted timestamp somewhere in the chain.
fn is_clock_skew(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<ExchangeError>().is_some_and(ExchangeError::is_clock_skew))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use crate::state::BotState;
    use crate::strategy::snapshot::fixtures::{klines_from_closes, uptrend};
    use crate::exchange::Direction;
    use crate::strategy::{atr_bracket, Checks, EntrySignal};

    /// Enters long on every evaluation.
    struct AlwaysLong;

    impl Strategy for AlwaysLong {
        fn name(&self) -> &'static str {
            "always-long"
        }

        fn evaluate(&self, snap: &Snapshot, cfg: &AppConfig) -> Decision {
            let (stop_loss, take_profit) = atr_bracket(Direction::Long, snap.close, snap.atr, cfg);
            Decision::Enter(EntrySignal {
                direction:   Direction::Long,
                entry_price: snap.close,
                stop_loss,
                take_profit,
                atr:         snap.atr,
                reason:      "test".into(),
                checks:      Checks::default(),
            })
        }
    }

    const SYMBOLS: [&str; 3] = ["BTCUSDT", "ETHUSDT", "SOLUSDT"];

    fn setup(max_trades: usize) -> (Arc<PaperExchange>, Bot) {
        let tmp = std::env::temp_dir().join(format!("perp-bot-{}", uuid::Uuid::new_v4()));
        let cfg = Arc::new(AppConfig {
            trading_pairs:         SYMBOLS.iter().map(|s| s.to_string()).collect(),
            max_concurrent_trades: max_trades,
            use_time_filter:       false,
            use_indicator_exits:   false,
            trade_log_path:        tmp.join("trades.json").to_string_lossy().into_owned(),
            log_dir:               tmp.join("logs").to_string_lossy().into_owned(),
            ..AppConfig::default()
        });

        let paper = Arc::new(PaperExchange::new(1_000.0, 0.0));
        let entry = klines_from_closes(&uptrend(120, 100.0, 0.5), 900_000, 0.3);
        let confirm = klines_from_closes(&uptrend(120, 100.0, 1.0), 3_600_000, 0.5);
        let trend = klines_from_closes(&uptrend(120, 100.0, 2.0), 14_400_000, 1.0);
        for s in SYMBOLS {
            paper.set_klines(s, &cfg.kline_interval, entry.clone());
            paper.set_klines(s, &cfg.confirm_interval, confirm.clone());
            paper.set_klines(s, &cfg.trend_interval, trend.clone());
            paper.set_mark_price(s, 159.5);
        }

        let journal = Arc::new(Journal::new(&cfg.trade_log_path, &cfg.log_dir));
        let bot = Bot::new(paper.clone(), BotState::shared(&cfg), journal, NotifySender::disabled(), cfg)
            .with_strategy(Box::new(AlwaysLong));
        (paper, bot)
    }

    #[tokio::test]
    async fn concurrent_entries_respect_slot_limit() {
        let (paper, bot) = setup(2);
        let report = bot.cycle().await.unwrap();
        assert_eq!(report.evaluated, 3);
        assert_eq!(report.opened.len(), 2);
        assert_eq!(paper.positions().await.unwrap().len(), 2);
        assert_eq!(bot.state().read().await.open_count(), 2);

        let report = bot.cycle().await.unwrap();
        assert!(report.opened.is_empty());
        assert!(report.gated.is_some());
    }

    #[tokio::test]
    async fn stopped_bot_only_timestamps() {
        let (paper, bot) = setup(3);
        bot.state().write().await.running = false;
        let report = bot.cycle().await.unwrap();
        assert_eq!(report.gated.as_deref(), Some("bot stopped"));
        assert!(paper.positions().await.unwrap().is_empty());
        let state = bot.state().read().await;
        assert_eq!(state.cycles, 1);
        assert!(state.last_cycle.is_some());
    }

    #[tokio::test]
    async fn paused_breaker_blocks_entries() {
        let (paper, bot) = setup(3);
        bot.state().write().await.breaker.paused_until = Some(Utc::now() + chrono::Duration::hours(1));
        let report = bot.cycle().await.unwrap();
        assert!(report.gated.unwrap().contains("circuit breaker"));
        assert!(paper.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn adverse_funding_skips_entry() {
        let (paper, bot) = setup(3);
        for s in SYMBOLS {
            paper.set_funding_rate(s, 0.01);
        }
        let report = bot.cycle().await.unwrap();
        assert_eq!(report.evaluated, 3);
        assert!(report.opened.is_empty());
    }

    #[tokio::test]
    async fn concurrent_entries_share_one_margin_budget() {
        let (paper, bot) = setup(3);
        let report = bot.cycle().await.unwrap();
        assert_eq!(report.opened.len(), 3);

        let state = bot.state().read().await;
        let mut qty: Vec<f64> = state.trades.values().map(|t| t.quantity_f64()).collect();
        qty.sort_by(|a, b| b.total_cmp(a));
        // each later entry sized on a smaller remaining balance
        assert!(qty[0] > qty[1] && qty[1] > qty[2], "quantities {qty:?}");
        let margin: f64 = state.trades.values().map(|t| t.margin()).sum();
        assert!(margin <= 1_000.0);
        assert!(paper.balance().await.unwrap().available > 0.0);
    }

    #[tokio::test]
    async fn clock_is_resynced_periodically() {
        let (paper, bot) = setup(3);
        bot.state().write().await.running = false;
        for _ in 0..TIME_RESYNC_CYCLES - 1 {
            bot.cycle().await.unwrap();
        }
        assert_eq!(paper.time_syncs(), 0);
        bot.cycle().await.unwrap();
        assert_eq!(paper.time_syncs(), 1);
    }

    #[test]
    fn timestamp_rejection_is_detected_through_context() {
        let skew = ExchangeError::from_api(400, r#"{"code":-1021,"msg":"Timestamp for this request is outside of the recvWindow."}"#);
        let err = anyhow::Error::new(skew).context("fetching account state");
        assert!(is_clock_skew(&err));

        let other = anyhow::Error::new(ExchangeError::Network("reset".into())).context("fetching account state");
        assert!(!is_clock_skew(&other));
    }

    #[tokio::test]
    async fn shutdown_ends_run() {
        let (_, bot) = setup(1);
        tokio::time::timeout(Duration::from_secs(5), bot.run(async {}))
            .await
            .expect("run returns once shutdown resolves");
    }
}
