/// manager.rs — Per-cycle management of open positions
///
///   1. tracked trade, no live position   → closed on the exchange (stop or
///                                          target fired): record at the mark
///   2. tracked trade, live position      → exit rules, else stop management
///   3. live position nobody tracks       → adopt it with an ROI-distance stop
use ahash::AHashMap;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::exchange::filters::to_decimal;
use crate::exchange::PositionInfo;
use crate::execution::{ClosedTrade, Executor};
use crate::notify::{Message, NotifySender};
use crate::state::{ManagedTrade, SharedState, TradePhase};
use crate::strategy::{exit_decision, ExitReason, Snapshot};
use crate::trade_log::Journal;

pub struct PositionManager {
    executor: Arc<Executor>,
    state:    SharedState,
    journal:  Arc<Journal>,
    notifier: NotifySender,
    cfg:      Arc<AppConfig>,
}

impl PositionManager {
    pub fn new(
        executor: Arc<Executor>,
        state:    SharedState,
        journal:  Arc<Journal>,
        notifier: NotifySender,
        cfg:      Arc<AppConfig>,
    ) -> Self {
        Self { executor, state, journal, notifier, cfg }
    }

    /// One management pass.  `snapshots` holds the entry-frame indicators
    /// of symbols with live positions; a missing one disables indicator exits
    /// for that symbol this cycle.  Returns the trades closed in this pass.
    pub async fn manage_positions(
        &self,
        positions: &[PositionInfo],
        snapshots: &AHashMap<String, Snapshot>,
    ) -> Vec<ClosedTrade> {
        let live: AHashMap<&str, &PositionInfo> = positions.iter().map(|p| (p.symbol.as_str(), p)).collect();
        let mut closed = Vec::new();

        // ── 1. closed by the exchange ────────────────────────────────────
        let vanished: Vec<ManagedTrade> = {
            let mut state = self.state.write().await;
            let gone: Vec<String> = state
                .trades
                .keys()
                .filter(|s| !live.contains_key(s.as_str()))
                .cloned()
                .collect();
            gone.iter().filter_map(|s| state.close(s)).collect()
        };
        for trade in vanished {
            closed.push(self.settle_exchange_close(trade).await);
        }

        // ── 2 & 3. live positions ────────────────────────────────────────
        for pos in positions {
            let Some(direction) = pos.direction() else { continue };
            let tracked = self.state.read().await.get(&pos.symbol).cloned();
            let trade = match tracked {
                Some(t) if t.direction == direction => t,
                Some(t) => {
                    warn!("⚠️ {} flipped {} → {}, re-adopting", pos.symbol, t.direction, direction);
                    self.state.write().await.close(&pos.symbol);
                    self.adopt(pos).await
                }
                None => self.adopt(pos).await,
            };

            let roi = pos.roi_pct();
            let snap = snapshots.get(&pos.symbol);
            if let Some(reason) = exit_decision(direction, roi, snap, &self.cfg) {
                info!("🚪 {} exit: {} (ROI {:.2}%)", pos.symbol, reason, roi);
                if let Some(c) = self.close(&trade, reason, pos.mark_price).await {
                    closed.push(c);
                }
                continue;
            }

            let atr = snap.map(|s| s.atr).unwrap_or(trade.atr);
            if let Some(update) = trade.next_stop(pos.mark_price, atr, &self.cfg) {
                match self.executor.move_stop(&trade, &update).await {
                    Ok(order_id) => {
                        if let Some(t) = self.state.write().await.trades.get_mut(&pos.symbol) {
                            t.apply(update, Some(order_id));
                            t.atr = atr;
                        }
                        self.notifier.send(Message::StopMoved {
                            symbol: pos.symbol.clone(),
                            stop:   update.new_stop,
                            phase:  update.phase,
                        });
                    }
                    Err(e) => warn!("⚠️ {} stop move to {:.4} failed: {}", pos.symbol, update.new_stop, e),
                }
            }
        }
        closed
    }

    /// Close a managed trade now and settle it.
    pub async fn close(&self, trade: &ManagedTrade, reason: ExitReason, mark: f64) -> Option<ClosedTrade> {
        match self.executor.close_trade(trade, reason, mark).await {
            Ok(c) => {
                self.state.write().await.close(&trade.symbol);
                self.settle(&c).await;
                Some(c)
            }
            Err(e) => {
                error!("🚨 {} close failed: {}", trade.symbol, e);
                self.notifier.send(Message::Alert(format!("{} close failed: {}", trade.symbol, e)));
                None
            }
        }
    }

    async fn settle_exchange_close(&self, trade: ManagedTrade) -> ClosedTrade {
        let exchange = self.executor.exchange();
        let mark = match exchange.mark_price(&trade.symbol).await {
            Ok(px) => px,
            Err(e) => {
                warn!("⚠️ {} mark unavailable ({}), using stop {:.4}", trade.symbol, e, trade.stop_loss);
                trade.stop_loss
            }
        };
        if let Err(e) = exchange.cancel_all(&trade.symbol).await {
            warn!("⚠️ {} leftover orders not cancelled: {}", trade.symbol, e);
        }
        let c = ClosedTrade::from_trade(&trade, mark, self.cfg.taker_fee, ExitReason::ExchangeClosed, Utc::now());
        info!(
            "{} {} closed on exchange ~{:.4} | PnL {:+.4} USDT",
            if c.is_win() { "⭕" } else { "❌" },
            c.symbol,
            mark,
            c.pnl
        );
        self.settle(&c).await;
        c
    }

    /// Breaker, journal and notification for a finished trade.
    async fn settle(&self, c: &ClosedTrade) {
        let now = Utc::now();
        let tripped = {
            let mut state = self.state.write().await;
            state.breaker.record(c.pnl, now).then(|| state.breaker.paused_until).flatten()
        };
        let balance = self.executor.exchange().balance().await.ok().map(|b| b.balance);
        self.journal.record_close(c, balance).await;
        self.notifier.send(Message::Closed(c.clone()));
        if let Some(until) = tripped {
            self.notifier.send(Message::Paused(until));
        }
    }

    /// Track a position this bot did not open, stopped at the ROI_STOP_LOSS distance.
    async fn adopt(&self, pos: &PositionInfo) -> ManagedTrade {
        let direction = pos.direction().unwrap_or(crate::exchange::Direction::Long);
        let leverage = pos.leverage.max(1) as f64;
        // ROI −x% of margin is a price move of x% / leverage
        let distance = pos.entry_price * self.cfg.roi_stop_loss.abs() / 100.0 / leverage;
        let stop = pos.entry_price - direction.sign() * distance;
        let target = pos.entry_price + direction.sign() * distance * self.cfg.risk_reward;

        let trade = ManagedTrade {
            symbol:        pos.symbol.clone(),
            direction,
            entry_price:   pos.entry_price,
            quantity:      to_decimal(pos.amount.abs()),
            leverage:      pos.leverage,
            initial_stop:  stop,
            stop_loss:     stop,
            take_profit:   target,
            stop_order_id: None,
            tp_order_id:   None,
            phase:         TradePhase::Initial,
            atr:           0.0,
            opened_at:     Utc::now(),
            reason:        "adopted existing position".into(),
        };
        info!(
            "📥 Adopted {} {} {} @ {:.4} (stop reference {:.4})",
            direction, pos.amount.abs(), pos.symbol, pos.entry_price, stop
        );
        if let Err(e) = self.state.write().await.open(trade.clone()) {
            warn!("⚠️ {}", e);
        }
        trade
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Direction, FuturesExchange, OrderRequest, PaperExchange, Side};
    use crate::state::BotState;
    use crate::strategy::test_support::neutral_snapshot;
    use rust_decimal::Decimal;

    struct Harness {
        paper:   Arc<PaperExchange>,
        manager: PositionManager,
        state:   SharedState,
        _dir:    std::path::PathBuf,
    }

    fn harness() -> Harness {
        let cfg = Arc::new(AppConfig::default());
        let paper = Arc::new(PaperExchange::new(1_000.0, 0.0));
        paper.set_mark_price("ETHUSDT", 100.0);
        let dir = std::env::temp_dir().join(format!("perp-manager-{}", uuid::Uuid::new_v4()));
        let journal = Arc::new(Journal::new(dir.join("trade_logs.json"), &dir));
        let state = BotState::shared(&cfg);
        let executor = Arc::new(Executor::new(paper.clone(), cfg.clone()));
        let manager = PositionManager::new(executor, state.clone(), journal, NotifySender::disabled(), cfg);
        Harness { paper, manager, state, _dir: dir }
    }

    async fn open_long(h: &Harness) -> ManagedTrade {
        h.paper
            .place_order(&OrderRequest::market("ETHUSDT", Side::Buy, Decimal::ONE))
            .await
            .unwrap();
        let stop = h
            .paper
            .place_order(&OrderRequest::stop_loss("ETHUSDT", Side::Sell, Decimal::new(97, 0)))
            .await
            .unwrap();
        let trade = ManagedTrade {
            symbol:        "ETHUSDT".into(),
            direction:     Direction::Long,
            entry_price:   100.0,
            quantity:      Decimal::ONE,
            leverage:      20,
            initial_stop:  97.0,
            stop_loss:     97.0,
            take_profit:   106.0,
            stop_order_id: Some(stop.order_id),
            tp_order_id:   None,
            phase:         TradePhase::Initial,
            atr:           2.0,
            opened_at:     Utc::now(),
            reason:        "test".into(),
        };
        h.state.write().await.open(trade.clone()).unwrap();
        trade
    }

    #[tokio::test]
    async fn exchange_side_close_is_settled() {
        let h = harness();
        open_long(&h).await;
        h.paper.set_mark_price("ETHUSDT", 96.0);

        let positions = h.paper.positions().await.unwrap();
        assert!(positions.is_empty());
        let closed = h.manager.manage_positions(&positions, &AHashMap::new()).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, ExitReason::ExchangeClosed);
        assert!(closed[0].pnl < 0.0);
        let state = h.state.read().await;
        assert_eq!(state.open_count(), 0);
        assert_eq!(state.breaker.consecutive_losses, 1);
    }

    #[tokio::test]
    async fn profit_moves_stop_to_breakeven() {
        let h = harness();
        // 5x keeps a 3.5% move at 17.5% ROI, below the ROI take-profit
        h.paper.set_leverage("ETHUSDT", 5).await.unwrap();
        open_long(&h).await;
        h.paper.set_mark_price("ETHUSDT", 103.5);

        let positions = h.paper.positions().await.unwrap();
        let mut snaps = AHashMap::new();
        snaps.insert("ETHUSDT".to_string(), neutral_snapshot());
        let closed = h.manager.manage_positions(&positions, &snaps).await;
        assert!(closed.is_empty());

        let state = h.state.read().await;
        let t = state.get("ETHUSDT").unwrap();
        assert_eq!(t.phase, TradePhase::Breakeven);
        assert_eq!(t.stop_loss, 100.0);
        let orders = h.paper.open_orders(Some("ETHUSDT")).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].stop_price, 100.0);
    }

    #[tokio::test]
    async fn roi_take_profit_closes() {
        let h = harness();
        open_long(&h).await;
        // 20x: +3% move = +60% ROI
        h.paper.set_mark_price("ETHUSDT", 103.0);
        let positions = h.paper.positions().await.unwrap();
        let closed = h.manager.manage_positions(&positions, &AHashMap::new()).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason.to_string(), "ROI >= 50%");
        assert!(h.paper.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn untracked_position_is_adopted() {
        let h = harness();
        h.paper
            .place_order(&OrderRequest::market("ETHUSDT", Side::Sell, Decimal::ONE))
            .await
            .unwrap();
        let positions = h.paper.positions().await.unwrap();
        h.manager.manage_positions(&positions, &AHashMap::new()).await;

        let state = h.state.read().await;
        let t = state.get("ETHUSDT").unwrap();
        assert_eq!(t.direction, Direction::Short);
        // 10% ROI at 20x = 0.5% price distance
        assert!((t.stop_loss - 100.5).abs() < 1e-9);
    }
}
