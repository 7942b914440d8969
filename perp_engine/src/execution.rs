/// execution.rs — Bracket entries, exits and stop moves
///
/// BRACKET PROTOCOL
///   1. margin type (already set is fine) and leverage (fallback on -4028)
///   2. size from balance and stop distance, rounded to the lot grid
///   3. MARKET entry
///   4. re-anchor stop / target to the actual fill, same distances
///   5. STOP_MARKET closePosition      ── fails → reduce-only unwind, Unprotected
///   6. TAKE_PROFIT_MARKET closePosition ── fails → warn, keep the trade
///
/// A filled entry therefore always ends with a resting stop or an unwind.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::{ExchangeError, ExchangeResult, ExecutionError};
use crate::exchange::filters::{to_decimal, to_f64};
use crate::exchange::{Direction, FuturesExchange, OrderRequest};
use crate::risk::size_position;
use crate::state::{ManagedTrade, StopUpdate, TradePhase};
use crate::strategy::{EntrySignal, ExitReason};

/// A finished trade.  `pnl` is net of estimated taker fees on both legs.
#[derive(Debug, Clone, Serialize)]
pub struct ClosedTrade {
    pub symbol:      String,
    pub direction:   Direction,
    pub entry_price: f64,
    pub exit_price:  f64,
    pub quantity:    f64,
    pub leverage:    u32,
    pub fees:        f64,
    pub pnl:         f64,
    /// PnL as a fraction of entry notional
    pub pnl_frac:    f64,
    pub reason:      ExitReason,
    pub opened_at:   DateTime<Utc>,
    pub closed_at:   DateTime<Utc>,
}

impl ClosedTrade {
    pub fn from_trade(
        trade:      &ManagedTrade,
        exit_price: f64,
        fee_rate:   f64,
        reason:     ExitReason,
        closed_at:  DateTime<Utc>,
    ) -> Self {
        let qty = trade.quantity_f64();
        let fees = (trade.entry_price + exit_price) * qty * fee_rate;
        let pnl = trade.pnl_at(exit_price) - fees;
        let notional = trade.entry_price * qty;
        Self {
            symbol:      trade.symbol.clone(),
            direction:   trade.direction,
            entry_price: trade.entry_price,
            exit_price,
            quantity:    qty,
            leverage:    trade.leverage,
            fees,
            pnl,
            pnl_frac:    if notional > 0.0 { pnl / notional } else { 0.0 },
            reason,
            opened_at:   trade.opened_at,
            closed_at,
        }
    }

    /// PnL as a percentage of the margin posted.
    pub fn roi_pct(&self) -> f64 {
        self.pnl_frac * self.leverage.max(1) as f64 * 100.0
    }

    pub fn is_win(&self) -> bool {
        self.pnl > 0.0
    }
}

pub struct Executor {
    exchange: Arc<dyn FuturesExchange>,
    cfg:      Arc<AppConfig>,
}

impl Executor {
    pub fn new(exchange: Arc<dyn FuturesExchange>, cfg: Arc<AppConfig>) -> Self {
        Self { exchange, cfg }
    }

    pub fn exchange(&self) -> &Arc<dyn FuturesExchange> {
        &self.exchange
    }

    /// Margin type and leverage for a symbol; returns the leverage in force.
    pub async fn prepare_symbol(&self, symbol: &str) -> ExchangeResult<u32> {
        match self.exchange.set_margin_type(symbol, self.cfg.margin_type).await {
            Ok(()) => info!("⚙️ {} margin type {}", symbol, self.cfg.margin_type.as_str()),
            Err(ExchangeError::NoChangeNeeded { .. }) => {}
            Err(e) => return Err(e),
        }

        match self.exchange.set_leverage(symbol, self.cfg.leverage).await {
            Ok(()) => Ok(self.cfg.leverage),
            Err(ExchangeError::InvalidLeverage { msg, .. }) => {
                warn!(
                    "⚠️ {} leverage {}x rejected ({}), falling back to {}x",
                    symbol, self.cfg.leverage, msg, self.cfg.fallback_leverage
                );
                self.exchange.set_leverage(symbol, self.cfg.fallback_leverage).await?;
                Ok(self.cfg.fallback_leverage)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn open_bracket(
        &self,
        signal:  &EntrySignal,
        symbol:  &str,
        balance: f64,
    ) -> Result<ManagedTrade, ExecutionError> {
        let leverage = self.prepare_symbol(symbol).await?;
        let filters = self.exchange.symbol_filters(symbol).await?;
        let sizing = size_position(balance, signal.entry_price, signal.stop_loss, leverage, &self.cfg, &filters)?;
        // no tick grid means no stop price can be sent: refuse before entering
        filters.round_price(signal.stop_loss)?;

        let direction = signal.direction;
        let entry_req = OrderRequest::market(symbol, direction.entry_side(), sizing.quantity);
        let ack = self.exchange.place_order(&entry_req).await?;

        let fill = if ack.avg_price > 0.0 { ack.avg_price } else { signal.entry_price };
        let quantity = if ack.executed_qty > 0.0 { to_decimal(ack.executed_qty) } else { sizing.quantity };
        info!(
            "🚀 {} {} {} filled @ {:.4} (signal {:.4}) order {}",
            direction, quantity, symbol, fill, signal.entry_price, ack.order_id
        );

        // same distances, measured from the real fill
        let stop = filters.round_price(fill + (signal.stop_loss - signal.entry_price))?;
        let target = filters.round_price(fill + (signal.take_profit - signal.entry_price))?;
        let exit_side = direction.exit_side();

        let stop_order_id = match self
            .exchange
            .place_order(&OrderRequest::stop_loss(symbol, exit_side, stop))
            .await
        {
            Ok(ack) => ack.order_id,
            Err(e) => {
                error!("🚨 {} stop-loss @ {} failed: {}, unwinding entry", symbol, stop, e);
                let unwind = OrderRequest::reduce_only_market(symbol, exit_side, quantity);
                let unwound = match self.exchange.place_order(&unwind).await {
                    Ok(_) => true,
                    Err(e) => {
                        error!("🚨 {} unwind failed, position is UNPROTECTED: {}", symbol, e);
                        false
                    }
                };
                return Err(ExecutionError::Unprotected { symbol: symbol.to_owned(), unwound });
            }
        };

        let tp_order_id = match self
            .exchange
            .place_order(&OrderRequest::take_profit(symbol, exit_side, target))
            .await
        {
            Ok(ack) => Some(ack.order_id),
            Err(e) => {
                warn!("⚠️ {} take-profit @ {} failed: {} (stop-loss in place)", symbol, target, e);
                None
            }
        };

        info!("🛡️ {} SL {} | TP {}", symbol, stop, target);
        Ok(ManagedTrade {
            symbol:        symbol.to_owned(),
            direction,
            entry_price:   fill,
            quantity,
            leverage,
            initial_stop:  to_f64(stop),
            stop_loss:     to_f64(stop),
            take_profit:   to_f64(target),
            stop_order_id: Some(stop_order_id),
            tp_order_id,
            phase:         TradePhase::Initial,
            atr:           signal.atr,
            opened_at:     Utc::now(),
            reason:        signal.reason.clone(),
        })
    }

    /// Cancel resting orders and flatten with a reduce-only market order.
    pub async fn close_trade(
        &self,
        trade:  &ManagedTrade,
        reason: ExitReason,
        mark:   f64,
    ) -> Result<ClosedTrade, ExecutionError> {
        if let Err(e) = self.exchange.cancel_all(&trade.symbol).await {
            warn!("⚠️ {} cancel open orders failed: {}", trade.symbol, e);
        }

        let req = OrderRequest::reduce_only_market(&trade.symbol, trade.direction.exit_side(), trade.quantity);
        let exit_price = match self.exchange.place_order(&req).await {
            Ok(ack) if ack.avg_price > 0.0 => ack.avg_price,
            Ok(_) => mark,
            // nothing left to reduce: the position is already flat
            Err(ExchangeError::Api { code: -2022, .. }) => {
                warn!("⚠️ {} already flat when closing", trade.symbol);
                mark
            }
            Err(e) => return Err(e.into()),
        };

        let closed = ClosedTrade::from_trade(trade, exit_price, self.cfg.taker_fee, reason, Utc::now());
        info!(
            "{} {} closed @ {:.4} | PnL {:+.4} USDT | {}",
            if closed.is_win() { "⭕" } else { "❌" },
            trade.symbol,
            exit_price,
            closed.pnl,
            closed.reason
        );
        Ok(closed)
    }

    /// Place the tighter stop, then cancel the old one.  Returns the new
    /// stop's order id; on failure the old stop keeps protecting the trade.
    pub async fn move_stop(&self, trade: &ManagedTrade, update: &StopUpdate) -> Result<i64, ExecutionError> {
        let filters = self.exchange.symbol_filters(&trade.symbol).await?;
        let stop = filters.round_price(update.new_stop)?;
        let req = OrderRequest::reduce_only_stop(&trade.symbol, trade.direction.exit_side(), stop, trade.quantity);
        let ack = self.exchange.place_order(&req).await?;

        if let Some(old) = trade.stop_order_id {
            if let Err(e) = self.exchange.cancel_order(&trade.symbol, old).await {
                warn!("⚠️ {} old stop {} not cancelled: {}", trade.symbol, old, e);
            }
        }
        info!(
            "🔒 {} stop {:.4} → {} ({})",
            trade.symbol,
            trade.stop_loss,
            stop,
            update.phase.label()
        );
        Ok(ack.order_id)
    }
}
