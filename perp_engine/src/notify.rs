/// notify.rs — Telegram notifications
///
/// A background task owns the HTTP client and drains an unbounded channel.
/// Callers hold a cloneable `NotifySender`; `send` never blocks and never
/// fails, delivery errors are only logged.  Without a bot token / chat id
/// the sender is disabled and messages go to the log instead.
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::exchange::Direction;
use crate::execution::ClosedTrade;
use crate::state::{ManagedTrade, TradePhase};

const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub enum Message {
    Started { mode: String, symbols: usize, strategy: String },
    Opened(ManagedTrade),
    Closed(ClosedTrade),
    StopMoved { symbol: String, stop: f64, phase: TradePhase },
    Alert(String),
    Paused(DateTime<Utc>),
}

impl Message {
    pub fn render(&self) -> String {
        match self {
            Self::Started { mode, symbols, strategy } => {
                format!("🤖 Bot started ({mode}) | {strategy} strategy on {symbols} symbols")
            }
            Self::Opened(t) => format!(
                "{} {} {} opened @ {:.4}\nQty {} | SL {:.4} | TP {:.4}\n{}",
                direction_icon(t.direction),
                t.direction,
                t.symbol,
                t.entry_price,
                t.quantity,
                t.stop_loss,
                t.take_profit,
                t.reason
            ),
            Self::Closed(c) => format!(
                "{} {} {} closed @ {:.4}\nPnL {:+.2} USDT (ROI {:+.2}%)\n{}",
                if c.is_win() { "⭕" } else { "❌" },
                c.direction,
                c.symbol,
                c.exit_price,
                c.pnl,
                c.roi_pct(),
                c.reason
            ),
            Self::StopMoved { symbol, stop, phase } => {
                format!("🔒 {symbol} stop moved to {stop:.4} ({})", phase.label())
            }
            Self::Alert(text) => format!("🚨 {text}"),
            Self::Paused(until) => format!(
                "🛑 Consecutive loss limit hit, new entries paused until {}",
                until.format("%Y-%m-%d %H:%M UTC")
            ),
        }
    }
}

fn direction_icon(direction: Direction) -> &'static str {
    match direction {
        Direction::Long  => "🔺",
        Direction::Short => "🔻",
    }
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text:    &'a str,
}

/// Cheap handle used everywhere a notification may be sent.
#[derive(Clone, Default)]
pub struct NotifySender {
    tx: Option<mpsc::UnboundedSender<Message>>,
}

impl NotifySender {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn send(&self, message: Message) {
        match &self.tx {
            Some(tx) => {
                if let Err(e) = tx.send(message) {
                    debug!("notifier stopped, dropped: {}", e.0.render());
                }
            }
            None => info!("📣 {}", message.render()),
        }
    }
}

pub struct Notifier {
    client:    Client,
    bot_token: String,
    chat_id:   String,
}

impl Notifier {
    pub fn new(bot_token: &str, chat_id: &str) -> Self {
        Self { client: Client::new(), bot_token: bot_token.to_owned(), chat_id: chat_id.to_owned() }
    }

    /// Start the delivery task; `None` credentials give a disabled sender.
    pub fn spawn(credentials: Option<(&str, &str)>) -> (NotifySender, Option<JoinHandle<()>>) {
        let Some((token, chat)) = credentials else {
            info!("📵 Telegram not configured, notifications go to the log");
            return (NotifySender::disabled(), None);
        };
        let notifier = Self::new(token, chat);
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                notifier.deliver(&message.render()).await;
            }
            debug!("notifier channel closed");
        });
        (NotifySender { tx: Some(tx) }, Some(handle))
    }

    async fn deliver(&self, text: &str) {
        let url = format!("{}/bot{}/sendMessage", TELEGRAM_API, self.bot_token);
        let request = SendMessageRequest { chat_id: &self.chat_id, text };
        match self.client.post(&url).json(&request).send().await {
            Ok(resp) if resp.status().is_success() => debug!("📨 Telegram message sent"),
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                error!("Telegram API error {}: {}", status, body);
            }
            Err(e) => error!("Telegram send failed: {}", e),
        }
    }
}
