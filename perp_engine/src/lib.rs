pub mod config;
pub mod error;
pub mod time_sync;
pub mod exchange;
pub mod market_data;
pub mod indicators;
pub mod time_filter;
pub mod strategy;
pub mod risk;
pub mod state;
pub mod execution;
pub mod manager;
pub mod trade_log;
pub mod notify;
pub mod metrics;
pub mod bot;
pub mod dashboard;
pub mod backtest;

pub use config::AppConfig;
pub use error::{ExchangeError, ExecutionError};
pub use exchange::{BinanceFutures, FuturesExchange, PaperExchange};
