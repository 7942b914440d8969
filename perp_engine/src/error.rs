/// error.rs — Error taxonomy for exchange and execution failures
///
/// Binance answers rejected requests with `{"code": -xxxx, "msg": "..."}`.
/// The codes the bot reacts to get their own variants so callers can match
/// on them instead of string-sniffing messages:
///
///   -2019 / -2018  margin or balance insufficient  → InsufficientBalance
///   -4028          leverage not valid for symbol   → InvalidLeverage
///   -4046 / -4059  margin type / position side
///                  already set                     → NoChangeNeeded
///   HTTP 429 / 418 request weight exceeded / ban   → RateLimited
use serde::Deserialize;
use thiserror::Error;

#[derive(Deserialize, Debug)]
pub struct BinanceError {
    pub code: i64,
    pub msg:  String,
}

/// Exchange filter violations, detected locally before an order is sent.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FilterError {
    #[error("quantity {qty} below minimum {min}")]
    MinQty { qty: String, min: String },
    #[error("quantity {qty} above maximum {max}")]
    MaxQty { qty: String, max: String },
    #[error("notional {notional} below minimum {min}")]
    MinNotional { notional: String, min: String },
    #[error("symbol has no tick size filter")]
    NoTickSize,
    #[error("quantity rounds to zero")]
    ZeroQuantity,
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited (HTTP {status})")]
    RateLimited { status: u16 },

    #[error("insufficient balance ({code}): {msg}")]
    InsufficientBalance { code: i64, msg: String },

    #[error("invalid leverage ({code}): {msg}")]
    InvalidLeverage { code: i64, msg: String },

    #[error("no change needed ({code}): {msg}")]
    NoChangeNeeded { code: i64, msg: String },

    #[error("Binance API error {code} (HTTP {status}): {msg}")]
    Api { status: u16, code: i64, msg: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("filter violation: {0}")]
    Filter(#[from] FilterError),

    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
}

impl ExchangeError {
    /// Classify a non-2xx response body.
    pub fn from_api(status: u16, body: &str) -> Self {
        if status == 429 || status == 418 {
            return Self::RateLimited { status };
        }
        match serde_json::from_str::<BinanceError>(body) {
            Ok(BinanceError { code, msg }) => match code {
                -2019 | -2018 => Self::InsufficientBalance { code, msg },
                -4028         => Self::InvalidLeverage { code, msg },
                -4046 | -4059 => Self::NoChangeNeeded { code, msg },
                _             => Self::Api { status, code, msg },
            },
            Err(_) => Self::Api { status, code: 0, msg: body.to_owned() },
        }
    }

    /// Worth retrying on the next cycle without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited { .. })
    }

    /// -1021: request timestamp outside recvWindow of the server clock.
    pub fn is_clock_skew(&self) -> bool {
        matches!(self, Self::Api { code: -1021, .. })
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("sizing failed: {0}")]
    Sizing(String),

    /// Entry filled but no stop-loss could be placed.
    #[error("{symbol}: entry filled without stop-loss (unwound: {unwound})")]
    Unprotected { symbol: String, unwound: bool },

    #[error("{0} already has a managed trade")]
    AlreadyOpen(String),
}

impl From<FilterError> for ExecutionError {
    fn from(e: FilterError) -> Self {
        Self::Exchange(ExchangeError::Filter(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_codes() {
        let e = ExchangeError::from_api(400, r#"{"code":-2019,"msg":"Margin is insufficient."}"#);
        assert!(matches!(e, ExchangeError::InsufficientBalance { code: -2019, .. }));

        let e = ExchangeError::from_api(400, r#"{"code":-4028,"msg":"Leverage 125 is not valid"}"#);
        assert!(matches!(e, ExchangeError::InvalidLeverage { .. }));

        let e = ExchangeError::from_api(400, r#"{"code":-4046,"msg":"No need to change margin type."}"#);
        assert!(matches!(e, ExchangeError::NoChangeNeeded { .. }));
    }

    #[test]
    fn unknown_code_and_garbage_body() {
        let e = ExchangeError::from_api(400, r#"{"code":-1121,"msg":"Invalid symbol."}"#);
        assert!(matches!(e, ExchangeError::Api { code: -1121, status: 400, .. }));

        let e = ExchangeError::from_api(502, "<html>bad gateway</html>");
        assert!(matches!(e, ExchangeError::Api { code: 0, .. }));
    }

    #[test]
    fn filter_errors_convert_into_execution_errors() {
        let e: ExecutionError = FilterError::NoTickSize.into();
        assert!(matches!(e, ExecutionError::Exchange(ExchangeError::Filter(FilterError::NoTickSize))));
    }

    #[test]
    fn recv_window_rejection_is_clock_skew() {
        let e = ExchangeError::from_api(400, r#"{"code":-1021,"msg":"Timestamp for this request was 1000ms ahead of the server's time."}"#);
        assert!(e.is_clock_skew());
        assert!(!ExchangeError::from_api(400, r#"{"code":-1121,"msg":"Invalid symbol."}"#).is_clock_skew());
    }

    #[test]
    fn rate_limit_is_transient() {
        let e = ExchangeError::from_api(429, "");
        assert!(e.is_transient());
        assert!(!ExchangeError::UnknownSymbol("X".into()).is_transient());
    }
}
