/// time_sync.rs — Binance server clock offset
///
/// Signed requests are rejected (-1021) when `timestamp` drifts outside
/// recvWindow of the server clock.  The offset is measured once at startup,
/// then refreshed by the bot every TIME_RESYNC_CYCLES cycles and after any
/// -1021 rejection.
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::info;

use crate::error::{ExchangeError, ExchangeResult};

#[derive(Deserialize)]
struct ServerTimeResponse {
    #[serde(rename = "serverTime")]
    server_time: i64,
}

/// Offset is atomic so a shared client can resync through `&self`.
#[derive(Debug, Default)]
pub struct TimeSync {
    offset_ms: AtomicI64,
}

impl TimeSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sync with Binance server time.
    pub async fn sync(&self, client: &Client, base_url: &str) -> ExchangeResult<i64> {
        let url = format!("{}/fapi/v1/time", base_url);

        // Measure round-trip time
        let local_before = Utc::now().timestamp_millis();
        let resp = client.get(&url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        let local_after = Utc::now().timestamp_millis();

        if !status.is_success() {
            return Err(ExchangeError::from_api(status.as_u16(), &body));
        }
        let response: ServerTimeResponse = serde_json::from_str(&body)?;

        // Offset = server_time − local time at the midpoint of the round trip
        let offset = offset_from(local_before, local_after, response.server_time);
        self.offset_ms.store(offset, Ordering::Relaxed);

        info!("⏰ Time sync: offset {}ms (rtt {}ms)", offset, local_after - local_before);
        Ok(offset)
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Server-synced timestamp in milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.offset_ms()
    }
}

fn offset_from(local_before: i64, local_after: i64, server_time: i64) -> i64 {
    let round_trip = local_after - local_before;
    server_time - (local_before + round_trip / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_uses_round_trip_midpoint() {
        // request left at 1000, came back at 1100, server said 1250
        assert_eq!(offset_from(1_000, 1_100, 1_250), 200);
        assert_eq!(offset_from(1_000, 1_000, 900), -100);
    }

    #[test]
    fn unsynced_clock_has_zero_offset() {
        let ts = TimeSync::new();
        assert_eq!(ts.offset_ms(), 0);
        let now = Utc::now().timestamp_millis();
        assert!((ts.timestamp_ms() - now).abs() < 1_000);
    }
}
