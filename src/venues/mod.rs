//! Venue integration seam: the client capability set each venue implements
//! (discover, fetch, normalize) plus the categorized fetch-error taxonomy
//! that drives backoff and AIMD.

pub mod kalshi;
pub mod polymarket;
#[cfg(test)]
pub mod mock; // Scriptable venue for scheduler/discovery tests

use crate::config::{Config, VenueConfig};
use crate::models::{Instrument, OrderbookRecord};
use anyhow::Result;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Raw order-book payload as returned by a venue, before normalization.
#[derive(Debug, Clone)]
pub struct RawBook {
    pub payload: serde_json::Value,
    /// Venue-reported "as of" time, when present in the payload.
    pub ob_ts_ms: Option<i64>,
}

/// Fetch failure categories. The scheduler keys its reactions off these:
/// 429 feeds the AIMD halving path, everything else advances per-instrument
/// backoff and the telemetry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Http4xx(u16),
    Http429,
    Http5xx(u16),
    Timeout,
    Network,
    Parse,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::Http4xx(_) => "http_4xx",
            FetchErrorKind::Http429 => "http_429",
            FetchErrorKind::Http5xx(_) => "http_5xx",
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::Network => "network",
            FetchErrorKind::Parse => "parse",
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            FetchErrorKind::Http4xx(s) | FetchErrorKind::Http5xx(s) => Some(*s),
            FetchErrorKind::Http429 => Some(429),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Parse, message)
    }

    /// Categorize a non-success HTTP status.
    pub fn from_status(status: StatusCode, body: String) -> Self {
        let kind = if status == StatusCode::TOO_MANY_REQUESTS {
            FetchErrorKind::Http429
        } else if status.is_client_error() {
            FetchErrorKind::Http4xx(status.as_u16())
        } else {
            FetchErrorKind::Http5xx(status.as_u16())
        };
        Self::new(kind, format!("HTTP {}: {}", status, body))
    }

    /// Categorize a transport-level reqwest failure.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FetchErrorKind::Timeout
        } else if err.is_decode() {
            FetchErrorKind::Parse
        } else {
            FetchErrorKind::Network
        };
        Self::new(kind, err.to_string())
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for FetchError {}

/// The per-venue capability set. Implementations must be callable from
/// multiple worker threads; every caller passes its own HTTP client, so a
/// venue client carries no connection state of its own.
pub trait VenueClient: Send + Sync {
    fn venue(&self) -> &str;

    /// Full re-listing of pollable instruments. Filter `rules` are opaque
    /// to the core; each venue interprets its own.
    fn discover(&self, http: &Client, rules: &serde_json::Value) -> Result<Vec<Instrument>>;

    /// One order-book fetch for one instrument.
    fn fetch_orderbook(&self, http: &Client, poll_key: &str) -> Result<RawBook, FetchError>;

    /// Pure translation of a raw payload into the wire record. Failures are
    /// treated as fetch failures by the scheduler.
    fn normalize(
        &self,
        raw: &RawBook,
        poll_key: &str,
        ts_ms: i64,
    ) -> Result<OrderbookRecord, FetchError>;
}

/// A venue client bundled with its per-venue runtime configuration.
pub struct VenueRuntime {
    pub config: VenueConfig,
    pub client: Arc<dyn VenueClient>,
}

/// Resolve the compiled-in venue set against the configured venues.
pub fn builtin_venues(cfg: &Config) -> Result<Vec<VenueRuntime>> {
    cfg.venues
        .iter()
        .map(|vc| {
            let client: Arc<dyn VenueClient> = match vc.venue.as_str() {
                "polymarket" => Arc::new(polymarket::PolymarketClient::new()),
                "kalshi" => Arc::new(kalshi::KalshiClient::new()),
                other => anyhow::bail!("unknown venue {:?} in configuration", other),
            };
            Ok(VenueRuntime {
                config: vc.clone(),
                client,
            })
        })
        .collect()
}

/// Shared builder for the per-worker (and per-discovery-thread) blocking
/// HTTP client. Each caller gets an isolated connection pool.
pub fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .user_agent("bookhound/0.1 (orderbook collector)")
        .build()
        .map_err(Into::into)
}
