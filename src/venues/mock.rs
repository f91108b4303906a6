//! Scriptable in-memory venue for tests: no sockets, deterministic
//! discovery output, per-key scripted fetch outcomes.

use super::{FetchError, FetchErrorKind, RawBook, VenueClient};
use crate::models::{Instrument, OrderbookRecord, PriceLevel};
use anyhow::Result;
use parking_lot::Mutex;
use reqwest::blocking::Client;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::thread;
use std::time::Duration;

/// What the next fetch for a key should do. Keys with an empty script fall
/// back to a default healthy book.
#[derive(Debug, Clone)]
pub enum MockFetch {
    Book { bid: &'static str, ask: &'static str },
    Fail(FetchErrorKind),
}

pub struct MockVenue {
    venue: &'static str,
    instruments: Mutex<Vec<Instrument>>,
    scripts: Mutex<HashMap<String, VecDeque<MockFetch>>>,
    fetch_counts: Mutex<HashMap<String, u64>>,
    fetch_delay: Mutex<Duration>,
    discover_error: Mutex<bool>,
}

impl MockVenue {
    pub fn new(venue: &'static str) -> Self {
        Self {
            venue,
            instruments: Mutex::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
            fetch_counts: Mutex::new(HashMap::new()),
            fetch_delay: Mutex::new(Duration::ZERO),
            discover_error: Mutex::new(false),
        }
    }

    pub fn instrument(&self, poll_key: &str, market_id: &str, expiration_ms: i64) -> Instrument {
        Instrument {
            venue: self.venue.to_string(),
            poll_key: poll_key.to_string(),
            market_id: market_id.to_string(),
            expiration_ms,
            slug: Some(format!("{}-slug", poll_key)),
            title: None,
            outcome: None,
            underlying: None,
            rule: Some("mock".to_string()),
            extra: BTreeMap::new(),
        }
    }

    pub fn set_instruments(&self, instruments: Vec<Instrument>) {
        *self.instruments.lock() = instruments;
    }

    pub fn set_discover_error(&self, fail: bool) {
        *self.discover_error.lock() = fail;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    /// Queue an outcome for the next fetch of `poll_key`.
    pub fn push_fetch(&self, poll_key: &str, outcome: MockFetch) {
        self.scripts
            .lock()
            .entry(poll_key.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn fetch_count(&self, poll_key: &str) -> u64 {
        self.fetch_counts.lock().get(poll_key).copied().unwrap_or(0)
    }
}

impl VenueClient for MockVenue {
    fn venue(&self) -> &str {
        self.venue
    }

    fn discover(&self, _http: &Client, _rules: &serde_json::Value) -> Result<Vec<Instrument>> {
        if *self.discover_error.lock() {
            anyhow::bail!("scripted discovery failure");
        }
        Ok(self.instruments.lock().clone())
    }

    fn fetch_orderbook(&self, _http: &Client, poll_key: &str) -> Result<RawBook, FetchError> {
        let delay = *self.fetch_delay.lock();
        if delay > Duration::ZERO {
            thread::sleep(delay);
        }
        *self
            .fetch_counts
            .lock()
            .entry(poll_key.to_string())
            .or_default() += 1;

        let scripted = self.scripts.lock().get_mut(poll_key).and_then(|q| q.pop_front());
        match scripted.unwrap_or(MockFetch::Book { bid: "0.5", ask: "0.6" }) {
            MockFetch::Book { bid, ask } => Ok(RawBook {
                payload: json!({
                    "bids": [{"price": bid, "size": "10"}],
                    "asks": [{"price": ask, "size": "8"}]
                }),
                ob_ts_ms: None,
            }),
            MockFetch::Fail(kind) => Err(FetchError::new(kind, "scripted failure")),
        }
    }

    fn normalize(
        &self,
        raw: &RawBook,
        poll_key: &str,
        ts_ms: i64,
    ) -> Result<OrderbookRecord, FetchError> {
        let side = |name: &str| -> Result<Vec<PriceLevel>, FetchError> {
            serde_json::from_value(raw.payload.get(name).cloned().unwrap_or(json!([])))
                .map_err(|e| FetchError::parse(e.to_string()))
        };
        let mut rec = OrderbookRecord::new(self.venue, poll_key, ts_ms);
        rec.bids = Some(side("bids")?);
        rec.asks = Some(side("asks")?);
        rec.derive_top_of_book();
        Ok(rec)
    }
}
