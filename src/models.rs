//! Core data model: instruments, active sets, and the wire records
//! emitted to the append-only logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wire schema version stamped on every emitted record. New optional fields
/// may be added without bumping; renaming or removing a required field
/// requires a new version.
pub const SCHEMA_VERSION: u32 = 1;

/// A single pollable order-book stream at a venue.
///
/// Produced by discovery, consumed read-only by the poller. The key
/// `venue:poll_key` is globally unique and stable across discovery runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub venue: String,
    /// Opaque venue-native identifier used to fetch the order book.
    pub poll_key: String,
    /// Venue-native grouping of related instruments.
    pub market_id: String,
    /// Expiration in epoch milliseconds, UTC. Required; instruments past
    /// expiration are dropped at discovery time.
    pub expiration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub underlying: Option<String>,
    /// Provenance tag: which discovery rule produced this instrument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// Small venue-specific bag; kept bounded by the venue clients.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Instrument {
    pub fn instrument_key(&self) -> String {
        format!("{}:{}", self.venue, self.poll_key)
    }
}

/// The set of instruments a venue's poller should be fetching, totally
/// replaced by each discovery run (never merged).
///
/// Instruments are keyed by `instrument_key` in a `BTreeMap` so iteration
/// order is deterministic for a given snapshot, which is what makes fetch
/// dispatch order reproducible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSet {
    pub asof_ts_utc: DateTime<Utc>,
    pub venue: String,
    pub count: usize,
    pub instruments: BTreeMap<String, Instrument>,
}

impl ActiveSet {
    pub fn empty(venue: &str) -> Self {
        Self {
            asof_ts_utc: Utc::now(),
            venue: venue.to_string(),
            count: 0,
            instruments: BTreeMap::new(),
        }
    }
}

/// One price level of an order book side. Prices and sizes stay as the
/// venue-reported decimal strings; downstream readers decide precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: String,
    pub size: String,
}

/// One order-book observation, appended to the orderbooks log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookRecord {
    pub record_type: String,
    /// Missing on legacy records; readers treat absent as 0 (best effort).
    #[serde(default)]
    pub schema_version: u32,
    pub venue: String,
    pub poll_key: String,
    pub instrument_id: String,
    /// Collector capture time: wall clock at fetch start, epoch ms UTC.
    pub ts_ms: i64,
    /// Venue-reported "as of" time, when the venue provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ob_ts_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bids: Option<Vec<PriceLevel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asks: Option<Vec<PriceLevel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_ask: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl OrderbookRecord {
    pub fn new(venue: &str, poll_key: &str, ts_ms: i64) -> Self {
        Self {
            record_type: "orderbook".to_string(),
            schema_version: SCHEMA_VERSION,
            venue: venue.to_string(),
            poll_key: poll_key.to_string(),
            instrument_id: format!("{}:{}", venue, poll_key),
            ts_ms,
            ob_ts_ms: None,
            bids: None,
            asks: None,
            best_bid: None,
            best_ask: None,
            mid: None,
            spread: None,
            raw: None,
        }
    }

    /// Fill best/mid/spread from the top of already-sorted sides
    /// (bids descending, asks ascending).
    pub fn derive_top_of_book(&mut self) {
        let top = |levels: &Option<Vec<PriceLevel>>| {
            levels
                .as_ref()
                .and_then(|ls| ls.first())
                .and_then(|l| l.price.parse::<f64>().ok())
        };
        self.best_bid = top(&self.bids);
        self.best_ask = top(&self.asks);
        if let (Some(bb), Some(ba)) = (self.best_bid, self.best_ask) {
            self.mid = Some((bb + ba) / 2.0);
            self.spread = Some(ba - bb);
        }
    }
}

/// Membership/metadata change record, appended to the markets log when an
/// instrument is added or modified. Removals are not logged; they are
/// derivable from absence in a later snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRecord {
    pub record_type: String,
    #[serde(default)]
    pub schema_version: u32,
    pub venue: String,
    pub poll_key: String,
    pub instrument_id: String,
    pub ts_ms: i64,
    pub market_id: String,
    pub expiration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub underlying: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl MarketRecord {
    pub fn from_instrument(inst: &Instrument, ts_ms: i64) -> Self {
        Self {
            record_type: "market".to_string(),
            schema_version: SCHEMA_VERSION,
            venue: inst.venue.clone(),
            poll_key: inst.poll_key.clone(),
            instrument_id: inst.instrument_key(),
            ts_ms,
            market_id: inst.market_id.clone(),
            expiration_ms: inst.expiration_ms,
            slug: inst.slug.clone(),
            title: inst.title.clone(),
            outcome: inst.outcome.clone(),
            underlying: inst.underlying.clone(),
            rule: inst.rule.clone(),
            extra: inst.extra.clone(),
        }
    }
}
