//! Polymarket CLOB venue client: single order book per outcome token.
//!
//! Discovery pages the CLOB `/markets` endpoint and emits one instrument
//! per outcome token of each market that passes the filter rules. Order
//! books come from `GET /book?token_id=...` as decimal-string levels.

use super::{FetchError, RawBook, VenueClient};
use crate::models::{Instrument, OrderbookRecord, PriceLevel};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const CLOB_API_BASE: &str = "https://clob.polymarket.com";
const VENUE: &str = "polymarket";

/// The CLOB paginates with an opaque cursor; this sentinel marks the end.
const END_CURSOR: &str = "LTE=";
const MAX_DISCOVERY_PAGES: usize = 200;

#[derive(Debug, Deserialize)]
struct ClobMarketsPage {
    #[serde(default)]
    data: Vec<ClobMarket>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClobMarket {
    condition_id: String,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    market_slug: Option<String>,
    #[serde(default)]
    end_date_iso: Option<String>,
    #[serde(default)]
    accepting_orders: bool,
    #[serde(default)]
    closed: bool,
    #[serde(default)]
    tokens: Vec<ClobToken>,
}

#[derive(Debug, Deserialize)]
struct ClobToken {
    #[serde(default)]
    token_id: String,
    #[serde(default)]
    outcome: Option<String>,
}

pub struct PolymarketClient {
    base_url: String,
}

impl PolymarketClient {
    pub fn new() -> Self {
        Self {
            base_url: CLOB_API_BASE.to_string(),
        }
    }

    fn markets_to_instruments(
        &self,
        markets: Vec<ClobMarket>,
        rules: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Vec<Instrument> {
        let accepting_only = rules
            .get("accepting_orders_only")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let max_days = rules.get("max_days_to_expiry").and_then(|v| v.as_i64());
        let slug_contains = rules.get("slug_contains").and_then(|v| v.as_str());

        let mut out = Vec::new();
        for market in markets {
            if market.closed {
                continue;
            }
            if accepting_only && !market.accepting_orders {
                continue;
            }
            if let (Some(needle), Some(slug)) = (slug_contains, market.market_slug.as_deref()) {
                if !slug.contains(needle) {
                    continue;
                }
            }
            let Some(expiration_ms) = market
                .end_date_iso
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.timestamp_millis())
            else {
                // No usable expiration: not pollable under the contract.
                debug!(market = %market.condition_id, "skipping market without end date");
                continue;
            };
            if let Some(days) = max_days {
                let horizon_ms = now.timestamp_millis() + days * 86_400_000;
                if expiration_ms > horizon_ms {
                    continue;
                }
            }
            for token in market.tokens {
                if token.token_id.is_empty() {
                    continue;
                }
                out.push(Instrument {
                    venue: VENUE.to_string(),
                    poll_key: token.token_id,
                    market_id: market.condition_id.clone(),
                    expiration_ms,
                    slug: market.market_slug.clone(),
                    title: market.question.clone(),
                    outcome: token.outcome.clone(),
                    underlying: None,
                    rule: Some("clob_markets".to_string()),
                    extra: BTreeMap::new(),
                });
            }
        }
        out
    }
}

impl VenueClient for PolymarketClient {
    fn venue(&self) -> &str {
        VENUE
    }

    fn discover(&self, http: &Client, rules: &serde_json::Value) -> Result<Vec<Instrument>> {
        let url = format!("{}/markets", self.base_url);
        let now = Utc::now();
        let mut instruments = Vec::new();
        let mut cursor: Option<String> = None;

        for _page in 0..MAX_DISCOVERY_PAGES {
            let mut req = http.get(&url);
            if let Some(c) = &cursor {
                req = req.query(&[("next_cursor", c.as_str())]);
            }
            let resp = req.send().context("GET /markets failed")?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().unwrap_or_default();
                anyhow::bail!("GET /markets {}: {}", status, text);
            }
            let page: ClobMarketsPage =
                resp.json().context("failed to parse markets page")?;

            let page_len = page.data.len();
            instruments.extend(self.markets_to_instruments(page.data, rules, now));

            cursor = page
                .next_cursor
                .filter(|c| !c.is_empty() && c.as_str() != END_CURSOR);
            if cursor.is_none() || page_len == 0 {
                break;
            }
        }
        if cursor.is_some() {
            warn!("markets pagination stopped at page cap; discovery may be partial");
        }

        info!(count = instruments.len(), "polymarket discovery complete");
        Ok(instruments)
    }

    fn fetch_orderbook(&self, http: &Client, poll_key: &str) -> Result<RawBook, FetchError> {
        let url = format!("{}/book", self.base_url);
        let resp = http
            .get(&url)
            .query(&[("token_id", poll_key)])
            .send()
            .map_err(FetchError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(FetchError::from_status(status, body));
        }

        let payload: serde_json::Value = resp.json().map_err(FetchError::from_reqwest)?;
        // The book's timestamp arrives as a millisecond string.
        let ob_ts_ms = match payload.get("timestamp") {
            Some(serde_json::Value::String(s)) => s.parse::<i64>().ok(),
            Some(v) => v.as_i64(),
            None => None,
        };
        Ok(RawBook { payload, ob_ts_ms })
    }

    fn normalize(
        &self,
        raw: &RawBook,
        poll_key: &str,
        ts_ms: i64,
    ) -> Result<OrderbookRecord, FetchError> {
        let side = |name: &str| -> Result<Vec<PriceLevel>, FetchError> {
            match raw.payload.get(name) {
                Some(v) => serde_json::from_value(v.clone())
                    .map_err(|e| FetchError::parse(format!("bad {} side: {}", name, e))),
                None => Ok(Vec::new()),
            }
        };
        let mut bids = side("bids")?;
        let mut asks = side("asks")?;

        // The venue does not guarantee level order; sort to book convention.
        let px = |l: &PriceLevel| l.price.parse::<f64>().unwrap_or(f64::NAN);
        bids.sort_by(|a, b| px(b).partial_cmp(&px(a)).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| px(a).partial_cmp(&px(b)).unwrap_or(std::cmp::Ordering::Equal));

        let mut rec = OrderbookRecord::new(VENUE, poll_key, ts_ms);
        rec.ob_ts_ms = raw.ob_ts_ms;
        rec.bids = Some(bids);
        rec.asks = Some(asks);
        rec.derive_top_of_book();
        Ok(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> PolymarketClient {
        PolymarketClient::new()
    }

    #[test]
    fn normalize_sorts_sides_and_derives_top() {
        let raw = RawBook {
            payload: json!({
                "market": "0xcond",
                "asset_id": "tok1",
                "timestamp": "1700000000123",
                "bids": [
                    {"price": "0.40", "size": "25"},
                    {"price": "0.50", "size": "10"}
                ],
                "asks": [
                    {"price": "0.70", "size": "5"},
                    {"price": "0.60", "size": "8"}
                ]
            }),
            ob_ts_ms: Some(1_700_000_000_123),
        };
        let rec = client().normalize(&raw, "tok1", 42).unwrap();
        assert_eq!(rec.venue, "polymarket");
        assert_eq!(rec.instrument_id, "polymarket:tok1");
        assert_eq!(rec.ts_ms, 42);
        assert_eq!(rec.ob_ts_ms, Some(1_700_000_000_123));
        assert_eq!(rec.bids.as_ref().unwrap()[0].price, "0.50");
        assert_eq!(rec.asks.as_ref().unwrap()[0].price, "0.60");
        assert_eq!(rec.best_bid, Some(0.5));
        assert_eq!(rec.best_ask, Some(0.6));
        assert!((rec.spread.unwrap() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn normalize_rejects_malformed_side() {
        let raw = RawBook {
            payload: json!({"bids": "not an array", "asks": []}),
            ob_ts_ms: None,
        };
        let err = client().normalize(&raw, "tok1", 1).unwrap_err();
        assert_eq!(err.kind, super::super::FetchErrorKind::Parse);
    }

    #[test]
    fn discovery_filter_applies_rules() {
        let markets = vec![
            ClobMarket {
                condition_id: "0xaaa".into(),
                question: Some("Will it rain?".into()),
                market_slug: Some("will-it-rain".into()),
                end_date_iso: Some("2030-01-01T00:00:00Z".into()),
                accepting_orders: true,
                closed: false,
                tokens: vec![
                    ClobToken { token_id: "t-yes".into(), outcome: Some("Yes".into()) },
                    ClobToken { token_id: "t-no".into(), outcome: Some("No".into()) },
                ],
            },
            // Closed: dropped.
            ClobMarket {
                condition_id: "0xbbb".into(),
                question: None,
                market_slug: None,
                end_date_iso: Some("2030-01-01T00:00:00Z".into()),
                accepting_orders: true,
                closed: true,
                tokens: vec![ClobToken { token_id: "t-x".into(), outcome: None }],
            },
            // Not accepting orders: dropped under accepting_orders_only.
            ClobMarket {
                condition_id: "0xccc".into(),
                question: None,
                market_slug: None,
                end_date_iso: Some("2030-01-01T00:00:00Z".into()),
                accepting_orders: false,
                closed: false,
                tokens: vec![ClobToken { token_id: "t-y".into(), outcome: None }],
            },
            // No end date: not pollable.
            ClobMarket {
                condition_id: "0xddd".into(),
                question: None,
                market_slug: None,
                end_date_iso: None,
                accepting_orders: true,
                closed: false,
                tokens: vec![ClobToken { token_id: "t-z".into(), outcome: None }],
            },
        ];
        let rules = json!({"accepting_orders_only": true});
        let out = client().markets_to_instruments(markets, &rules, Utc::now());
        let keys: Vec<String> = out.iter().map(|i| i.instrument_key()).collect();
        assert_eq!(keys, vec!["polymarket:t-yes", "polymarket:t-no"]);
        assert_eq!(out[0].market_id, "0xaaa");
        assert_eq!(out[0].outcome.as_deref(), Some("Yes"));
        assert_eq!(out[0].rule.as_deref(), Some("clob_markets"));
    }

    #[test]
    fn discovery_horizon_drops_far_expiries() {
        let markets = vec![ClobMarket {
            condition_id: "0xaaa".into(),
            question: None,
            market_slug: None,
            end_date_iso: Some("2031-01-01T00:00:00Z".into()),
            accepting_orders: true,
            closed: false,
            tokens: vec![ClobToken { token_id: "t1".into(), outcome: None }],
        }];
        let rules = json!({"max_days_to_expiry": 30});
        let out = client().markets_to_instruments(markets, &rules, Utc::now());
        assert!(out.is_empty());
    }
}
