//! Kalshi venue client: dual-book YES/NO markets.
//!
//! One instrument per market ticker. A single orderbook fetch returns both
//! the YES and NO books in cents; normalization folds them into one book in
//! YES terms, deriving asks from the complement of the NO bids
//! (`ask = 1 - no_price`).

use super::{FetchError, RawBook, VenueClient};
use crate::models::{Instrument, OrderbookRecord, PriceLevel};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

const KALSHI_API_BASE: &str = "https://api.elections.kalshi.com/trade-api/v2";
const VENUE: &str = "kalshi";

const PAGE_LIMIT: u32 = 200;
const MAX_DISCOVERY_PAGES: usize = 200;

#[derive(Debug, Deserialize)]
struct MarketsPage {
    #[serde(default)]
    markets: Vec<KalshiMarket>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KalshiMarket {
    ticker: String,
    #[serde(default)]
    event_ticker: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    close_time: Option<String>,
}

pub struct KalshiClient {
    base_url: String,
}

impl KalshiClient {
    pub fn new() -> Self {
        Self {
            base_url: KALSHI_API_BASE.to_string(),
        }
    }

    fn markets_to_instruments(
        &self,
        markets: Vec<KalshiMarket>,
        rules: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Vec<Instrument> {
        let max_days = rules.get("max_days_to_expiry").and_then(|v| v.as_i64());
        let ticker_prefix = rules.get("ticker_prefix").and_then(|v| v.as_str());

        let mut out = Vec::new();
        for market in markets {
            if let Some(prefix) = ticker_prefix {
                if !market.ticker.starts_with(prefix) {
                    continue;
                }
            }
            let Some(expiration_ms) = market
                .close_time
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.timestamp_millis())
            else {
                debug!(ticker = %market.ticker, "skipping market without close time");
                continue;
            };
            if let Some(days) = max_days {
                let horizon_ms = now.timestamp_millis() + days * 86_400_000;
                if expiration_ms > horizon_ms {
                    continue;
                }
            }
            out.push(Instrument {
                venue: VENUE.to_string(),
                market_id: market
                    .event_ticker
                    .clone()
                    .unwrap_or_else(|| market.ticker.clone()),
                poll_key: market.ticker,
                expiration_ms,
                slug: None,
                title: market.title,
                outcome: Some("YES".to_string()),
                underlying: None,
                rule: Some("markets_open".to_string()),
                extra: BTreeMap::new(),
            });
        }
        out
    }
}

/// `[cents, contracts]` pairs as Kalshi reports book levels.
fn levels(payload: &serde_json::Value, side: &str) -> Result<Vec<(i64, i64)>, FetchError> {
    let Some(raw) = payload.pointer(&format!("/orderbook/{}", side)) else {
        return Ok(Vec::new());
    };
    if raw.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(raw.clone())
        .map_err(|e| FetchError::parse(format!("bad {} side: {}", side, e)))
}

fn dollars(cents: i64) -> String {
    format!("{:.2}", cents as f64 / 100.0)
}

impl VenueClient for KalshiClient {
    fn venue(&self) -> &str {
        VENUE
    }

    fn discover(&self, http: &Client, rules: &serde_json::Value) -> Result<Vec<Instrument>> {
        let url = format!("{}/markets", self.base_url);
        let status = rules
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("open")
            .to_string();
        let now = Utc::now();
        let mut instruments = Vec::new();
        let mut cursor: Option<String> = None;

        for _page in 0..MAX_DISCOVERY_PAGES {
            let mut qp: Vec<(String, String)> = vec![
                ("limit".to_string(), PAGE_LIMIT.to_string()),
                ("status".to_string(), status.clone()),
            ];
            if let Some(c) = &cursor {
                qp.push(("cursor".to_string(), c.clone()));
            }
            let resp = http
                .get(&url)
                .query(&qp)
                .send()
                .context("GET /markets failed")?;
            if !resp.status().is_success() {
                let code = resp.status();
                let text = resp.text().unwrap_or_default();
                anyhow::bail!("GET /markets {}: {}", code, text);
            }
            let page: MarketsPage = resp.json().context("failed to parse markets page")?;

            let page_len = page.markets.len();
            instruments.extend(self.markets_to_instruments(page.markets, rules, now));

            cursor = page.cursor.filter(|c| !c.is_empty());
            if cursor.is_none() || page_len == 0 {
                break;
            }
        }

        info!(count = instruments.len(), "kalshi discovery complete");
        Ok(instruments)
    }

    fn fetch_orderbook(&self, http: &Client, poll_key: &str) -> Result<RawBook, FetchError> {
        let url = format!("{}/markets/{}/orderbook", self.base_url, poll_key);
        let resp = http.get(&url).send().map_err(FetchError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(FetchError::from_status(status, body));
        }

        let payload: serde_json::Value = resp.json().map_err(FetchError::from_reqwest)?;
        // Kalshi books carry no venue-side timestamp.
        Ok(RawBook {
            payload,
            ob_ts_ms: None,
        })
    }

    fn normalize(
        &self,
        raw: &RawBook,
        poll_key: &str,
        ts_ms: i64,
    ) -> Result<OrderbookRecord, FetchError> {
        let yes = levels(&raw.payload, "yes")?;
        let no = levels(&raw.payload, "no")?;

        // YES bids are the yes side as-is; YES asks are the complement of
        // the NO bids. Sort to book convention: bids descending, asks
        // ascending.
        let mut bids: Vec<PriceLevel> = yes
            .iter()
            .map(|&(cents, count)| PriceLevel {
                price: dollars(cents),
                size: count.to_string(),
            })
            .collect();
        let mut asks: Vec<PriceLevel> = no
            .iter()
            .map(|&(cents, count)| PriceLevel {
                price: dollars(100 - cents),
                size: count.to_string(),
            })
            .collect();
        let px = |l: &PriceLevel| l.price.parse::<f64>().unwrap_or(f64::NAN);
        bids.sort_by(|a, b| px(b).partial_cmp(&px(a)).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| px(a).partial_cmp(&px(b)).unwrap_or(std::cmp::Ordering::Equal));

        let mut rec = OrderbookRecord::new(VENUE, poll_key, ts_ms);
        rec.bids = Some(bids);
        rec.asks = Some(asks);
        rec.derive_top_of_book();
        Ok(rec)
    }
}
