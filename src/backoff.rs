//! Per-instrument exponential backoff.
//!
//! Deadlines are monotonic (`Instant`) so wall-clock adjustments never skip
//! or delay polls. Entries exist only while an instrument is failing; a
//! success deletes the entry, and entries for keys that left the ActiveSet
//! are garbage-collected each tick.

use crate::config::BackoffConfig;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct BackoffEntry {
    pub next_eligible_at: Instant,
    pub consecutive_failures: u32,
}

pub struct BackoffTracker {
    cfg: BackoffConfig,
    entries: HashMap<String, BackoffEntry>,
}

impl BackoffTracker {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self {
            cfg,
            entries: HashMap::new(),
        }
    }

    /// `delay = min(base * 2^(n-1), cap) * uniform(1 - jitter, 1 + jitter)`
    fn delay_for(&self, consecutive_failures: u32, rng: &mut impl Rng) -> Duration {
        let n = consecutive_failures.max(1);
        let base = self.cfg.base.as_secs_f64();
        let exp = base * 2f64.powi(n as i32 - 1);
        let capped = exp.min(self.cfg.cap.as_secs_f64());
        let jitter = self.cfg.jitter_frac;
        let scale = rng.gen_range(1.0 - jitter..=1.0 + jitter);
        Duration::from_secs_f64(capped * scale)
    }

    /// Record one failure and advance the eligibility deadline. Returns the
    /// updated failure count.
    pub fn record_failure(&mut self, key: &str, now: Instant) -> u32 {
        let mut rng = rand::thread_rng();
        let n = self
            .entries
            .get(key)
            .map(|e| e.consecutive_failures + 1)
            .unwrap_or(1);
        let delay = self.delay_for(n, &mut rng);
        self.entries.insert(
            key.to_string(),
            BackoffEntry {
                next_eligible_at: now + delay,
                consecutive_failures: n,
            },
        );
        n
    }

    /// A success deletes the entry (equivalent to n = 0).
    pub fn record_success(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn is_eligible(&self, key: &str, now: Instant) -> bool {
        match self.entries.get(key) {
            Some(e) => now >= e.next_eligible_at,
            None => true,
        }
    }

    pub fn get(&self, key: &str) -> Option<&BackoffEntry> {
        self.entries.get(key)
    }

    /// Drop entries whose instruments left the ActiveSet.
    pub fn retain_keys<F: Fn(&str) -> bool>(&mut self, live: F) {
        self.entries.retain(|k, _| live(k));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
