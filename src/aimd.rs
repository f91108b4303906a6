//! Per-venue AIMD congestion control over the inflight fetch limit.
//!
//! Single control variable: `inflight_limit` in `[1, ceiling]`. Any 429
//! halves the limit and puts the whole venue on cooldown; sustained failure
//! rate or high p95 latency decrement it; a stretch of clean, fast traffic
//! earns one additive step back toward the ceiling. Purely reactive, no
//! state across restarts.

use crate::config::AimdConfig;
use crate::venues::FetchErrorKind;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// What `evaluate` did this tick, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AimdAdjustment {
    /// 429 observed: limit halved, venue cooling down.
    Halved,
    /// Failure rate crossed the threshold.
    DecreasedOnFailures,
    /// p95 latency crossed the threshold.
    DecreasedOnLatency,
    /// Stability window earned one additive step.
    Increased,
}

pub struct AimdController {
    cfg: AimdConfig,
    ceiling: usize,
    limit: usize,
    cooldown_until: Option<Instant>,
    /// Outcome counts since the stability window last reset.
    window_successes: u64,
    window_failures: u64,
    /// 429 observations in the current tick, cleared by `evaluate`.
    tick_429: u32,
    stable_since: Instant,
    last_adjust: Instant,
    latencies: VecDeque<(Instant, u64)>,
}

impl AimdController {
    pub fn new(cfg: AimdConfig, ceiling: usize, initial: usize, now: Instant) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            cfg,
            ceiling,
            limit: initial.clamp(1, ceiling),
            cooldown_until: None,
            window_successes: 0,
            window_failures: 0,
            tick_429: 0,
            stable_since: now,
            last_adjust: now,
            latencies: VecDeque::new(),
        }
    }

    pub fn inflight_limit(&self) -> usize {
        self.limit
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.map_or(false, |until| now < until)
    }

    pub fn cooldown_remaining(&self, now: Instant) -> Duration {
        self.cooldown_until
            .and_then(|until| until.checked_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    pub fn record_success(&mut self, latency_ms: u64, now: Instant) {
        self.window_successes += 1;
        self.push_latency(latency_ms, now);
    }

    pub fn record_failure(&mut self, kind: FetchErrorKind, latency_ms: u64, now: Instant) {
        self.window_failures += 1;
        if kind == FetchErrorKind::Http429 {
            self.tick_429 += 1;
        }
        self.push_latency(latency_ms, now);
    }

    fn push_latency(&mut self, latency_ms: u64, now: Instant) {
        self.latencies.push_back((now, latency_ms));
        self.prune_latencies(now);
    }

    fn prune_latencies(&mut self, now: Instant) {
        let horizon = self.cfg.latency_window;
        while let Some(&(t, _)) = self.latencies.front() {
            if now.duration_since(t) > horizon || self.latencies.len() > self.cfg.latency_samples {
                self.latencies.pop_front();
            } else {
                break;
            }
        }
    }

    fn percentile_ms(&self, p: f64) -> Option<u64> {
        if self.latencies.is_empty() {
            return None;
        }
        let mut samples: Vec<u64> = self.latencies.iter().map(|&(_, ms)| ms).collect();
        samples.sort_unstable();
        let rank = (p / 100.0 * (samples.len() - 1) as f64).round() as usize;
        Some(samples[rank.min(samples.len() - 1)])
    }

    pub fn p50_latency_ms(&self) -> Option<u64> {
        self.percentile_ms(50.0)
    }

    pub fn p95_latency_ms(&self) -> Option<u64> {
        self.percentile_ms(95.0)
    }

    fn fail_rate(&self) -> f64 {
        let attempts = self.window_successes + self.window_failures;
        if attempts == 0 {
            return 0.0;
        }
        self.window_failures as f64 / attempts as f64
    }

    fn reset_window(&mut self, now: Instant) {
        self.window_successes = 0;
        self.window_failures = 0;
        self.stable_since = now;
    }

    /// Apply the control rules once per tick, after result processing.
    pub fn evaluate(&mut self, now: Instant) -> Option<AimdAdjustment> {
        self.prune_latencies(now);
        let had_429 = self.tick_429 > 0;
        self.tick_429 = 0;

        if had_429 {
            self.limit = (self.limit / 2).max(1);
            self.cooldown_until = Some(now + self.cfg.cooldown_on_429);
            self.reset_window(now);
            self.last_adjust = now;
            return Some(AimdAdjustment::Halved);
        }

        let fail_rate = self.fail_rate();
        let attempts = self.window_successes + self.window_failures;
        if attempts > 0 && fail_rate >= self.cfg.high_fail {
            self.limit = self.limit.saturating_sub(1).max(1);
            self.reset_window(now);
            self.last_adjust = now;
            return Some(AimdAdjustment::DecreasedOnFailures);
        }

        let p95 = self.percentile_ms(95.0);
        if p95.map_or(false, |p| p >= self.cfg.high_latency_ms) {
            self.limit = self.limit.saturating_sub(1).max(1);
            self.reset_window(now);
            self.last_adjust = now;
            return Some(AimdAdjustment::DecreasedOnLatency);
        }

        let stable = now.duration_since(self.stable_since) >= self.cfg.stable_after
            && fail_rate < self.cfg.high_fail / 2.0
            && p95.map_or(true, |p| p < self.cfg.low_latency_ms)
            && now.duration_since(self.last_adjust) >= self.cfg.min_adjust_interval;
        if stable && self.limit < self.ceiling {
            self.limit += 1;
            self.last_adjust = now;
            return Some(AimdAdjustment::Increased);
        }

        None
    }
}
