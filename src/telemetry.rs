//! Poller telemetry: rolling delta counters for poll_stats and the rate-
//! capped sampler for poll_errors. Diagnostic streams, not part of the
//! market-data contract.

use crate::venues::FetchErrorKind;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// One poll_stats line. Counters are deltas since the previous emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollStatsRecord {
    pub venue: String,
    pub ts_ms: i64,
    pub active_count: usize,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub http_4xx: u64,
    pub http_5xx: u64,
    pub http_429: u64,
    pub timeouts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p50_latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p95_latency_ms: Option<u64>,
    pub cooldown_remaining_ms: u64,
    pub inflight_limit: usize,
    pub max_workers: usize,
}

/// One sampled poll_errors line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollErrorRecord {
    pub venue: String,
    pub ts_ms: i64,
    pub instrument_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub latency_ms: u64,
    pub error_kind: String,
    pub message: String,
}

pub const ERROR_MESSAGE_MAX: usize = 256;

/// Truncate an error message to the wire cap without splitting a char.
pub fn truncate_message(msg: &str) -> String {
    if msg.len() <= ERROR_MESSAGE_MAX {
        return msg.to_string();
    }
    let mut end = ERROR_MESSAGE_MAX;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg[..end].to_string()
}

/// Delta counters accumulated between poll_stats emissions.
#[derive(Debug, Default, Clone)]
pub struct StatsWindow {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub http_4xx: u64,
    pub http_5xx: u64,
    pub http_429: u64,
    pub timeouts: u64,
}

impl StatsWindow {
    pub fn count_failure(&mut self, kind: FetchErrorKind) {
        self.failed += 1;
        match kind {
            FetchErrorKind::Http429 => self.http_429 += 1,
            FetchErrorKind::Http4xx(_) => self.http_4xx += 1,
            FetchErrorKind::Http5xx(_) => self.http_5xx += 1,
            FetchErrorKind::Timeout => self.timeouts += 1,
            FetchErrorKind::Network | FetchErrorKind::Parse => {}
        }
    }

    /// Hand out the accumulated deltas and reset for the next window.
    pub fn take(&mut self) -> StatsWindow {
        std::mem::take(self)
    }
}

/// Per-venue cap on poll_error emissions, sliding one-second windows.
pub struct ErrorSampler {
    cap_per_sec: u32,
    window_start: Instant,
    emitted: u32,
    pub suppressed: u64,
}

impl ErrorSampler {
    pub fn new(cap_per_sec: u32) -> Self {
        Self {
            cap_per_sec,
            window_start: Instant::now(),
            emitted: 0,
            suppressed: 0,
        }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start).as_secs() >= 1 {
            self.window_start = now;
            self.emitted = 0;
        }
        if self.emitted < self.cap_per_sec {
            self.emitted += 1;
            true
        } else {
            self.suppressed += 1;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn window_take_resets_counters() {
        let mut w = StatsWindow::default();
        w.submitted = 10;
        w.succeeded = 7;
        w.count_failure(FetchErrorKind::Timeout);
        w.count_failure(FetchErrorKind::Http429);
        w.count_failure(FetchErrorKind::Http4xx(404));

        let taken = w.take();
        assert_eq!(taken.submitted, 10);
        assert_eq!(taken.failed, 3);
        assert_eq!(taken.timeouts, 1);
        assert_eq!(taken.http_429, 1);
        assert_eq!(taken.http_4xx, 1);

        // Next window starts from zero.
        assert_eq!(w.submitted, 0);
        assert_eq!(w.failed, 0);
    }

    #[test]
    fn sampler_caps_within_a_second_and_recovers() {
        let mut sampler = ErrorSampler::new(3);
        let now = Instant::now();
        assert!(sampler.allow(now));
        assert!(sampler.allow(now));
        assert!(sampler.allow(now));
        assert!(!sampler.allow(now));
        assert_eq!(sampler.suppressed, 1);

        let later = now + Duration::from_millis(1100);
        assert!(sampler.allow(later));
    }

    #[test]
    fn messages_are_truncated_to_cap() {
        let long = "x".repeat(1000);
        assert_eq!(truncate_message(&long).len(), ERROR_MESSAGE_MAX);
        assert_eq!(truncate_message("short"), "short");
    }

    #[test]
    fn stats_record_serializes_with_omitted_percentiles() {
        let rec = PollStatsRecord {
            venue: "v1".into(),
            ts_ms: 1,
            active_count: 0,
            submitted: 0,
            succeeded: 0,
            failed: 0,
            http_4xx: 0,
            http_5xx: 0,
            http_429: 0,
            timeouts: 0,
            p50_latency_ms: None,
            p95_latency_ms: None,
            cooldown_remaining_ms: 0,
            inflight_limit: 4,
            max_workers: 16,
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(!json.contains("p50_latency_ms"));
        let back: PollStatsRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.inflight_limit, 4);
    }
}
