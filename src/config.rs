//! Process configuration.
//!
//! `OUTPUT_DIR` is the only environment-driven knob; everything else is
//! compiled-in per-venue configuration constructed at startup and passed
//! down explicitly. No process-wide mutable singletons.

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Flush/fsync policy for the rotating JSONL writers.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Flush + fsync at least this often while records are pending.
    pub fsync_interval: Duration,
    /// ... or after this many buffered records, whichever comes first.
    pub flush_records: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            fsync_interval: Duration::from_secs(1),
            flush_records: 256,
        }
    }
}

/// Per-instrument exponential backoff policy.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_frac: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            jitter_frac: 0.25,
        }
    }
}

/// Per-venue AIMD thresholds. These are knobs, not derived policy.
#[derive(Debug, Clone)]
pub struct AimdConfig {
    /// Venue-wide pause after any 429 observation.
    pub cooldown_on_429: Duration,
    /// Failure rate that triggers a gentle decrease.
    pub high_fail: f64,
    /// p95 latency that triggers a gentle decrease.
    pub high_latency_ms: u64,
    /// p95 latency below which the venue counts as healthy.
    pub low_latency_ms: u64,
    /// How long the venue must stay 429-free before growing the limit.
    pub stable_after: Duration,
    /// Minimum spacing between additive increases.
    pub min_adjust_interval: Duration,
    /// Rolling latency window: age bound and sample cap.
    pub latency_window: Duration,
    pub latency_samples: usize,
}

impl Default for AimdConfig {
    fn default() -> Self {
        Self {
            cooldown_on_429: Duration::from_secs(30),
            high_fail: 0.5,
            high_latency_ms: 2000,
            low_latency_ms: 500,
            stable_after: Duration::from_secs(60),
            min_adjust_interval: Duration::from_secs(30),
            latency_window: Duration::from_secs(30),
            latency_samples: 128,
        }
    }
}

/// Everything the runtime needs to know about one venue.
#[derive(Debug, Clone)]
pub struct VenueConfig {
    pub venue: String,
    /// Static worker pool size; the hard upper bound on parallel fetches.
    pub max_workers: usize,
    /// AIMD operating range for the inflight limit: [1, ceiling].
    pub inflight_ceiling: usize,
    pub initial_inflight: usize,
    pub request_timeout: Duration,
    pub backoff: BackoffConfig,
    pub aimd: AimdConfig,
    /// Cap on poll_error records emitted per second.
    pub error_samples_per_sec: u32,
    /// Opaque filter rules consumed by the venue client at discovery time.
    pub rules: serde_json::Value,
}

impl VenueConfig {
    fn polymarket() -> Self {
        Self {
            venue: "polymarket".to_string(),
            max_workers: 16,
            inflight_ceiling: 16,
            initial_inflight: 4,
            request_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
            aimd: AimdConfig::default(),
            error_samples_per_sec: 50,
            rules: serde_json::json!({
                "accepting_orders_only": true,
                "max_days_to_expiry": 45,
            }),
        }
    }

    fn kalshi() -> Self {
        Self {
            venue: "kalshi".to_string(),
            max_workers: 8,
            // Kalshi throttles hard; keep the ceiling low.
            inflight_ceiling: 4,
            initial_inflight: 2,
            request_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
            aimd: AimdConfig::default(),
            error_samples_per_sec: 50,
            rules: serde_json::json!({
                "status": "open",
                "max_days_to_expiry": 45,
            }),
        }
    }
}

/// Top-level configuration shared by both processes.
#[derive(Debug, Clone)]
pub struct Config {
    /// Filesystem root for snapshots and all append-only logs. Absolute.
    pub output_dir: PathBuf,
    pub discovery_interval: Duration,
    /// How often the poller re-checks the snapshot file for freshness.
    pub snapshot_refresh: Duration,
    /// Scheduler tick cadence.
    pub tick_interval: Duration,
    pub stats_interval: Duration,
    /// How long shutdown waits for inflight fetches before abandoning them.
    pub shutdown_grace: Duration,
    pub writer: WriterConfig,
    pub venues: Vec<VenueConfig>,
}

impl Config {
    pub fn new(output_dir: PathBuf) -> Result<Self> {
        if !output_dir.is_absolute() {
            bail!("OUTPUT_DIR must be an absolute path, got {:?}", output_dir);
        }
        Ok(Self {
            output_dir,
            discovery_interval: Duration::from_secs(60),
            snapshot_refresh: Duration::from_secs(1),
            tick_interval: Duration::from_secs(1),
            stats_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            writer: WriterConfig::default(),
            venues: vec![VenueConfig::polymarket(), VenueConfig::kalshi()],
        })
    }
}
