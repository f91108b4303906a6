//! Per-venue polling scheduler.
//!
//! One instance per venue, each on its own thread. All mutation of the
//! venue's state (ActiveSet cache, backoff, AIMD, log writers) happens on
//! that thread; the only cross-thread traffic is the job/result channels of
//! the worker pool. A cooldown or outage on one venue cannot touch another:
//! venues share nothing but the output root.

use crate::aimd::AimdController;
use crate::backoff::BackoffTracker;
use crate::config::{Config, VenueConfig};
use crate::discovery::sleep_interruptible;
use crate::jsonl::RotatingJsonlWriter;
use crate::models::ActiveSet;
use crate::snapshot::{snapshot_path, SnapshotError, SnapshotReader};
use crate::telemetry::{truncate_message, ErrorSampler, PollErrorRecord, PollStatsRecord, StatsWindow};
use crate::venues::{FetchError, VenueClient, VenueRuntime};
use crate::workers::{FetchJob, FetchOutcome, WorkerPool};
use anyhow::Result;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Consecutive failed ticks (write-path errors) before the venue gives up
/// and the process exits non-zero.
const MAX_WRITE_FAILURES: u32 = 10;

pub struct VenueScheduler {
    venue: String,
    vcfg: VenueConfig,
    tick_interval: Duration,
    snapshot_refresh: Duration,
    stats_interval: Duration,
    shutdown_grace: Duration,
    client: Arc<dyn VenueClient>,
    reader: SnapshotReader,
    active: ActiveSet,
    backoff: BackoffTracker,
    aimd: AimdController,
    pool: Option<WorkerPool>,
    /// Keys currently dispatched; a key re-enters the eligible set only
    /// after its result is processed, so no instrument is ever inflight
    /// twice.
    inflight: HashSet<String>,
    books_log: RotatingJsonlWriter,
    stats_log: RotatingJsonlWriter,
    errors_log: RotatingJsonlWriter,
    stats: StatsWindow,
    sampler: ErrorSampler,
    last_snapshot_poll: Option<Instant>,
    last_stats_emit: Instant,
    snapshot_missing_logged: bool,
}

impl VenueScheduler {
    pub fn new(cfg: &Config, runtime: VenueRuntime) -> Result<Self> {
        let vcfg = runtime.config;
        let venue = vcfg.venue.clone();
        let now = Instant::now();

        let pool = WorkerPool::spawn(
            &venue,
            vcfg.max_workers,
            vcfg.request_timeout,
            runtime.client.clone(),
        )?;

        Ok(Self {
            reader: SnapshotReader::new(snapshot_path(&cfg.output_dir, &venue)),
            active: ActiveSet::empty(&venue),
            backoff: BackoffTracker::new(vcfg.backoff.clone()),
            aimd: AimdController::new(
                vcfg.aimd.clone(),
                vcfg.inflight_ceiling,
                vcfg.initial_inflight,
                now,
            ),
            pool: Some(pool),
            inflight: HashSet::new(),
            books_log: RotatingJsonlWriter::new(
                &cfg.output_dir,
                &venue,
                "orderbooks",
                "orderbooks",
                cfg.writer.clone(),
            ),
            stats_log: RotatingJsonlWriter::new(
                &cfg.output_dir,
                &venue,
                "poll_stats",
                "stats",
                cfg.writer.clone(),
            ),
            errors_log: RotatingJsonlWriter::new(
                &cfg.output_dir,
                &venue,
                "poll_errors",
                "errors",
                cfg.writer.clone(),
            ),
            stats: StatsWindow::default(),
            sampler: ErrorSampler::new(vcfg.error_samples_per_sec),
            last_snapshot_poll: None,
            last_stats_emit: now,
            snapshot_missing_logged: false,
            client: runtime.client,
            tick_interval: cfg.tick_interval,
            snapshot_refresh: cfg.snapshot_refresh,
            stats_interval: cfg.stats_interval,
            shutdown_grace: cfg.shutdown_grace,
            venue,
            vcfg,
        })
    }

    /// Scheduler loop body for one venue thread.
    pub fn run(mut self, running: Arc<AtomicBool>) -> Result<()> {
        info!(venue = %self.venue, workers = self.vcfg.max_workers, "poll scheduler started");
        let mut write_failures = 0u32;
        while running.load(Ordering::Relaxed) {
            match self.tick(Instant::now()) {
                Ok(()) => write_failures = 0,
                Err(e) => {
                    write_failures += 1;
                    warn!(venue = %self.venue, failures = write_failures, "tick error: {:#}", e);
                    if write_failures >= MAX_WRITE_FAILURES {
                        self.shutdown().ok();
                        return Err(e);
                    }
                }
            }
            sleep_interruptible(self.tick_interval, &running);
        }
        self.shutdown()
    }

    /// One scheduler tick: refresh membership, dispatch eligible fetches,
    /// drain completions, run the AIMD rules, emit telemetry.
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        self.refresh_active_set(now);

        let active = &self.active;
        self.backoff.retain_keys(|k| active.instruments.contains_key(k));

        if self.aimd.in_cooldown(now) {
            debug!(
                venue = %self.venue,
                remaining_ms = self.aimd.cooldown_remaining(now).as_millis() as u64,
                "cooling down, dispatch paused"
            );
        } else {
            self.dispatch_eligible(now);
        }

        self.process_results(now)?;

        if let Some(adjustment) = self.aimd.evaluate(now) {
            info!(
                venue = %self.venue,
                ?adjustment,
                inflight_limit = self.aimd.inflight_limit(),
                "inflight limit adjusted"
            );
        }

        self.emit_stats_if_due(now)?;

        self.books_log.maybe_sync()?;
        self.stats_log.maybe_sync()?;
        self.errors_log.maybe_sync()?;
        Ok(())
    }

    fn refresh_active_set(&mut self, now: Instant) {
        let due = self
            .last_snapshot_poll
            .map_or(true, |t| now.duration_since(t) >= self.snapshot_refresh);
        if !due {
            return;
        }
        self.last_snapshot_poll = Some(now);

        match self.reader.poll() {
            Ok(Some(set)) => {
                debug!(venue = %self.venue, count = set.count, "active set refreshed");
                self.active = set;
                self.snapshot_missing_logged = false;
            }
            Ok(None) => {}
            Err(SnapshotError::Missing) => {
                // Discovery has not produced a snapshot yet; poll quietly
                // with whatever we have.
                if !self.snapshot_missing_logged {
                    warn!(venue = %self.venue, "no snapshot yet, polling empty set");
                    self.snapshot_missing_logged = true;
                }
            }
            Err(SnapshotError::Corrupt(msg)) => {
                warn!(venue = %self.venue, "snapshot unreadable, keeping last good set: {}", msg);
            }
        }
    }

    fn dispatch_eligible(&mut self, now: Instant) {
        let Some(pool) = self.pool.as_ref() else { return };
        let limit = self.aimd.inflight_limit();

        let mut picked: Vec<(String, String)> = Vec::new();
        for (key, inst) in &self.active.instruments {
            if self.inflight.len() + picked.len() >= limit {
                break;
            }
            if self.inflight.contains(key) || !self.backoff.is_eligible(key, now) {
                continue;
            }
            picked.push((key.clone(), inst.poll_key.clone()));
        }

        for (key, poll_key) in picked {
            let accepted = pool.dispatch(FetchJob {
                instrument_key: key.clone(),
                poll_key,
            });
            if !accepted {
                // Every worker slot is occupied; try again next tick.
                break;
            }
            self.inflight.insert(key);
            self.stats.submitted += 1;
        }
    }

    fn process_results(&mut self, now: Instant) -> Result<()> {
        let outcomes = match self.pool.as_ref() {
            Some(pool) => pool.drain_completed(),
            None => Vec::new(),
        };
        for outcome in outcomes {
            self.handle_outcome(outcome, now)?;
        }
        Ok(())
    }

    fn handle_outcome(&mut self, outcome: FetchOutcome, now: Instant) -> Result<()> {
        let FetchOutcome {
            instrument_key,
            poll_key,
            ts_ms,
            latency_ms,
            result,
        } = outcome;
        self.inflight.remove(&instrument_key);

        match result {
            Ok(raw) => match self.client.normalize(&raw, &poll_key, ts_ms) {
                Ok(record) => {
                    self.books_log.append(record.ts_ms, &record)?;
                    self.backoff.record_success(&instrument_key);
                    self.aimd.record_success(latency_ms, now);
                    self.stats.succeeded += 1;
                }
                Err(e) => self.record_failure(&instrument_key, ts_ms, latency_ms, e, now)?,
            },
            Err(e) => self.record_failure(&instrument_key, ts_ms, latency_ms, e, now)?,
        }
        Ok(())
    }

    fn record_failure(
        &mut self,
        instrument_key: &str,
        ts_ms: i64,
        latency_ms: u64,
        err: FetchError,
        now: Instant,
    ) -> Result<()> {
        // Instruments that already left the ActiveSet get no backoff entry;
        // there is nothing left to pace.
        if self.active.instruments.contains_key(instrument_key) {
            let failures = self.backoff.record_failure(instrument_key, now);
            debug!(
                venue = %self.venue,
                key = instrument_key,
                failures,
                kind = err.kind.as_str(),
                "fetch failed, backing off"
            );
        }
        self.aimd.record_failure(err.kind, latency_ms, now);
        self.stats.count_failure(err.kind);

        if self.sampler.allow(now) {
            let inst = self.active.instruments.get(instrument_key);
            let record = PollErrorRecord {
                venue: self.venue.clone(),
                ts_ms,
                instrument_key: instrument_key.to_string(),
                market_id: inst.map(|i| i.market_id.clone()),
                slug: inst.and_then(|i| i.slug.clone()),
                http_status: err.kind.http_status(),
                latency_ms,
                error_kind: err.kind.as_str().to_string(),
                message: truncate_message(&err.message),
            };
            self.errors_log.append(ts_ms, &record)?;
        }
        Ok(())
    }

    fn emit_stats_if_due(&mut self, now: Instant) -> Result<()> {
        if now.duration_since(self.last_stats_emit) < self.stats_interval {
            return Ok(());
        }
        self.last_stats_emit = now;
        self.emit_stats(now)
    }

    fn emit_stats(&mut self, now: Instant) -> Result<()> {
        let window = self.stats.take();
        let ts_ms = Utc::now().timestamp_millis();
        let record = PollStatsRecord {
            venue: self.venue.clone(),
            ts_ms,
            active_count: self.active.instruments.len(),
            submitted: window.submitted,
            succeeded: window.succeeded,
            failed: window.failed,
            http_4xx: window.http_4xx,
            http_5xx: window.http_5xx,
            http_429: window.http_429,
            timeouts: window.timeouts,
            p50_latency_ms: self.aimd.p50_latency_ms(),
            p95_latency_ms: self.aimd.p95_latency_ms(),
            cooldown_remaining_ms: self.aimd.cooldown_remaining(now).as_millis() as u64,
            inflight_limit: self.aimd.inflight_limit(),
            max_workers: self.vcfg.max_workers,
        };
        self.stats_log.append(ts_ms, &record)
    }

    /// Drain the pool, fold in whatever completed during the grace period,
    /// then flush and fsync every writer.
    pub fn shutdown(mut self) -> Result<()> {
        info!(venue = %self.venue, inflight = self.inflight.len(), "scheduler draining");
        if let Some(pool) = self.pool.take() {
            let leftovers = pool.shutdown(self.shutdown_grace);
            let now = Instant::now();
            for outcome in leftovers {
                if let Err(e) = self.handle_outcome(outcome, now) {
                    warn!(venue = %self.venue, "discarding result during shutdown: {:#}", e);
                }
            }
        }
        self.emit_stats(Instant::now())?;
        self.books_log.sync()?;
        self.stats_log.sync()?;
        self.errors_log.sync()?;
        info!(venue = %self.venue, "scheduler stopped");
        Ok(())
    }
}
