//! Per-venue discovery loop: periodic rediscovery, membership diff, markets
//! log, and the atomic snapshot write the poller reads from.

use crate::config::Config;
use crate::jsonl::RotatingJsonlWriter;
use crate::models::{ActiveSet, Instrument, MarketRecord};
use crate::snapshot::{snapshot_path, write_snapshot};
use crate::venues::{build_http_client, VenueClient, VenueRuntime};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Discovery calls list whole markets; give them more room than the
/// per-book fetch timeout.
const DISCOVERY_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive cycle failures (log or snapshot write) before the process
/// gives up. Venue-side discovery errors do not count; they only skip the
/// cycle.
const MAX_WRITE_FAILURES: u32 = 5;

/// Build a fresh ActiveSet from one discovery pass: drop expired
/// instruments, deduplicate by key keeping the later expiration.
pub fn build_active_set(venue: &str, list: Vec<Instrument>, asof: DateTime<Utc>) -> ActiveSet {
    let now_ms = asof.timestamp_millis();
    let mut instruments: BTreeMap<String, Instrument> = BTreeMap::new();
    for inst in list {
        if inst.expiration_ms <= now_ms {
            continue;
        }
        match instruments.entry(inst.instrument_key()) {
            Entry::Vacant(slot) => {
                slot.insert(inst);
            }
            Entry::Occupied(mut slot) => {
                if inst.expiration_ms > slot.get().expiration_ms {
                    slot.insert(inst);
                }
            }
        }
    }
    ActiveSet {
        asof_ts_utc: asof,
        venue: venue.to_string(),
        count: instruments.len(),
        instruments,
    }
}

/// Instruments that are new or whose fields changed since the previously
/// written set. Removals are intentionally not reported.
pub fn changed_instruments<'a>(
    prev: Option<&ActiveSet>,
    next: &'a ActiveSet,
) -> Vec<&'a Instrument> {
    next.instruments
        .iter()
        .filter(|(key, inst)| match prev.and_then(|p| p.instruments.get(*key)) {
            Some(old) => old != *inst,
            None => true,
        })
        .map(|(_, inst)| inst)
        .collect()
}

pub struct DiscoveryService {
    venue: String,
    interval: Duration,
    rules: serde_json::Value,
    client: Arc<dyn VenueClient>,
    http: reqwest::blocking::Client,
    markets_log: RotatingJsonlWriter,
    snapshot_file: PathBuf,
    last_written: Option<ActiveSet>,
}

impl DiscoveryService {
    pub fn new(cfg: &Config, runtime: VenueRuntime) -> Result<Self> {
        let venue = runtime.config.venue.clone();
        let markets_log = RotatingJsonlWriter::new(
            &cfg.output_dir,
            &venue,
            "markets",
            "markets",
            cfg.writer.clone(),
        );
        Ok(Self {
            snapshot_file: snapshot_path(&cfg.output_dir, &venue),
            venue,
            interval: cfg.discovery_interval,
            rules: runtime.config.rules.clone(),
            client: runtime.client,
            http: build_http_client(DISCOVERY_HTTP_TIMEOUT)?,
            markets_log,
            last_written: None,
        })
    }

    /// One discovery cycle. A venue-side discovery error skips the snapshot
    /// write and returns Ok; filesystem errors propagate.
    pub fn run_cycle(&mut self) -> Result<()> {
        let discovered = match self.client.discover(&self.http, &self.rules) {
            Ok(list) => list,
            Err(e) => {
                warn!(venue = %self.venue, "discovery failed, keeping previous snapshot: {:#}", e);
                return Ok(());
            }
        };

        let asof = Utc::now();
        let ts_ms = asof.timestamp_millis();
        let set = build_active_set(&self.venue, discovered, asof);

        let changed = changed_instruments(self.last_written.as_ref(), &set);
        for inst in changed.iter().copied() {
            self.markets_log
                .append(ts_ms, &MarketRecord::from_instrument(inst, ts_ms))?;
        }
        if !changed.is_empty() {
            info!(
                venue = %self.venue,
                changed = changed.len(),
                active = set.count,
                "active set changed"
            );
        }

        // Written even when nothing changed, so asof freshness advances.
        write_snapshot(&self.snapshot_file, &set)?;
        self.last_written = Some(set);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.markets_log.sync()
    }

    /// Discovery loop body for one venue thread.
    pub fn run(mut self, running: Arc<AtomicBool>) -> Result<()> {
        info!(venue = %self.venue, interval_s = self.interval.as_secs(), "discovery loop started");
        let mut write_failures = 0u32;
        while running.load(Ordering::Relaxed) {
            match self.run_cycle() {
                Ok(()) => write_failures = 0,
                Err(e) => {
                    write_failures += 1;
                    warn!(venue = %self.venue, failures = write_failures, "discovery cycle error: {:#}", e);
                    if write_failures >= MAX_WRITE_FAILURES {
                        self.flush().ok();
                        return Err(e);
                    }
                }
            }
            sleep_interruptible(self.interval, &running);
        }
        self.flush()?;
        info!(venue = %self.venue, "discovery loop stopped");
        Ok(())
    }
}

/// Sleep in short slices so shutdown is prompt.
pub(crate) fn sleep_interruptible(total: Duration, running: &AtomicBool) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::Relaxed) {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        thread::sleep(left.min(Duration::from_millis(200)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonl::read_jsonl;
    use crate::snapshot::SnapshotReader;
    use crate::venues::mock::MockVenue;
    use std::fs;
    use std::path::Path;

    fn service(out: &Path, mock: Arc<MockVenue>) -> DiscoveryService {
        let cfg = Config::new(out.to_path_buf()).unwrap();
        let mut vcfg = cfg.venues[0].clone();
        vcfg.venue = "mock".to_string();
        DiscoveryService::new(
            &cfg,
            VenueRuntime {
                config: vcfg,
                client: mock,
            },
        )
        .unwrap()
    }

    fn read_markets_log(out: &Path) -> Vec<MarketRecord> {
        let mut records = Vec::new();
        let stream = out.join("mock/markets");
        let Ok(days) = fs::read_dir(&stream) else {
            return records;
        };
        let mut day_dirs: Vec<_> = days.map(|d| d.unwrap().path()).collect();
        day_dirs.sort();
        for day in day_dirs {
            let mut parts: Vec<_> = fs::read_dir(&day).unwrap().map(|p| p.unwrap().path()).collect();
            parts.sort();
            for part in parts {
                records.extend(read_jsonl::<MarketRecord>(&part).unwrap());
            }
        }
        records
    }

    #[test]
    fn active_set_drops_expired_and_dedups_by_later_expiration() {
        let mock = MockVenue::new("mock");
        let asof = Utc::now();
        let now_ms = asof.timestamp_millis();
        let fresh = mock.instrument("A", "m1", now_ms + 60_000);
        let expired = mock.instrument("B", "m1", now_ms - 1);
        let dup_short = mock.instrument("C", "m2", now_ms + 10_000);
        let dup_long = mock.instrument("C", "m2", now_ms + 90_000);

        let set = build_active_set("mock", vec![fresh, expired, dup_short, dup_long], asof);
        assert_eq!(set.count, 2);
        assert!(set.instruments.contains_key("mock:A"));
        assert_eq!(
            set.instruments.get("mock:C").unwrap().expiration_ms,
            now_ms + 90_000
        );
    }

    #[test]
    fn membership_changes_are_logged_without_removals() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockVenue::new("mock"));
        let mut svc = service(dir.path(), mock.clone());
        let exp = Utc::now().timestamp_millis() + 3_600_000;

        // Cycle 1: {A, B} -> records for A and B.
        mock.set_instruments(vec![
            mock.instrument("A", "m1", exp),
            mock.instrument("B", "m1", exp),
        ]);
        svc.run_cycle().unwrap();
        svc.flush().unwrap();
        let after_first = read_markets_log(dir.path());
        let mut keys: Vec<_> = after_first.iter().map(|r| r.instrument_id.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec!["mock:A", "mock:B"]);

        // Cycle 2: {B, C} with B unchanged -> exactly one new record, for C.
        mock.set_instruments(vec![
            mock.instrument("B", "m1", exp),
            mock.instrument("C", "m2", exp),
        ]);
        svc.run_cycle().unwrap();
        svc.flush().unwrap();
        let after_second = read_markets_log(dir.path());
        assert_eq!(after_second.len(), 3);
        assert_eq!(after_second.last().unwrap().instrument_id, "mock:C");

        // Snapshot reflects the latest membership only.
        let mut reader = SnapshotReader::new(dir.path().join("mock/state/active_instruments.snapshot.json"));
        let set = reader.poll().unwrap().unwrap();
        assert_eq!(set.count, 2);
        assert!(!set.instruments.contains_key("mock:A"));
    }

    #[test]
    fn metadata_change_relogs_the_instrument() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockVenue::new("mock"));
        let mut svc = service(dir.path(), mock.clone());
        let exp = Utc::now().timestamp_millis() + 3_600_000;

        mock.set_instruments(vec![mock.instrument("A", "m1", exp)]);
        svc.run_cycle().unwrap();

        // Same key, later expiration: counts as modified.
        mock.set_instruments(vec![mock.instrument("A", "m1", exp + 5_000)]);
        svc.run_cycle().unwrap();
        svc.flush().unwrap();

        let records = read_markets_log(dir.path());
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].expiration_ms, exp + 5_000);
    }

    #[test]
    fn discovery_error_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockVenue::new("mock"));
        let mut svc = service(dir.path(), mock.clone());
        let exp = Utc::now().timestamp_millis() + 3_600_000;

        mock.set_instruments(vec![mock.instrument("A", "m1", exp)]);
        svc.run_cycle().unwrap();
        let snap = dir.path().join("mock/state/active_instruments.snapshot.json");
        let before = fs::read_to_string(&snap).unwrap();

        mock.set_discover_error(true);
        svc.run_cycle().unwrap();
        assert_eq!(fs::read_to_string(&snap).unwrap(), before);

        // Recovery on the next clean cycle.
        mock.set_discover_error(false);
        svc.run_cycle().unwrap();
        assert_ne!(fs::read_to_string(&snap).unwrap(), before);
    }

    #[test]
    fn snapshot_is_written_even_without_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockVenue::new("mock"));
        let mut svc = service(dir.path(), mock.clone());
        let exp = Utc::now().timestamp_millis() + 3_600_000;
        mock.set_instruments(vec![mock.instrument("A", "m1", exp)]);

        svc.run_cycle().unwrap();
        let snap = dir.path().join("mock/state/active_instruments.snapshot.json");
        let first: ActiveSet = serde_json::from_str(&fs::read_to_string(&snap).unwrap()).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        svc.run_cycle().unwrap();
        let second: ActiveSet = serde_json::from_str(&fs::read_to_string(&snap).unwrap()).unwrap();
        assert!(second.asof_ts_utc > first.asof_ts_utc);

        // No-op rediscovery logged exactly one record overall.
        svc.flush().unwrap();
        assert_eq!(read_markets_log(dir.path()).len(), 1);
    }
}
