//! Rotating JSONL writer: UTC-day partitioned, part-numbered, periodically
//! fsync'd append-only streams.
//!
//! Layout per venue under the output root:
//! `<venue>/<stream>/date=YYYY-MM-DD/<prefix>.part-NNNN.jsonl`
//!
//! Partition boundaries are UTC midnight keyed on each record's `ts_ms`.
//! Part numbers are monotone within a (venue, stream, date) and continue
//! across restarts; on open the directory is scanned and numbering resumes
//! at `max + 1`. Writes are buffered and flushed+fsync'd on an interval or
//! record-count threshold, never per record.

use crate::config::WriterConfig;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// UTC calendar day containing the given epoch-millisecond timestamp.
pub fn utc_day(ts_ms: i64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .unwrap_or_else(Utc::now)
        .date_naive()
}

struct OpenPart {
    day: NaiveDate,
    path: PathBuf,
    file: BufWriter<File>,
}

pub struct RotatingJsonlWriter {
    /// `<root>/<venue>/<stream>`
    stream_dir: PathBuf,
    prefix: &'static str,
    cfg: WriterConfig,
    part: Option<OpenPart>,
    pending: usize,
    last_sync: Instant,
}

impl RotatingJsonlWriter {
    pub fn new(
        root: &Path,
        venue: &str,
        stream: &str,
        prefix: &'static str,
        cfg: WriterConfig,
    ) -> Self {
        Self {
            stream_dir: root.join(venue).join(stream),
            prefix,
            cfg,
            part: None,
            pending: 0,
            last_sync: Instant::now(),
        }
    }

    /// Append one record as a single JSON line. `ts_ms` decides the UTC-day
    /// partition; a record landing in a new day closes the current part and
    /// opens `part-NNNN` in the new day's directory.
    pub fn append<T: Serialize>(&mut self, ts_ms: i64, record: &T) -> Result<()> {
        if let Err(e) = self.append_inner(ts_ms, record) {
            // Drop the open part so the next append retries a fresh open.
            self.part = None;
            self.pending = 0;
            return Err(e);
        }
        Ok(())
    }

    fn append_inner<T: Serialize>(&mut self, ts_ms: i64, record: &T) -> Result<()> {
        let day = utc_day(ts_ms);
        let rotate = match &self.part {
            Some(part) => part.day != day,
            None => true,
        };
        if rotate {
            self.open_part(day)?;
        }

        let line = serde_json::to_vec(record).context("failed to serialize record")?;
        let part = self.part.as_mut().expect("part opened above");
        part.file
            .write_all(&line)
            .with_context(|| format!("failed to append to {:?}", part.path))?;
        part.file
            .write_all(b"\n")
            .with_context(|| format!("failed to append to {:?}", part.path))?;
        self.pending += 1;

        if self.pending >= self.cfg.flush_records
            || self.last_sync.elapsed() >= self.cfg.fsync_interval
        {
            self.sync()?;
        }
        Ok(())
    }

    fn open_part(&mut self, day: NaiveDate) -> Result<()> {
        if self.part.is_some() {
            // Graceful rollover: the old day's tail is made durable first.
            self.sync()?;
        }
        let dir = self.stream_dir.join(format!("date={}", day.format("%Y-%m-%d")));
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create partition directory {:?}", dir))?;

        let part_no = next_part_number(&dir, self.prefix)?;
        let path = dir.join(format!("{}.part-{:04}.jsonl", self.prefix, part_no));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open part file {:?}", path))?;
        info!(path = %path.display(), "opened jsonl part");

        self.part = Some(OpenPart {
            day,
            path,
            file: BufWriter::new(file),
        });
        Ok(())
    }

    /// Flush the buffer and fsync the current part file.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(part) = self.part.as_mut() {
            part.file
                .flush()
                .with_context(|| format!("failed to flush {:?}", part.path))?;
            part.file
                .get_ref()
                .sync_data()
                .with_context(|| format!("failed to fsync {:?}", part.path))?;
        }
        self.pending = 0;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Fsync if the interval elapsed with records still pending. Called once
    /// per scheduler tick so quiet streams do not stay dirty.
    pub fn maybe_sync(&mut self) -> Result<()> {
        if self.pending > 0 && self.last_sync.elapsed() >= self.cfg.fsync_interval {
            self.sync()?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn current_path(&self) -> Option<&Path> {
        self.part.as_ref().map(|p| p.path.as_path())
    }
}

impl Drop for RotatingJsonlWriter {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            debug!("final sync on drop failed: {}", e);
        }
    }
}

/// Scan a partition directory for `<prefix>.part-NNNN.jsonl` files and
/// return the next part number (`max + 1`, or 0 for a fresh directory).
fn next_part_number(dir: &Path, prefix: &str) -> Result<u32> {
    let lead = format!("{}.part-", prefix);
    let mut max: Option<u32> = None;
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to scan partition {:?}", dir))?
    {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(&lead) else { continue };
        let Some(num) = rest.strip_suffix(".jsonl") else { continue };
        if let Ok(n) = num.parse::<u32>() {
            max = Some(max.map_or(n, |m| m.max(n)));
        }
    }
    Ok(match max {
        Some(m) => m + 1,
        None => 0,
    })
}

/// Read a JSONL file, tolerating a single trailing partial line (the
/// possible tail of a hard kill between fsync windows). A malformed line
/// anywhere before the tail is a real error.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let body =
        fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    let mut out = Vec::new();
    let mut chunks = body.split_inclusive('\n').peekable();
    while let Some(chunk) = chunks.next() {
        let terminated = chunk.ends_with('\n');
        let line = chunk.trim_end_matches('\n');
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(v) => out.push(v),
            Err(_) if !terminated && chunks.peek().is_none() => break,
            Err(e) => bail!("malformed line in {:?}: {}", path, e),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Row {
        ts_ms: i64,
        v: String,
    }

    fn writer(root: &Path) -> RotatingJsonlWriter {
        RotatingJsonlWriter::new(root, "v1", "orderbooks", "orderbooks", WriterConfig::default())
    }

    // 2024-03-01T23:59:59Z and one second later, across UTC midnight.
    const BEFORE_MIDNIGHT_MS: i64 = 1_709_337_599_000;
    const AFTER_MIDNIGHT_MS: i64 = 1_709_337_600_000;

    #[test]
    fn partitions_by_utc_day_of_ts_ms() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path());
        w.append(BEFORE_MIDNIGHT_MS, &Row { ts_ms: BEFORE_MIDNIGHT_MS, v: "a".into() })
            .unwrap();
        w.append(AFTER_MIDNIGHT_MS, &Row { ts_ms: AFTER_MIDNIGHT_MS, v: "b".into() })
            .unwrap();
        w.sync().unwrap();

        let d0 = dir
            .path()
            .join("v1/orderbooks/date=2024-03-01/orderbooks.part-0000.jsonl");
        let d1 = dir
            .path()
            .join("v1/orderbooks/date=2024-03-02/orderbooks.part-0000.jsonl");
        let rows0: Vec<Row> = read_jsonl(&d0).unwrap();
        let rows1: Vec<Row> = read_jsonl(&d1).unwrap();
        assert_eq!(rows0.len(), 1);
        assert_eq!(rows1.len(), 1);
        assert!(utc_day(rows0[0].ts_ms) < utc_day(rows1[0].ts_ms));
    }

    #[test]
    fn part_numbering_resumes_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let day_dir = dir.path().join("v1/orderbooks/date=2024-03-01");
        fs::create_dir_all(&day_dir).unwrap();
        fs::write(day_dir.join("orderbooks.part-0000.jsonl"), b"{}\n").unwrap();
        fs::write(day_dir.join("orderbooks.part-0003.jsonl"), b"{}\n").unwrap();
        fs::write(day_dir.join("unrelated.txt"), b"x").unwrap();

        let mut w = writer(dir.path());
        w.append(BEFORE_MIDNIGHT_MS, &Row { ts_ms: BEFORE_MIDNIGHT_MS, v: "a".into() })
            .unwrap();
        assert_eq!(
            w.current_path().unwrap(),
            day_dir.join("orderbooks.part-0004.jsonl")
        );
    }

    #[test]
    fn rollover_restarts_part_numbering_in_new_day() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path());
        w.append(BEFORE_MIDNIGHT_MS, &Row { ts_ms: BEFORE_MIDNIGHT_MS, v: "a".into() })
            .unwrap();
        w.append(AFTER_MIDNIGHT_MS, &Row { ts_ms: AFTER_MIDNIGHT_MS, v: "b".into() })
            .unwrap();
        assert!(w
            .current_path()
            .unwrap()
            .ends_with("date=2024-03-02/orderbooks.part-0000.jsonl"));
    }

    #[test]
    fn reader_skips_single_trailing_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tail.jsonl");
        fs::write(
            &path,
            b"{\"ts_ms\":1,\"v\":\"a\"}\n{\"ts_ms\":2,\"v\":\"b\"}\n{\"ts_ms\":3,\"v\":",
        )
        .unwrap();
        let rows: Vec<Row> = read_jsonl(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].v, "b");
    }

    #[test]
    fn reader_rejects_malformed_interior_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        fs::write(&path, b"{\"ts_ms\":1,\"v\":\"a\"}\nnot json\n{\"ts_ms\":2,\"v\":\"b\"}\n")
            .unwrap();
        assert!(read_jsonl::<Row>(&path).is_err());
    }

    #[test]
    fn flush_threshold_makes_records_visible() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WriterConfig {
            flush_records: 2,
            ..WriterConfig::default()
        };
        let mut w = RotatingJsonlWriter::new(dir.path(), "v1", "poll_stats", "stats", cfg);
        w.append(BEFORE_MIDNIGHT_MS, &Row { ts_ms: 1, v: "a".into() }).unwrap();
        w.append(BEFORE_MIDNIGHT_MS, &Row { ts_ms: 2, v: "b".into() }).unwrap();

        // Threshold hit: both lines are on disk without an explicit sync.
        let path = dir
            .path()
            .join("v1/poll_stats/date=2024-03-01/stats.part-0000.jsonl");
        let rows: Vec<Row> = read_jsonl(&path).unwrap();
        assert_eq!(rows.len(), 2);
    }
}
