//! Per-venue worker pool: a fixed set of named OS threads executing
//! blocking order-book fetches.
//!
//! Each worker builds its own HTTP client, so connection pools are never
//! shared across threads. Jobs arrive on a bounded channel whose capacity
//! equals the pool size; the AIMD-controlled inflight limit enforced by the
//! scheduler is always at or below that hard cap. Workers keep no state
//! across calls besides the HTTP client.

use crate::venues::{build_http_client, FetchError, RawBook, VenueClient};
use anyhow::{Context, Result};
use chrono::Utc;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

pub struct FetchJob {
    pub instrument_key: String,
    pub poll_key: String,
}

pub struct FetchOutcome {
    pub instrument_key: String,
    pub poll_key: String,
    /// Wall clock at fetch start; becomes the record's `ts_ms`.
    pub ts_ms: i64,
    pub latency_ms: u64,
    pub result: Result<RawBook, FetchError>,
}

pub struct WorkerPool {
    job_tx: Option<Sender<FetchJob>>,
    result_rx: Receiver<FetchOutcome>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        venue: &str,
        workers: usize,
        request_timeout: Duration,
        client: Arc<dyn VenueClient>,
    ) -> Result<Self> {
        let (job_tx, job_rx) = bounded::<FetchJob>(workers);
        let (result_tx, result_rx) = unbounded::<FetchOutcome>();

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let client = client.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-fetch-{}", venue, i))
                .spawn(move || worker_loop(job_rx, result_tx, client, request_timeout))
                .with_context(|| format!("failed to spawn {} worker {}", venue, i))?;
            handles.push(handle);
        }

        Ok(Self {
            job_tx: Some(job_tx),
            result_rx,
            handles,
        })
    }

    /// Hand a job to the pool. Returns false when every worker slot is
    /// occupied (the bounded channel is full) or the pool is shut down.
    pub fn dispatch(&self, job: FetchJob) -> bool {
        match &self.job_tx {
            Some(tx) => tx.try_send(job).is_ok(),
            None => false,
        }
    }

    /// Collect every result completed since the last call, without blocking.
    pub fn drain_completed(&self) -> Vec<FetchOutcome> {
        let mut out = Vec::new();
        while let Ok(outcome) = self.result_rx.try_recv() {
            out.push(outcome);
        }
        out
    }

    /// Stop accepting jobs, wait up to `grace` for inflight fetches, then
    /// abandon whatever is still blocked. Returns the final results that
    /// completed during the wait.
    pub fn shutdown(mut self, grace: Duration) -> Vec<FetchOutcome> {
        // Closing the job channel lets idle workers exit immediately.
        self.job_tx.take();

        let deadline = Instant::now() + grace;
        loop {
            if self.handles.iter().all(|h| h.is_finished()) {
                break;
            }
            if Instant::now() >= deadline {
                debug!("abandoning workers still inflight after grace period");
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        for handle in self.handles.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }

        self.drain_completed()
    }
}

fn worker_loop(
    jobs: Receiver<FetchJob>,
    results: Sender<FetchOutcome>,
    client: Arc<dyn VenueClient>,
    request_timeout: Duration,
) {
    let http = match build_http_client(request_timeout) {
        Ok(c) => c,
        Err(e) => {
            error!("worker failed to build HTTP client: {}", e);
            return;
        }
    };

    for job in jobs.iter() {
        let ts_ms = Utc::now().timestamp_millis();
        let started = Instant::now();
        let result = client.fetch_orderbook(&http, &job.poll_key);
        let outcome = FetchOutcome {
            instrument_key: job.instrument_key,
            poll_key: job.poll_key,
            ts_ms,
            latency_ms: started.elapsed().as_millis() as u64,
            result,
        };
        if results.send(outcome).is_err() {
            // Scheduler is gone; nothing left to report to.
            break;
        }
    }
}
