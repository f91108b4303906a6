//! Polling process entry point.
//!
//! One scheduler thread plus one bounded worker pool per venue; venues run
//! fully independently. Reads the active-set snapshots written by
//! `run-discovery` and appends the orderbook, poll_stats, and poll_errors
//! streams.

use anyhow::{Context, Result};
use bookhound::{builtin_venues, Config, VenueScheduler};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "run-logger")]
#[command(about = "Poll venue order books and append JSONL market-data logs")]
struct Args {
    /// Filesystem root for snapshots and logs (absolute path).
    #[arg(long, env = "OUTPUT_DIR")]
    output_dir: PathBuf,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("run_logger=info".parse().unwrap())
                .add_directive("bookhound=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let cfg = Config::new(args.output_dir)?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            info!("shutdown signal received");
            running.store(false, Ordering::SeqCst);
        })
        .context("failed to install signal handler")?;
    }

    let mut handles = Vec::new();
    for runtime in builtin_venues(&cfg)? {
        let venue = runtime.config.venue.clone();
        let scheduler = VenueScheduler::new(&cfg, runtime)?;
        let running = running.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-scheduler", venue))
            .spawn(move || scheduler.run(running))
            .with_context(|| format!("failed to spawn scheduler thread for {}", venue))?;
        handles.push((venue, handle));
    }

    let mut failed = false;
    for (venue, handle) in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(venue = %venue, "scheduler failed: {:#}", e);
                failed = true;
            }
            Err(_) => {
                error!(venue = %venue, "scheduler thread panicked");
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
