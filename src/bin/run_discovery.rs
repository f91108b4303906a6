//! Discovery process entry point.
//!
//! Rediscovers each venue's pollable instruments on a slow cadence, logs
//! membership changes to the markets stream, and atomically replaces the
//! per-venue snapshot the polling process reads.

use anyhow::{Context, Result};
use bookhound::{builtin_venues, Config, DiscoveryService};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "run-discovery")]
#[command(about = "Discover pollable instruments and publish active-set snapshots")]
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
                .add_directive("run_discovery=info".parse().unwrap())
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
        let service = DiscoveryService::new(&cfg, runtime)?;
        let running = running.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-discovery", venue))
            .spawn(move || service.run(running))
            .with_context(|| format!("failed to spawn discovery thread for {}", venue))?;
        handles.push((venue, handle));
    }

    let mut failed = false;
    for (venue, handle) in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(venue = %venue, "discovery loop failed: {:#}", e);
                failed = true;
            }
            Err(_) => {
                error!(venue = %venue, "discovery thread panicked");
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
