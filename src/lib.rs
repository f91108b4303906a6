//! Bookhound: prediction-market order-book harvester.
//!
//! Two processes share a filesystem root: `run-discovery` maintains the
//! per-venue active-instrument snapshots and the markets log, `run-logger`
//! polls the order books and writes the orderbook / poll_stats /
//! poll_errors streams. The atomic snapshot file is their only coupling.

pub mod aimd;
pub mod backoff;
pub mod config;
pub mod discovery;
pub mod jsonl;
pub mod models;
pub mod scheduler;
pub mod snapshot;
pub mod telemetry;
pub mod venues;
pub mod workers;

pub use config::{Config, VenueConfig};
pub use discovery::DiscoveryService;
pub use models::{ActiveSet, Instrument, MarketRecord, OrderbookRecord, PriceLevel};
pub use scheduler::VenueScheduler;
pub use venues::{builtin_venues, VenueClient, VenueRuntime};
