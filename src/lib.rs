//! # skymargin
//!
//! Resumable margin-cache generation for HEALPix-partitioned point
//! catalogs: a two-phase map-reduce job that duplicates rows lying near a
//! partition's boundary into the neighboring partitions, so boundary-aware
//! spatial queries (nearest-neighbor search, cross-matching) never need to
//! read adjacent partitions.
//!
//! ## Usage
//!
//! ```bash
//! skymargin run --input ./catalog --output ./catalog_margin \
//!     --margin-pairs pairs.csv --margin-threshold 30 --margin-order 3
//! ```
//!
//! ## Modules
//!
//! - `catalog` - input catalog discovery (partition listing, descriptor)
//! - `cli` - command-line interface and dispatch
//! - `config` - run configuration, validation, plan fingerprinting
//! - `geometry` - margin pair table and margin predicates
//! - `mapper` - map phase: source partition to per-target shards
//! - `metadata` - finalization artifacts for the output catalog
//! - `orchestrator` - phase driver with hard map/reduce barrier
//! - `plan` - persisted resume plan with per-key DONE markers
//! - `reducer` - reduce phase: shard merge, filter, dedup, write
//! - `scheduler` - bounded worker pool with fail-fast joining

pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod fsio;
pub mod geometry;
pub mod mapper;
pub mod metadata;
pub mod orchestrator;
pub mod parquet_io;
pub mod pixel;
pub mod plan;
pub mod progress;
pub mod reducer;
pub mod scheduler;

pub use config::MarginCacheConfig;
pub use error::{MarginError, MarginResult};
pub use orchestrator::{generate_margin_cache, RunSummary};
pub use pixel::HealpixPixel;
