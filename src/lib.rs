//! GeoScout - distributed model inference over large geospatial imagery
//!
//! This library implements the work-decomposition and result-aggregation
//! engine used by a fleet of worker processes to run computer-vision models
//! over very large images. Workers consume image-processing requests from a
//! shared queue, break each image into regions and tiles, dispatch tiles to
//! a remote inference endpoint, and merge per-tile detections into a single
//! geospatial result set.
//!
//! # High-Level API
//!
//! Most deployments construct a [`runner::ModelRunner`] from the collaborator
//! implementations for their environment and let it monitor the work queues:
//!
//! ```ignore
//! use geoscout::config::ServiceConfig;
//! use geoscout::runner::ModelRunner;
//!
//! let config = ServiceConfig::from_env()?;
//! let runner = ModelRunner::new(config, queues, ledger, imagery, sinks);
//! runner.run().await;
//! ```

pub mod api;
pub mod codec;
pub mod config;
pub mod distill;
pub mod endpoint;
pub mod feature;
pub mod image_handler;
pub mod imagery;
pub mod ledger;
pub mod lift;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod region_handler;
pub mod runner;
pub mod sensor;
pub mod sink;
pub mod tiling;

/// Version of the GeoScout library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
