//! Region and tile processing pipeline.
//!
//! Turns an admitted region into encoded tiles, drives detectors through a
//! worker pool, and aggregates results. The asynchronous inference path
//! lives in [`async_path`]; deduplication across overlapping tiles in
//! [`tiling`].

pub mod async_path;
pub use async_path::*;

mod batch;
pub use batch::*;

mod detector;
pub use detector::*;

mod raster;
pub use raster::*;

mod region_handler;
pub use region_handler::*;

mod selector;
pub use selector::*;

mod stats;
pub use stats::*;

mod tiling;
pub use tiling::*;

mod worker;
pub use worker::*;
