//! Operational metrics.
//!
//! Instead of wrapping every public method in an emission decorator, the
//! orchestrator passes an explicit [`MetricsSink`] through constructors.
//! Emission is fire-and-forget: sinks must never propagate errors into the
//! data path, and the provided implementations cannot fail.

mod sink;
pub use sink::*;

mod timer;
pub use timer::*;

/// Metric names shared across the workspace.
pub mod names {
	pub const INVOCATIONS: &str = "Invocations";
	pub const DURATION: &str = "Duration";
	pub const ERRORS: &str = "Errors";
	pub const THROTTLES: &str = "Throttles";
	pub const UTILIZATION: &str = "Utilization";
	pub const QUEUE_DEPTH: &str = "QueueDepth";
	pub const REGIONS_PROCESSED: &str = "RegionsProcessed";
	pub const TILES_PROCESSED: &str = "TilesProcessed";
	pub const REGION_LATENCY: &str = "RegionLatency";
	pub const TILING_LATENCY: &str = "TilingLatency";
}

/// Operation dimension values.
pub mod operations {
	pub const SCHEDULING: &str = "Scheduling";
	pub const IMAGE_PROCESSING: &str = "ImageProcessing";
	pub const REGION_PROCESSING: &str = "RegionProcessing";
	pub const TILE_PROCESSING: &str = "TileProcessing";
	pub const ASYNC_INFERENCE: &str = "AsyncInference";
}

/// Error-code dimension values.
pub mod error_codes {
	pub const INVALID_REQUEST: &str = "InvalidRequest";
	pub const INVALID_ROI: &str = "InvalidRoi";
	pub const LOAD_IMAGE_FAILURE: &str = "LoadImageFailure";
	pub const TILE_CREATION_FAILURE: &str = "TileCreationFailure";
	pub const PROCESSING_FAILURE: &str = "ProcessingFailure";
	pub const UNSUPPORTED_MODEL_HOST: &str = "UnsupportedModelHost";
}
