//! Scoped duration measurement.

use crate::metrics::{Dimensions, MetricUnit, MetricsSink, SharedMetrics};
use std::time::Instant;

/// Emits a duration metric when dropped.
///
/// Wraps a unit of work the way the handlers measure region and tiling
/// latency: create the timer at the top of the scope and let it emit on any
/// exit path.
pub struct ScopeTimer {
	metrics: SharedMetrics,
	name: String,
	dimensions: Dimensions,
	started_at: Instant,
}

impl ScopeTimer {
	pub fn start(metrics: SharedMetrics, name: &str, dimensions: Dimensions) -> Self {
		Self {
			metrics,
			name: name.to_string(),
			dimensions,
			started_at: Instant::now(),
		}
	}

	pub fn elapsed_ms(&self) -> f64 {
		self.started_at.elapsed().as_secs_f64() * 1000.0
	}
}

impl Drop for ScopeTimer {
	fn drop(&mut self) {
		self
			.metrics
			.emit(&self.name, self.elapsed_ms(), MetricUnit::Milliseconds, &self.dimensions);
	}
}
