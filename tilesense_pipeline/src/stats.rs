//! Per-endpoint in-progress region counters.
//!
//! The serialization point for region-level self-throttling. Increments are
//! conditional on the configured ceiling; decrements are clamped at zero
//! and must run on every exit path, which [`RegionSlot`] guarantees by
//! releasing on drop.

use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct EndpointStatistics {
	in_progress: DashMap<String, usize>,
}

impl EndpointStatistics {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Attempts to claim a region slot for the endpoint. Fails when
	/// `max_regions` are already in progress.
	pub fn try_start_region(self: &Arc<Self>, endpoint: &str, max_regions: usize) -> Option<RegionSlot> {
		let mut entry = self.in_progress.entry(endpoint.to_string()).or_insert(0);
		if *entry >= max_regions {
			return None;
		}
		*entry += 1;
		drop(entry);
		Some(RegionSlot {
			stats: self.clone(),
			endpoint: endpoint.to_string(),
		})
	}

	pub fn in_progress(&self, endpoint: &str) -> usize {
		self.in_progress.get(endpoint).map_or(0, |count| *count)
	}

	fn end_region(&self, endpoint: &str) {
		if let Some(mut entry) = self.in_progress.get_mut(endpoint) {
			*entry = entry.saturating_sub(1);
		}
	}
}

/// A claimed in-progress slot; released when dropped.
pub struct RegionSlot {
	stats: Arc<EndpointStatistics>,
	endpoint: String,
}

impl Drop for RegionSlot {
	fn drop(&mut self) {
		self.stats.end_region(&self.endpoint);
	}
}
