//! Region-request progress store.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
	collections::{BTreeSet, HashMap},
	sync::Arc,
};
use tilesense_core::RegionStatus;

/// One row per region, hash key `image_id`, range key `region_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionRequestRecord {
	pub image_id: String,
	pub region_id: String,
	pub status: RegionStatus,
	/// Total tiles in the region, known once tiling has run.
	#[serde(default)]
	pub total_tile_count: u32,
	#[serde(default)]
	pub succeeded_tile_ids: BTreeSet<String>,
	#[serde(default)]
	pub failed_tile_ids: BTreeSet<String>,
	pub start_time: i64,
	#[serde(default)]
	pub end_time: Option<i64>,
}

impl RegionRequestRecord {
	pub fn new(image_id: &str, region_id: &str, now: i64) -> Self {
		Self {
			image_id: image_id.to_string(),
			region_id: region_id.to_string(),
			status: RegionStatus::InProgress,
			total_tile_count: 0,
			succeeded_tile_ids: BTreeSet::new(),
			failed_tile_ids: BTreeSet::new(),
			start_time: now,
			end_time: None,
		}
	}

	pub fn succeeded_tile_count(&self) -> u32 {
		self.succeeded_tile_ids.len() as u32
	}

	pub fn failed_tile_count(&self) -> u32 {
		self.failed_tile_ids.len() as u32
	}

	/// A region's tile set is terminal when every tile is accounted for.
	pub fn tiles_terminal(&self) -> bool {
		self.total_tile_count > 0
			&& self.succeeded_tile_count() + self.failed_tile_count() == self.total_tile_count
	}
}

#[async_trait]
pub trait RegionRequestStore: Send + Sync {
	async fn start_region(&self, record: RegionRequestRecord) -> Result<()>;

	async fn get_region(&self, image_id: &str, region_id: &str) -> Result<Option<RegionRequestRecord>>;

	/// Records how many tiles the region will process.
	async fn set_total_tile_count(&self, image_id: &str, region_id: &str, total: u32) -> Result<()>;

	/// Records one tile's terminal result. A tile already recorded in either
	/// set is left unchanged, making retried notifications no-ops.
	async fn add_tile_result(
		&self,
		image_id: &str,
		region_id: &str,
		tile_id: &str,
		succeeded: bool,
	) -> Result<RegionRequestRecord>;

	/// Atomically writes the terminal state of the region.
	async fn complete_region(
		&self,
		image_id: &str,
		region_id: &str,
		status: RegionStatus,
		now: i64,
	) -> Result<RegionRequestRecord>;

	/// `(failed, completed)` region counts for an image. Errors propagate;
	/// there is no default-tuple fallback.
	async fn complete_counts(&self, image_id: &str) -> Result<(u32, u32)>;
}

pub type SharedRegionStore = Arc<dyn RegionRequestStore>;

/// In-memory region-request store.
#[derive(Default)]
pub struct MemoryRegionStore {
	rows: Mutex<HashMap<(String, String), RegionRequestRecord>>,
}

impl MemoryRegionStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	fn with_row<T>(
		&self,
		image_id: &str,
		region_id: &str,
		f: impl FnOnce(&mut RegionRequestRecord) -> T,
	) -> Result<T> {
		let mut rows = self.rows.lock();
		let row = rows
			.get_mut(&(image_id.to_string(), region_id.to_string()))
			.ok_or_else(|| anyhow!("region '{region_id}' of image '{image_id}' has no row"))?;
		Ok(f(row))
	}
}

#[async_trait]
impl RegionRequestStore for MemoryRegionStore {
	async fn start_region(&self, record: RegionRequestRecord) -> Result<()> {
		self
			.rows
			.lock()
			.insert((record.image_id.clone(), record.region_id.clone()), record);
		Ok(())
	}

	async fn get_region(&self, image_id: &str, region_id: &str) -> Result<Option<RegionRequestRecord>> {
		Ok(
			self
				.rows
				.lock()
				.get(&(image_id.to_string(), region_id.to_string()))
				.cloned(),
		)
	}

	async fn set_total_tile_count(&self, image_id: &str, region_id: &str, total: u32) -> Result<()> {
		self.with_row(image_id, region_id, |row| row.total_tile_count = total)
	}

	async fn add_tile_result(
		&self,
		image_id: &str,
		region_id: &str,
		tile_id: &str,
		succeeded: bool,
	) -> Result<RegionRequestRecord> {
		self.with_row(image_id, region_id, |row| {
			let already_recorded =
				row.succeeded_tile_ids.contains(tile_id) || row.failed_tile_ids.contains(tile_id);
			if !already_recorded {
				if succeeded {
					row.succeeded_tile_ids.insert(tile_id.to_string());
				} else {
					row.failed_tile_ids.insert(tile_id.to_string());
				}
			}
			row.clone()
		})
	}

	async fn complete_region(
		&self,
		image_id: &str,
		region_id: &str,
		status: RegionStatus,
		now: i64,
	) -> Result<RegionRequestRecord> {
		self.with_row(image_id, region_id, |row| {
			row.status = status;
			row.end_time = Some(now);
			row.clone()
		})
	}

	async fn complete_counts(&self, image_id: &str) -> Result<(u32, u32)> {
		let rows = self.rows.lock();
		let mut failed = 0;
		let mut completed = 0;
		for row in rows.values().filter(|row| row.image_id == image_id) {
			if row.status.is_terminal() {
				completed += 1;
			}
			if row.status == RegionStatus::Failed {
				failed += 1;
			}
		}
		Ok((failed, completed))
	}
}
