//! Image-request lifecycle store.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tilesense_core::ImageStatus;

/// One row per image, hash key `image_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageRequestRecord {
	pub image_id: String,
	pub job_id: String,
	pub status: ImageStatus,
	#[serde(default)]
	pub status_message: Option<String>,
	/// Known once the image header has been opened and tiled.
	#[serde(default)]
	pub region_count: u32,
	#[serde(default)]
	pub regions_complete: u32,
	/// Regions that ended with a region-level failure.
	#[serde(default)]
	pub regions_failed: u32,
	/// Regions that succeeded but reported failed tiles.
	#[serde(default)]
	pub regions_with_failed_tiles: u32,
	#[serde(default)]
	pub raster_width: u32,
	#[serde(default)]
	pub raster_height: u32,
	pub start_time: i64,
	#[serde(default)]
	pub end_time: Option<i64>,
}

impl ImageRequestRecord {
	pub fn new(image_id: &str, job_id: &str, now: i64) -> Self {
		Self {
			image_id: image_id.to_string(),
			job_id: job_id.to_string(),
			status: ImageStatus::Started,
			status_message: None,
			region_count: 0,
			regions_complete: 0,
			regions_failed: 0,
			regions_with_failed_tiles: 0,
			raster_width: 0,
			raster_height: 0,
			start_time: now,
			end_time: None,
		}
	}

	/// Seconds from start to end, once terminal.
	pub fn processing_duration(&self) -> Option<i64> {
		self.end_time.map(|end| (end - self.start_time).max(0))
	}

	pub fn all_regions_complete(&self) -> bool {
		self.region_count > 0 && self.regions_complete >= self.region_count
	}
}

#[async_trait]
pub trait ImageRequestStore: Send + Sync {
	/// Inserts the initial row for an image.
	async fn start_image(&self, record: ImageRequestRecord) -> Result<()>;

	async fn get_image(&self, image_id: &str) -> Result<Option<ImageRequestRecord>>;

	/// Records region count and raster dimensions after the header is read.
	async fn set_image_stats(&self, image_id: &str, region_count: u32, width: u32, height: u32) -> Result<()>;

	/// Atomically counts one region as complete and returns the updated row.
	/// `failed` marks a region-level failure; `tile_failures` marks a
	/// successful region that lost some tiles.
	async fn region_complete(&self, image_id: &str, failed: bool, tile_failures: bool) -> Result<ImageRequestRecord>;

	/// Marks the image terminal and stamps the end time.
	async fn end_image(&self, image_id: &str, status: ImageStatus, message: Option<&str>, now: i64)
	-> Result<ImageRequestRecord>;

	/// True once every region of the image is accounted for.
	async fn is_image_complete(&self, image_id: &str) -> Result<bool>;
}

pub type SharedImageStore = Arc<dyn ImageRequestStore>;

/// In-memory image-request store.
#[derive(Default)]
pub struct MemoryImageStore {
	rows: Mutex<HashMap<String, ImageRequestRecord>>,
}

impl MemoryImageStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}
}

#[async_trait]
impl ImageRequestStore for MemoryImageStore {
	async fn start_image(&self, record: ImageRequestRecord) -> Result<()> {
		self.rows.lock().insert(record.image_id.clone(), record);
		Ok(())
	}

	async fn get_image(&self, image_id: &str) -> Result<Option<ImageRequestRecord>> {
		Ok(self.rows.lock().get(image_id).cloned())
	}

	async fn set_image_stats(&self, image_id: &str, region_count: u32, width: u32, height: u32) -> Result<()> {
		let mut rows = self.rows.lock();
		let row = rows
			.get_mut(image_id)
			.ok_or_else(|| anyhow!("image '{image_id}' has no row"))?;
		row.region_count = region_count;
		row.raster_width = width;
		row.raster_height = height;
		row.status = ImageStatus::InProgress;
		Ok(())
	}

	async fn region_complete(&self, image_id: &str, failed: bool, tile_failures: bool) -> Result<ImageRequestRecord> {
		let mut rows = self.rows.lock();
		let row = rows
			.get_mut(image_id)
			.ok_or_else(|| anyhow!("image '{image_id}' has no row"))?;
		row.regions_complete += 1;
		if failed {
			row.regions_failed += 1;
		} else if tile_failures {
			row.regions_with_failed_tiles += 1;
		}
		Ok(row.clone())
	}

	async fn end_image(
		&self,
		image_id: &str,
		status: ImageStatus,
		message: Option<&str>,
		now: i64,
	) -> Result<ImageRequestRecord> {
		let mut rows = self.rows.lock();
		let row = rows
			.get_mut(image_id)
			.ok_or_else(|| anyhow!("image '{image_id}' has no row"))?;
		row.status = status;
		row.status_message = message.map(str::to_string);
		row.end_time = Some(now);
		Ok(row.clone())
	}

	async fn is_image_complete(&self, image_id: &str) -> Result<bool> {
		Ok(
			self
				.rows
				.lock()
				.get(image_id)
				.is_some_and(ImageRequestRecord::all_regions_complete),
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[tokio::test]
	async fn lifecycle_round_trip() {
		let store = MemoryImageStore::new();
		store
			.start_image(ImageRequestRecord::new("img", "job", 1000))
			.await
			.unwrap();
		store.set_image_stats("img", 2, 4096, 4096).await.unwrap();
		assert!(!store.is_image_complete("img").await.unwrap());

		store.region_complete("img", false, true).await.unwrap();
		assert!(!store.is_image_complete("img").await.unwrap());
		let row = store.region_complete("img", true, false).await.unwrap();
		assert!(store.is_image_complete("img").await.unwrap());
		assert_eq!(row.regions_failed, 1);
		assert_eq!(row.regions_with_failed_tiles, 1);

		let row = store.end_image("img", ImageStatus::Partial, Some("1 region failed"), 1060).await.unwrap();
		assert_eq!(row.status, ImageStatus::Partial);
		assert_eq!(row.processing_duration(), Some(60));
	}

	#[tokio::test]
	async fn zero_regions_is_never_complete() {
		let store = MemoryImageStore::new();
		store
			.start_image(ImageRequestRecord::new("img", "job", 1000))
			.await
			.unwrap();
		assert!(!store.is_image_complete("img").await.unwrap());
	}

	#[tokio::test]
	async fn missing_row_errors() {
		let store = MemoryImageStore::new();
		assert!(store.set_image_stats("nope", 1, 1, 1).await.is_err());
		assert!(store.region_complete("nope", false, false).await.is_err());
		assert!(store.get_image("nope").await.unwrap().is_none());
		assert!(!store.is_image_complete("nope").await.unwrap());
	}
}
