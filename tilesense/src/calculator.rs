//! Region-count calculation for the buffered queue.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tilesense_core::{ImageRequest, PixelWindow};
use tilesense_pipeline::{RasterDataset, SharedTileFactory, TileFactory, TilingStrategy};
use tilesense_scheduler::RegionCalculator;

/// Computes region counts by opening the image header and running the
/// tiling strategy, which also proves early that the image is reachable.
pub struct DatasetRegionCalculator {
	tile_factory: SharedTileFactory,
	tiling_strategy: Arc<dyn TilingStrategy>,
	region_size: u32,
}

impl DatasetRegionCalculator {
	pub fn new(tile_factory: SharedTileFactory, tiling_strategy: Arc<dyn TilingStrategy>, region_size: u32) -> Arc<Self> {
		Arc::new(Self {
			tile_factory,
			tiling_strategy,
			region_size,
		})
	}
}

#[async_trait]
impl RegionCalculator for DatasetRegionCalculator {
	async fn region_count(&self, request: &ImageRequest) -> Result<u32> {
		let dataset = self
			.tile_factory
			.open(&request.image_url, request.image_read_role.as_deref())
			.await?;
		let metadata = dataset.metadata();
		let bounds = PixelWindow::from_image_size(metadata.width, metadata.height);
		let regions = self.tiling_strategy.compute_regions(
			bounds,
			(self.region_size, self.region_size),
			&request.tile_geometry,
		);
		Ok(regions.len() as u32)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use tilesense_pipeline::{GridTilingStrategy, SyntheticRasterDataset, SyntheticTileFactory};

	fn request_for(url: &str) -> ImageRequest {
		ImageRequest::from_external_message(&format!(
			r#"{{
				"jobId": "job-1",
				"imageUrls": ["{url}"],
				"outputs": [{{"type": "S3", "bucket": "results", "prefix": "p/"}}],
				"imageProcessor": {{"name": "m", "type": "SM_ENDPOINT"}},
				"imageProcessorTileSize": 512,
				"imageProcessorTileOverlap": 128
			}}"#
		))
		.unwrap()
	}

	#[tokio::test]
	async fn counts_regions_for_reachable_image() {
		let factory = SyntheticTileFactory::new();
		factory.insert("s3://imagery/small.ntf", SyntheticRasterDataset::new(1024, 1024));
		factory.insert("s3://imagery/wide.ntf", SyntheticRasterDataset::new(40000, 1024));
		let calculator = DatasetRegionCalculator::new(factory, Arc::new(GridTilingStrategy), 20480);

		assert_eq!(calculator.region_count(&request_for("s3://imagery/small.ntf")).await.unwrap(), 1);
		assert_eq!(calculator.region_count(&request_for("s3://imagery/wide.ntf")).await.unwrap(), 2);
	}

	#[tokio::test]
	async fn unreachable_image_is_an_error() {
		let factory = SyntheticTileFactory::new();
		let calculator = DatasetRegionCalculator::new(factory, Arc::new(GridTilingStrategy), 20480);
		assert!(calculator.region_count(&request_for("s3://imagery/missing.ntf")).await.is_err());
	}
}
