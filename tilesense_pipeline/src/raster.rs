//! Raster datasets and the tile factory.
//!
//! Raster I/O is an external concern; the pipeline sees it through two
//! narrow traits. A [`TileFactory`] opens an image URI (assuming a read
//! role when the request carries one) and returns a [`RasterDataset`] that
//! can describe itself and encode pixel windows as tile bytes. The
//! synthetic implementation backs tests: a procedurally generated raster
//! with a north-up sensor model and configurable failure injection.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use parking_lot::Mutex;
use std::{collections::HashMap, io::Cursor, sync::Arc};
use tilesense_core::{PixelWindow, ProcessingError, TileCompression, TileFormat};
use tilesense_geometry::{AffineSensorModel, SensorModel};

/// Source metadata extracted from an opened dataset.
#[derive(Clone, Debug, Default)]
pub struct RasterMetadata {
	pub width: u32,
	pub height: u32,
	/// Container format of the source image, e.g. `NITF`.
	pub source_format: Option<String>,
	/// Acquisition timestamp from the image metadata, when present.
	pub acquisition_time: Option<String>,
}

/// An opened raster dataset.
#[async_trait]
pub trait RasterDataset: Send + Sync {
	fn metadata(&self) -> &RasterMetadata;

	/// Sensor model for pixel/geo conversion, absent for rasters without
	/// geo positioning metadata.
	fn sensor_model(&self) -> Option<Arc<dyn SensorModel>>;

	/// Encodes the pixel window as tile bytes in the requested format.
	async fn encode_tile(
		&self,
		window: PixelWindow,
		format: TileFormat,
		compression: TileCompression,
	) -> Result<Vec<u8>>;
}

impl std::fmt::Debug for dyn RasterDataset {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RasterDataset").field("metadata", self.metadata()).finish()
	}
}

pub type SharedRasterDataset = Arc<dyn RasterDataset>;

/// Opens raster datasets by URI.
#[async_trait]
pub trait TileFactory: Send + Sync {
	/// Opens the dataset, optionally under an assumed read role.
	async fn open(&self, image_url: &str, read_role: Option<&str>) -> Result<SharedRasterDataset>;
}

pub type SharedTileFactory = Arc<dyn TileFactory>;

/// Procedurally generated raster for tests and demos.
pub struct SyntheticRasterDataset {
	metadata: RasterMetadata,
	sensor_model: Arc<dyn SensorModel>,
	/// Windows whose encoding is forced to fail.
	failing_windows: Mutex<Vec<PixelWindow>>,
}

impl SyntheticRasterDataset {
	pub fn new(width: u32, height: u32) -> Arc<Self> {
		Arc::new(Self {
			metadata: RasterMetadata {
				width,
				height,
				source_format: Some("NITF".to_string()),
				acquisition_time: Some("2024-05-01T12:00:00Z".to_string()),
			},
			sensor_model: Arc::new(AffineSensorModel::north_up(10.0, 50.0, 0.0001)),
			failing_windows: Mutex::new(Vec::new()),
		})
	}

	/// Forces `encode_tile` to fail for the given window.
	pub fn fail_window(&self, window: PixelWindow) {
		self.failing_windows.lock().push(window);
	}
}

#[async_trait]
impl RasterDataset for SyntheticRasterDataset {
	fn metadata(&self) -> &RasterMetadata {
		&self.metadata
	}

	fn sensor_model(&self) -> Option<Arc<dyn SensorModel>> {
		Some(self.sensor_model.clone())
	}

	async fn encode_tile(
		&self,
		window: PixelWindow,
		format: TileFormat,
		_compression: TileCompression,
	) -> Result<Vec<u8>> {
		if self.failing_windows.lock().contains(&window) {
			return Err(anyhow!("synthetic encoding failure for window {window}"));
		}
		// A small solid-color image whose pixel value encodes the window
		// origin, so tests can tell tiles apart.
		let r = (window.row % 256) as u8;
		let g = (window.col % 256) as u8;
		let image = RgbImage::from_pixel(8, 8, image::Rgb([r, g, 128]));
		let mut bytes = Cursor::new(Vec::new());
		let image_format = match format {
			TileFormat::Png | TileFormat::Nitf | TileFormat::Gtiff => ImageFormat::Png,
			TileFormat::Jpeg => ImageFormat::Jpeg,
		};
		image
			.write_to(&mut bytes, image_format)
			.context("could not encode synthetic tile")?;
		Ok(bytes.into_inner())
	}
}

/// Tile factory serving registered synthetic datasets.
#[derive(Default)]
pub struct SyntheticTileFactory {
	datasets: Mutex<HashMap<String, Arc<SyntheticRasterDataset>>>,
}

impl SyntheticTileFactory {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn insert(&self, image_url: &str, dataset: Arc<SyntheticRasterDataset>) {
		self.datasets.lock().insert(image_url.to_string(), dataset);
	}
}

#[async_trait]
impl TileFactory for SyntheticTileFactory {
	async fn open(&self, image_url: &str, _read_role: Option<&str>) -> Result<SharedRasterDataset> {
		self
			.datasets
			.lock()
			.get(image_url)
			.cloned()
			.map(|dataset| dataset as SharedRasterDataset)
			.ok_or_else(|| {
				anyhow::Error::new(ProcessingError::LoadImage(format!("image '{image_url}' is not reachable")))
			})
	}
}
