//! Per-region work units.

use crate::types::{EndpointSpec, ImageRequest, PixelWindow, TileCompression, TileFormat, TileGeometry};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// A single region of an image, the unit of distributed work.
///
/// One [`ImageRequest`] yields N region requests; each region is tiled and
/// processed independently, possibly on a different worker in the cluster.
/// The request is self-contained so a worker can execute it without reading
/// the parent image request back from a store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionRequest {
	pub image_id: String,
	pub job_id: String,
	pub image_url: String,
	pub region_id: String,
	pub region_bounds: PixelWindow,
	pub endpoint: EndpointSpec,
	pub tile_geometry: TileGeometry,
	pub tile_format: TileFormat,
	pub tile_compression: TileCompression,
	#[serde(default)]
	pub image_read_role: Option<String>,
	#[serde(default)]
	pub model_invoke_role: Option<String>,
	/// User-supplied properties merged into every produced feature.
	#[serde(default)]
	pub feature_properties: Vec<serde_json::Value>,
}

impl RegionRequest {
	/// Derives the region request for `region_bounds` from its parent image
	/// request.
	pub fn from_image_request(request: &ImageRequest, region_bounds: PixelWindow) -> Self {
		Self {
			image_id: request.image_id(),
			job_id: request.job_id.clone(),
			image_url: request.image_url.clone(),
			region_id: region_bounds.id(),
			region_bounds,
			endpoint: request.endpoint.clone(),
			tile_geometry: request.tile_geometry,
			tile_format: request.tile_format,
			tile_compression: request.tile_compression,
			image_read_role: request.image_read_role.clone(),
			model_invoke_role: request.model_invoke_role.clone(),
			feature_properties: request.feature_properties.clone(),
		}
	}

	pub fn from_message(body: &str) -> Result<Self> {
		let request: RegionRequest = serde_json::from_str(body).context("could not parse region request message")?;
		request.validate()?;
		Ok(request)
	}

	pub fn to_message(&self) -> Result<String> {
		serde_json::to_string(self).context("could not serialize region request")
	}

	pub fn validate(&self) -> Result<()> {
		if self.image_id.is_empty() || self.image_url.is_empty() {
			bail!("region request is missing its image identity");
		}
		if self.region_id.is_empty() {
			bail!("region request for image '{}' has no region id", self.image_id);
		}
		if self.region_bounds.is_empty() {
			bail!(
				"region request '{}' of image '{}' has empty bounds",
				self.region_id,
				self.image_id
			);
		}
		if !self.tile_geometry.is_valid() {
			bail!("region request '{}' has invalid tile geometry", self.region_id);
		}
		Ok(())
	}
}
