//! Per-tile records for the asynchronous inference path.
//!
//! Tile requests exist only when an endpoint runs in `SM_ENDPOINT_ASYNC`
//! mode. They are created by the submission worker, mutated by the results
//! worker and the poller, and expire by TTL. Result notifications may arrive
//! keyed either by inference id or by result-object URI, so the store keeps
//! secondary indexes on both.

use crate::types::{PixelWindow, TileStatus};
use serde::{Deserialize, Serialize};

/// Tile-request time-to-live: 7 days, in seconds.
pub const TILE_REQUEST_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TileRequest {
	pub region_id: String,
	pub tile_id: String,
	pub image_id: String,
	/// Source image URI, needed to geolocate late-arriving results.
	#[serde(default)]
	pub image_url: String,
	/// Endpoint the tile was submitted to.
	#[serde(default)]
	pub endpoint_name: String,
	/// Local path of the encoded tile at submission time.
	pub image_path: String,
	pub tile_bounds: PixelWindow,
	pub status: TileStatus,
	/// Correlation id issued by the asynchronous endpoint.
	#[serde(default)]
	pub inference_id: Option<String>,
	/// Object URI where the endpoint writes the result payload.
	#[serde(default)]
	pub output_location: Option<String>,
	/// Object URI where the endpoint writes failure details.
	#[serde(default)]
	pub failure_location: Option<String>,
	/// Object URI of the uploaded input tile.
	#[serde(default)]
	pub input_location: Option<String>,
	#[serde(default)]
	pub retry_count: u32,
	/// Failure reason recorded on terminal `Failed` transitions.
	#[serde(default)]
	pub failure_reason: Option<String>,
	/// Epoch seconds after which the record may be reaped.
	pub expire_time: i64,
}

impl TileRequest {
	pub fn new(region_id: &str, image_id: &str, tile_bounds: PixelWindow, image_path: &str, now: i64) -> Self {
		Self {
			region_id: region_id.to_string(),
			tile_id: tile_bounds.id(),
			image_id: image_id.to_string(),
			image_url: String::new(),
			endpoint_name: String::new(),
			image_path: image_path.to_string(),
			tile_bounds,
			status: TileStatus::Pending,
			inference_id: None,
			output_location: None,
			failure_location: None,
			input_location: None,
			retry_count: 0,
			failure_reason: None,
			expire_time: now + TILE_REQUEST_TTL_SECONDS,
		}
	}

	pub fn is_terminal(&self) -> bool {
		self.status.is_terminal()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn new_tile_request_is_pending_with_ttl() {
		let bounds = PixelWindow::new(0, 384, 512, 512);
		let request = TileRequest::new("region-1", "job:uri", bounds, "/tmp/tile.ntf", 1_700_000_000);
		assert_eq!(request.status, TileStatus::Pending);
		assert_eq!(request.tile_id, "0-384-512-512");
		assert_eq!(request.expire_time, 1_700_000_000 + TILE_REQUEST_TTL_SECONDS);
		assert!(!request.is_terminal());
	}
}
