//! Geo-referenced detection features.
//!
//! A [`Feature`] starts life as a raw detection reported by a remote model
//! for one tile and is augmented as it moves through the pipeline: the tile
//! worker translates its box into source-image coordinates and attaches
//! source and inference metadata, the image handler geolocates it through
//! the sensor model, and deduplication decides whether it survives.

use crate::PixelBox;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Property key carrying the pixel-space bounding box `[x1, y1, x2, y2]`.
pub const BOUNDS_IMCOORDS: &str = "bounds_imcoords";
/// Property key carrying the detection score.
pub const DETECTION_SCORE: &str = "detection_score";

/// GeoJSON geometry, restricted to the shapes the orchestrator produces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
	Point { coordinates: [f64; 2] },
	Polygon { coordinates: Vec<Vec<[f64; 2]>> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
	pub id: String,
	/// Bounding box in source-image pixel coordinates.
	pub pixel_bounds: PixelBox,
	/// Geographic geometry, present once the feature has been geolocated.
	#[serde(default)]
	pub geometry: Option<Geometry>,
	/// Detector confidence in `[0, 1]`; 1.0 when the model reports none.
	#[serde(default = "default_score")]
	pub score: f64,
	#[serde(default)]
	pub properties: Map<String, Value>,
}

fn default_score() -> f64 {
	1.0
}

impl Feature {
	pub fn new(id: &str, pixel_bounds: PixelBox) -> Self {
		Self {
			id: id.to_string(),
			pixel_bounds,
			geometry: None,
			score: 1.0,
			properties: Map::new(),
		}
	}

	pub fn with_score(mut self, score: f64) -> Self {
		self.score = score;
		self
	}

	pub fn set_property<T: Into<Value>>(&mut self, key: &str, value: T) {
		self.properties.insert(key.to_string(), value.into());
	}

	/// Merges the entries of a JSON object into the feature's properties.
	/// Existing keys are overwritten; non-object values are ignored.
	pub fn merge_properties(&mut self, value: &Value) {
		if let Value::Object(map) = value {
			for (key, entry) in map {
				self.properties.insert(key.clone(), entry.clone());
			}
		}
	}

	/// Parses one detector-reported GeoJSON feature.
	///
	/// The detector contract places the tile-space bounding box in
	/// `properties.bounds_imcoords` and an optional score in
	/// `properties.detection_score`. Returns `None` when the box is missing
	/// or malformed; the caller decides whether to log and skip.
	pub fn from_detection(value: &Value) -> Option<Self> {
		let properties = value.get("properties")?.as_object()?;
		let bounds = properties.get(BOUNDS_IMCOORDS)?.as_array()?;
		if bounds.len() != 4 {
			return None;
		}
		let corners: Vec<f64> = bounds.iter().filter_map(Value::as_f64).collect();
		if corners.len() != 4 {
			return None;
		}
		let score = properties.get(DETECTION_SCORE).and_then(Value::as_f64).unwrap_or(1.0);
		let id = value
			.get("id")
			.and_then(Value::as_str)
			.map_or_else(|| format!("det-{}-{}-{}-{}", corners[0], corners[1], corners[2], corners[3]), str::to_string);

		let mut feature = Feature::new(&id, PixelBox::new(corners[0], corners[1], corners[2], corners[3]));
		feature.score = score;
		for (key, entry) in properties {
			if key != BOUNDS_IMCOORDS && key != DETECTION_SCORE {
				feature.properties.insert(key.clone(), entry.clone());
			}
		}
		Some(feature)
	}

	/// Renders the feature as a GeoJSON value. The pixel box and score are
	/// written back into the properties so downstream consumers see the full
	/// record.
	pub fn to_geojson(&self) -> Value {
		let mut properties = self.properties.clone();
		properties.insert(BOUNDS_IMCOORDS.to_string(), json!(<[f64; 4]>::from(self.pixel_bounds)));
		properties.insert(DETECTION_SCORE.to_string(), json!(self.score));
		json!({
			"type": "Feature",
			"id": self.id,
			"geometry": self.geometry,
			"properties": properties,
		})
	}
}
