//! Feature collections and their GeoJSON wire format.

use crate::Feature;
use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

/// An ordered set of features, serializable as a GeoJSON FeatureCollection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureCollection {
	pub features: Vec<Feature>,
}

impl FeatureCollection {
	pub fn new(features: Vec<Feature>) -> Self {
		Self { features }
	}

	pub fn len(&self) -> usize {
		self.features.len()
	}

	pub fn is_empty(&self) -> bool {
		self.features.is_empty()
	}

	/// Parses a detector response body.
	///
	/// Features without a usable pixel box are logged and skipped rather than
	/// failing the whole tile; a model that reports nothing useful yields an
	/// empty collection.
	pub fn from_detector_response(body: &str) -> Result<Self> {
		let value: Value = serde_json::from_str(body).context("could not parse detector response as JSON")?;
		let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
		if kind != "FeatureCollection" {
			bail!("detector response is not a FeatureCollection (type='{kind}')");
		}
		let raw_features = value.get("features").and_then(Value::as_array).cloned().unwrap_or_default();

		let mut features = Vec::with_capacity(raw_features.len());
		for raw in &raw_features {
			match Feature::from_detection(raw) {
				Some(feature) => features.push(feature),
				None => log::warn!("skipping detector feature without usable pixel bounds: {raw}"),
			}
		}
		Ok(Self { features })
	}

	pub fn to_geojson(&self) -> Value {
		json!({
			"type": "FeatureCollection",
			"features": self.features.iter().map(Feature::to_geojson).collect::<Vec<_>>(),
		})
	}

	pub fn to_geojson_string(&self) -> Result<String> {
		serde_json::to_string(&self.to_geojson()).context("could not serialize feature collection")
	}

	/// Splits the collection into chunks of at most `batch_size` features,
	/// the unit streamed to batching sinks.
	pub fn batches(&self, batch_size: usize) -> Vec<FeatureCollection> {
		if batch_size == 0 {
			return vec![self.clone()];
		}
		self
			.features
			.chunks(batch_size)
			.map(|chunk| FeatureCollection::new(chunk.to_vec()))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::PixelBox;
	use pretty_assertions::assert_eq;

	fn collection_of(n: usize) -> FeatureCollection {
		FeatureCollection::new(
			(0..n)
				.map(|i| Feature::new(&format!("f-{i}"), PixelBox::new(0.0, 0.0, 1.0, 1.0)))
				.collect(),
		)
	}

	#[test]
	fn parses_detector_response() {
		let body = r#"{
			"type": "FeatureCollection",
			"features": [
				{"type": "Feature", "id": "a", "properties": {"bounds_imcoords": [0, 0, 10, 10], "detection_score": 0.9}},
				{"type": "Feature", "id": "broken", "properties": {}},
				{"type": "Feature", "id": "b", "properties": {"bounds_imcoords": [5, 5, 15, 15]}}
			]
		}"#;
		let collection = FeatureCollection::from_detector_response(body).unwrap();
		assert_eq!(collection.len(), 2);
		assert_eq!(collection.features[0].id, "a");
		assert_eq!(collection.features[1].score, 1.0);
	}

	#[test]
	fn rejects_non_feature_collection() {
		assert!(FeatureCollection::from_detector_response(r#"{"type": "Feature"}"#).is_err());
		assert!(FeatureCollection::from_detector_response("[]").is_err());
	}

	#[test]
	fn empty_features_array_is_fine() {
		let collection = FeatureCollection::from_detector_response(r#"{"type": "FeatureCollection", "features": []}"#).unwrap();
		assert!(collection.is_empty());
	}

	#[test]
	fn batches_partition_evenly() {
		let batches = collection_of(10).batches(4);
		assert_eq!(batches.iter().map(FeatureCollection::len).collect::<Vec<_>>(), vec![4, 4, 2]);
	}

	#[test]
	fn batch_size_zero_keeps_everything_together() {
		let batches = collection_of(3).batches(0);
		assert_eq!(batches.len(), 1);
		assert_eq!(batches[0].len(), 3);
	}

	#[test]
	fn geojson_round_trip() {
		let collection = collection_of(2);
		let body = collection.to_geojson_string().unwrap();
		let parsed = FeatureCollection::from_detector_response(&body).unwrap();
		assert_eq!(parsed.len(), 2);
	}
}
