//! Output sinks for aggregated feature collections.
//!
//! Each sink receives the full GeoJSON FeatureCollection for an image.
//! Object-store sinks write a single document under the configured prefix;
//! streaming sinks partition the collection into `batch_size` chunks.

use crate::{ObjectStore, SharedObjectStore, object_uri};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tilesense_core::OutputSinkSpec;
use tilesense_geometry::FeatureCollection;

#[async_trait]
pub trait FeatureSink: Send + Sync {
	async fn write_features(&self, image_id: &str, features: &FeatureCollection) -> Result<()>;
}

pub type SharedFeatureSink = Arc<dyn FeatureSink>;

/// Writes one GeoJSON document per image to an object-store prefix.
pub struct ObjectStoreSink {
	object_store: SharedObjectStore,
	bucket: String,
	prefix: String,
}

impl ObjectStoreSink {
	pub fn new(object_store: SharedObjectStore, bucket: &str, prefix: &str) -> Arc<Self> {
		Arc::new(Self {
			object_store,
			bucket: bucket.to_string(),
			prefix: prefix.to_string(),
		})
	}

	fn result_uri(&self, image_id: &str) -> String {
		// Slashes in the image id would fan out into pseudo-directories.
		let safe_id = image_id.replace(['/', ':'], "_");
		object_uri(&self.bucket, &self.prefix, &format!("{safe_id}.geojson"))
	}
}

#[async_trait]
impl FeatureSink for ObjectStoreSink {
	async fn write_features(&self, image_id: &str, features: &FeatureCollection) -> Result<()> {
		let body = features.to_geojson_string()?;
		let uri = self.result_uri(image_id);
		self
			.object_store
			.put_object(&uri, body.as_bytes())
			.await
			.with_context(|| format!("could not write aggregated features to '{uri}'"))
	}
}

/// Client for a record-stream service, the narrow slice the streaming sink
/// needs.
#[async_trait]
pub trait RecordStream: Send + Sync {
	async fn put_record(&self, stream: &str, partition_key: &str, payload: &str) -> Result<()>;
}

pub type SharedRecordStream = Arc<dyn RecordStream>;

/// Streams features in batches onto a record stream.
pub struct StreamSink {
	stream_client: SharedRecordStream,
	stream: String,
	batch_size: usize,
}

impl StreamSink {
	pub fn new(stream_client: SharedRecordStream, stream: &str, batch_size: usize) -> Arc<Self> {
		Arc::new(Self {
			stream_client,
			stream: stream.to_string(),
			batch_size,
		})
	}
}

#[async_trait]
impl FeatureSink for StreamSink {
	async fn write_features(&self, image_id: &str, features: &FeatureCollection) -> Result<()> {
		for batch in features.batches(self.batch_size) {
			let payload = batch.to_geojson_string()?;
			self
				.stream_client
				.put_record(&self.stream, image_id, &payload)
				.await
				.with_context(|| format!("could not stream features of image '{image_id}'"))?;
		}
		Ok(())
	}
}

/// In-memory record stream capturing `(stream, partition_key, payload)`.
#[derive(Default)]
pub struct MemoryRecordStream {
	records: Mutex<Vec<(String, String, String)>>,
}

impl MemoryRecordStream {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn records(&self) -> Vec<(String, String, String)> {
		self.records.lock().clone()
	}
}

#[async_trait]
impl RecordStream for MemoryRecordStream {
	async fn put_record(&self, stream: &str, partition_key: &str, payload: &str) -> Result<()> {
		self
			.records
			.lock()
			.push((stream.to_string(), partition_key.to_string(), payload.to_string()));
		Ok(())
	}
}

/// Builds the sinks an image request asked for.
pub fn sinks_for_outputs(
	outputs: &[OutputSinkSpec],
	object_store: &SharedObjectStore,
	stream_client: &SharedRecordStream,
) -> Vec<SharedFeatureSink> {
	outputs
		.iter()
		.map(|output| match output {
			OutputSinkSpec::S3 { bucket, prefix } => {
				ObjectStoreSink::new(object_store.clone(), bucket, prefix) as SharedFeatureSink
			}
			OutputSinkSpec::Kinesis { stream, batch_size } => {
				StreamSink::new(stream_client.clone(), stream, *batch_size) as SharedFeatureSink
			}
		})
		.collect()
}
