//! Local collaborator wiring for single-node runs.
//!
//! Production deployments bind cloud clients behind the collaborator
//! traits; a local run uses the in-memory implementations (optionally with
//! a filesystem object store) and a canned detector, which is enough to
//! exercise the full pipeline end to end.

use anyhow::Result;
use async_trait::async_trait;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tilesense::ServiceCollaborators;
use tilesense_core::metrics::LogMetricsSink;
use tilesense_pipeline::{
	MemoryAsyncEndpoint, SyncEndpointClient, SyntheticRasterDataset, SyntheticTileFactory,
};
use tilesense_store::{
	FileObjectStore, MemoryFeatureStore, MemoryImageStore, MemoryJobsStore, MemoryObjectStore, MemoryRecordStream,
	MemoryRegionStore, MemoryStatusTopic, MemoryTileStore, MemoryWorkQueue, SharedObjectStore, WorkQueue,
};

/// Canned detector used by local runs: one centered detection per tile.
struct DemoSyncClient;

#[async_trait]
impl SyncEndpointClient for DemoSyncClient {
	async fn invoke_endpoint(
		&self,
		_endpoint_name: &str,
		_target_variant: Option<&str>,
		_payload: &[u8],
	) -> Result<String> {
		Ok(r#"{
			"type": "FeatureCollection",
			"features": [
				{"type": "Feature", "id": "demo", "properties": {"bounds_imcoords": [240, 240, 272, 272], "detection_score": 0.95, "class": "demo-object"}}
			]
		}"#
			.to_string())
	}
}

pub async fn local_collaborators(
	data_dir: Option<PathBuf>,
	seed_demo: bool,
	message_visibility: Duration,
) -> Result<ServiceCollaborators> {
	let object_store: SharedObjectStore = match data_dir {
		Some(dir) => FileObjectStore::new(dir),
		None => MemoryObjectStore::new(),
	};
	let image_queue = MemoryWorkQueue::new(message_visibility);
	let tile_factory = SyntheticTileFactory::new();

	if seed_demo {
		tile_factory.insert("synthetic://demo/scene-001", SyntheticRasterDataset::new(2048, 2048));
		let request = r#"{
			"jobName": "demo",
			"jobId": "demo-job-001",
			"imageUrls": ["synthetic://demo/scene-001"],
			"outputs": [{"type": "S3", "bucket": "results", "prefix": "demo/"}],
			"imageProcessor": {"name": "demo-model", "type": "SM_ENDPOINT"},
			"imageProcessorTileSize": 512,
			"imageProcessorTileOverlap": 128,
			"imageProcessorTileFormat": "PNG",
			"postProcessing": [{"step": "FEATURE_DISTILLATION", "algorithm": {"algorithmType": "NMS", "iouThreshold": 0.75}}]
		}"#;
		image_queue.send(request).await?;
		log::info!("seeded demo image request demo-job-001");
	}

	Ok(ServiceCollaborators {
		image_queue,
		region_queue: MemoryWorkQueue::new(message_visibility),
		results_queue: MemoryWorkQueue::new(Duration::from_secs(60)),
		object_store: object_store.clone(),
		stream_client: MemoryRecordStream::new(),
		tile_factory,
		sync_client: Arc::new(DemoSyncClient),
		batch_client: None,
		async_client: Some(MemoryAsyncEndpoint::new("tilesense-workspace")),
		metadata_provider: None,
		status_topic: MemoryStatusTopic::new(),
		feature_store: MemoryFeatureStore::new(),
		image_store: MemoryImageStore::new(),
		region_store: MemoryRegionStore::new(),
		tile_store: MemoryTileStore::new(),
		jobs_store: MemoryJobsStore::new(),
		metrics: Arc::new(LogMetricsSink),
		workspace_bucket: "tilesense-workspace".to_string(),
	})
}
