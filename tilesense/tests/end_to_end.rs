//! End-to-end tests: full pipeline runs against in-memory collaborators.

use anyhow::Result;
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tilesense::{Service, ServiceCollaborators};
use tilesense_core::metrics::MemoryMetricsSink;
use tilesense_core::{ImageStatus, ServiceConfig};
use tilesense_pipeline::{
	MemoryAsyncEndpoint, ResultEvent, SyncEndpointClient, SyntheticRasterDataset, SyntheticTileFactory,
};
use tilesense_store::{
	FeatureStore, MemoryFeatureStore, MemoryImageStore, MemoryJobsStore, MemoryObjectStore, MemoryRecordStream,
	MemoryRegionStore, MemoryStatusTopic, MemoryTileStore, MemoryWorkQueue, ObjectStore, RegionRequestStore, WorkQueue,
};

/// Detector returning two detections per tile, in tile coordinates.
struct TwoDetectionClient;

#[async_trait]
impl SyncEndpointClient for TwoDetectionClient {
	async fn invoke_endpoint(
		&self,
		_endpoint_name: &str,
		_target_variant: Option<&str>,
		_payload: &[u8],
	) -> Result<String> {
		Ok(r#"{
			"type": "FeatureCollection",
			"features": [
				{"type": "Feature", "id": "a", "properties": {"bounds_imcoords": [20, 20, 40, 40], "detection_score": 0.9}},
				{"type": "Feature", "id": "b", "properties": {"bounds_imcoords": [200, 200, 220, 220], "detection_score": 0.8}}
			]
		}"#
			.to_string())
	}
}

struct Harness {
	image_queue: Arc<MemoryWorkQueue>,
	results_queue: Arc<MemoryWorkQueue>,
	object_store: Arc<MemoryObjectStore>,
	tile_factory: Arc<SyntheticTileFactory>,
	async_endpoint: Arc<MemoryAsyncEndpoint>,
	status_topic: Arc<MemoryStatusTopic>,
	feature_store: Arc<MemoryFeatureStore>,
	region_store: Arc<MemoryRegionStore>,
	jobs_store: Arc<MemoryJobsStore>,
	metrics: Arc<MemoryMetricsSink>,
	service: Service,
}

fn harness() -> Harness {
	let image_queue = MemoryWorkQueue::new(Duration::from_secs(60));
	let region_queue = MemoryWorkQueue::new(Duration::from_secs(60));
	let results_queue = MemoryWorkQueue::new(Duration::from_secs(60));
	let object_store = MemoryObjectStore::new();
	let tile_factory = SyntheticTileFactory::new();
	let async_endpoint = MemoryAsyncEndpoint::new("workspace");
	let status_topic = MemoryStatusTopic::new();
	let feature_store = MemoryFeatureStore::new();
	let region_store = MemoryRegionStore::new();
	let jobs_store = MemoryJobsStore::new();
	let metrics = MemoryMetricsSink::new();

	let mut config = ServiceConfig::default();
	config.region_queue_wait = 0;
	config.completion_poll_interval = 1;
	config.completion_timeout = 30;
	config.tile_poller_delay = 1;
	config.metrics_interval = 0;

	let collaborators = ServiceCollaborators {
		image_queue: image_queue.clone(),
		region_queue,
		results_queue: results_queue.clone(),
		object_store: object_store.clone(),
		stream_client: MemoryRecordStream::new(),
		tile_factory: tile_factory.clone(),
		sync_client: Arc::new(TwoDetectionClient),
		batch_client: None,
		async_client: Some(async_endpoint.clone()),
		metadata_provider: None,
		status_topic: status_topic.clone(),
		feature_store: feature_store.clone(),
		image_store: MemoryImageStore::new(),
		region_store: region_store.clone(),
		tile_store: MemoryTileStore::new(),
		jobs_store: jobs_store.clone(),
		metrics: metrics.clone(),
		workspace_bucket: "workspace".to_string(),
	};
	let service = Service::build(collaborators, config);
	Harness {
		image_queue,
		results_queue,
		object_store,
		tile_factory,
		async_endpoint,
		status_topic,
		feature_store,
		region_store,
		jobs_store,
		metrics,
		service,
	}
}

fn image_message(job_id: &str, image_url: &str, endpoint: &str, mode: &str, extra: &str) -> String {
	format!(
		r#"{{
			"jobName": "e2e",
			"jobId": "{job_id}",
			"imageUrls": ["{image_url}"],
			"outputs": [{{"type": "S3", "bucket": "results", "prefix": "{job_id}/"}}],
			"imageProcessor": {{"name": "{endpoint}", "type": "{mode}"}},
			"imageProcessorTileSize": 512,
			"imageProcessorTileOverlap": 128,
			"imageProcessorTileFormat": "PNG"
			{extra}
		}}"#
	)
}

/// Runs the service in the background until `done` reports true or the
/// timeout passes, then shuts it down. Returns whether `done` succeeded.
async fn run_until<F, Fut>(harness: &Harness, timeout: Duration, mut done: F) -> bool
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	let shutdown = harness.service.shutdown_handle();
	let finished = {
		let deadline = tokio::time::Instant::now() + timeout;
		// Two loop tasks: one can wait on a multi-region image while the
		// other drains the region queue, as separate workers would.
		let runner_a = harness.service.runner.clone();
		let runner_b = harness.service.runner.clone();
		let task_a = tokio::spawn(async move { runner_a.monitor_work_queues().await });
		let task_b = tokio::spawn(async move { runner_b.monitor_work_queues().await });
		let results_task = harness.service.results_worker.clone().map(|worker| {
			let shutdown = shutdown.subscribe();
			tokio::spawn(async move { worker.run(shutdown).await })
		});

		let mut finished = false;
		while tokio::time::Instant::now() < deadline {
			if done().await {
				finished = true;
				break;
			}
			tokio::time::sleep(Duration::from_millis(100)).await;
		}
		let _ = shutdown.send(true);
		let _ = task_a.await;
		let _ = task_b.await;
		if let Some(task) = results_task {
			let _ = task.await;
		}
		finished
	};
	finished
}

#[tokio::test]
async fn small_image_processes_to_success() {
	let harness = harness();
	harness
		.tile_factory
		.insert("synthetic://scene-1", SyntheticRasterDataset::new(1024, 1024));
	let nms = r#", "postProcessing": [{"step": "FEATURE_DISTILLATION", "algorithm": {"algorithmType": "NMS", "iouThreshold": 0.75}}]"#;
	harness
		.image_queue
		.send(&image_message("job-1", "synthetic://scene-1", "centerpoint", "SM_ENDPOINT", nms))
		.await
		.unwrap();

	let image_id = "job-1:synthetic://scene-1";
	let status_topic = harness.status_topic.clone();
	let finished = run_until(&harness, Duration::from_secs(20), || {
		let status_topic = status_topic.clone();
		async move {
			status_topic
				.last_image_event(image_id)
				.is_some_and(|event| event.status.is_terminal())
		}
	})
	.await;
	assert!(finished, "image did not reach a terminal status in time");

	let terminal = harness.status_topic.last_image_event(image_id).unwrap();
	assert_eq!(terminal.status, ImageStatus::Success);
	assert!(terminal.processing_duration.is_some());

	// One region, nine tiles, all successful.
	let record = harness
		.region_store
		.get_region(image_id, "0-0-1024-1024")
		.await
		.unwrap()
		.unwrap();
	assert_eq!(record.total_tile_count, 9);
	assert_eq!(record.succeeded_tile_count(), 9);

	// Nine tiles × two detections. The canned detections sit at distinct
	// image positions, so the NMS pass finds nothing to suppress and the
	// output equals the per-tile sum.
	let raw = harness.feature_store.get_image_features(image_id).await.unwrap();
	assert_eq!(raw.len(), 18);
	let uris = harness.object_store.uris();
	let output_uri = uris.iter().find(|uri| uri.starts_with("s3://results/job-1/")).unwrap();
	let body = harness.object_store.get_object(output_uri).await.unwrap();
	let output: serde_json::Value = serde_json::from_slice(&body).unwrap();
	let written = output.get("features").unwrap().as_array().unwrap().len();
	assert_eq!(written, 18);
	// Aggregation geolocated every feature through the sensor model.
	assert!(
		output
			.get("features")
			.unwrap()
			.as_array()
			.unwrap()
			.iter()
			.all(|feature| !feature.get("geometry").unwrap().is_null())
	);

	// The outstanding-jobs record is gone once the image terminates.
	assert_eq!(harness.jobs_store.len(), 0);
	// The first status event was STARTED, the last is terminal.
	let events = harness.status_topic.events_for(image_id);
	assert_eq!(events.first().unwrap().status, ImageStatus::Started);
}

#[tokio::test]
async fn roi_outside_image_fails_without_region_work() {
	let harness = harness();
	harness
		.tile_factory
		.insert("synthetic://scene-2", SyntheticRasterDataset::new(100, 100));
	// The synthetic sensor model anchors the image near (10, 50); this
	// polygon is on the other side of the world.
	let roi = r#", "regionOfInterest": "POLYGON ((-120 -45, -120 -44, -119 -44, -119 -45, -120 -45))""#;
	harness
		.image_queue
		.send(&image_message("job-2", "synthetic://scene-2", "centerpoint", "SM_ENDPOINT", roi))
		.await
		.unwrap();

	let image_id = "job-2:synthetic://scene-2";
	let status_topic = harness.status_topic.clone();
	let finished = run_until(&harness, Duration::from_secs(10), || {
		let status_topic = status_topic.clone();
		async move {
			status_topic
				.last_image_event(image_id)
				.is_some_and(|event| event.status.is_terminal())
		}
	})
	.await;
	assert!(finished);

	let terminal = harness.status_topic.last_image_event(image_id).unwrap();
	assert_eq!(terminal.status, ImageStatus::Failed);
	assert!(terminal.message.contains("ROI has no intersection"));

	// No region was ever started and the outstanding record is gone.
	assert!(
		harness
			.region_store
			.get_region(image_id, "0-0-100-100")
			.await
			.unwrap()
			.is_none()
	);
	assert_eq!(harness.jobs_store.len(), 0);
	assert!(harness.feature_store.get_image_features(image_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn tile_creation_failures_roll_up_to_partial() {
	let harness = harness();
	let dataset = SyntheticRasterDataset::new(1024, 1024);
	dataset.fail_window(tilesense_core::PixelWindow::new(0, 0, 512, 512));
	dataset.fail_window(tilesense_core::PixelWindow::new(384, 0, 512, 512));
	harness.tile_factory.insert("synthetic://scene-3", dataset);
	harness
		.image_queue
		.send(&image_message("job-3", "synthetic://scene-3", "centerpoint", "SM_ENDPOINT", ""))
		.await
		.unwrap();

	let image_id = "job-3:synthetic://scene-3";
	let status_topic = harness.status_topic.clone();
	let finished = run_until(&harness, Duration::from_secs(20), || {
		let status_topic = status_topic.clone();
		async move {
			status_topic
				.last_image_event(image_id)
				.is_some_and(|event| event.status.is_terminal())
		}
	})
	.await;
	assert!(finished);

	// The region itself succeeds with two failed tiles; the image rolls up
	// to PARTIAL.
	let record = harness
		.region_store
		.get_region(image_id, "0-0-1024-1024")
		.await
		.unwrap()
		.unwrap();
	assert_eq!(record.failed_tile_count(), 2);
	assert_eq!(record.succeeded_tile_count(), 7);
	assert_eq!(record.status, tilesense_core::RegionStatus::Success);

	let terminal = harness.status_topic.last_image_event(image_id).unwrap();
	assert_eq!(terminal.status, ImageStatus::Partial);
	assert!(terminal.processing_duration.is_some());
}

#[tokio::test]
async fn wide_image_distributes_regions_across_workers() {
	let harness = harness();
	harness
		.tile_factory
		.insert("synthetic://scene-4", SyntheticRasterDataset::new(40000, 1024));
	harness
		.image_queue
		.send(&image_message("job-4", "synthetic://scene-4", "centerpoint", "SM_ENDPOINT", ""))
		.await
		.unwrap();

	let image_id = "job-4:synthetic://scene-4";
	let status_topic = harness.status_topic.clone();
	let finished = run_until(&harness, Duration::from_secs(30), || {
		let status_topic = status_topic.clone();
		async move {
			status_topic
				.last_image_event(image_id)
				.is_some_and(|event| event.status.is_terminal())
		}
	})
	.await;
	assert!(finished, "multi-region image did not finish");

	let terminal = harness.status_topic.last_image_event(image_id).unwrap();
	assert_eq!(terminal.status, ImageStatus::Success);
	// Two regions, each with its own lifecycle event.
	let region_events: Vec<_> = harness
		.status_topic
		.events_for(image_id)
		.into_iter()
		.filter(|event| event.region_id.is_some())
		.collect();
	assert_eq!(region_events.len(), 2);
}

#[tokio::test]
async fn async_endpoint_round_trip() {
	let harness = harness();
	harness
		.tile_factory
		.insert("synthetic://scene-5", SyntheticRasterDataset::new(512, 512));
	harness
		.image_queue
		.send(&image_message("job-5", "synthetic://scene-5", "async-model", "SM_ENDPOINT_ASYNC", ""))
		.await
		.unwrap();

	// Simulated model backend: watch for submissions, write result objects,
	// send success notifications.
	let endpoint = harness.async_endpoint.clone();
	let object_store = harness.object_store.clone();
	let results_queue = harness.results_queue.clone();
	let model_task = tokio::spawn(async move {
		let result = r#"{
			"type": "FeatureCollection",
			"features": [
				{"type": "Feature", "id": "async-det", "properties": {"bounds_imcoords": [100, 100, 140, 140], "detection_score": 0.88}}
			]
		}"#;
		for _ in 0..100 {
			for (_, invocation) in endpoint.invocations() {
				if !object_store.object_exists(&invocation.output_location).await.unwrap() {
					object_store
						.put_object(&invocation.output_location, result.as_bytes())
						.await
						.unwrap();
					let event = ResultEvent::ObjectCreated {
						location: invocation.output_location.clone(),
					};
					results_queue.send(&event.to_message().unwrap()).await.unwrap();
				}
			}
			tokio::time::sleep(Duration::from_millis(100)).await;
		}
	});

	let image_id = "job-5:synthetic://scene-5";
	let status_topic = harness.status_topic.clone();
	let finished = run_until(&harness, Duration::from_secs(30), || {
		let status_topic = status_topic.clone();
		async move {
			status_topic
				.last_image_event(image_id)
				.is_some_and(|event| event.status.is_terminal())
		}
	})
	.await;
	model_task.abort();
	assert!(finished, "async image did not finish");

	let terminal = harness.status_topic.last_image_event(image_id).unwrap();
	assert_eq!(terminal.status, ImageStatus::Success);

	// The async path geolocates features at result time.
	let features = harness.feature_store.get_image_features(image_id).await.unwrap();
	assert_eq!(features.len(), 1);
	assert!(features[0].geometry.is_some());

	// Queue-depth and scheduling metrics were emitted along the way.
	assert!(harness.metrics.total_named("Invocations") >= 1.0);
}
