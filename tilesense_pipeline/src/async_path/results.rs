//! The results half of the asynchronous path.
//!
//! Consumes result-notification events from the results queue, correlates
//! them back to tile-request rows by inference id or result-object URI, and
//! applies at most one terminal transition per tile. The poller tick covers
//! notifications that never arrive. When a tile's transition makes its
//! region terminal, the worker completes the region exactly as the
//! synchronous handler would.

use crate::{
	AsyncPathDeps, CleanupPolicy, RasterDataset, RasterMetadata, ResultEvent, SharedTileFactory, TileFactory,
	TileWorkerContext, annotate_features, finalize_region,
};
use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tilesense_core::metrics::{Dimensions, MetricUnit, MetricsSink, SharedMetrics, names, operations};
use tilesense_core::{RegionStatus, TileRequest, TileStatus, TimedCache};
use tilesense_geometry::{FeatureCollection, SensorModel};
use tilesense_store::{
	FeatureStore, ObjectStore, RegionRequestStore, SharedFeatureStore, SharedImageStore, SharedJobsStore,
	SharedRegionStore, SharedStatusTopic, TileRequestStore, TileTransition, WorkQueue,
};
use tokio::sync::watch;

/// Attempts to resolve a correlation lookup before deferring to the poller.
/// Covers the race where a notification lands before the submission worker
/// has stored the inference id.
const LOOKUP_ATTEMPTS: u32 = 3;
const LOOKUP_BACKOFF: Duration = Duration::from_millis(100);

pub struct AsyncResultsWorker {
	deps: Arc<AsyncPathDeps>,
	tile_factory: SharedTileFactory,
	feature_store: SharedFeatureStore,
	region_store: SharedRegionStore,
	image_store: SharedImageStore,
	jobs_store: SharedJobsStore,
	status_topic: SharedStatusTopic,
	metrics: SharedMetrics,
	/// Datasets are re-opened per image at most once per TTL window; results
	/// for the same image reuse the sensor model.
	dataset_cache: parking_lot::Mutex<TimedCache<String, crate::SharedRasterDataset>>,
}

impl AsyncResultsWorker {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		deps: Arc<AsyncPathDeps>,
		tile_factory: SharedTileFactory,
		feature_store: SharedFeatureStore,
		region_store: SharedRegionStore,
		image_store: SharedImageStore,
		jobs_store: SharedJobsStore,
		status_topic: SharedStatusTopic,
		metrics: SharedMetrics,
	) -> Arc<Self> {
		Arc::new(Self {
			deps,
			tile_factory,
			feature_store,
			region_store,
			image_store,
			jobs_store,
			status_topic,
			metrics,
			dataset_cache: parking_lot::Mutex::new(TimedCache::new(Duration::from_secs(300), 32)),
		})
	}

	/// Drives the results queue until shutdown.
	pub async fn run(&self, shutdown: watch::Receiver<bool>) {
		let mut iterations: u64 = 0;
		while !*shutdown.borrow() {
			// Reap expired tile-request rows occasionally; the TTL is the
			// only lifecycle async tiles have.
			iterations += 1;
			if iterations % 60 == 1 {
				match self.deps.tile_store.purge_expired(tilesense_core::epoch_seconds()).await {
					Ok(0) => {}
					Ok(purged) => log::info!("purged {purged} expired tile requests"),
					Err(error) => log::warn!("could not purge expired tile requests: {error:#}"),
				}
			}
			let messages = match self.deps.results_queue.receive(10, Duration::from_secs(1)).await {
				Ok(messages) => messages,
				Err(error) => {
					log::error!("could not receive result events: {error:#}");
					tokio::time::sleep(Duration::from_secs(1)).await;
					continue;
				}
			};
			for message in messages {
				if let Err(error) = self.handle_message(&message.body).await {
					log::error!("could not process result event: {error:#}");
				}
				// Events are acknowledged regardless: the poller is the
				// safety net, not redelivery.
				if let Err(error) = self.deps.results_queue.finish(&message.receipt).await {
					log::error!("could not acknowledge result event: {error:#}");
				}
			}
		}
	}

	pub async fn handle_message(&self, body: &str) -> Result<()> {
		let event = ResultEvent::from_message(body)?;
		self.handle_event(event).await
	}

	pub async fn handle_event(&self, event: ResultEvent) -> Result<()> {
		match event {
			ResultEvent::ObjectCreated { location } => {
				match self.find_by_output_location(&location).await {
					Some(row) => self.handle_success(row).await,
					None => {
						log::warn!("no tile request matches result object '{location}', deferring to poller");
						Ok(())
					}
				}
			}
			ResultEvent::InferenceFailed { inference_id, reason } => {
				match self.find_by_inference_id(&inference_id).await {
					Some(row) => self.handle_failure(row, &reason).await,
					None => {
						log::warn!("no tile request matches inference '{inference_id}', deferring to poller");
						Ok(())
					}
				}
			}
			ResultEvent::PollTile { region_id, tile_id } => self.handle_poll(&region_id, &tile_id).await,
		}
	}

	async fn find_by_output_location(&self, location: &str) -> Option<TileRequest> {
		self
			.find_unique(|| async { self.deps.tile_store.get_by_output_location(location).await })
			.await
	}

	async fn find_by_inference_id(&self, inference_id: &str) -> Option<TileRequest> {
		self
			.find_unique(|| async { self.deps.tile_store.get_by_inference_id(inference_id).await })
			.await
	}

	/// Runs a secondary-index lookup with bounded backoff. Exactly one match
	/// is required; several matches indicate a correlation bug and are
	/// treated as a lookup failure.
	async fn find_unique<F, Fut>(&self, lookup: F) -> Option<TileRequest>
	where
		F: Fn() -> Fut,
		Fut: Future<Output = Result<Vec<TileRequest>>>,
	{
		for attempt in 0..LOOKUP_ATTEMPTS {
			match lookup().await {
				Ok(rows) if rows.len() == 1 => return rows.into_iter().next(),
				Ok(rows) if rows.len() > 1 => {
					log::error!("correlation lookup matched {} tile requests, treating as failure", rows.len());
					return None;
				}
				Ok(_) => {}
				Err(error) => log::warn!("correlation lookup failed (attempt {}): {error:#}", attempt + 1),
			}
			if attempt + 1 < LOOKUP_ATTEMPTS {
				tokio::time::sleep(LOOKUP_BACKOFF).await;
			}
		}
		None
	}

	async fn handle_success(&self, row: TileRequest) -> Result<()> {
		if row.is_terminal() {
			return Ok(());
		}
		let output_location = row
			.output_location
			.clone()
			.context("tile request has no output location")?;

		let body = match self.deps.object_store.get_object(&output_location).await {
			Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
			Err(error) => {
				return self
					.handle_failure(row, &format!("could not download result object: {error:#}"))
					.await;
			}
		};
		let collection = match FeatureCollection::from_detector_response(&body) {
			Ok(collection) => collection,
			Err(error) => {
				return self
					.handle_failure(row, &format!("could not parse result object: {error:#}"))
					.await;
			}
		};

		let dataset = self.dataset_for(&row.image_url).await;
		let context = TileWorkerContext {
			feature_store: self.feature_store.clone(),
			region_store: self.region_store.clone(),
			metrics: self.metrics.clone(),
			model_name: row.endpoint_name.clone(),
			model_variant: None,
			source_uri: row.image_url.clone(),
			source_metadata: dataset
				.as_ref()
				.map(|dataset| dataset.metadata().clone())
				.unwrap_or_else(RasterMetadata::default),
			feature_properties: Vec::new(),
		};
		let mut features = annotate_features(collection, row.tile_bounds, &context);
		if let Some(model) = dataset.as_ref().and_then(|dataset| dataset.sensor_model()) {
			for feature in &mut features {
				model.geolocate(feature);
			}
		}

		self
			.feature_store
			.put_tile_features(&row.image_id, &row.region_id, &row.tile_id, &features)
			.await
			.context("could not store tile features")?;

		let transition = self
			.deps
			.tile_store
			.transition(&row.region_id, &row.tile_id, TileStatus::Success, None)
			.await?;
		if let TileTransition::AlreadyTerminal(existing) = transition {
			// A concurrent event won; this one is a no-op. If that event was
			// a failure, retract the features written above so a failed tile
			// never contributes any.
			if existing.status == TileStatus::Failed {
				let _ = self
					.feature_store
					.put_tile_features(&row.image_id, &row.region_id, &row.tile_id, &[])
					.await;
			}
			return Ok(());
		}
		self
			.region_store
			.add_tile_result(&row.image_id, &row.region_id, &row.tile_id, true)
			.await?;
		self.metrics.emit(
			names::TILES_PROCESSED,
			1.0,
			MetricUnit::Count,
			&Dimensions::operation(operations::ASYNC_INFERENCE).with_model_name(&row.endpoint_name),
		);

		self.cleanup_tile_objects(&row).await;
		self.complete_region_if_terminal(&row).await
	}

	async fn handle_failure(&self, row: TileRequest, reason: &str) -> Result<()> {
		let transition = self
			.deps
			.tile_store
			.transition(&row.region_id, &row.tile_id, TileStatus::Failed, Some(reason))
			.await?;
		if matches!(transition, TileTransition::AlreadyTerminal(_)) {
			return Ok(());
		}
		log::warn!("tile '{}' of region '{}' failed: {reason}", row.tile_id, row.region_id);
		self
			.region_store
			.add_tile_result(&row.image_id, &row.region_id, &row.tile_id, false)
			.await?;
		self.metrics.emit(
			names::ERRORS,
			1.0,
			MetricUnit::Count,
			&Dimensions::operation(operations::ASYNC_INFERENCE).with_model_name(&row.endpoint_name),
		);
		self.cleanup_tile_objects(&row).await;
		self.complete_region_if_terminal(&row).await
	}

	async fn handle_poll(&self, region_id: &str, tile_id: &str) -> Result<()> {
		let Some(row) = self.deps.tile_store.get_tile_request(region_id, tile_id).await? else {
			log::debug!("poller tick for unknown tile '{tile_id}' of region '{region_id}'");
			return Ok(());
		};
		if row.is_terminal() {
			return Ok(());
		}

		if let Some(output_location) = &row.output_location {
			if self.deps.object_store.object_exists(output_location).await? {
				return self.handle_success(row).await;
			}
		}
		if let Some(failure_location) = &row.failure_location {
			if self.deps.object_store.object_exists(failure_location).await? {
				let reason = match self.deps.object_store.get_object(failure_location).await {
					Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
					Err(_) => "endpoint reported failure".to_string(),
				};
				return self.handle_failure(row, &reason).await;
			}
		}

		// Neither object exists yet; check again after another delay.
		let poll = ResultEvent::PollTile {
			region_id: region_id.to_string(),
			tile_id: tile_id.to_string(),
		};
		self
			.deps
			.results_queue
			.send_delayed(&poll.to_message()?, self.deps.poller_delay)
			.await
			.context("could not re-schedule tile poller")
	}

	async fn dataset_for(&self, image_url: &str) -> Option<crate::SharedRasterDataset> {
		if image_url.is_empty() {
			return None;
		}
		let key = image_url.to_string();
		if let Some(dataset) = self.dataset_cache.lock().get(&key) {
			return Some(dataset);
		}
		match self.tile_factory.open(image_url, None).await {
			Ok(dataset) => {
				self.dataset_cache.lock().add(key, dataset.clone());
				Some(dataset)
			}
			Err(error) => {
				log::warn!("could not re-open '{image_url}' for geolocation: {error:#}");
				None
			}
		}
	}

	async fn cleanup_tile_objects(&self, row: &TileRequest) {
		for location in [&row.input_location, &row.output_location, &row.failure_location]
			.into_iter()
			.flatten()
		{
			self.deps.resource_manager.register_object(location, CleanupPolicy::Immediate);
		}
		self.deps.resource_manager.process_pending().await;
	}

	/// Completes the region once every tile is terminal.
	async fn complete_region_if_terminal(&self, row: &TileRequest) -> Result<()> {
		let record = self
			.region_store
			.get_region(&row.image_id, &row.region_id)
			.await?
			.context("region row disappeared while async tiles were in flight")?;
		if !record.tiles_terminal() || record.status.is_terminal() {
			return Ok(());
		}
		let job_id = row.image_id.split_once(':').map_or(row.image_id.as_str(), |(job_id, _)| job_id);
		finalize_region(
			&self.region_store,
			&self.image_store,
			&self.jobs_store,
			&self.status_topic,
			&row.image_id,
			&row.region_id,
			&row.endpoint_name,
			job_id,
			RegionStatus::Success,
		)
		.await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		AsyncSubmissionProcessor, MemoryAsyncEndpoint, ResourceManager, SyntheticRasterDataset, SyntheticTileFactory,
		TileJob, TileProcessor,
	};
	use pretty_assertions::assert_eq;
	use tilesense_core::metrics::MemoryMetricsSink;
	use tilesense_core::{ImageRequest, PixelWindow, RegionRequest, epoch_seconds};
	use tilesense_store::{
		FeatureStore, ImageRequestRecord, ImageRequestStore, MemoryFeatureStore, MemoryImageStore, MemoryJobsStore,
		MemoryObjectStore, MemoryRegionStore, MemoryStatusTopic, MemoryTileStore, MemoryWorkQueue, ObjectStore,
		RegionRequestRecord, RegionRequestStore, TileRequestStore, WorkQueue,
	};

	struct Fixture {
		deps: Arc<AsyncPathDeps>,
		object_store: Arc<MemoryObjectStore>,
		tile_store: Arc<MemoryTileStore>,
		results_queue: Arc<MemoryWorkQueue>,
		feature_store: Arc<MemoryFeatureStore>,
		region_store: Arc<MemoryRegionStore>,
		image_store: Arc<MemoryImageStore>,
		status_topic: Arc<MemoryStatusTopic>,
		worker: Arc<AsyncResultsWorker>,
	}

	fn fixture() -> Fixture {
		let endpoint = MemoryAsyncEndpoint::new("work");
		let object_store = MemoryObjectStore::new();
		let tile_store = MemoryTileStore::new();
		let results_queue = MemoryWorkQueue::new(Duration::from_secs(60));
		let deps = Arc::new(AsyncPathDeps {
			endpoint_client: endpoint,
			object_store: object_store.clone(),
			tile_store: tile_store.clone(),
			results_queue: results_queue.clone(),
			resource_manager: ResourceManager::new(object_store.clone()),
			workspace_bucket: "work".to_string(),
			input_prefix: "inputs".to_string(),
			poller_delay: Duration::from_millis(10),
		});
		let tile_factory = SyntheticTileFactory::new();
		tile_factory.insert("s3://imagery/scene.ntf", SyntheticRasterDataset::new(1024, 1024));
		let feature_store = MemoryFeatureStore::new();
		let region_store = MemoryRegionStore::new();
		let image_store = MemoryImageStore::new();
		let status_topic = MemoryStatusTopic::new();
		let worker = AsyncResultsWorker::new(
			deps.clone(),
			tile_factory,
			feature_store.clone(),
			region_store.clone(),
			image_store.clone(),
			MemoryJobsStore::new(),
			status_topic.clone(),
			MemoryMetricsSink::new(),
		);
		Fixture {
			deps,
			object_store,
			tile_store,
			results_queue,
			feature_store,
			region_store,
			image_store,
			status_topic,
			worker,
		}
	}

	fn region_request() -> RegionRequest {
		let image_request = ImageRequest::from_external_message(
			r#"{
				"jobId": "job-1",
				"imageUrls": ["s3://imagery/scene.ntf"],
				"outputs": [{"type": "S3", "bucket": "results", "prefix": "p/"}],
				"imageProcessor": {"name": "async-model", "type": "SM_ENDPOINT_ASYNC"},
				"imageProcessorTileSize": 512,
				"imageProcessorTileOverlap": 128,
				"imageProcessorTileFormat": "PNG"
			}"#,
		)
		.unwrap();
		RegionRequest::from_image_request(&image_request, PixelWindow::new(0, 0, 512, 512))
	}

	/// Submits a single-tile region and returns its tile row.
	async fn submit_one_tile(fixture: &Fixture) -> tilesense_core::TileRequest {
		let request = region_request();
		fixture
			.image_store
			.start_image(ImageRequestRecord::new(&request.image_id, "job-1", epoch_seconds()))
			.await
			.unwrap();
		fixture.image_store.set_image_stats(&request.image_id, 1, 1024, 1024).await.unwrap();
		let mut record = RegionRequestRecord::new(&request.image_id, &request.region_id, epoch_seconds());
		record.total_tile_count = 1;
		fixture.region_store.start_region(record).await.unwrap();

		let processor = AsyncSubmissionProcessor::for_region(fixture.deps.clone(), &request);
		let dir = tempfile::tempdir().unwrap();
		let bounds = PixelWindow::new(0, 0, 512, 512);
		let path = dir.path().join("tile.png");
		tokio::fs::write(&path, b"tile-bytes").await.unwrap();
		let job = TileJob {
			image_id: request.image_id.clone(),
			region_id: request.region_id.clone(),
			tile_id: bounds.id(),
			tile_bounds: bounds,
			image_path: path,
		};
		processor.process_tile(&job, b"tile-bytes").await.unwrap();
		fixture
			.tile_store
			.get_tile_request(&request.region_id, &job.tile_id)
			.await
			.unwrap()
			.unwrap()
	}

	fn detector_result() -> String {
		r#"{
			"type": "FeatureCollection",
			"features": [
				{"type": "Feature", "id": "det-1", "properties": {"bounds_imcoords": [10, 10, 30, 30], "detection_score": 0.9}}
			]
		}"#
		.to_string()
	}

	#[tokio::test]
	async fn success_notification_completes_tile_and_region() {
		let fixture = fixture();
		let row = submit_one_tile(&fixture).await;
		let output_location = row.output_location.clone().unwrap();
		fixture
			.object_store
			.put_object(&output_location, detector_result().as_bytes())
			.await
			.unwrap();

		fixture
			.worker
			.handle_event(ResultEvent::ObjectCreated {
				location: output_location.clone(),
			})
			.await
			.unwrap();

		let updated = fixture
			.tile_store
			.get_tile_request(&row.region_id, &row.tile_id)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(updated.status, TileStatus::Success);

		// Features stored and geolocated.
		let features = fixture.feature_store.get_image_features(&row.image_id).await.unwrap();
		assert_eq!(features.len(), 1);
		assert!(features[0].geometry.is_some());

		// Region finalized and image accounting rolled up.
		let record = fixture.region_store.get_region(&row.image_id, &row.region_id).await.unwrap().unwrap();
		assert!(record.status.is_terminal());
		assert!(fixture.image_store.is_image_complete(&row.image_id).await.unwrap());
		assert_eq!(fixture.status_topic.events_for(&row.image_id).len(), 1);

		// Input and output objects were cleaned up.
		assert!(!fixture.object_store.object_exists(&row.input_location.unwrap()).await.unwrap());
		assert!(!fixture.object_store.object_exists(&output_location).await.unwrap());
	}

	#[tokio::test]
	async fn duplicate_success_notification_is_a_no_op() {
		let fixture = fixture();
		let row = submit_one_tile(&fixture).await;
		let output_location = row.output_location.clone().unwrap();
		fixture
			.object_store
			.put_object(&output_location, detector_result().as_bytes())
			.await
			.unwrap();

		let event = ResultEvent::ObjectCreated {
			location: output_location,
		};
		fixture.worker.handle_event(event.clone()).await.unwrap();
		fixture.worker.handle_event(event).await.unwrap();

		// Only one region lifecycle event despite two notifications.
		assert_eq!(fixture.status_topic.events_for(&row.image_id).len(), 1);
		let record = fixture.region_store.get_region(&row.image_id, &row.region_id).await.unwrap().unwrap();
		assert_eq!(record.succeeded_tile_count(), 1);
	}

	#[tokio::test]
	async fn failure_notification_marks_tile_failed() {
		let fixture = fixture();
		let row = submit_one_tile(&fixture).await;

		fixture
			.worker
			.handle_event(ResultEvent::InferenceFailed {
				inference_id: row.inference_id.clone().unwrap(),
				reason: "model crashed".to_string(),
			})
			.await
			.unwrap();

		let updated = fixture
			.tile_store
			.get_tile_request(&row.region_id, &row.tile_id)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(updated.status, TileStatus::Failed);
		assert_eq!(updated.failure_reason.as_deref(), Some("model crashed"));

		// Region still finalizes: its one tile is terminal.
		let record = fixture.region_store.get_region(&row.image_id, &row.region_id).await.unwrap().unwrap();
		assert!(record.status.is_terminal());
		assert_eq!(record.failed_tile_count(), 1);
		// No features for a failed tile.
		assert!(fixture.feature_store.get_image_features(&row.image_id).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn poll_finds_late_result_object() {
		let fixture = fixture();
		let row = submit_one_tile(&fixture).await;

		// First tick: neither object exists, the poller re-schedules itself.
		fixture
			.worker
			.handle_event(ResultEvent::PollTile {
				region_id: row.region_id.clone(),
				tile_id: row.tile_id.clone(),
			})
			.await
			.unwrap();
		let unchanged = fixture
			.tile_store
			.get_tile_request(&row.region_id, &row.tile_id)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(unchanged.status, TileStatus::InProgress);

		// The result object appears before the next tick.
		fixture
			.object_store
			.put_object(&row.output_location.clone().unwrap(), detector_result().as_bytes())
			.await
			.unwrap();
		fixture
			.worker
			.handle_event(ResultEvent::PollTile {
				region_id: row.region_id.clone(),
				tile_id: row.tile_id.clone(),
			})
			.await
			.unwrap();
		let updated = fixture
			.tile_store
			.get_tile_request(&row.region_id, &row.tile_id)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(updated.status, TileStatus::Success);
	}

	#[tokio::test]
	async fn poll_finds_failure_object() {
		let fixture = fixture();
		let row = submit_one_tile(&fixture).await;
		fixture
			.object_store
			.put_object(&row.failure_location.clone().unwrap(), b"out of memory")
			.await
			.unwrap();

		fixture
			.worker
			.handle_event(ResultEvent::PollTile {
				region_id: row.region_id.clone(),
				tile_id: row.tile_id.clone(),
			})
			.await
			.unwrap();
		let updated = fixture
			.tile_store
			.get_tile_request(&row.region_id, &row.tile_id)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(updated.status, TileStatus::Failed);
		assert_eq!(updated.failure_reason.as_deref(), Some("out of memory"));
	}

	#[tokio::test]
	async fn unparseable_result_object_fails_the_tile() {
		let fixture = fixture();
		let row = submit_one_tile(&fixture).await;
		let output_location = row.output_location.clone().unwrap();
		fixture.object_store.put_object(&output_location, b"not geojson").await.unwrap();

		fixture
			.worker
			.handle_event(ResultEvent::ObjectCreated {
				location: output_location,
			})
			.await
			.unwrap();
		let updated = fixture
			.tile_store
			.get_tile_request(&row.region_id, &row.tile_id)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(updated.status, TileStatus::Failed);
	}

	#[tokio::test]
	async fn unmatched_event_defers_to_poller() {
		let fixture = fixture();
		fixture
			.worker
			.handle_event(ResultEvent::ObjectCreated {
				location: "s3://work/results/unknown.json".to_string(),
			})
			.await
			.unwrap();
		fixture
			.worker
			.handle_event(ResultEvent::PollTile {
				region_id: "nope".to_string(),
				tile_id: "nope".to_string(),
			})
			.await
			.unwrap();
	}
}
