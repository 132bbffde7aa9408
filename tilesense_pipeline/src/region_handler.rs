//! Region request handler.
//!
//! Executes a single region: bounds a dataset window, turns it into encoded
//! tiles, dispatches them to the worker pool and reports terminal status.
//! Control-flow outcomes (self-throttle, async handoff) are returned as
//! tagged values; real failures mark the region failed and are absorbed so
//! that region-level errors never escape to the image handler.

use crate::{
	AsyncPathDeps, AsyncSubmissionProcessor, BATCH_LINGER, BatchingFeatureDetector, EndpointFeatureDetector,
	EndpointStatistics, HttpFeatureDetector, RasterDataset, SharedBatchEndpointClient, SharedFeatureDetector,
	SharedRasterDataset, SharedSyncEndpointClient, SharedTileFactory, SyncTileProcessor, TileBatcher, TileFactory,
	TileJob, TileProcessor, TileProcessorFactory, TileWorkerContext, TileWorkerPool, TilingStrategy,
};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tilesense_core::metrics::{Dimensions, MetricUnit, MetricsSink, ScopeTimer, SharedMetrics, error_codes, names, operations};
use tilesense_core::{
	EndpointSpec, ImageStatus, InvokeMode, ProcessingError, RegionRequest, RegionStatus, ServiceConfig, epoch_seconds,
	processing_error,
};
use tilesense_store::{
	ImageRequestStore, RegionRequestRecord, RegionRequestStore, RequestedJobsStore, SharedImageStore, SharedJobsStore,
	SharedRegionStore, SharedStatusTopic, StatusEvent, StatusTopic,
};
use uuid::Uuid;

/// What the handler did with a region request.
#[derive(Debug)]
pub enum RegionOutcome {
	/// The region reached a terminal state; the final record is returned.
	Completed { record: RegionRequestRecord },
	/// Tiles were handed to an asynchronous endpoint; the results worker
	/// will complete the region.
	AsyncPending { submitted: u32 },
	/// The endpoint is at its region ceiling; re-queue with zero visibility.
	SelfThrottled,
}

/// Builds detectors for synchronous endpoints.
pub trait DetectorFactory: Send + Sync {
	fn create_detector(&self, endpoint: &EndpointSpec, invoke_role: Option<&str>) -> Result<SharedFeatureDetector>;
}

/// Default factory: URL endpoints over HTTP, named endpoints through the
/// sync client, optionally batched when the request carries a `BatchSize`
/// parameter and a batch client is wired.
pub struct DefaultDetectorFactory {
	sync_client: SharedSyncEndpointClient,
	batch_client: Option<SharedBatchEndpointClient>,
	/// One shared batcher per `(endpoint, variant)`; workers of the same
	/// endpoint feed the same buffer, which is what makes batches form.
	batchers: Mutex<HashMap<(String, Option<String>), Arc<TileBatcher>>>,
}

impl DefaultDetectorFactory {
	pub fn new(sync_client: SharedSyncEndpointClient) -> Arc<Self> {
		Arc::new(Self {
			sync_client,
			batch_client: None,
			batchers: Mutex::new(HashMap::new()),
		})
	}

	pub fn with_batch_client(sync_client: SharedSyncEndpointClient, batch_client: SharedBatchEndpointClient) -> Arc<Self> {
		Arc::new(Self {
			sync_client,
			batch_client: Some(batch_client),
			batchers: Mutex::new(HashMap::new()),
		})
	}

	fn batcher_for(&self, endpoint: &EndpointSpec, batch_size: usize, client: &SharedBatchEndpointClient) -> Arc<TileBatcher> {
		let key = (endpoint.name.clone(), endpoint.target_variant().map(str::to_string));
		self
			.batchers
			.lock()
			.entry(key)
			.or_insert_with(|| {
				TileBatcher::spawn(
					client.clone(),
					&endpoint.name,
					endpoint.target_variant(),
					batch_size,
					BATCH_LINGER,
				)
			})
			.clone()
	}
}

impl DetectorFactory for DefaultDetectorFactory {
	fn create_detector(&self, endpoint: &EndpointSpec, _invoke_role: Option<&str>) -> Result<SharedFeatureDetector> {
		match endpoint.invoke_mode {
			InvokeMode::Http => Ok(Arc::new(HttpFeatureDetector::new(&endpoint.name))),
			InvokeMode::SmSync => {
				if let (Some(client), Some(batch_size)) = (&self.batch_client, endpoint.batch_size()) {
					let batcher = self.batcher_for(endpoint, batch_size, client);
					return Ok(Arc::new(BatchingFeatureDetector::new(batcher)));
				}
				Ok(Arc::new(EndpointFeatureDetector::new(self.sync_client.clone(), endpoint)))
			}
			InvokeMode::SmAsync => Err(anyhow::Error::new(ProcessingError::UnsupportedModel(
				"asynchronous endpoints do not use synchronous detectors".to_string(),
			))),
		}
	}
}

struct SyncProcessorFactory {
	detector_factory: Arc<dyn DetectorFactory>,
	endpoint: EndpointSpec,
	invoke_role: Option<String>,
}

impl TileProcessorFactory for SyncProcessorFactory {
	fn create_processor(&self) -> Result<Arc<dyn TileProcessor>> {
		let detector = self
			.detector_factory
			.create_detector(&self.endpoint, self.invoke_role.as_deref())?;
		Ok(SyncTileProcessor::new(detector))
	}
}

struct AsyncProcessorFactory {
	processor: Arc<AsyncSubmissionProcessor>,
}

impl TileProcessorFactory for AsyncProcessorFactory {
	fn create_processor(&self) -> Result<Arc<dyn TileProcessor>> {
		Ok(self.processor.clone())
	}
}

/// Terminal accounting for a region, shared by the synchronous handler and
/// the async results worker: writes the terminal row, rolls the result up
/// into the image row and the outstanding-jobs record, and publishes the
/// region lifecycle event.
pub async fn finalize_region(
	region_store: &SharedRegionStore,
	image_store: &SharedImageStore,
	jobs_store: &SharedJobsStore,
	status_topic: &SharedStatusTopic,
	image_id: &str,
	region_id: &str,
	endpoint_id: &str,
	job_id: &str,
	status: RegionStatus,
) -> Result<RegionRequestRecord> {
	let record = region_store
		.complete_region(image_id, region_id, status, epoch_seconds())
		.await?;
	let region_failed = status == RegionStatus::Failed;
	let tile_failures = record.failed_tile_count() > 0;
	image_store.region_complete(image_id, region_failed, tile_failures).await?;
	jobs_store.complete_region(endpoint_id, job_id, region_id).await?;

	let event_status = match status {
		RegionStatus::Failed => ImageStatus::Failed,
		_ => ImageStatus::Success,
	};
	let message = format!(
		"region processed: {} tiles succeeded, {} failed",
		record.succeeded_tile_count(),
		record.failed_tile_count()
	);
	if let Err(error) = status_topic
		.publish(StatusEvent::region(image_id, region_id, event_status, &message))
		.await
	{
		log::error!("could not publish region event for '{region_id}': {error:#}");
	}
	Ok(record)
}

pub struct RegionRequestHandler {
	tile_factory: SharedTileFactory,
	feature_store: tilesense_store::SharedFeatureStore,
	region_store: SharedRegionStore,
	image_store: SharedImageStore,
	jobs_store: SharedJobsStore,
	status_topic: SharedStatusTopic,
	statistics: Arc<EndpointStatistics>,
	tiling_strategy: Arc<dyn TilingStrategy>,
	detector_factory: Arc<dyn DetectorFactory>,
	async_deps: Option<Arc<AsyncPathDeps>>,
	config: ServiceConfig,
	metrics: SharedMetrics,
}

impl RegionRequestHandler {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		tile_factory: SharedTileFactory,
		feature_store: tilesense_store::SharedFeatureStore,
		region_store: SharedRegionStore,
		image_store: SharedImageStore,
		jobs_store: SharedJobsStore,
		status_topic: SharedStatusTopic,
		statistics: Arc<EndpointStatistics>,
		tiling_strategy: Arc<dyn TilingStrategy>,
		detector_factory: Arc<dyn DetectorFactory>,
		async_deps: Option<Arc<AsyncPathDeps>>,
		config: ServiceConfig,
		metrics: SharedMetrics,
	) -> Arc<Self> {
		Arc::new(Self {
			tile_factory,
			feature_store,
			region_store,
			image_store,
			jobs_store,
			status_topic,
			statistics,
			tiling_strategy,
			detector_factory,
			async_deps,
			config,
			metrics,
		})
	}

	/// Executes one region request, optionally against an already-opened
	/// dataset (the image handler passes one for the inline first region).
	pub async fn process_region_request(
		&self,
		request: &RegionRequest,
		dataset: Option<SharedRasterDataset>,
	) -> Result<RegionOutcome> {
		request
			.validate()
			.map_err(|error| anyhow::Error::new(ProcessingError::InvalidRequest(format!("{error:#}"))))?;

		let _slot = if self.config.self_throttling {
			match self
				.statistics
				.try_start_region(&request.endpoint.name, self.config.max_regions_per_endpoint)
			{
				Some(slot) => Some(slot),
				None => {
					log::info!(
						"endpoint '{}' is at its region ceiling, throttling region '{}'",
						request.endpoint.name,
						request.region_id
					);
					return Ok(RegionOutcome::SelfThrottled);
				}
			}
		} else {
			None
		};

		let dimensions = Dimensions::operation(operations::REGION_PROCESSING).with_model_name(&request.endpoint.name);
		let _timer = ScopeTimer::start(self.metrics.clone(), names::REGION_LATENCY, dimensions.clone());

		match self.execute(request, dataset).await {
			Ok(outcome) => Ok(outcome),
			Err(error) => {
				log::error!("region '{}' of image '{}' failed: {error:#}", request.region_id, request.image_id);
				let code = processing_error(&error).map_or(error_codes::PROCESSING_FAILURE, ProcessingError::code);
				self
					.metrics
					.emit(names::ERRORS, 1.0, MetricUnit::Count, &dimensions.clone().with_error_code(code));
				self.fail_region(request).await
			}
		}
	}

	async fn execute(&self, request: &RegionRequest, dataset: Option<SharedRasterDataset>) -> Result<RegionOutcome> {
		let dataset = match dataset {
			Some(dataset) => dataset,
			None => {
				self
					.tile_factory
					.open(&request.image_url, request.image_read_role.as_deref())
					.await?
			}
		};

		let record = match self.region_store.get_region(&request.image_id, &request.region_id).await? {
			Some(record) => record,
			None => {
				let record = RegionRequestRecord::new(&request.image_id, &request.region_id, epoch_seconds());
				self.region_store.start_region(record.clone()).await?;
				record
			}
		};

		let all_tiles = self.tiling_strategy.compute_tiles(request.region_bounds, &request.tile_geometry);
		let total_tile_count = all_tiles.len() as u32;
		self
			.region_store
			.set_total_tile_count(&request.image_id, &request.region_id, total_tile_count)
			.await?;

		// A resumed region skips tiles that already reached a terminal state
		// in an earlier attempt.
		let pending: Vec<_> = all_tiles
			.into_iter()
			.filter(|tile| {
				let tile_id = tile.id();
				!record.succeeded_tile_ids.contains(&tile_id) && !record.failed_tile_ids.contains(&tile_id)
			})
			.collect();

		let context = Arc::new(TileWorkerContext {
			feature_store: self.feature_store.clone(),
			region_store: self.region_store.clone(),
			metrics: self.metrics.clone(),
			model_name: request.endpoint.name.clone(),
			model_variant: request.endpoint.target_variant().map(str::to_string),
			source_uri: request.image_url.clone(),
			source_metadata: dataset.metadata().clone(),
			feature_properties: request.feature_properties.clone(),
		});
		let factory = self.processor_factory(request)?;
		let worker_count = num_cpus::get() * self.config.workers_per_cpu.max(1);
		let pool = TileWorkerPool::spawn(factory.as_ref(), context, worker_count)?;

		let temp_dir = tempfile::tempdir().context("could not create temp directory for encoded tiles")?;
		let run_id = Uuid::new_v4();
		let mut creation_failures = 0u32;
		for tile in pending {
			let encoded = {
				let _tiling_timer = ScopeTimer::start(
					self.metrics.clone(),
					names::TILING_LATENCY,
					Dimensions::operation(operations::REGION_PROCESSING),
				);
				self
					.encode_tile_to_file(&dataset, request, tile, temp_dir.path(), &run_id)
					.await
			};
			match encoded {
				Ok(path) => {
					pool
						.submit(TileJob {
							image_id: request.image_id.clone(),
							region_id: request.region_id.clone(),
							tile_id: tile.id(),
							tile_bounds: tile,
							image_path: path,
						})
						.await?;
				}
				Err(error) => {
					log::error!("could not create tile {} of region '{}': {error:#}", tile, request.region_id);
					creation_failures += 1;
					self.metrics.emit(
						names::ERRORS,
						1.0,
						MetricUnit::Count,
						&Dimensions::operation(operations::REGION_PROCESSING)
							.with_model_name(&request.endpoint.name)
							.with_error_code(error_codes::TILE_CREATION_FAILURE),
					);
					self
						.region_store
						.add_tile_result(&request.image_id, &request.region_id, &tile.id(), false)
						.await?;
				}
			}
		}

		let report = pool.shutdown().await.map_err(|error| {
			anyhow::Error::new(ProcessingError::ProcessTiles(format!("tile worker pool failed: {error:#}")))
		})?;
		drop(temp_dir);

		log::info!(
			"processed {} tiles for region '{}' ({} succeeded, {} failed, {} submitted async, {} creation failures)",
			total_tile_count,
			request.region_id,
			report.succeeded,
			report.failed,
			report.submitted,
			creation_failures
		);

		let record = self
			.region_store
			.get_region(&request.image_id, &request.region_id)
			.await?
			.context("region row disappeared mid-processing")?;
		if request.endpoint.invoke_mode == InvokeMode::SmAsync && !record.tiles_terminal() {
			return Ok(RegionOutcome::AsyncPending {
				submitted: report.submitted,
			});
		}

		let record = finalize_region(
			&self.region_store,
			&self.image_store,
			&self.jobs_store,
			&self.status_topic,
			&request.image_id,
			&request.region_id,
			&request.endpoint.name,
			&request.job_id,
			RegionStatus::Success,
		)
		.await?;
		self.metrics.emit(
			names::REGIONS_PROCESSED,
			1.0,
			MetricUnit::Count,
			&Dimensions::operation(operations::REGION_PROCESSING).with_model_name(&request.endpoint.name),
		);
		Ok(RegionOutcome::Completed { record })
	}

	async fn encode_tile_to_file(
		&self,
		dataset: &SharedRasterDataset,
		request: &RegionRequest,
		tile: tilesense_core::PixelWindow,
		temp_dir: &std::path::Path,
		run_id: &Uuid,
	) -> Result<std::path::PathBuf> {
		let bytes = dataset
			.encode_tile(tile, request.tile_format, request.tile_compression)
			.await?;
		if bytes.is_empty() {
			anyhow::bail!("encoder produced an empty tile");
		}
		let filename = format!("{run_id}-tile-{}.{}", tile.id(), request.tile_format.extension());
		let path = temp_dir.join(filename);
		tokio::fs::write(&path, &bytes)
			.await
			.with_context(|| format!("could not write encoded tile '{}'", path.display()))?;
		Ok(path)
	}

	fn processor_factory(&self, request: &RegionRequest) -> Result<Box<dyn TileProcessorFactory>> {
		match request.endpoint.invoke_mode {
			InvokeMode::Http | InvokeMode::SmSync => Ok(Box::new(SyncProcessorFactory {
				detector_factory: self.detector_factory.clone(),
				endpoint: request.endpoint.clone(),
				invoke_role: request.model_invoke_role.clone(),
			})),
			InvokeMode::SmAsync => {
				let Some(deps) = self.async_deps.clone() else {
					// The async workflow is a pluggable extension; whether its
					// absence surfaces as a configuration error or falls back
					// to the plain unsupported-model failure is configurable.
					if self.config.extension_fallback_enabled {
						return Err(anyhow::Error::new(ProcessingError::UnsupportedModel(
							"asynchronous endpoints are not configured for this deployment".to_string(),
						)));
					}
					return Err(anyhow::Error::new(ProcessingError::ExtensionConfiguration(
						"async workflow extension is not wired: no endpoint client, tile store or results queue".to_string(),
					)));
				};
				Ok(Box::new(AsyncProcessorFactory {
					processor: AsyncSubmissionProcessor::for_region(deps, request),
				}))
			}
		}
	}

	/// Marks the region failed and completes its accounting. A failure
	/// before the row exists synthesizes a minimal one. Store failures here
	/// surface as retryable so the main loop re-queues the message.
	async fn fail_region(&self, request: &RegionRequest) -> Result<RegionOutcome> {
		match self.region_store.get_region(&request.image_id, &request.region_id).await {
			Ok(Some(_)) => {}
			Ok(None) => {
				let record = RegionRequestRecord::new(&request.image_id, &request.region_id, epoch_seconds());
				if let Err(error) = self.region_store.start_region(record).await {
					return Err(anyhow::Error::new(ProcessingError::RetryableJob(format!(
						"could not record region failure: {error:#}"
					))));
				}
			}
			Err(error) => {
				return Err(anyhow::Error::new(ProcessingError::RetryableJob(format!(
					"could not record region failure: {error:#}"
				))));
			}
		}
		match finalize_region(
			&self.region_store,
			&self.image_store,
			&self.jobs_store,
			&self.status_topic,
			&request.image_id,
			&request.region_id,
			&request.endpoint.name,
			&request.job_id,
			RegionStatus::Failed,
		)
		.await
		{
			Ok(record) => Ok(RegionOutcome::Completed { record }),
			Err(error) => Err(anyhow::Error::new(ProcessingError::RetryableJob(format!(
				"could not record region failure: {error:#}"
			)))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{FeatureDetector, GridTilingStrategy, StaticFeatureDetector, SyntheticRasterDataset, SyntheticTileFactory};
	use async_trait::async_trait;
	use pretty_assertions::assert_eq;
	use tilesense_core::metrics::MemoryMetricsSink;
	use tilesense_core::{ImageRequest, PixelWindow};
	use tilesense_store::{
		FeatureStore, ImageRequestRecord, ImageRequestStore, MemoryFeatureStore, MemoryImageStore, MemoryJobsStore,
		MemoryRegionStore, MemoryStatusTopic, RegionRequestStore, RequestedJobsStore,
	};

	struct StaticSyncClient;

	#[async_trait]
	impl crate::SyncEndpointClient for StaticSyncClient {
		async fn invoke_endpoint(
			&self,
			_endpoint_name: &str,
			_target_variant: Option<&str>,
			_payload: &[u8],
		) -> anyhow::Result<String> {
			StaticFeatureDetector::new(2, 0.9)
				.detect(b"", PixelWindow::new(0, 0, 512, 512))
				.await
				.and_then(|c| c.to_geojson_string())
		}
	}

	struct Fixture {
		factory: Arc<SyntheticTileFactory>,
		feature_store: Arc<MemoryFeatureStore>,
		region_store: Arc<MemoryRegionStore>,
		image_store: Arc<MemoryImageStore>,
		jobs_store: Arc<MemoryJobsStore>,
		status_topic: Arc<MemoryStatusTopic>,
		statistics: Arc<EndpointStatistics>,
		metrics: Arc<MemoryMetricsSink>,
	}

	impl Fixture {
		fn new() -> Self {
			Self {
				factory: SyntheticTileFactory::new(),
				feature_store: MemoryFeatureStore::new(),
				region_store: MemoryRegionStore::new(),
				image_store: MemoryImageStore::new(),
				jobs_store: MemoryJobsStore::new(),
				status_topic: MemoryStatusTopic::new(),
				statistics: EndpointStatistics::new(),
				metrics: MemoryMetricsSink::new(),
			}
		}

		fn handler(&self, config: ServiceConfig) -> Arc<RegionRequestHandler> {
			RegionRequestHandler::new(
				self.factory.clone(),
				self.feature_store.clone(),
				self.region_store.clone(),
				self.image_store.clone(),
				self.jobs_store.clone(),
				self.status_topic.clone(),
				self.statistics.clone(),
				Arc::new(GridTilingStrategy),
				DefaultDetectorFactory::new(Arc::new(StaticSyncClient)),
				None,
				config,
				self.metrics.clone(),
			)
		}

		async fn seed_image(&self, request: &RegionRequest, region_count: u32) {
			self
				.image_store
				.start_image(ImageRequestRecord::new(&request.image_id, &request.job_id, epoch_seconds()))
				.await
				.unwrap();
			self
				.image_store
				.set_image_stats(&request.image_id, region_count, 1024, 1024)
				.await
				.unwrap();
		}
	}

	fn region_request() -> RegionRequest {
		let image_request = ImageRequest::from_external_message(
			r#"{
				"jobId": "job-1",
				"imageUrls": ["s3://imagery/scene.ntf"],
				"outputs": [{"type": "S3", "bucket": "results", "prefix": "p/"}],
				"imageProcessor": {"name": "centerpoint", "type": "SM_ENDPOINT"},
				"imageProcessorTileSize": 512,
				"imageProcessorTileOverlap": 128,
				"imageProcessorTileFormat": "PNG"
			}"#,
		)
		.unwrap();
		RegionRequest::from_image_request(&image_request, PixelWindow::new(0, 0, 1024, 1024))
	}

	#[tokio::test]
	async fn region_completes_with_nine_tiles() {
		let fixture = Fixture::new();
		let request = region_request();
		fixture.factory.insert(&request.image_url, SyntheticRasterDataset::new(1024, 1024));
		fixture.seed_image(&request, 1).await;
		let handler = fixture.handler(ServiceConfig::default());

		let outcome = handler.process_region_request(&request, None).await.unwrap();
		let RegionOutcome::Completed { record } = outcome else {
			panic!("expected completed region");
		};
		assert_eq!(record.status, RegionStatus::Success);
		assert_eq!(record.total_tile_count, 9);
		assert_eq!(record.succeeded_tile_count(), 9);
		assert_eq!(record.failed_tile_count(), 0);

		// 9 tiles × 2 detections.
		let features = fixture.feature_store.get_image_features(&request.image_id).await.unwrap();
		assert_eq!(features.len(), 18);
		// Image accounting rolled up.
		assert!(fixture.image_store.is_image_complete(&request.image_id).await.unwrap());
		// Region event published.
		let events = fixture.status_topic.events_for(&request.image_id);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].region_id.as_deref(), Some(request.region_id.as_str()));
	}

	#[tokio::test]
	async fn tile_creation_failures_are_counted_not_fatal() {
		let fixture = Fixture::new();
		let request = region_request();
		let dataset = SyntheticRasterDataset::new(1024, 1024);
		dataset.fail_window(PixelWindow::new(0, 0, 512, 512));
		dataset.fail_window(PixelWindow::new(384, 384, 512, 512));
		fixture.factory.insert(&request.image_url, dataset);
		fixture.seed_image(&request, 1).await;
		let handler = fixture.handler(ServiceConfig::default());

		let outcome = handler.process_region_request(&request, None).await.unwrap();
		let RegionOutcome::Completed { record } = outcome else {
			panic!("expected completed region");
		};
		assert_eq!(record.status, RegionStatus::Success);
		assert_eq!(record.succeeded_tile_count(), 7);
		assert_eq!(record.failed_tile_count(), 2);

		// The image ends PARTIAL because a region reported failed tiles.
		let row = fixture.image_store.get_image(&request.image_id).await.unwrap().unwrap();
		assert_eq!(row.regions_failed, 0);
		assert_eq!(row.regions_with_failed_tiles, 1);
	}

	#[tokio::test]
	async fn unreachable_image_fails_the_region() {
		let fixture = Fixture::new();
		let request = region_request();
		fixture.seed_image(&request, 1).await;
		let handler = fixture.handler(ServiceConfig::default());

		let outcome = handler.process_region_request(&request, None).await.unwrap();
		let RegionOutcome::Completed { record } = outcome else {
			panic!("expected completed region");
		};
		assert_eq!(record.status, RegionStatus::Failed);
		let events = fixture.status_topic.events_for(&request.image_id);
		assert_eq!(events[0].status, ImageStatus::Failed);
	}

	#[tokio::test]
	async fn self_throttle_when_endpoint_is_saturated() {
		let fixture = Fixture::new();
		let request = region_request();
		fixture.factory.insert(&request.image_url, SyntheticRasterDataset::new(1024, 1024));
		fixture.seed_image(&request, 1).await;
		let mut config = ServiceConfig::default();
		config.max_regions_per_endpoint = 1;
		let handler = fixture.handler(config);

		// Saturate the endpoint with a held slot.
		let _held = fixture.statistics.try_start_region("centerpoint", 1).unwrap();
		let outcome = handler.process_region_request(&request, None).await.unwrap();
		assert!(matches!(outcome, RegionOutcome::SelfThrottled));

		// The slot decrement on exit keeps the counter balanced.
		drop(_held);
		assert_eq!(fixture.statistics.in_progress("centerpoint"), 0);
	}

	#[tokio::test]
	async fn resumed_region_skips_terminal_tiles() {
		let fixture = Fixture::new();
		let request = region_request();
		fixture.factory.insert(&request.image_url, SyntheticRasterDataset::new(1024, 1024));
		fixture.seed_image(&request, 1).await;

		// First attempt already recorded four successful tiles.
		let mut record = RegionRequestRecord::new(&request.image_id, &request.region_id, epoch_seconds());
		for tile in GridTilingStrategy
			.compute_tiles(request.region_bounds, &request.tile_geometry)
			.iter()
			.take(4)
		{
			record.succeeded_tile_ids.insert(tile.id());
		}
		fixture.region_store.start_region(record).await.unwrap();

		let handler = fixture.handler(ServiceConfig::default());
		let outcome = handler.process_region_request(&request, None).await.unwrap();
		let RegionOutcome::Completed { record } = outcome else {
			panic!("expected completed region");
		};
		assert_eq!(record.succeeded_tile_count(), 9);

		// Only the five remaining tiles produced features.
		let features = fixture.feature_store.get_image_features(&request.image_id).await.unwrap();
		assert_eq!(features.len(), 10);
	}

	#[tokio::test]
	async fn invalid_region_request_is_rejected() {
		let fixture = Fixture::new();
		let mut request = region_request();
		request.region_id = String::new();
		let handler = fixture.handler(ServiceConfig::default());

		let error = handler.process_region_request(&request, None).await.unwrap_err();
		assert!(matches!(
			processing_error(&error),
			Some(ProcessingError::InvalidRequest(_))
		));
	}

	#[tokio::test]
	async fn jobs_store_records_completed_region() {
		let fixture = Fixture::new();
		let request = region_request();
		fixture.factory.insert(&request.image_url, SyntheticRasterDataset::new(1024, 1024));
		fixture.seed_image(&request, 1).await;

		let image_request = ImageRequest::from_external_message(
			r#"{
				"jobId": "job-1",
				"imageUrls": ["s3://imagery/scene.ntf"],
				"outputs": [{"type": "S3", "bucket": "results", "prefix": "p/"}],
				"imageProcessor": {"name": "centerpoint", "type": "SM_ENDPOINT"}
			}"#,
		)
		.unwrap();
		fixture.jobs_store.add_new_request(&image_request, Some(1)).await.unwrap();

		let handler = fixture.handler(ServiceConfig::default());
		handler.process_region_request(&request, None).await.unwrap();

		let job = fixture.jobs_store.get_request("centerpoint", "job-1").await.unwrap().unwrap();
		assert!(job.regions_complete.contains(&request.region_id));
		assert!(job.is_complete());
	}
}
