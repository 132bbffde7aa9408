//! Service assembly.
//!
//! Binds collaborator implementations (queues, stores, clients) to the
//! schedulers, handlers and background workers. Deployments and tests
//! provide different collaborator sets; the wiring is identical.

use crate::{DatasetRegionCalculator, ImageRequestHandler, ModelRunner};
use std::{sync::Arc, time::Duration};
use tilesense_core::ServiceConfig;
use tilesense_core::metrics::SharedMetrics;
use tilesense_pipeline::{
	AsyncPathDeps, AsyncResultsWorker, DefaultDetectorFactory, EndpointStatistics, GridTilingStrategy,
	RegionRequestHandler, ResourceManager, SharedAsyncEndpointClient, SharedBatchEndpointClient,
	SharedSyncEndpointClient, SharedTileFactory, TilingStrategy,
};
use tilesense_scheduler::{
	BufferedImageRequestQueue, EndpointCapacityEstimator, EndpointLoadImageScheduler, EndpointMetadataCache,
	EndpointVariantSelector, SharedEndpointMetadataProvider,
};
use tilesense_store::{
	SharedFeatureStore, SharedImageStore, SharedJobsStore, SharedObjectStore, SharedRecordStream, SharedRegionStore,
	SharedStatusTopic, SharedTileStore, SharedWorkQueue,
};
use tokio::sync::watch;

/// Everything the service needs from the outside world.
pub struct ServiceCollaborators {
	pub image_queue: SharedWorkQueue,
	pub region_queue: SharedWorkQueue,
	pub results_queue: SharedWorkQueue,
	pub object_store: SharedObjectStore,
	pub stream_client: SharedRecordStream,
	pub tile_factory: SharedTileFactory,
	pub sync_client: SharedSyncEndpointClient,
	pub batch_client: Option<SharedBatchEndpointClient>,
	pub async_client: Option<SharedAsyncEndpointClient>,
	pub metadata_provider: Option<SharedEndpointMetadataProvider>,
	pub status_topic: SharedStatusTopic,
	pub feature_store: SharedFeatureStore,
	pub image_store: SharedImageStore,
	pub region_store: SharedRegionStore,
	pub tile_store: SharedTileStore,
	pub jobs_store: SharedJobsStore,
	pub metrics: SharedMetrics,
	/// Bucket used for async-path tile uploads.
	pub workspace_bucket: String,
}

/// The assembled service.
pub struct Service {
	pub runner: Arc<ModelRunner>,
	pub results_worker: Option<Arc<AsyncResultsWorker>>,
	pub resource_manager: Arc<ResourceManager>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
}

impl Service {
	pub fn build(collaborators: ServiceCollaborators, config: ServiceConfig) -> Self {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let tiling_strategy: Arc<dyn TilingStrategy> = Arc::new(GridTilingStrategy);
		let statistics = EndpointStatistics::new();
		let resource_manager = ResourceManager::new(collaborators.object_store.clone());

		let metadata_cache = collaborators
			.metadata_provider
			.clone()
			.map(EndpointMetadataCache::new);
		let capacity_estimator = metadata_cache.clone().map(|cache| {
			EndpointCapacityEstimator::new(
				cache,
				config.default_http_concurrency,
				config.default_instance_concurrency,
				collaborators.metrics.clone(),
			)
		});
		let variant_selector = metadata_cache.map(EndpointVariantSelector::new);

		let region_calculator = DatasetRegionCalculator::new(
			collaborators.tile_factory.clone(),
			tiling_strategy.clone(),
			config.region_size,
		);
		let buffered_queue = BufferedImageRequestQueue::new(
			collaborators.image_queue.clone(),
			collaborators.jobs_store.clone(),
			Some(region_calculator),
			variant_selector.clone(),
			config.max_jobs_lookahead,
			config.max_retry_attempts,
			Duration::from_secs(config.metrics_interval),
			collaborators.metrics.clone(),
		);
		let image_scheduler = EndpointLoadImageScheduler::new(
			buffered_queue,
			collaborators.jobs_store.clone(),
			capacity_estimator,
			config.throttling_enabled,
			config.capacity_target_percentage,
			config.retry_time,
			collaborators.metrics.clone(),
		);

		let async_deps = collaborators.async_client.clone().map(|endpoint_client| {
			Arc::new(AsyncPathDeps {
				endpoint_client,
				object_store: collaborators.object_store.clone(),
				tile_store: collaborators.tile_store.clone(),
				results_queue: collaborators.results_queue.clone(),
				resource_manager: resource_manager.clone(),
				workspace_bucket: collaborators.workspace_bucket.clone(),
				input_prefix: "async-tiles".to_string(),
				poller_delay: Duration::from_secs(config.tile_poller_delay),
			})
		});

		let detector_factory = match &collaborators.batch_client {
			Some(batch_client) => {
				DefaultDetectorFactory::with_batch_client(collaborators.sync_client.clone(), batch_client.clone())
			}
			None => DefaultDetectorFactory::new(collaborators.sync_client.clone()),
		};
		let region_handler = RegionRequestHandler::new(
			collaborators.tile_factory.clone(),
			collaborators.feature_store.clone(),
			collaborators.region_store.clone(),
			collaborators.image_store.clone(),
			collaborators.jobs_store.clone(),
			collaborators.status_topic.clone(),
			statistics,
			tiling_strategy.clone(),
			detector_factory,
			async_deps.clone(),
			config.clone(),
			collaborators.metrics.clone(),
		);

		let image_handler = ImageRequestHandler::new(
			collaborators.tile_factory.clone(),
			collaborators.feature_store.clone(),
			collaborators.image_store.clone(),
			collaborators.jobs_store.clone(),
			collaborators.status_topic.clone(),
			collaborators.region_queue.clone(),
			region_handler.clone(),
			variant_selector,
			tiling_strategy,
			collaborators.object_store.clone(),
			collaborators.stream_client.clone(),
			config.clone(),
			collaborators.metrics.clone(),
			shutdown_rx.clone(),
		);

		let results_worker = async_deps.map(|deps| {
			AsyncResultsWorker::new(
				deps,
				collaborators.tile_factory.clone(),
				collaborators.feature_store.clone(),
				collaborators.region_store.clone(),
				collaborators.image_store.clone(),
				collaborators.jobs_store.clone(),
				collaborators.status_topic.clone(),
				collaborators.metrics.clone(),
			)
		});

		let runner = ModelRunner::new(
			collaborators.region_queue.clone(),
			image_scheduler,
			image_handler,
			region_handler,
			config,
			shutdown_rx.clone(),
		);

		Self {
			runner,
			results_worker,
			resource_manager,
			shutdown_tx,
			shutdown_rx,
		}
	}

	pub fn shutdown_handle(&self) -> watch::Sender<bool> {
		self.shutdown_tx.clone()
	}

	/// Runs the service until the shutdown flag flips: the main loop in this
	/// task, the results worker and the cleanup task in the background.
	pub async fn run(&self) {
		let cleanup_task = self
			.resource_manager
			.spawn_background(Duration::from_secs(30), self.shutdown_rx.clone());
		let results_task = self.results_worker.clone().map(|worker| {
			let shutdown = self.shutdown_rx.clone();
			tokio::spawn(async move { worker.run(shutdown).await })
		});

		self.runner.monitor_work_queues().await;

		if let Some(task) = results_task {
			let _ = task.await;
		}
		let _ = cleanup_task.await;
		self.resource_manager.cleanup_all_resources(true).await;
	}
}
