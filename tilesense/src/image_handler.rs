//! Image request handler.
//!
//! Turns an admitted image request into region work and drives it to
//! completion: opens the dataset, intersects the optional region of
//! interest, queues regions, executes the first region inline, waits for
//! the cluster to finish, then aggregates, deduplicates and writes the
//! final feature set to every output sink. There is one pipeline; the
//! invoke-mode variation lives in the injected region handler strategies.

use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tilesense_core::metrics::{Dimensions, MetricUnit, MetricsSink, SharedMetrics, error_codes, names, operations};
use tilesense_core::{
	ImageRequest, ImageStatus, PixelWindow, ProcessingError, RegionRequest, ServiceConfig, epoch_seconds,
	processing_error,
};
use tilesense_geometry::{Feature, FeatureCollection, SensorModel, parse_wkt_polygon, polygon_pixel_bounds};
use tilesense_pipeline::{
	NmsFeatureSelector, RasterDataset, RegionOutcome, RegionRequestHandler, SharedRasterDataset, SharedTileFactory,
	TileFactory, TilingStrategy,
};
use tilesense_scheduler::EndpointVariantSelector;
use tilesense_store::{
	FeatureSink, FeatureStore, ImageRequestRecord, ImageRequestStore, RequestedJobsStore, SharedFeatureStore,
	SharedImageStore, SharedJobsStore, SharedObjectStore, SharedRecordStream, SharedStatusTopic, SharedWorkQueue,
	StatusEvent, StatusTopic, WorkQueue, sinks_for_outputs,
};
use tokio::sync::watch;

pub struct ImageRequestHandler {
	tile_factory: SharedTileFactory,
	feature_store: SharedFeatureStore,
	image_store: SharedImageStore,
	jobs_store: SharedJobsStore,
	status_topic: SharedStatusTopic,
	region_queue: SharedWorkQueue,
	region_handler: Arc<RegionRequestHandler>,
	variant_selector: Option<Arc<EndpointVariantSelector>>,
	tiling_strategy: Arc<dyn TilingStrategy>,
	object_store: SharedObjectStore,
	stream_client: SharedRecordStream,
	config: ServiceConfig,
	metrics: SharedMetrics,
	shutdown: watch::Receiver<bool>,
}

impl ImageRequestHandler {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		tile_factory: SharedTileFactory,
		feature_store: SharedFeatureStore,
		image_store: SharedImageStore,
		jobs_store: SharedJobsStore,
		status_topic: SharedStatusTopic,
		region_queue: SharedWorkQueue,
		region_handler: Arc<RegionRequestHandler>,
		variant_selector: Option<Arc<EndpointVariantSelector>>,
		tiling_strategy: Arc<dyn TilingStrategy>,
		object_store: SharedObjectStore,
		stream_client: SharedRecordStream,
		config: ServiceConfig,
		metrics: SharedMetrics,
		shutdown: watch::Receiver<bool>,
	) -> Arc<Self> {
		Arc::new(Self {
			tile_factory,
			feature_store,
			image_store,
			jobs_store,
			status_topic,
			region_queue,
			region_handler,
			variant_selector,
			tiling_strategy,
			object_store,
			stream_client,
			config,
			metrics,
			shutdown,
		})
	}

	/// Drives one image request to a terminal status.
	///
	/// Errors escape only when the main loop should release the request for
	/// retry; every other failure marks the image `FAILED` here and returns
	/// the terminal status.
	pub async fn process_image_request(&self, request: &ImageRequest) -> Result<ImageStatus> {
		let mut request = request.clone();
		if let Some(selector) = &self.variant_selector {
			selector.select_variant(&mut request).await;
		}
		let image_id = request.image_id();

		self
			.image_store
			.start_image(ImageRequestRecord::new(&image_id, &request.job_id, epoch_seconds()))
			.await
			.map_err(|error| anyhow::Error::new(ProcessingError::RetryableJob(format!("{error:#}"))))?;
		self
			.publish(StatusEvent::image(&image_id, ImageStatus::Started, "started processing"))
			.await;

		match self.execute(&request, &image_id).await {
			Ok(status) => Ok(status),
			Err(error) => {
				if matches!(processing_error(&error), Some(ProcessingError::RetryableJob(_))) {
					// Mark nothing terminal; the attempt ages out and the
					// scheduler re-admits the job.
					return Err(error);
				}
				log::error!("image '{image_id}' failed: {error:#}");
				let code = processing_error(&error).map_or(error_codes::PROCESSING_FAILURE, ProcessingError::code);
				self.emit_image_error(&request, code);
				self.fail_image(&request, &image_id, &format!("{error:#}")).await;
				Ok(ImageStatus::Failed)
			}
		}
	}

	async fn execute(&self, request: &ImageRequest, image_id: &str) -> Result<ImageStatus> {
		let dataset = self
			.tile_factory
			.open(&request.image_url, request.image_read_role.as_deref())
			.await?;
		let metadata = dataset.metadata().clone();
		let full_extent = PixelWindow::from_image_size(metadata.width, metadata.height);

		let Some(processing_bounds) = self.processing_bounds(request, &dataset, full_extent)? else {
			log::info!("requested ROI does not intersect image '{image_id}', nothing to do");
			self.emit_image_error(request, error_codes::INVALID_ROI);
			self
				.finalize(request, image_id, ImageStatus::Failed, "ROI has no intersection with image")
				.await?;
			return Ok(ImageStatus::Failed);
		};

		let regions = self.tiling_strategy.compute_regions(
			processing_bounds,
			(self.config.region_size, self.config.region_size),
			&request.tile_geometry,
		);
		let region_count = regions.len() as u32;
		self
			.image_store
			.set_image_stats(image_id, region_count, metadata.width, metadata.height)
			.await?;
		self
			.jobs_store
			.set_region_count(request.endpoint_id(), &request.job_id, region_count)
			.await?;
		log::info!("image '{image_id}' splits into {region_count} regions over {processing_bounds}");

		// This worker keeps the first region for itself; the rest go to the
		// cluster through the region queue.
		let mut region_iter = regions.into_iter();
		let first_region = region_iter.next().context("tiling produced no regions")?;
		for region_bounds in region_iter {
			let region_request = RegionRequest::from_image_request(request, region_bounds);
			self
				.region_queue
				.send(&region_request.to_message()?)
				.await
				.context("could not queue region request")?;
		}

		let first_request = RegionRequest::from_image_request(request, first_region);
		match self
			.region_handler
			.process_region_request(&first_request, Some(dataset.clone()))
			.await?
		{
			RegionOutcome::SelfThrottled => {
				// Do not hold the image hostage on a saturated endpoint;
				// hand the region to the cluster like the others.
				self.region_queue.send(&first_request.to_message()?).await?;
			}
			RegionOutcome::Completed { .. } | RegionOutcome::AsyncPending { .. } => {}
		}

		self.wait_for_regions(image_id).await?;

		let features = self.aggregate_features(request, image_id, &dataset, processing_bounds).await?;
		self.write_outputs(request, image_id, features).await?;

		let row = self
			.image_store
			.get_image(image_id)
			.await?
			.context("image row disappeared")?;
		let status = if row.region_count > 0 && row.regions_failed >= row.region_count {
			ImageStatus::Failed
		} else if row.regions_failed > 0 || row.regions_with_failed_tiles > 0 {
			ImageStatus::Partial
		} else {
			ImageStatus::Success
		};
		let message = format!(
			"processing complete: {} of {} regions failed, {} reported failed tiles",
			row.regions_failed, row.region_count, row.regions_with_failed_tiles
		);
		self.finalize(request, image_id, status, &message).await?;
		Ok(status)
	}

	/// Intersects the image extent with the optional region of interest.
	/// Returns `None` when the ROI and the image are disjoint.
	fn processing_bounds(
		&self,
		request: &ImageRequest,
		dataset: &SharedRasterDataset,
		full_extent: PixelWindow,
	) -> Result<Option<PixelWindow>> {
		let Some(roi_wkt) = &request.region_of_interest else {
			return Ok(Some(full_extent));
		};
		let polygon = parse_wkt_polygon(roi_wkt)
			.map_err(|error| anyhow::Error::new(ProcessingError::InvalidRequest(format!("bad region of interest: {error:#}"))))?;
		let Some(sensor_model) = dataset.sensor_model() else {
			log::warn!(
				"image '{}' has no sensor model, processing the full extent instead of the ROI",
				request.image_url
			);
			return Ok(Some(full_extent));
		};
		let (min_x, min_y, max_x, max_y) = polygon_pixel_bounds(&polygon, sensor_model.as_ref());
		Ok(full_extent.intersect_f64(min_y, min_x, max_y, max_x))
	}

	async fn wait_for_regions(&self, image_id: &str) -> Result<()> {
		let deadline = epoch_seconds() + self.config.completion_timeout as i64;
		loop {
			if self.image_store.is_image_complete(image_id).await? {
				return Ok(());
			}
			if *self.shutdown.borrow() {
				return Err(anyhow::Error::new(ProcessingError::RetryableJob(
					"shutdown requested while waiting for regions".to_string(),
				)));
			}
			if epoch_seconds() >= deadline {
				return Err(anyhow::Error::new(ProcessingError::RetryableJob(format!(
					"timed out waiting for regions of image '{image_id}'"
				))));
			}
			log::debug!("waiting for other regions of image '{image_id}' to complete");
			tokio::time::sleep(Duration::from_secs(self.config.completion_poll_interval.max(1))).await;
		}
	}

	/// Reads all features of the image, geolocates them and runs the
	/// requested distillation across tile seams.
	async fn aggregate_features(
		&self,
		request: &ImageRequest,
		image_id: &str,
		dataset: &SharedRasterDataset,
		processing_bounds: PixelWindow,
	) -> Result<Vec<Feature>> {
		let mut features = self
			.feature_store
			.get_image_features(image_id)
			.await
			.map_err(|error| anyhow::Error::new(ProcessingError::AggregateFeatures(format!("{error:#}"))))?;

		match dataset.sensor_model() {
			Some(model) => {
				for feature in features.iter_mut().filter(|feature| feature.geometry.is_none()) {
					model.geolocate(feature);
				}
			}
			None => log::warn!(
				"image '{}' has no geo transform, results are not geo-referenced",
				request.image_url
			),
		}

		if let Some(iou_threshold) = request.distillation_iou_threshold() {
			let selector = NmsFeatureSelector::new(iou_threshold);
			features = self.tiling_strategy.cleanup_duplicate_features(
				processing_bounds,
				(self.config.region_size, self.config.region_size),
				&request.tile_geometry,
				features,
				&selector,
			);
		}
		Ok(features)
	}

	async fn write_outputs(&self, request: &ImageRequest, image_id: &str, features: Vec<Feature>) -> Result<()> {
		let collection = FeatureCollection::new(features);
		log::info!("writing {} aggregated features of image '{image_id}'", collection.len());
		for sink in sinks_for_outputs(&request.outputs, &self.object_store, &self.stream_client) {
			sink
				.write_features(image_id, &collection)
				.await
				.map_err(|error| anyhow::Error::new(ProcessingError::AggregateOutputFeatures(format!("{error:#}"))))?;
		}
		Ok(())
	}

	/// Writes the terminal row, publishes the terminal event with its
	/// processing duration and drops the outstanding-jobs record.
	async fn finalize(&self, request: &ImageRequest, image_id: &str, status: ImageStatus, message: &str) -> Result<()> {
		let row = self
			.image_store
			.end_image(image_id, status, Some(message), epoch_seconds())
			.await?;
		let mut event = StatusEvent::image(image_id, status, message);
		if let Some(duration) = row.processing_duration() {
			event = event.with_duration(duration);
		}
		self.publish(event).await;
		self
			.jobs_store
			.remove_request(request.endpoint_id(), &request.job_id)
			.await?;
		Ok(())
	}

	/// Best-effort failure bookkeeping: never raises, synthesizes the row
	/// if the failure struck before it existed.
	async fn fail_image(&self, request: &ImageRequest, image_id: &str, message: &str) {
		if let Ok(None) = self.image_store.get_image(image_id).await {
			let _ = self
				.image_store
				.start_image(ImageRequestRecord::new(image_id, &request.job_id, epoch_seconds()))
				.await;
		}
		if let Err(error) = self.finalize(request, image_id, ImageStatus::Failed, message).await {
			log::error!("could not record failure of image '{image_id}': {error:#}");
			let _ = self
				.status_topic
				.publish(StatusEvent::image(image_id, ImageStatus::Failed, message))
				.await;
		}
	}

	async fn publish(&self, event: StatusEvent) {
		if let Err(error) = self.status_topic.publish(event).await {
			log::error!("could not publish status event: {error:#}");
		}
	}

	fn emit_image_error(&self, request: &ImageRequest, code: &str) {
		self.metrics.emit(
			names::ERRORS,
			1.0,
			MetricUnit::Count,
			&Dimensions::operation(operations::IMAGE_PROCESSING)
				.with_model_name(request.endpoint_id())
				.with_error_code(code),
		);
	}
}
