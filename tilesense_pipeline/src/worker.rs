//! The tile worker pool.
//!
//! A bounded channel carries per-tile descriptors to a fixed set of worker
//! tasks. Each worker owns an independent [`TileProcessor`]; shutdown is by
//! sentinel, one per worker. Tile-level errors are recorded against the
//! region and never escape the pool.

use crate::{FeatureDetector, raster::RasterMetadata};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::{path::PathBuf, sync::Arc};
use tilesense_core::metrics::{Dimensions, MetricUnit, MetricsSink, SharedMetrics, names, operations};
use tilesense_core::{PixelWindow, ProcessingError, epoch_seconds};
use tilesense_geometry::{Feature, FeatureCollection};
use tilesense_store::{FeatureStore, RegionRequestStore, SharedFeatureStore, SharedRegionStore};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// One tile of work: the encoded tile sits at `image_path`, its pixel
/// window within the source image is `tile_bounds`.
#[derive(Clone, Debug)]
pub struct TileJob {
	pub image_id: String,
	pub region_id: String,
	pub tile_id: String,
	pub tile_bounds: PixelWindow,
	pub image_path: PathBuf,
}

/// What a processor did with a tile.
pub enum TileOutcome {
	/// Synchronous inference finished; detections are in tile coordinates.
	Completed(FeatureCollection),
	/// The tile was handed to an asynchronous endpoint; its result arrives
	/// through the results worker.
	SubmittedAsync,
}

/// Strategy invoked by each worker for each tile.
#[async_trait]
pub trait TileProcessor: Send + Sync {
	async fn process_tile(&self, job: &TileJob, tile_bytes: &[u8]) -> Result<TileOutcome>;
}

/// Builds one processor per worker, so workers never share a client.
pub trait TileProcessorFactory: Send + Sync {
	fn create_processor(&self) -> Result<Arc<dyn TileProcessor>>;
}

/// Per-region context shared by the workers of one pool.
pub struct TileWorkerContext {
	pub feature_store: SharedFeatureStore,
	pub region_store: SharedRegionStore,
	pub metrics: SharedMetrics,
	pub model_name: String,
	pub model_variant: Option<String>,
	pub source_uri: String,
	pub source_metadata: RasterMetadata,
	pub feature_properties: Vec<Value>,
}

/// Translates detections from tile to image coordinates and attaches
/// source, inference and user metadata. Shared with the async results
/// worker so both paths annotate identically.
pub fn annotate_features(
	collection: FeatureCollection,
	tile_bounds: PixelWindow,
	context: &TileWorkerContext,
) -> Vec<Feature> {
	let now = epoch_seconds();
	collection
		.features
		.into_iter()
		.map(|mut feature| {
			feature.pixel_bounds = feature
				.pixel_bounds
				.translate(f64::from(tile_bounds.col), f64::from(tile_bounds.row));
			feature.set_property("source_uri", context.source_uri.as_str());
			if let Some(format) = &context.source_metadata.source_format {
				feature.set_property("source_format", format.as_str());
			}
			if let Some(acquired) = &context.source_metadata.acquisition_time {
				feature.set_property("acquisition_time", acquired.as_str());
			}
			feature.set_property("model_name", context.model_name.as_str());
			if let Some(variant) = &context.model_variant {
				feature.set_property("model_variant", variant.as_str());
			}
			feature.set_property("inference_time", now);
			for properties in &context.feature_properties {
				feature.merge_properties(properties);
			}
			feature
		})
		.collect()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerReport {
	pub succeeded: u32,
	pub failed: u32,
	pub submitted: u32,
}

impl WorkerReport {
	fn merge(&mut self, other: &WorkerReport) {
		self.succeeded += other.succeeded;
		self.failed += other.failed;
		self.submitted += other.submitted;
	}
}

#[derive(Debug)]
pub struct TileWorkerPool {
	sender: mpsc::Sender<Option<TileJob>>,
	handles: Vec<JoinHandle<WorkerReport>>,
	worker_count: usize,
}

impl TileWorkerPool {
	/// Spawns `worker_count` workers, each with its own processor.
	pub fn spawn(
		factory: &dyn TileProcessorFactory,
		context: Arc<TileWorkerContext>,
		worker_count: usize,
	) -> Result<Self> {
		let worker_count = worker_count.max(1);
		let (sender, receiver) = mpsc::channel::<Option<TileJob>>(worker_count * 2);
		let receiver = Arc::new(Mutex::new(receiver));

		let mut handles = Vec::with_capacity(worker_count);
		for _ in 0..worker_count {
			let processor = factory
				.create_processor()
				.map_err(|error| anyhow::Error::new(ProcessingError::SetupWorkers(format!("{error:#}"))))?;
			handles.push(tokio::spawn(worker_loop(processor, receiver.clone(), context.clone())));
		}
		log::info!("set up pool of {worker_count} tile workers");
		Ok(Self {
			sender,
			handles,
			worker_count,
		})
	}

	pub async fn submit(&self, job: TileJob) -> Result<()> {
		self
			.sender
			.send(Some(job))
			.await
			.context("tile worker pool is no longer accepting work")
	}

	/// Pushes one sentinel per worker and waits for the pool to drain.
	pub async fn shutdown(self) -> Result<WorkerReport> {
		for _ in 0..self.worker_count {
			self
				.sender
				.send(None)
				.await
				.context("could not deliver shutdown sentinel")?;
		}
		let mut report = WorkerReport::default();
		for handle in self.handles {
			let worker_report = handle.await.context("tile worker panicked")?;
			report.merge(&worker_report);
		}
		Ok(report)
	}
}

async fn worker_loop(
	processor: Arc<dyn TileProcessor>,
	receiver: Arc<Mutex<mpsc::Receiver<Option<TileJob>>>>,
	context: Arc<TileWorkerContext>,
) -> WorkerReport {
	let mut report = WorkerReport::default();
	loop {
		let job = receiver.lock().await.recv().await;
		let Some(Some(job)) = job else {
			break;
		};
		match process_one(&*processor, &job, &context).await {
			Ok(TileOutcome::Completed(_)) => report.succeeded += 1,
			Ok(TileOutcome::SubmittedAsync) => report.submitted += 1,
			Err(error) => {
				log::error!("tile '{}' of region '{}' failed: {error:#}", job.tile_id, job.region_id);
				report.failed += 1;
				record_tile_result(&context, &job, false).await;
			}
		}
	}
	report
}

async fn process_one(
	processor: &dyn TileProcessor,
	job: &TileJob,
	context: &Arc<TileWorkerContext>,
) -> Result<TileOutcome> {
	let tile_bytes = tokio::fs::read(&job.image_path)
		.await
		.with_context(|| format!("could not read encoded tile '{}'", job.image_path.display()))?;

	let outcome = processor.process_tile(job, &tile_bytes).await?;
	match &outcome {
		TileOutcome::Completed(collection) => {
			let features = annotate_features(collection.clone(), job.tile_bounds, context);
			context
				.feature_store
				.put_tile_features(&job.image_id, &job.region_id, &job.tile_id, &features)
				.await
				.context("could not store tile features")?;
			record_tile_result(context, job, true).await;
			context.metrics.emit(
				names::TILES_PROCESSED,
				1.0,
				MetricUnit::Count,
				&Dimensions::operation(operations::TILE_PROCESSING).with_model_name(&context.model_name),
			);
			remove_tile_file(&job.image_path).await;
		}
		TileOutcome::SubmittedAsync => {
			// The submission processor uploaded the tile and owns the local
			// file from here.
		}
	}
	Ok(outcome)
}

async fn record_tile_result(context: &TileWorkerContext, job: &TileJob, succeeded: bool) {
	if let Err(error) = context
		.region_store
		.add_tile_result(&job.image_id, &job.region_id, &job.tile_id, succeeded)
		.await
	{
		log::error!("could not record result of tile '{}': {error:#}", job.tile_id);
	}
	if !succeeded {
		remove_tile_file(&job.image_path).await;
	}
}

async fn remove_tile_file(path: &PathBuf) {
	if let Err(error) = tokio::fs::remove_file(path).await {
		if error.kind() != std::io::ErrorKind::NotFound {
			log::debug!("could not remove temp tile '{}': {error}", path.display());
		}
	}
}

/// Synchronous processor: invoke the detector inline and return its
/// detections.
pub struct SyncTileProcessor {
	detector: crate::SharedFeatureDetector,
}

impl SyncTileProcessor {
	pub fn new(detector: crate::SharedFeatureDetector) -> Arc<Self> {
		Arc::new(Self { detector })
	}
}

#[async_trait]
impl TileProcessor for SyncTileProcessor {
	async fn process_tile(&self, job: &TileJob, tile_bytes: &[u8]) -> Result<TileOutcome> {
		let collection = self.detector.detect(tile_bytes, job.tile_bounds).await?;
		Ok(TileOutcome::Completed(collection))
	}
}
