//! Buffered image request queue.
//!
//! Maintains a bounded lookahead window of candidate images: pulls new
//! messages from the upstream work queue, validates them, computes region
//! counts, records them in the outstanding-jobs store, re-queues retryable
//! failures and dead-letters permanent ones. It is not the scheduler; it
//! produces the pool the scheduler selects from.

use crate::EndpointVariantSelector;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
	sync::Arc,
	time::{Duration, Instant},
};
use tilesense_core::metrics::{Dimensions, MetricUnit, MetricsSink, SharedMetrics, names, operations};
use tilesense_core::{ImageRequest, ProcessingError, RequestedJob, processing_error};
use tilesense_store::{AddRequestOutcome, QueueMessage, RequestedJobsStore, SharedJobsStore, SharedWorkQueue, WorkQueue};

/// Computes how many regions an image will split into. Requires opening the
/// image header, so intake learns early whether the image is reachable.
#[async_trait]
pub trait RegionCalculator: Send + Sync {
	async fn region_count(&self, request: &ImageRequest) -> Result<u32>;
}

pub type SharedRegionCalculator = Arc<dyn RegionCalculator>;

/// Messages received from the upstream queue per intake pass.
const RECEIVE_BATCH_SIZE: usize = 10;

pub struct BufferedImageRequestQueue {
	image_queue: SharedWorkQueue,
	jobs_store: SharedJobsStore,
	region_calculator: Option<SharedRegionCalculator>,
	variant_selector: Option<Arc<EndpointVariantSelector>>,
	max_jobs_lookahead: usize,
	max_retry_attempts: u32,
	metrics: SharedMetrics,
	metrics_interval: Duration,
	last_metrics_emit: Mutex<Option<Instant>>,
}

impl BufferedImageRequestQueue {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		image_queue: SharedWorkQueue,
		jobs_store: SharedJobsStore,
		region_calculator: Option<SharedRegionCalculator>,
		variant_selector: Option<Arc<EndpointVariantSelector>>,
		max_jobs_lookahead: usize,
		max_retry_attempts: u32,
		metrics_interval: Duration,
		metrics: SharedMetrics,
	) -> Arc<Self> {
		Arc::new(Self {
			image_queue,
			jobs_store,
			region_calculator,
			variant_selector,
			max_jobs_lookahead,
			max_retry_attempts,
			metrics,
			metrics_interval,
			last_metrics_emit: Mutex::new(None),
		})
	}

	/// Returns up to `max_jobs_lookahead` outstanding records, refilling the
	/// window from the upstream queue and purging finished requests first.
	///
	/// Never fails: store or queue trouble is logged and the best available
	/// (possibly empty) snapshot returned; the next tick retries.
	pub async fn get_outstanding_requests(&self) -> Vec<RequestedJob> {
		let records = match self.jobs_store.get_outstanding_requests().await {
			Ok(records) => records,
			Err(error) => {
				log::error!("could not read outstanding jobs: {error:#}");
				return Vec::new();
			}
		};

		let mut outstanding = self.purge_finished_requests(records).await;

		if outstanding.len() < self.max_jobs_lookahead {
			self.fetch_new_requests(&mut outstanding).await;
		}

		self.emit_queue_metrics(outstanding.len());
		outstanding.truncate(self.max_jobs_lookahead);
		outstanding
	}

	/// Drops records whose image is finished: complete records, and
	/// exhausted records. An exhausted record that never completed a region
	/// is dead-lettered with the original payload so operators see it.
	async fn purge_finished_requests(&self, records: Vec<RequestedJob>) -> Vec<RequestedJob> {
		let mut outstanding = Vec::with_capacity(records.len());
		for record in records {
			if record.is_complete() {
				log::debug!("purging completed job '{}'", record.job_id);
				self.remove_record(&record).await;
				continue;
			}
			if record.is_exhausted(self.max_retry_attempts) {
				if record.regions_complete.is_empty() {
					log::warn!(
						"job '{}' exhausted {} attempts without completing a region, dead-lettering",
						record.job_id,
						record.num_attempts
					);
					if let Err(error) = self.image_queue.dead_letter("", &record.request_payload).await {
						log::error!("could not dead-letter job '{}': {error:#}", record.job_id);
						// Keep the record; next tick retries the dead-letter.
						outstanding.push(record);
						continue;
					}
				} else {
					log::warn!(
						"job '{}' exhausted {} attempts with partial progress, purging",
						record.job_id,
						record.num_attempts
					);
				}
				self.remove_record(&record).await;
				continue;
			}
			outstanding.push(record);
		}
		outstanding
	}

	async fn remove_record(&self, record: &RequestedJob) {
		if let Err(error) = self.jobs_store.remove_request(&record.endpoint_id, &record.job_id).await {
			log::error!("could not remove job '{}': {error:#}", record.job_id);
		}
	}

	/// Pulls new messages until the lookahead window is full or the queue
	/// has nothing visible.
	async fn fetch_new_requests(&self, outstanding: &mut Vec<RequestedJob>) {
		while outstanding.len() < self.max_jobs_lookahead {
			let messages = match self.image_queue.receive(RECEIVE_BATCH_SIZE, Duration::ZERO).await {
				Ok(messages) => messages,
				Err(error) => {
					log::error!("could not receive image requests: {error:#}");
					return;
				}
			};
			if messages.is_empty() {
				return;
			}
			for message in messages {
				match self.intake_message(&message).await {
					IntakeOutcome::Added(record) => outstanding.push(record),
					IntakeOutcome::Skipped => {}
					IntakeOutcome::StoreUnavailable => return,
				}
			}
		}
	}

	/// Runs one message through the intake pipeline: parse, validate,
	/// compute region count, pre-select a variant, record in the store.
	async fn intake_message(&self, message: &QueueMessage) -> IntakeOutcome {
		let mut request = match ImageRequest::from_external_message(&message.body) {
			Ok(request) => request,
			Err(error) => {
				log::error!("invalid image request message, dead-lettering: {error:#}");
				self.dead_letter(message).await;
				return IntakeOutcome::Skipped;
			}
		};

		let region_count = match self.compute_region_count(&request).await {
			RegionCountOutcome::Known(count) => Some(count),
			RegionCountOutcome::Unknown => None,
			RegionCountOutcome::ImageUnreadable => {
				self.dead_letter(message).await;
				return IntakeOutcome::Skipped;
			}
			RegionCountOutcome::TransientFailure => {
				// The message stays leased and reappears after its
				// visibility timeout.
				return IntakeOutcome::Skipped;
			}
		};

		// An explicit variant override is never clobbered; the selector
		// checks that itself.
		if let Some(selector) = &self.variant_selector {
			selector.select_variant(&mut request).await;
		}

		match self.jobs_store.add_new_request(&request, region_count).await {
			Ok(AddRequestOutcome::Added) => {
				let record = self
					.jobs_store
					.get_request(request.endpoint_id(), &request.job_id)
					.await
					.ok()
					.flatten();
				self.finish(message).await;
				match record {
					Some(record) => IntakeOutcome::Added(record),
					None => IntakeOutcome::Skipped,
				}
			}
			Ok(AddRequestOutcome::AlreadyExists) => {
				log::info!("job '{}' is already outstanding, dropping duplicate delivery", request.job_id);
				self.finish(message).await;
				IntakeOutcome::Skipped
			}
			Err(error) => {
				log::error!("outstanding-jobs store unavailable, pausing intake: {error:#}");
				IntakeOutcome::StoreUnavailable
			}
		}
	}

	async fn compute_region_count(&self, request: &ImageRequest) -> RegionCountOutcome {
		let Some(calculator) = &self.region_calculator else {
			log::debug!("no region calculator configured, deferring region count for job '{}'", request.job_id);
			return RegionCountOutcome::Unknown;
		};
		match calculator.region_count(request).await {
			Ok(count) => RegionCountOutcome::Known(count),
			Err(error) => {
				if matches!(processing_error(&error), Some(ProcessingError::LoadImage(_))) {
					log::error!(
						"image '{}' of job '{}' is unreadable, dead-lettering: {error:#}",
						request.image_url,
						request.job_id
					);
					self.emit_image_access_error(request.endpoint_id());
					return RegionCountOutcome::ImageUnreadable;
				}
				log::warn!("could not compute region count for job '{}', retrying later: {error:#}", request.job_id);
				RegionCountOutcome::TransientFailure
			}
		}
	}

	async fn dead_letter(&self, message: &QueueMessage) {
		if let Err(error) = self.image_queue.dead_letter(&message.receipt, &message.body).await {
			log::error!("could not dead-letter message: {error:#}");
		}
	}

	async fn finish(&self, message: &QueueMessage) {
		if let Err(error) = self.image_queue.finish(&message.receipt).await {
			log::error!("could not acknowledge message: {error:#}");
		}
	}

	/// Emits the queue-depth metric, rate-limited so a busy scheduler does
	/// not spam the sink. Emission never raises.
	fn emit_queue_metrics(&self, depth: usize) {
		let mut last = self.last_metrics_emit.lock();
		let due = last.is_none_or(|at| at.elapsed() >= self.metrics_interval);
		if !due {
			return;
		}
		*last = Some(Instant::now());
		self.metrics.emit(
			names::QUEUE_DEPTH,
			depth as f64,
			MetricUnit::Count,
			&Dimensions::operation(operations::SCHEDULING),
		);
	}

	fn emit_image_access_error(&self, endpoint_id: &str) {
		let dimensions = Dimensions::operation(operations::SCHEDULING).with_model_name(endpoint_id);
		self.metrics.emit(names::ERRORS, 1.0, MetricUnit::Count, &dimensions);
	}
}

enum IntakeOutcome {
	Added(RequestedJob),
	Skipped,
	StoreUnavailable,
}

enum RegionCountOutcome {
	Known(u32),
	Unknown,
	ImageUnreadable,
	TransientFailure,
}
