//! Endpoint-load image scheduler.
//!
//! Picks the single next image to admit from the buffered outstanding set,
//! or nothing when every candidate's endpoint is saturated. Groups jobs by
//! `(endpoint, variant)`, orders groups by load factor and jobs by request
//! time, and runs admission control against live endpoint capacity. The
//! conditional `start_next_attempt` update makes admission safe against
//! concurrent schedulers on other nodes.

use crate::{BufferedImageRequestQueue, EndpointCapacityEstimator};
use itertools::Itertools;
use std::{collections::HashMap, sync::Arc};
use tilesense_core::metrics::{Dimensions, MetricUnit, MetricsSink, ScopeTimer, SharedMetrics, names, operations};
use tilesense_core::{RequestedJob, epoch_seconds};
use tilesense_store::{RequestedJobsStore, SharedJobsStore, StartAttemptOutcome};

/// Estimated concurrent tile load contributed by one region.
pub const TILE_WORKERS_PER_INSTANCE: u32 = 4;
/// Conservative region count assumed for images not yet opened.
pub const DEFAULT_REGION_COUNT_GUESS: u32 = 20;

pub struct EndpointLoadImageScheduler {
	buffered_queue: Arc<BufferedImageRequestQueue>,
	jobs_store: SharedJobsStore,
	capacity_estimator: Option<Arc<EndpointCapacityEstimator>>,
	throttling_enabled: bool,
	capacity_target_percentage: f64,
	retry_time: i64,
	metrics: SharedMetrics,
}

/// Load summary for one `(endpoint, variant)` group.
#[derive(Clone, Debug)]
struct GroupSummary {
	endpoint_id: String,
	target_variant: Option<String>,
	/// Estimated tile load of currently-running jobs in the group.
	current_load: u64,
	running_job_count: usize,
	/// Live capacity from the estimator; `None` without one.
	max_capacity: Option<u32>,
}

impl GroupSummary {
	/// Ordering key: in-flight load relative to capacity.
	fn load_factor(&self) -> f64 {
		let denominator = f64::from(self.max_capacity.unwrap_or(1).max(1));
		self.current_load as f64 / denominator
	}
}

/// Estimated concurrent tile load of one image.
pub fn estimate_image_load(record: &RequestedJob) -> u64 {
	u64::from(record.region_count.unwrap_or(DEFAULT_REGION_COUNT_GUESS)) * u64::from(TILE_WORKERS_PER_INSTANCE)
}

/// Capacity left in a group after target scaling: `max(0, ⌊max_capacity ×
/// target⌋ − current_load)`.
pub fn available_capacity(max_capacity: u32, capacity_target_percentage: f64, current_load: u64) -> u64 {
	let target = (f64::from(max_capacity) * capacity_target_percentage).floor() as i64;
	(target - current_load as i64).max(0) as u64
}

impl EndpointLoadImageScheduler {
	pub fn new(
		buffered_queue: Arc<BufferedImageRequestQueue>,
		jobs_store: SharedJobsStore,
		capacity_estimator: Option<Arc<EndpointCapacityEstimator>>,
		throttling_enabled: bool,
		capacity_target_percentage: f64,
		retry_time: i64,
		metrics: SharedMetrics,
	) -> Arc<Self> {
		Arc::new(Self {
			buffered_queue,
			jobs_store,
			capacity_estimator,
			throttling_enabled,
			capacity_target_percentage,
			retry_time,
			metrics,
		})
	}

	/// Returns the next admitted image, or `None` when nothing is eligible.
	pub async fn get_next_scheduled_request(&self) -> Option<RequestedJob> {
		let scheduling = Dimensions::operation(operations::SCHEDULING);
		let _timer = ScopeTimer::start(self.metrics.clone(), names::DURATION, scheduling.clone());

		let outstanding = self.buffered_queue.get_outstanding_requests().await;
		if outstanding.is_empty() {
			self.metrics.emit(names::INVOCATIONS, 0.0, MetricUnit::Count, &scheduling);
			return None;
		}
		self.metrics.emit(names::INVOCATIONS, 1.0, MetricUnit::Count, &scheduling);
		let now = epoch_seconds();

		let mut groups: HashMap<(String, Option<String>), Vec<RequestedJob>> = HashMap::new();
		for record in outstanding {
			let key = (record.endpoint_id.clone(), record.target_variant());
			groups.entry(key).or_default().push(record);
		}

		let mut summaries = Vec::with_capacity(groups.len());
		for ((endpoint_id, target_variant), records) in &groups {
			let summary = self.summarize_group(endpoint_id, target_variant.as_deref(), records, now).await;
			self.emit_utilization(&summary);
			summaries.push(summary);
		}
		// Least-loaded groups first; ties broken by key for determinism.
		summaries.sort_by(|a, b| {
			a.load_factor()
				.partial_cmp(&b.load_factor())
				.unwrap_or(std::cmp::Ordering::Equal)
				.then_with(|| a.endpoint_id.cmp(&b.endpoint_id))
				.then_with(|| a.target_variant.cmp(&b.target_variant))
		});

		for summary in &summaries {
			let key = (summary.endpoint_id.clone(), summary.target_variant.clone());
			let candidates = groups
				.get(&key)
				.into_iter()
				.flatten()
				.filter(|record| !record.is_running(now, self.retry_time))
				.sorted_by(|a, b| {
					a.request_time
						.cmp(&b.request_time)
						.then_with(|| a.job_id.cmp(&b.job_id))
				});

			for candidate in candidates {
				if !self.evaluate_admission(candidate, summary) {
					self.emit_throttle(&summary.endpoint_id);
					continue;
				}
				match self.jobs_store.start_next_attempt(candidate).await {
					Ok(StartAttemptOutcome::Started(admitted)) => {
						log::info!(
							"scheduling job '{}' on endpoint '{}' (attempt {})",
							admitted.job_id,
							admitted.endpoint_id,
							admitted.num_attempts
						);
						return Some(admitted);
					}
					Ok(StartAttemptOutcome::Conflict) => {
						log::debug!("lost admission race for job '{}', skipping", candidate.job_id);
					}
					Err(error) => {
						log::error!("could not start attempt for job '{}': {error:#}", candidate.job_id);
					}
				}
			}
		}
		None
	}

	async fn summarize_group(
		&self,
		endpoint_id: &str,
		target_variant: Option<&str>,
		records: &[RequestedJob],
		now: i64,
	) -> GroupSummary {
		let running: Vec<&RequestedJob> = records
			.iter()
			.filter(|record| record.is_running(now, self.retry_time))
			.collect();
		let current_load = running.iter().copied().map(estimate_image_load).sum();
		let max_capacity = match &self.capacity_estimator {
			Some(estimator) => Some(estimator.estimate_capacity(endpoint_id, target_variant).await),
			None => None,
		};
		GroupSummary {
			endpoint_id: endpoint_id.to_string(),
			target_variant: target_variant.map(str::to_string),
			current_load,
			running_job_count: running.len(),
			max_capacity,
		}
	}

	/// Admission check for one candidate against its group summary.
	fn evaluate_admission(&self, candidate: &RequestedJob, summary: &GroupSummary) -> bool {
		if !self.throttling_enabled {
			return true;
		}
		let Some(max_capacity) = summary.max_capacity else {
			return true;
		};
		let required = estimate_image_load(candidate);
		let available = available_capacity(max_capacity, self.capacity_target_percentage, summary.current_load);
		if required <= available {
			log::info!(
				"Scheduling job {} with sufficient capacity. Required load: {}, Available capacity: {}, Target percentage: {:.1}%",
				candidate.job_id,
				required,
				available,
				self.capacity_target_percentage * 100.0
			);
			return true;
		}
		// Single-image exception: an image larger than its endpoint could
		// never be admitted, so it goes first in line once the group drains.
		if required > u64::from(max_capacity) && summary.running_job_count == 0 {
			log::info!(
				"Scheduling oversized job {} on idle endpoint '{}'. Required load: {}, Total capacity: {}",
				candidate.job_id,
				summary.endpoint_id,
				required,
				max_capacity
			);
			return true;
		}
		log::info!(
			"Throttling job {} due to insufficient capacity. Required load: {}, Available capacity: {}",
			candidate.job_id,
			required,
			available
		);
		false
	}

	fn emit_utilization(&self, summary: &GroupSummary) {
		let Some(max_capacity) = summary.max_capacity else {
			return;
		};
		let percent = if max_capacity == 0 {
			if summary.current_load > 0 { 100.0 } else { 0.0 }
		} else {
			(summary.current_load as f64 / f64::from(max_capacity) * 100.0).clamp(0.0, 100.0)
		};
		let dimensions = Dimensions::operation(operations::SCHEDULING).with_model_name(&summary.endpoint_id);
		self.metrics.emit(names::UTILIZATION, percent, MetricUnit::Percent, &dimensions);
	}

	fn emit_throttle(&self, endpoint_id: &str) {
		let dimensions = Dimensions::operation(operations::SCHEDULING).with_model_name(endpoint_id);
		self.metrics.emit(names::THROTTLES, 1.0, MetricUnit::Count, &dimensions);
	}
}
