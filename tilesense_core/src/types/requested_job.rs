//! Outstanding-job records, the scheduler's source of truth.

use crate::types::ImageRequest;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An image that has been received but not yet completed.
///
/// Keyed by `(endpoint_id, job_id)`. `last_attempt == 0` means the job has
/// never been attempted. The record embeds the serialized original request
/// so any worker in the cluster can start the image without access to the
/// upstream message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestedJob {
	pub endpoint_id: String,
	pub job_id: String,
	/// Epoch seconds at which the request was first recorded.
	pub request_time: i64,
	/// Epoch seconds of the most recent admission; 0 if never attempted.
	#[serde(default)]
	pub last_attempt: i64,
	#[serde(default)]
	pub num_attempts: u32,
	/// Region ids that have completed across the fleet.
	#[serde(default)]
	pub regions_complete: BTreeSet<String>,
	/// Total region count, known once the image header has been opened.
	#[serde(default)]
	pub region_count: Option<u32>,
	/// Serialized original [`ImageRequest`] payload.
	pub request_payload: String,
}

impl RequestedJob {
	pub fn from_image_request(request: &ImageRequest, region_count: Option<u32>, now: i64) -> Result<Self> {
		Ok(Self {
			endpoint_id: request.endpoint_id().to_string(),
			job_id: request.job_id.clone(),
			request_time: now,
			last_attempt: 0,
			num_attempts: 0,
			regions_complete: BTreeSet::new(),
			region_count,
			request_payload: serde_json::to_string(request).context("could not serialize image request payload")?,
		})
	}

	pub fn image_request(&self) -> Result<ImageRequest> {
		serde_json::from_str(&self.request_payload).context("could not parse stored image request payload")
	}

	/// Variant the job is pinned to, if its payload carries one.
	pub fn target_variant(&self) -> Option<String> {
		self
			.image_request()
			.ok()
			.and_then(|request| request.endpoint.target_variant().map(str::to_string))
	}

	/// A job counts as currently running iff it has been attempted and the
	/// attempt is younger than the retry window.
	pub fn is_running(&self, now: i64, retry_time: i64) -> bool {
		self.last_attempt > 0 && now - self.last_attempt < retry_time
	}

	/// Eligible for rescheduling: the last attempt has aged out and attempts
	/// remain.
	pub fn is_stale(&self, now: i64, retry_time: i64, max_retry_attempts: u32) -> bool {
		self.last_attempt + retry_time <= now && self.num_attempts < max_retry_attempts
	}

	pub fn is_exhausted(&self, max_retry_attempts: u32) -> bool {
		self.num_attempts >= max_retry_attempts
	}

	/// All regions accounted for, once the region count is known.
	pub fn is_complete(&self) -> bool {
		match self.region_count {
			Some(count) => self.regions_complete.len() as u32 >= count,
			None => false,
		}
	}
}
