//! Outstanding-jobs store, the scheduler's source of truth.
//!
//! The `(endpoint_id, job_id)` record is the serialization point for
//! admission: `start_next_attempt` is a conditional update on
//! `(num_attempts, last_attempt)`, so of several schedulers racing on the
//! same record at most one succeeds.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tilesense_core::{ImageRequest, RequestedJob, epoch_seconds};

/// Outcome of recording a new request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddRequestOutcome {
	Added,
	/// A record for this `(endpoint_id, job_id)` already exists.
	AlreadyExists,
}

/// Outcome of the conditional admission update.
#[derive(Clone, Debug)]
pub enum StartAttemptOutcome {
	/// The attempt was recorded; the updated record is returned.
	Started(RequestedJob),
	/// Another scheduler won the race or the record is gone.
	Conflict,
}

#[async_trait]
pub trait RequestedJobsStore: Send + Sync {
	/// Records a new outstanding request. Adding an identical request twice
	/// leaves the store unchanged after the first.
	async fn add_new_request(&self, request: &ImageRequest, region_count: Option<u32>) -> Result<AddRequestOutcome>;

	/// All outstanding records.
	async fn get_outstanding_requests(&self) -> Result<Vec<RequestedJob>>;

	async fn get_request(&self, endpoint_id: &str, job_id: &str) -> Result<Option<RequestedJob>>;

	/// Conditionally starts the next attempt: succeeds only if the stored
	/// `(num_attempts, last_attempt)` still match `expected`.
	async fn start_next_attempt(&self, expected: &RequestedJob) -> Result<StartAttemptOutcome>;

	/// Records a completed region. Idempotent per region id.
	async fn complete_region(&self, endpoint_id: &str, job_id: &str, region_id: &str) -> Result<()>;

	/// Stores the region count once the image has been opened and tiled.
	async fn set_region_count(&self, endpoint_id: &str, job_id: &str, region_count: u32) -> Result<()>;

	/// Removes a record once its image is terminal.
	async fn remove_request(&self, endpoint_id: &str, job_id: &str) -> Result<()>;
}

pub type SharedJobsStore = Arc<dyn RequestedJobsStore>;

/// In-memory outstanding-jobs store.
#[derive(Default)]
pub struct MemoryJobsStore {
	rows: Mutex<HashMap<(String, String), RequestedJob>>,
}

impl MemoryJobsStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn len(&self) -> usize {
		self.rows.lock().len()
	}
}

#[async_trait]
impl RequestedJobsStore for MemoryJobsStore {
	async fn add_new_request(&self, request: &ImageRequest, region_count: Option<u32>) -> Result<AddRequestOutcome> {
		let record = RequestedJob::from_image_request(request, region_count, epoch_seconds())?;
		let key = (record.endpoint_id.clone(), record.job_id.clone());
		let mut rows = self.rows.lock();
		if rows.contains_key(&key) {
			return Ok(AddRequestOutcome::AlreadyExists);
		}
		rows.insert(key, record);
		Ok(AddRequestOutcome::Added)
	}

	async fn get_outstanding_requests(&self) -> Result<Vec<RequestedJob>> {
		let mut records: Vec<RequestedJob> = self.rows.lock().values().cloned().collect();
		records.sort_by(|a, b| {
			a.request_time
				.cmp(&b.request_time)
				.then_with(|| a.job_id.cmp(&b.job_id))
		});
		Ok(records)
	}

	async fn get_request(&self, endpoint_id: &str, job_id: &str) -> Result<Option<RequestedJob>> {
		Ok(
			self
				.rows
				.lock()
				.get(&(endpoint_id.to_string(), job_id.to_string()))
				.cloned(),
		)
	}

	async fn start_next_attempt(&self, expected: &RequestedJob) -> Result<StartAttemptOutcome> {
		let mut rows = self.rows.lock();
		let key = (expected.endpoint_id.clone(), expected.job_id.clone());
		let Some(row) = rows.get_mut(&key) else {
			return Ok(StartAttemptOutcome::Conflict);
		};
		if row.num_attempts != expected.num_attempts || row.last_attempt != expected.last_attempt {
			return Ok(StartAttemptOutcome::Conflict);
		}
		row.num_attempts += 1;
		row.last_attempt = epoch_seconds();
		Ok(StartAttemptOutcome::Started(row.clone()))
	}

	async fn complete_region(&self, endpoint_id: &str, job_id: &str, region_id: &str) -> Result<()> {
		let mut rows = self.rows.lock();
		if let Some(row) = rows.get_mut(&(endpoint_id.to_string(), job_id.to_string())) {
			row.regions_complete.insert(region_id.to_string());
		}
		Ok(())
	}

	async fn set_region_count(&self, endpoint_id: &str, job_id: &str, region_count: u32) -> Result<()> {
		let mut rows = self.rows.lock();
		if let Some(row) = rows.get_mut(&(endpoint_id.to_string(), job_id.to_string())) {
			row.region_count = Some(region_count);
		}
		Ok(())
	}

	async fn remove_request(&self, endpoint_id: &str, job_id: &str) -> Result<()> {
		self
			.rows
			.lock()
			.remove(&(endpoint_id.to_string(), job_id.to_string()));
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn sample_request(job_id: &str) -> ImageRequest {
		ImageRequest::from_external_message(&format!(
			r#"{{
				"jobId": "{job_id}",
				"imageUrls": ["s3://imagery/scene.ntf"],
				"outputs": [{{"type": "S3", "bucket": "results", "prefix": "p/"}}],
				"imageProcessor": {{"name": "centerpoint", "type": "SM_ENDPOINT"}},
				"imageProcessorTileSize": 512,
				"imageProcessorTileOverlap": 128
			}}"#
		))
		.unwrap()
	}

	#[tokio::test]
	async fn add_is_idempotent() {
		let store = MemoryJobsStore::new();
		let request = sample_request("job-1");
		assert_eq!(
			store.add_new_request(&request, Some(3)).await.unwrap(),
			AddRequestOutcome::Added
		);
		assert_eq!(
			store.add_new_request(&request, Some(3)).await.unwrap(),
			AddRequestOutcome::AlreadyExists
		);
		assert_eq!(store.len(), 1);
	}

	#[tokio::test]
	async fn start_next_attempt_is_conditional() {
		let store = MemoryJobsStore::new();
		store.add_new_request(&sample_request("job-1"), None).await.unwrap();
		let record = store.get_request("centerpoint", "job-1").await.unwrap().unwrap();

		let first = store.start_next_attempt(&record).await.unwrap();
		let StartAttemptOutcome::Started(updated) = first else {
			panic!("expected Started");
		};
		assert_eq!(updated.num_attempts, 1);
		assert!(updated.last_attempt > 0);

		// A second scheduler holding the stale snapshot loses the race.
		let second = store.start_next_attempt(&record).await.unwrap();
		assert!(matches!(second, StartAttemptOutcome::Conflict));
	}

	#[tokio::test]
	async fn start_next_attempt_on_removed_record_conflicts() {
		let store = MemoryJobsStore::new();
		store.add_new_request(&sample_request("job-1"), None).await.unwrap();
		let record = store.get_request("centerpoint", "job-1").await.unwrap().unwrap();
		store.remove_request("centerpoint", "job-1").await.unwrap();
		assert!(matches!(
			store.start_next_attempt(&record).await.unwrap(),
			StartAttemptOutcome::Conflict
		));
	}

	#[tokio::test]
	async fn complete_region_is_idempotent() {
		let store = MemoryJobsStore::new();
		store.add_new_request(&sample_request("job-1"), Some(2)).await.unwrap();
		store.complete_region("centerpoint", "job-1", "r1").await.unwrap();
		store.complete_region("centerpoint", "job-1", "r1").await.unwrap();

		let record = store.get_request("centerpoint", "job-1").await.unwrap().unwrap();
		assert_eq!(record.regions_complete.len(), 1);
		assert!(!record.is_complete());

		store.complete_region("centerpoint", "job-1", "r2").await.unwrap();
		let record = store.get_request("centerpoint", "job-1").await.unwrap().unwrap();
		assert!(record.is_complete());
	}

	#[tokio::test]
	async fn outstanding_requests_are_fifo_by_request_time() {
		let store = MemoryJobsStore::new();
		store.add_new_request(&sample_request("job-b"), None).await.unwrap();
		store.add_new_request(&sample_request("job-a"), None).await.unwrap();
		let records = store.get_outstanding_requests().await.unwrap();
		// Same request_time second: tie broken by job id for determinism.
		assert_eq!(records.len(), 2);
		assert_eq!(records[0].job_id, "job-a");
	}
}
