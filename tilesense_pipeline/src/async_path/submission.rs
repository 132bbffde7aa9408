//! The submission half of the asynchronous path.
//!
//! Runs inside the tile worker pool as a [`TileProcessor`]: uploads the
//! encoded tile, records the tile-request row, invokes the endpoint, stores
//! the correlation handles and schedules the poller fallback. The local
//! temp tile is deleted once the upload has succeeded.

use crate::{
	AsyncEndpointClient, CleanupPolicy, ResourceManager, ResultEvent, SharedAsyncEndpointClient, TileJob, TileOutcome,
	TileProcessor,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tilesense_core::{ProcessingError, RegionRequest, TileRequest, TileStatus, epoch_seconds};
use tilesense_store::{
	ObjectStore, SharedObjectStore, SharedTileStore, SharedWorkQueue, TileRequestStore, WorkQueue, object_uri,
};

/// Dependencies of the async path shared across regions.
pub struct AsyncPathDeps {
	pub endpoint_client: SharedAsyncEndpointClient,
	pub object_store: SharedObjectStore,
	pub tile_store: SharedTileStore,
	pub results_queue: SharedWorkQueue,
	pub resource_manager: Arc<ResourceManager>,
	/// Bucket holding uploaded input tiles.
	pub workspace_bucket: String,
	/// Key prefix for uploaded input tiles.
	pub input_prefix: String,
	/// Delay before the poller first checks a submitted tile.
	pub poller_delay: Duration,
}

/// Per-region submission processor.
pub struct AsyncSubmissionProcessor {
	deps: Arc<AsyncPathDeps>,
	image_id: String,
	image_url: String,
	endpoint_name: String,
	tile_extension: String,
}

impl AsyncSubmissionProcessor {
	pub fn for_region(deps: Arc<AsyncPathDeps>, request: &RegionRequest) -> Arc<Self> {
		Arc::new(Self {
			deps,
			image_id: request.image_id.clone(),
			image_url: request.image_url.clone(),
			endpoint_name: request.endpoint.name.clone(),
			tile_extension: request.tile_format.extension().to_string(),
		})
	}

	fn input_location(&self, job: &TileJob) -> String {
		object_uri(
			&self.deps.workspace_bucket,
			&self.deps.input_prefix,
			&format!("{}/{}.{}", job.region_id, job.tile_id, self.tile_extension),
		)
	}
}

#[async_trait]
impl TileProcessor for AsyncSubmissionProcessor {
	async fn process_tile(&self, job: &TileJob, tile_bytes: &[u8]) -> Result<TileOutcome> {
		let input_location = self.input_location(job);
		self
			.deps
			.object_store
			.put_object(&input_location, tile_bytes)
			.await
			.map_err(|error| {
				anyhow::Error::new(ProcessingError::ObjectStoreOperation(format!(
					"could not upload tile to '{input_location}': {error:#}"
				)))
			})?;

		let now = epoch_seconds();
		let mut row = TileRequest::new(&job.region_id, &job.image_id, job.tile_bounds, &job.image_path.to_string_lossy(), now);
		row.image_url = self.image_url.clone();
		row.endpoint_name = self.endpoint_name.clone();
		row.input_location = Some(input_location.clone());
		debug_assert_eq!(row.image_id, self.image_id);
		self
			.deps
			.tile_store
			.put_tile_request(row.clone())
			.await
			.context("could not record tile request")?;

		let invocation = match self.deps.endpoint_client.invoke_async(&self.endpoint_name, &input_location).await {
			Ok(invocation) => invocation,
			Err(error) => {
				// The upload is orphaned; hand it to the cleanup queue
				// before surfacing the failure.
				self.deps.resource_manager.register_object(&input_location, CleanupPolicy::Immediate);
				let _ = self
					.deps
					.tile_store
					.transition(&job.region_id, &job.tile_id, TileStatus::Failed, Some(&format!("{error:#}")))
					.await;
				return Err(error).with_context(|| format!("could not invoke async endpoint '{}'", self.endpoint_name));
			}
		};

		row.status = TileStatus::InProgress;
		row.inference_id = Some(invocation.inference_id.clone());
		row.output_location = Some(invocation.output_location.clone());
		row.failure_location = Some(invocation.failure_location.clone());
		self
			.deps
			.tile_store
			.put_tile_request(row)
			.await
			.context("could not store inference correlation handles")?;

		let poll = ResultEvent::PollTile {
			region_id: job.region_id.clone(),
			tile_id: job.tile_id.clone(),
		};
		self
			.deps
			.results_queue
			.send_delayed(&poll.to_message()?, self.deps.poller_delay)
			.await
			.context("could not schedule tile poller")?;

		if let Err(error) = tokio::fs::remove_file(&job.image_path).await {
			if error.kind() != std::io::ErrorKind::NotFound {
				self
					.deps
					.resource_manager
					.register_temp_file(job.image_path.clone(), CleanupPolicy::Immediate);
			}
		}

		log::debug!(
			"submitted tile '{}' of region '{}' as inference '{}'",
			job.tile_id,
			job.region_id,
			invocation.inference_id
		);
		Ok(TileOutcome::SubmittedAsync)
	}
}
