//! The main loop.
//!
//! A single task drives two sources in fixed precedence: the region queue
//! first, so the cluster finishes started images before admitting new ones,
//! then the image scheduler. Handlers return tagged outcomes; this loop is
//! the only place that translates them into queue acknowledgement,
//! zero-visibility release or dead-lettering.

use crate::ImageRequestHandler;
use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tilesense_core::{ProcessingError, RegionRequest, ServiceConfig, processing_error};
use tilesense_pipeline::{RegionOutcome, RegionRequestHandler};
use tilesense_scheduler::EndpointLoadImageScheduler;
use tilesense_store::{QueueMessage, SharedWorkQueue, WorkQueue};
use tokio::sync::watch;

pub struct ModelRunner {
	region_queue: SharedWorkQueue,
	image_scheduler: Arc<EndpointLoadImageScheduler>,
	image_handler: Arc<ImageRequestHandler>,
	region_handler: Arc<RegionRequestHandler>,
	config: ServiceConfig,
	shutdown: watch::Receiver<bool>,
}

impl ModelRunner {
	pub fn new(
		region_queue: SharedWorkQueue,
		image_scheduler: Arc<EndpointLoadImageScheduler>,
		image_handler: Arc<ImageRequestHandler>,
		region_handler: Arc<RegionRequestHandler>,
		config: ServiceConfig,
		shutdown: watch::Receiver<bool>,
	) -> Arc<Self> {
		Arc::new(Self {
			region_queue,
			image_scheduler,
			image_handler,
			region_handler,
			config,
			shutdown,
		})
	}

	/// Polls the work sources until the shutdown flag flips.
	pub async fn monitor_work_queues(&self) {
		log::info!("worker loop started");
		while !*self.shutdown.borrow() {
			match self.tick().await {
				Ok(did_work) => {
					if !did_work {
						tokio::time::sleep(Duration::from_millis(250)).await;
					}
				}
				Err(error) => {
					log::error!("worker loop iteration failed: {error:#}");
					tokio::time::sleep(Duration::from_secs(1)).await;
				}
			}
		}
		log::info!("worker loop stopped");
	}

	/// One iteration: a region if one is available, otherwise at most one
	/// admitted image. Returns whether any work was attempted.
	pub async fn tick(&self) -> Result<bool> {
		log::debug!("checking work queue for regions to process");
		let wait = Duration::from_secs(self.config.region_queue_wait.min(10));
		let messages = self.region_queue.receive(1, wait).await?;
		if let Some(message) = messages.into_iter().next() {
			self.handle_region_message(&message).await;
			return Ok(true);
		}

		log::debug!("checking scheduler for images to process");
		let Some(record) = self.image_scheduler.get_next_scheduled_request().await else {
			return Ok(false);
		};
		let request = match record.image_request() {
			Ok(request) => request,
			Err(error) => {
				log::error!("outstanding job '{}' has an unreadable payload: {error:#}", record.job_id);
				return Ok(true);
			}
		};
		match self.image_handler.process_image_request(&request).await {
			Ok(status) => log::info!("image '{}' finished with status {status}", request.image_id()),
			Err(error) => {
				// The attempt stays recorded on the outstanding job; once it
				// ages past the retry window the scheduler re-admits it.
				log::error!("image '{}' will be retried: {error:#}", request.image_id());
			}
		}
		Ok(true)
	}

	async fn handle_region_message(&self, message: &QueueMessage) {
		let request = match RegionRequest::from_message(&message.body) {
			Ok(request) => request,
			Err(error) => {
				log::error!("invalid region request message, dead-lettering: {error:#}");
				self.dead_letter(message).await;
				return;
			}
		};

		match self.region_handler.process_region_request(&request, None).await {
			Ok(RegionOutcome::SelfThrottled) => {
				// Release immediately so another worker can pick it up.
				self.release(message, Duration::ZERO).await;
			}
			Ok(RegionOutcome::Completed { .. } | RegionOutcome::AsyncPending { .. }) => {
				self.finish(message).await;
			}
			Err(error) => match processing_error(&error) {
				Some(ProcessingError::RetryableJob(_)) => {
					log::warn!("region '{}' will be retried: {error:#}", request.region_id);
					self.release(message, Duration::ZERO).await;
				}
				Some(ProcessingError::InvalidRequest(_)) => {
					log::error!("invalid region request '{}', dead-lettering: {error:#}", request.region_id);
					self.dead_letter(message).await;
				}
				_ => {
					log::error!("region '{}' failed: {error:#}", request.region_id);
					self.finish(message).await;
				}
			},
		}
	}

	async fn finish(&self, message: &QueueMessage) {
		if let Err(error) = self.region_queue.finish(&message.receipt).await {
			log::error!("could not acknowledge region message: {error:#}");
		}
	}

	async fn release(&self, message: &QueueMessage, visibility: Duration) {
		if let Err(error) = self.region_queue.release(&message.receipt, visibility).await {
			log::error!("could not release region message: {error:#}");
		}
	}

	async fn dead_letter(&self, message: &QueueMessage) {
		if let Err(error) = self.region_queue.dead_letter(&message.receipt, &message.body).await {
			log::error!("could not dead-letter region message: {error:#}");
		}
	}
}
