//! Lifecycle event publication.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tilesense_core::ImageStatus;

/// An image- or region-level lifecycle event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
	pub image_id: String,
	pub status: ImageStatus,
	pub message: String,
	/// Region the event refers to, for region-level events.
	#[serde(default)]
	pub region_id: Option<String>,
	/// Seconds from start to terminal state; present on terminal events.
	#[serde(default)]
	pub processing_duration: Option<i64>,
}

impl StatusEvent {
	pub fn image(image_id: &str, status: ImageStatus, message: &str) -> Self {
		Self {
			image_id: image_id.to_string(),
			status,
			message: message.to_string(),
			region_id: None,
			processing_duration: None,
		}
	}

	pub fn region(image_id: &str, region_id: &str, status: ImageStatus, message: &str) -> Self {
		Self {
			region_id: Some(region_id.to_string()),
			..Self::image(image_id, status, message)
		}
	}

	pub fn with_duration(mut self, seconds: i64) -> Self {
		self.processing_duration = Some(seconds);
		self
	}

	/// Flat attribute map as carried by the pub/sub message, for consumers
	/// that filter without parsing the body.
	pub fn message_attributes(&self) -> std::collections::BTreeMap<String, String> {
		let mut attributes = std::collections::BTreeMap::new();
		attributes.insert("image_id".to_string(), self.image_id.clone());
		attributes.insert("status".to_string(), self.status.to_string());
		if let Some(region_id) = &self.region_id {
			attributes.insert("region_id".to_string(), region_id.clone());
		}
		if let Some(duration) = self.processing_duration {
			attributes.insert("processing_duration".to_string(), duration.to_string());
		}
		attributes
	}
}

/// Pub/sub destination for lifecycle events, the canonical user-visible
/// failure channel.
#[async_trait]
pub trait StatusTopic: Send + Sync {
	async fn publish(&self, event: StatusEvent) -> Result<()>;
}

pub type SharedStatusTopic = Arc<dyn StatusTopic>;

/// In-memory topic recording every published event.
#[derive(Default)]
pub struct MemoryStatusTopic {
	events: Mutex<Vec<StatusEvent>>,
}

impl MemoryStatusTopic {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn events(&self) -> Vec<StatusEvent> {
		self.events.lock().clone()
	}

	/// Events for one image, in publication order.
	pub fn events_for(&self, image_id: &str) -> Vec<StatusEvent> {
		self
			.events
			.lock()
			.iter()
			.filter(|event| event.image_id == image_id)
			.cloned()
			.collect()
	}

	/// The final image-level event for an image, if any.
	pub fn last_image_event(&self, image_id: &str) -> Option<StatusEvent> {
		self
			.events
			.lock()
			.iter()
			.filter(|event| event.image_id == image_id && event.region_id.is_none())
			.next_back()
			.cloned()
	}
}

#[async_trait]
impl StatusTopic for MemoryStatusTopic {
	async fn publish(&self, event: StatusEvent) -> Result<()> {
		log::info!(
			"status {} for image '{}'{}: {}",
			event.status,
			event.image_id,
			event.region_id.as_deref().map(|r| format!(" region '{r}'")).unwrap_or_default(),
			event.message
		);
		self.events.lock().push(event);
		Ok(())
	}
}
