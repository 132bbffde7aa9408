//! Result-notification events.
//!
//! Events routed to the results worker arrive in three shapes: a success
//! notification for the result object, a failure notification from the
//! endpoint, or a poller tick scheduled at submission time. All three are
//! JSON messages on the results queue.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultEvent {
	/// The endpoint wrote its result object.
	ObjectCreated {
		#[serde(rename = "location")]
		location: String,
	},
	/// The endpoint reported the inference as failed.
	InferenceFailed {
		#[serde(rename = "inferenceId")]
		inference_id: String,
		#[serde(default)]
		reason: String,
	},
	/// Scheduled check on a tile that may have missed its notification.
	PollTile {
		#[serde(rename = "regionId")]
		region_id: String,
		#[serde(rename = "tileId")]
		tile_id: String,
	},
}

impl ResultEvent {
	pub fn from_message(body: &str) -> Result<Self> {
		serde_json::from_str(body).context("could not parse result event message")
	}

	pub fn to_message(&self) -> Result<String> {
		serde_json::to_string(self).context("could not serialize result event")
	}
}
