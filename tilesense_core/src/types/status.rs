//! Lifecycle statuses for images, regions and tiles.
//!
//! The image status stream is the canonical user-visible failure channel:
//! the last event published for an `image_id` is guaranteed to be terminal
//! once processing concludes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Image lifecycle status as published on the status topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
	Started,
	InProgress,
	Success,
	Partial,
	Failed,
}

impl ImageStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(self, ImageStatus::Success | ImageStatus::Partial | ImageStatus::Failed)
	}

	pub fn as_str(&self) -> &str {
		match self {
			ImageStatus::Started => "STARTED",
			ImageStatus::InProgress => "IN_PROGRESS",
			ImageStatus::Success => "SUCCESS",
			ImageStatus::Partial => "PARTIAL",
			ImageStatus::Failed => "FAILED",
		}
	}
}

impl fmt::Display for ImageStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Region lifecycle status.
///
/// A region is `Success` once all its tiles are terminal, even when some
/// tiles failed; the failed-tile count is reported separately and rolls the
/// image up to `PARTIAL`. `Failed` marks a region-level failure (setup or
/// bulk processing).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegionStatus {
	Pending,
	InProgress,
	Success,
	Failed,
}

impl RegionStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(self, RegionStatus::Success | RegionStatus::Failed)
	}
}

impl fmt::Display for RegionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			RegionStatus::Pending => "PENDING",
			RegionStatus::InProgress => "IN_PROGRESS",
			RegionStatus::Success => "SUCCESS",
			RegionStatus::Failed => "FAILED",
		};
		f.write_str(s)
	}
}

/// Tile lifecycle status, persisted only on the asynchronous path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TileStatus {
	Pending,
	InProgress,
	Success,
	Failed,
}

impl TileStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(self, TileStatus::Success | TileStatus::Failed)
	}
}

impl fmt::Display for TileStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			TileStatus::Pending => "PENDING",
			TileStatus::InProgress => "IN_PROGRESS",
			TileStatus::Success => "SUCCESS",
			TileStatus::Failed => "FAILED",
		};
		f.write_str(s)
	}
}
