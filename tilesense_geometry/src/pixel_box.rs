//! Axis-aligned bounding boxes in image pixel space.
//!
//! Deduplication runs on pixel coordinates rather than geographic ones to
//! avoid map-projection distortion, so the pixel box is the geometry that
//! matters for overlap math. `x` runs along columns, `y` along rows, both as
//! `f64` because detectors report sub-pixel box corners.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct PixelBox {
	pub min_x: f64,
	pub min_y: f64,
	pub max_x: f64,
	pub max_y: f64,
}

impl PixelBox {
	pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
		Self {
			min_x: min_x.min(max_x),
			min_y: min_y.min(max_y),
			max_x: min_x.max(max_x),
			max_y: min_y.max(max_y),
		}
	}

	pub fn width(&self) -> f64 {
		self.max_x - self.min_x
	}

	pub fn height(&self) -> f64 {
		self.max_y - self.min_y
	}

	pub fn area(&self) -> f64 {
		self.width() * self.height()
	}

	pub fn center(&self) -> (f64, f64) {
		((self.min_x + self.max_x) / 2.0, (self.min_y + self.max_y) / 2.0)
	}

	/// Shifts the box by a pixel offset, e.g. from tile to image coordinates.
	pub fn translate(&self, dx: f64, dy: f64) -> Self {
		Self {
			min_x: self.min_x + dx,
			min_y: self.min_y + dy,
			max_x: self.max_x + dx,
			max_y: self.max_y + dy,
		}
	}

	pub fn intersection_area(&self, other: &PixelBox) -> f64 {
		let w = (self.max_x.min(other.max_x) - self.min_x.max(other.min_x)).max(0.0);
		let h = (self.max_y.min(other.max_y) - self.min_y.max(other.min_y)).max(0.0);
		w * h
	}

	/// Intersection over union; 0.0 when both boxes are degenerate.
	pub fn iou(&self, other: &PixelBox) -> f64 {
		let intersection = self.intersection_area(other);
		let union = self.area() + other.area() - intersection;
		if union <= 0.0 {
			return 0.0;
		}
		intersection / union
	}
}

impl From<[f64; 4]> for PixelBox {
	fn from([min_x, min_y, max_x, max_y]: [f64; 4]) -> Self {
		Self::new(min_x, min_y, max_x, max_y)
	}
}

impl From<PixelBox> for [f64; 4] {
	fn from(b: PixelBox) -> Self {
		[b.min_x, b.min_y, b.max_x, b.max_y]
	}
}
