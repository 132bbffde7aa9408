//! Rectangular pixel windows.
//!
//! A [`PixelWindow`] is the unit of spatial bookkeeping throughout the
//! orchestrator: the full image extent, a processing region and a single tile
//! are all windows of the form `((row, col), (width, height))`. The upper-left
//! corner is `(row, col)`; `width` runs along columns and `height` along rows.
//!
//! Windows serialize as the nested pair `[[row, col], [width, height]]`, which
//! is also the wire format used on the region queue and in the stores.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A rectangular window in image pixel space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "((u32, u32), (u32, u32))", into = "((u32, u32), (u32, u32))")]
pub struct PixelWindow {
	/// Row of the upper-left corner.
	pub row: u32,
	/// Column of the upper-left corner.
	pub col: u32,
	/// Width in pixels (columns).
	pub width: u32,
	/// Height in pixels (rows).
	pub height: u32,
}

impl PixelWindow {
	pub fn new(row: u32, col: u32, width: u32, height: u32) -> Self {
		Self { row, col, width, height }
	}

	/// Window covering a full image of `width × height` pixels.
	pub fn from_image_size(width: u32, height: u32) -> Self {
		Self::new(0, 0, width, height)
	}

	/// First row below the window.
	pub fn bottom(&self) -> u32 {
		self.row + self.height
	}

	/// First column right of the window.
	pub fn right(&self) -> u32 {
		self.col + self.width
	}

	pub fn area(&self) -> u64 {
		u64::from(self.width) * u64::from(self.height)
	}

	pub fn is_empty(&self) -> bool {
		self.width == 0 || self.height == 0
	}

	/// Returns true if the pixel `(row, col)` lies inside the window.
	pub fn contains(&self, row: u32, col: u32) -> bool {
		row >= self.row && row < self.bottom() && col >= self.col && col < self.right()
	}

	/// Returns true if `other` lies entirely inside this window.
	pub fn contains_window(&self, other: &PixelWindow) -> bool {
		other.row >= self.row && other.bottom() <= self.bottom() && other.col >= self.col && other.right() <= self.right()
	}

	/// Intersection of two windows, or `None` if they do not overlap.
	pub fn intersect(&self, other: &PixelWindow) -> Option<PixelWindow> {
		let row = self.row.max(other.row);
		let col = self.col.max(other.col);
		let bottom = self.bottom().min(other.bottom());
		let right = self.right().min(other.right());
		if row >= bottom || col >= right {
			return None;
		}
		Some(PixelWindow::new(row, col, right - col, bottom - row))
	}

	/// Intersection clamped against a floating-point rectangle, used when a
	/// geographic region of interest has been projected into pixel space.
	///
	/// The rectangle may extend beyond the image or have negative corners;
	/// the result is clamped to this window. Returns `None` when the clamped
	/// rectangle is empty.
	pub fn intersect_f64(&self, min_row: f64, min_col: f64, max_row: f64, max_col: f64) -> Option<PixelWindow> {
		let row = min_row.max(f64::from(self.row)).floor().max(0.0) as u32;
		let col = min_col.max(f64::from(self.col)).floor().max(0.0) as u32;
		let bottom = max_row.min(f64::from(self.bottom())).ceil().max(0.0) as u32;
		let right = max_col.min(f64::from(self.right())).ceil().max(0.0) as u32;
		if row >= bottom || col >= right {
			return None;
		}
		Some(PixelWindow::new(row, col, right - col, bottom - row))
	}

	/// Stable identifier used as region/tile key, e.g. `"512-0-512-512"`.
	pub fn id(&self) -> String {
		format!("{}-{}-{}-{}", self.row, self.col, self.width, self.height)
	}
}

impl From<((u32, u32), (u32, u32))> for PixelWindow {
	fn from(((row, col), (width, height)): ((u32, u32), (u32, u32))) -> Self {
		Self::new(row, col, width, height)
	}
}

impl From<PixelWindow> for ((u32, u32), (u32, u32)) {
	fn from(w: PixelWindow) -> Self {
		((w.row, w.col), (w.width, w.height))
	}
}

impl fmt::Display for PixelWindow {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"(({}, {}), ({}, {}))",
			self.row, self.col, self.width, self.height
		)
	}
}

/// Tile width/height and per-axis overlap of an image request.
///
/// Overlap must be strictly smaller than the tile size on both axes,
/// otherwise the tile grid would never advance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGeometry {
	pub tile_width: u32,
	pub tile_height: u32,
	pub overlap_x: u32,
	pub overlap_y: u32,
}

impl TileGeometry {
	/// Square tiles with a uniform overlap, the common case on the wire.
	pub fn square(tile_size: u32, overlap: u32) -> Self {
		Self {
			tile_width: tile_size,
			tile_height: tile_size,
			overlap_x: overlap,
			overlap_y: overlap,
		}
	}

	pub fn is_valid(&self) -> bool {
		self.tile_width > 0 && self.tile_height > 0 && self.overlap_x < self.tile_width && self.overlap_y < self.tile_height
	}

	/// Stride between tile origins along columns.
	pub fn stride_x(&self) -> u32 {
		self.tile_width - self.overlap_x
	}

	/// Stride between tile origins along rows.
	pub fn stride_y(&self) -> u32 {
		self.tile_height - self.overlap_y
	}
}
