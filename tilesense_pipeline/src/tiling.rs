//! Tiling strategy: region and tile grids plus seam deduplication.
//!
//! The grids are separable per axis: region origins step by
//! `region_size − overlap` across the processing bounds, and tile origins
//! step by `tile_size − overlap` within each region. Windows at the far
//! edge are clipped. Because both grids are separable, a feature's tile
//! membership can be counted per axis and multiplied, which is what the
//! seam partition in [`TilingStrategy::cleanup_duplicate_features`] uses.

use crate::FeatureSelector;
use tilesense_core::{PixelWindow, TileGeometry};
use tilesense_geometry::Feature;

/// Pluggable region/tile math.
pub trait TilingStrategy: Send + Sync {
	/// Splits the processing bounds into worker-sized regions.
	fn compute_regions(
		&self,
		processing_bounds: PixelWindow,
		region_size: (u32, u32),
		tile_geometry: &TileGeometry,
	) -> Vec<PixelWindow>;

	/// Splits one region into model-sized tiles.
	fn compute_tiles(&self, region_bounds: PixelWindow, tile_geometry: &TileGeometry) -> Vec<PixelWindow>;

	/// Deduplicates features across overlapping tiles: features interior to
	/// exactly one tile pass through; features on a seam go through the
	/// selector.
	fn cleanup_duplicate_features(
		&self,
		processing_bounds: PixelWindow,
		region_size: (u32, u32),
		tile_geometry: &TileGeometry,
		features: Vec<Feature>,
		selector: &dyn FeatureSelector,
	) -> Vec<Feature>;
}

/// The default grid strategy.
#[derive(Clone, Copy, Debug, Default)]
pub struct GridTilingStrategy;

/// Overlapping crops of `[start, start+length)` with the given window size
/// and stride, clipped at the end.
fn axis_crops(start: u32, length: u32, window: u32, overlap: u32) -> Vec<(u32, u32)> {
	if length == 0 || window == 0 || overlap >= window {
		return Vec::new();
	}
	let stride = window - overlap;
	let end = start + length;
	let mut crops = Vec::new();
	let mut origin = start;
	loop {
		let size = window.min(end - origin);
		crops.push((origin, size));
		if origin + window >= end {
			break;
		}
		origin += stride;
	}
	crops
}

/// Tile intervals along one axis: region crops subdivided by tile crops.
fn tile_intervals(start: u32, length: u32, region: u32, tile: u32, overlap: u32) -> Vec<(u32, u32)> {
	axis_crops(start, length, region, overlap)
		.into_iter()
		.flat_map(|(region_start, region_length)| axis_crops(region_start, region_length, tile, overlap))
		.collect()
}

/// Number of intervals a `[min, max]` span intersects.
fn count_intersections(intervals: &[(u32, u32)], min: f64, max: f64) -> usize {
	intervals
		.iter()
		.filter(|(origin, size)| f64::from(*origin) < max && f64::from(origin + size) > min)
		.count()
}

impl TilingStrategy for GridTilingStrategy {
	fn compute_regions(
		&self,
		processing_bounds: PixelWindow,
		region_size: (u32, u32),
		tile_geometry: &TileGeometry,
	) -> Vec<PixelWindow> {
		let rows = axis_crops(
			processing_bounds.row,
			processing_bounds.height,
			region_size.1,
			tile_geometry.overlap_y,
		);
		let cols = axis_crops(
			processing_bounds.col,
			processing_bounds.width,
			region_size.0,
			tile_geometry.overlap_x,
		);
		rows
			.iter()
			.flat_map(|(row, height)| {
				cols
					.iter()
					.map(move |(col, width)| PixelWindow::new(*row, *col, *width, *height))
			})
			.collect()
	}

	fn compute_tiles(&self, region_bounds: PixelWindow, tile_geometry: &TileGeometry) -> Vec<PixelWindow> {
		let rows = axis_crops(
			region_bounds.row,
			region_bounds.height,
			tile_geometry.tile_height,
			tile_geometry.overlap_y,
		);
		let cols = axis_crops(
			region_bounds.col,
			region_bounds.width,
			tile_geometry.tile_width,
			tile_geometry.overlap_x,
		);
		rows
			.iter()
			.flat_map(|(row, height)| {
				cols
					.iter()
					.map(move |(col, width)| PixelWindow::new(*row, *col, *width, *height))
			})
			.collect()
	}

	fn cleanup_duplicate_features(
		&self,
		processing_bounds: PixelWindow,
		region_size: (u32, u32),
		tile_geometry: &TileGeometry,
		features: Vec<Feature>,
		selector: &dyn FeatureSelector,
	) -> Vec<Feature> {
		let col_intervals = tile_intervals(
			processing_bounds.col,
			processing_bounds.width,
			region_size.0,
			tile_geometry.tile_width,
			tile_geometry.overlap_x,
		);
		let row_intervals = tile_intervals(
			processing_bounds.row,
			processing_bounds.height,
			region_size.1,
			tile_geometry.tile_height,
			tile_geometry.overlap_y,
		);

		let mut interior = Vec::new();
		let mut seam = Vec::new();
		for feature in features {
			let b = &feature.pixel_bounds;
			let tiles = count_intersections(&col_intervals, b.min_x, b.max_x)
				* count_intersections(&row_intervals, b.min_y, b.max_y);
			if tiles > 1 {
				seam.push(feature);
			} else {
				interior.push(feature);
			}
		}

		let mut kept = interior;
		kept.extend(selector.select(seam));
		// Deterministic output regardless of input ordering.
		kept.sort_by(|a, b| a.id.cmp(&b.id));
		kept
	}
}
