//! Sensor models: the mapping between image pixels and geographic
//! coordinates.
//!
//! Photogrammetry is out of scope for the orchestrator; datasets expose
//! whatever model their metadata supports through this narrow trait. The
//! affine implementation covers north-up rasters with a standard
//! geotransform and is exact enough for tests and plain GeoTIFF imagery.

use crate::{Feature, Geometry};
use anyhow::{Result, bail};

/// Maps between image pixel coordinates (`x` = column, `y` = row) and
/// geographic coordinates (longitude, latitude).
pub trait SensorModel: Send + Sync {
	/// Pixel to geographic.
	fn image_to_geo(&self, x: f64, y: f64) -> (f64, f64);

	/// Geographic to pixel.
	fn geo_to_image(&self, lon: f64, lat: f64) -> (f64, f64);

	/// Writes a geographic polygon geometry for the feature's pixel box.
	/// The ring is closed and wound counter-clockwise in pixel order.
	fn geolocate(&self, feature: &mut Feature) {
		let b = &feature.pixel_bounds;
		let corners = [
			(b.min_x, b.min_y),
			(b.max_x, b.min_y),
			(b.max_x, b.max_y),
			(b.min_x, b.max_y),
			(b.min_x, b.min_y),
		];
		let ring = corners
			.iter()
			.map(|(x, y)| {
				let (lon, lat) = self.image_to_geo(*x, *y);
				[lon, lat]
			})
			.collect();
		feature.geometry = Some(Geometry::Polygon { coordinates: vec![ring] });
	}
}

/// Affine sensor model derived from a six-element geotransform
/// `[origin_x, pixel_width, row_rot, origin_y, col_rot, pixel_height]`.
#[derive(Clone, Copy, Debug)]
pub struct AffineSensorModel {
	transform: [f64; 6],
	inverse: [f64; 6],
}

impl AffineSensorModel {
	pub fn new(transform: [f64; 6]) -> Result<Self> {
		let [_, a, b, _, d, e] = transform;
		let det = a * e - b * d;
		if det == 0.0 {
			bail!("geotransform is singular and cannot be inverted");
		}
		let inverse = [
			transform[0],
			e / det,
			-b / det,
			transform[3],
			-d / det,
			a / det,
		];
		Ok(Self { transform, inverse })
	}

	/// Model for a north-up raster: origin at `(lon0, lat0)`, square pixels
	/// of `pixel_size` degrees, latitude decreasing with row.
	pub fn north_up(lon0: f64, lat0: f64, pixel_size: f64) -> Self {
		Self::new([lon0, pixel_size, 0.0, lat0, 0.0, -pixel_size]).expect("north-up transform is invertible")
	}
}

impl SensorModel for AffineSensorModel {
	fn image_to_geo(&self, x: f64, y: f64) -> (f64, f64) {
		let [x0, a, b, y0, d, e] = self.transform;
		(x0 + a * x + b * y, y0 + d * x + e * y)
	}

	fn geo_to_image(&self, lon: f64, lat: f64) -> (f64, f64) {
		let [x0, ia, ib, y0, id, ie] = self.inverse;
		let dx = lon - x0;
		let dy = lat - y0;
		(ia * dx + ib * dy, id * dx + ie * dy)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::PixelBox;
	use pretty_assertions::assert_eq;

	#[test]
	fn north_up_round_trip() {
		let model = AffineSensorModel::north_up(10.0, 50.0, 0.001);
		let (lon, lat) = model.image_to_geo(100.0, 200.0);
		assert!((lon - 10.1).abs() < 1e-9);
		assert!((lat - 49.8).abs() < 1e-9);
		let (x, y) = model.geo_to_image(lon, lat);
		assert!((x - 100.0).abs() < 1e-6);
		assert!((y - 200.0).abs() < 1e-6);
	}

	#[test]
	fn singular_transform_is_rejected() {
		assert!(AffineSensorModel::new([0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).is_err());
	}

	#[test]
	fn geolocate_writes_closed_polygon() {
		let model = AffineSensorModel::north_up(0.0, 0.0, 1.0);
		let mut feature = Feature::new("f", PixelBox::new(1.0, 2.0, 3.0, 4.0));
		model.geolocate(&mut feature);
		let Some(Geometry::Polygon { coordinates }) = &feature.geometry else {
			panic!("expected polygon geometry");
		};
		let ring = &coordinates[0];
		assert_eq!(ring.len(), 5);
		assert_eq!(ring[0], ring[4]);
		assert_eq!(ring[0], [1.0, -2.0]);
		assert_eq!(ring[2], [3.0, -4.0]);
	}
}
