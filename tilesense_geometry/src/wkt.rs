//! Well-known-text polygon parsing for regions of interest.
//!
//! The upstream API carries the optional region of interest as a WKT
//! `POLYGON` in lon/lat. Only the exterior ring matters for computing
//! processing bounds; interior rings are parsed and ignored.

use crate::SensorModel;
use anyhow::{Context, Result, bail};
use geo::{Coord, LineString, Polygon};

/// Parses a WKT `POLYGON ((lon lat, lon lat, ...))`.
pub fn parse_wkt_polygon(text: &str) -> Result<Polygon<f64>> {
	let trimmed = text.trim();
	let upper = trimmed.to_uppercase();
	if !upper.starts_with("POLYGON") {
		bail!("expected WKT POLYGON, got '{trimmed}'");
	}
	let body = trimmed["POLYGON".len()..].trim();
	let body = body
		.strip_prefix('(')
		.and_then(|s| s.strip_suffix(')'))
		.with_context(|| format!("WKT polygon is missing its outer parentheses: '{trimmed}'"))?;

	let mut rings = Vec::new();
	for ring_text in split_rings(body)? {
		rings.push(parse_ring(&ring_text)?);
	}
	if rings.is_empty() {
		bail!("WKT polygon has no rings");
	}
	let exterior = rings.remove(0);
	Ok(Polygon::new(exterior, rings))
}

/// Splits `(r1), (r2), ...` into ring bodies, respecting nesting.
fn split_rings(body: &str) -> Result<Vec<String>> {
	let mut rings = Vec::new();
	let mut depth = 0usize;
	let mut current = String::new();
	for c in body.chars() {
		match c {
			'(' => {
				if depth == 0 {
					current.clear();
				} else {
					current.push(c);
				}
				depth += 1;
			}
			')' => {
				if depth == 0 {
					bail!("unbalanced parentheses in WKT polygon");
				}
				depth -= 1;
				if depth == 0 {
					rings.push(current.clone());
				} else {
					current.push(c);
				}
			}
			_ => {
				if depth > 0 {
					current.push(c);
				}
			}
		}
	}
	if depth != 0 {
		bail!("unbalanced parentheses in WKT polygon");
	}
	Ok(rings)
}

fn parse_ring(text: &str) -> Result<LineString<f64>> {
	let mut coords = Vec::new();
	for pair in text.split(',') {
		let mut parts = pair.split_whitespace();
		let lon: f64 = parts
			.next()
			.with_context(|| format!("missing longitude in WKT coordinate '{pair}'"))?
			.parse()
			.with_context(|| format!("could not parse longitude in '{pair}'"))?;
		let lat: f64 = parts
			.next()
			.with_context(|| format!("missing latitude in WKT coordinate '{pair}'"))?
			.parse()
			.with_context(|| format!("could not parse latitude in '{pair}'"))?;
		if parts.next().is_some() {
			bail!("WKT coordinate '{pair}' has more than two values");
		}
		coords.push(Coord { x: lon, y: lat });
	}
	if coords.len() < 4 {
		bail!("WKT ring needs at least four coordinates, got {}", coords.len());
	}
	Ok(LineString::from(coords))
}

/// Projects the polygon's exterior ring into pixel space and returns its
/// bounding box as `(min_x, min_y, max_x, max_y)`.
pub fn polygon_pixel_bounds(polygon: &Polygon<f64>, model: &dyn SensorModel) -> (f64, f64, f64, f64) {
	let mut min_x = f64::INFINITY;
	let mut min_y = f64::INFINITY;
	let mut max_x = f64::NEG_INFINITY;
	let mut max_y = f64::NEG_INFINITY;
	for coord in polygon.exterior().coords() {
		let (x, y) = model.geo_to_image(coord.x, coord.y);
		min_x = min_x.min(x);
		min_y = min_y.min(y);
		max_x = max_x.max(x);
		max_y = max_y.max(y);
	}
	(min_x, min_y, max_x, max_y)
}
