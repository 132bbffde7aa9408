//! Non-maximum suppression over pixel-space boxes.

use crate::Feature;
use std::cmp::Ordering;

/// Suppresses lower-scored features whose boxes overlap a kept feature by
/// more than `iou_threshold`.
///
/// The result is deterministic for a given input multiset: candidates are
/// ranked by score descending, with ties broken by pixel box and then id, so
/// input ordering does not matter.
pub fn non_maximum_suppression(mut features: Vec<Feature>, iou_threshold: f64) -> Vec<Feature> {
	features.sort_by(compare_candidates);

	let mut kept: Vec<Feature> = Vec::with_capacity(features.len());
	for candidate in features {
		let suppressed = kept
			.iter()
			.any(|winner| winner.pixel_bounds.iou(&candidate.pixel_bounds) > iou_threshold);
		if !suppressed {
			kept.push(candidate);
		}
	}
	kept
}

fn compare_candidates(a: &Feature, b: &Feature) -> Ordering {
	b.score
		.partial_cmp(&a.score)
		.unwrap_or(Ordering::Equal)
		.then_with(|| {
			let ka = <[f64; 4]>::from(a.pixel_bounds);
			let kb = <[f64; 4]>::from(b.pixel_bounds);
			ka.partial_cmp(&kb).unwrap_or(Ordering::Equal)
		})
		.then_with(|| a.id.cmp(&b.id))
}
