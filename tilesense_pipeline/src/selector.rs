//! Feature selectors for seam deduplication.

use tilesense_geometry::{Feature, non_maximum_suppression};

/// Chooses which of a set of overlapping seam features survive.
///
/// Must be deterministic for a given input multiset.
pub trait FeatureSelector: Send + Sync {
	fn select(&self, features: Vec<Feature>) -> Vec<Feature>;
}

/// Non-maximum suppression, the default distillation algorithm.
#[derive(Clone, Copy, Debug)]
pub struct NmsFeatureSelector {
	iou_threshold: f64,
}

impl NmsFeatureSelector {
	pub fn new(iou_threshold: f64) -> Self {
		Self { iou_threshold }
	}
}

impl FeatureSelector for NmsFeatureSelector {
	fn select(&self, features: Vec<Feature>) -> Vec<Feature> {
		non_maximum_suppression(features, self.iou_threshold)
	}
}

/// Keeps every seam feature; used when no distillation step is requested.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeepAllFeatureSelector;

impl FeatureSelector for KeepAllFeatureSelector {
	fn select(&self, features: Vec<Feature>) -> Vec<Feature> {
		features
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use tilesense_geometry::PixelBox;

	#[test]
	fn nms_selector_suppresses_overlaps() {
		let selector = NmsFeatureSelector::new(0.5);
		let features = vec![
			Feature::new("a", PixelBox::new(0.0, 0.0, 10.0, 10.0)).with_score(0.9),
			Feature::new("b", PixelBox::new(1.0, 1.0, 11.0, 11.0)).with_score(0.8),
		];
		let kept = selector.select(features);
		assert_eq!(kept.len(), 1);
		assert_eq!(kept[0].id, "a");
	}

	#[test]
	fn keep_all_selector_is_identity() {
		let selector = KeepAllFeatureSelector;
		let features = vec![
			Feature::new("a", PixelBox::new(0.0, 0.0, 10.0, 10.0)),
			Feature::new("b", PixelBox::new(0.0, 0.0, 10.0, 10.0)),
		];
		assert_eq!(selector.select(features).len(), 2);
	}
}
