//! Durable per-tile feature storage.
//!
//! Features are keyed by `(image_id, region_id, tile_id)` and written with
//! overwrite semantics, so a retried tile contributes its features at most
//! once regardless of how many attempts it took.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tilesense_geometry::Feature;

#[async_trait]
pub trait FeatureStore: Send + Sync {
	/// Stores the features a tile produced, replacing any earlier write for
	/// the same tile.
	async fn put_tile_features(&self, image_id: &str, region_id: &str, tile_id: &str, features: &[Feature]) -> Result<()>;

	/// All features of an image across regions and tiles.
	async fn get_image_features(&self, image_id: &str) -> Result<Vec<Feature>>;

	/// Whether any features exist for the tile.
	async fn has_tile_features(&self, image_id: &str, region_id: &str, tile_id: &str) -> Result<bool>;

	/// Drops all features of an image once aggregation has completed.
	async fn delete_image_features(&self, image_id: &str) -> Result<()>;
}

pub type SharedFeatureStore = Arc<dyn FeatureStore>;

fn tile_key(image_id: &str, region_id: &str, tile_id: &str) -> String {
	format!("{image_id}#{region_id}#{tile_id}")
}

/// In-memory feature store.
#[derive(Default)]
pub struct MemoryFeatureStore {
	tiles: DashMap<String, (String, Vec<Feature>)>,
}

impl MemoryFeatureStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}
}

#[async_trait]
impl FeatureStore for MemoryFeatureStore {
	async fn put_tile_features(&self, image_id: &str, region_id: &str, tile_id: &str, features: &[Feature]) -> Result<()> {
		self.tiles.insert(
			tile_key(image_id, region_id, tile_id),
			(image_id.to_string(), features.to_vec()),
		);
		Ok(())
	}

	async fn get_image_features(&self, image_id: &str) -> Result<Vec<Feature>> {
		let mut entries: Vec<(String, Vec<Feature>)> = self
			.tiles
			.iter()
			.filter(|entry| entry.value().0 == image_id)
			.map(|entry| (entry.key().clone(), entry.value().1.clone()))
			.collect();
		// Stable output ordering regardless of map iteration order.
		entries.sort_by(|a, b| a.0.cmp(&b.0));
		Ok(entries.into_iter().flat_map(|(_, features)| features).collect())
	}

	async fn has_tile_features(&self, image_id: &str, region_id: &str, tile_id: &str) -> Result<bool> {
		Ok(self.tiles.contains_key(&tile_key(image_id, region_id, tile_id)))
	}

	async fn delete_image_features(&self, image_id: &str) -> Result<()> {
		self.tiles.retain(|_, (owner, _)| owner != image_id);
		Ok(())
	}
}
