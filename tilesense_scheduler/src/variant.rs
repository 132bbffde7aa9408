//! Weighted endpoint-variant selection.
//!
//! Multi-variant endpoints split traffic by weight. The buffered queue pins
//! each request to one variant before it enters the outstanding set so the
//! load scheduler can account capacity per `(endpoint, variant)` group.

use crate::EndpointMetadataCache;
use anyhow::{Result, bail};
use rand::Rng;
use std::sync::Arc;
use tilesense_core::ImageRequest;

pub struct EndpointVariantSelector {
	metadata: Arc<EndpointMetadataCache>,
}

impl EndpointVariantSelector {
	pub fn new(metadata: Arc<EndpointMetadataCache>) -> Arc<Self> {
		Arc::new(Self { metadata })
	}

	/// Fills in the request's target variant.
	///
	/// Pass-through rules, in order: explicit non-empty `TargetVariant`,
	/// HTTP endpoints (variants are a managed-endpoint concept), endpoints
	/// with no readable variant list. A single variant is picked directly;
	/// multiple variants are drawn by `CurrentWeight`.
	pub async fn select_variant(&self, request: &mut ImageRequest) {
		if request.endpoint.target_variant().is_some() {
			return;
		}
		if request.endpoint.is_http() {
			return;
		}

		let endpoint_name = request.endpoint.name.clone();
		let variants = match self.metadata.description(&endpoint_name).await {
			Ok(description) => description.variants,
			Err(error) => {
				log::warn!("variant lookup for '{endpoint_name}' failed, passing request through: {error:#}");
				return;
			}
		};
		if variants.is_empty() {
			log::warn!("endpoint '{endpoint_name}' has no variants, passing request through");
			return;
		}

		let weighted: Vec<(String, f64)> = variants
			.into_iter()
			.map(|variant| (variant.name, variant.current_weight))
			.collect();
		match select_weighted(&weighted) {
			Ok(variant) => request.endpoint.set_target_variant(&variant),
			Err(error) => log::warn!("variant selection for '{endpoint_name}' failed: {error:#}"),
		}
	}
}

/// Draws one name from `(name, weight)` pairs proportionally to weight.
///
/// A weight of zero is never chosen unless every weight is zero, in which
/// case the draw is uniform.
fn select_weighted(candidates: &[(String, f64)]) -> Result<String> {
	if candidates.is_empty() {
		bail!("cannot select a variant from an empty list");
	}
	if candidates.len() == 1 {
		return Ok(candidates[0].0.clone());
	}

	let total: f64 = candidates.iter().map(|(_, weight)| weight.max(0.0)).sum();
	let mut rng = rand::rng();
	if total <= 0.0 {
		let index = rng.random_range(0..candidates.len());
		return Ok(candidates[index].0.clone());
	}

	let mut remaining = rng.random_range(0.0..total);
	for (name, weight) in candidates {
		let weight = weight.max(0.0);
		if remaining < weight {
			return Ok(name.clone());
		}
		remaining -= weight;
	}
	// Floating-point edge: fall back to the last positively weighted entry.
	let fallback = candidates
		.iter()
		.rev()
		.find(|(_, weight)| *weight > 0.0)
		.unwrap_or(&candidates[candidates.len() - 1]);
	Ok(fallback.0.clone())
}
