//! Endpoint capacity estimation.
//!
//! Answers "how many concurrent tiles can endpoint E (optionally variant V)
//! absorb right now?" as a single integer. HTTP endpoints get a configured
//! default; serverless endpoints report their maximum concurrency;
//! instance-backed endpoints multiply instance counts by a per-instance
//! concurrency that operators can override with a tag.

use crate::{EndpointDescription, EndpointMetadataCache};
use std::sync::Arc;
use tilesense_core::metrics::{Dimensions, MetricUnit, MetricsSink, SharedMetrics, names, operations};

/// Endpoint tag overriding the per-instance concurrency.
pub const INSTANCE_CONCURRENCY_TAG: &str = "tilesense:instance-concurrency";

pub struct EndpointCapacityEstimator {
	metadata: Arc<EndpointMetadataCache>,
	default_http_concurrency: u32,
	default_instance_concurrency: u32,
	metrics: SharedMetrics,
}

impl EndpointCapacityEstimator {
	pub fn new(
		metadata: Arc<EndpointMetadataCache>,
		default_http_concurrency: u32,
		default_instance_concurrency: u32,
		metrics: SharedMetrics,
	) -> Arc<Self> {
		Arc::new(Self {
			metadata,
			default_http_concurrency,
			default_instance_concurrency,
			metrics,
		})
	}

	/// Best-effort concurrent-tile capacity of the endpoint.
	///
	/// Never fails: on a lookup error a stale cached description is
	/// preferred (inside the cache), and with no cache at all the configured
	/// per-instance default is returned and an `Errors` metric emitted.
	pub async fn estimate_capacity(&self, endpoint_name: &str, variant_name: Option<&str>) -> u32 {
		if endpoint_name.starts_with("http://") || endpoint_name.starts_with("https://") {
			return self.default_http_concurrency;
		}

		let description = match self.metadata.description(endpoint_name).await {
			Ok(description) => description,
			Err(error) => {
				log::warn!("capacity lookup for '{endpoint_name}' failed, assuming default: {error:#}");
				self.emit_error(endpoint_name);
				return self.default_instance_concurrency;
			}
		};

		if let Some(max_concurrency) = description.serverless_max_concurrency {
			return max_concurrency;
		}

		let instance_concurrency = self.instance_concurrency(endpoint_name).await;
		Self::instance_capacity(&description, variant_name, instance_concurrency)
	}

	/// Per-instance concurrency from the override tag, or the default when
	/// the tag is absent or not numeric.
	async fn instance_concurrency(&self, endpoint_name: &str) -> u32 {
		let tags = match self.metadata.tags(endpoint_name).await {
			Ok(tags) => tags,
			Err(error) => {
				log::warn!("tag lookup for '{endpoint_name}' failed, assuming default concurrency: {error:#}");
				self.emit_error(endpoint_name);
				return self.default_instance_concurrency;
			}
		};
		tags
			.get(INSTANCE_CONCURRENCY_TAG)
			.and_then(|value| value.parse::<u32>().ok())
			.unwrap_or(self.default_instance_concurrency)
	}

	fn instance_capacity(description: &EndpointDescription, variant_name: Option<&str>, concurrency: u32) -> u32 {
		match variant_name {
			Some(variant_name) => description
				.variants
				.iter()
				.find(|variant| variant.name == variant_name)
				.map_or(0, |variant| variant.instance_count * concurrency),
			None => description
				.variants
				.iter()
				.map(|variant| variant.instance_count * concurrency)
				.sum(),
		}
	}

	fn emit_error(&self, endpoint_name: &str) {
		let dimensions = Dimensions::operation(operations::SCHEDULING).with_model_name(endpoint_name);
		self.metrics.emit(names::ERRORS, 1.0, MetricUnit::Count, &dimensions);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{EndpointVariant, MemoryEndpointMetadata};
	use pretty_assertions::assert_eq;
	use std::collections::BTreeMap;
	use tilesense_core::metrics::MemoryMetricsSink;

	fn setup(provider: &Arc<MemoryEndpointMetadata>) -> (Arc<EndpointCapacityEstimator>, Arc<MemoryMetricsSink>) {
		let metrics = MemoryMetricsSink::new();
		let cache = EndpointMetadataCache::new(provider.clone());
		let estimator = EndpointCapacityEstimator::new(cache, 10, 4, metrics.clone());
		(estimator, metrics)
	}

	fn variant(name: &str, weight: f64, instances: u32) -> EndpointVariant {
		EndpointVariant {
			name: name.to_string(),
			current_weight: weight,
			instance_count: instances,
		}
	}

	#[tokio::test]
	async fn http_endpoint_returns_default_without_lookup() {
		let provider = MemoryEndpointMetadata::new();
		let (estimator, metrics) = setup(&provider);

		assert_eq!(estimator.estimate_capacity("https://models.example.com/detect", None).await, 10);
		assert_eq!(provider.describe_calls(), 0);
		assert!(metrics.records_named(names::ERRORS).is_empty());
	}

	#[tokio::test]
	async fn serverless_endpoint_returns_max_concurrency() {
		let provider = MemoryEndpointMetadata::new();
		provider.insert_endpoint(EndpointDescription {
			name: "serverless-model".to_string(),
			variants: vec![],
			serverless_max_concurrency: Some(25),
		});
		let (estimator, _) = setup(&provider);
		assert_eq!(estimator.estimate_capacity("serverless-model", None).await, 25);
	}

	#[tokio::test]
	async fn instance_backed_endpoint_without_tag_uses_default() {
		let provider = MemoryEndpointMetadata::new();
		provider.insert_endpoint(EndpointDescription {
			name: "m".to_string(),
			variants: vec![variant("AllTraffic", 1.0, 3)],
			serverless_max_concurrency: None,
		});
		let (estimator, _) = setup(&provider);
		// 3 instances × default concurrency 4.
		assert_eq!(estimator.estimate_capacity("m", None).await, 12);
	}

	#[tokio::test]
	async fn instance_backed_endpoint_with_tag() {
		let provider = MemoryEndpointMetadata::new();
		provider.insert_endpoint(EndpointDescription {
			name: "m".to_string(),
			variants: vec![variant("AllTraffic", 1.0, 3)],
			serverless_max_concurrency: None,
		});
		provider.insert_tags("m", BTreeMap::from([(INSTANCE_CONCURRENCY_TAG.to_string(), "8".to_string())]));
		let (estimator, _) = setup(&provider);
		assert_eq!(estimator.estimate_capacity("m", None).await, 24);
	}

	#[tokio::test]
	async fn non_numeric_tag_falls_back_to_default() {
		let provider = MemoryEndpointMetadata::new();
		provider.insert_endpoint(EndpointDescription {
			name: "m".to_string(),
			variants: vec![variant("AllTraffic", 1.0, 2)],
			serverless_max_concurrency: None,
		});
		provider.insert_tags("m", BTreeMap::from([(INSTANCE_CONCURRENCY_TAG.to_string(), "lots".to_string())]));
		let (estimator, _) = setup(&provider);
		assert_eq!(estimator.estimate_capacity("m", None).await, 8);
	}

	#[tokio::test]
	async fn multi_variant_sums_without_variant_name() {
		let provider = MemoryEndpointMetadata::new();
		provider.insert_endpoint(EndpointDescription {
			name: "m".to_string(),
			variants: vec![variant("v1", 0.8, 4), variant("v2", 0.2, 2)],
			serverless_max_concurrency: None,
		});
		let (estimator, _) = setup(&provider);
		assert_eq!(estimator.estimate_capacity("m", None).await, 24);
		assert_eq!(estimator.estimate_capacity("m", Some("v2")).await, 8);
	}

	#[tokio::test]
	async fn unknown_variant_has_zero_capacity() {
		let provider = MemoryEndpointMetadata::new();
		provider.insert_endpoint(EndpointDescription {
			name: "m".to_string(),
			variants: vec![variant("v1", 1.0, 4)],
			serverless_max_concurrency: None,
		});
		let (estimator, _) = setup(&provider);
		assert_eq!(estimator.estimate_capacity("m", Some("missing")).await, 0);
	}

	#[tokio::test]
	async fn zero_instances_and_empty_variants_are_zero() {
		let provider = MemoryEndpointMetadata::new();
		provider.insert_endpoint(EndpointDescription {
			name: "scaled-down".to_string(),
			variants: vec![variant("AllTraffic", 1.0, 0)],
			serverless_max_concurrency: None,
		});
		provider.insert_endpoint(EndpointDescription {
			name: "no-variants".to_string(),
			variants: vec![],
			serverless_max_concurrency: None,
		});
		let (estimator, _) = setup(&provider);
		assert_eq!(estimator.estimate_capacity("scaled-down", None).await, 0);
		assert_eq!(estimator.estimate_capacity("no-variants", None).await, 0);
	}

	#[tokio::test]
	async fn describe_failure_returns_default_and_emits_error() {
		let provider = MemoryEndpointMetadata::new();
		provider.set_fail_describe(true);
		let (estimator, metrics) = setup(&provider);

		assert_eq!(estimator.estimate_capacity("m", None).await, 4);
		let errors = metrics.records_named(names::ERRORS);
		assert_eq!(errors.len(), 1);
		assert_eq!(errors[0].dimensions.model_name.as_deref(), Some("m"));
		assert_eq!(errors[0].dimensions.operation.as_deref(), Some("Scheduling"));
	}

	#[tokio::test]
	async fn describe_failure_prefers_stale_cache() {
		let provider = MemoryEndpointMetadata::new();
		provider.insert_endpoint(EndpointDescription {
			name: "m".to_string(),
			variants: vec![variant("AllTraffic", 1.0, 5)],
			serverless_max_concurrency: None,
		});
		let metrics = MemoryMetricsSink::new();
		let cache = EndpointMetadataCache::with_bounds(provider.clone(), std::time::Duration::from_millis(10), 10);
		let estimator = EndpointCapacityEstimator::new(cache, 10, 4, metrics.clone());

		assert_eq!(estimator.estimate_capacity("m", None).await, 20);
		tokio::time::sleep(std::time::Duration::from_millis(30)).await;
		provider.set_fail_describe(true);
		provider.set_fail_tags(true);
		// Stale description still yields the instance math; the failed tag
		// lookup falls back to the default concurrency and emits an error.
		assert_eq!(estimator.estimate_capacity("m", None).await, 20);
	}

	#[tokio::test]
	async fn tag_failure_uses_default_concurrency() {
		let provider = MemoryEndpointMetadata::new();
		provider.insert_endpoint(EndpointDescription {
			name: "m".to_string(),
			variants: vec![variant("AllTraffic", 1.0, 2)],
			serverless_max_concurrency: None,
		});
		provider.set_fail_tags(true);
		let (estimator, metrics) = setup(&provider);

		assert_eq!(estimator.estimate_capacity("m", None).await, 8);
		assert_eq!(metrics.records_named(names::ERRORS).len(), 1);
	}
}
