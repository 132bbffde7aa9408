//! Endpoint metadata lookups with shared caching.
//!
//! The capacity estimator and the variant selector both need endpoint
//! descriptions; they share one [`EndpointMetadataCache`] so a busy
//! scheduler performs each lookup at most once per TTL window.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tilesense_core::TimedCache;

/// Default time-to-live of cached endpoint metadata.
pub const METADATA_CACHE_TTL: Duration = Duration::from_secs(300);
/// Default bound on cached endpoints.
pub const METADATA_CACHE_MAX_ENTRIES: usize = 100;

/// One deployment variant of a managed endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct EndpointVariant {
	pub name: String,
	/// Traffic weight; a weight of zero receives no traffic.
	pub current_weight: f64,
	pub instance_count: u32,
}

/// Description of a managed endpoint.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EndpointDescription {
	pub name: String,
	pub variants: Vec<EndpointVariant>,
	/// Set for serverless endpoints; variants carry no instances then.
	pub serverless_max_concurrency: Option<u32>,
}

/// Narrow interface over the model-hosting control plane.
#[async_trait]
pub trait EndpointMetadataProvider: Send + Sync {
	async fn describe_endpoint(&self, endpoint_name: &str) -> Result<EndpointDescription>;

	async fn list_endpoint_tags(&self, endpoint_name: &str) -> Result<BTreeMap<String, String>>;
}

pub type SharedEndpointMetadataProvider = Arc<dyn EndpointMetadataProvider>;

/// TTL+LRU cached access to endpoint descriptions and tags.
///
/// On a refresh failure a stale cached value is preferred over an error;
/// only when nothing was ever cached does the failure surface.
pub struct EndpointMetadataCache {
	provider: SharedEndpointMetadataProvider,
	descriptions: Mutex<TimedCache<String, EndpointDescription>>,
	tags: Mutex<TimedCache<String, BTreeMap<String, String>>>,
}

impl EndpointMetadataCache {
	pub fn new(provider: SharedEndpointMetadataProvider) -> Arc<Self> {
		Self::with_bounds(provider, METADATA_CACHE_TTL, METADATA_CACHE_MAX_ENTRIES)
	}

	pub fn with_bounds(provider: SharedEndpointMetadataProvider, ttl: Duration, max_entries: usize) -> Arc<Self> {
		Arc::new(Self {
			provider,
			descriptions: Mutex::new(TimedCache::new(ttl, max_entries)),
			tags: Mutex::new(TimedCache::new(ttl, max_entries)),
		})
	}

	/// Cached endpoint description, refreshed through the provider on miss.
	pub async fn description(&self, endpoint_name: &str) -> Result<EndpointDescription> {
		let key = endpoint_name.to_string();
		if let Some(cached) = self.descriptions.lock().get(&key) {
			return Ok(cached);
		}
		match self.provider.describe_endpoint(endpoint_name).await {
			Ok(description) => {
				self.descriptions.lock().add(key, description.clone());
				Ok(description)
			}
			Err(error) => {
				if let Some(stale) = self.descriptions.lock().get_stale(&key) {
					log::warn!("endpoint lookup for '{endpoint_name}' failed, using stale metadata: {error:#}");
					return Ok(stale);
				}
				Err(error).with_context(|| format!("could not describe endpoint '{endpoint_name}'"))
			}
		}
	}

	/// Cached endpoint tags, refreshed through the provider on miss.
	pub async fn tags(&self, endpoint_name: &str) -> Result<BTreeMap<String, String>> {
		let key = endpoint_name.to_string();
		if let Some(cached) = self.tags.lock().get(&key) {
			return Ok(cached);
		}
		match self.provider.list_endpoint_tags(endpoint_name).await {
			Ok(tags) => {
				self.tags.lock().add(key, tags.clone());
				Ok(tags)
			}
			Err(error) => {
				if let Some(stale) = self.tags.lock().get_stale(&key) {
					log::warn!("tag lookup for '{endpoint_name}' failed, using stale tags: {error:#}");
					return Ok(stale);
				}
				Err(error).with_context(|| format!("could not list tags of endpoint '{endpoint_name}'"))
			}
		}
	}
}

/// Configurable in-memory provider, the test double for the control plane.
#[derive(Default)]
pub struct MemoryEndpointMetadata {
	endpoints: Mutex<BTreeMap<String, EndpointDescription>>,
	endpoint_tags: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
	describe_calls: Mutex<u32>,
	tag_calls: Mutex<u32>,
	fail_describe: Mutex<bool>,
	fail_tags: Mutex<bool>,
}

impl MemoryEndpointMetadata {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn insert_endpoint(&self, description: EndpointDescription) {
		self.endpoints.lock().insert(description.name.clone(), description);
	}

	pub fn insert_tags(&self, endpoint_name: &str, tags: BTreeMap<String, String>) {
		self.endpoint_tags.lock().insert(endpoint_name.to_string(), tags);
	}

	pub fn set_fail_describe(&self, fail: bool) {
		*self.fail_describe.lock() = fail;
	}

	pub fn set_fail_tags(&self, fail: bool) {
		*self.fail_tags.lock() = fail;
	}

	pub fn describe_calls(&self) -> u32 {
		*self.describe_calls.lock()
	}

	pub fn tag_calls(&self) -> u32 {
		*self.tag_calls.lock()
	}
}

#[async_trait]
impl EndpointMetadataProvider for MemoryEndpointMetadata {
	async fn describe_endpoint(&self, endpoint_name: &str) -> Result<EndpointDescription> {
		*self.describe_calls.lock() += 1;
		if *self.fail_describe.lock() {
			anyhow::bail!("control plane unavailable");
		}
		self
			.endpoints
			.lock()
			.get(endpoint_name)
			.cloned()
			.ok_or_else(|| anyhow::anyhow!("endpoint '{endpoint_name}' not found"))
	}

	async fn list_endpoint_tags(&self, endpoint_name: &str) -> Result<BTreeMap<String, String>> {
		*self.tag_calls.lock() += 1;
		if *self.fail_tags.lock() {
			anyhow::bail!("control plane unavailable");
		}
		Ok(self.endpoint_tags.lock().get(endpoint_name).cloned().unwrap_or_default())
	}
}
