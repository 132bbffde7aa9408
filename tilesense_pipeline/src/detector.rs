//! Feature detectors.
//!
//! A detector converts one encoded tile into a feature collection via a
//! remote model. Synchronous invocation comes in two flavors: HTTP
//! endpoints addressed by URL, and managed endpoints addressed by name
//! through a [`SyncEndpointClient`]. The asynchronous flavor lives in
//! [`crate::async_path`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tilesense_core::{EndpointSpec, PixelWindow, RetryPolicy};
use tilesense_geometry::{Feature, FeatureCollection, PixelBox};

/// Converts a single encoded tile into detections in tile pixel space.
#[async_trait]
pub trait FeatureDetector: Send + Sync {
	async fn detect(&self, tile_bytes: &[u8], tile_bounds: PixelWindow) -> Result<FeatureCollection>;
}

pub type SharedFeatureDetector = Arc<dyn FeatureDetector>;

/// Detector invoking an HTTP endpoint: POSTs the tile bytes and expects a
/// GeoJSON FeatureCollection back.
pub struct HttpFeatureDetector {
	client: reqwest::Client,
	url: String,
	retry: RetryPolicy,
}

impl HttpFeatureDetector {
	pub fn new(url: &str) -> Self {
		Self {
			client: reqwest::Client::new(),
			url: url.to_string(),
			retry: RetryPolicy::default(),
		}
	}

	pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	async fn invoke_once(&self, tile_bytes: &[u8]) -> Result<String> {
		let response = self
			.client
			.post(&self.url)
			.header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
			.body(tile_bytes.to_vec())
			.send()
			.await
			.with_context(|| format!("could not invoke HTTP endpoint '{}'", self.url))?
			.error_for_status()
			.with_context(|| format!("HTTP endpoint '{}' rejected the tile", self.url))?;
		response
			.text()
			.await
			.with_context(|| format!("could not read response from '{}'", self.url))
	}
}

#[async_trait]
impl FeatureDetector for HttpFeatureDetector {
	async fn detect(&self, tile_bytes: &[u8], _tile_bounds: PixelWindow) -> Result<FeatureCollection> {
		let body = self
			.retry
			.run("HTTP endpoint invocation", || self.invoke_once(tile_bytes))
			.await?;
		FeatureCollection::from_detector_response(&body)
	}
}

/// Narrow client for name-addressed synchronous model endpoints.
#[async_trait]
pub trait SyncEndpointClient: Send + Sync {
	/// Invokes the endpoint (optionally a specific variant) with the tile
	/// payload and returns the raw response body.
	async fn invoke_endpoint(&self, endpoint_name: &str, target_variant: Option<&str>, payload: &[u8]) -> Result<String>;
}

pub type SharedSyncEndpointClient = Arc<dyn SyncEndpointClient>;

/// Detector invoking a managed endpoint by name.
pub struct EndpointFeatureDetector {
	client: SharedSyncEndpointClient,
	endpoint_name: String,
	target_variant: Option<String>,
	retry: RetryPolicy,
}

impl EndpointFeatureDetector {
	pub fn new(client: SharedSyncEndpointClient, endpoint: &EndpointSpec) -> Self {
		Self {
			client,
			endpoint_name: endpoint.name.clone(),
			target_variant: endpoint.target_variant().map(str::to_string),
			retry: RetryPolicy::default(),
		}
	}

	pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}
}

#[async_trait]
impl FeatureDetector for EndpointFeatureDetector {
	async fn detect(&self, tile_bytes: &[u8], _tile_bounds: PixelWindow) -> Result<FeatureCollection> {
		let body = self
			.retry
			.run("endpoint invocation", || {
				self
					.client
					.invoke_endpoint(&self.endpoint_name, self.target_variant.as_deref(), tile_bytes)
			})
			.await
			.with_context(|| format!("could not invoke endpoint '{}'", self.endpoint_name))?;
		FeatureCollection::from_detector_response(&body)
	}
}

/// Test detector producing a fixed number of detections per tile, laid out
/// as small boxes in tile coordinates.
pub struct StaticFeatureDetector {
	detections_per_tile: usize,
	score: f64,
	invocations: Mutex<u32>,
	fail: Mutex<bool>,
}

impl StaticFeatureDetector {
	pub fn new(detections_per_tile: usize, score: f64) -> Arc<Self> {
		Arc::new(Self {
			detections_per_tile,
			score,
			invocations: Mutex::new(0),
			fail: Mutex::new(false),
		})
	}

	pub fn set_fail(&self, fail: bool) {
		*self.fail.lock() = fail;
	}

	pub fn invocations(&self) -> u32 {
		*self.invocations.lock()
	}
}

#[async_trait]
impl FeatureDetector for StaticFeatureDetector {
	async fn detect(&self, _tile_bytes: &[u8], tile_bounds: PixelWindow) -> Result<FeatureCollection> {
		*self.invocations.lock() += 1;
		if *self.fail.lock() {
			anyhow::bail!("model endpoint unavailable");
		}
		let features = (0..self.detections_per_tile)
			.map(|i| {
				let offset = 10.0 + i as f64 * 20.0;
				Feature::new(
					&format!("det-{}-{i}", tile_bounds.id()),
					PixelBox::new(offset, offset, offset + 8.0, offset + 8.0),
				)
				.with_score(self.score)
			})
			.collect();
		Ok(FeatureCollection::new(features))
	}
}
