//! Batched endpoint invocation.
//!
//! Some endpoints amortize better when several tiles travel in one request.
//! Workers still process one tile at a time; their detectors hand payloads
//! to a shared [`TileBatcher`] task which flushes a full batch immediately
//! and a partial one after a linger window, then fans the per-tile
//! responses back out. A region whose endpoint carries the `BatchSize`
//! parameter gets batching transparently through the detector factory.

use crate::FeatureDetector;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tilesense_core::PixelWindow;
use tilesense_geometry::FeatureCollection;
use tokio::sync::{mpsc, oneshot};

/// Narrow client for endpoints accepting several tiles per invocation.
/// Returns exactly one response body per payload, in submission order.
#[async_trait]
pub trait BatchEndpointClient: Send + Sync {
	async fn invoke_batch(
		&self,
		endpoint_name: &str,
		target_variant: Option<&str>,
		payloads: &[Vec<u8>],
	) -> Result<Vec<String>>;
}

pub type SharedBatchEndpointClient = Arc<dyn BatchEndpointClient>;

/// How long a partial batch may wait for more tiles before flushing.
pub const BATCH_LINGER: Duration = Duration::from_millis(250);

struct BatchItem {
	payload: Vec<u8>,
	respond: oneshot::Sender<Result<String>>,
}

/// Accumulates tile payloads across workers and invokes the endpoint in
/// batches. Dropping the last handle drains the buffer and stops the task.
pub struct TileBatcher {
	sender: mpsc::Sender<BatchItem>,
}

impl TileBatcher {
	pub fn spawn(
		client: SharedBatchEndpointClient,
		endpoint_name: &str,
		target_variant: Option<&str>,
		batch_size: usize,
		linger: Duration,
	) -> Arc<Self> {
		let (sender, receiver) = mpsc::channel::<BatchItem>(batch_size.max(1) * 4);
		let endpoint_name = endpoint_name.to_string();
		let target_variant = target_variant.map(str::to_string);
		tokio::spawn(batcher_loop(
			client,
			endpoint_name,
			target_variant,
			batch_size.max(1),
			linger,
			receiver,
		));
		Arc::new(Self { sender })
	}

	/// Submits one payload and waits for its response body.
	pub async fn submit(&self, payload: Vec<u8>) -> Result<String> {
		let (respond, response) = oneshot::channel();
		self
			.sender
			.send(BatchItem { payload, respond })
			.await
			.map_err(|_| anyhow!("tile batcher has shut down"))?;
		response.await.map_err(|_| anyhow!("tile batcher dropped the request"))?
	}
}

async fn batcher_loop(
	client: SharedBatchEndpointClient,
	endpoint_name: String,
	target_variant: Option<String>,
	batch_size: usize,
	linger: Duration,
	mut receiver: mpsc::Receiver<BatchItem>,
) {
	let mut buffer: Vec<BatchItem> = Vec::with_capacity(batch_size);
	loop {
		let item = if buffer.is_empty() {
			// Nothing pending: wait indefinitely for work.
			match receiver.recv().await {
				Some(item) => item,
				None => break,
			}
		} else {
			// A partial batch is pending: wait at most the linger window
			// for it to fill, then flush it as-is.
			match tokio::time::timeout(linger, receiver.recv()).await {
				Ok(Some(item)) => item,
				Ok(None) => break,
				Err(_) => {
					flush(&client, &endpoint_name, target_variant.as_deref(), &mut buffer).await;
					continue;
				}
			}
		};

		buffer.push(item);
		if buffer.len() >= batch_size {
			flush(&client, &endpoint_name, target_variant.as_deref(), &mut buffer).await;
		}
	}
	// Channel closed: serve whatever is left.
	flush(&client, &endpoint_name, target_variant.as_deref(), &mut buffer).await;
}

async fn flush(
	client: &SharedBatchEndpointClient,
	endpoint_name: &str,
	target_variant: Option<&str>,
	buffer: &mut Vec<BatchItem>,
) {
	if buffer.is_empty() {
		return;
	}
	let items = std::mem::take(buffer);
	let payloads: Vec<Vec<u8>> = items.iter().map(|item| item.payload.clone()).collect();
	log::debug!("invoking endpoint '{endpoint_name}' with a batch of {} tiles", payloads.len());

	match client.invoke_batch(endpoint_name, target_variant, &payloads).await {
		Ok(responses) if responses.len() == items.len() => {
			for (item, response) in items.into_iter().zip(responses) {
				let _ = item.respond.send(Ok(response));
			}
		}
		Ok(responses) => {
			let reason = format!(
				"endpoint '{endpoint_name}' returned {} responses for {} payloads",
				responses.len(),
				payloads.len()
			);
			for item in items {
				let _ = item.respond.send(Err(anyhow!(reason.clone())));
			}
		}
		Err(error) => {
			let reason = format!("batch invocation of '{endpoint_name}' failed: {error:#}");
			for item in items {
				let _ = item.respond.send(Err(anyhow!(reason.clone())));
			}
		}
	}
}

/// Detector handle over a shared batcher; one per worker, all feeding the
/// same buffer.
pub struct BatchingFeatureDetector {
	batcher: Arc<TileBatcher>,
}

impl BatchingFeatureDetector {
	pub fn new(batcher: Arc<TileBatcher>) -> Self {
		Self { batcher }
	}
}

#[async_trait]
impl FeatureDetector for BatchingFeatureDetector {
	async fn detect(&self, tile_bytes: &[u8], _tile_bounds: PixelWindow) -> Result<FeatureCollection> {
		let body = self.batcher.submit(tile_bytes.to_vec()).await?;
		FeatureCollection::from_detector_response(&body)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use parking_lot::Mutex;
	use pretty_assertions::assert_eq;

	struct RecordingBatchClient {
		batch_sizes: Mutex<Vec<usize>>,
		fail: Mutex<bool>,
	}

	impl RecordingBatchClient {
		fn new() -> Arc<Self> {
			Arc::new(Self {
				batch_sizes: Mutex::new(Vec::new()),
				fail: Mutex::new(false),
			})
		}
	}

	#[async_trait]
	impl BatchEndpointClient for RecordingBatchClient {
		async fn invoke_batch(
			&self,
			_endpoint_name: &str,
			_target_variant: Option<&str>,
			payloads: &[Vec<u8>],
		) -> Result<Vec<String>> {
			if *self.fail.lock() {
				anyhow::bail!("endpoint down");
			}
			self.batch_sizes.lock().push(payloads.len());
			Ok(
				payloads
					.iter()
					.map(|payload| format!(r#"{{"echo": {}}}"#, payload.len()))
					.collect(),
			)
		}
	}

	#[tokio::test]
	async fn full_batches_flush_immediately() {
		let client = RecordingBatchClient::new();
		let batcher = TileBatcher::spawn(client.clone(), "m", None, 2, Duration::from_secs(10));

		let (a, b, c, d) = tokio::join!(
			batcher.submit(vec![1]),
			batcher.submit(vec![2, 2]),
			batcher.submit(vec![3, 3, 3]),
			batcher.submit(vec![4, 4, 4, 4]),
		);
		for result in [a, b, c, d] {
			assert!(result.is_ok());
		}
		let sizes = client.batch_sizes.lock().clone();
		assert_eq!(sizes.iter().sum::<usize>(), 4);
		assert!(sizes.iter().all(|size| *size <= 2));
	}

	#[tokio::test]
	async fn partial_batch_flushes_after_linger() {
		let client = RecordingBatchClient::new();
		let batcher = TileBatcher::spawn(client.clone(), "m", None, 8, Duration::from_millis(50));

		let response = batcher.submit(vec![9, 9]).await.unwrap();
		assert_eq!(response, r#"{"echo": 2}"#);
		assert_eq!(client.batch_sizes.lock().clone(), vec![1]);
	}

	#[tokio::test]
	async fn responses_map_to_payloads_in_order() {
		let client = RecordingBatchClient::new();
		let batcher = TileBatcher::spawn(client, "m", None, 2, Duration::from_millis(50));

		let (a, b) = tokio::join!(batcher.submit(vec![1]), batcher.submit(vec![2, 2]));
		let mut responses = vec![a.unwrap(), b.unwrap()];
		responses.sort();
		assert_eq!(responses, vec![r#"{"echo": 1}"#.to_string(), r#"{"echo": 2}"#.to_string()]);
	}

	#[tokio::test]
	async fn failures_propagate_to_every_waiter() {
		let client = RecordingBatchClient::new();
		*client.fail.lock() = true;
		let batcher = TileBatcher::spawn(client, "m", None, 2, Duration::from_millis(20));

		let (a, b) = tokio::join!(batcher.submit(vec![1]), batcher.submit(vec![2]));
		assert!(a.is_err());
		assert!(b.is_err());
	}
}
