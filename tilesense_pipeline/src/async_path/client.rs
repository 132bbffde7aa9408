//! Asynchronous endpoint client.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Handles returned by an asynchronous endpoint at submission time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AsyncInvocation {
	/// Opaque id correlating submission with result notifications.
	pub inference_id: String,
	/// Object URI where the endpoint writes the result payload.
	pub output_location: String,
	/// Object URI where the endpoint writes failure details.
	pub failure_location: String,
}

/// Narrow client for asynchronous model endpoints: submit an input object,
/// get back the correlation handles.
#[async_trait]
pub trait AsyncEndpointClient: Send + Sync {
	async fn invoke_async(&self, endpoint_name: &str, input_location: &str) -> Result<AsyncInvocation>;
}

pub type SharedAsyncEndpointClient = Arc<dyn AsyncEndpointClient>;

/// In-memory async endpoint for tests: issues invocation handles and
/// records them so a test can later materialize results or failures.
#[derive(Default)]
pub struct MemoryAsyncEndpoint {
	invocations: Mutex<Vec<(String, AsyncInvocation)>>,
	output_bucket: String,
	fail: Mutex<bool>,
}

impl MemoryAsyncEndpoint {
	pub fn new(output_bucket: &str) -> Arc<Self> {
		Arc::new(Self {
			invocations: Mutex::new(Vec::new()),
			output_bucket: output_bucket.to_string(),
			fail: Mutex::new(false),
		})
	}

	pub fn set_fail(&self, fail: bool) {
		*self.fail.lock() = fail;
	}

	/// `(input_location, invocation)` pairs in submission order.
	pub fn invocations(&self) -> Vec<(String, AsyncInvocation)> {
		self.invocations.lock().clone()
	}
}

#[async_trait]
impl AsyncEndpointClient for MemoryAsyncEndpoint {
	async fn invoke_async(&self, _endpoint_name: &str, input_location: &str) -> Result<AsyncInvocation> {
		if *self.fail.lock() {
			return Err(anyhow!("async endpoint rejected the submission"));
		}
		let inference_id = Uuid::new_v4().to_string();
		let invocation = AsyncInvocation {
			output_location: format!("s3://{}/results/{inference_id}.json", self.output_bucket),
			failure_location: format!("s3://{}/failures/{inference_id}.json", self.output_bucket),
			inference_id,
		};
		self
			.invocations
			.lock()
			.push((input_location.to_string(), invocation.clone()));
		Ok(invocation)
	}
}
