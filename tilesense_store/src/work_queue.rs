//! Work queues.
//!
//! Models the subset of a cloud message queue the orchestrator relies on:
//! long-poll receives, visibility timeouts, explicit acknowledgement,
//! release with a chosen visibility (zero releases immediately for retry)
//! and a dead-letter destination. Delivery is at-least-once; a message whose
//! visibility timeout lapses reappears.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
	collections::{HashMap, VecDeque},
	sync::Arc,
	time::{Duration, Instant},
};
use uuid::Uuid;

/// A received message leased until acknowledged or until its visibility
/// timeout lapses.
#[derive(Clone, Debug)]
pub struct QueueMessage {
	pub body: String,
	/// Lease handle used to finish or release the message.
	pub receipt: String,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
	/// Enqueues a message.
	async fn send(&self, body: &str) -> Result<()>;

	/// Enqueues a message that becomes visible only after `delay`.
	async fn send_delayed(&self, body: &str, delay: Duration) -> Result<()>;

	/// Receives up to `max_messages`, waiting up to `wait` for the first one.
	/// Received messages stay invisible for the queue's visibility timeout.
	async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>>;

	/// Acknowledges a message; it will not be delivered again.
	async fn finish(&self, receipt: &str) -> Result<()>;

	/// Releases a message back to the queue after `visibility`. Zero makes
	/// it immediately available, the retry path for transient failures.
	async fn release(&self, receipt: &str, visibility: Duration) -> Result<()>;

	/// Moves a message to the dead-letter destination and acknowledges it.
	async fn dead_letter(&self, receipt: &str, body: &str) -> Result<()>;

	/// Number of messages currently queued (visible or leased).
	async fn depth(&self) -> Result<usize>;
}

pub type SharedWorkQueue = Arc<dyn WorkQueue>;

struct StoredMessage {
	body: String,
	visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
	pending: VecDeque<StoredMessage>,
	in_flight: HashMap<String, String>,
	dead_letters: Vec<String>,
}

/// In-memory queue with visibility-timeout semantics.
pub struct MemoryWorkQueue {
	state: Mutex<QueueState>,
	visibility: Duration,
}

impl MemoryWorkQueue {
	pub fn new(visibility: Duration) -> Arc<Self> {
		Arc::new(Self {
			state: Mutex::new(QueueState::default()),
			visibility,
		})
	}

	/// Dead-lettered payloads, for inspection in tests.
	pub fn dead_letters(&self) -> Vec<String> {
		self.state.lock().dead_letters.clone()
	}

	fn try_receive(&self, max_messages: usize) -> Vec<QueueMessage> {
		let now = Instant::now();
		let mut state = self.state.lock();
		let mut received = Vec::new();
		let mut retained = VecDeque::new();

		while let Some(message) = state.pending.pop_front() {
			if received.len() < max_messages && message.visible_at <= now {
				let receipt = Uuid::new_v4().to_string();
				state.in_flight.insert(receipt.clone(), message.body.clone());
				received.push(QueueMessage { body: message.body, receipt });
			} else {
				retained.push_back(message);
			}
		}
		// Leased messages come back automatically when their visibility
		// timeout lapses.
		let visible_again = now + self.visibility;
		for message in &received {
			retained.push_back(StoredMessage {
				body: message.body.clone(),
				visible_at: visible_again,
			});
		}
		state.pending = retained;
		received
	}

	fn remove_pending_copy(state: &mut QueueState, body: &str) {
		if let Some(index) = state.pending.iter().position(|m| m.body == body) {
			state.pending.remove(index);
		}
	}
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
	async fn send(&self, body: &str) -> Result<()> {
		self.send_delayed(body, Duration::ZERO).await
	}

	async fn send_delayed(&self, body: &str, delay: Duration) -> Result<()> {
		self.state.lock().pending.push_back(StoredMessage {
			body: body.to_string(),
			visible_at: Instant::now() + delay,
		});
		Ok(())
	}

	async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>> {
		let deadline = Instant::now() + wait;
		loop {
			let received = self.try_receive(max_messages);
			if !received.is_empty() || Instant::now() >= deadline {
				return Ok(received);
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	}

	async fn finish(&self, receipt: &str) -> Result<()> {
		let mut state = self.state.lock();
		if let Some(body) = state.in_flight.remove(receipt) {
			Self::remove_pending_copy(&mut state, &body);
		}
		Ok(())
	}

	async fn release(&self, receipt: &str, visibility: Duration) -> Result<()> {
		let mut state = self.state.lock();
		if let Some(body) = state.in_flight.remove(receipt) {
			Self::remove_pending_copy(&mut state, &body);
			state.pending.push_back(StoredMessage {
				body,
				visible_at: Instant::now() + visibility,
			});
		}
		Ok(())
	}

	async fn dead_letter(&self, receipt: &str, body: &str) -> Result<()> {
		let mut state = self.state.lock();
		if let Some(leased) = state.in_flight.remove(receipt) {
			Self::remove_pending_copy(&mut state, &leased);
		}
		// Re-dead-lettering the same payload is a no-op.
		if !state.dead_letters.iter().any(|existing| existing == body) {
			state.dead_letters.push(body.to_string());
		}
		Ok(())
	}

	async fn depth(&self) -> Result<usize> {
		let state = self.state.lock();
		Ok(state.pending.len())
	}
}
