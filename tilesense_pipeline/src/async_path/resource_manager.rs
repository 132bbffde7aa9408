//! Cleanup of transient async-path resources.
//!
//! Input objects, result objects and local temp files accumulate while
//! inferences are in flight. Registrations carry a [`CleanupPolicy`]; a
//! background task drains the queue, and shutdown can force a synchronous
//! drain. Failed cleanups are logged and re-queued; retries never block the
//! data path.

use parking_lot::Mutex;
use std::{
	collections::VecDeque,
	path::PathBuf,
	sync::Arc,
	time::{Duration, Instant},
};
use tilesense_store::{ObjectStore, SharedObjectStore};
use tokio::{sync::watch, task::JoinHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupPolicy {
	/// Clean up at the next drain.
	Immediate,
	/// Clean up once the delay has passed.
	Delayed(Duration),
	/// Never clean up; the resource outlives the process.
	Disabled,
}

#[derive(Clone, Debug)]
enum Resource {
	Object(String),
	TempFile(PathBuf),
}

#[derive(Clone, Debug)]
struct PendingCleanup {
	resource: Resource,
	due: Instant,
	attempts: u32,
}

/// Delay applied when re-queueing a failed cleanup.
const RETRY_DELAY: Duration = Duration::from_secs(30);
/// Attempts before a cleanup is abandoned with an error log.
const MAX_CLEANUP_ATTEMPTS: u32 = 5;

pub struct ResourceManager {
	object_store: SharedObjectStore,
	queue: Mutex<VecDeque<PendingCleanup>>,
}

impl ResourceManager {
	pub fn new(object_store: SharedObjectStore) -> Arc<Self> {
		Arc::new(Self {
			object_store,
			queue: Mutex::new(VecDeque::new()),
		})
	}

	pub fn register_object(&self, uri: &str, policy: CleanupPolicy) {
		self.register(Resource::Object(uri.to_string()), policy);
	}

	pub fn register_temp_file(&self, path: PathBuf, policy: CleanupPolicy) {
		self.register(Resource::TempFile(path), policy);
	}

	fn register(&self, resource: Resource, policy: CleanupPolicy) {
		let due = match policy {
			CleanupPolicy::Immediate => Instant::now(),
			CleanupPolicy::Delayed(delay) => Instant::now() + delay,
			CleanupPolicy::Disabled => return,
		};
		self.queue.lock().push_back(PendingCleanup {
			resource,
			due,
			attempts: 0,
		});
	}

	pub fn pending_count(&self) -> usize {
		self.queue.lock().len()
	}

	/// Processes all currently-due registrations; returns how many were
	/// cleaned up. Failures are re-queued with a retry delay.
	pub async fn process_pending(&self) -> usize {
		self.drain(false).await
	}

	/// Drains the whole registry regardless of due times; used on shutdown.
	pub async fn cleanup_all_resources(&self, force: bool) -> usize {
		self.drain(force).await
	}

	async fn drain(&self, force: bool) -> usize {
		let now = Instant::now();
		let due: Vec<PendingCleanup> = {
			let mut queue = self.queue.lock();
			let mut due = Vec::new();
			let mut keep = VecDeque::new();
			while let Some(pending) = queue.pop_front() {
				if force || pending.due <= now {
					due.push(pending);
				} else {
					keep.push_back(pending);
				}
			}
			*queue = keep;
			due
		};

		let mut cleaned = 0;
		for mut pending in due {
			match self.cleanup(&pending.resource).await {
				Ok(()) => cleaned += 1,
				Err(error) => {
					pending.attempts += 1;
					if pending.attempts >= MAX_CLEANUP_ATTEMPTS {
						log::error!("abandoning cleanup of {:?} after {} attempts: {error:#}", pending.resource, pending.attempts);
						continue;
					}
					log::warn!("cleanup of {:?} failed, re-queueing: {error:#}", pending.resource);
					pending.due = Instant::now() + RETRY_DELAY;
					self.queue.lock().push_back(pending);
				}
			}
		}
		cleaned
	}

	async fn cleanup(&self, resource: &Resource) -> anyhow::Result<()> {
		match resource {
			Resource::Object(uri) => self.object_store.delete_object(uri).await,
			Resource::TempFile(path) => match tokio::fs::remove_file(path).await {
				Ok(()) => Ok(()),
				Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
				Err(error) => Err(error.into()),
			},
		}
	}

	/// Spawns the background cleanup task; it drains pending registrations
	/// every `interval` until the shutdown flag flips.
	pub fn spawn_background(self: &Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
		let manager = self.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = tokio::time::sleep(interval) => {
						manager.process_pending().await;
					}
					result = shutdown.changed() => {
						if result.is_err() || *shutdown.borrow() {
							manager.cleanup_all_resources(true).await;
							return;
						}
					}
				}
			}
		})
	}
}
