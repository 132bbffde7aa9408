//! Integration tests for the concurrency contracts of the stores: the
//! at-least-once queue, the conditional admission update, and idempotent
//! completion bookkeeping under racing writers.

use std::{sync::Arc, time::Duration};
use tilesense_core::ImageRequest;
use tilesense_store::{
	MemoryJobsStore, MemoryRegionStore, MemoryWorkQueue, RegionRequestRecord, RegionRequestStore, RequestedJobsStore,
	StartAttemptOutcome, WorkQueue,
};

fn sample_request(job_id: &str) -> ImageRequest {
	ImageRequest::from_external_message(&format!(
		r#"{{
			"jobId": "{job_id}",
			"imageUrls": ["s3://imagery/scene.ntf"],
			"outputs": [{{"type": "S3", "bucket": "results", "prefix": "p/"}}],
			"imageProcessor": {{"name": "m", "type": "SM_ENDPOINT"}},
			"imageProcessorTileSize": 512,
			"imageProcessorTileOverlap": 128
		}}"#
	))
	.unwrap()
}

#[tokio::test]
async fn unacknowledged_messages_are_redelivered() {
	let queue = MemoryWorkQueue::new(Duration::from_millis(60));
	queue.send("work-item").await.unwrap();

	// A worker that crashes mid-processing never acknowledges.
	let first = queue.receive(1, Duration::ZERO).await.unwrap();
	assert_eq!(first.len(), 1);
	drop(first);

	// After the visibility timeout another worker picks it up.
	tokio::time::sleep(Duration::from_millis(100)).await;
	let second = queue.receive(1, Duration::ZERO).await.unwrap();
	assert_eq!(second.len(), 1);
	assert_eq!(second[0].body, "work-item");
	queue.finish(&second[0].receipt).await.unwrap();

	tokio::time::sleep(Duration::from_millis(100)).await;
	assert!(queue.receive(1, Duration::ZERO).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_schedulers_admit_a_job_at_most_once() {
	let store = MemoryJobsStore::new();
	store.add_new_request(&sample_request("job-1"), Some(2)).await.unwrap();
	let snapshot = store.get_request("m", "job-1").await.unwrap().unwrap();

	// Eight schedulers race on the same snapshot.
	let mut tasks = Vec::new();
	for _ in 0..8 {
		let store = store.clone();
		let snapshot = snapshot.clone();
		tasks.push(tokio::spawn(async move {
			matches!(
				store.start_next_attempt(&snapshot).await.unwrap(),
				StartAttemptOutcome::Started(_)
			)
		}));
	}
	let mut wins = 0;
	for task in tasks {
		if task.await.unwrap() {
			wins += 1;
		}
	}
	assert_eq!(wins, 1);

	let record = store.get_request("m", "job-1").await.unwrap().unwrap();
	assert_eq!(record.num_attempts, 1);
}

#[tokio::test]
async fn racing_tile_results_count_each_tile_once() {
	let store = MemoryRegionStore::new();
	store.start_region(RegionRequestRecord::new("img", "r1", 0)).await.unwrap();
	store.set_total_tile_count("img", "r1", 4).await.unwrap();

	// Two notification paths (event and poller) report every tile.
	let mut tasks = Vec::new();
	for tile in 0..4u32 {
		for _ in 0..2 {
			let store = store.clone();
			tasks.push(tokio::spawn(async move {
				store
					.add_tile_result("img", "r1", &format!("tile-{tile}"), true)
					.await
					.unwrap();
			}));
		}
	}
	for task in tasks {
		task.await.unwrap();
	}

	let record = store.get_region("img", "r1").await.unwrap().unwrap();
	assert_eq!(record.succeeded_tile_count(), 4);
	assert!(record.tiles_terminal());
}

#[tokio::test]
async fn regions_complete_set_is_bounded_by_region_ids() {
	let store = MemoryJobsStore::new();
	store.add_new_request(&sample_request("job-1"), Some(3)).await.unwrap();

	for region in ["r1", "r2", "r1", "r2", "r3"] {
		store.complete_region("m", "job-1", region).await.unwrap();
	}
	let record = store.get_request("m", "job-1").await.unwrap().unwrap();
	assert_eq!(record.regions_complete.len(), 3);
	assert!(record.is_complete());
}

#[tokio::test]
async fn dead_letter_then_redelivery_is_still_one_entry() {
	let queue: Arc<MemoryWorkQueue> = MemoryWorkQueue::new(Duration::from_millis(40));
	queue.send("poison").await.unwrap();

	// The first consumer dead-letters; a stale consumer holding an old
	// receipt tries again after redelivery.
	let first = queue.receive(1, Duration::ZERO).await.unwrap();
	queue.dead_letter(&first[0].receipt, "poison").await.unwrap();
	queue.dead_letter("stale", "poison").await.unwrap();

	assert_eq!(queue.dead_letters().len(), 1);
	tokio::time::sleep(Duration::from_millis(80)).await;
	assert!(queue.receive(1, Duration::ZERO).await.unwrap().is_empty());
}
