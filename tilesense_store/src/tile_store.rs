//! Tile-request store for the asynchronous inference path.
//!
//! Hash key `region_id`, range key `tile_id`, with secondary indexes on
//! `inference_id` and `output_location` because result notifications arrive
//! keyed by either. Rows expire by TTL.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tilesense_core::{TileRequest, TileStatus};

/// Result of a requested status transition.
#[derive(Clone, Debug)]
pub enum TileTransition {
	/// The transition was applied; the updated row is returned.
	Applied(TileRequest),
	/// The row was already terminal; the event must be treated as a no-op.
	AlreadyTerminal(TileRequest),
}

#[async_trait]
pub trait TileRequestStore: Send + Sync {
	/// Inserts or replaces a tile-request row.
	async fn put_tile_request(&self, request: TileRequest) -> Result<()>;

	async fn get_tile_request(&self, region_id: &str, tile_id: &str) -> Result<Option<TileRequest>>;

	/// Secondary-index lookup by inference id. Multiple matches indicate a
	/// correlation bug; the caller treats them as a lookup failure.
	async fn get_by_inference_id(&self, inference_id: &str) -> Result<Vec<TileRequest>>;

	/// Secondary-index lookup by result-object URI.
	async fn get_by_output_location(&self, output_location: &str) -> Result<Vec<TileRequest>>;

	/// Applies a terminal transition at most once: a row that is already
	/// terminal is returned unchanged.
	async fn transition(
		&self,
		region_id: &str,
		tile_id: &str,
		status: TileStatus,
		failure_reason: Option<&str>,
	) -> Result<TileTransition>;

	/// Removes rows whose TTL has passed.
	async fn purge_expired(&self, now: i64) -> Result<usize>;
}

pub type SharedTileStore = Arc<dyn TileRequestStore>;

/// In-memory tile-request store.
#[derive(Default)]
pub struct MemoryTileStore {
	rows: Mutex<HashMap<(String, String), TileRequest>>,
}

impl MemoryTileStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn len(&self) -> usize {
		self.rows.lock().len()
	}
}

#[async_trait]
impl TileRequestStore for MemoryTileStore {
	async fn put_tile_request(&self, request: TileRequest) -> Result<()> {
		self
			.rows
			.lock()
			.insert((request.region_id.clone(), request.tile_id.clone()), request);
		Ok(())
	}

	async fn get_tile_request(&self, region_id: &str, tile_id: &str) -> Result<Option<TileRequest>> {
		Ok(
			self
				.rows
				.lock()
				.get(&(region_id.to_string(), tile_id.to_string()))
				.cloned(),
		)
	}

	async fn get_by_inference_id(&self, inference_id: &str) -> Result<Vec<TileRequest>> {
		Ok(
			self
				.rows
				.lock()
				.values()
				.filter(|row| row.inference_id.as_deref() == Some(inference_id))
				.cloned()
				.collect(),
		)
	}

	async fn get_by_output_location(&self, output_location: &str) -> Result<Vec<TileRequest>> {
		Ok(
			self
				.rows
				.lock()
				.values()
				.filter(|row| row.output_location.as_deref() == Some(output_location))
				.cloned()
				.collect(),
		)
	}

	async fn transition(
		&self,
		region_id: &str,
		tile_id: &str,
		status: TileStatus,
		failure_reason: Option<&str>,
	) -> Result<TileTransition> {
		let mut rows = self.rows.lock();
		let row = rows
			.get_mut(&(region_id.to_string(), tile_id.to_string()))
			.ok_or_else(|| anyhow!("tile '{tile_id}' of region '{region_id}' has no row"))?;
		if row.is_terminal() {
			return Ok(TileTransition::AlreadyTerminal(row.clone()));
		}
		row.status = status;
		if let Some(reason) = failure_reason {
			row.failure_reason = Some(reason.to_string());
		}
		Ok(TileTransition::Applied(row.clone()))
	}

	async fn purge_expired(&self, now: i64) -> Result<usize> {
		let mut rows = self.rows.lock();
		let before = rows.len();
		rows.retain(|_, row| row.expire_time > now);
		Ok(before - rows.len())
	}
}
