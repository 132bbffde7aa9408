//! Service configuration.
//!
//! All knobs come from `TILESENSE_*` environment variables with defaults
//! suitable for a single-node deployment; the CLI can override a subset.

use anyhow::{Context, Result};
use std::{env, str::FromStr};

/// Runtime configuration of one orchestrator process.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
	/// Edge length of processing regions in pixels.
	pub region_size: u32,
	/// Tile workers per CPU in the region worker pool.
	pub workers_per_cpu: usize,
	/// Maximum outstanding images buffered ahead of the scheduler.
	pub max_jobs_lookahead: usize,
	/// Admissions attempted per job before it is abandoned.
	pub max_retry_attempts: u32,
	/// Seconds after which an admitted job no longer counts as running and
	/// may be rescheduled.
	pub retry_time: i64,
	/// Assumed concurrent-tile capacity of HTTP endpoints.
	pub default_http_concurrency: u32,
	/// Per-instance concurrency when an endpoint carries no override tag.
	pub default_instance_concurrency: u32,
	/// Fraction of endpoint capacity the scheduler may fill; above 1.0
	/// overbooks, below 1.0 reserves headroom.
	pub capacity_target_percentage: f64,
	/// Enables endpoint-load admission control.
	pub throttling_enabled: bool,
	/// Enables region-dispatch self-throttling.
	pub self_throttling: bool,
	/// In-progress region ceiling per endpoint when self-throttling.
	pub max_regions_per_endpoint: usize,
	/// Delay before the async poller first checks a submitted tile, seconds.
	pub tile_poller_delay: u64,
	/// Minimum spacing between queue-depth metric emissions, seconds.
	pub metrics_interval: u64,
	/// Long-poll wait on the region queue, seconds.
	pub region_queue_wait: u64,
	/// Visibility timeout for upstream messages, seconds.
	pub message_visibility: u64,
	/// Sleep between image-completion polls, seconds.
	pub completion_poll_interval: u64,
	/// Upper bound on waiting for distributed regions, seconds.
	pub completion_timeout: u64,
	/// When a workflow extension is misconfigured: fall back to the
	/// underlying error (true) or surface the configuration error (false).
	pub extension_fallback_enabled: bool,
}

impl Default for ServiceConfig {
	fn default() -> Self {
		Self {
			region_size: 20480,
			workers_per_cpu: 1,
			max_jobs_lookahead: 10,
			max_retry_attempts: 3,
			retry_time: 600,
			default_http_concurrency: 10,
			default_instance_concurrency: 4,
			capacity_target_percentage: 1.0,
			throttling_enabled: true,
			self_throttling: true,
			max_regions_per_endpoint: 10,
			tile_poller_delay: 60,
			metrics_interval: 60,
			region_queue_wait: 10,
			message_visibility: 20 * 60,
			completion_poll_interval: 5,
			completion_timeout: 4 * 60 * 60,
			extension_fallback_enabled: true,
		}
	}
}

impl ServiceConfig {
	/// Builds the configuration from `TILESENSE_*` environment variables,
	/// falling back to defaults for unset variables.
	pub fn from_env() -> Result<Self> {
		let defaults = ServiceConfig::default();
		Ok(Self {
			region_size: env_parsed("TILESENSE_REGION_SIZE", defaults.region_size)?,
			workers_per_cpu: env_parsed("TILESENSE_WORKERS_PER_CPU", defaults.workers_per_cpu)?,
			max_jobs_lookahead: env_parsed("TILESENSE_MAX_JOBS_LOOKAHEAD", defaults.max_jobs_lookahead)?,
			max_retry_attempts: env_parsed("TILESENSE_MAX_RETRY_ATTEMPTS", defaults.max_retry_attempts)?,
			retry_time: env_parsed("TILESENSE_RETRY_TIME", defaults.retry_time)?,
			default_http_concurrency: env_parsed("TILESENSE_DEFAULT_HTTP_CONCURRENCY", defaults.default_http_concurrency)?,
			default_instance_concurrency: env_parsed(
				"TILESENSE_DEFAULT_INSTANCE_CONCURRENCY",
				defaults.default_instance_concurrency,
			)?,
			capacity_target_percentage: env_parsed(
				"TILESENSE_CAPACITY_TARGET_PERCENTAGE",
				defaults.capacity_target_percentage,
			)?,
			throttling_enabled: env_parsed("TILESENSE_THROTTLING_ENABLED", defaults.throttling_enabled)?,
			self_throttling: env_parsed("TILESENSE_SELF_THROTTLING", defaults.self_throttling)?,
			max_regions_per_endpoint: env_parsed("TILESENSE_MAX_REGIONS_PER_ENDPOINT", defaults.max_regions_per_endpoint)?,
			tile_poller_delay: env_parsed("TILESENSE_TILE_POLLER_DELAY", defaults.tile_poller_delay)?,
			metrics_interval: env_parsed("TILESENSE_METRICS_INTERVAL", defaults.metrics_interval)?,
			region_queue_wait: env_parsed("TILESENSE_REGION_QUEUE_WAIT", defaults.region_queue_wait)?,
			message_visibility: env_parsed("TILESENSE_MESSAGE_VISIBILITY", defaults.message_visibility)?,
			completion_poll_interval: env_parsed(
				"TILESENSE_COMPLETION_POLL_INTERVAL",
				defaults.completion_poll_interval,
			)?,
			completion_timeout: env_parsed("TILESENSE_COMPLETION_TIMEOUT", defaults.completion_timeout)?,
			extension_fallback_enabled: env_parsed(
				"TILESENSE_EXTENSION_FALLBACK_ENABLED",
				defaults.extension_fallback_enabled,
			)?,
		})
	}
}

fn env_parsed<T>(name: &str, default: T) -> Result<T>
where
	T: FromStr,
	T::Err: std::error::Error + Send + Sync + 'static,
{
	match env::var(name) {
		Ok(value) => value
			.parse::<T>()
			.with_context(|| format!("could not parse environment variable {name}='{value}'")),
		Err(_) => Ok(default),
	}
}
