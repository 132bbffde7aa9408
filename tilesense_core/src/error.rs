//! Error taxonomy of the orchestrator.
//!
//! The kinds mirror how failures are dispatched, not where they originate:
//! dead-letter, retry with zero visibility, fail the region, or fail the
//! image. Errors flow through `anyhow`; the main loop and handlers downcast
//! to [`ProcessingError`] at their dispatch points. Tile-level errors never
//! escape the region handler, region-level errors never escape the image
//! handler.

use std::{error::Error, fmt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
	/// Payload malformed or semantically invalid. Dead-lettered, never retried.
	InvalidRequest(String),
	/// Image URI unreachable or unreadable. Dead-lettered at intake.
	LoadImage(String),
	/// Endpoint mode this build cannot invoke. Marks the image failed.
	UnsupportedModel(String),
	/// Transient dependency failure. The upstream message is released with
	/// zero visibility.
	RetryableJob(String),
	/// Endpoint at region capacity; the region message is released with zero
	/// visibility.
	SelfThrottledRegion,
	/// Worker-pool initialization failed.
	SetupWorkers(String),
	/// Bulk tile-processing failure.
	ProcessTiles(String),
	/// Feature aggregation failed after regions completed.
	AggregateFeatures(String),
	/// Writing aggregated features to an output sink failed.
	AggregateOutputFeatures(String),
	/// Object-store operation on the async path failed.
	ObjectStoreOperation(String),
	/// Asynchronous inference produced no result within its window.
	AsyncInferenceTimeout(String),
	/// A pluggable workflow extension is misconfigured. Whether this
	/// surfaces or falls back to the underlying error is governed by
	/// `extension_fallback_enabled`.
	ExtensionConfiguration(String),
}

impl ProcessingError {
	/// Stable code used as the `ErrorCode` metric dimension.
	pub fn code(&self) -> &'static str {
		match self {
			ProcessingError::InvalidRequest(_) => "InvalidRequest",
			ProcessingError::LoadImage(_) => "LoadImageFailure",
			ProcessingError::UnsupportedModel(_) => "UnsupportedModelHost",
			ProcessingError::RetryableJob(_) => "RetryableJob",
			ProcessingError::SelfThrottledRegion => "SelfThrottledRegion",
			ProcessingError::SetupWorkers(_) => "SetupWorkers",
			ProcessingError::ProcessTiles(_) => "ProcessTiles",
			ProcessingError::AggregateFeatures(_) => "AggregateFeatures",
			ProcessingError::AggregateOutputFeatures(_) => "AggregateOutputFeatures",
			ProcessingError::ObjectStoreOperation(_) => "S3Operation",
			ProcessingError::AsyncInferenceTimeout(_) => "AsyncInferenceTimeout",
			ProcessingError::ExtensionConfiguration(_) => "ExtensionConfiguration",
		}
	}

	/// True for failures the upstream queue should redeliver.
	pub fn is_retryable(&self) -> bool {
		matches!(self, ProcessingError::RetryableJob(_) | ProcessingError::SelfThrottledRegion)
	}

	/// True for payloads that must be dead-lettered instead of retried.
	pub fn is_dead_letter(&self) -> bool {
		matches!(self, ProcessingError::InvalidRequest(_) | ProcessingError::LoadImage(_))
	}
}

impl fmt::Display for ProcessingError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProcessingError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
			ProcessingError::LoadImage(msg) => write!(f, "could not load image: {msg}"),
			ProcessingError::UnsupportedModel(msg) => write!(f, "unsupported model host: {msg}"),
			ProcessingError::RetryableJob(msg) => write!(f, "retryable job failure: {msg}"),
			ProcessingError::SelfThrottledRegion => write!(f, "region self-throttled: endpoint at capacity"),
			ProcessingError::SetupWorkers(msg) => write!(f, "could not set up tile workers: {msg}"),
			ProcessingError::ProcessTiles(msg) => write!(f, "tile processing failed: {msg}"),
			ProcessingError::AggregateFeatures(msg) => write!(f, "feature aggregation failed: {msg}"),
			ProcessingError::AggregateOutputFeatures(msg) => write!(f, "could not write output features: {msg}"),
			ProcessingError::ObjectStoreOperation(msg) => write!(f, "object store operation failed: {msg}"),
			ProcessingError::AsyncInferenceTimeout(msg) => write!(f, "async inference timed out: {msg}"),
			ProcessingError::ExtensionConfiguration(msg) => write!(f, "extension misconfigured: {msg}"),
		}
	}
}

impl Error for ProcessingError {}

/// Extracts the taxonomy kind from an `anyhow` chain, if one is present.
pub fn processing_error(error: &anyhow::Error) -> Option<&ProcessingError> {
	error.chain().find_map(|cause| cause.downcast_ref::<ProcessingError>())
}
