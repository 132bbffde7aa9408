//! Image processing requests.
//!
//! An [`ImageRequest`] is the admission unit of the orchestrator. It is
//! parsed from the JSON message delivered on the upstream image queue (see
//! [`ImageRequest::from_external_message`] for the accepted field names),
//! validated, and then carried through the scheduler and handlers. The
//! internal representation also serializes with serde so it can be embedded
//! in the outstanding-jobs store.

use crate::types::{InvokeMode, TileCompression, TileFormat, TileGeometry};
use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Endpoint parameter key carrying an explicit variant override.
pub const TARGET_VARIANT_PARAMETER: &str = "TargetVariant";
/// Endpoint parameter key requesting batched invocation.
pub const BATCH_SIZE_PARAMETER: &str = "BatchSize";

/// Remote model endpoint addressed by an image request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
	/// Endpoint name, or a URL for HTTP endpoints.
	pub name: String,
	pub invoke_mode: InvokeMode,
	/// Optional endpoint parameters, e.g. `TargetVariant`.
	#[serde(default)]
	pub parameters: BTreeMap<String, String>,
}

impl EndpointSpec {
	pub fn new(name: &str, invoke_mode: InvokeMode) -> Self {
		Self {
			name: name.to_string(),
			invoke_mode,
			parameters: BTreeMap::new(),
		}
	}

	/// True if the endpoint is addressed by URL rather than by name.
	pub fn is_http(&self) -> bool {
		self.name.starts_with("http://") || self.name.starts_with("https://")
	}

	/// Explicit variant override, if the request carries a non-empty one.
	pub fn target_variant(&self) -> Option<&str> {
		self
			.parameters
			.get(TARGET_VARIANT_PARAMETER)
			.map(String::as_str)
			.filter(|v| !v.is_empty())
	}

	pub fn set_target_variant(&mut self, variant: &str) {
		self
			.parameters
			.insert(TARGET_VARIANT_PARAMETER.to_string(), variant.to_string());
	}

	/// Tiles per invocation for endpoints that accept batches. `None` when
	/// the parameter is absent or not a positive integer.
	pub fn batch_size(&self) -> Option<usize> {
		self
			.parameters
			.get(BATCH_SIZE_PARAMETER)
			.and_then(|value| value.parse::<usize>().ok())
			.filter(|size| *size > 1)
	}
}

/// Destination for aggregated feature collections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutputSinkSpec {
	/// Object-store prefix receiving one GeoJSON document per image.
	S3 { bucket: String, prefix: String },
	/// Streaming sink; large collections are partitioned into batches.
	Kinesis {
		stream: String,
		#[serde(rename = "batchSize", default = "default_batch_size")]
		batch_size: usize,
	},
}

fn default_batch_size() -> usize {
	500
}

/// Post-processing applied to the aggregated feature set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step")]
pub enum PostProcessingStep {
	#[serde(rename = "FEATURE_DISTILLATION")]
	FeatureDistillation { algorithm: DistillationAlgorithm },
}

/// Deduplication algorithm over overlapping detections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithmType")]
pub enum DistillationAlgorithm {
	#[serde(rename = "NMS")]
	Nms {
		#[serde(rename = "iouThreshold", default = "default_iou_threshold")]
		iou_threshold: f64,
	},
}

fn default_iou_threshold() -> f64 {
	0.75
}

/// A validated image processing request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageRequest {
	pub job_id: String,
	#[serde(default)]
	pub job_name: String,
	pub image_url: String,
	pub outputs: Vec<OutputSinkSpec>,
	pub endpoint: EndpointSpec,
	pub tile_geometry: TileGeometry,
	pub tile_format: TileFormat,
	pub tile_compression: TileCompression,
	/// Optional region of interest as a well-known-text polygon in lon/lat.
	#[serde(default)]
	pub region_of_interest: Option<String>,
	#[serde(default)]
	pub image_read_role: Option<String>,
	#[serde(default)]
	pub model_invoke_role: Option<String>,
	#[serde(default)]
	pub post_processing: Vec<PostProcessingStep>,
	/// User-supplied properties merged into every produced feature.
	#[serde(default)]
	pub feature_properties: Vec<Value>,
}

impl ImageRequest {
	/// Identity of the image within the fleet: the job id plus the image URL.
	pub fn image_id(&self) -> String {
		format!("{}:{}", self.job_id, self.image_url)
	}

	/// Group key used by the scheduler: the endpoint name.
	pub fn endpoint_id(&self) -> &str {
		&self.endpoint.name
	}

	/// IoU threshold of the feature-distillation step, if one is requested.
	pub fn distillation_iou_threshold(&self) -> Option<f64> {
		self.post_processing.iter().map(|step| {
			let PostProcessingStep::FeatureDistillation {
				algorithm: DistillationAlgorithm::Nms { iou_threshold },
			} = step;
			*iou_threshold
		}).next()
	}

	/// Parses the JSON message delivered by the upstream work queue.
	///
	/// Recognized top-level fields are the published API contract: `jobId`,
	/// `jobName`, `imageUrls`, `outputs`, `imageProcessor.{name,type}`,
	/// `imageProcessorParameters`, `imageProcessorTileSize`,
	/// `imageProcessorTileOverlap`, `imageProcessorTileFormat`,
	/// `imageProcessorTileCompression`, `postProcessing`, `regionOfInterest`,
	/// `imageReadRole`, `imageProcessorRole` and `featureProperties`.
	pub fn from_external_message(body: &str) -> Result<Self> {
		let message: ExternalImageRequest =
			serde_json::from_str(body).context("could not parse image request message")?;
		message.into_image_request()
	}

	/// Checks the structural invariants of the request.
	pub fn validate(&self) -> Result<()> {
		if self.job_id.is_empty() {
			bail!("image request has an empty job id");
		}
		if self.image_url.is_empty() {
			bail!("image request has an empty image url");
		}
		if self.outputs.is_empty() {
			bail!("image request '{}' has no output sinks", self.job_id);
		}
		if self.endpoint.name.is_empty() {
			bail!("image request '{}' has no endpoint name", self.job_id);
		}
		if !self.tile_geometry.is_valid() {
			bail!(
				"image request '{}' has invalid tile geometry: size ({}, {}), overlap ({}, {})",
				self.job_id,
				self.tile_geometry.tile_width,
				self.tile_geometry.tile_height,
				self.tile_geometry.overlap_x,
				self.tile_geometry.overlap_y
			);
		}
		Ok(())
	}
}

/// External message shape; kept private so the published field names stay in
/// one place.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExternalImageRequest {
	job_id: String,
	#[serde(default)]
	job_name: String,
	#[serde(default)]
	image_urls: Vec<String>,
	#[serde(default)]
	outputs: Vec<OutputSinkSpec>,
	image_processor: ExternalImageProcessor,
	#[serde(default)]
	image_processor_parameters: BTreeMap<String, String>,
	#[serde(default = "default_tile_size")]
	image_processor_tile_size: u32,
	#[serde(default)]
	image_processor_tile_overlap: u32,
	#[serde(default)]
	image_processor_tile_format: Option<String>,
	#[serde(default)]
	image_processor_tile_compression: Option<String>,
	#[serde(default)]
	post_processing: Vec<PostProcessingStep>,
	#[serde(default)]
	region_of_interest: Option<String>,
	#[serde(default)]
	image_read_role: Option<String>,
	#[serde(default)]
	image_processor_role: Option<String>,
	#[serde(default)]
	feature_properties: Vec<Value>,
}

fn default_tile_size() -> u32 {
	512
}

#[derive(Debug, Deserialize)]
struct ExternalImageProcessor {
	name: String,
	#[serde(rename = "type")]
	processor_type: String,
}

impl ExternalImageRequest {
	fn into_image_request(self) -> Result<ImageRequest> {
		let invoke_mode = InvokeMode::parse_str(&self.image_processor.processor_type)?;
		let tile_format = match &self.image_processor_tile_format {
			Some(value) => TileFormat::parse_str(value)?,
			None => TileFormat::default(),
		};
		let tile_compression = match &self.image_processor_tile_compression {
			Some(value) => TileCompression::parse_str(value)?,
			None => TileCompression::default(),
		};
		let image_url = self
			.image_urls
			.into_iter()
			.next()
			.ok_or_else(|| anyhow!("image request '{}' has no image urls", self.job_id))?;

		let request = ImageRequest {
			job_id: self.job_id,
			job_name: self.job_name,
			image_url,
			outputs: self.outputs,
			endpoint: EndpointSpec {
				name: self.image_processor.name,
				invoke_mode,
				parameters: self.image_processor_parameters,
			},
			tile_geometry: TileGeometry::square(self.image_processor_tile_size, self.image_processor_tile_overlap),
			tile_format,
			tile_compression,
			region_of_interest: self.region_of_interest,
			image_read_role: self.image_read_role,
			model_invoke_role: self.image_processor_role,
			post_processing: self.post_processing,
			feature_properties: self.feature_properties,
		};
		request.validate()?;
		Ok(request)
	}
}
