//! Metric sinks and dimensions.

use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// Unit of a metric value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricUnit {
	Count,
	Milliseconds,
	Seconds,
	Percent,
}

/// Dimension set attached to an emission, e.g.
/// `(Operation=Scheduling, ModelName=centerpoint)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dimensions {
	pub operation: Option<String>,
	pub model_name: Option<String>,
	pub error_code: Option<String>,
}

impl Dimensions {
	pub fn operation(operation: &str) -> Self {
		Self {
			operation: Some(operation.to_string()),
			..Default::default()
		}
	}

	pub fn with_model_name(mut self, model_name: &str) -> Self {
		self.model_name = Some(model_name.to_string());
		self
	}

	pub fn with_error_code(mut self, error_code: &str) -> Self {
		self.error_code = Some(error_code.to_string());
		self
	}
}

impl fmt::Display for Dimensions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut parts = Vec::new();
		if let Some(operation) = &self.operation {
			parts.push(format!("Operation={operation}"));
		}
		if let Some(model_name) = &self.model_name {
			parts.push(format!("ModelName={model_name}"));
		}
		if let Some(error_code) = &self.error_code {
			parts.push(format!("ErrorCode={error_code}"));
		}
		write!(f, "{}", parts.join(","))
	}
}

/// Destination for metric emissions.
///
/// Implementations must swallow their own failures; callers never handle an
/// emission error.
pub trait MetricsSink: Send + Sync {
	fn emit(&self, name: &str, value: f64, unit: MetricUnit, dimensions: &Dimensions);
}

/// Shared handle used throughout the workspace.
pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Sink that writes emissions to the log at debug level.
#[derive(Debug, Default)]
pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
	fn emit(&self, name: &str, value: f64, unit: MetricUnit, dimensions: &Dimensions) {
		log::debug!("metric {name}={value} {unit:?} [{dimensions}]");
	}
}

/// Sink that drops every emission.
#[derive(Debug, Default)]
pub struct NoMetricsSink;

impl MetricsSink for NoMetricsSink {
	fn emit(&self, _name: &str, _value: f64, _unit: MetricUnit, _dimensions: &Dimensions) {}
}

/// A single recorded emission, as captured by [`MemoryMetricsSink`].
#[derive(Clone, Debug, PartialEq)]
pub struct MetricRecord {
	pub name: String,
	pub value: f64,
	pub unit: MetricUnit,
	pub dimensions: Dimensions,
}

/// Sink that records emissions in memory; the test fixture of choice.
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
	records: Mutex<Vec<MetricRecord>>,
}

impl MemoryMetricsSink {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn records(&self) -> Vec<MetricRecord> {
		self.records.lock().clone()
	}

	pub fn records_named(&self, name: &str) -> Vec<MetricRecord> {
		self.records.lock().iter().filter(|r| r.name == name).cloned().collect()
	}

	pub fn total_named(&self, name: &str) -> f64 {
		self.records_named(name).iter().map(|r| r.value).sum()
	}

	pub fn clear(&self) {
		self.records.lock().clear();
	}
}

impl MetricsSink for MemoryMetricsSink {
	fn emit(&self, name: &str, value: f64, unit: MetricUnit, dimensions: &Dimensions) {
		self.records.lock().push(MetricRecord {
			name: name.to_string(),
			value,
			unit,
			dimensions: dimensions.clone(),
		});
	}
}
