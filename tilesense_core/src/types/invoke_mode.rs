//! Endpoint invocation modes.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a model endpoint is invoked.
///
/// `SmSync` and `SmAsync` address managed endpoints by name; `Http` addresses
/// any endpoint reachable by URL. The upstream message uses the strings
/// `SM_ENDPOINT`, `SM_ENDPOINT_ASYNC` and `HTTP_ENDPOINT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvokeMode {
	SmSync,
	SmAsync,
	Http,
}

impl InvokeMode {
	pub fn parse_str(value: &str) -> Result<Self> {
		Ok(match value.to_uppercase().as_str() {
			"SM_ENDPOINT" => InvokeMode::SmSync,
			"SM_ENDPOINT_ASYNC" => InvokeMode::SmAsync,
			"HTTP_ENDPOINT" => InvokeMode::Http,
			_ => bail!("unknown endpoint invoke mode '{value}'"),
		})
	}

	pub fn as_str(&self) -> &str {
		match self {
			InvokeMode::SmSync => "SM_ENDPOINT",
			InvokeMode::SmAsync => "SM_ENDPOINT_ASYNC",
			InvokeMode::Http => "HTTP_ENDPOINT",
		}
	}
}

impl fmt::Display for InvokeMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_round_trip() {
		for mode in [InvokeMode::SmSync, InvokeMode::SmAsync, InvokeMode::Http] {
			assert_eq!(InvokeMode::parse_str(mode.as_str()).unwrap(), mode);
		}
	}

	#[test]
	fn parse_is_case_insensitive() {
		assert_eq!(InvokeMode::parse_str("sm_endpoint").unwrap(), InvokeMode::SmSync);
	}

	#[test]
	fn parse_unknown_mode_fails() {
		assert!(InvokeMode::parse_str("LAMBDA").is_err());
	}
}
