//! Encoded tile formats accepted by remote detectors.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raster format used when encoding a tile for model invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TileFormat {
	#[default]
	Nitf,
	Gtiff,
	Png,
	Jpeg,
}

impl TileFormat {
	/// Parses the upstream message value, e.g. `"NITF"` or `"GTIFF"`.
	pub fn parse_str(value: &str) -> Result<Self> {
		Ok(match value.to_uppercase().as_str() {
			"NITF" => TileFormat::Nitf,
			"GTIFF" | "GEOTIFF" => TileFormat::Gtiff,
			"PNG" => TileFormat::Png,
			"JPEG" | "JPG" => TileFormat::Jpeg,
			_ => bail!("unknown tile format '{value}'"),
		})
	}

	pub fn as_str(&self) -> &str {
		match self {
			TileFormat::Nitf => "NITF",
			TileFormat::Gtiff => "GTIFF",
			TileFormat::Png => "PNG",
			TileFormat::Jpeg => "JPEG",
		}
	}

	/// File extension for temporary tile files.
	pub fn extension(&self) -> &str {
		match self {
			TileFormat::Nitf => "ntf",
			TileFormat::Gtiff => "tif",
			TileFormat::Png => "png",
			TileFormat::Jpeg => "jpg",
		}
	}
}

impl fmt::Display for TileFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
