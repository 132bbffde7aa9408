//! Compression applied inside encoded tiles.
//!
//! Maps to format-specific creation options in the tile factory; a
//! compression that the chosen format cannot carry is rejected at request
//! validation time.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TileCompression {
	#[default]
	None,
	Jpeg,
	J2k,
	Lzw,
}

impl TileCompression {
	pub fn parse_str(value: &str) -> Result<Self> {
		Ok(match value.to_uppercase().as_str() {
			"NONE" => TileCompression::None,
			"JPEG" => TileCompression::Jpeg,
			"J2K" | "JPEG2000" => TileCompression::J2k,
			"LZW" => TileCompression::Lzw,
			_ => bail!("unknown tile compression '{value}'"),
		})
	}

	pub fn as_str(&self) -> &str {
		match self {
			TileCompression::None => "NONE",
			TileCompression::Jpeg => "JPEG",
			TileCompression::J2k => "J2K",
			TileCompression::Lzw => "LZW",
		}
	}
}

impl fmt::Display for TileCompression {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
