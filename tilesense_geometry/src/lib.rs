//! Feature model: GeoJSON features, pixel boxes, sensor models, WKT parsing
//! and non-maximum suppression.

mod collection;
pub use collection::*;

mod feature;
pub use feature::*;

mod nms;
pub use nms::*;

mod pixel_box;
pub use pixel_box::*;

mod sensor_model;
pub use sensor_model::*;

mod wkt;
pub use wkt::*;
