//! Data model: requests, jobs, pixel windows, tile geometry and statuses.

mod image_request;
pub use image_request::*;

mod invoke_mode;
pub use invoke_mode::*;

mod pixel_window;
pub use pixel_window::*;

mod region_request;
pub use region_request::*;

mod requested_job;
pub use requested_job::*;

mod status;
pub use status::*;

mod tile_compression;
pub use tile_compression::*;

mod tile_format;
pub use tile_format::*;

mod tile_request;
pub use tile_request::*;
