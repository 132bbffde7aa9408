//! The two-level work scheduler.
//!
//! [`BufferedImageRequestQueue`] maintains a bounded lookahead window of
//! candidate images pulled from the upstream queue;
//! [`EndpointLoadImageScheduler`] selects the next image to admit based on
//! per-endpoint load factors and live capacity from the
//! [`EndpointCapacityEstimator`]. [`EndpointVariantSelector`] pins requests
//! to a weighted endpoint variant before they enter the outstanding set.

mod buffered_queue;
pub use buffered_queue::*;

mod capacity;
pub use capacity::*;

mod endpoint_metadata;
pub use endpoint_metadata::*;

mod load_scheduler;
pub use load_scheduler::*;

mod variant;
pub use variant::*;
