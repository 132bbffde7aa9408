//! The asynchronous inference path.
//!
//! For endpoints in `SM_ENDPOINT_ASYNC` mode the tile loop does not block
//! on inference: the submission processor uploads each tile and records a
//! tile-request row, and the results worker later correlates success or
//! failure notifications back to that row by inference id or result-object
//! URI, with a delayed poller as the safety net for lost notifications.

mod client;
pub use client::*;

mod events;
pub use events::*;

mod resource_manager;
pub use resource_manager::*;

mod results;
pub use results::*;

mod submission;
pub use submission::*;
