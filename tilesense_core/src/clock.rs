//! Wall-clock helpers.

use time::OffsetDateTime;

/// Current time as Unix epoch seconds, the timestamp unit used by the
/// stores and the scheduler.
pub fn epoch_seconds() -> i64 {
	OffsetDateTime::now_utc().unix_timestamp()
}
