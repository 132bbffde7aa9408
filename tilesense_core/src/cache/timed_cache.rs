//! A bounded cache with per-entry expiry.
//!
//! The schedulers look up endpoint metadata on every tick; this cache keeps
//! those lookups off the hot path. Entries expire after a TTL and the whole
//! cache is bounded LRU-style, so a fleet with many endpoints cannot grow it
//! without limit. Expired entries are retained until evicted so callers can
//! fall back to a stale value when a live lookup fails.

use lru::LruCache;
use std::{
	fmt::Debug,
	hash::Hash,
	num::NonZeroUsize,
	time::{Duration, Instant},
};

struct Entry<V> {
	value: V,
	expires_at: Instant,
}

/// TTL + LRU bounded cache.
pub struct TimedCache<K, V> {
	cache: LruCache<K, Entry<V>>,
	ttl: Duration,
}

impl<K, V> TimedCache<K, V>
where
	K: Clone + Debug + Eq + Hash,
	V: Clone,
{
	/// Creates a cache holding at most `max_entries` values, each valid for
	/// `ttl` after insertion.
	///
	/// # Panics
	///
	/// Panics if `max_entries` is zero.
	pub fn new(ttl: Duration, max_entries: usize) -> Self {
		Self {
			cache: LruCache::new(NonZeroUsize::new(max_entries).expect("cache capacity must be non-zero")),
			ttl,
		}
	}

	/// Returns the value for `key` if present and not expired, updating its
	/// recency.
	pub fn get(&mut self, key: &K) -> Option<V> {
		let entry = self.cache.get(key)?;
		if entry.expires_at <= Instant::now() {
			return None;
		}
		Some(entry.value.clone())
	}

	/// Returns the value for `key` even if its TTL has passed.
	///
	/// Used as a fallback when a refresh against the backing API fails and a
	/// stale answer is better than none.
	pub fn get_stale(&mut self, key: &K) -> Option<V> {
		self.cache.get(key).map(|entry| entry.value.clone())
	}

	/// Inserts `key -> value` with a fresh TTL, evicting the least recently
	/// used entry if the cache is full.
	pub fn add(&mut self, key: K, value: V) {
		self.cache.put(
			key,
			Entry {
				value,
				expires_at: Instant::now() + self.ttl,
			},
		);
	}

	pub fn contains(&self, key: &K) -> bool {
		self.cache.contains(key)
	}

	pub fn len(&self) -> usize {
		self.cache.len()
	}

	pub fn is_empty(&self) -> bool {
		self.cache.is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.cache.cap().get()
	}
}

impl<K, V> Debug for TimedCache<K, V>
where
	K: Clone + Debug + Eq + Hash,
	V: Clone,
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TimedCache")
			.field("length", &self.cache.len())
			.field("capacity", &self.cache.cap().get())
			.field("ttl", &self.ttl)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::thread::sleep;

	#[test]
	fn get_returns_fresh_values() {
		let mut cache = TimedCache::new(Duration::from_secs(60), 10);
		cache.add("a", 1);
		assert_eq!(cache.get(&"a"), Some(1));
		assert_eq!(cache.get(&"b"), None);
	}

	#[test]
	fn expired_values_are_hidden_but_stale_readable() {
		let mut cache = TimedCache::new(Duration::from_millis(10), 10);
		cache.add("a", 1);
		sleep(Duration::from_millis(20));
		assert_eq!(cache.get(&"a"), None);
		assert_eq!(cache.get_stale(&"a"), Some(1));
	}

	#[test]
	fn re_adding_refreshes_ttl() {
		let mut cache = TimedCache::new(Duration::from_millis(30), 10);
		cache.add("a", 1);
		sleep(Duration::from_millis(20));
		cache.add("a", 2);
		sleep(Duration::from_millis(20));
		assert_eq!(cache.get(&"a"), Some(2));
	}

	#[test]
	fn capacity_is_bounded_lru() {
		let mut cache = TimedCache::new(Duration::from_secs(60), 2);
		cache.add("a", 1);
		cache.add("b", 2);
		// Touch "a" so "b" becomes the eviction candidate.
		assert_eq!(cache.get(&"a"), Some(1));
		cache.add("c", 3);
		assert_eq!(cache.len(), 2);
		assert!(cache.contains(&"a"));
		assert!(!cache.contains(&"b"));
		assert!(cache.contains(&"c"));
	}

	#[test]
	fn capacity_zero_panics() {
		let result = std::panic::catch_unwind(|| TimedCache::<u32, u32>::new(Duration::from_secs(1), 0));
		assert!(result.is_err());
	}
}
