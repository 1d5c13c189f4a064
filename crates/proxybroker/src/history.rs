//! Bounded, TTL-expiring history cache: remembers which proxy last served
//! a given `(client_ip, url)` pair so the control API's `history`
//! operation can answer "what proxy did you use for this request"
//! queries. Hand-rolled rather than pulled in from a caching crate, since
//! this is the only cache the crate needs.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Clone)]
struct Entry {
	value: String,
	inserted_at: Instant,
}

pub struct HistoryCache {
	capacity: usize,
	ttl: Duration,
	entries: Mutex<HashMap<String, Entry>>,
	order: Mutex<std::collections::VecDeque<String>>,
}

impl HistoryCache {
	pub fn new(capacity: usize, ttl: Duration) -> Self {
		HistoryCache {
			capacity,
			ttl,
			entries: Mutex::new(HashMap::new()),
			order: Mutex::new(std::collections::VecDeque::new()),
		}
	}

	pub fn key(client_ip: &str, url: &str) -> String {
		format!("{client_ip}-{url}")
	}

	pub fn insert(&self, key: String, proxy_addr: String) {
		let mut entries = self.entries.lock();
		let mut order = self.order.lock();
		if !entries.contains_key(&key) {
			order.push_back(key.clone());
		}
		entries.insert(
			key,
			Entry {
				value: proxy_addr,
				inserted_at: Instant::now(),
			},
		);
		while entries.len() > self.capacity {
			if let Some(oldest) = order.pop_front() {
				entries.remove(&oldest);
			} else {
				break;
			}
		}
	}

	pub fn get(&self, key: &str) -> Option<String> {
		let mut entries = self.entries.lock();
		let entry = entries.get(key)?;
		if entry.inserted_at.elapsed() > self.ttl {
			entries.remove(key);
			return None;
		}
		Some(entry.value.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn expired_entries_are_not_returned() {
		let cache = HistoryCache::new(10, Duration::from_millis(1));
		cache.insert("k".into(), "1.2.3.4:80".into());
		std::thread::sleep(Duration::from_millis(5));
		assert_eq!(cache.get("k"), None);
	}

	#[test]
	fn capacity_evicts_oldest_first() {
		let cache = HistoryCache::new(2, Duration::from_secs(60));
		cache.insert("a".into(), "1".into());
		cache.insert("b".into(), "2".into());
		cache.insert("c".into(), "3".into());
		assert_eq!(cache.get("a"), None);
		assert_eq!(cache.get("b"), Some("2".into()));
		assert_eq!(cache.get("c"), Some("3".into()));
	}
}
