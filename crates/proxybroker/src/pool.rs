//! The ranked pool: a FIFO "newcomers" queue for proxies still under
//! their minimum request count, and a min-heap of "established" proxies
//! ordered by `(error_rate, avg_resp_time)`. Importing new proxies off
//! the incoming channel is bounded by a retry count rather than an
//! unbounded await, so [`RankedPool::get`] can never block forever on an
//! empty pool.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::error::NoProxyError;
use crate::types::proxy::Priority;
use crate::types::{Proxy, Scheme};

#[derive(Debug)]
struct HeapEntry {
	priority: Priority,
	proxy: Arc<Proxy>,
}

impl PartialEq for HeapEntry {
	fn eq(&self, other: &Self) -> bool {
		self.priority == other.priority
	}
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for HeapEntry {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.priority.cmp(&other.priority)
	}
}

/// The shared candidate pool a forwarding server (or `find`/`grab`) draws
/// verified proxies from.
pub struct RankedPool {
	config: Arc<BrokerConfig>,
	newcomers: Mutex<VecDeque<Arc<Proxy>>>,
	heap: Mutex<BinaryHeap<Reverse<HeapEntry>>>,
	incoming: AsyncMutex<mpsc::Receiver<Arc<Proxy>>>,
}

impl RankedPool {
	pub fn new(config: Arc<BrokerConfig>, incoming: mpsc::Receiver<Arc<Proxy>>) -> Self {
		RankedPool {
			config,
			newcomers: Mutex::new(VecDeque::new()),
			heap: Mutex::new(BinaryHeap::new()),
			incoming: AsyncMutex::new(incoming),
		}
	}

	pub fn len(&self) -> usize {
		self.newcomers.lock().len() + self.heap.lock().len()
	}

	/// `ProxyPool.put`: admit a just-checked proxy. A proxy still under
	/// `min_req_proxy` always gets newcomer grace, even after a bad first
	/// attempt; only once it has earned enough requests to leave the
	/// newcomer tier does the error-rate/latency budget apply.
	pub fn put(&self, proxy: Arc<Proxy>) {
		if proxy.requests() < self.config.min_req_proxy as u64 {
			self.newcomers.lock().push_back(proxy);
			return;
		}
		if proxy.error_rate() > self.config.max_error_rate {
			debug!(addr = %proxy.address(), rate = proxy.error_rate(), "discarding proxy over max_error_rate");
			return;
		}
		if proxy.avg_resp_time() > self.config.max_resp_time.as_secs_f64() && proxy.avg_resp_time() > 0.0 {
			debug!(addr = %proxy.address(), "discarding proxy over max_resp_time");
			return;
		}
		let priority = proxy.priority();
		self.heap.lock().push(Reverse(HeapEntry { priority, proxy }));
	}

	/// `ProxyPool.remove`: evict a proxy by address from wherever it
	/// currently lives, used by the control API.
	pub fn remove(&self, host: std::net::IpAddr, port: u16) -> bool {
		{
			let mut newcomers = self.newcomers.lock();
			let before = newcomers.len();
			newcomers.retain(|p| !(p.host == host && p.port == port));
			if newcomers.len() != before {
				return true;
			}
		}
		let mut heap = self.heap.lock();
		let before = heap.len();
		let rebuilt: BinaryHeap<Reverse<HeapEntry>> = heap
			.drain()
			.filter(|Reverse(e)| !(e.proxy.host == host && e.proxy.port == port))
			.collect();
		let removed = rebuilt.len() != before;
		*heap = rebuilt;
		removed
	}

	/// `ProxyPool.get`: return a proxy able to serve `scheme`, importing
	/// fresh checked proxies from the incoming channel as needed, bounded
	/// by `max_import_retries`.
	pub async fn get(&self, scheme: Scheme) -> Result<Arc<Proxy>, NoProxyError> {
		for _attempt in 0..self.config.max_import_retries {
			if self.len() < self.config.min_queue {
				if self.import_one().await.is_err() {
					continue;
				}
			}

			if let Some(p) = self.pop_matching_newcomer(scheme) {
				return Ok(p);
			}

			if self.config.strategy == crate::config::PoolStrategy::Best {
				if let Some(p) = self.pop_matching(scheme) {
					return Ok(p);
				}
			}

			if self.import_one().await.is_err() {
				continue;
			}
		}
		Err(NoProxyError {
			scheme: scheme.as_str(),
			reason: "max_import_retries exhausted",
		})
	}

	/// Pop newcomers in FIFO order until one matches `scheme`, restoring
	/// the skipped ones to the front in their original order so a
	/// scheme-incompatible newcomer doesn't lose its place in line.
	fn pop_matching_newcomer(&self, scheme: Scheme) -> Option<Arc<Proxy>> {
		let mut newcomers = self.newcomers.lock();
		let mut skipped = Vec::new();
		let mut found = None;
		while let Some(p) = newcomers.pop_front() {
			if p.schemes().contains(&scheme.as_str()) {
				found = Some(p);
				break;
			}
			skipped.push(p);
		}
		for p in skipped.into_iter().rev() {
			newcomers.push_front(p);
		}
		found
	}

	fn pop_matching(&self, scheme: Scheme) -> Option<Arc<Proxy>> {
		let mut heap = self.heap.lock();
		let mut skipped = Vec::new();
		let mut found = None;
		while let Some(Reverse(entry)) = heap.pop() {
			if entry.proxy.schemes().contains(&scheme.as_str()) {
				found = Some(entry.proxy);
				break;
			}
			skipped.push(Reverse(entry));
		}
		for s in skipped {
			heap.push(s);
		}
		found
	}

	async fn import_one(&self) -> Result<(), ()> {
		let mut incoming = self.incoming.lock().await;
		match timeout(self.config.import_timeout, incoming.recv()).await {
			Ok(Some(proxy)) => {
				drop(incoming);
				self.put(proxy);
				Ok(())
			}
			Ok(None) => {
				warn!("checker pipeline closed, no more proxies to import");
				Err(())
			}
			Err(_) => Err(()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::GeoRecord;

	fn proxy(host: &str, requests: u64) -> Arc<Proxy> {
		let p = Proxy::new(host.parse().unwrap(), 8080, GeoRecord::default());
		for _ in 0..requests {
			p.log_result("ok", 0.1, None);
		}
		Arc::new(p)
	}

	fn pool() -> (RankedPool, mpsc::Sender<Arc<Proxy>>) {
		let (tx, rx) = mpsc::channel(16);
		let mut config = BrokerConfig::default();
		config.min_queue = 0;
		config.max_import_retries = 2;
		config.import_timeout = std::time::Duration::from_millis(50);
		(RankedPool::new(Arc::new(config), rx), tx)
	}

	#[test]
	fn put_routes_by_request_count() {
		let (pool, _tx) = pool();
		pool.put(proxy("10.0.0.1", 0));
		assert_eq!(pool.newcomers.lock().len(), 1);
		pool.put(proxy("10.0.0.2", 10));
		assert_eq!(pool.heap.lock().len(), 1);
	}

	#[test]
	fn put_discards_over_error_budget() {
		let (pool, _tx) = pool();
		let p = Proxy::new("10.0.0.3".parse().unwrap(), 80, GeoRecord::default());
		for _ in 0..10 {
			p.log_result("fail", 0.1, Some(&crate::error::ProxyError::Conn));
		}
		pool.put(Arc::new(p));
		assert_eq!(pool.len(), 0);
	}

	#[test]
	fn put_gives_newcomer_grace_despite_bad_first_attempt() {
		let (pool, _tx) = pool();
		let p = Proxy::new("10.0.0.9".parse().unwrap(), 80, GeoRecord::default());
		p.log_result("fail", 0.1, Some(&crate::error::ProxyError::Conn));
		pool.put(Arc::new(p));
		assert_eq!(pool.newcomers.lock().len(), 1);
		assert_eq!(pool.heap.lock().len(), 0);
	}

	#[test]
	fn remove_finds_proxy_in_either_tier() {
		let (pool, _tx) = pool();
		pool.put(proxy("10.0.0.4", 0));
		assert!(pool.remove("10.0.0.4".parse().unwrap(), 8080));
		assert_eq!(pool.len(), 0);
	}

	#[tokio::test]
	async fn get_drains_newcomers_fifo_before_heap() {
		let (pool, _tx) = pool();
		let a = proxy("10.0.0.5", 0);
		a.mark_checked(crate::types::Protocol::Http, Some(crate::types::Anonymity::High));
		pool.put(a.clone());
		let got = pool.get(Scheme::Http).await.unwrap();
		assert_eq!(got.host, a.host);
	}

	#[tokio::test]
	async fn get_skips_scheme_mismatched_newcomer_and_preserves_its_place() {
		let (pool, _tx) = pool();
		let http_only = proxy("10.0.0.6", 0);
		http_only.mark_checked(crate::types::Protocol::Http, Some(crate::types::Anonymity::High));
		let https_capable = proxy("10.0.0.7", 0);
		https_capable.mark_checked(crate::types::Protocol::Socks5, Some(crate::types::Anonymity::High));
		pool.put(http_only.clone());
		pool.put(https_capable.clone());

		let got = pool.get(Scheme::Https).await.unwrap();
		assert_eq!(got.host, https_capable.host);

		// The skipped HTTP-only newcomer stays at the front of the queue.
		let got_next = pool.get(Scheme::Http).await.unwrap();
		assert_eq!(got_next.host, http_only.host);
	}

	#[tokio::test]
	async fn get_fails_after_retries_with_nothing_importable() {
		let (pool, _tx) = pool();
		let err = pool.get(Scheme::Http).await.unwrap_err();
		assert_eq!(err.scheme, "HTTP");
	}
}
