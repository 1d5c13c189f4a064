//! The `Proxy` record: identity, discovered protocol/anonymity map,
//! running stats and event log. The live socket a check or forwarded
//! request holds is *not* stored here — Rust ownership makes a transient
//! [`crate::conn::ProxyConn`] passed through the call site a better fit
//! than a connection nested inside a value multiple tasks share.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::Mutex;
use serde_json::json;

use super::geo::GeoRecord;
use super::protocol::{Anonymity, Protocol, HTTPS_CAPABLE, HTTP_CAPABLE};
use crate::error::ProxyError;

/// Running counters for a proxy.
#[derive(Debug, Default, Clone)]
pub struct Stats {
	pub requests: u64,
	pub errors: HashMap<&'static str, u64>,
}

/// One entry in a proxy's rolling event log.
#[derive(Debug, Clone)]
pub struct LogEntry {
	pub message: String,
	pub runtime: Option<f64>,
	pub error: Option<&'static str>,
}

#[derive(Debug, Default)]
struct Mutable {
	/// Negotiated protocol -> anonymity level, `None` until classified.
	discovered: HashMap<Protocol, Option<Anonymity>>,
	stats: Stats,
	runtimes: Vec<f64>,
	log: Vec<LogEntry>,
	current_negotiator: Option<Protocol>,
}

/// A candidate or verified proxy.
///
/// Shared across the checker, pool and forwarding server as `Arc<Proxy>`;
/// interior mutability is confined to [`Mutable`] behind a single
/// `parking_lot::Mutex` so readers never observe a torn update.
pub struct Proxy {
	pub host: IpAddr,
	pub port: u16,
	pub geo: GeoRecord,
	inner: Mutex<Mutable>,
}

impl Proxy {
	pub fn new(host: IpAddr, port: u16, geo: GeoRecord) -> Self {
		Proxy {
			host,
			port,
			geo,
			inner: Mutex::new(Mutable::default()),
		}
	}

	pub fn address(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Record the outcome of one negotiation attempt (`Proxy.log` in the
	/// original). `None` error means success; timed-out attempts never
	/// contribute a latency sample.
	pub fn log_result(&self, message: impl Into<String>, elapsed: f64, error: Option<&ProxyError>) {
		let mut inner = self.inner.lock();
		inner.stats.requests += 1;
		if let Some(err) = error {
			*inner.stats.errors.entry(err.kind()).or_insert(0) += 1;
			if !err.is_timeout() {
				inner.runtimes.push(elapsed);
			}
		} else {
			inner.runtimes.push(elapsed);
		}
		inner.log.push(LogEntry {
			message: message.into(),
			runtime: if error.map(ProxyError::is_timeout).unwrap_or(false) {
				None
			} else {
				Some(elapsed)
			},
			error: error.map(ProxyError::kind),
		});
	}

	pub fn set_current_negotiator(&self, proto: Option<Protocol>) {
		self.inner.lock().current_negotiator = proto;
	}

	pub fn current_negotiator(&self) -> Option<Protocol> {
		self.inner.lock().current_negotiator
	}

	/// Record a protocol as checked, with its classified anonymity level
	/// (`None` if the protocol failed negotiation entirely and should not
	/// be offered).
	pub fn mark_checked(&self, proto: Protocol, anonymity: Option<Anonymity>) {
		self.inner.lock().discovered.insert(proto, anonymity);
	}

	pub fn discovered_protocols(&self) -> Vec<Protocol> {
		self.inner
			.lock()
			.discovered
			.iter()
			.filter(|(_, lvl)| lvl.is_some())
			.map(|(p, _)| *p)
			.collect()
	}

	pub fn anonymity_for(&self, proto: Protocol) -> Option<Anonymity> {
		self.inner.lock().discovered.get(&proto).copied().flatten()
	}

	pub fn requests(&self) -> u64 {
		self.inner.lock().stats.requests
	}

	/// `Proxy.error_rate`: fraction of requests that ended in an error.
	pub fn error_rate(&self) -> f64 {
		let inner = self.inner.lock();
		if inner.stats.requests == 0 {
			return 0.0;
		}
		let errs: u64 = inner.stats.errors.values().sum();
		errs as f64 / inner.stats.requests as f64
	}

	/// `Proxy.avg_resp_time`: mean of all non-timeout runtimes, `0.0` if
	/// there are none yet.
	pub fn avg_resp_time(&self) -> f64 {
		let inner = self.inner.lock();
		if inner.runtimes.is_empty() {
			return 0.0;
		}
		inner.runtimes.iter().sum::<f64>() / inner.runtimes.len() as f64
	}

	/// `Proxy.priority`: the ranked pool's heap ordering key. Lower is
	/// better: first fewer errors, then lower average latency.
	pub fn priority(&self) -> Priority {
		Priority(self.error_rate(), self.avg_resp_time())
	}

	/// `Proxy.schemes`: which request schemes this proxy can currently
	/// serve, derived from which protocols have been successfully
	/// negotiated.
	pub fn schemes(&self) -> Vec<&'static str> {
		let discovered = self.discovered_protocols();
		let mut out = Vec::new();
		if discovered.iter().any(|p| HTTP_CAPABLE.contains(p)) {
			out.push("HTTP");
		}
		if discovered.iter().any(|p| HTTPS_CAPABLE.contains(p)) {
			out.push("HTTPS");
		}
		out
	}

	pub fn as_json(&self) -> serde_json::Value {
		let inner = self.inner.lock();
		let types: serde_json::Map<String, serde_json::Value> = inner
			.discovered
			.iter()
			.map(|(p, lvl)| {
				(
					p.as_str().to_string(),
					lvl.map(|l| json!(l.as_str())).unwrap_or(serde_json::Value::Null),
				)
			})
			.collect();
		json!({
			"host": self.host.to_string(),
			"port": self.port,
			"geo": self.geo,
			"types": types,
			"avg_resp_time": self.avg_resp_time(),
			"error_rate": self.error_rate(),
		})
	}

	pub fn as_text(&self) -> String {
		let schemes = self.schemes().join(",");
		format!(
			"{}:{}\t{}\t{:.2}s\t{:.2}",
			self.host,
			self.port,
			if schemes.is_empty() { "-" } else { &schemes },
			self.avg_resp_time(),
			self.error_rate(),
		)
	}
}

/// `(error_rate, avg_resp_time)` as a heap key. Both components are always
/// finite (ratios and non-negative means), so a total order is sound
/// where `f64`'s partial order alone is not.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Priority(pub f64, pub f64);

impl Eq for Priority {}

impl PartialOrd for Priority {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Priority {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.0
			.partial_cmp(&other.0)
			.unwrap_or(std::cmp::Ordering::Equal)
			.then_with(|| self.1.partial_cmp(&other.1).unwrap_or(std::cmp::Ordering::Equal))
	}
}

impl std::fmt::Debug for Proxy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Proxy")
			.field("host", &self.host)
			.field("port", &self.port)
			.field("avg_resp_time", &self.avg_resp_time())
			.field("error_rate", &self.error_rate())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn proxy() -> Proxy {
		Proxy::new("127.0.0.1".parse().unwrap(), 8080, GeoRecord::default())
	}

	#[test]
	fn error_rate_zero_with_no_requests() {
		let p = proxy();
		assert_eq!(p.error_rate(), 0.0);
	}

	#[test]
	fn timeouts_are_excluded_from_avg_resp_time() {
		let p = proxy();
		p.log_result("ok", 0.5, None);
		p.log_result("timed out", 10.0, Some(&ProxyError::Timeout));
		assert_eq!(p.avg_resp_time(), 0.5);
		assert_eq!(p.error_rate(), 0.5);
	}

	#[test]
	fn schemes_reflect_discovered_protocols() {
		let p = proxy();
		assert!(p.schemes().is_empty());
		p.mark_checked(Protocol::Socks5, Some(Anonymity::High));
		assert_eq!(p.schemes(), vec!["HTTP", "HTTPS"]);
	}
}
