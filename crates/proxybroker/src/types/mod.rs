//! Shared value types for the broker pipeline.

pub mod conn;
pub mod geo;
pub mod judge;
pub mod protocol;
pub mod proxy;

pub use conn::ProxyConn;
pub use geo::{GeoIp, GeoRecord, NoGeoIp};
pub use judge::{Baseline, Judge, JudgeScheme};
pub use protocol::{Anonymity, Protocol, Scheme, HTTPS_CAPABLE, HTTP_CAPABLE, SWEEP_ORDER};
pub use proxy::{Priority, Proxy, Stats};

use std::collections::HashSet;
use std::net::SocketAddr;

use std::sync::Arc;

/// A resolved candidate awaiting verification, handed from the resolver
/// stage to the checker pool.
#[derive(Debug, Clone)]
pub struct CheckJob {
	pub addr: SocketAddr,
	/// Protocols the caller asked for; empty means "try the full sweep".
	pub expected_types: HashSet<Protocol>,
	pub proxy: Arc<Proxy>,
}

impl CheckJob {
	/// The sweep this job should run: the caller's requested subset in
	/// canonical order, or the full sweep if unconstrained.
	pub fn sweep(&self) -> Vec<Protocol> {
		if self.expected_types.is_empty() {
			SWEEP_ORDER.to_vec()
		} else {
			SWEEP_ORDER
				.iter()
				.copied()
				.filter(|p| self.expected_types.contains(p))
				.collect()
		}
	}
}
