//! Candidate resolution and deduplication, between discovery and the
//! checker: a host must resolve to a usable IP and the port must fit a
//! `u16` before a candidate becomes a check job. Uses `hickory-resolver`
//! for outbound name resolution, the same crate this workspace's client
//! code reaches for elsewhere.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::discovery::RawCandidate;
use crate::error::ResolveError;
use crate::types::{CheckJob, GeoIp, Proxy};

/// Resolves raw host strings to IPs and drops candidates already seen in
/// this run, or outside the configured country allow-list. `seen` is
/// shared across every call so concurrent resolver tasks agree on dedup
/// state.
pub struct Resolver {
	dns: TokioAsyncResolver,
	geoip: Arc<dyn GeoIp>,
	seen: Mutex<HashSet<SocketAddr>>,
	countries: HashSet<String>,
}

impl Resolver {
	pub fn new(dns: TokioAsyncResolver, geoip: Arc<dyn GeoIp>) -> Self {
		Self::with_countries(dns, geoip, HashSet::new())
	}

	/// Like [`Resolver::new`], but only admit candidates whose GeoIP
	/// country code is in `countries`. An empty set means no filtering, the
	/// same convention `CheckJob::expected_types` uses for protocols.
	pub fn with_countries(dns: TokioAsyncResolver, geoip: Arc<dyn GeoIp>, countries: HashSet<String>) -> Self {
		Resolver {
			dns,
			geoip,
			seen: Mutex::new(HashSet::new()),
			countries,
		}
	}

	/// Resolve one raw candidate into a [`CheckJob`], or `Ok(None)` if it's
	/// a duplicate of one already seen this run or its country isn't in the
	/// allow-list. DNS/parse failures are returned rather than swallowed
	/// here; callers decide whether to log and continue.
	pub async fn resolve(&self, candidate: RawCandidate) -> Result<Option<CheckJob>, ResolveError> {
		if candidate.port == 0 {
			return Err(ResolveError::InvalidPort(candidate.port as i64));
		}
		let ip = self.resolve_host(&candidate.host).await?;
		let addr = SocketAddr::new(ip, candidate.port);
		{
			let mut seen = self.seen.lock();
			if !seen.insert(addr) {
				return Ok(None);
			}
		}
		let geo = self.geoip.lookup(ip);
		if !self.countries.is_empty() {
			let passes = geo.country_code.as_deref().is_some_and(|c| self.countries.contains(c));
			if !passes {
				return Ok(None);
			}
		}
		let proxy = Arc::new(Proxy::new(ip, candidate.port, geo));
		Ok(Some(CheckJob {
			addr,
			expected_types: candidate.expected_types,
			proxy,
		}))
	}

	async fn resolve_host(&self, host: &str) -> Result<IpAddr, ResolveError> {
		if let Ok(ip) = host.parse::<IpAddr>() {
			return Ok(ip);
		}
		let lookup = self
			.dns
			.lookup_ip(host)
			.await
			.map_err(|_| ResolveError::Dns(host.to_string()))?;
		lookup.iter().next().ok_or_else(|| ResolveError::Dns(host.to_string()))
	}
}

/// Drain `candidates`, resolve each, and forward successfully resolved,
/// not-yet-seen jobs to `out`. Runs until the input channel closes.
pub async fn run_resolver(
	resolver: Arc<Resolver>,
	mut candidates: mpsc::Receiver<RawCandidate>,
	out: mpsc::Sender<CheckJob>,
) {
	while let Some(candidate) = candidates.recv().await {
		match resolver.resolve(candidate).await {
			Ok(Some(job)) => {
				if out.send(job).await.is_err() {
					break;
				}
			}
			Ok(None) => debug!("dropping duplicate candidate"),
			Err(err) => debug!(error = %err, "dropping unresolvable candidate"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::NoGeoIp;

	fn resolver() -> Resolver {
		Resolver::new(
			TokioAsyncResolver::tokio(Default::default(), Default::default()),
			Arc::new(NoGeoIp),
		)
	}

	#[tokio::test]
	async fn ip_literal_resolves_without_dns() {
		let r = resolver();
		let job = r
			.resolve(RawCandidate {
				host: "203.0.113.5".into(),
				port: 8080,
				expected_types: HashSet::new(),
			})
			.await
			.unwrap()
			.unwrap();
		assert_eq!(job.addr, "203.0.113.5:8080".parse().unwrap());
	}

	#[tokio::test]
	async fn duplicate_candidate_is_dropped() {
		let r = resolver();
		let make = || RawCandidate {
			host: "203.0.113.5".into(),
			port: 8080,
			expected_types: HashSet::new(),
		};
		assert!(r.resolve(make()).await.unwrap().is_some());
		assert!(r.resolve(make()).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn zero_port_is_rejected() {
		let r = resolver();
		let err = r
			.resolve(RawCandidate {
				host: "203.0.113.5".into(),
				port: 0,
				expected_types: HashSet::new(),
			})
			.await
			.unwrap_err();
		assert!(matches!(err, ResolveError::InvalidPort(0)));
	}

	struct FixedCountry(&'static str);

	impl crate::types::GeoIp for FixedCountry {
		fn lookup(&self, _ip: std::net::IpAddr) -> crate::types::GeoRecord {
			crate::types::GeoRecord {
				country_code: Some(self.0.into()),
				..Default::default()
			}
		}
	}

	#[tokio::test]
	async fn country_outside_allow_list_is_dropped() {
		let r = Resolver::with_countries(
			TokioAsyncResolver::tokio(Default::default(), Default::default()),
			Arc::new(FixedCountry("CN")),
			["US".to_string()].into_iter().collect(),
		);
		let job = r
			.resolve(RawCandidate {
				host: "203.0.113.5".into(),
				port: 8080,
				expected_types: HashSet::new(),
			})
			.await
			.unwrap();
		assert!(job.is_none());
	}

	#[tokio::test]
	async fn country_inside_allow_list_passes() {
		let r = Resolver::with_countries(
			TokioAsyncResolver::tokio(Default::default(), Default::default()),
			Arc::new(FixedCountry("US")),
			["US".to_string()].into_iter().collect(),
		);
		let job = r
			.resolve(RawCandidate {
				host: "203.0.113.6".into(),
				port: 8080,
				expected_types: HashSet::new(),
			})
			.await
			.unwrap();
		assert!(job.is_some());
	}
}
