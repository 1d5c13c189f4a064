//! Judge registry: judges are grouped by scheme family, each family
//! becomes ready once at least one of its judges answers a direct
//! baseline fetch, and checkers block on readiness rather than polling,
//! using `tokio::sync::watch` as the readiness gate.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

use crate::discovery::IP_RE;
use crate::error::ConfigError;
use crate::types::judge::Baseline;
use crate::types::{Judge, JudgeScheme};

/// Case-insensitive markers to look for in an echoed request: a `Via`
/// header or a `Proxy-` prefixed header in the body means the proxy
/// identified itself to the judge.
const VIA_MARKERS: [&str; 2] = ["via:", "x-via"];
const PROXY_MARKERS: [&str; 3] = ["x-forwarded-for", "proxy-connection", "forwarded:"];

fn count_markers(body: &str, markers: &[&str]) -> usize {
	let lower = body.to_ascii_lowercase();
	markers.iter().filter(|m| lower.contains(*m)).count()
}

/// One scheme family's judges plus a latch that flips once any of them is
/// confirmed reachable.
struct Family {
	judges: Vec<Arc<Judge>>,
	ready_tx: watch::Sender<bool>,
	ready_rx: watch::Receiver<bool>,
}

impl Family {
	fn new() -> Self {
		let (ready_tx, ready_rx) = watch::channel(false);
		Family {
			judges: Vec::new(),
			ready_tx,
			ready_rx,
		}
	}
}

pub struct JudgeRegistry {
	families: HashMap<&'static str, Family>,
}

impl JudgeRegistry {
	/// Build a registry from judge URLs, baselining HTTP/HTTPS judges with
	/// a direct (no-proxy) fetch. A judge that fails its baseline fetch is
	/// kept out of its family entirely rather than marked ready with a
	/// zeroed baseline, since a zeroed baseline can't distinguish
	/// Transparent from Anonymous.
	pub async fn build(client: &reqwest::Client, urls: Vec<Url>) -> Self {
		let mut families = HashMap::new();
		families.insert(JudgeScheme::Http.as_str(), Family::new());
		families.insert(JudgeScheme::Https.as_str(), Family::new());
		families.insert(JudgeScheme::Smtp.as_str(), Family::new());

		for url in urls {
			let scheme = match url.scheme() {
				"http" => JudgeScheme::Http,
				"https" => JudgeScheme::Https,
				"smtp" => JudgeScheme::Smtp,
				other => {
					warn!(scheme = other, "ignoring judge with unsupported scheme");
					continue;
				}
			};
			let Some(host) = url.host_str() else { continue };
			let ip = match tokio::net::lookup_host((host, url.port_or_known_default().unwrap_or(80)))
				.await
				.ok()
				.and_then(|mut it| it.next())
			{
				Some(addr) => addr.ip(),
				None => {
					warn!(%url, "judge host did not resolve, skipping");
					continue;
				}
			};

			let mut judge = Judge::new(url.clone(), ip, scheme);
			if matches!(scheme, JudgeScheme::Http | JudgeScheme::Https) {
				match client.get(url.clone()).send().await.and_then(|r| r.error_for_status()) {
					Ok(resp) => match resp.text().await {
						Ok(body) => {
							judge.baseline = Baseline {
								via_marks: count_markers(&body, &VIA_MARKERS),
								proxy_marks: count_markers(&body, &PROXY_MARKERS),
								own_ip: IP_RE.find(&body).map(|m| m.as_str().to_string()),
							};
						}
						Err(err) => {
							warn!(%url, error = %err, "judge baseline fetch failed to read body, skipping");
							continue;
						}
					},
					Err(err) => {
						warn!(%url, error = %err, "judge baseline fetch failed, skipping");
						continue;
					}
				}
			}

			let family = families.get_mut(scheme.as_str()).expect("all families pre-inserted");
			family.judges.push(Arc::new(judge));
			let _ = family.ready_tx.send(true);
			debug!(%url, scheme = scheme.as_str(), "judge ready");
		}

		JudgeRegistry { families }
	}

	/// Block until at least one judge is ready for `scheme`, then return a
	/// randomly chosen ready judge. Errors if the registry has no judges
	/// configured for that family at all (a config-time mistake, not a
	/// transient one).
	pub async fn wait_for(&self, scheme: JudgeScheme) -> Result<Arc<Judge>, ConfigError> {
		let family = self
			.families
			.get(scheme.as_str())
			.ok_or(ConfigError::NoReadyJudge(scheme.as_str()))?;
		if family.judges.is_empty() {
			return Err(ConfigError::NoReadyJudge(scheme.as_str()));
		}
		let mut rx = family.ready_rx.clone();
		if !*rx.borrow() {
			let _ = rx.changed().await;
		}
		family
			.judges
			.choose(&mut rand::rng())
			.cloned()
			.ok_or(ConfigError::NoReadyJudge(scheme.as_str()))
	}

	pub fn is_ready(&self, scheme: JudgeScheme) -> bool {
		self.families
			.get(scheme.as_str())
			.map(|f| *f.ready_rx.borrow())
			.unwrap_or(false)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn marker_counting_is_case_insensitive() {
		let body = "X-Forwarded-For: 1.2.3.4\r\nVIA: 1.1 proxy\r\n";
		assert_eq!(count_markers(body, &VIA_MARKERS), 1);
		assert_eq!(count_markers(body, &PROXY_MARKERS), 1);
	}

	#[tokio::test]
	async fn empty_registry_is_never_ready() {
		let client = reqwest::Client::new();
		let reg = JudgeRegistry::build(&client, vec![]).await;
		assert!(!reg.is_ready(JudgeScheme::Http));
	}
}
