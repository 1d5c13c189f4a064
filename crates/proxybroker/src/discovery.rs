//! Candidate discovery: a regex sweep over a fetched page, generalized
//! into a `Provider` trait so new sources can be added without touching
//! the runner. The runner itself follows the same bounded-fan-out-with-
//! `Semaphore` shape used for outbound client requests elsewhere in this
//! workspace.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::types::Protocol;

pub(crate) static IP_RE: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)").unwrap()
});

static PORT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:port|:)\D{0,5}(\d{2,5})").unwrap());

/// A source of proxy candidates. A provider is only responsible for
/// producing `host:port` pairs and, when it knows them in advance, which
/// protocols the source claims the proxy supports (an empty set means
/// "try the full sweep").
#[async_trait]
pub trait Provider: Send + Sync {
	fn name(&self) -> &str;

	async fn fetch(&self, client: &reqwest::Client) -> anyhow::Result<Vec<RawCandidate>>;
}

/// One unresolved candidate produced by a provider, before DNS resolution
/// and deduplication.
#[derive(Debug, Clone)]
pub struct RawCandidate {
	pub host: String,
	pub port: u16,
	pub expected_types: HashSet<Protocol>,
}

/// A provider over a fixed, in-memory list of candidates. Used by the CLI
/// for offline testing and by callers who already have a proxy list.
pub struct StaticListProvider {
	name: String,
	candidates: Vec<RawCandidate>,
}

impl StaticListProvider {
	pub fn new(name: impl Into<String>, candidates: Vec<RawCandidate>) -> Self {
		StaticListProvider {
			name: name.into(),
			candidates,
		}
	}
}

#[async_trait]
impl Provider for StaticListProvider {
	fn name(&self) -> &str {
		&self.name
	}

	async fn fetch(&self, _client: &reqwest::Client) -> anyhow::Result<Vec<RawCandidate>> {
		Ok(self.candidates.clone())
	}
}

/// A provider that fetches a single web page and extracts `ip:port`-ish
/// pairs from its body via regex, the same loose scrape approach a
/// public proxy listing page needs since these sources rarely offer a
/// structured API.
pub struct WebPageProvider {
	name: String,
	url: String,
}

impl WebPageProvider {
	pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
		WebPageProvider {
			name: name.into(),
			url: url.into(),
		}
	}

	fn parse(page: &str) -> Vec<RawCandidate> {
		let mut out = Vec::new();
		for line in page.lines() {
			let Some(ip_m) = IP_RE.find(line) else {
				continue;
			};
			let Some(port_m) = PORT_RE.captures(line) else {
				continue;
			};
			let Ok(port) = port_m[1].parse::<u16>() else {
				continue;
			};
			out.push(RawCandidate {
				host: ip_m.as_str().to_string(),
				port,
				expected_types: HashSet::new(),
			});
		}
		out
	}
}

#[async_trait]
impl Provider for WebPageProvider {
	fn name(&self) -> &str {
		&self.name
	}

	async fn fetch(&self, client: &reqwest::Client) -> anyhow::Result<Vec<RawCandidate>> {
		let body = client.get(&self.url).send().await?.text().await?;
		Ok(Self::parse(&body))
	}
}

/// The one concrete web source named in passing by the CLI help text: a
/// plain-text `ip:port`-per-line listing. Just a `WebPageProvider` pointed
/// at a fixed URL; kept as its own type so callers don't need to know the
/// URL to get a usable default provider.
pub struct FreeProxyListProvider {
	inner: WebPageProvider,
}

impl FreeProxyListProvider {
	const URL: &'static str = "https://www.proxy-list.download/api/v1/get?type=http";

	pub fn new() -> Self {
		FreeProxyListProvider {
			inner: WebPageProvider::new("free-proxy-list", Self::URL),
		}
	}
}

impl Default for FreeProxyListProvider {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Provider for FreeProxyListProvider {
	fn name(&self) -> &str {
		self.inner.name()
	}

	async fn fetch(&self, client: &reqwest::Client) -> anyhow::Result<Vec<RawCandidate>> {
		self.inner.fetch(client).await
	}
}

/// Run every provider concurrently, bounded by `provider_concurrency`,
/// streaming discovered candidates to `out` as each provider completes
/// rather than waiting for all of them.
pub async fn run_providers(
	providers: Vec<Arc<dyn Provider>>,
	concurrency: usize,
	client: reqwest::Client,
	out: mpsc::Sender<RawCandidate>,
) {
	let sem = Arc::new(Semaphore::new(concurrency.max(1)));
	let mut tasks = Vec::with_capacity(providers.len());
	for provider in providers {
		let sem = sem.clone();
		let client = client.clone();
		let out = out.clone();
		tasks.push(tokio::spawn(async move {
			let _permit = sem.acquire().await.expect("semaphore never closes");
			match provider.fetch(&client).await {
				Ok(candidates) => {
					debug!(provider = provider.name(), count = candidates.len(), "provider fetch complete");
					for c in candidates {
						if out.send(c).await.is_err() {
							break;
						}
					}
				}
				Err(err) => warn!(provider = provider.name(), error = %err, "provider fetch failed"),
			}
		}));
	}
	for t in tasks {
		let _ = t.await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_ip_and_port_from_page_body() {
		let page = "123.45.67.89:8080\nsome host port 3128 noise\n";
		let out = WebPageProvider::parse(page);
		assert_eq!(out.len(), 2);
		assert_eq!(out[0].host, "123.45.67.89");
		assert_eq!(out[0].port, 8080);
		assert_eq!(out[1].port, 3128);
	}

	#[tokio::test]
	async fn static_provider_returns_fixed_candidates() {
		let provider = StaticListProvider::new(
			"static",
			vec![RawCandidate {
				host: "1.2.3.4".into(),
				port: 80,
				expected_types: HashSet::new(),
			}],
		);
		let client = reqwest::Client::new();
		let out = provider.fetch(&client).await.unwrap();
		assert_eq!(out.len(), 1);
	}

	#[test]
	fn ip_regex_rejects_out_of_range_octets() {
		assert!(IP_RE.find("version 999.999.999.999").is_none());
		assert!(IP_RE.find("192.168.1.1").is_some());
	}
}
