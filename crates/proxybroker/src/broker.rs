//! The orchestrator: wires discovery → resolve → check → pool into the
//! three public operations (`grab`, `find`, `serve`).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use hickory_resolver::TokioAsyncResolver;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::check::Checker;
use crate::config::BrokerConfig;
use crate::discovery::{self, Provider};
use crate::error::BrokerError;
use crate::judge::JudgeRegistry;
use crate::pool::RankedPool;
use crate::resolve::{self, Resolver};
use crate::server::ForwardingServer;
use crate::types::{GeoIp, Protocol, Proxy};

/// Owns the shared configuration and dependencies every broker operation
/// wires together.
pub struct Broker {
	config: Arc<BrokerConfig>,
	providers: Vec<Arc<dyn Provider>>,
	judge_urls: Vec<Url>,
	geoip: Arc<dyn GeoIp>,
	http_client: reqwest::Client,
	dns: TokioAsyncResolver,
	shutdown: CancellationToken,
}

impl Broker {
	pub fn new(config: BrokerConfig, providers: Vec<Arc<dyn Provider>>, judge_urls: Vec<Url>, geoip: Arc<dyn GeoIp>) -> Self {
		Broker {
			config: Arc::new(config),
			providers,
			judge_urls,
			geoip,
			http_client: reqwest::Client::new(),
			dns: TokioAsyncResolver::tokio(Default::default(), Default::default()),
			shutdown: CancellationToken::new(),
		}
	}

	/// Signal any running `serve` loop to stop accepting connections and
	/// return once in-flight ones drain.
	pub fn shutdown(&self) {
		self.shutdown.cancel();
	}

	async fn judges(&self) -> Arc<JudgeRegistry> {
		Arc::new(JudgeRegistry::build(&self.http_client, self.judge_urls.clone()).await)
	}

	/// `grab`: collect and verify proxies up to `limit`, returning them
	/// rather than serving traffic. `countries` is a GeoIP country-code
	/// allow-list; empty means unfiltered.
	pub async fn grab(&self, expected_types: HashSet<Protocol>, countries: HashSet<String>, limit: usize) -> Result<Vec<Arc<Proxy>>, BrokerError> {
		if limit == 0 {
			return Err(crate::error::ConfigError::ZeroLimit.into());
		}
		let (candidates_tx, candidates_rx) = mpsc::channel(256);
		let (jobs_tx, jobs_rx) = mpsc::channel(256);
		let (checked_tx, mut checked_rx) = mpsc::channel(256);

		let judges = self.judges().await;
		let resolver = Arc::new(Resolver::with_countries(self.dns.clone(), self.geoip.clone(), countries));
		let checker = Arc::new(Checker::new(self.config.clone(), judges, self.dns.clone()));

		let providers = self.providers.clone();
		let concurrency = self.config.provider_concurrency;
		let client = self.http_client.clone();
		let discovery_handle = tokio::spawn(discovery::run_providers(providers, concurrency, client, candidates_tx));

		let resolver_handle = tokio::spawn(resolve::run_resolver(resolver, candidates_rx, jobs_tx));

		let checker_clone = checker.clone();
		let max_conn = self.config.max_conn;
		let check_handle = tokio::spawn(async move {
			run_checkers(checker_clone, jobs_rx, checked_tx, max_conn, expected_types).await;
		});

		let mut out = Vec::with_capacity(limit);
		while out.len() < limit {
			match checked_rx.recv().await {
				Some(proxy) if !proxy.discovered_protocols().is_empty() => out.push(proxy),
				Some(_) => continue,
				None => break,
			}
		}
		drop(checked_rx);
		discovery_handle.abort();
		resolver_handle.abort();
		check_handle.abort();
		Ok(out)
	}

	/// `find`: like `grab`, but returns a live pool handle callers can keep
	/// drawing verified proxies from as checking continues in the
	/// background. `countries` is a GeoIP country-code allow-list; empty
	/// means unfiltered.
	pub async fn find(&self, expected_types: HashSet<Protocol>, countries: HashSet<String>) -> Result<Arc<RankedPool>, BrokerError> {
		self.find_with_capacity(expected_types, countries, 256).await
	}

	/// Shared `find` implementation; `checked_capacity` bounds how many
	/// verified-but-not-yet-drawn proxies the checker pipeline will buffer
	/// before it applies backpressure. `serve` ties this to its `limit` so a
	/// small limit keeps a correspondingly small live pool.
	async fn find_with_capacity(
		&self,
		expected_types: HashSet<Protocol>,
		countries: HashSet<String>,
		checked_capacity: usize,
	) -> Result<Arc<RankedPool>, BrokerError> {
		let (candidates_tx, candidates_rx) = mpsc::channel(256);
		let (jobs_tx, jobs_rx) = mpsc::channel(256);
		let (checked_tx, checked_rx) = mpsc::channel(checked_capacity.max(1));

		let judges = self.judges().await;
		let resolver = Arc::new(Resolver::with_countries(self.dns.clone(), self.geoip.clone(), countries));
		let checker = Arc::new(Checker::new(self.config.clone(), judges, self.dns.clone()));

		let providers = self.providers.clone();
		let concurrency = self.config.provider_concurrency;
		let client = self.http_client.clone();
		let rescan_backoff = self.config.provider_rescan_backoff;
		let shutdown = self.shutdown.clone();
		tokio::spawn(run_providers_with_rescan(providers, concurrency, client, candidates_tx, rescan_backoff, shutdown));
		tokio::spawn(resolve::run_resolver(resolver, candidates_rx, jobs_tx));
		let max_conn = self.config.max_conn;
		tokio::spawn(async move {
			run_checkers(checker, jobs_rx, checked_tx, max_conn, expected_types).await;
		});

		Ok(Arc::new(RankedPool::new(self.config.clone(), checked_rx)))
	}

	/// `serve`: run the local forwarding proxy on `addr`, fed by a live
	/// `find`-style pipeline restricted to `expected_types`/`countries`,
	/// until the process is asked to stop via [`Broker::shutdown`] or
	/// SIGINT. `limit` caps how many verified proxies the backing pool
	/// buffers at once; `0` is rejected the same way `grab` rejects it,
	/// since a pool that can never hold anything would leave every
	/// connection 502ing forever.
	pub async fn serve(&self, addr: SocketAddr, expected_types: HashSet<Protocol>, countries: HashSet<String>, limit: usize) -> Result<(), BrokerError> {
		if limit == 0 {
			return Err(crate::error::ConfigError::ZeroLimit.into());
		}
		let pool = self.find_with_capacity(expected_types, countries, limit).await?;
		info!(%addr, "starting forwarding server");
		let server = Arc::new(ForwardingServer::new(self.config.clone(), pool));

		let shutdown = self.shutdown.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				info!("received interrupt, shutting down forwarding server");
				shutdown.cancel();
			}
		});

		server.run_until_stopped(addr, self.shutdown.clone()).await?;
		Ok(())
	}
}

/// Drive `run_providers` to completion, then re-run the whole sweep after
/// `backoff` rather than treating one pass as the end of a `find`/`serve`
/// pipeline's lifetime. `grab` doesn't use this: it wants exactly one pass
/// and aborts the pipeline once its limit is met.
async fn run_providers_with_rescan(
	providers: Vec<Arc<dyn Provider>>,
	concurrency: usize,
	client: reqwest::Client,
	out: mpsc::Sender<discovery::RawCandidate>,
	backoff: std::time::Duration,
	shutdown: CancellationToken,
) {
	loop {
		discovery::run_providers(providers.clone(), concurrency, client.clone(), out.clone()).await;
		if out.is_closed() {
			return;
		}
		tokio::select! {
			_ = tokio::time::sleep(backoff) => {}
			_ = shutdown.cancelled() => return,
		}
	}
}

/// Fan the resolved job stream out across up to `max_conn` concurrent
/// checker tasks, forwarding checked proxies downstream. This is the
/// check-queue bound, distinct from provider fan-out.
async fn run_checkers(
	checker: Arc<Checker>,
	mut jobs: mpsc::Receiver<crate::types::CheckJob>,
	out: mpsc::Sender<Arc<Proxy>>,
	max_conn: usize,
	expected_types: HashSet<Protocol>,
) {
	let sem = Arc::new(tokio::sync::Semaphore::new(max_conn.max(1)));
	let mut tasks = Vec::new();
	while let Some(mut job) = jobs.recv().await {
		if !expected_types.is_empty() {
			job.expected_types = expected_types.clone();
		}
		let sem = sem.clone();
		let checker = checker.clone();
		let out = out.clone();
		tasks.push(tokio::spawn(async move {
			let _permit = sem.acquire().await.expect("semaphore never closes");
			let proxy = checker.check(job).await;
			let _ = out.send(proxy).await;
		}));
	}
	for t in tasks {
		let _ = t.await;
	}
}
