//! Runtime configuration: a `RawConfig`/`Config` split, a deserializable
//! raw form with `Option` fields and documented defaults, resolved into a
//! fully-populated `BrokerConfig` the rest of the crate consumes.
//!
//! Two distinct concurrency ceilings are easy to conflate and are kept as
//! separate fields on purpose: `provider_concurrency` bounds how many
//! provider fetches run at once, while `max_conn` bounds the checker
//! pool's in-flight verification jobs. They have different defaults and
//! different owners, so collapsing them under one flag would hide that.

use std::time::Duration;

use broker_core::duration::{serde_dur, serde_dur_option};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// User-facing, partially-specified configuration as loaded from a config
/// file or CLI flags. Every field is optional; [`RawBrokerConfig::resolve`]
/// fills in the documented defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawBrokerConfig {
	pub max_conn: Option<usize>,
	pub provider_concurrency: Option<usize>,
	#[serde(default, with = "serde_dur_option")]
	pub provider_rescan_backoff: Option<Duration>,
	#[serde(default, with = "serde_dur_option")]
	pub check_timeout: Option<Duration>,
	pub max_tries: Option<u32>,
	pub min_req_proxy: Option<u32>,
	pub max_error_rate: Option<f64>,
	#[serde(default, with = "serde_dur_option")]
	pub max_resp_time: Option<Duration>,
	pub min_queue: Option<usize>,
	pub max_import_retries: Option<u32>,
	#[serde(default, with = "serde_dur_option")]
	pub import_timeout: Option<Duration>,
	pub strategy: Option<PoolStrategy>,
	pub prefer_connect: Option<bool>,
	pub http_allowed_codes: Option<Vec<u16>>,
	pub backlog: Option<u32>,
	/// Require `High` anonymity for a protocol check to count as passed,
	/// instead of accepting any class the protocol managed to earn.
	pub strict: Option<bool>,
	pub dnsbl: Option<Vec<String>>,
	/// Submit the judge check as a POST instead of a GET.
	pub post: Option<bool>,
	/// Request body to submit when `post` is set; empty-string if unset.
	pub data: Option<String>,
	#[serde(default, with = "serde_dur_option")]
	pub history_ttl: Option<Duration>,
	pub history_capacity: Option<usize>,
}

/// The pool's candidate-selection strategy when multiple established
/// proxies match a requested scheme. `Best` walks the heap in ranked
/// order, skipping scheme-incompatible entries without disturbing
/// their position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
	Best,
}

impl Default for PoolStrategy {
	fn default() -> Self {
		PoolStrategy::Best
	}
}

/// Fully-resolved configuration, defaults.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
	/// Bound on in-flight checker verification jobs (the check-queue).
	pub max_conn: usize,
	/// Bound on concurrent provider fetches.
	pub provider_concurrency: usize,
	/// How long a long-running `find`/`serve` pipeline waits before
	/// re-running providers once the first sweep is exhausted.
	pub provider_rescan_backoff: Duration,
	pub check_timeout: Duration,
	pub max_tries: u32,
	pub min_req_proxy: u32,
	pub max_error_rate: f64,
	pub max_resp_time: Duration,
	pub min_queue: usize,
	pub max_import_retries: u32,
	pub import_timeout: Duration,
	pub strategy: PoolStrategy,
	pub prefer_connect: bool,
	pub http_allowed_codes: Option<Vec<u16>>,
	pub backlog: u32,
	pub strict: bool,
	pub dnsbl: Vec<String>,
	pub post: bool,
	pub data: Option<String>,
	pub history_ttl: Duration,
	pub history_capacity: usize,
}

impl Default for BrokerConfig {
	fn default() -> Self {
		BrokerConfig {
			max_conn: 200,
			provider_concurrency: 3,
			provider_rescan_backoff: Duration::from_secs(180),
			check_timeout: Duration::from_secs(8),
			max_tries: 3,
			min_req_proxy: 5,
			max_error_rate: 0.5,
			max_resp_time: Duration::from_secs(8),
			min_queue: 5,
			max_import_retries: 100,
			import_timeout: Duration::from_secs_f64(5.0),
			strategy: PoolStrategy::Best,
			prefer_connect: false,
			http_allowed_codes: None,
			backlog: 100,
			strict: false,
			dnsbl: Vec::new(),
			post: false,
			data: None,
			history_ttl: Duration::from_secs(600),
			history_capacity: 10_000,
		}
	}
}

impl RawBrokerConfig {
	pub fn resolve(self) -> Result<BrokerConfig, ConfigError> {
		let defaults = BrokerConfig::default();
		Ok(BrokerConfig {
			max_conn: self.max_conn.unwrap_or(defaults.max_conn),
			provider_concurrency: self.provider_concurrency.unwrap_or(defaults.provider_concurrency),
			provider_rescan_backoff: self.provider_rescan_backoff.unwrap_or(defaults.provider_rescan_backoff),
			check_timeout: self.check_timeout.unwrap_or(defaults.check_timeout),
			max_tries: self.max_tries.unwrap_or(defaults.max_tries),
			min_req_proxy: self.min_req_proxy.unwrap_or(defaults.min_req_proxy),
			max_error_rate: self.max_error_rate.unwrap_or(defaults.max_error_rate),
			max_resp_time: self.max_resp_time.unwrap_or(defaults.max_resp_time),
			min_queue: self.min_queue.unwrap_or(defaults.min_queue),
			max_import_retries: self.max_import_retries.unwrap_or(defaults.max_import_retries),
			import_timeout: self.import_timeout.unwrap_or(defaults.import_timeout),
			strategy: self.strategy.unwrap_or(defaults.strategy),
			prefer_connect: self.prefer_connect.unwrap_or(defaults.prefer_connect),
			http_allowed_codes: self.http_allowed_codes.or(defaults.http_allowed_codes),
			backlog: self.backlog.unwrap_or(defaults.backlog),
			strict: self.strict.unwrap_or(defaults.strict),
			dnsbl: self.dnsbl.unwrap_or(defaults.dnsbl),
			post: self.post.unwrap_or(defaults.post),
			data: self.data.or(defaults.data),
			history_ttl: self.history_ttl.unwrap_or(defaults.history_ttl),
			history_capacity: self.history_capacity.unwrap_or(defaults.history_capacity),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_documented_values() {
		let cfg = RawBrokerConfig::default().resolve().unwrap();
		assert_eq!(cfg.provider_concurrency, 3);
		assert_eq!(cfg.max_conn, 200);
		assert_eq!(cfg.min_req_proxy, 5);
		assert_eq!(cfg.max_error_rate, 0.5);
		assert_eq!(cfg.max_resp_time, Duration::from_secs(8));
		assert_eq!(cfg.min_queue, 5);
		assert_eq!(cfg.max_import_retries, 100);
		assert_eq!(cfg.import_timeout, Duration::from_secs(5));
		assert_eq!(cfg.backlog, 100);
		assert!(!cfg.strict);
		assert_eq!(cfg.provider_rescan_backoff, Duration::from_secs(180));
	}

	#[test]
	fn explicit_values_override_defaults() {
		let raw = RawBrokerConfig {
			max_conn: Some(50),
			..Default::default()
		};
		let cfg = raw.resolve().unwrap();
		assert_eq!(cfg.max_conn, 50);
		assert_eq!(cfg.provider_concurrency, 3);
	}
}
