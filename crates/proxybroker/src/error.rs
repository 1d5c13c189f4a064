//! Error taxonomy: a kind-not-type split between recoverable per-attempt
//! errors that get counted on the responsible [`crate::types::Proxy`] and
//! consume a checker/server retry, versus terminal errors that end the
//! enclosing operation.

use std::net::AddrParseError;

/// Recoverable, per-attempt failures. Each variant name doubles as the
/// counter key recorded on [`crate::types::Stats`] (`ProxyError::Timeout`
/// increments the `"timeout"` counter, etc.).
#[derive(thiserror::Error, Debug, Clone)]
pub enum ProxyError {
	#[error("connection timed out")]
	Timeout,
	#[error("connection failed")]
	Conn,
	#[error("send failed")]
	Send,
	#[error("receive failed")]
	Recv,
	#[error("receive returned no data")]
	EmptyRecv,
	#[error("bad status line")]
	BadStatusLine,
	#[error("unexpected status: {0}")]
	BadStatus(u16),
	#[error("malformed or unexpected response body")]
	BadResponse,
}

impl ProxyError {
	/// The counter key under which this error is recorded on a proxy's
	/// [`crate::types::Stats::errors`] map.
	pub fn kind(&self) -> &'static str {
		match self {
			ProxyError::Timeout => "timeout",
			ProxyError::Conn => "conn",
			ProxyError::Send => "send",
			ProxyError::Recv => "recv",
			ProxyError::EmptyRecv => "empty_recv",
			ProxyError::BadStatusLine => "bad_status_line",
			ProxyError::BadStatus(_) => "bad_status",
			ProxyError::BadResponse => "bad_response",
		}
	}

	/// Whether this error counts toward `avg_resp_time` accounting rules:
	/// timed-out attempts never contribute a latency sample.
	pub fn is_timeout(&self) -> bool {
		matches!(self, ProxyError::Timeout)
	}
}

/// Errors from resolving or constructing a [`crate::types::Proxy`].
/// Dropped silently by the resolver stage; never surfaces past it in
/// `grab`/`find` mode.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ResolveError {
	#[error("could not resolve host {0:?}")]
	Dns(String),
	#[error("invalid port {0}")]
	InvalidPort(i64),
	#[error("host is not an IP literal: {0}")]
	NotAnIp(String),
}

impl From<AddrParseError> for ResolveError {
	fn from(_: AddrParseError) -> Self {
		ResolveError::NotAnIp(String::new())
	}
}

/// Synchronous configuration failures raised at `find`/`serve` start.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ConfigError {
	#[error("no judge is ready for the {0} scheme family")]
	NoReadyJudge(&'static str),
	#[error("serve() requires limit > 0")]
	ZeroLimit,
	#[error("empty provider list")]
	NoProviders,
}

/// Terminal error raised by [`crate::pool::RankedPool::get`] once its
/// retry budget under `max_import_retries` is exhausted. Fatal for the
/// enclosing request: the forwarding server answers with a 502 and then
/// shuts itself down, since a pool with nothing left to offer for any
/// scheme won't recover on its own.
#[derive(thiserror::Error, Debug, Clone)]
#[error("no proxy available for scheme {scheme}: {reason}")]
pub struct NoProxyError {
	pub scheme: &'static str,
	pub reason: &'static str,
}

/// Top-level error returned from the broker's public `grab`/`find`/`serve`
/// API surface.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	NoProxy(#[from] NoProxyError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}
