//! Logging bootstrap: a level name in, an `EnvFilter`-driven
//! `tracing_subscriber` out. No OTLP exporter; this binary only needs
//! stderr output.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a global `tracing` subscriber writing to stderr.
///
/// `level` accepts the CLI's vocabulary (`debug`, `info`, `warn`, `error`);
/// anything else is passed through to `EnvFilter` verbatim so
/// `RUST_LOG`-style directives (`proxybroker=debug,hyper=warn`) still work.
pub fn init(level: &str) {
	let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
	let _ = tracing_subscriber::registry()
		.with(tracing_subscriber::fmt::layer())
		.with(filter)
		.try_init();
}
