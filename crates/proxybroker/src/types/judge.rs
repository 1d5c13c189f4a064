//! Echo-service judges: a judge is a URL the checker can send a request
//! through a candidate and compare against a direct baseline fetch to
//! classify anonymity.

use std::net::IpAddr;

use broker_core::Strng;
use url::Url;

/// Which negotiation family a judge serves. `Smtp` judges are plain mail
/// hosts used only to confirm a `CONNECT:25` tunnel reaches a live SMTP
/// banner; they carry no HTTP baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JudgeScheme {
	Http,
	Https,
	Smtp,
}

impl JudgeScheme {
	pub fn as_str(&self) -> &'static str {
		match self {
			JudgeScheme::Http => "HTTP",
			JudgeScheme::Https => "HTTPS",
			JudgeScheme::Smtp => "SMTP",
		}
	}
}

/// Baseline marker counts recorded from a direct (no-proxy) fetch of an
/// HTTP/HTTPS judge's echo body, used to classify anonymity by comparison.
#[derive(Debug, Clone, Default)]
pub struct Baseline {
	pub via_marks: usize,
	pub proxy_marks: usize,
	/// The literal IP text the judge echoed back on a direct, non-proxied
	/// fetch. Seeing this same text echoed back through a candidate proxy
	/// is the strongest possible Transparent signal.
	pub own_ip: Option<String>,
}

/// A single judge endpoint, resolved and (for HTTP/HTTPS judges) baselined
/// once before entering the registry.
#[derive(Debug, Clone)]
pub struct Judge {
	pub url: Url,
	pub host: Strng,
	pub resolved_ip: IpAddr,
	pub port: u16,
	pub scheme: JudgeScheme,
	pub baseline: Baseline,
}

impl Judge {
	pub fn new(url: Url, resolved_ip: IpAddr, scheme: JudgeScheme) -> Self {
		let host = Strng::from(url.host_str().unwrap_or_default());
		let port = url
			.port_or_known_default()
			.unwrap_or(if scheme == JudgeScheme::Smtp { 25 } else { 80 });
		Judge {
			url,
			host,
			resolved_ip,
			port,
			scheme,
			baseline: Baseline::default(),
		}
	}
}
