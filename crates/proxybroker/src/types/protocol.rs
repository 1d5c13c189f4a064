//! Protocol and scheme vocabulary. Flattened to a sum type instead of a
//! `BaseNegotiator` subclass hierarchy: there is a fixed, closed set of six
//! negotiation strategies and no plugin surface for more.

use std::fmt;

/// One of the six negotiation strategies a candidate can be checked
/// against. Order matches the deterministic sweep the checker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Protocol {
	#[serde(rename = "HTTP")]
	Http,
	#[serde(rename = "CONNECT:80")]
	Connect80,
	#[serde(rename = "CONNECT:25")]
	Connect25,
	#[serde(rename = "SOCKS4")]
	Socks4,
	#[serde(rename = "SOCKS5")]
	Socks5,
	#[serde(rename = "HTTPS")]
	Https,
}

/// The full sweep order used by the checker.
pub const SWEEP_ORDER: [Protocol; 6] = [
	Protocol::Http,
	Protocol::Connect80,
	Protocol::Connect25,
	Protocol::Socks4,
	Protocol::Socks5,
	Protocol::Https,
];

/// Protocols that can carry a plain HTTP request once negotiated.
pub const HTTP_CAPABLE: [Protocol; 4] = [
	Protocol::Http,
	Protocol::Connect80,
	Protocol::Socks4,
	Protocol::Socks5,
];

/// Protocols that can carry an HTTPS (CONNECT-tunneled) request.
pub const HTTPS_CAPABLE: [Protocol; 3] = [Protocol::Https, Protocol::Socks4, Protocol::Socks5];

impl Protocol {
	pub fn as_str(&self) -> &'static str {
		match self {
			Protocol::Http => "HTTP",
			Protocol::Connect80 => "CONNECT:80",
			Protocol::Connect25 => "CONNECT:25",
			Protocol::Socks4 => "SOCKS4",
			Protocol::Socks5 => "SOCKS5",
			Protocol::Https => "HTTPS",
		}
	}

	/// Whether this negotiator exposes anonymity-classification markers in
	/// the judge response. Only plain `HTTP` does: tunnel-based negotiators
	/// hand bytes through untouched once established, so they never get a
	/// chance to rewrite headers the judge could notice.
	pub fn checks_anon_lvl(&self) -> bool {
		matches!(self, Protocol::Http)
	}

	/// Whether the negotiated request line should carry the judge's full
	/// URL rather than just its path.
	pub fn use_full_path(&self) -> bool {
		matches!(self, Protocol::Http)
	}
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The two request schemes a forwarding client can ask the pool for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
	Http,
	Https,
}

impl Scheme {
	pub fn as_str(&self) -> &'static str {
		match self {
			Scheme::Http => "HTTP",
			Scheme::Https => "HTTPS",
		}
	}

	/// The protocols, in fixed preference order, a pool consults to satisfy
	/// a request for this scheme.
	pub fn candidate_protocols(&self, prefer_connect: bool) -> &'static [Protocol] {
		match (self, prefer_connect) {
			(Scheme::Http, true) => &[
				Protocol::Connect80,
				Protocol::Http,
				Protocol::Socks5,
				Protocol::Socks4,
			],
			(Scheme::Http, false) => &[
				Protocol::Http,
				Protocol::Connect80,
				Protocol::Socks5,
				Protocol::Socks4,
			],
			(Scheme::Https, _) => &[Protocol::Https, Protocol::Socks5, Protocol::Socks4],
		}
	}
}

impl fmt::Display for Scheme {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Anonymity classification a proxy earns under a given protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Anonymity {
	Transparent,
	Anonymous,
	High,
}

impl Anonymity {
	pub fn as_str(&self) -> &'static str {
		match self {
			Anonymity::Transparent => "Transparent",
			Anonymity::Anonymous => "Anonymous",
			Anonymity::High => "High",
		}
	}
}

impl fmt::Display for Anonymity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sweep_order_is_cheapest_first() {
		assert_eq!(
			SWEEP_ORDER,
			[
				Protocol::Http,
				Protocol::Connect80,
				Protocol::Connect25,
				Protocol::Socks4,
				Protocol::Socks5,
				Protocol::Https,
			]
		);
	}

	#[test]
	fn only_http_checks_anon_lvl() {
		for p in SWEEP_ORDER {
			assert_eq!(p.checks_anon_lvl(), p == Protocol::Http);
		}
	}
}
