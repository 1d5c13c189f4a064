//! The checker: runs the protocol sweep for one candidate, verifies the
//! judge actually echoed back this attempt's distinguishing values, and
//! classifies anonymity. Only the `Http` negotiator's `checks_anon_lvl`
//! flag is set — tunnel-based negotiators hand the judge request through
//! byte-transparently once negotiated, so they can't themselves leak
//! headers. In strict mode a protocol only counts as checked if it earned
//! the best (`High`) anonymity class.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::BrokerConfig;
use crate::error::ProxyError;
use crate::judge::JudgeRegistry;
use crate::negotiate::{self, target_from_socket};
use crate::types::conn::ProxyConn;
use crate::types::judge::Judge;
use crate::types::{Anonymity, CheckJob, JudgeScheme, Protocol, Proxy};

const MAX_RESPONSE_BYTES: usize = 65_536;

/// Verifies candidates against the judge registry and records results
/// directly on their shared [`Proxy`].
pub struct Checker {
	config: Arc<BrokerConfig>,
	judges: Arc<JudgeRegistry>,
	resolver: hickory_resolver::TokioAsyncResolver,
}

impl Checker {
	pub fn new(config: Arc<BrokerConfig>, judges: Arc<JudgeRegistry>, resolver: hickory_resolver::TokioAsyncResolver) -> Self {
		Checker { config, judges, resolver }
	}

	/// Run the full protocol sweep for `job`, returning the same proxy with
	/// checked protocols recorded on it.
	pub async fn check(&self, job: CheckJob) -> Arc<Proxy> {
		if !self.config.dnsbl.is_empty() && self.is_blacklisted(job.addr).await {
			debug!(addr = %job.addr, "candidate blacklisted, skipping sweep");
			return job.proxy;
		}
		for proto in job.sweep() {
			self.check_protocol(&job.proxy, job.addr, proto).await;
		}
		job.proxy
	}

	async fn is_blacklisted(&self, addr: SocketAddr) -> bool {
		let SocketAddr::V4(v4) = addr else { return false };
		let octets = v4.ip().octets();
		let reversed = format!("{}.{}.{}.{}", octets[3], octets[2], octets[1], octets[0]);
		for zone in &self.config.dnsbl {
			let query = format!("{reversed}.{zone}");
			if self.resolver.lookup_ip(query).await.is_ok() {
				return true;
			}
		}
		false
	}

	async fn check_protocol(&self, proxy: &Proxy, addr: SocketAddr, proto: Protocol) {
		let family = match proto {
			Protocol::Https => JudgeScheme::Https,
			Protocol::Connect25 => JudgeScheme::Smtp,
			_ => JudgeScheme::Http,
		};
		let judge = match self.judges.wait_for(family).await {
			Ok(j) => j,
			Err(_) => {
				trace!(%proto, "no judge configured for this family, skipping");
				return;
			}
		};

		proxy.set_current_negotiator(Some(proto));
		let started = Instant::now();
		let result = self.attempt(addr, proto, &judge).await;
		let elapsed = started.elapsed().as_secs_f64();
		match result {
			Ok(anon) if passes_strict_policy(self.config.strict, anon) => {
				proxy.log_result(format!("{proto} ok"), elapsed, None);
				proxy.mark_checked(proto, Some(anon));
			}
			Ok(anon) => {
				proxy.log_result(format!("{proto} failed strict policy at {anon}"), elapsed, None);
				proxy.mark_checked(proto, None);
			}
			Err(err) => {
				proxy.log_result(format!("{proto} failed: {err}"), elapsed, Some(&err));
				proxy.mark_checked(proto, None);
			}
		}
		proxy.set_current_negotiator(None);
	}

	async fn attempt(&self, addr: SocketAddr, proto: Protocol, judge: &Judge) -> Result<Anonymity, ProxyError> {
		let stream = timeout(self.config.check_timeout, TcpStream::connect(addr))
			.await
			.map_err(|_| ProxyError::Timeout)?
			.map_err(|_| ProxyError::Conn)?;
		let mut conn = ProxyConn::Plain(stream);

		let target = target_from_socket(judge.host.to_string(), SocketAddr::new(judge.resolved_ip, judge.port));
		conn = negotiate::negotiate(conn, proto, &target, self.config.check_timeout).await?;

		if proto == Protocol::Connect25 {
			// A live SMTP banner is the full verification; there's no HTTP
			// judge body to classify anonymity against.
			return Ok(Anonymity::High);
		}
		if proto == Protocol::Https {
			conn = negotiate::upgrade_tls(conn, &judge.host).await?;
		}

		let rv: u32 = rand::rng().random_range(1000..9999);
		let post_data = self.config.post.then(|| self.config.data.as_deref().unwrap_or(""));
		let request = build_judge_request(proto, judge, rv, post_data);
		conn.write_all(request.as_bytes()).await.map_err(|_| ProxyError::Send)?;
		conn.flush().await.map_err(|_| ProxyError::Send)?;

		let body = read_response(&mut conn, self.config.check_timeout).await?;
		if !proto.checks_anon_lvl() {
			// Tunnel-based negotiators hand bytes through untouched once
			// established; the proxy had no opportunity to rewrite headers.
			return Ok(Anonymity::High);
		}
		verify_echo(&body, rv)?;
		Ok(classify(&body, judge))
	}
}

fn referer_value(rv: u32) -> String {
	format!("http://check.pxbroker.invalid/{rv}")
}

fn cookie_value(rv: u32) -> String {
	format!("pxbroker={rv}")
}

/// Build the judge request. `post_data` is `Some(body)` to submit the
/// check as a POST carrying `body` (for judges that only echo request
/// data back on POST), or `None` for the default GET.
fn build_judge_request(proto: Protocol, judge: &Judge, rv: u32, post_data: Option<&str>) -> String {
	let target = if proto.use_full_path() {
		judge.url.to_string()
	} else {
		let mut path = judge.url.path().to_string();
		if let Some(q) = judge.url.query() {
			path.push('?');
			path.push_str(q);
		}
		path
	};
	let referer = referer_value(rv);
	let cookie = cookie_value(rv);
	match post_data {
		Some(body) => format!(
			"POST {target} HTTP/1.1\r\n\
			 Host: {host}\r\n\
			 User-Agent: PxBroker/{rv}\r\n\
			 Accept: */*\r\n\
			 Accept-Encoding: identity\r\n\
			 Referer: {referer}\r\n\
			 Cookie: {cookie}\r\n\
			 Content-Type: application/x-www-form-urlencoded\r\n\
			 Content-Length: {len}\r\n\
			 Pragma: no-cache\r\n\
			 Cache-control: no-cache\r\n\
			 Connection: close\r\n\r\n{body}",
			host = judge.host,
			len = body.len(),
		),
		None => format!(
			"GET {target} HTTP/1.1\r\n\
			 Host: {host}\r\n\
			 User-Agent: PxBroker/{rv}\r\n\
			 Accept: */*\r\n\
			 Accept-Encoding: identity\r\n\
			 Referer: {referer}\r\n\
			 Cookie: {cookie}\r\n\
			 Pragma: no-cache\r\n\
			 Cache-control: no-cache\r\n\
			 Connection: close\r\n\r\n",
			host = judge.host,
		),
	}
}

/// Confirm the judge's echo body actually reflects back the distinguishing
/// `Referer`/`Cookie` values sent for this specific attempt, rather than a
/// stale or unrelated response. A judge that doesn't echo request headers
/// at all, or returns cached content from a previous request, fails this
/// check before anonymity is ever classified from its body.
fn verify_echo(body: &str, rv: u32) -> Result<(), ProxyError> {
	if body.contains(&referer_value(rv)) && body.contains(&cookie_value(rv)) {
		Ok(())
	} else {
		Err(ProxyError::BadResponse)
	}
}

async fn read_response(conn: &mut ProxyConn, deadline: std::time::Duration) -> Result<String, ProxyError> {
	let mut buf = Vec::new();
	let mut chunk = [0u8; 4096];
	let read_fut = async {
		loop {
			let n = conn.read(&mut chunk).await.map_err(|_| ProxyError::Recv)?;
			if n == 0 {
				break;
			}
			buf.extend_from_slice(&chunk[..n]);
			if buf.len() >= MAX_RESPONSE_BYTES {
				break;
			}
		}
		Ok::<_, ProxyError>(())
	};
	match timeout(deadline, read_fut).await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => return Err(e),
		Err(_) => {
			if buf.is_empty() {
				return Err(ProxyError::Timeout);
			}
		}
	}
	if buf.is_empty() {
		return Err(ProxyError::EmptyRecv);
	}
	Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Strict mode requires the best class a protocol can earn (`High`); in
/// lenient mode any classification the protocol can produce passes,
/// including a transparent one, since the caller only asked to confirm
/// the protocol works at all.
fn passes_strict_policy(strict: bool, anon: Anonymity) -> bool {
	!strict || anon == Anonymity::High
}

fn classify(body: &str, judge: &Judge) -> Anonymity {
	if let Some(ip) = &judge.baseline.own_ip {
		if body.contains(ip.as_str()) {
			return Anonymity::Transparent;
		}
	}
	let lower = body.to_ascii_lowercase();
	let via = ["via:", "x-via"].iter().filter(|m| lower.contains(**m)).count();
	let proxy_marks = ["x-forwarded-for", "proxy-connection", "forwarded:"]
		.iter()
		.filter(|m| lower.contains(**m))
		.count();
	if via > judge.baseline.via_marks || proxy_marks > judge.baseline.proxy_marks {
		return Anonymity::Anonymous;
	}
	Anonymity::High
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::JudgeScheme;
	use url::Url;

	fn judge() -> Judge {
		let mut j = Judge::new(
			Url::parse("http://judge.example/get").unwrap(),
			"203.0.113.9".parse().unwrap(),
			JudgeScheme::Http,
		);
		j.baseline.own_ip = Some("203.0.113.77".to_string());
		j
	}

	#[test]
	fn real_ip_in_body_is_transparent() {
		let j = judge();
		let body = "X-Forwarded-For: 203.0.113.77\r\n";
		assert_eq!(classify(body, &j), Anonymity::Transparent);
	}

	#[test]
	fn extra_via_header_without_real_ip_is_anonymous() {
		let j = judge();
		let body = "Via: 1.1 proxy-gw\r\n";
		assert_eq!(classify(body, &j), Anonymity::Anonymous);
	}

	#[test]
	fn clean_echo_is_high() {
		let j = judge();
		let body = "User-Agent: PxBroker/1234\r\n";
		assert_eq!(classify(body, &j), Anonymity::High);
	}

	#[test]
	fn full_path_used_only_for_http_negotiator() {
		let j = judge();
		let req = build_judge_request(Protocol::Http, &j, 4242, None);
		assert!(req.starts_with("GET http://judge.example/get"));
		let req2 = build_judge_request(Protocol::Socks5, &j, 4242, None);
		assert!(req2.starts_with("GET /get"));
	}

	#[test]
	fn request_carries_distinguishing_referer_and_cookie() {
		let j = judge();
		let req = build_judge_request(Protocol::Http, &j, 7777, None);
		assert!(req.contains(&referer_value(7777)));
		assert!(req.contains(&cookie_value(7777)));
	}

	#[test]
	fn post_mode_carries_body_and_content_length() {
		let j = judge();
		let req = build_judge_request(Protocol::Http, &j, 7777, Some("k=v"));
		assert!(req.starts_with("POST http://judge.example/get"));
		assert!(req.contains("Content-Length: 3"));
		assert!(req.ends_with("k=v"));
	}

	#[test]
	fn verify_echo_accepts_matching_round_trip() {
		let body = format!("echo: {} {}", referer_value(9001), cookie_value(9001));
		assert!(verify_echo(&body, 9001).is_ok());
	}

	#[test]
	fn verify_echo_rejects_stale_or_foreign_response() {
		let body = format!("echo: {} {}", referer_value(9001), cookie_value(9001));
		assert!(matches!(verify_echo(&body, 1234), Err(ProxyError::BadResponse)));
	}

	#[test]
	fn strict_policy_requires_high_anonymity() {
		assert!(passes_strict_policy(true, Anonymity::High));
		assert!(!passes_strict_policy(true, Anonymity::Anonymous));
		assert!(!passes_strict_policy(true, Anonymity::Transparent));
	}

	#[test]
	fn lenient_policy_accepts_any_class() {
		assert!(passes_strict_policy(false, Anonymity::High));
		assert!(passes_strict_policy(false, Anonymity::Anonymous));
		assert!(passes_strict_policy(false, Anonymity::Transparent));
	}
}
