//! The local forwarding server: one raw TCP accept loop that both
//! forwards client requests through the ranked pool and answers a
//! `Host: proxycontrol` control API on the same listener, rather than a
//! separate control server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::ProxyError;
use crate::history::HistoryCache;
use crate::negotiate::{self, NegotiationTarget};
use crate::pool::RankedPool;
use crate::types::conn::ProxyConn;
use crate::types::{Protocol, Scheme};

const MAX_REQUEST_HEAD: usize = 65_536;
const MAX_RESPONSE_HEAD: usize = 65_536;
const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Outcome of one accepted connection, distinguishing an ordinary
/// per-connection I/O failure from the pool having no proxy left to
/// offer for any scheme, which the accept loop treats as a reason to
/// stop the whole server rather than just drop this connection.
#[derive(Debug)]
enum HandleOutcome {
	Io(std::io::Error),
	NoProxyAvailable,
}

impl std::fmt::Display for HandleOutcome {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			HandleOutcome::Io(e) => write!(f, "{e}"),
			HandleOutcome::NoProxyAvailable => write!(f, "no proxy available in pool"),
		}
	}
}

impl From<std::io::Error> for HandleOutcome {
	fn from(e: std::io::Error) -> Self {
		HandleOutcome::Io(e)
	}
}

pub struct ForwardingServer {
	config: Arc<BrokerConfig>,
	pool: Arc<RankedPool>,
	history: Arc<HistoryCache>,
}

struct RequestHead {
	method: String,
	target: String,
	version: String,
	headers: Vec<(String, String)>,
	raw: Vec<u8>,
}

impl RequestHead {
	fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}
}

impl ForwardingServer {
	pub fn new(config: Arc<BrokerConfig>, pool: Arc<RankedPool>) -> Self {
		let history = Arc::new(HistoryCache::new(config.history_capacity, config.history_ttl));
		ForwardingServer { config, pool, history }
	}

	pub async fn run(self: Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
		self.run_until_stopped(addr, CancellationToken::new()).await
	}

	/// Accept loop that exits cleanly once `shutdown` is cancelled, letting
	/// in-flight connections finish rather than dropping them, instead of
	/// closing the listener out from under callers still holding a
	/// reference to it.
	pub async fn run_until_stopped(self: Arc<Self>, addr: SocketAddr, shutdown: CancellationToken) -> std::io::Result<()> {
		let listener = TcpListener::bind(addr).await?;
		info!(%addr, "forwarding server listening");
		let permits = Arc::new(Semaphore::new(self.config.backlog as usize));
		loop {
			let (stream, peer) = tokio::select! {
				accepted = listener.accept() => accepted?,
				_ = shutdown.cancelled() => {
					info!(%addr, "forwarding server shutting down");
					return Ok(());
				}
			};
			let this = self.clone();
			let permits = permits.clone();
			let shutdown = shutdown.clone();
			tokio::spawn(async move {
				let Ok(_permit) = permits.acquire_owned().await else {
					return;
				};
				match this.handle(stream, peer).await {
					Ok(()) => {}
					Err(HandleOutcome::NoProxyAvailable) => {
						warn!(%peer, "no proxy available for any scheme, shutting down forwarding server");
						shutdown.cancel();
					}
					Err(HandleOutcome::Io(err)) => {
						debug!(%peer, error = %err, "connection ended with error");
					}
				}
			});
		}
	}

	async fn handle(&self, mut client: TcpStream, peer: SocketAddr) -> Result<(), HandleOutcome> {
		let head = match read_request_head(&mut client).await {
			Ok(h) => h,
			Err(_) => return Ok(()),
		};

		let host_header = head.header("host").unwrap_or_default();
		if host_header.eq_ignore_ascii_case("proxycontrol") {
			return self.handle_control(&mut client, &head, peer).await.map_err(HandleOutcome::Io);
		}

		let scheme = if head.method.eq_ignore_ascii_case("CONNECT") {
			Scheme::Https
		} else {
			Scheme::Http
		};

		let (dest_host, dest_port) = match parse_destination(&head, scheme) {
			Some(v) => v,
			None => {
				client.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await.ok();
				return Ok(());
			}
		};

		for _attempt in 0..self.config.max_tries {
			let proxy = match self.pool.get(scheme).await {
				Ok(p) => p,
				Err(_) => {
					client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await.ok();
					return Err(HandleOutcome::NoProxyAvailable);
				}
			};

			let proto = match choose_protocol(&proxy, scheme, self.config.prefer_connect) {
				Some(p) => p,
				None => {
					self.pool.put(proxy);
					continue;
				}
			};

			match self
				.serve_via(&mut client, &proxy, proto, &head, &dest_host, dest_port, scheme)
				.await
			{
				Ok(()) => {
					let key = HistoryCache::key(&peer.ip().to_string(), &head.target);
					self.history.insert(key, proxy.address());
					self.pool.put(proxy);
					return Ok(());
				}
				Err(err) => {
					warn!(addr = %proxy.address(), error = %err, "forward attempt failed, retrying");
					proxy.log_result("forward failed", 0.0, Some(&err));
					self.pool.put(proxy);
					if matches!(err, ProxyError::BadStatus(_)) && scheme == Scheme::Https {
						// TLS handshake through this tunnel almost certainly
						// failed; retrying another proxy won't help this attempt.
						break;
					}
				}
			}
		}
		client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await.ok();
		Ok(())
	}

	async fn serve_via(
		&self,
		client: &mut TcpStream,
		proxy: &crate::types::Proxy,
		proto: Protocol,
		head: &RequestHead,
		dest_host: &str,
		dest_port: u16,
		scheme: Scheme,
	) -> Result<(), ProxyError> {
		let started = Instant::now();
		let addr: SocketAddr = format!("{}:{}", proxy.host, proxy.port).parse().map_err(|_| ProxyError::Conn)?;
		let stream = tokio::time::timeout(self.config.check_timeout, TcpStream::connect(addr))
			.await
			.map_err(|_| ProxyError::Timeout)?
			.map_err(|_| ProxyError::Conn)?;
		let mut conn = ProxyConn::Plain(stream);

		let dest_ip = tokio::net::lookup_host((dest_host, dest_port))
			.await
			.ok()
			.and_then(|mut it| it.next())
			.map(|a| a.ip())
			.ok_or(ProxyError::Conn)?;
		let target = NegotiationTarget {
			host: dest_host.to_string(),
			ip: dest_ip,
			port: dest_port,
		};

		if matches!(proto, Protocol::Connect80 | Protocol::Socks4 | Protocol::Socks5 | Protocol::Https) {
			conn = negotiate::negotiate(conn, proto, &target, self.config.check_timeout).await?;
		}

		let elapsed = started.elapsed().as_secs_f64();
		proxy.log_result(format!("{proto} relay"), elapsed, None);

		if scheme == Scheme::Https {
			// Past "Connection established" this tunnel carries opaque bytes
			// (normally a TLS session between the client and the destination);
			// there's no HTTP response head here to rewrite or gate on a status.
			client.write_all(CONNECTION_ESTABLISHED).await.map_err(|_| ProxyError::Send)?;
			copy_bidirectional(client, &mut conn).await.map_err(|_| ProxyError::Recv)?;
		} else {
			conn.write_all(&head.raw).await.map_err(|_| ProxyError::Send)?;
			conn.flush().await.map_err(|_| ProxyError::Send)?;
			relay_http_response(
				client,
				&mut conn,
				&proxy.address(),
				self.config.http_allowed_codes.as_deref(),
				self.config.check_timeout,
			)
			.await?;
		}
		Ok(())
	}

	async fn handle_control(&self, client: &mut TcpStream, head: &RequestHead, peer: SocketAddr) -> std::io::Result<()> {
		let parts: Vec<&str> = head.target.trim_start_matches('/').splitn(3, '/').collect();
		match parts.as_slice() {
			["api", "remove", rest] => {
				if let Some((host, port)) = rest.rsplit_once(':').and_then(|(h, p)| Some((h.parse().ok()?, p.parse().ok()?))) {
					self.pool.remove(host, port);
				}
				client.write_all(b"HTTP/1.1 204 No Content\r\nAccess-Control-Allow-Origin: *\r\n\r\n").await?;
			}
			["api", "history", url] => {
				let key = HistoryCache::key(&peer.ip().to_string(), url);
				match self.history.get(&key) {
					Some(proxy_addr) => {
						let body = serde_json::json!({ "proxy": proxy_addr }).to_string();
						let resp = format!(
							"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nAccess-Control-Allow-Origin: *\r\nContent-Length: {}\r\n\r\n{}",
							body.len(),
							body
						);
						client.write_all(resp.as_bytes()).await?;
					}
					None => {
						client.write_all(b"HTTP/1.1 204 No Content\r\nAccess-Control-Allow-Origin: *\r\n\r\n").await?;
					}
				}
			}
			_ => {
				client.write_all(b"HTTP/1.1 404 Not Found\r\n\r\n").await?;
			}
		}
		Ok(())
	}
}

fn choose_protocol(proxy: &crate::types::Proxy, scheme: Scheme, prefer_connect: bool) -> Option<Protocol> {
	let discovered = proxy.discovered_protocols();
	scheme
		.candidate_protocols(prefer_connect)
		.iter()
		.find(|p| discovered.contains(p))
		.copied()
}

fn parse_destination(head: &RequestHead, scheme: Scheme) -> Option<(String, u16)> {
	if scheme == Scheme::Https {
		let (host, port) = head.target.rsplit_once(':')?;
		return Some((host.to_string(), port.parse().ok()?));
	}
	let url = url::Url::parse(&head.target).ok().or_else(|| {
		let host = head.header("host")?;
		url::Url::parse(&format!("http://{host}{}", head.target)).ok()
	})?;
	let host = url.host_str()?.to_string();
	let port = url.port_or_known_default().unwrap_or(80);
	Some((host, port))
}

/// Read the destination's response head, enforce the status allow-list,
/// inject `X-Proxy-Info`, forward the rewritten head to the client, then
/// fall back to a bidirectional byte copy for the rest of the exchange.
async fn relay_http_response(
	client: &mut TcpStream,
	conn: &mut ProxyConn,
	proxy_addr: &str,
	allowed_codes: Option<&[u16]>,
	deadline: std::time::Duration,
) -> Result<(), ProxyError> {
	let (head, status) = read_response_head(conn, deadline).await?;
	if let Some(allowed) = allowed_codes {
		if !allowed.contains(&status) {
			return Err(ProxyError::BadStatus(status));
		}
	}
	let rewritten = inject_proxy_info(&head, proxy_addr);
	client.write_all(&rewritten).await.map_err(|_| ProxyError::Send)?;
	copy_bidirectional(client, conn).await.map_err(|_| ProxyError::Recv)?;
	Ok(())
}

async fn read_response_head(conn: &mut ProxyConn, deadline: std::time::Duration) -> Result<(String, u16), ProxyError> {
	let read = async {
		let mut buf = Vec::new();
		let mut byte = [0u8; 1];
		loop {
			let n = conn.read(&mut byte).await.map_err(|_| ProxyError::Recv)?;
			if n == 0 {
				return Err(ProxyError::EmptyRecv);
			}
			buf.push(byte[0]);
			if buf.ends_with(b"\r\n\r\n") || buf.len() > MAX_RESPONSE_HEAD {
				break;
			}
		}
		Ok(buf)
	};
	let buf = match tokio::time::timeout(deadline, read).await {
		Ok(result) => result?,
		Err(_) => return Err(ProxyError::Timeout),
	};
	let head = String::from_utf8_lossy(&buf).into_owned();
	let status_line = head.lines().next().ok_or(ProxyError::BadStatusLine)?;
	let status: u16 = status_line
		.split_whitespace()
		.nth(1)
		.and_then(|s| s.parse().ok())
		.ok_or(ProxyError::BadStatusLine)?;
	Ok((head, status))
}

/// Insert `X-Proxy-Info: <host>:<port>` immediately before the header
/// terminator, preserving the rest of the response head byte-for-byte.
fn inject_proxy_info(head: &str, proxy_addr: &str) -> Vec<u8> {
	let trimmed = head.strip_suffix("\r\n\r\n").unwrap_or(head);
	format!("{trimmed}\r\nX-Proxy-Info: {proxy_addr}\r\n\r\n").into_bytes()
}

async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<RequestHead> {
	let mut buf = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		let n = stream.read(&mut byte).await?;
		if n == 0 {
			return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "client closed before sending a request"));
		}
		buf.push(byte[0]);
		if buf.ends_with(b"\r\n\r\n") || buf.len() > MAX_REQUEST_HEAD {
			break;
		}
	}
	let head_text = String::from_utf8_lossy(&buf).into_owned();
	let mut lines = head_text.split("\r\n");
	let request_line = lines.next().unwrap_or_default();
	let mut parts = request_line.split_whitespace();
	let method = parts.next().unwrap_or_default().to_string();
	let target = parts.next().unwrap_or_default().to_string();
	let version = parts.next().unwrap_or_default().to_string();

	let mut headers = Vec::new();
	for line in lines {
		if line.is_empty() {
			continue;
		}
		if let Some((k, v)) = line.split_once(':') {
			headers.push((k.trim().to_string(), v.trim().to_string()));
		}
	}

	let mut raw = buf;
	if let Some(len) = headers
		.iter()
		.find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
		.and_then(|(_, v)| v.parse::<usize>().ok())
	{
		let mut body = vec![0u8; len];
		stream.read_exact(&mut body).await?;
		raw.extend_from_slice(&body);
	}

	Ok(RequestHead {
		method,
		target,
		version,
		headers,
		raw,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn head(method: &str, target: &str, host: &str) -> RequestHead {
		RequestHead {
			method: method.to_string(),
			target: target.to_string(),
			version: "HTTP/1.1".to_string(),
			headers: vec![("Host".to_string(), host.to_string())],
			raw: Vec::new(),
		}
	}

	#[test]
	fn parses_connect_destination() {
		let h = head("CONNECT", "example.com:443", "example.com:443");
		assert_eq!(parse_destination(&h, Scheme::Https), Some(("example.com".to_string(), 443)));
	}

	#[test]
	fn parses_http_destination_from_relative_target() {
		let h = head("GET", "/path", "example.com");
		assert_eq!(parse_destination(&h, Scheme::Http), Some(("example.com".to_string(), 80)));
	}

	#[test]
	fn parses_http_destination_from_absolute_target() {
		let h = head("GET", "http://example.com:8080/path", "example.com:8080");
		assert_eq!(parse_destination(&h, Scheme::Http), Some(("example.com".to_string(), 8080)));
	}

	#[test]
	fn inject_proxy_info_lands_before_header_terminator() {
		let head = "HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n";
		let rewritten = String::from_utf8(inject_proxy_info(head, "203.0.113.9:8080")).unwrap();
		assert_eq!(rewritten, "HTTP/1.1 200 OK\r\nContent-Length: 3\r\nX-Proxy-Info: 203.0.113.9:8080\r\n\r\n");
	}

	#[tokio::test]
	async fn relay_http_response_rejects_status_outside_allow_list() {
		let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let upstream_addr = upstream_listener.local_addr().unwrap();
		let upstream_task = tokio::spawn(async move {
			let (mut sock, _) = upstream_listener.accept().await.unwrap();
			sock.write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n").await.unwrap();
		});
		let mut conn = ProxyConn::Plain(TcpStream::connect(upstream_addr).await.unwrap());

		let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let client_addr = client_listener.local_addr().unwrap();
		let client_accept = tokio::spawn(async move { client_listener.accept().await.unwrap().0 });
		let mut client = TcpStream::connect(client_addr).await.unwrap();
		let _peer_side = client_accept.await.unwrap();
		upstream_task.await.unwrap();

		let err = relay_http_response(&mut client, &mut conn, "203.0.113.9:8080", Some(&[200, 204]), std::time::Duration::from_secs(2))
			.await
			.unwrap_err();
		assert!(matches!(err, ProxyError::BadStatus(500)));
	}
}
