//! Wire-level negotiation for each of the six strategies: explicit
//! `read_exact`/packed structs over the raw socket rather than a parser
//! combinator, matching how a SOCKS5 handshake reads elsewhere in this
//! codebase's surrounding ecosystem.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::error::ProxyError;
use crate::types::conn::ProxyConn;
use crate::types::Protocol;

/// The host this negotiation is ultimately reaching, i.e. a judge's
/// resolved address.
#[derive(Debug, Clone)]
pub struct NegotiationTarget {
	pub host: String,
	pub ip: IpAddr,
	pub port: u16,
}

static SYSTEM_ROOTS: Lazy<rustls_native_certs::CertificateResult> = Lazy::new(rustls_native_certs::load_native_certs);

fn tls_connector() -> TlsConnector {
	let mut roots = rustls::RootCertStore::empty();
	for cert in &SYSTEM_ROOTS.certs {
		let _ = roots.add(cert.clone());
	}
	let config = rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	TlsConnector::from(Arc::new(config))
}

/// Run the negotiation strategy for `proto` against `target` over `conn`,
/// returning the (possibly replaced, for `HTTPS`) transport to use for the
/// actual judge request that follows.
pub async fn negotiate(mut conn: ProxyConn, proto: Protocol, target: &NegotiationTarget, deadline: Duration) -> Result<ProxyConn, ProxyError> {
	match timeout(deadline, negotiate_inner(&mut conn, proto, target)).await {
		Ok(Ok(replacement)) => Ok(replacement.unwrap_or(conn)),
		Ok(Err(e)) => Err(e),
		Err(_) => Err(ProxyError::Timeout),
	}
}

async fn negotiate_inner(
	conn: &mut ProxyConn,
	proto: Protocol,
	target: &NegotiationTarget,
) -> Result<Option<ProxyConn>, ProxyError> {
	match proto {
		Protocol::Http => Ok(None),
		Protocol::Connect80 => {
			connect_request(conn, target).await?;
			Ok(None)
		}
		Protocol::Connect25 => {
			connect_request(conn, target).await?;
			let mut banner = [0u8; 3];
			conn.read_exact(&mut banner).await.map_err(|_| ProxyError::Recv)?;
			if &banner != b"220" {
				return Err(ProxyError::BadResponse);
			}
			Ok(None)
		}
		Protocol::Https => {
			connect_request(conn, target).await?;
			Ok(None)
		}
		Protocol::Socks4 => {
			socks4_handshake(conn, target).await?;
			Ok(None)
		}
		Protocol::Socks5 => {
			socks5_handshake(conn, target).await?;
			Ok(None)
		}
	}
}

/// Upgrade an already-CONNECT-tunneled transport to TLS (the `HttpsNgtr`
/// branch that calls `proxy.connect(ssl=True)` after a successful
/// `CONNECT` to port 443). Kept distinct from [`negotiate`] since it
/// replaces the transport, which only the judge-request caller (who knows
/// whether it actually wants an HTTPS body fetch) should decide to do.
pub async fn upgrade_tls(conn: ProxyConn, server_name: &str) -> Result<ProxyConn, ProxyError> {
	let ProxyConn::Plain(stream) = conn else {
		return Err(ProxyError::Conn);
	};
	let name = ServerName::try_from(server_name.to_string()).map_err(|_| ProxyError::Conn)?;
	let tls = tls_connector().connect(name, stream).await.map_err(|_| ProxyError::Conn)?;
	Ok(ProxyConn::Tls(Box::new(tls)))
}

async fn connect_request(conn: &mut ProxyConn, target: &NegotiationTarget) -> Result<(), ProxyError> {
	let req = format!(
		"CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nUser-Agent: PxBroker\r\nConnection: keep-alive\r\n\r\n",
		host = target.host,
		port = target.port,
	);
	conn.write_all(req.as_bytes()).await.map_err(|_| ProxyError::Send)?;
	conn.flush().await.map_err(|_| ProxyError::Send)?;

	let mut buf = Vec::with_capacity(256);
	let mut byte = [0u8; 1];
	loop {
		let n = conn.read(&mut byte).await.map_err(|_| ProxyError::Recv)?;
		if n == 0 {
			return Err(ProxyError::EmptyRecv);
		}
		buf.push(byte[0]);
		if buf.ends_with(b"\r\n\r\n") || buf.len() > 8192 {
			break;
		}
	}
	let head = String::from_utf8_lossy(&buf);
	let status_line = head.lines().next().ok_or(ProxyError::BadStatusLine)?;
	let status: u16 = status_line
		.split_whitespace()
		.nth(1)
		.and_then(|s| s.parse().ok())
		.ok_or(ProxyError::BadStatusLine)?;
	if status != 200 {
		return Err(ProxyError::BadStatus(status));
	}
	Ok(())
}

fn ipv4_octets(ip: IpAddr) -> Result<[u8; 4], ProxyError> {
	match ip {
		IpAddr::V4(v4) => Ok(v4.octets()),
		IpAddr::V6(_) => Err(ProxyError::BadResponse),
	}
}

async fn socks4_handshake(conn: &mut ProxyConn, target: &NegotiationTarget) -> Result<(), ProxyError> {
	let octets = ipv4_octets(target.ip)?;
	let mut req = Vec::with_capacity(9);
	req.push(4u8);
	req.push(1u8);
	req.extend_from_slice(&target.port.to_be_bytes());
	req.extend_from_slice(&octets);
	req.push(0u8);
	conn.write_all(&req).await.map_err(|_| ProxyError::Send)?;
	conn.flush().await.map_err(|_| ProxyError::Send)?;

	let mut resp = [0u8; 8];
	conn.read_exact(&mut resp).await.map_err(|_| ProxyError::Recv)?;
	if resp[1] != 0x5A {
		return Err(ProxyError::BadResponse);
	}
	Ok(())
}

async fn socks5_handshake(conn: &mut ProxyConn, target: &NegotiationTarget) -> Result<(), ProxyError> {
	conn.write_all(&[5, 1, 0]).await.map_err(|_| ProxyError::Send)?;
	conn.flush().await.map_err(|_| ProxyError::Send)?;
	let mut greeting = [0u8; 2];
	conn.read_exact(&mut greeting).await.map_err(|_| ProxyError::Recv)?;
	if greeting[0] != 5 || greeting[1] != 0x00 {
		return Err(ProxyError::BadResponse);
	}

	let octets = ipv4_octets(target.ip)?;
	let mut req = Vec::with_capacity(10);
	req.extend_from_slice(&[5, 1, 0, 1]);
	req.extend_from_slice(&octets);
	req.extend_from_slice(&target.port.to_be_bytes());
	conn.write_all(&req).await.map_err(|_| ProxyError::Send)?;
	conn.flush().await.map_err(|_| ProxyError::Send)?;

	let mut resp = [0u8; 10];
	conn.read_exact(&mut resp).await.map_err(|_| ProxyError::Recv)?;
	if resp[0] != 5 || resp[1] != 0 {
		return Err(ProxyError::BadResponse);
	}
	Ok(())
}

/// Resolve a target into the form [`negotiate`] expects, from a
/// judge's already-resolved IP (avoids re-resolving per check).
pub fn target_from_socket(host: impl Into<String>, addr: SocketAddr) -> NegotiationTarget {
	NegotiationTarget {
		host: host.into(),
		ip: addr.ip(),
		port: addr.port(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ipv4_octets_rejects_v6() {
		let ip: IpAddr = "::1".parse().unwrap();
		assert!(matches!(ipv4_octets(ip), Err(ProxyError::BadResponse)));
	}

	#[test]
	fn ipv4_octets_extracts_bytes() {
		let ip: IpAddr = Ipv4Addr::new(10, 0, 0, 1).into();
		assert_eq!(ipv4_octets(ip).unwrap(), [10, 0, 0, 1]);
	}
}
