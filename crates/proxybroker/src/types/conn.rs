//! A proxy's live transport as a single owned variant rather than two
//! independently-held plain/TLS slots: once `upgrade_tls` upgrades the
//! transport the plain `TcpStream` is consumed into the TLS stream, so
//! there is never more than one live handle to drop, and dropping it
//! always closes the full chain.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

pub enum ProxyConn {
	Plain(TcpStream),
	Tls(Box<TlsStream<TcpStream>>),
}

impl ProxyConn {
	pub fn is_tls(&self) -> bool {
		matches!(self, ProxyConn::Tls(_))
	}
}

impl AsyncRead for ProxyConn {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			ProxyConn::Plain(s) => Pin::new(s).poll_read(cx, buf),
			ProxyConn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for ProxyConn {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		match self.get_mut() {
			ProxyConn::Plain(s) => Pin::new(s).poll_write(cx, buf),
			ProxyConn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			ProxyConn::Plain(s) => Pin::new(s).poll_flush(cx),
			ProxyConn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			ProxyConn::Plain(s) => Pin::new(s).poll_shutdown(cx),
			ProxyConn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}
