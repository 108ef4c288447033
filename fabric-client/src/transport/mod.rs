//! Transport factory: turns a [`crate::broker::Broker`] into a connected,
//! readable/writable byte stream, handling TLS and (optionally) an HTTP
//! CONNECT proxy tunnel along the way.
mod proxy;
mod tls;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{rustls::ServerName, TlsConnector};

use crate::broker::{Broker, Protocol};
use crate::error::{Error, Result};

pub use tls::{TlsMaterial, TrustBundle};

/// HTTP proxy to tunnel the TLS connection through, per `ClientConfig::Proxy`.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
	pub host: String,
	pub port: u16,
	pub username: Option<String>,
	pub password: Option<String>,
}

/// Everything needed to open a transport to a single broker.
#[derive(Clone)]
pub struct TransportConfig {
	pub trust: Arc<TrustBundle>,
	pub proxy: Option<ProxyConfig>,
}

/// A connected, framed byte stream, boxed so the rest of the crate doesn't
/// need to care whether it's direct TLS or a proxy-tunneled one.
pub type BoxedStream = Box<dyn ReadWrite>;

pub trait ReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ReadWrite for T {}

/// Connects to `broker`, performing the TLS handshake (and proxy tunnel, if
/// configured) appropriate to its [`Protocol`].
///
/// `dial_host` is the address actually dialed over TCP -- the broker's
/// hostname on the first attempt, its `ipAddress` on a hostname-probe
/// fallback (see [`crate::broker::rank`]) -- while TLS verification always
/// uses the broker's hostname for SNI, per the origin-hostname rule that
/// also governs the proxied path.
pub async fn connect(broker: &Broker, dial_host: &str, config: &TransportConfig) -> Result<BoxedStream> {
	let tcp = match &config.proxy {
		Some(proxy) => {
			tracing::debug!(host = %proxy.host, port = proxy.port, "connecting via proxy");
			let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
				.await
				.map_err(|e| Error::Transport(format!("proxy tcp connect failed: {e}")))?;
			self::proxy::connect_tunnel(&mut stream, &broker.host_name, broker.port, proxy).await?;
			stream
		}
		None => {
			tracing::debug!(host = dial_host, port = broker.port, "connecting directly");
			TcpStream::connect((dial_host, broker.port))
				.await
				.map_err(|e| Error::Transport(format!("tcp connect failed: {e}")))?
		}
	};
	tcp.set_nodelay(true)
		.map_err(|e| Error::Transport(format!("set_nodelay failed: {e}")))?;

	match broker.protocol {
		Protocol::Ssl | Protocol::Wss => {
			let tls_config = tls::client_config(&config.trust)?;
			let connector = TlsConnector::from(tls_config);
			let server_name = ServerName::try_from(broker.host_name.as_str())
				.map_err(|_| Error::Transport(format!("invalid SNI host name {:?}", broker.host_name)))?;
			let tls_stream = connector
				.connect(server_name, tcp)
				.await
				.map_err(|e| Error::Transport(format!("tls handshake failed: {e}")))?;
			Ok(Box::new(tls_stream))
		}
	}
}
