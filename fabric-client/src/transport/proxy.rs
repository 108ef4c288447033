//! HTTP `CONNECT` tunneling for the proxied transport path.
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::ProxyConfig;
use crate::error::{Error, Result};

/// Issues an `HTTP CONNECT origin_host:origin_port` request over `stream`
/// and consumes the proxy's response line and headers, leaving `stream`
/// positioned to start a TLS handshake with the origin.
pub async fn connect_tunnel(
	stream: &mut TcpStream,
	origin_host: &str,
	origin_port: u16,
	proxy: &ProxyConfig,
) -> Result<()> {
	let mut request = format!(
		"CONNECT {origin_host}:{origin_port} HTTP/1.1\r\nHost: {origin_host}:{origin_port}\r\n"
	);

	if let Some(username) = &proxy.username {
		let password = proxy.password.as_deref().unwrap_or("");
		let credentials = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
		request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
	}
	request.push_str("\r\n");

	stream
		.write_all(request.as_bytes())
		.await
		.map_err(|e| Error::Transport(format!("failed to write CONNECT request: {e}")))?;

	let status_line = read_status_line(stream).await?;
	let status_code = parse_status_code(&status_line)?;
	if !(200..300).contains(&status_code) {
		return Err(Error::Transport(format!(
			"proxy refused CONNECT tunnel: {status_line}"
		)));
	}

	Ok(())
}

async fn read_status_line(stream: &mut TcpStream) -> Result<String> {
	let mut buffer = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		let n = stream
			.read(&mut byte)
			.await
			.map_err(|e| Error::Transport(format!("failed reading CONNECT response: {e}")))?;
		if n == 0 {
			return Err(Error::Transport(
				"proxy closed connection before a CONNECT response".into(),
			));
		}
		buffer.push(byte[0]);
		if buffer.ends_with(b"\r\n") {
			break;
		}
	}

	// Drain the remaining header block up to the blank line terminator; the
	// headers themselves aren't inspected.
	loop {
		let mut line = Vec::new();
		loop {
			stream
				.read_exact(&mut byte)
				.await
				.map_err(|e| Error::Transport(format!("failed reading CONNECT headers: {e}")))?;
			line.push(byte[0]);
			if line.ends_with(b"\r\n") {
				break;
			}
		}
		if line == b"\r\n" {
			break;
		}
	}

	String::from_utf8(buffer)
		.map_err(|_| Error::Transport("non-UTF8 CONNECT status line".into()))
}

fn parse_status_code(status_line: &str) -> Result<u16> {
	status_line
		.split_whitespace()
		.nth(1)
		.and_then(|code| code.parse().ok())
		.ok_or_else(|| Error::Transport(format!("malformed CONNECT status line: {status_line:?}")))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::net::TcpListener;

	#[tokio::test]
	async fn sends_connect_request_with_basic_auth_and_accepts_200() {
		let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
		let addr = listener.local_addr().unwrap();

		let server = tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			let mut buf = vec![0u8; 4096];
			let n = socket.read(&mut buf).await.unwrap();
			let request = String::from_utf8_lossy(&buf[..n]).to_string();
			socket
				.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
				.await
				.unwrap();
			request
		});

		let mut client = TcpStream::connect(addr).await.unwrap();
		let proxy = ProxyConfig {
			host: addr.ip().to_string(),
			port: addr.port(),
			username: Some("alice".into()),
			password: Some("secret".into()),
		};

		connect_tunnel(&mut client, "broker.example.com", 8883, &proxy)
			.await
			.unwrap();

		let request = server.await.unwrap();
		assert!(request.starts_with("CONNECT broker.example.com:8883 HTTP/1.1"));
		assert!(request.contains("Proxy-Authorization: Basic"));
	}

	#[tokio::test]
	async fn rejects_non_2xx_status() {
		let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
		let addr = listener.local_addr().unwrap();

		tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			let mut buf = vec![0u8; 4096];
			let _ = socket.read(&mut buf).await.unwrap();
			socket
				.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
				.await
				.unwrap();
		});

		let mut client = TcpStream::connect(addr).await.unwrap();
		let proxy = ProxyConfig {
			host: addr.ip().to_string(),
			port: addr.port(),
			username: None,
			password: None,
		};

		let result = connect_tunnel(&mut client, "broker.example.com", 8883, &proxy).await;
		assert!(result.is_err());
	}
}
