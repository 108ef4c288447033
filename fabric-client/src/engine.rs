//! The integration glue between the transport layer and the MQTT wire
//! protocol: owns the connected socket, drives the CONNECT handshake, and
//! shuttles PUBLISH/SUBSCRIBE/PINGREQ frames to and from it.
//!
//! The on-wire encoding of MQTT packets themselves is handled by `mqttbytes`
//! (MQTT 3.1.1 / v4) -- this module is the part that's actually in scope:
//! reading the socket, keeping the connection alive, and translating
//! fabric-level publish/subscribe calls into packets.
use std::time::Duration;

use bytes::BytesMut;
use mqttbytes::v4::{
	Connect, ConnectReturnCode, Packet, PingReq, Publish, Subscribe, SubscribeFilter, Unsubscribe,
};
use mqttbytes::QoS;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::transport::BoxedStream;

/// Default read buffer growth increment and max single-packet size.
const READ_CHUNK: usize = 4 * 1024;
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// A raw decoded publish, handed up to the dispatcher.
pub struct IncomingPublish {
	pub topic: String,
	pub payload: Vec<u8>,
}

/// Commands the connection manager can issue to a running engine task.
pub enum Command {
	Publish { topic: String, payload: Vec<u8>, qos: QoS },
	Subscribe { topics: Vec<String> },
	Unsubscribe { topics: Vec<String> },
	Disconnect,
}

/// Runs the MQTT session on `stream` until it is closed, an unrecoverable
/// protocol error occurs, or [`Command::Disconnect`] is received.
///
/// This owns the socket for its entire lifetime -- callers get a fresh
/// [`Command`] sender and incoming-publish receiver per call, matching one
/// TCP/TLS connection to one `run` invocation.
pub async fn run(
	mut stream: BoxedStream,
	client_id: String,
	keep_alive: Duration,
	clean_session: bool,
	mut commands: mpsc::Receiver<Command>,
	incoming: mpsc::Sender<IncomingPublish>,
) -> Result<()> {
	connect_handshake(&mut stream, &client_id, keep_alive, clean_session).await?;
	debug!(client_id, "mqtt session established");

	let mut read_buffer = BytesMut::with_capacity(READ_CHUNK);
	let mut read_chunk = vec![0u8; READ_CHUNK];
	let ping_interval = (keep_alive / 2).max(Duration::from_secs(1));
	let mut next_ping = Instant::now() + ping_interval;

	loop {
		tokio::select! {
			biased;

			command = commands.recv() => {
				let Some(command) = command else {
					return Ok(());
				};
				match command {
					Command::Publish { topic, payload, qos } => {
						let mut packet = Publish::new(topic, qos, payload);
						packet.pkid = 0;
						write_packet(&mut stream, Packet::Publish(packet)).await?;
					}
					Command::Subscribe { topics } => {
						let filters = topics
							.into_iter()
							.map(|path| SubscribeFilter::new(path, QoS::AtMostOnce))
							.collect();
						let packet = Subscribe { pkid: 1, filters };
						write_packet(&mut stream, Packet::Subscribe(packet)).await?;
					}
					Command::Unsubscribe { topics } => {
						let packet = Unsubscribe { pkid: 1, topics };
						write_packet(&mut stream, Packet::Unsubscribe(packet)).await?;
					}
					Command::Disconnect => {
						write_packet(&mut stream, Packet::Disconnect).await?;
						return Ok(());
					}
				}
			}

			_ = tokio::time::sleep_until(next_ping) => {
				trace!(client_id, "sending keep-alive pingreq");
				write_packet(&mut stream, Packet::PingReq).await?;
				next_ping = Instant::now() + ping_interval;
			}

			read_result = stream.read(&mut read_chunk) => {
				let n = read_result.map_err(|e| Error::Transport(format!("read failed: {e}")))?;
				if n == 0 {
					return Err(Error::Transport("connection closed by broker".into()));
				}
				read_buffer.extend_from_slice(&read_chunk[..n]);

				loop {
					match mqttbytes::v4::read(&mut read_buffer, MAX_PACKET_SIZE) {
						Ok(Packet::Publish(publish)) => {
							let message = IncomingPublish {
								topic: publish.topic,
								payload: publish.payload.to_vec(),
							};
							if incoming.send(message).await.is_err() {
								return Ok(());
							}
						}
						Ok(Packet::PingResp) => trace!(client_id, "pingresp"),
						Ok(other) => trace!(client_id, packet = ?other, "ignoring control packet"),
						Err(mqttbytes::Error::InsufficientBytes(_)) => break,
						Err(error) => {
							return Err(Error::Transport(format!("malformed mqtt packet: {error}")));
						}
					}
				}
			}
		}
	}
}

async fn connect_handshake(
	stream: &mut BoxedStream,
	client_id: &str,
	keep_alive: Duration,
	clean_session: bool,
) -> Result<()> {
	let mut connect = Connect::new(client_id);
	connect.keep_alive = keep_alive.as_secs().min(u16::MAX as u64) as u16;
	connect.clean_session = clean_session;
	write_packet(stream, Packet::Connect(connect)).await?;

	let mut buffer = BytesMut::with_capacity(READ_CHUNK);
	let mut chunk = vec![0u8; READ_CHUNK];
	loop {
		match mqttbytes::v4::read(&mut buffer, MAX_PACKET_SIZE) {
			Ok(Packet::ConnAck(ack)) => {
				return match ack.code {
					ConnectReturnCode::Success => Ok(()),
					other => Err(Error::ConnectFailed(format!("broker rejected CONNECT: {other:?}"))),
				};
			}
			Ok(other) => {
				warn!(packet = ?other, "unexpected packet before connack");
			}
			Err(mqttbytes::Error::InsufficientBytes(_)) => {
				let n = stream
					.read(&mut chunk)
					.await
					.map_err(|e| Error::Transport(format!("read failed during handshake: {e}")))?;
				if n == 0 {
					return Err(Error::Transport("connection closed during handshake".into()));
				}
				buffer.extend_from_slice(&chunk[..n]);
			}
			Err(error) => {
				return Err(Error::Transport(format!("malformed connack: {error}")));
			}
		}
	}
}

async fn write_packet(stream: &mut BoxedStream, packet: Packet) -> Result<()> {
	let mut buffer = BytesMut::new();
	match packet {
		Packet::Connect(p) => p.write(&mut buffer),
		Packet::Publish(p) => p.write(&mut buffer),
		Packet::Subscribe(p) => p.write(&mut buffer),
		Packet::Unsubscribe(p) => p.write(&mut buffer),
		Packet::PingReq => PingReq.write(&mut buffer),
		Packet::Disconnect => mqttbytes::v4::Disconnect.write(&mut buffer),
		other => {
			return Err(Error::Transport(format!(
				"attempted to write unsupported packet {other:?}"
			)));
		}
	}
	.map_err(|error| Error::Transport(format!("failed to encode mqtt packet: {error}")))?;

	stream
		.write_all(&buffer)
		.await
		.map_err(|e| Error::Transport(format!("write failed: {e}")))?;
	stream
		.flush()
		.await
		.map_err(|e| Error::Transport(format!("flush failed: {e}")))
}
