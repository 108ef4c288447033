//! The fabric message model and its encode/decode seam.
//!
//! Spec treats "the on-wire message encoding" as an opaque, externally
//! specified encode/decode pair — the core only requires that
//! `decode(encode(m))` is lossless for the fields below. [`Codec`] is that
//! seam; [`JsonCodec`] is the one concrete implementation this crate ships.
use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::MessageId;

/// Fields shared by every message kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	pub message_id: MessageId,
	pub source_client_id: String,
	pub source_broker_id: Option<String>,
	pub destination_topic: String,
	#[serde(with = "bytes_as_base64")]
	pub payload: Bytes,
	pub other_fields: HashMap<String, String>,
}

impl Envelope {
	pub fn new(source_client_id: impl Into<String>, destination_topic: impl Into<String>) -> Self {
		Self {
			message_id: uuid::Uuid::new_v4(),
			source_client_id: source_client_id.into(),
			source_broker_id: None,
			destination_topic: destination_topic.into(),
			payload: Bytes::new(),
			other_fields: HashMap::new(),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
	#[serde(flatten)]
	pub envelope: Envelope,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
	#[serde(flatten)]
	pub envelope: Envelope,
	pub reply_to_topic: String,
	pub service_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
	#[serde(flatten)]
	pub envelope: Envelope,
	pub request_message_id: MessageId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
	#[serde(flatten)]
	pub envelope: Envelope,
	pub request_message_id: MessageId,
	pub error_code: i32,
	pub error_message: String,
}

/// A message kind discriminant, used to pick which [`crate::callback::CallbackRegistry`]
/// a decoded [`Message`] is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
	Event,
	Request,
	Response,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Message {
	Event(Event),
	Request(Request),
	Response(Response),
	ErrorResponse(ErrorResponse),
}

impl Message {
	pub fn envelope(&self) -> &Envelope {
		match self {
			Message::Event(m) => &m.envelope,
			Message::Request(m) => &m.envelope,
			Message::Response(m) => &m.envelope,
			Message::ErrorResponse(m) => &m.envelope,
		}
	}

	pub fn envelope_mut(&mut self) -> &mut Envelope {
		match self {
			Message::Event(m) => &mut m.envelope,
			Message::Request(m) => &mut m.envelope,
			Message::Response(m) => &mut m.envelope,
			Message::ErrorResponse(m) => &mut m.envelope,
		}
	}

	pub fn message_id(&self) -> MessageId {
		self.envelope().message_id
	}

	pub fn destination_topic(&self) -> &str {
		&self.envelope().destination_topic
	}

	pub fn kind(&self) -> MessageKind {
		match self {
			Message::Event(_) => MessageKind::Event,
			Message::Request(_) => MessageKind::Request,
			Message::Response(_) | Message::ErrorResponse(_) => MessageKind::Response,
		}
	}

	/// The `requestMessageId` of a [`Response`] or [`ErrorResponse`], if this is one.
	pub fn request_message_id(&self) -> Option<MessageId> {
		match self {
			Message::Response(m) => Some(m.request_message_id),
			Message::ErrorResponse(m) => Some(m.request_message_id),
			_ => None,
		}
	}
}

/// The encode/decode contract for [`Message`]s. The wire format itself is out
/// of scope for this crate — implementors are free to use any serialization
/// that preserves `message_id`, `payload`, `other_fields`, `destination_topic`,
/// and kind-specific fields across a round trip.
pub trait Codec: Send + Sync {
	fn encode(&self, message: &Message) -> crate::Result<Bytes>;
	fn decode(&self, bytes: &[u8]) -> crate::Result<Message>;
}

/// The default [`Codec`], backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
	fn encode(&self, message: &Message) -> crate::Result<Bytes> {
		serde_json::to_vec(message)
			.map(Bytes::from)
			.map_err(|error| crate::Error::Codec(error.to_string()))
	}

	fn decode(&self, bytes: &[u8]) -> crate::Result<Message> {
		serde_json::from_slice(bytes).map_err(|error| crate::Error::Codec(error.to_string()))
	}
}

mod bytes_as_base64 {
	use base64::Engine;
	use bytes::Bytes;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
		let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
		serializer.serialize_str(&encoded)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
		let encoded = String::deserialize(deserializer)?;
		base64::engine::general_purpose::STANDARD
			.decode(encoded)
			.map(Bytes::from)
			.map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_request() -> Message {
		let mut envelope = Envelope::new("client-1", "/svc/echo");
		envelope.payload = Bytes::from_static(b"hello");
		envelope
			.other_fields
			.insert("trace".into(), "abc123".into());

		Message::Request(Request {
			envelope,
			reply_to_topic: "/mcafee/client/client-1".into(),
			service_id: Some("svc-instance-1".into()),
		})
	}

	#[test]
	fn json_codec_round_trips_request_fields() {
		let codec = JsonCodec;
		let original = sample_request();

		let encoded = codec.encode(&original).unwrap();
		let decoded = codec.decode(&encoded).unwrap();

		assert_eq!(decoded.message_id(), original.message_id());
		assert_eq!(decoded.destination_topic(), original.destination_topic());
		assert_eq!(decoded.envelope().payload, original.envelope().payload);
		assert_eq!(
			decoded.envelope().other_fields,
			original.envelope().other_fields
		);
		assert_eq!(decoded, original);
	}

	#[test]
	fn json_codec_round_trips_error_response() {
		let codec = JsonCodec;
		let mut envelope = Envelope::new("client-1", "/mcafee/client/client-1");
		envelope.payload = Bytes::new();
		let original = Message::ErrorResponse(ErrorResponse {
			envelope,
			request_message_id: uuid::Uuid::new_v4(),
			error_code: 9090,
			error_message: "My error".into(),
		});

		let encoded = codec.encode(&original).unwrap();
		let decoded = codec.decode(&encoded).unwrap();
		assert_eq!(decoded, original);
	}
}
