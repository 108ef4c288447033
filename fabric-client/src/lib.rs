//! # fabric-client
//!
//! A client library for a publish/subscribe message fabric built atop MQTT.
//!
//! The fabric carries three message kinds — [`Event`](message::Message::Event),
//! [`Request`](message::Message::Request) and [`Response`](message::Message::Response)
//! — and layers a [`Service`](service::ServiceRegistration) abstraction on top of plain
//! pub/sub: a client registers a service that advertises a set of request topics,
//! receives [`Request`](message::Message::Request)s on them, and replies on the
//! caller's per-client reply topic.
#![allow(clippy::tabs_in_doc_comments)]

pub mod broker;
pub mod callback;
pub mod client;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod message;
pub mod service;
pub mod topics;
pub mod transport;

pub use self::{
	broker::Broker,
	client::Client,
	config::FabricClientConfig,
	error::{Error, Result},
	message::{ErrorResponse, Event, Message, MessageKind, Request, Response},
};

/// A globally unique identifier for a [`Message`].
pub type MessageId = uuid::Uuid;
