//! The error taxonomy for the fabric client.
//!
//! Each variant corresponds to one of the error kinds in the core design:
//! parsing/validation errors are returned without retry, publish/subscribe
//! errors surface immediately, and a lost transport is *not* surfaced
//! synchronously — see [`crate::connection`] for the `DisconnectedStrategy`.
use crate::broker::MalformedBroker;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Well-known error code carried by an [`crate::message::ErrorResponse`] when a
/// [`crate::message::Request`] targets a `serviceId` the client does not know about.
pub const FABRIC_SERVICE_UNAVAILABLE: i32 = -1;

#[derive(Debug, Error)]
pub enum Error {
	#[error("malformed broker: {0}")]
	MalformedBroker(#[from] MalformedBroker),

	#[error("configuration error: {0}")]
	Config(String),

	#[error("client is not connected")]
	NotConnected,

	#[error("client has not been initialized")]
	NotInitialized,

	#[error("failed to connect after exhausting retries: {0}")]
	ConnectFailed(String),

	#[error("failed to publish: {0}")]
	PublishError(String),

	#[error("failed to subscribe or unsubscribe: {0}")]
	SubscribeError(String),

	#[error("timed out waiting for a response")]
	WaitTimeout,

	#[error("syncRequest called from a dispatcher worker thread (different thread required)")]
	WrongThread,

	#[error("no service is registered with instance id {0:?}")]
	ServiceUnknown(String),

	#[error("a different service is already registered with instance id {0:?}")]
	ServiceAlreadyRegistered(String),

	#[error("message codec error: {0}")]
	Codec(String),

	#[error("tls/transport error: {0}")]
	Transport(String),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

impl Error {
	/// `true` for errors that are pointless to retry (parse/validation/logic
	/// errors), as opposed to transient transport failures.
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			Error::MalformedBroker(_)
				| Error::Config(_)
				| Error::NotInitialized
				| Error::WrongThread
				| Error::ServiceAlreadyRegistered(_)
				| Error::ServiceUnknown(_)
		)
	}
}
