//! The public client façade: thin glue tying the connection manager,
//! dispatcher, request correlator and service registry into the operations
//! external callers actually use.
//!
//! Every operation here first checks [`Client::is_initialized`] (construction
//! failures or a prior `close()` both fail this check) before touching any of
//! the owned components.
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::broker::Broker;
use crate::callback::{Callback, CallbackId, CallbackRegistry, GLOBAL_TOPIC};
use crate::config::FabricClientConfig;
use crate::connection::{ConnectionManager, DisconnectedStrategy};
use crate::correlator::{AsyncCallback, RequestCorrelator};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result, FABRIC_SERVICE_UNAVAILABLE};
use crate::message::{Codec, Envelope, ErrorResponse, Event, JsonCodec, Message, MessageKind, Request, Response};
use crate::service::{RegistryHost, ServiceRegistration, ServiceRegistry};
use crate::topics;
use crate::transport::{TlsMaterial, TransportConfig, TrustBundle};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A connected (or connectable) client against one fabric.
///
/// Owns exactly one [`ConnectionManager`], one [`RequestCorrelator`], one
/// [`ServiceRegistry`], one [`Dispatcher`] (and thus one [`CallbackRegistry`]
/// per message kind), matching the data model's lifecycle rule.
pub struct Client {
	client_id: String,
	config: FabricClientConfig,
	codec: Arc<dyn Codec>,
	dispatcher: Arc<Dispatcher>,
	correlator: Arc<RequestCorrelator>,
	connection: Arc<ConnectionManager>,
	service_registry: OnceLock<Arc<ServiceRegistry<Client>>>,
	request_timeout: Duration,
	initialized: AtomicBool,
	background_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
	/// Builds a client from a parsed config. Reads the cert/key files named
	/// by `config.certs` from disk and derives the client's uniqueId from the
	/// client certificate's `CN`, falling back to a random id if the
	/// certificate carries none.
	pub async fn new(config: FabricClientConfig) -> Result<Arc<Self>> {
		let ca_pem = std::fs::read(&config.certs.broker_cert_chain)
			.map_err(|error| Error::Config(format!("failed to read broker cert chain: {error}")))?;
		let cert_pem = std::fs::read(&config.certs.cert_file)
			.map_err(|error| Error::Config(format!("failed to read client cert: {error}")))?;
		let key_pem = std::fs::read(&config.certs.private_key)
			.map_err(|error| Error::Config(format!("failed to read client key: {error}")))?;

		let trust = TrustBundle::from_pem(TlsMaterial {
			ca_bundle_pem: &ca_pem,
			client_cert_pem: Some(&cert_pem),
			client_key_pem: Some(&key_pem),
		})?;
		let client_id = trust
			.client_common_name()
			.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
		let trust = Arc::new(trust);

		let transport_config = TransportConfig {
			trust,
			proxy: config.proxy.clone(),
		};

		let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
		let dispatcher = Arc::new(Dispatcher::new(
			codec.clone(),
			crate::dispatch::DEFAULT_WORKER_COUNT,
			crate::dispatch::DEFAULT_QUEUE_DEPTH,
		));
		let correlator = RequestCorrelator::new();
		let connection = ConnectionManager::new(client_id.clone(), transport_config, dispatcher.clone());

		let client = Arc::new(Self {
			client_id,
			config,
			codec,
			dispatcher,
			correlator,
			connection,
			service_registry: OnceLock::new(),
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			initialized: AtomicBool::new(false),
			background_tasks: std::sync::Mutex::new(Vec::new()),
		});
		client.init().await?;
		Ok(client)
	}

	async fn init(self: &Arc<Self>) -> Result<()> {
		let registry = Arc::new(ServiceRegistry::new(self.clone()));
		let _ = self.service_registry.set(registry);

		let sweep = self.correlator.spawn_expiry_sweep(crate::correlator::DEFAULT_EXPIRY_SWEEP_INTERVAL);
		self.background_tasks.lock().unwrap().push(sweep);

		// The reply topic is always in the subscription set, per the data
		// model's "subscription set" invariant -- restored on every reconnect
		// along with everything else the caller has subscribed to.
		self.connection.subscribe(topics::reply_topic(&self.client_id)).await?;

		self.wire_response_routing().await;
		self.wire_service_request_routing().await;

		self.initialized.store(true, Ordering::SeqCst);
		Ok(())
	}

	/// Routes every incoming Response/ErrorResponse to the request correlator
	/// before user response callbacks see it.
	async fn wire_response_routing(self: &Arc<Self>) {
		let correlator = self.correlator.clone();
		self.dispatcher
			.responses
			.add(
				GLOBAL_TOPIC,
				Arc::new(move |message: &Message| {
					let correlator = correlator.clone();
					let message = message.clone();
					tokio::spawn(async move { correlator.on_response(message).await });
				}),
			)
			.await;
	}

	/// Dispatches an incoming Request addressed to a registered service's
	/// callback, or auto-replies `FABRIC_SERVICE_UNAVAILABLE` if its
	/// `serviceId` names no live registration.
	async fn wire_service_request_routing(self: &Arc<Self>) {
		let client = self.clone();
		self.dispatcher
			.requests
			.add(
				GLOBAL_TOPIC,
				Arc::new(move |message: &Message| {
					let Message::Request(request) = message else {
						return;
					};
					let Some(service_id) = request.service_id.clone() else {
						return;
					};
					let client = client.clone();
					let message = message.clone();
					tokio::spawn(async move {
						let known = client
							.service_registry()
							.on_request(Some(&service_id), &message)
							.await;
						if !known {
							if let Message::Request(request) = &message {
								client.reply_service_unavailable(request).await;
							}
						}
					});
				}),
			)
			.await;
	}

	async fn reply_service_unavailable(&self, request: &Request) {
		let mut envelope = Envelope::new(self.client_id.clone(), request.reply_to_topic.clone());
		envelope.source_broker_id = None;
		let error = Message::ErrorResponse(ErrorResponse {
			envelope,
			request_message_id: request.envelope.message_id,
			error_code: FABRIC_SERVICE_UNAVAILABLE,
			error_message: format!("service {:?} is not registered with this client", request.service_id),
		});
		if let Err(error_sending) = self.publish(&error).await {
			warn!(%error_sending, "failed to send service-unavailable error response");
		}
	}

	fn is_initialized(&self) -> bool {
		self.initialized.load(Ordering::SeqCst)
	}

	fn require_initialized(&self) -> Result<()> {
		if self.is_initialized() {
			Ok(())
		} else {
			Err(Error::NotInitialized)
		}
	}

	pub fn client_id(&self) -> &str {
		&self.client_id
	}

	pub fn get_config(&self) -> &FabricClientConfig {
		&self.config
	}

	fn service_registry(&self) -> &Arc<ServiceRegistry<Client>> {
		self.service_registry.get().expect("service_registry set during init")
	}

	fn candidate_brokers(&self) -> Vec<Broker> {
		if self.config.use_web_sockets {
			self.config.brokers_web_sockets.clone()
		} else {
			self.config.brokers.clone()
		}
	}

	/// Connects (or reconnects) to the fabric, retrying with backoff across
	/// the configured brokers until one accepts the connection.
	pub async fn connect(self: &Arc<Self>) -> Result<()> {
		self.require_initialized()?;
		self.connection.connect(self.candidate_brokers()).await?;
		self.service_registry().start_pending_loops().await;
		Ok(())
	}

	/// Disconnects without tearing down client-owned state; `connect()` can
	/// be called again afterwards.
	pub async fn disconnect(&self) -> Result<()> {
		self.require_initialized()?;
		self.service_registry().stop_all_loops().await;
		self.connection.disconnect().await;
		Ok(())
	}

	/// Disconnects and reconnects, re-asserting every subscription.
	pub async fn reconnect(self: &Arc<Self>) -> Result<()> {
		self.disconnect().await?;
		self.connect().await
	}

	/// Disconnects and marks the client unusable; every operation other than
	/// `close()` itself fails with [`Error::NotInitialized`] afterwards.
	/// Calling `close()` a second time is a no-op.
	pub async fn close(&self) {
		if !self.initialized.swap(false, Ordering::SeqCst) {
			return;
		}
		self.service_registry().stop_all_loops().await;
		self.connection.close().await;
		for task in self.background_tasks.lock().unwrap().drain(..) {
			task.abort();
		}
	}

	pub async fn is_connected(&self) -> bool {
		self.is_initialized() && self.connection.is_connected().await
	}

	pub async fn current_broker(&self) -> Option<Broker> {
		self.connection.current_broker().await
	}

	pub async fn set_disconnected_strategy(&self, strategy: DisconnectedStrategy) {
		self.connection.set_disconnected_strategy(strategy).await;
	}

	pub async fn subscribe(&self, topic: impl Into<String>) -> Result<()> {
		self.require_initialized()?;
		self.connection.subscribe(topic).await
	}

	pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
		self.require_initialized()?;
		self.connection.unsubscribe(topic).await
	}

	pub async fn get_subscriptions(&self) -> Result<HashSet<String>> {
		self.require_initialized()?;
		Ok(self.connection.subscriptions().await)
	}

	async fn publish(&self, message: &Message) -> Result<()> {
		let topic = message.destination_topic().to_string();
		let bytes = self.codec.encode(message)?;
		self.connection.publish(topic, bytes.to_vec()).await
	}

	/// Publishes an [`Event`] with `payload` on `topic`.
	pub async fn send_event(&self, topic: impl Into<String>, payload: impl Into<bytes::Bytes>) -> Result<()> {
		self.require_initialized()?;
		let mut envelope = Envelope::new(self.client_id.clone(), topic.into());
		envelope.payload = payload.into();
		self.publish(&Message::Event(Event { envelope })).await
	}

	/// Replies to `request` with a [`Response`] carrying `payload`, addressed
	/// to the request's `replyToTopic`.
	pub async fn send_response(&self, request: &Request, payload: impl Into<bytes::Bytes>) -> Result<()> {
		self.require_initialized()?;
		let mut envelope = Envelope::new(self.client_id.clone(), request.reply_to_topic.clone());
		envelope.payload = payload.into();
		let response = Message::Response(Response {
			envelope,
			request_message_id: request.envelope.message_id,
		});
		self.publish(&response).await
	}

	/// Replies to `request` with an [`ErrorResponse`].
	pub async fn send_error_response(
		&self,
		request: &Request,
		error_code: i32,
		error_message: impl Into<String>,
	) -> Result<()> {
		self.require_initialized()?;
		let envelope = Envelope::new(self.client_id.clone(), request.reply_to_topic.clone());
		let response = Message::ErrorResponse(ErrorResponse {
			envelope,
			request_message_id: request.envelope.message_id,
			error_code,
			error_message: error_message.into(),
		});
		self.publish(&response).await
	}

	fn new_request(&self, topic: impl Into<String>, payload: impl Into<bytes::Bytes>, service_id: Option<String>) -> Request {
		let mut envelope = Envelope::new(self.client_id.clone(), topic.into());
		envelope.payload = payload.into();
		Request {
			envelope,
			reply_to_topic: topics::reply_topic(&self.client_id),
			service_id,
		}
	}

	/// Sends a [`Request`] and blocks (without holding any registry lock)
	/// until a matching Response/ErrorResponse arrives or `timeout` elapses.
	///
	/// Fails fast with [`Error::WrongThread`] when called from a dispatcher
	/// worker task -- see [`crate::dispatch::on_worker`].
	pub async fn sync_request(
		&self,
		topic: impl Into<String>,
		payload: impl Into<bytes::Bytes>,
		service_id: Option<String>,
	) -> Result<Message> {
		self.require_initialized()?;
		self.sync_request_with_timeout(topic, payload, service_id, self.request_timeout).await
	}

	pub async fn sync_request_with_timeout(
		&self,
		topic: impl Into<String>,
		payload: impl Into<bytes::Bytes>,
		service_id: Option<String>,
		timeout: Duration,
	) -> Result<Message> {
		self.require_initialized()?;
		let request = self.new_request(topic, payload, service_id);
		self.correlate_request(request, timeout).await
	}

	/// Publishes `request` as-is (preserving its `otherFields`, unlike
	/// [`Client::sync_request_with_timeout`], which always builds a fresh
	/// one) and blocks for a matching Response/ErrorResponse.
	async fn correlate_request(&self, request: Request, timeout: Duration) -> Result<Message> {
		let message_id = request.envelope.message_id;
		let message = Message::Request(request);
		let bytes = self.codec.encode(&message)?;
		let topic = message.destination_topic().to_string();
		let connection = &self.connection;
		self.correlator
			.sync_request(message_id, timeout, || connection.publish(topic, bytes.to_vec()))
			.await
	}

	/// Sends a [`Request`] and invokes `callback` from a dispatcher worker
	/// task once a matching Response/ErrorResponse arrives, or never (silent
	/// GC) if `timeout` elapses first.
	pub async fn async_request(
		&self,
		topic: impl Into<String>,
		payload: impl Into<bytes::Bytes>,
		service_id: Option<String>,
		timeout: Duration,
		callback: AsyncCallback,
	) -> Result<()> {
		self.require_initialized()?;
		let request = self.new_request(topic, payload, service_id);
		let message_id = request.envelope.message_id;
		let message = Message::Request(request);
		let bytes = self.codec.encode(&message)?;
		let topic = message.destination_topic().to_string();
		let connection = &self.connection;
		self.correlator
			.async_request(message_id, timeout, Some(callback), || connection.publish(topic, bytes.to_vec()))
			.await
	}

	fn registry_for(&self, kind: MessageKind) -> &Arc<CallbackRegistry> {
		self.dispatcher.registry_for(kind)
	}

	pub async fn add_event_callback(
		&self,
		topic: impl Into<String>,
		auto_subscribe: bool,
		callback: Callback,
	) -> Result<CallbackId> {
		self.require_initialized()?;
		let topic = topic.into();
		if auto_subscribe && topic != GLOBAL_TOPIC {
			self.connection.subscribe(topic.clone()).await?;
		}
		Ok(self.registry_for(MessageKind::Event).add(topic, callback).await)
	}

	pub async fn remove_event_callback(&self, id: CallbackId) -> Result<bool> {
		self.require_initialized()?;
		Ok(self.registry_for(MessageKind::Event).remove(id).await)
	}

	pub async fn add_request_callback(&self, topic: impl Into<String>, callback: Callback) -> Result<CallbackId> {
		self.require_initialized()?;
		Ok(self.registry_for(MessageKind::Request).add(topic, callback).await)
	}

	pub async fn remove_request_callback(&self, id: CallbackId) -> Result<bool> {
		self.require_initialized()?;
		Ok(self.registry_for(MessageKind::Request).remove(id).await)
	}

	pub async fn add_response_callback(&self, topic: impl Into<String>, callback: Callback) -> Result<CallbackId> {
		self.require_initialized()?;
		Ok(self.registry_for(MessageKind::Response).add(topic, callback).await)
	}

	pub async fn remove_response_callback(&self, id: CallbackId) -> Result<bool> {
		self.require_initialized()?;
		Ok(self.registry_for(MessageKind::Response).remove(id).await)
	}

	/// Registers a service, subscribing to any of its topics not already
	/// subscribed and starting its TTL refresh loop if connected. Awaits the
	/// broker's registration acknowledgement synchronously, up to `timeout`.
	pub async fn register_service_sync(self: &Arc<Self>, registration: ServiceRegistration, timeout: Duration) -> Result<()> {
		self.require_initialized()?;
		let registry = self.service_registry().clone();
		registry.add_sync(&registry, registration, timeout).await
	}

	/// Registers a service without waiting for the broker's acknowledgement;
	/// the first TTL refresh (already scheduled) carries it.
	pub async fn register_service_async(self: &Arc<Self>, registration: ServiceRegistration) -> Result<()> {
		self.require_initialized()?;
		let registry = self.service_registry().clone();
		registry.add(&registry, registration).await
	}

	/// Unregisters a service and blocks for the broker's acknowledgement, up
	/// to `timeout`.
	pub async fn unregister_service_sync(&self, instance_id: &str, timeout: Duration) -> Result<()> {
		self.require_initialized()?;
		self.service_registry().remove_sync(instance_id, timeout).await
	}

	/// Unregisters a service, firing the unregister request in the
	/// background without waiting for its acknowledgement.
	pub async fn unregister_service_async(&self, instance_id: &str) -> Result<()> {
		self.require_initialized()?;
		self.service_registry().remove(instance_id).await
	}
}

#[async_trait::async_trait]
impl RegistryHost for Client {
	fn client_id(&self) -> &str {
		self.client_id()
	}

	fn is_connected(&self) -> bool {
		self.connection.is_connected_sync()
	}

	async fn send_registration_request(&self, _topic: &str, message: &Message, timeout: Duration) -> Result<Message> {
		let Message::Request(request) = message else {
			return Err(Error::Codec("registration message must be a Request".into()));
		};
		self.correlate_request(request.clone(), timeout).await
	}

	async fn subscribe(&self, topic: &str) -> Result<()> {
		self.connection.subscribe(topic.to_string()).await
	}

	async fn unsubscribe(&self, topic: &str) -> Result<()> {
		self.connection.unsubscribe(topic).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_config(dir: &std::path::Path) -> FabricClientConfig {
		use crate::config::CertPaths;
		FabricClientConfig {
			certs: CertPaths {
				broker_cert_chain: dir.join("ca.pem"),
				cert_file: dir.join("client.pem"),
				private_key: dir.join("client.key"),
			},
			brokers: Vec::new(),
			brokers_web_sockets: Vec::new(),
			proxy: None,
			use_web_sockets: false,
		}
	}

	#[tokio::test]
	async fn new_fails_with_config_error_when_cert_files_are_missing() {
		let dir = tempfile::tempdir().unwrap();
		let result = Client::new(sample_config(dir.path())).await;
		assert!(matches!(result, Err(Error::Config(_))));
	}
}
