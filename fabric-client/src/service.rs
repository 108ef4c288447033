//! Service registry: per-service TTL refresh loops, subscription
//! ref-counting across services that share request topics, and the
//! register/unregister lifecycle.
use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
	time::Duration,
};

use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::callback::Callback;
use crate::error::{Error, Result};
use crate::message::Message;

/// Resolution applied to `ttlMinutes` when computing the refresh-loop sleep
/// interval; 1 in production, configurable in tests to shrink TTL minutes
/// down to, e.g., milliseconds.
pub const DEFAULT_TTL_RESOLUTION: u32 = 1;
pub const DEFAULT_UNREGISTER_GRACE: Duration = Duration::from_secs(10 * 60);
/// Ack wait used by the periodic refresh loop, which never blocks a caller.
const REFRESH_ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// A live service registration. Holds everything [`ServiceRegistry`] needs
/// to run its refresh loop, answer subscription ref-counting queries, and
/// dispatch incoming Requests addressed to this service.
pub struct ServiceRegistration {
	pub service_type: String,
	pub instance_id: String,
	pub topics: HashSet<String>,
	pub metadata: HashMap<String, String>,
	pub ttl_minutes: u32,
	pub dest_tenant_guids: HashSet<String>,
	/// Invoked for every Request addressed to this service, across any of
	/// its registered topics.
	callback: Callback,
	register_time: Option<Instant>,
	deleted: bool,
	refresh_handle: Option<JoinHandle<()>>,
	wakeup: Arc<Notify>,
}

impl ServiceRegistration {
	pub fn new(
		service_type: impl Into<String>,
		instance_id: impl Into<String>,
		topics: impl IntoIterator<Item = String>,
		callback: Callback,
	) -> Self {
		Self {
			service_type: service_type.into(),
			instance_id: instance_id.into(),
			topics: topics.into_iter().collect(),
			metadata: HashMap::new(),
			ttl_minutes: 60,
			dest_tenant_guids: HashSet::new(),
			callback,
			register_time: None,
			deleted: false,
			refresh_handle: None,
			wakeup: Arc::new(Notify::new()),
		}
	}
}

/// Callbacks the registry needs from the owning client to do its job,
/// without depending on [`crate::client::Client`] directly (the client owns
/// the registry, not the other way around).
#[async_trait::async_trait]
pub trait RegistryHost: Send + Sync {
	/// The owning client's uniqueId -- `replyToTopic` on register/unregister
	/// requests must route back to this client, not to the (arbitrary,
	/// caller-chosen) service instance id.
	fn client_id(&self) -> &str;
	/// `true` if the underlying transport is currently connected.
	fn is_connected(&self) -> bool;
	/// Sends the register/unregister Request and awaits its Response
	/// synchronously, on a non-dispatcher thread, up to `timeout`.
	async fn send_registration_request(&self, topic: &str, message: &Message, timeout: Duration) -> Result<Message>;
	async fn subscribe(&self, topic: &str) -> Result<()>;
	async fn unsubscribe(&self, topic: &str) -> Result<()>;
}

struct Entry {
	registration: ServiceRegistration,
}

/// Owns every [`ServiceRegistration`] for a client and runs their refresh
/// loops.
pub struct ServiceRegistry<H: RegistryHost + 'static> {
	host: Arc<H>,
	services: RwLock<HashMap<String, Entry>>,
	ttl_resolution: u32,
	unregister_grace: Duration,
}

impl<H: RegistryHost + 'static> ServiceRegistry<H> {
	pub fn new(host: Arc<H>) -> Self {
		Self {
			host,
			services: RwLock::new(HashMap::new()),
			ttl_resolution: DEFAULT_TTL_RESOLUTION,
			unregister_grace: DEFAULT_UNREGISTER_GRACE,
		}
	}

	#[cfg(test)]
	pub fn with_ttl_resolution(host: Arc<H>, ttl_resolution: u32) -> Self {
		Self {
			ttl_resolution,
			..Self::new(host)
		}
	}

	/// Topics currently requested by at least one non-deleted service.
	pub async fn active_topics(&self) -> HashSet<String> {
		let guard = self.services.read().await;
		guard
			.values()
			.filter(|entry| !entry.registration.deleted)
			.flat_map(|entry| entry.registration.topics.iter().cloned())
			.collect()
	}

	/// Registers (or updates, if `instance_id` is already held by this same
	/// logical service) a service. Returns [`Error::ServiceAlreadyRegistered`]
	/// if `instance_id` is already held by a service of a different
	/// `service_type`.
	pub async fn add(
		&self,
		registry: &Arc<Self>,
		mut registration: ServiceRegistration,
	) -> Result<()> {
		let mut guard = self.services.write().await;

		if let Some(existing) = guard.get(&registration.instance_id) {
			if existing.registration.service_type != registration.service_type {
				return Err(Error::ServiceAlreadyRegistered(registration.instance_id));
			}
		}

		let (to_subscribe, to_unsubscribe) = if let Some(existing) = guard.get(&registration.instance_id) {
			let added: Vec<String> = registration
				.topics
				.difference(&existing.registration.topics)
				.cloned()
				.collect();
			let removed: Vec<String> = existing
				.registration
				.topics
				.difference(&registration.topics)
				.cloned()
				.collect();
			(added, removed)
		} else {
			(registration.topics.iter().cloned().collect(), Vec::new())
		};

		for topic in &to_subscribe {
			self.host.subscribe(topic).await?;
		}
		for topic in &to_unsubscribe {
			if !self.topic_still_active(&guard, topic, &registration.instance_id) {
				self.host.unsubscribe(topic).await?;
			}
		}

		let start_loop = guard.get(&registration.instance_id).is_none();
		if start_loop && self.host.is_connected() {
			registration.refresh_handle = Some(spawn_refresh_loop(
				registry.clone(),
				registration.instance_id.clone(),
				registration.wakeup.clone(),
			));
		}

		guard.insert(
			registration.instance_id.clone(),
			Entry { registration },
		);
		Ok(())
	}

	/// Like [`Self::add`], but additionally performs an immediate
	/// registration request and blocks for its acknowledgement, instead of
	/// leaving the first registration to the refresh loop's next tick.
	pub async fn add_sync(
		&self,
		registry: &Arc<Self>,
		registration: ServiceRegistration,
		timeout: Duration,
	) -> Result<()> {
		let instance_id = registration.instance_id.clone();
		let service_type = registration.service_type.clone();
		let topics = registration.topics.clone();
		let metadata = registration.metadata.clone();
		let ttl_minutes = registration.ttl_minutes;
		let dest_tenant_guids = registration.dest_tenant_guids.clone();

		self.add(registry, registration).await?;

		if self.host.is_connected() {
			let request = register_request(
				self.host.client_id(),
				&service_type,
				&instance_id,
				&topics,
				&metadata,
				ttl_minutes,
				&dest_tenant_guids,
			);
			self.host
				.send_registration_request(crate::topics::SERVICE_REGISTER_TOPIC, &request, timeout)
				.await?;
			self.mark_registered(&instance_id).await;
		}
		Ok(())
	}

	fn topic_still_active(
		&self,
		guard: &HashMap<String, Entry>,
		topic: &str,
		excluding_instance: &str,
	) -> bool {
		guard.values().any(|entry| {
			entry.registration.instance_id != excluding_instance
				&& !entry.registration.deleted
				&& entry.registration.topics.contains(topic)
		})
	}

	/// Stops the refresh loop, unsubscribes topics no longer referenced by
	/// any other service, marks the registration deleted, and (if still
	/// within the unregister grace period) fires an unregister request in
	/// the background without waiting for its acknowledgement.
	pub async fn remove(&self, instance_id: &str) -> Result<()> {
		let Some(request) = self.begin_remove(instance_id).await? else {
			return Ok(());
		};
		let host = self.host.clone();
		let instance_id = instance_id.to_string();
		tokio::spawn(async move {
			if let Err(error) = host
				.send_registration_request(crate::topics::SERVICE_UNREGISTER_TOPIC, &request, REFRESH_ACK_TIMEOUT)
				.await
			{
				warn!(instance_id, %error, "service unregistration request failed");
			}
		});
		self.services.write().await.remove(&instance_id);
		Ok(())
	}

	/// Like [`Self::remove`], but blocks for the unregister acknowledgement
	/// up to `timeout` instead of firing it in the background.
	pub async fn remove_sync(&self, instance_id: &str, timeout: Duration) -> Result<()> {
		let Some(request) = self.begin_remove(instance_id).await? else {
			return Ok(());
		};
		let result = self
			.host
			.send_registration_request(crate::topics::SERVICE_UNREGISTER_TOPIC, &request, timeout)
			.await;
		self.services.write().await.remove(instance_id);
		result.map(|_| ())
	}

	/// Marks `instance_id` deleted, stops its refresh loop, and unsubscribes
	/// any of its topics no longer referenced by another service. Returns
	/// the unregister [`Message::Request`] to send, or `None` if
	/// `instance_id` is unknown or outside the unregister grace period.
	async fn begin_remove(&self, instance_id: &str) -> Result<Option<Message>> {
		let (topics, should_unregister, register_time, ttl_minutes) = {
			let mut guard = self.services.write().await;
			let (owned_topics, register_time, ttl_minutes) = {
				let Some(entry) = guard.get_mut(instance_id) else {
					return Ok(None);
				};
				entry.registration.deleted = true;
				if let Some(handle) = entry.registration.refresh_handle.take() {
					handle.abort();
				}
				(
					entry.registration.topics.clone(),
					entry.registration.register_time,
					entry.registration.ttl_minutes,
				)
			};
			let topics: Vec<String> = owned_topics
				.iter()
				.filter(|topic| !self.topic_still_active(&guard, topic, instance_id))
				.cloned()
				.collect();
			(topics, self.host.is_connected(), register_time, ttl_minutes)
		};

		for topic in &topics {
			self.host.unsubscribe(topic).await?;
		}

		if should_unregister && self.within_unregister_grace(register_time, ttl_minutes) {
			Ok(Some(unregister_request(self.host.client_id(), instance_id)))
		} else {
			Ok(None)
		}
	}

	fn within_unregister_grace(&self, register_time: Option<Instant>, ttl_minutes: u32) -> bool {
		let Some(register_time) = register_time else {
			return false;
		};
		let ttl_seconds = (ttl_minutes as u64 * 60) / self.ttl_resolution.max(1) as u64;
		let grace_seconds = self.unregister_grace.as_secs() / self.ttl_resolution.max(1) as u64;
		let deadline = register_time + Duration::from_secs(ttl_seconds + grace_seconds);
		Instant::now() <= deadline
	}

	/// Dispatches `message` to the named service's registered callback if
	/// `service_id` is present and known (returns `false` if unknown, so the
	/// caller can reply "service unavailable"), or broadcasts it to every
	/// non-deleted service otherwise.
	///
	/// Only holds the read lock long enough to snapshot the matching
	/// callbacks; they run after it is dropped, mirroring
	/// [`crate::callback::CallbackRegistry::fire`].
	pub async fn on_request(&self, service_id: Option<&str>, message: &Message) -> bool {
		let (matched, callbacks) = {
			let guard = self.services.read().await;
			match service_id {
				Some(id) => match guard.get(id) {
					Some(entry) if !entry.registration.deleted => {
						(true, vec![entry.registration.callback.clone()])
					}
					_ => (false, Vec::new()),
				},
				None => {
					let callbacks = guard
						.values()
						.filter(|entry| !entry.registration.deleted)
						.map(|entry| entry.registration.callback.clone())
						.collect();
					(true, callbacks)
				}
			}
		};
		for callback in &callbacks {
			callback(message);
		}
		matched
	}

	async fn mark_registered(&self, instance_id: &str) {
		let mut guard = self.services.write().await;
		if let Some(entry) = guard.get_mut(instance_id) {
			entry.registration.register_time = Some(Instant::now());
		}
	}

	/// Starts refresh loops for every service that isn't already running
	/// one, e.g. after a (re)connect.
	pub async fn start_pending_loops(self: &Arc<Self>) {
		let mut guard = self.services.write().await;
		for (instance_id, entry) in guard.iter_mut() {
			if entry.registration.deleted || entry.registration.refresh_handle.is_some() {
				continue;
			}
			entry.registration.refresh_handle = Some(spawn_refresh_loop(
				self.clone(),
				instance_id.clone(),
				entry.registration.wakeup.clone(),
			));
		}
	}

	/// Stops every running refresh loop, e.g. on disconnect.
	pub async fn stop_all_loops(&self) {
		let mut guard = self.services.write().await;
		for entry in guard.values_mut() {
			if let Some(handle) = entry.registration.refresh_handle.take() {
				handle.abort();
			}
		}
	}
}

fn unregister_request(client_id: &str, instance_id: &str) -> Message {
	let envelope = crate::message::Envelope::new(client_id, crate::topics::SERVICE_UNREGISTER_TOPIC);
	Message::Request(crate::message::Request {
		envelope,
		reply_to_topic: crate::topics::reply_topic(client_id),
		service_id: Some(instance_id.to_string()),
	})
}

fn spawn_refresh_loop<H: RegistryHost + 'static>(
	registry: Arc<ServiceRegistry<H>>,
	instance_id: String,
	wakeup: Arc<Notify>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			let snapshot = {
				let guard = registry.services.read().await;
				guard.get(&instance_id).map(|entry| {
					(
						entry.registration.deleted,
						entry.registration.ttl_minutes,
						entry.registration.service_type.clone(),
						entry.registration.topics.clone(),
						entry.registration.metadata.clone(),
						entry.registration.dest_tenant_guids.clone(),
					)
				})
			};
			let Some((deleted, ttl_minutes, service_type, topics, metadata, dest_tenant_guids)) = snapshot
			else {
				return;
			};
			if deleted {
				return;
			}

			if registry.host.is_connected() {
				let request = register_request(
					registry.host.client_id(),
					&service_type,
					&instance_id,
					&topics,
					&metadata,
					ttl_minutes,
					&dest_tenant_guids,
				);
				match registry
					.host
					.send_registration_request(crate::topics::SERVICE_REGISTER_TOPIC, &request, REFRESH_ACK_TIMEOUT)
					.await
				{
					Ok(_) => {
						registry.mark_registered(&instance_id).await;
						debug!(instance_id, "service registration refreshed");
					}
					Err(error) => {
						warn!(instance_id, %error, "service registration refresh failed");
					}
				}
			}

			let sleep_seconds = (ttl_minutes as u64 * 60) / registry.ttl_resolution.max(1) as u64;
			tokio::select! {
				_ = tokio::time::sleep(Duration::from_secs(sleep_seconds.max(1))) => {}
				_ = wakeup.notified() => {}
			}
		}
	})
}

fn register_request(
	client_id: &str,
	service_type: &str,
	instance_id: &str,
	topics: &HashSet<String>,
	metadata: &HashMap<String, String>,
	ttl_minutes: u32,
	dest_tenant_guids: &HashSet<String>,
) -> Message {
	let mut envelope = crate::message::Envelope::new(client_id, crate::topics::SERVICE_REGISTER_TOPIC);
	envelope.other_fields.insert("serviceType".into(), service_type.to_string());
	envelope
		.other_fields
		.insert("topics".into(), topics.iter().cloned().collect::<Vec<_>>().join(","));
	envelope.other_fields.insert("ttlMinutes".into(), ttl_minutes.to_string());
	envelope.other_fields.insert(
		"destTenantGuids".into(),
		dest_tenant_guids.iter().cloned().collect::<Vec<_>>().join(","),
	);
	for (key, value) in metadata {
		envelope.other_fields.insert(format!("meta.{key}"), value.clone());
	}
	Message::Request(crate::message::Request {
		envelope,
		reply_to_topic: crate::topics::reply_topic(client_id),
		service_id: Some(instance_id.to_string()),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
	use std::sync::Mutex as StdMutex;

	struct FakeHost {
		client_id: String,
		connected: AtomicBool,
		register_calls: AtomicUsize,
		subscribed: StdMutex<HashSet<String>>,
	}

	#[async_trait::async_trait]
	impl RegistryHost for FakeHost {
		fn client_id(&self) -> &str {
			&self.client_id
		}

		fn is_connected(&self) -> bool {
			self.connected.load(Ordering::SeqCst)
		}

		async fn send_registration_request(&self, _topic: &str, _message: &Message, _timeout: Duration) -> Result<Message> {
			self.register_calls.fetch_add(1, Ordering::SeqCst);
			Ok(Message::Event(crate::message::Event {
				envelope: crate::message::Envelope::new("broker", "ack"),
			}))
		}

		async fn subscribe(&self, topic: &str) -> Result<()> {
			self.subscribed.lock().unwrap().insert(topic.to_string());
			Ok(())
		}

		async fn unsubscribe(&self, topic: &str) -> Result<()> {
			self.subscribed.lock().unwrap().remove(topic);
			Ok(())
		}
	}

	fn host() -> Arc<FakeHost> {
		Arc::new(FakeHost {
			client_id: "client-1".to_string(),
			connected: AtomicBool::new(true),
			register_calls: AtomicUsize::new(0),
			subscribed: StdMutex::new(HashSet::new()),
		})
	}

	fn noop_callback() -> Callback {
		Arc::new(|_| {})
	}

	#[tokio::test]
	async fn add_subscribes_new_topics_and_starts_loop_when_connected() {
		let host = host();
		let registry = Arc::new(ServiceRegistry::with_ttl_resolution(host.clone(), 60 * 1000));
		let mut registration = ServiceRegistration::new("echo", "instance-1", ["svc/echo".to_string()], noop_callback());
		registration.ttl_minutes = 1;

		registry.add(&registry, registration).await.unwrap();
		assert!(host.subscribed.lock().unwrap().contains("svc/echo"));
		assert!(registry.active_topics().await.contains("svc/echo"));
	}

	#[tokio::test]
	async fn remove_unsubscribes_topic_not_shared_by_another_service() {
		let host = host();
		let registry = Arc::new(ServiceRegistry::with_ttl_resolution(host.clone(), 60 * 1000));
		let registration = ServiceRegistration::new("echo", "instance-1", ["svc/echo".to_string()], noop_callback());
		registry.add(&registry, registration).await.unwrap();

		registry.remove("instance-1").await.unwrap();
		assert!(!host.subscribed.lock().unwrap().contains("svc/echo"));
		assert!(registry.active_topics().await.is_empty());
	}

	#[tokio::test]
	async fn remove_keeps_topic_subscribed_when_another_service_still_uses_it() {
		let host = host();
		let registry = Arc::new(ServiceRegistry::with_ttl_resolution(host.clone(), 60 * 1000));
		registry
			.add(
				&registry,
				ServiceRegistration::new("a", "instance-1", ["shared".to_string()], noop_callback()),
			)
			.await
			.unwrap();
		registry
			.add(
				&registry,
				ServiceRegistration::new("b", "instance-2", ["shared".to_string()], noop_callback()),
			)
			.await
			.unwrap();

		registry.remove("instance-1").await.unwrap();
		assert!(host.subscribed.lock().unwrap().contains("shared"));
	}

	#[tokio::test]
	async fn on_request_reports_unknown_service_id() {
		let host = host();
		let registry = Arc::new(ServiceRegistry::with_ttl_resolution(host.clone(), 60 * 1000));
		let message = Message::Request(crate::message::Request {
			envelope: crate::message::Envelope::new("client-1", crate::topics::SERVICE_REGISTER_TOPIC),
			reply_to_topic: crate::topics::reply_topic("client-1"),
			service_id: Some("missing".to_string()),
		});
		let dispatched = registry.on_request(Some("missing"), &message).await;
		assert!(!dispatched);
	}

	#[tokio::test]
	async fn on_request_invokes_matching_service_callback() {
		let host = host();
		let registry = Arc::new(ServiceRegistry::with_ttl_resolution(host.clone(), 60 * 1000));
		let hits = Arc::new(AtomicUsize::new(0));
		let hits_clone = hits.clone();
		let registration = ServiceRegistration::new(
			"echo",
			"instance-1",
			["svc/echo".to_string()],
			Arc::new(move |_| {
				hits_clone.fetch_add(1, Ordering::SeqCst);
			}),
		);
		registry.add(&registry, registration).await.unwrap();

		let message = Message::Request(crate::message::Request {
			envelope: crate::message::Envelope::new("caller", "svc/echo"),
			reply_to_topic: crate::topics::reply_topic("caller"),
			service_id: Some("instance-1".to_string()),
		});
		let dispatched = registry.on_request(Some("instance-1"), &message).await;
		assert!(dispatched);
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}
}
