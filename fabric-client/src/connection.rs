//! Connection manager: the connect/disconnect/reconnect state machine,
//! broker ranking, retry backoff, subscription restoration, and the
//! bounded-wait transport-replace protocol used to recover from a wedged
//! disconnect.
use std::{
	collections::HashSet,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use rand::Rng;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{rank, Broker};
use crate::dispatch::Dispatcher;
use crate::engine::{self, Command, IncomingPublish};
use crate::error::{Error, Result};
use crate::transport::{self, TransportConfig};

pub const DEFAULT_RETRY_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_RETRY_RANDOMNESS: f64 = 0.25;
pub const DEFAULT_DISCONNECT_WAIT: Duration = Duration::from_secs(60);
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30 * 60);

/// How a lost connection is handled once [`ConnectionManager::connection_lost`]
/// fires. Matches the client façade's `setDisconnectedStrategy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectedStrategy {
	/// Start an asynchronous reconnect loop (the default).
	Reconnect,
	/// Do nothing; the caller must call `connect()` again explicitly.
	Suppressed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
}

/// Retry-loop tuning, mirroring the config knobs in the external interface.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
	pub initial_delay: Duration,
	pub max_delay: Duration,
	pub backoff_multiplier: f64,
	pub randomness: f64,
	/// `-1` (represented as `None`) means unlimited retries.
	pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			initial_delay: DEFAULT_RETRY_INITIAL_DELAY,
			max_delay: DEFAULT_RETRY_MAX_DELAY,
			backoff_multiplier: DEFAULT_RETRY_BACKOFF_MULTIPLIER,
			randomness: DEFAULT_RETRY_RANDOMNESS,
			max_retries: None,
		}
	}
}

struct Session {
	commands: mpsc::Sender<Command>,
	engine_task: JoinHandle<()>,
	reader_task: JoinHandle<()>,
}

/// Drives exactly one MQTT session at a time: connect/reconnect with
/// ranked-broker failover and backoff, disconnect with a bounded-wait
/// transport replace, and re-subscription on every successful (re)connect.
pub struct ConnectionManager {
	client_id: String,
	transport_config: TransportConfig,
	retry_policy: RetryPolicy,
	disconnect_wait: Duration,
	keep_alive: Duration,

	state: RwLock<ConnectionState>,
	current_broker: RwLock<Option<Broker>>,
	/// The full broker list last passed to [`Self::connect`], so automatic
	/// reconnect re-ranks and fails over across all of them instead of only
	/// ever retrying the one broker that was last connected.
	candidate_brokers: RwLock<Vec<Broker>>,
	subscriptions: Mutex<HashSet<String>>,
	session: Mutex<Option<Session>>,

	/// Guards against more than one concurrent connect attempt (I1).
	attempting_to_connect: Mutex<()>,
	interrupt: AtomicBool,
	connect_wait: Notify,

	dispatcher: Arc<Dispatcher>,
	disconnected_strategy: RwLock<DisconnectedStrategy>,
}

impl ConnectionManager {
	pub fn new(
		client_id: impl Into<String>,
		transport_config: TransportConfig,
		dispatcher: Arc<Dispatcher>,
	) -> Arc<Self> {
		Arc::new(Self {
			client_id: client_id.into(),
			transport_config,
			retry_policy: RetryPolicy::default(),
			disconnect_wait: DEFAULT_DISCONNECT_WAIT,
			keep_alive: DEFAULT_KEEP_ALIVE,
			state: RwLock::new(ConnectionState::Disconnected),
			current_broker: RwLock::new(None),
			candidate_brokers: RwLock::new(Vec::new()),
			subscriptions: Mutex::new(HashSet::new()),
			session: Mutex::new(None),
			attempting_to_connect: Mutex::new(()),
			interrupt: AtomicBool::new(false),
			connect_wait: Notify::new(),
			dispatcher,
			disconnected_strategy: RwLock::new(DisconnectedStrategy::Reconnect),
		})
	}

	pub async fn is_connected(&self) -> bool {
		*self.state.read().await == ConnectionState::Connected
	}

	/// Non-blocking best-effort read of the connection state, for callers
	/// (like [`crate::service::RegistryHost::is_connected`]) that cannot
	/// await a lock, e.g. from inside a synchronous trait method.
	pub fn is_connected_sync(&self) -> bool {
		self.state
			.try_read()
			.map(|state| *state == ConnectionState::Connected)
			.unwrap_or(false)
	}

	pub async fn current_broker(&self) -> Option<Broker> {
		self.current_broker.read().await.clone()
	}

	pub async fn set_disconnected_strategy(&self, strategy: DisconnectedStrategy) {
		*self.disconnected_strategy.write().await = strategy;
	}

	/// Adds `topic` to the subscription set and, if connected, subscribes
	/// immediately (I3: otherwise it's re-asserted on the next connect).
	pub async fn subscribe(&self, topic: impl Into<String>) -> Result<()> {
		let topic = topic.into();
		let already_present = {
			let mut subs = self.subscriptions.lock().await;
			!subs.insert(topic.clone())
		};
		if already_present {
			return Ok(());
		}
		if let Some(commands) = self.command_sender().await {
			send_command(&commands, Command::Subscribe { topics: vec![topic] }).await?;
		}
		Ok(())
	}

	pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
		self.subscriptions.lock().await.remove(topic);
		if let Some(commands) = self.command_sender().await {
			send_command(
				&commands,
				Command::Unsubscribe { topics: vec![topic.to_string()] },
			)
			.await?;
		}
		Ok(())
	}

	pub async fn subscriptions(&self) -> HashSet<String> {
		self.subscriptions.lock().await.clone()
	}

	pub async fn publish(&self, topic: impl Into<String>, payload: Vec<u8>) -> Result<()> {
		let commands = self
			.command_sender()
			.await
			.ok_or(Error::NotConnected)?;
		send_command(
			&commands,
			Command::Publish {
				topic: topic.into(),
				payload,
				qos: mqttbytes::QoS::AtMostOnce,
			},
		)
		.await
	}

	async fn command_sender(&self) -> Option<mpsc::Sender<Command>> {
		self.session
			.lock()
			.await
			.as_ref()
			.map(|session| session.commands.clone())
	}

	/// Drives the connect retry loop. Returns once connected or once
	/// retries are exhausted/interrupted.
	pub async fn connect(self: &Arc<Self>, candidate_brokers: Vec<Broker>) -> Result<()> {
		let _attempt_guard = self.attempting_to_connect.lock().await;
		self.interrupt.store(false, Ordering::SeqCst);
		*self.state.write().await = ConnectionState::Connecting;
		*self.candidate_brokers.write().await = candidate_brokers.clone();

		let ranked = rank(candidate_brokers).await;
		let uris_by_broker: Vec<(Broker, Vec<url::Url>)> = ranked
			.into_iter()
			.map(|broker| {
				let uris = broker.uris();
				(broker, uris)
			})
			.collect();
		if uris_by_broker.is_empty() {
			*self.state.write().await = ConnectionState::Disconnected;
			return Err(Error::ConnectFailed("no brokers configured".into()));
		}

		let mut delay = self.retry_policy.initial_delay;
		let mut attempt: u32 = 0;
		let mut last_error = Error::ConnectFailed("no connection attempt made".into());

		loop {
			if self.interrupt.load(Ordering::SeqCst) {
				*self.state.write().await = ConnectionState::Disconnected;
				return Err(Error::ConnectFailed("connect interrupted".into()));
			}

			if attempt > 0 {
				let jitter = 1.0 + self.retry_policy.randomness * rand::thread_rng().gen::<f64>();
				let capped = delay.min(self.retry_policy.max_delay);
				let wait = Duration::from_secs_f64(capped.as_secs_f64() * jitter);
				tokio::select! {
					_ = tokio::time::sleep(wait) => {}
					_ = self.connect_wait.notified() => {
						if self.interrupt.load(Ordering::SeqCst) {
							*self.state.write().await = ConnectionState::Disconnected;
							return Err(Error::ConnectFailed("connect interrupted".into()));
						}
					}
				}
				delay = Duration::from_secs_f64(
					(delay.as_secs_f64() * self.retry_policy.backoff_multiplier)
						.min(self.retry_policy.max_delay.as_secs_f64() * 4.0),
				);
			}

			for (broker, uris) in &uris_by_broker {
				let mut connected = false;
				for uri in uris.iter() {
					let Some(dial_host) = uri.host_str() else {
						continue;
					};
					match self.try_connect_broker(broker, dial_host).await {
						Ok(()) => {
							*self.current_broker.write().await = Some(broker.clone());
							*self.state.write().await = ConnectionState::Connected;
							self.resubscribe_all().await?;
							info!(client_id = %self.client_id, broker = %broker.unique_id, "connected");
							connected = true;
							break;
						}
						Err(error) => {
							warn!(broker = %broker.unique_id, dial_host, %error, "connect attempt failed");
							last_error = error;
						}
					}
				}
				if connected {
					return Ok(());
				}
			}

			attempt += 1;
			if let Some(max_retries) = self.retry_policy.max_retries {
				if attempt >= max_retries {
					*self.state.write().await = ConnectionState::Disconnected;
					return Err(Error::ConnectFailed(format!(
						"exhausted {attempt} retries: {last_error}"
					)));
				}
			}
		}
	}

	async fn try_connect_broker(self: &Arc<Self>, broker: &Broker, dial_host: &str) -> Result<()> {
		let stream = transport::connect(broker, dial_host, &self.transport_config).await?;
		let (command_tx, command_rx) = mpsc::channel(64);
		let (publish_tx, mut publish_rx) = mpsc::channel::<IncomingPublish>(1024);

		let client_id = self.client_id.clone();
		let keep_alive = self.keep_alive;
		let engine_task = tokio::spawn(async move {
			if let Err(error) = engine::run(stream, client_id, keep_alive, true, command_rx, publish_tx).await {
				warn!(%error, "mqtt engine session ended");
			}
		});

		let manager_for_reader = self.clone();
		let reader_task = tokio::spawn(async move {
			while let Some(publish) = publish_rx.recv().await {
				let topic = publish.topic.clone();
				if !manager_for_reader
					.dispatcher
					.submit(topic, publish.payload)
					.await
				{
					break;
				}
			}
			manager_for_reader.connection_lost().await;
		});

		*self.session.lock().await = Some(Session {
			commands: command_tx,
			engine_task,
			reader_task,
		});
		Ok(())
	}

	async fn resubscribe_all(&self) -> Result<()> {
		let topics: Vec<String> = self.subscriptions.lock().await.iter().cloned().collect();
		if topics.is_empty() {
			return Ok(());
		}
		let commands = self.command_sender().await.ok_or(Error::NotConnected)?;
		send_command(&commands, Command::Subscribe { topics }).await
	}

	/// Drives the transport disconnect on a helper task with a bounded wait;
	/// if it doesn't complete in time, the transport is discarded and
	/// replaced rather than awaited further.
	pub async fn disconnect(&self) {
		self.interrupt.store(true, Ordering::SeqCst);
		self.connect_wait.notify_waiters();

		let session = self.session.lock().await.take();
		let Some(session) = session else {
			*self.state.write().await = ConnectionState::Disconnected;
			*self.current_broker.write().await = None;
			return;
		};

		let disconnect_wait = self.disconnect_wait;
		let helper = tokio::spawn(async move {
			// Abort the reader first: once the engine drops its publish
			// sender below, the reader's channel closes and would otherwise
			// treat this intentional shutdown as a lost connection.
			session.reader_task.abort();
			let _ = session.commands.send(Command::Disconnect).await;
			let _ = session.engine_task.await;
		});

		if tokio::time::timeout(disconnect_wait, helper).await.is_err() {
			warn!("disconnect helper task did not finish within bounded wait, discarding transport");
		}

		*self.state.write().await = ConnectionState::Disconnected;
		*self.current_broker.write().await = None;
	}

	/// Called from the transport's read-loop when the connection drops
	/// unexpectedly. Disconnects quietly, then applies the configured
	/// [`DisconnectedStrategy`].
	pub async fn connection_lost(self: &Arc<Self>) {
		if *self.state.read().await != ConnectionState::Connected {
			return;
		}
		debug!(client_id = %self.client_id, "connection lost");
		let brokers = self.last_known_brokers().await;
		self.disconnect().await;

		if *self.disconnected_strategy.read().await == DisconnectedStrategy::Reconnect {
			let manager = self.clone();
			tokio::spawn(async move {
				if let Err(error) = manager.connect(brokers).await {
					warn!(%error, "automatic reconnect failed");
				}
			});
		}
	}

	/// The full configured broker list from the last `connect()` call, so
	/// automatic reconnect re-ranks and fails over across all of them rather
	/// than retrying only the broker that was last connected.
	async fn last_known_brokers(&self) -> Vec<Broker> {
		self.candidate_brokers.read().await.clone()
	}

	/// Interrupts any in-flight connect/retry, disconnects, and tears down
	/// dispatcher/correlator resources owned elsewhere. Safe to call more
	/// than once.
	pub async fn close(&self) {
		self.interrupt.store(true, Ordering::SeqCst);
		self.connect_wait.notify_waiters();
		self.disconnect().await;
	}
}

async fn send_command(sender: &mpsc::Sender<Command>, command: Command) -> Result<()> {
	sender
		.send(command)
		.await
		.map_err(|_| Error::NotConnected)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn retry_policy_defaults_match_external_interface() {
		let policy = RetryPolicy::default();
		assert_eq!(policy.initial_delay, Duration::from_secs(1));
		assert_eq!(policy.max_delay, Duration::from_secs(60));
		assert_eq!(policy.backoff_multiplier, 2.0);
		assert_eq!(policy.randomness, 0.25);
		assert_eq!(policy.max_retries, None);
	}
}
