//! Request/response correlation: matches incoming [`Response`]s and
//! [`ErrorResponse`]s back to the sync/async waiter that issued the
//! originating [`Request`].
//!
//! `syncRequest` refuses to run on a dispatcher worker task -- blocking a
//! worker on its own response would deadlock the dispatch queue that
//! delivers that very response. [`Dispatcher`](crate::dispatch::Dispatcher)
//! tags its worker tasks with [`crate::dispatch::on_worker`] so this check
//! doesn't need its own thread-identity plumbing.
use std::{
	collections::HashMap,
	sync::Arc,
	time::Duration,
};

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::dispatch::on_worker;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::MessageId;

pub const DEFAULT_EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub type AsyncCallback = Arc<dyn Fn(Result<Message>) + Send + Sync>;

enum SyncSlot {
	Waiting,
	Arrived(Message),
}

struct AsyncEntry {
	callback: AsyncCallback,
	expires_at: Instant,
}

struct State {
	sync_wait: HashMap<MessageId, SyncSlot>,
	async_wait: HashMap<MessageId, AsyncEntry>,
}

/// Tracks in-flight requests and routes incoming responses back to their
/// sync waiter or async callback.
pub struct RequestCorrelator {
	state: Mutex<State>,
	notify: Notify,
}

impl RequestCorrelator {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			state: Mutex::new(State {
				sync_wait: HashMap::new(),
				async_wait: HashMap::new(),
			}),
			notify: Notify::new(),
		})
	}

	/// Registers `message_id` in `syncWait`, invokes `publish`, then waits up
	/// to `timeout` for a matching response. Always deregisters on exit.
	///
	/// Fails fast with [`Error::WrongThread`] if called from a dispatcher
	/// worker task.
	pub async fn sync_request<F, Fut>(
		&self,
		message_id: MessageId,
		timeout: Duration,
		publish: F,
	) -> Result<Message>
	where
		F: FnOnce() -> Fut,
		Fut: std::future::Future<Output = Result<()>>,
	{
		if on_worker() {
			return Err(Error::WrongThread);
		}

		{
			let mut state = self.state.lock().await;
			state.sync_wait.insert(message_id, SyncSlot::Waiting);
		}

		let result = self.await_sync_response(message_id, timeout, publish).await;

		let mut state = self.state.lock().await;
		state.sync_wait.remove(&message_id);
		result
	}

	async fn await_sync_response<F, Fut>(
		&self,
		message_id: MessageId,
		timeout: Duration,
		publish: F,
	) -> Result<Message>
	where
		F: FnOnce() -> Fut,
		Fut: std::future::Future<Output = Result<()>>,
	{
		publish().await?;

		let deadline = Instant::now() + timeout;
		loop {
			{
				let mut state = self.state.lock().await;
				if let Some(SyncSlot::Arrived(_)) = state.sync_wait.get(&message_id) {
					let Some(SyncSlot::Arrived(message)) = state.sync_wait.remove(&message_id) else {
						unreachable!()
					};
					return Ok(message);
				}
			}

			let now = Instant::now();
			if now >= deadline {
				return Err(Error::WaitTimeout);
			}
			let remaining = deadline - now;
			tokio::select! {
				_ = self.notify.notified() => {}
				_ = tokio::time::sleep(remaining) => {}
			}
		}
	}

	/// Registers `callback` to fire when a response for `message_id` arrives
	/// or `timeout` passes (silent GC -- the callback is not invoked on
	/// timeout), then invokes `publish`. If `publish` fails the registration
	/// is rolled back and the error surfaced.
	pub async fn async_request<F, Fut>(
		&self,
		message_id: MessageId,
		timeout: Duration,
		callback: Option<AsyncCallback>,
		publish: F,
	) -> Result<()>
	where
		F: FnOnce() -> Fut,
		Fut: std::future::Future<Output = Result<()>>,
	{
		let Some(callback) = callback else {
			return publish().await;
		};

		{
			let mut state = self.state.lock().await;
			state.async_wait.insert(
				message_id,
				AsyncEntry {
					callback,
					expires_at: Instant::now() + timeout,
				},
			);
		}

		if let Err(error) = publish().await {
			let mut state = self.state.lock().await;
			state.async_wait.remove(&message_id);
			return Err(error);
		}
		Ok(())
	}

	/// Routes an incoming [`Message::Response`]/[`Message::ErrorResponse`] to
	/// whichever waiter is tracking its `requestMessageId`, if any.
	pub async fn on_response(&self, message: Message) {
		let Some(request_id) = message.request_message_id() else {
			return;
		};

		let async_entry = {
			let mut state = self.state.lock().await;
			if let Some(slot) = state.sync_wait.get_mut(&request_id) {
				*slot = SyncSlot::Arrived(message.clone());
				self.notify.notify_waiters();
			}
			state.async_wait.remove(&request_id)
		};

		if let Some(entry) = async_entry {
			(entry.callback)(Ok(message));
		}
	}

	/// Removes expired `asyncWait` entries without invoking their callbacks.
	pub async fn sweep_expired(&self) {
		let now = Instant::now();
		let mut state = self.state.lock().await;
		let before = state.async_wait.len();
		state.async_wait.retain(|_, entry| entry.expires_at > now);
		let removed = before - state.async_wait.len();
		if removed > 0 {
			debug!(removed, "expired async-request tracking entries");
		}
	}

	/// Spawns the periodic expiry sweep. Dropping the returned handle does
	/// not stop the sweep -- callers should abort it explicitly on close.
	pub fn spawn_expiry_sweep(
		self: &Arc<Self>,
		interval: Duration,
	) -> tokio::task::JoinHandle<()> {
		let correlator = self.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.tick().await;
			loop {
				ticker.tick().await;
				trace!("running async-request expiry sweep");
				correlator.sweep_expired().await;
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::message::{Envelope, Response};
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn response_for(request_id: MessageId) -> Message {
		Message::Response(Response {
			envelope: Envelope::new("client-1", "/mcafee/client/client-1"),
			request_message_id: request_id,
		})
	}

	#[tokio::test]
	async fn sync_request_resolves_when_response_arrives_after_publish() {
		let correlator = RequestCorrelator::new();
		let message_id = uuid::Uuid::new_v4();

		let correlator_for_responder = correlator.clone();
		let responder = tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(10)).await;
			correlator_for_responder
				.on_response(response_for(message_id))
				.await;
		});

		let result = correlator
			.sync_request(message_id, Duration::from_secs(1), || async { Ok(()) })
			.await;

		responder.await.unwrap();
		assert!(result.is_ok());
	}

	#[tokio::test]
	async fn sync_request_times_out_without_response() {
		let correlator = RequestCorrelator::new();
		let message_id = uuid::Uuid::new_v4();

		let result = correlator
			.sync_request(message_id, Duration::from_millis(20), || async { Ok(()) })
			.await;

		assert!(matches!(result, Err(Error::WaitTimeout)));
	}

	#[tokio::test]
	async fn response_arriving_before_sync_wait_registration_is_not_lost() {
		// Registration happens before publish, so a response that arrives the
		// instant publish() runs is still captured.
		let correlator = RequestCorrelator::new();
		let message_id = uuid::Uuid::new_v4();
		let correlator_for_publish = correlator.clone();

		let result = correlator
			.sync_request(message_id, Duration::from_secs(1), move || {
				let correlator = correlator_for_publish.clone();
				async move {
					correlator.on_response(response_for(message_id)).await;
					Ok(())
				}
			})
			.await;

		assert!(result.is_ok());
	}

	#[tokio::test]
	async fn async_request_invokes_callback_on_response() {
		let correlator = RequestCorrelator::new();
		let message_id = uuid::Uuid::new_v4();
		let hits = Arc::new(AtomicUsize::new(0));
		let hits_for_cb = hits.clone();

		correlator
			.async_request(
				message_id,
				Duration::from_secs(5),
				Some(Arc::new(move |_| {
					hits_for_cb.fetch_add(1, Ordering::SeqCst);
				})),
				|| async { Ok(()) },
			)
			.await
			.unwrap();

		correlator.on_response(response_for(message_id)).await;
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn expiry_sweep_does_not_invoke_callback() {
		let correlator = RequestCorrelator::new();
		let message_id = uuid::Uuid::new_v4();
		let hits = Arc::new(AtomicUsize::new(0));
		let hits_for_cb = hits.clone();

		correlator
			.async_request(
				message_id,
				Duration::from_millis(1),
				Some(Arc::new(move |_| {
					hits_for_cb.fetch_add(1, Ordering::SeqCst);
				})),
				|| async { Ok(()) },
			)
			.await
			.unwrap();

		tokio::time::sleep(Duration::from_millis(20)).await;
		correlator.sweep_expired().await;
		correlator.on_response(response_for(message_id)).await;

		assert_eq!(hits.load(Ordering::SeqCst), 0);
	}
}
