//! The callback dispatcher: a bounded-queue worker pool that decodes raw
//! publishes and routes them to the right [`crate::callback::CallbackRegistry`].
//!
//! A panic inside a user callback is caught and logged; it does not take
//! down the worker or the process. `syncRequest` on the client side refuses
//! to run from inside a worker task (see [`on_worker`]) since blocking a
//! worker would starve the dispatch queue it's trying to drain.
use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::warn;

use crate::{
	callback::CallbackRegistry,
	message::{Codec, Message, MessageKind},
};

pub const DEFAULT_WORKER_COUNT: usize = 1;
pub const DEFAULT_QUEUE_DEPTH: usize = 16_384;

tokio::task_local! {
	static ON_WORKER: ();
}

/// `true` if called from inside a dispatcher worker task.
pub fn on_worker() -> bool {
	ON_WORKER.try_with(|_| ()).is_ok()
}

struct RawMessage {
	topic: String,
	payload: Vec<u8>,
}

/// Owns the registries for every message kind and the worker pool that
/// drains decoded publishes into them.
pub struct Dispatcher {
	sender: mpsc::Sender<RawMessage>,
	handles: Vec<JoinHandle<()>>,
	pub events: Arc<CallbackRegistry>,
	pub requests: Arc<CallbackRegistry>,
	pub responses: Arc<CallbackRegistry>,
}

impl Dispatcher {
	pub fn new(codec: Arc<dyn Codec>, workers: usize, queue_depth: usize) -> Self {
		let (sender, receiver) = mpsc::channel(queue_depth.max(1));
		let events = Arc::new(CallbackRegistry::new());
		let requests = Arc::new(CallbackRegistry::new());
		let responses = Arc::new(CallbackRegistry::new());

		let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
		let mut handles = Vec::with_capacity(workers.max(1));
		for worker_id in 0..workers.max(1) {
			let receiver = receiver.clone();
			let codec = codec.clone();
			let events = events.clone();
			let requests = requests.clone();
			let responses = responses.clone();

			let handle = tokio::spawn(ON_WORKER.scope((), async move {
				loop {
					let raw = {
						let mut guard = receiver.lock().await;
						guard.recv().await
					};
					let Some(raw) = raw else {
						break;
					};
					run_one(worker_id, &codec, &events, &requests, &responses, raw).await;
				}
			}));
			handles.push(handle);
		}

		Self {
			sender,
			handles,
			events,
			requests,
			responses,
		}
	}

	/// Enqueues a raw publish for decoding and dispatch. Blocks (does not
	/// drop) if the queue is at capacity -- backpressure is pushed onto the
	/// MQTT engine's read loop rather than silently discarding publishes.
	pub async fn submit(&self, topic: impl Into<String>, payload: Vec<u8>) -> bool {
		self.sender
			.send(RawMessage {
				topic: topic.into(),
				payload,
			})
			.await
			.is_ok()
	}

	pub fn registry_for(&self, kind: MessageKind) -> &Arc<CallbackRegistry> {
		match kind {
			MessageKind::Event => &self.events,
			MessageKind::Request => &self.requests,
			MessageKind::Response => &self.responses,
		}
	}

	/// Stops accepting new work and waits for in-flight callbacks to drain.
	pub async fn shutdown(self) {
		drop(self.sender);
		for handle in self.handles {
			let _ = handle.await;
		}
	}
}

async fn run_one(
	worker_id: usize,
	codec: &Arc<dyn Codec>,
	events: &Arc<CallbackRegistry>,
	requests: &Arc<CallbackRegistry>,
	responses: &Arc<CallbackRegistry>,
	raw: RawMessage,
) {
	let message = match codec.decode(&raw.payload) {
		Ok(message) => message,
		Err(error) => {
			warn!(worker_id, topic = %raw.topic, %error, "failed to decode publish, dropping");
			return;
		}
	};

	let registry = match message.kind() {
		MessageKind::Event => events,
		MessageKind::Request => requests,
		MessageKind::Response => responses,
	};

	// Run fan-out inline (not on a freshly spawned task) so it stays inside
	// this worker's `ON_WORKER` task-local scope -- callbacks that call
	// `syncRequest` must see `on_worker() == true`. `CallbackRegistry::fire`
	// catches per-callback panics itself, so one bad callback can't take
	// down this loop either.
	registry.fire(&raw.topic, &message).await;
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::message::JsonCodec;
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	};

	#[tokio::test]
	async fn decodes_and_routes_event_to_registered_callback() {
		let dispatcher = Dispatcher::new(Arc::new(JsonCodec), 1, 16);
		let hits = Arc::new(AtomicUsize::new(0));
		{
			let hits = hits.clone();
			dispatcher
				.events
				.add(
					"a/b",
					Arc::new(move |_| {
						hits.fetch_add(1, Ordering::SeqCst);
					}),
				)
				.await;
		}

		let message = crate::message::Message::Event(crate::message::Event {
			envelope: crate::message::Envelope::new("client-1", "a/b"),
		});
		let encoded = JsonCodec.encode(&message).unwrap();
		dispatcher.submit("a/b", encoded.to_vec()).await;

		// Allow the worker task to run.
		for _ in 0..50 {
			if hits.load(Ordering::SeqCst) == 1 {
				break;
			}
			tokio::time::sleep(std::time::Duration::from_millis(5)).await;
		}
		assert_eq!(hits.load(Ordering::SeqCst), 1);
		dispatcher.shutdown().await;
	}

	#[tokio::test]
	async fn panicking_callback_does_not_kill_worker() {
		let dispatcher = Dispatcher::new(Arc::new(JsonCodec), 1, 16);
		dispatcher
			.events
			.add("a/b", Arc::new(|_| panic!("boom")))
			.await;

		let survived = Arc::new(AtomicUsize::new(0));
		{
			let survived = survived.clone();
			dispatcher
				.events
				.add(
					"a/c",
					Arc::new(move |_| {
						survived.fetch_add(1, Ordering::SeqCst);
					}),
				)
				.await;
		}

		let panicking = crate::message::Message::Event(crate::message::Event {
			envelope: crate::message::Envelope::new("client-1", "a/b"),
		});
		let surviving = crate::message::Message::Event(crate::message::Event {
			envelope: crate::message::Envelope::new("client-1", "a/c"),
		});

		dispatcher
			.submit("a/b", JsonCodec.encode(&panicking).unwrap().to_vec())
			.await;
		dispatcher
			.submit("a/c", JsonCodec.encode(&surviving).unwrap().to_vec())
			.await;

		for _ in 0..50 {
			if survived.load(Ordering::SeqCst) == 1 {
				break;
			}
			tokio::time::sleep(std::time::Duration::from_millis(5)).await;
		}
		assert_eq!(survived.load(Ordering::SeqCst), 1);
		dispatcher.shutdown().await;
	}

	#[test]
	fn on_worker_is_false_outside_worker_task() {
		assert!(!on_worker());
	}
}
