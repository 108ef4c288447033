//! Topic-keyed callback registries with trailing-`#`-wildcard fan-out.
//!
//! Each message kind (event/request/response) gets its own registry so a
//! callback registered for events never fires for requests sharing the same
//! topic string. Registration uses the reserved empty-string key as the
//! "no topic filter" global listener, matching every message of that kind.
use std::{
	collections::{HashMap, HashSet},
	sync::atomic::{AtomicBool, AtomicU64, Ordering},
	sync::Arc,
};

use tokio::sync::RwLock;
use tracing::error;

use crate::message::Message;

/// Reserved topic key meaning "fire for every message of this kind",
/// independent of wildcard matching.
pub const GLOBAL_TOPIC: &str = "";

pub type CallbackId = u64;

pub type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

struct Entry {
	id: CallbackId,
	callback: Callback,
}

/// A topic -> callback-set registry for one message kind.
///
/// Wildcard fan-out only walks trailing `#` segments (`a/b/#` matches
/// publishes to `a/b`, `a/b/c`, `a/b/c/d`, ...) -- `+` single-level wildcards
/// are not supported for registration lookups, matching the scope of this
/// crate's subscription model.
pub struct CallbackRegistry {
	next_id: AtomicU64,
	by_topic: RwLock<HashMap<String, Vec<Entry>>>,
	/// Recomputed on every add/remove by scanning the registered topic keys,
	/// rather than held as an independent setting.
	wildcarding_enabled: AtomicBool,
}

impl Default for CallbackRegistry {
	fn default() -> Self {
		Self::new()
	}
}

fn is_wildcard_filter(topic: &str) -> bool {
	topic == "#" || topic.ends_with("/#")
}

impl CallbackRegistry {
	pub fn new() -> Self {
		Self {
			next_id: AtomicU64::new(1),
			by_topic: RwLock::new(HashMap::new()),
			wildcarding_enabled: AtomicBool::new(false),
		}
	}

	/// Registers `callback` for `topic` (use [`GLOBAL_TOPIC`] for "every message").
	pub async fn add(&self, topic: impl Into<String>, callback: Callback) -> CallbackId {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let topic = topic.into();
		if is_wildcard_filter(&topic) {
			self.wildcarding_enabled.store(true, Ordering::Relaxed);
		}
		let mut guard = self.by_topic.write().await;
		guard.entry(topic).or_default().push(Entry { id, callback });
		id
	}

	/// Removes a single callback by id. Returns `true` if it was found.
	pub async fn remove(&self, id: CallbackId) -> bool {
		let mut guard = self.by_topic.write().await;
		let mut removed = false;
		guard.retain(|_, entries| {
			let before = entries.len();
			entries.retain(|entry| entry.id != id);
			removed |= entries.len() != before;
			!entries.is_empty()
		});
		self.recompute_wildcarding(&guard);
		removed
	}

	/// Removes every callback registered for `topic` exactly (no wildcard
	/// expansion). Returns the number of callbacks removed.
	pub async fn remove_topic(&self, topic: &str) -> usize {
		let mut guard = self.by_topic.write().await;
		let removed = guard.remove(topic).map(|v| v.len()).unwrap_or(0);
		self.recompute_wildcarding(&guard);
		removed
	}

	fn recompute_wildcarding(&self, guard: &HashMap<String, Vec<Entry>>) {
		let any_wildcard = guard.keys().any(|topic| is_wildcard_filter(topic));
		self.wildcarding_enabled
			.store(any_wildcard, Ordering::Relaxed);
	}

	pub async fn is_empty(&self) -> bool {
		self.by_topic.read().await.is_empty()
	}

	pub async fn topics(&self) -> HashSet<String> {
		self.by_topic
			.read()
			.await
			.keys()
			.filter(|topic| topic.as_str() != GLOBAL_TOPIC)
			.cloned()
			.collect()
	}

	/// Invokes every callback registered for `topic`, for any wildcard
	/// ancestor of `topic`, and for [`GLOBAL_TOPIC`].
	///
	/// Only holds the read lock long enough to snapshot the matching
	/// listener sets; callbacks run after it is dropped, so one that adds or
	/// removes a callback (taking the write lock) does not deadlock.
	pub async fn fire(&self, topic: &str, message: &Message) {
		let callbacks: Vec<Callback> = {
			let guard = self.by_topic.read().await;
			let mut callbacks = Vec::new();

			if let Some(entries) = guard.get(GLOBAL_TOPIC) {
				callbacks.extend(entries.iter().map(|entry| entry.callback.clone()));
			}
			if let Some(entries) = guard.get(topic) {
				callbacks.extend(entries.iter().map(|entry| entry.callback.clone()));
			}
			if self.wildcarding_enabled.load(Ordering::Relaxed) {
				for ancestor in wildcard_ancestors(topic) {
					if let Some(entries) = guard.get(&ancestor) {
						callbacks.extend(entries.iter().map(|entry| entry.callback.clone()));
					}
				}
			}
			callbacks
		};

		for callback in callbacks {
			// A panicking callback unwinds only this call, not the dispatcher
			// worker driving it.
			if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(message))).is_err() {
				error!(topic, "callback panicked");
			}
		}
	}
}

/// Yields every trailing-`#` subscription that would have matched a publish
/// to `topic`, e.g. `"a/b/c"` -> `["a/b/#", "a/#", "#"]` and, for a leading
/// slash, `"/a/b/c"` -> `["/a/b/#", "/a/#", "/#", "#"]`. A topic that is
/// literally `"#"` has no parents.
fn wildcard_ancestors(topic: &str) -> Vec<String> {
	if topic == "#" {
		return Vec::new();
	}
	let segments: Vec<&str> = topic.split('/').collect();
	let mut ancestors = Vec::with_capacity(segments.len());
	for depth in (0..segments.len()).rev() {
		if depth == 0 {
			ancestors.push("#".to_string());
		} else {
			let prefix = segments[..depth].join("/");
			ancestors.push(format!("{prefix}/#"));
		}
	}
	ancestors
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::message::{Envelope, Event};
	use std::sync::Mutex;

	fn event(topic: &str) -> Message {
		Message::Event(Event {
			envelope: Envelope::new("client-1", topic),
		})
	}

	#[test]
	fn wildcard_ancestors_walks_trailing_hash_only() {
		assert_eq!(wildcard_ancestors("a/b/c"), vec!["a/b/#", "a/#", "#"]);
		assert_eq!(wildcard_ancestors("a"), vec!["#"]);
	}

	#[test]
	fn wildcard_ancestors_handles_leading_slash() {
		assert_eq!(
			wildcard_ancestors("/a/b/c"),
			vec!["/a/b/#", "/a/#", "/#", "#"],
		);
	}

	#[test]
	fn literal_hash_topic_has_no_parents() {
		assert!(wildcard_ancestors("#").is_empty());
	}

	#[tokio::test]
	async fn fires_exact_topic_and_global_listener() {
		let registry = CallbackRegistry::new();
		let exact_hits = Arc::new(Mutex::new(0));
		let global_hits = Arc::new(Mutex::new(0));

		{
			let hits = exact_hits.clone();
			registry
				.add("a/b", Arc::new(move |_| *hits.lock().unwrap() += 1))
				.await;
		}
		{
			let hits = global_hits.clone();
			registry
				.add(GLOBAL_TOPIC, Arc::new(move |_| *hits.lock().unwrap() += 1))
				.await;
		}

		registry.fire("a/b", &event("a/b")).await;

		assert_eq!(*exact_hits.lock().unwrap(), 1);
		assert_eq!(*global_hits.lock().unwrap(), 1);
	}

	#[tokio::test]
	async fn fires_wildcard_ancestor_when_enabled() {
		let registry = CallbackRegistry::new();
		let hits = Arc::new(Mutex::new(0));
		{
			let hits = hits.clone();
			registry
				.add("a/#", Arc::new(move |_| *hits.lock().unwrap() += 1))
				.await;
		}

		registry.fire("a/b/c", &event("a/b/c")).await;
		assert_eq!(*hits.lock().unwrap(), 1);
	}

	#[tokio::test]
	async fn wildcarding_disables_once_last_wildcard_removed() {
		let registry = CallbackRegistry::new();
		let hits = Arc::new(Mutex::new(0));
		let id = {
			let hits = hits.clone();
			registry
				.add("a/#", Arc::new(move |_| *hits.lock().unwrap() += 1))
				.await
		};

		assert!(registry.wildcarding_enabled.load(Ordering::Relaxed));
		assert!(registry.remove(id).await);
		assert!(!registry.wildcarding_enabled.load(Ordering::Relaxed));

		registry.fire("a/b/c", &event("a/b/c")).await;
		assert_eq!(*hits.lock().unwrap(), 0);
	}

	#[tokio::test]
	async fn remove_by_id_stops_future_fires() {
		let registry = CallbackRegistry::new();
		let hits = Arc::new(Mutex::new(0));
		let id = {
			let hits = hits.clone();
			registry
				.add("a/b", Arc::new(move |_| *hits.lock().unwrap() += 1))
				.await
		};

		assert!(registry.remove(id).await);
		registry.fire("a/b", &event("a/b")).await;
		assert_eq!(*hits.lock().unwrap(), 0);
		assert!(registry.is_empty().await);
	}
}
