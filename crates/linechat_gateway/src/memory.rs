#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};

use linechat_domain::{UnreadMessage, Username};
use parking_lot::Mutex;

use crate::{AuthGateway, MessageStore};

/// Process-local store used when no database URL is configured, and by
/// tests that need gateway behavior without real I/O.
///
/// Nothing survives a restart. Credentials are kept verbatim since the
/// whole store is already confined to server memory.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	users: BTreeMap<Username, String>,
	unread: HashMap<Username, Vec<UnreadMessage>>,
	delivered: Vec<UnreadMessage>,
	general: Vec<(Username, String)>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of general messages recorded so far.
	pub fn general_len(&self) -> usize {
		self.inner.lock().general.len()
	}

	/// Number of private messages recorded as already delivered.
	pub fn delivered_len(&self) -> usize {
		self.inner.lock().delivered.len()
	}

	/// Stored bodies currently queued for `recipient`, without consuming
	/// them.
	pub fn unread_bodies(&self, recipient: &Username) -> Vec<String> {
		self.inner
			.lock()
			.unread
			.get(recipient)
			.map(|records| records.iter().map(|r| r.body.clone()).collect())
			.unwrap_or_default()
	}
}

#[async_trait::async_trait]
impl AuthGateway for MemoryStore {
	async fn authenticate(&self, username: &Username, password: &str) -> anyhow::Result<bool> {
		let inner = self.inner.lock();
		Ok(inner.users.get(username).is_some_and(|stored| stored.as_str() == password))
	}

	async fn register(&self, username: &Username, password: &str) -> anyhow::Result<bool> {
		let mut inner = self.inner.lock();
		if inner.users.contains_key(username) {
			return Ok(false);
		}
		inner.users.insert(username.clone(), password.to_string());
		Ok(true)
	}

	async fn all_users(&self) -> anyhow::Result<Vec<Username>> {
		Ok(self.inner.lock().users.keys().cloned().collect())
	}
}

#[async_trait::async_trait]
impl MessageStore for MemoryStore {
	async fn save_message(&self, sender: &Username, recipient: Option<&Username>, body: &str) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();
		match recipient {
			Some(recipient) => {
				let record = UnreadMessage {
					sender: sender.clone(),
					recipient: Some(recipient.clone()),
					body: body.to_string(),
					timestamp_unix_ms: chrono::Utc::now().timestamp_millis(),
					read: false,
				};
				inner.unread.entry(recipient.clone()).or_default().push(record);
			}
			None => inner.general.push((sender.clone(), body.to_string())),
		}
		Ok(())
	}

	async fn save_delivered(&self, sender: &Username, recipient: &Username, body: &str) -> anyhow::Result<()> {
		let record = UnreadMessage {
			sender: sender.clone(),
			recipient: Some(recipient.clone()),
			body: body.to_string(),
			timestamp_unix_ms: chrono::Utc::now().timestamp_millis(),
			read: true,
		};
		self.inner.lock().delivered.push(record);
		Ok(())
	}

	async fn take_unread(&self, recipient: &Username) -> anyhow::Result<Vec<UnreadMessage>> {
		Ok(self.inner.lock().unread.remove(recipient).unwrap_or_default())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(name: &str) -> Username {
		Username::new(name).expect("valid username")
	}

	#[tokio::test]
	async fn register_then_authenticate() {
		let store = MemoryStore::new();
		assert!(store.register(&user("alice"), "pw").await.expect("register"));
		assert!(!store.register(&user("alice"), "other").await.expect("register"), "duplicate name must be refused");

		assert!(store.authenticate(&user("alice"), "pw").await.expect("auth"));
		assert!(!store.authenticate(&user("alice"), "wrong").await.expect("auth"));
		assert!(!store.authenticate(&user("nobody"), "pw").await.expect("auth"));
	}

	#[tokio::test]
	async fn all_users_is_sorted() {
		let store = MemoryStore::new();
		store.register(&user("zed"), "pw").await.expect("register");
		store.register(&user("alice"), "pw").await.expect("register");

		let users = store.all_users().await.expect("all_users");
		assert_eq!(users, vec![user("alice"), user("zed")]);
	}

	#[tokio::test]
	async fn take_unread_drains_exactly_once() {
		let store = MemoryStore::new();
		let bob = user("bob");
		store.save_message(&user("alice"), Some(&bob), "first").await.expect("save");
		store.save_message(&user("alice"), Some(&bob), "second").await.expect("save");

		let backlog = store.take_unread(&bob).await.expect("take");
		assert_eq!(backlog.len(), 2);
		assert_eq!(backlog[0].body, "first");
		assert_eq!(backlog[1].body, "second");

		assert!(store.take_unread(&bob).await.expect("take").is_empty(), "a second take must see nothing");
	}

	#[tokio::test]
	async fn delivered_messages_never_enter_the_backlog() {
		let store = MemoryStore::new();
		let bob = user("bob");
		store.save_delivered(&user("alice"), &bob, "seen live").await.expect("save");

		assert_eq!(store.delivered_len(), 1);
		assert!(store.take_unread(&bob).await.expect("take").is_empty());
	}

	#[tokio::test]
	async fn general_messages_do_not_enter_the_backlog() {
		let store = MemoryStore::new();
		store.save_message(&user("alice"), None, "hello room").await.expect("save");

		assert_eq!(store.general_len(), 1);
		assert!(store.take_unread(&user("alice")).await.expect("take").is_empty());
	}
}
