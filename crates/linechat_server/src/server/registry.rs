#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use linechat_domain::Username;
use parking_lot::Mutex;
use tracing::debug;

use crate::server::session::Session;

/// Live-session index keyed by username.
///
/// A name can be held in two states: reserved (login handshake in
/// flight) or bound (session online). Reserving before the credential
/// check closes the window where two concurrent logins for the same
/// name both pass the uniqueness test.
#[derive(Default)]
pub struct Registry {
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	sessions: HashMap<Username, Arc<Session>>,
	reserved: HashSet<Username>,
}

/// Result of a reservation attempt, so callers can tell the user why a
/// name was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
	/// Name claimed for this handshake.
	Reserved,
	/// Name is online or mid-handshake elsewhere.
	Taken,
	/// Name is a reserved word and can never be claimed.
	ReservedName,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Claim a username for a handshake in flight.
	pub fn try_reserve(&self, username: &Username) -> ReserveOutcome {
		if username.is_reserved() {
			return ReserveOutcome::ReservedName;
		}

		let mut inner = self.inner.lock();
		if inner.sessions.contains_key(username) || inner.reserved.contains(username) {
			return ReserveOutcome::Taken;
		}
		inner.reserved.insert(username.clone());
		ReserveOutcome::Reserved
	}

	/// Drop a reservation whose handshake failed.
	pub fn release(&self, username: &Username) {
		self.inner.lock().reserved.remove(username);
	}

	/// Promote a reservation to a live session.
	pub fn bind(&self, session: Arc<Session>) {
		let mut inner = self.inner.lock();
		inner.reserved.remove(session.username());
		let replaced = inner.sessions.insert(session.username().clone(), session);
		debug_assert!(replaced.is_none(), "bind without reservation");
	}

	/// Remove a session at logout or disconnect.
	pub fn remove(&self, username: &Username) -> Option<Arc<Session>> {
		let removed = self.inner.lock().sessions.remove(username);
		if removed.is_some() {
			debug!(user = %username, "session removed from registry");
		}
		removed
	}

	pub fn get(&self, username: &Username) -> Option<Arc<Session>> {
		self.inner.lock().sessions.get(username).cloned()
	}

	pub fn is_online(&self, username: &Username) -> bool {
		self.inner.lock().sessions.contains_key(username)
	}

	/// All live sessions. Callers do their I/O on the snapshot, never
	/// under the registry lock.
	pub fn snapshot(&self) -> Vec<Arc<Session>> {
		self.inner.lock().sessions.values().cloned().collect()
	}

	/// Online usernames, sorted for a stable roster.
	pub fn usernames(&self) -> Vec<Username> {
		let mut names: Vec<Username> = self.inner.lock().sessions.keys().cloned().collect();
		names.sort();
		names
	}

	pub fn online_count(&self) -> usize {
		self.inner.lock().sessions.len()
	}
}
