#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use linechat_domain::{Message, Username};
use linechat_gateway::{MessageCipher, MessageStore};
use linechat_protocol::ServerFrame;
use tracing::{debug, warn};

use crate::server::registry::Registry;
use crate::server::session::Session;

/// Routes authenticated messages to their destinations.
///
/// All fan-out works on registry snapshots so no socket write ever
/// happens under the registry lock. Stored bodies pass through the
/// configured cipher on the way in and out.
pub struct Router {
	registry: Arc<Registry>,
	store: Arc<dyn MessageStore>,
	cipher: Arc<dyn MessageCipher>,
}

impl Router {
	pub fn new(registry: Arc<Registry>, store: Arc<dyn MessageStore>, cipher: Arc<dyn MessageCipher>) -> Self {
		Self { registry, store, cipher }
	}

	/// Dispatch one message coming off a session's read loop.
	pub async fn dispatch(&self, message: Message) -> anyhow::Result<()> {
		match message {
			Message::General { sender, body } => self.route_general(&sender, &body).await,
			Message::Private { sender, recipient, body } => self.route_private(&sender, &recipient, &body).await,
			Message::FileChunk {
				sender,
				recipient,
				filename,
				payload,
			} => match recipient {
				Some(recipient) => self.route_private_file(&sender, &recipient, filename, payload).await,
				None => self.route_file_broadcast(&sender, filename, payload).await,
			},
			// Login and logout are lifecycle events owned by the
			// connection handler, not routable payloads.
			Message::Login { .. } | Message::Logout | Message::Error { .. } => Ok(()),
		}
	}

	async fn route_general(&self, sender: &Username, body: &str) -> anyhow::Result<()> {
		self.persist_general(sender, body).await;

		let frame = ServerFrame::General {
			sender: sender.clone(),
			body: body.to_string(),
		};

		let mut delivered = 0usize;
		for session in self.registry.snapshot() {
			if session.username() == sender {
				continue;
			}
			session.send_best_effort(&frame).await;
			delivered += 1;
		}

		metrics::counter!("linechat_server_messages_routed_total", "kind" => "general").increment(1);
		debug!(user = %sender, delivered, "general message routed");
		Ok(())
	}

	async fn route_private(&self, sender: &Username, recipient: &Username, body: &str) -> anyhow::Result<()> {
		if let Some(session) = self.registry.get(recipient) {
			session
				.send_best_effort(&ServerFrame::Private {
					sender: sender.clone(),
					body: body.to_string(),
				})
				.await;
			self.echo_to_sender(sender, recipient, body).await;
			self.persist_delivered(sender, recipient, body).await;
		} else {
			// Offline recipient: the body goes into the unread backlog
			// and is replayed at their next login. A store failure here
			// would silently lose the message, so it surfaces to the
			// sender instead.
			let sealed = self.cipher.encrypt(body).context("encrypt message body")?;
			self.store
				.save_message(sender, Some(recipient), &sealed)
				.await
				.context("store offline private message")?;
			debug!(from = %sender, to = %recipient, "private message queued for offline recipient");
			self.error_to(sender, format!("user {recipient} is offline, message stored for delivery"))
				.await;
		}

		metrics::counter!("linechat_server_messages_routed_total", "kind" => "private").increment(1);
		Ok(())
	}

	/// Confirmation copy so the sender's own transcript shows the message.
	async fn echo_to_sender(&self, sender: &Username, recipient: &Username, body: &str) {
		if let Some(session) = self.registry.get(sender) {
			session
				.send_best_effort(&ServerFrame::Sent {
					recipient: recipient.clone(),
					body: body.to_string(),
				})
				.await;
		}
	}

	async fn route_file_broadcast(&self, sender: &Username, filename: String, payload: Vec<u8>) -> anyhow::Result<()> {
		// History keeps a text notice, never the blob itself.
		self.persist_general(sender, &format!("sent a file: {filename}")).await;

		let frame = ServerFrame::File {
			sender: sender.clone(),
			filename,
			payload,
		};

		for session in self.registry.snapshot() {
			if session.username() == sender {
				continue;
			}
			session.send_best_effort(&frame).await;
		}

		metrics::counter!("linechat_server_messages_routed_total", "kind" => "file").increment(1);
		Ok(())
	}

	async fn route_private_file(
		&self,
		sender: &Username,
		recipient: &Username,
		filename: String,
		payload: Vec<u8>,
	) -> anyhow::Result<()> {
		let Some(session) = self.registry.get(recipient) else {
			// Files are not spooled; the sender has to retry when the
			// recipient is back.
			self.error_to(sender, format!("user {recipient} is not online")).await;
			return Ok(());
		};

		session
			.send_best_effort(&ServerFrame::PrivateFile {
				sender: sender.clone(),
				filename,
				payload,
			})
			.await;

		metrics::counter!("linechat_server_messages_routed_total", "kind" => "private_file").increment(1);
		Ok(())
	}

	/// Push an ERROR frame back to one user.
	pub async fn error_to(&self, username: &Username, reason: String) {
		if let Some(session) = self.registry.get(username) {
			session.send_best_effort(&ServerFrame::Error { reason }).await;
		}
	}

	/// Send the current roster to every online user.
	pub async fn broadcast_roster(&self) {
		let frame = ServerFrame::UserList {
			users: self.registry.usernames(),
		};
		for session in self.registry.snapshot() {
			session.send_best_effort(&frame).await;
		}
	}

	/// Broadcast a notice from the reserved server identity, skipping
	/// `except` (a user should not be told about their own arrival).
	pub async fn server_notice(&self, body: String, except: Option<&Username>) {
		let frame = ServerFrame::General {
			sender: Username::server(),
			body,
		};
		for session in self.registry.snapshot() {
			if except.is_some_and(|u| session.username() == u) {
				continue;
			}
			session.send_best_effort(&frame).await;
		}
	}

	/// Replay the unread backlog to a freshly logged-in session.
	///
	/// The store marks entries consumed in the same call, so a crash
	/// between fetch and delivery drops them rather than duplicating
	/// them on the next login.
	pub async fn deliver_backlog(&self, session: &Session) -> anyhow::Result<()> {
		let backlog = self
			.store
			.take_unread(session.username())
			.await
			.context("fetch unread backlog")?;

		if backlog.is_empty() {
			return Ok(());
		}

		debug!(user = %session.username(), count = backlog.len(), "delivering unread backlog");
		for record in backlog {
			let body = match self.cipher.decrypt(&record.body) {
				Ok(body) => body,
				Err(e) => {
					warn!(user = %session.username(), error = %e, "undecryptable stored message skipped");
					continue;
				}
			};
			session
				.send_best_effort(&ServerFrame::Private {
					sender: record.sender,
					body,
				})
				.await;
		}
		Ok(())
	}

	/// Record a live-delivered private message, marked read so it stays
	/// out of the backlog.
	async fn persist_delivered(&self, sender: &Username, recipient: &Username, body: &str) {
		// The recipient already has the message; a failing store must not
		// fail the delivery after the fact.
		match self.cipher.encrypt(body) {
			Ok(sealed) => {
				if let Err(e) = self.store.save_delivered(sender, recipient, &sealed).await {
					warn!(error = %e, "failed to record delivered private message");
				}
			}
			Err(e) => warn!(error = %e, "failed to encrypt delivered private message"),
		}
	}

	async fn persist_general(&self, sender: &Username, body: &str) {
		// History writes are advisory; a failing store must not block
		// live routing.
		match self.cipher.encrypt(body) {
			Ok(sealed) => {
				if let Err(e) = self.store.save_message(sender, None, &sealed).await {
					warn!(error = %e, "failed to record general message history");
				}
			}
			Err(e) => warn!(error = %e, "failed to encrypt general message for history"),
		}
	}
}
