#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as _, anyhow};
use linechat_domain::{SessionId, Username};
use linechat_protocol::{ServerFrame, encode_server};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Handle to one authenticated connection's outbound half.
///
/// The writer sits behind an async mutex so concurrent routes to the
/// same session serialize per frame instead of interleaving bytes. A
/// failed write latches the session closed; the connection task notices
/// and tears the session down.
pub struct Session {
	id: SessionId,
	username: Username,
	remote: SocketAddr,
	writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
	alive: AtomicBool,
	connected_at_ms: i64,
}

impl Session {
	pub fn new(username: Username, remote: SocketAddr, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
		Self {
			id: SessionId::generate(),
			username,
			remote,
			writer: Mutex::new(Box::new(writer)),
			alive: AtomicBool::new(true),
			connected_at_ms: crate::util::time::unix_ms_now(),
		}
	}

	pub fn id(&self) -> SessionId {
		self.id
	}

	pub fn username(&self) -> &Username {
		&self.username
	}

	pub fn remote(&self) -> SocketAddr {
		self.remote
	}

	pub fn connected_at_ms(&self) -> i64 {
		self.connected_at_ms
	}

	pub fn is_alive(&self) -> bool {
		self.alive.load(Ordering::Relaxed)
	}

	pub fn mark_closed(&self) {
		self.alive.store(false, Ordering::Relaxed);
	}

	/// Encode and write one frame followed by the line terminator.
	pub async fn send(&self, frame: &ServerFrame) -> anyhow::Result<()> {
		if !self.is_alive() {
			return Err(anyhow!("session closed"));
		}

		let mut line = encode_server(frame);
		line.push('\n');

		let mut writer = self.writer.lock().await;
		let result = async {
			writer.write_all(line.as_bytes()).await.context("write frame")?;
			writer.flush().await.context("flush frame")
		}
		.await;

		if result.is_err() {
			self.mark_closed();
			debug!(user = %self.username, session = %self.id, "write failed, session marked closed");
		}
		result
	}

	/// Send that swallows failures. Routing to a dying peer must not
	/// abort delivery to everyone else.
	pub async fn send_best_effort(&self, frame: &ServerFrame) {
		if let Err(e) = self.send(frame).await {
			debug!(user = %self.username, error = %e, "dropped frame for closing session");
		}
	}
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("id", &self.id)
			.field("username", &self.username)
			.field("remote", &self.remote)
			.field("alive", &self.is_alive())
			.finish()
	}
}
