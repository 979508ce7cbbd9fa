#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use linechat_gateway::{AuthGateway, MessageCipher, MessageStore};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::server::connection::handle_connection;
use crate::server::registry::Registry;
use crate::server::router::Router;

/// Per-connection knobs handed to the handshake and read loop.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub max_line_bytes: usize,
	pub require_password: bool,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			max_line_bytes: linechat_protocol::DEFAULT_MAX_LINE_BYTES,
			require_password: false,
		}
	}
}

/// Owns the TCP listener, the registry and the router, and drives the
/// accept loop until shutdown is signalled.
pub struct ChatServer {
	listener: TcpListener,
	registry: Arc<Registry>,
	router: Arc<Router>,
	auth: Arc<dyn AuthGateway>,
	settings: SessionSettings,
	shutdown_tx: watch::Sender<bool>,
	// Internal stop signal for connection tasks, fired only after the
	// shutdown notice has gone out so clients see it before the close.
	stop_tx: watch::Sender<bool>,
	shutdown_grace: Duration,
}

impl ChatServer {
	pub async fn bind(
		addr: SocketAddr,
		auth: Arc<dyn AuthGateway>,
		store: Arc<dyn MessageStore>,
		cipher: Arc<dyn MessageCipher>,
		settings: SessionSettings,
		shutdown_grace: Duration,
	) -> anyhow::Result<Self> {
		let listener = TcpListener::bind(addr).await.with_context(|| format!("bind {addr}"))?;
		let registry = Arc::new(Registry::new());
		let router = Arc::new(Router::new(Arc::clone(&registry), store, cipher));
		let (shutdown_tx, _) = watch::channel(false);
		let (stop_tx, _) = watch::channel(false);

		Ok(Self {
			listener,
			registry,
			router,
			auth,
			settings,
			shutdown_tx,
			stop_tx,
			shutdown_grace,
		})
	}

	pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
		self.listener.local_addr().context("listener local_addr")
	}

	pub fn registry(&self) -> Arc<Registry> {
		Arc::clone(&self.registry)
	}

	pub fn router(&self) -> Arc<Router> {
		Arc::clone(&self.router)
	}

	/// Handle that flips the server into shutdown when sent `true`.
	pub fn shutdown_handle(&self) -> watch::Sender<bool> {
		self.shutdown_tx.clone()
	}

	/// Accept connections until shutdown, then drain sessions within
	/// the grace window and hard-close the rest.
	pub async fn run(self) -> anyhow::Result<()> {
		let mut shutdown_rx = self.shutdown_tx.subscribe();
		let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
		let mut next_conn_id: u64 = 1;

		loop {
			// Reap finished connection tasks so the set stays small.
			while tasks.try_join_next().is_some() {}

			tokio::select! {
				accepted = self.listener.accept() => {
					let (stream, remote) = match accepted {
						Ok(pair) => pair,
						Err(e) => {
							warn!(error = %e, "accept failed");
							continue;
						}
					};

					let conn_id = next_conn_id;
					next_conn_id += 1;
					metrics::counter!("linechat_server_connections_total").increment(1);
					info!(conn_id, %remote, "accepted connection");

					let registry = Arc::clone(&self.registry);
					let router = Arc::clone(&self.router);
					let auth = Arc::clone(&self.auth);
					let settings = self.settings.clone();
					let shutdown = self.stop_tx.subscribe();
					tasks.spawn(async move {
						if let Err(e) = handle_connection(conn_id, stream, remote, registry, router, auth, settings, shutdown).await {
							warn!(conn_id, error = %e, "connection handler exited with error");
						}
						Ok(())
					});
				}
				changed = shutdown_rx.changed() => {
					if changed.is_err() || *shutdown_rx.borrow() {
						break;
					}
				}
			}
		}

		info!(sessions = self.registry.online_count(), "shutting down, notifying sessions");
		self.router.server_notice("server is shutting down".to_string(), None).await;
		for session in self.registry.snapshot() {
			session.mark_closed();
		}
		// Wake every blocked reader now that the notice is out.
		let _ = self.stop_tx.send(true);

		let drain = async {
			while tasks.join_next().await.is_some() {}
		};
		if timeout(self.shutdown_grace, drain).await.is_err() {
			warn!(grace_secs = self.shutdown_grace.as_secs(), "grace period expired, aborting remaining sessions");
			tasks.abort_all();
			while tasks.join_next().await.is_some() {}
		}

		info!("server stopped");
		Ok(())
	}
}
