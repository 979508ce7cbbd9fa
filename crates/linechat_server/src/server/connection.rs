#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use linechat_domain::{Message, Username};
use linechat_gateway::AuthGateway;
use linechat_protocol::{ClientFrame, ServerFrame, decode_client, encode_server};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Take};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::server::listener::SessionSettings;
use crate::server::registry::{Registry, ReserveOutcome};
use crate::server::router::Router;
use crate::server::session::Session;

enum ReadOutcome {
	Line(String),
	Eof,
	TooLong,
}

type FrameReader = Take<BufReader<OwnedReadHalf>>;

/// Read one newline-terminated frame, capped at `max` bytes.
async fn read_frame(reader: &mut FrameReader, max: usize) -> std::io::Result<ReadOutcome> {
	let mut buf = Vec::new();
	reader.set_limit(max as u64 + 1);
	let n = reader.read_until(b'\n', &mut buf).await?;
	if n == 0 {
		return Ok(ReadOutcome::Eof);
	}
	if buf.len() > max {
		return Ok(ReadOutcome::TooLong);
	}
	while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
		buf.pop();
	}
	Ok(ReadOutcome::Line(String::from_utf8_lossy(&buf).into_owned()))
}

/// Write a frame on the raw socket half, for use before a session exists.
async fn send_raw(writer: &mut OwnedWriteHalf, frame: &ServerFrame) -> std::io::Result<()> {
	let mut line = encode_server(frame);
	line.push('\n');
	writer.write_all(line.as_bytes()).await?;
	writer.flush().await
}

/// Drive one TCP connection: login handshake, read loop, teardown.
///
/// `shutdown` interrupts reads that would otherwise block forever, so
/// an idle session exits as soon as shutdown is signalled rather than
/// waiting out the grace period.
pub async fn handle_connection(
	conn_id: u64,
	stream: TcpStream,
	remote: SocketAddr,
	registry: Arc<Registry>,
	router: Arc<Router>,
	auth: Arc<dyn AuthGateway>,
	settings: SessionSettings,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let (read_half, mut write_half) = stream.into_split();
	let mut reader = BufReader::new(read_half).take(0);

	let Some((username, password)) = await_login(conn_id, &mut reader, &mut write_half, &settings, &mut shutdown).await? else {
		return Ok(());
	};

	// The reservation holds the name across the credential check so a
	// concurrent login for the same name cannot slip in underneath.
	match registry.try_reserve(&username) {
		ReserveOutcome::Reserved => {}
		ReserveOutcome::Taken => {
			debug!(conn_id, user = %username, "login rejected: username unavailable");
			let _ = send_raw(
				&mut write_half,
				&ServerFrame::Error {
					reason: format!("username {username} is already in use"),
				},
			)
			.await;
			return Ok(());
		}
		ReserveOutcome::ReservedName => {
			debug!(conn_id, user = %username, "login rejected: reserved username");
			let _ = send_raw(
				&mut write_half,
				&ServerFrame::Error {
					reason: format!("username {username} is reserved"),
				},
			)
			.await;
			return Ok(());
		}
	}

	if settings.require_password {
		match check_credentials(auth.as_ref(), &username, password.as_deref()).await {
			Ok(true) => {}
			Ok(false) => {
				registry.release(&username);
				let _ = send_raw(
					&mut write_half,
					&ServerFrame::Error {
						reason: "invalid credentials".to_string(),
					},
				)
				.await;
				return Ok(());
			}
			Err(e) => {
				registry.release(&username);
				let _ = send_raw(
					&mut write_half,
					&ServerFrame::Error {
						reason: "authentication unavailable".to_string(),
					},
				)
				.await;
				return Err(e.context("credential check"));
			}
		}
	}

	let session = Arc::new(Session::new(username.clone(), remote, write_half));
	registry.bind(Arc::clone(&session));
	metrics::counter!("linechat_server_logins_total").increment(1);
	metrics::gauge!("linechat_server_sessions_online").set(registry.online_count() as f64);
	info!(conn_id, user = %username, session = %session.id(), %remote, "user logged in");

	if let Err(e) = session
		.send(&ServerFrame::LoginOk {
			username: username.clone(),
		})
		.await
	{
		teardown(&registry, &router, &session, "write failed at login").await;
		return Err(e.context("send login ack"));
	}

	router.broadcast_roster().await;
	router.server_notice(format!("{username} joined the chat"), Some(&username)).await;

	if let Err(e) = router.deliver_backlog(&session).await {
		warn!(conn_id, user = %username, error = %e, "unread backlog delivery failed");
	}

	let reason = read_loop(&mut reader, &session, &router, &settings, &mut shutdown).await;

	teardown(&registry, &router, &session, reason).await;
	info!(conn_id, user = %username, reason, "session ended");
	Ok(())
}

/// First frame must be LOGIN; everything else is refused and the
/// connection closed. Returns `None` when the connection is done.
async fn await_login(
	conn_id: u64,
	reader: &mut FrameReader,
	writer: &mut OwnedWriteHalf,
	settings: &SessionSettings,
	shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<Option<(Username, Option<String>)>> {
	let outcome = tokio::select! {
		outcome = read_frame(reader, settings.max_line_bytes) => outcome.context("read login frame")?,
		_ = shutdown.wait_for(|stop| *stop) => {
			debug!(conn_id, "shutdown before login completed");
			return Ok(None);
		}
	};
	let line = match outcome {
		ReadOutcome::Line(line) => line,
		ReadOutcome::Eof => {
			debug!(conn_id, "peer disconnected before login");
			return Ok(None);
		}
		ReadOutcome::TooLong => {
			let _ = send_raw(
				writer,
				&ServerFrame::Error {
					reason: "frame too large".to_string(),
				},
			)
			.await;
			return Ok(None);
		}
	};

	match decode_client(&line) {
		Ok(ClientFrame::Login { username, password }) => Ok(Some((username, password))),
		Ok(_) => {
			let _ = send_raw(
				writer,
				&ServerFrame::Error {
					reason: "login required before any other command".to_string(),
				},
			)
			.await;
			Ok(None)
		}
		Err(e) => {
			metrics::counter!("linechat_server_frames_rejected_total").increment(1);
			let _ = send_raw(writer, &ServerFrame::Error { reason: e.to_string() }).await;
			Ok(None)
		}
	}
}

/// Accept known names with the right password, auto-register unknown
/// ones. Registration losing the race to a concurrent register simply
/// falls through to a normal password check.
async fn check_credentials(auth: &dyn AuthGateway, username: &Username, password: Option<&str>) -> anyhow::Result<bool> {
	let Some(password) = password else {
		return Ok(false);
	};
	if auth.register(username, password).await.context("register user")? {
		info!(user = %username, "new account registered at first login");
		return Ok(true);
	}
	auth.authenticate(username, password).await.context("authenticate user")
}

/// Pump frames until logout, disconnect or a dead write side.
async fn read_loop(
	reader: &mut FrameReader,
	session: &Arc<Session>,
	router: &Arc<Router>,
	settings: &SessionSettings,
	shutdown: &mut watch::Receiver<bool>,
) -> &'static str {
	loop {
		if !session.is_alive() {
			return "write side closed";
		}

		let outcome = tokio::select! {
			outcome = read_frame(reader, settings.max_line_bytes) => outcome,
			_ = shutdown.wait_for(|stop| *stop) => return "server shutdown",
		};
		let line = match outcome {
			Ok(ReadOutcome::Line(line)) => line,
			Ok(ReadOutcome::Eof) => return "peer disconnected",
			Ok(ReadOutcome::TooLong) => {
				session
					.send_best_effort(&ServerFrame::Error {
						reason: "frame too large".to_string(),
					})
					.await;
				return "oversized frame";
			}
			Err(e) => {
				debug!(user = %session.username(), error = %e, "read failed");
				return "read error";
			}
		};

		if line.is_empty() {
			continue;
		}

		let frame = match decode_client(&line) {
			Ok(frame) => frame,
			Err(e) => {
				// Malformed input costs the client an ERROR frame, not
				// the connection.
				metrics::counter!("linechat_server_frames_rejected_total").increment(1);
				session.send_best_effort(&ServerFrame::Error { reason: e.to_string() }).await;
				continue;
			}
		};

		let message = match frame {
			ClientFrame::Logout => return "logout",
			ClientFrame::Login { .. } => {
				session
					.send_best_effort(&ServerFrame::Error {
						reason: "already logged in".to_string(),
					})
					.await;
				continue;
			}
			ClientFrame::General { body } => Message::General {
				sender: session.username().clone(),
				body,
			},
			ClientFrame::Private { recipient, body } => Message::Private {
				sender: session.username().clone(),
				recipient,
				body,
			},
			ClientFrame::File { filename, payload } => Message::FileChunk {
				sender: session.username().clone(),
				recipient: None,
				filename,
				payload,
			},
			ClientFrame::PrivateFile {
				recipient,
				filename,
				payload,
			} => Message::FileChunk {
				sender: session.username().clone(),
				recipient: Some(recipient),
				filename,
				payload,
			},
		};

		if let Err(e) = router.dispatch(message).await {
			warn!(user = %session.username(), error = %e, "message dispatch failed");
			session
				.send_best_effort(&ServerFrame::Error {
					reason: "message could not be delivered".to_string(),
				})
				.await;
		}
	}
}

async fn teardown(registry: &Arc<Registry>, router: &Arc<Router>, session: &Arc<Session>, reason: &str) {
	session.mark_closed();
	if registry.remove(session.username()).is_some() {
		metrics::gauge!("linechat_server_sessions_online").set(registry.online_count() as f64);
		router.broadcast_roster().await;
		router.server_notice(format!("{} left the chat", session.username()), None).await;
	}
	debug!(user = %session.username(), reason, "session torn down");
}
