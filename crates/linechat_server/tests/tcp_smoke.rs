#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use linechat_domain::Username;
use linechat_gateway::{AuthGateway, MemoryStore, MessageStore, NoopCipher};
use linechat_protocol::{ServerFrame, decode_server};
use linechat_server::server::{ChatServer, SessionSettings};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::time::timeout;

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("LINECHAT_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

fn user(name: &str) -> Username {
	Username::new(name).expect("valid username")
}

async fn start_server(require_password: bool) -> (SocketAddr, watch::Sender<bool>, Arc<MemoryStore>) {
	init_test_logging();

	let store = Arc::new(MemoryStore::new());
	let settings = SessionSettings {
		max_line_bytes: 64 * 1024,
		require_password,
	};

	let server = ChatServer::bind(
		"127.0.0.1:0".parse().expect("valid addr"),
		Arc::clone(&store) as Arc<dyn AuthGateway>,
		Arc::clone(&store) as Arc<dyn MessageStore>,
		Arc::new(NoopCipher),
		settings,
		Duration::from_secs(1),
	)
	.await
	.expect("bind server");

	let addr = server.local_addr().expect("local addr");
	let shutdown = server.shutdown_handle();
	tokio::spawn(server.run());

	(addr, shutdown, store)
}

struct Client {
	reader: BufReader<OwnedReadHalf>,
	writer: OwnedWriteHalf,
}

impl Client {
	async fn connect(addr: SocketAddr) -> Self {
		let stream = TcpStream::connect(addr).await.expect("connect");
		let (read_half, writer) = stream.into_split();
		Self {
			reader: BufReader::new(read_half),
			writer,
		}
	}

	async fn send_line(&mut self, line: &str) {
		self.writer.write_all(line.as_bytes()).await.expect("write");
		self.writer.write_all(b"\n").await.expect("write newline");
		self.writer.flush().await.expect("flush");
	}

	async fn recv(&mut self) -> ServerFrame {
		let mut line = String::new();
		let n = timeout(Duration::from_secs(1), self.reader.read_line(&mut line))
			.await
			.expect("expected a frame within timeout")
			.expect("read frame");
		assert!(n > 0, "server closed the connection");
		decode_server(line.trim_end()).expect("decodable server frame")
	}

	/// Skip frames until one matches; roster updates and notices
	/// interleave with everything else.
	async fn recv_until(&mut self, mut pred: impl FnMut(&ServerFrame) -> bool) -> ServerFrame {
		for _ in 0..16 {
			let frame = self.recv().await;
			if pred(&frame) {
				return frame;
			}
		}
		panic!("no matching frame within 16 frames");
	}

	async fn assert_silent(&mut self, window: Duration) {
		let mut line = String::new();
		let got = timeout(window, self.reader.read_line(&mut line)).await;
		assert!(got.is_err(), "unexpected frame: {line:?}");
	}

	async fn login(addr: SocketAddr, name: &str) -> Self {
		let mut client = Self::connect(addr).await;
		client.send_line(&format!("LOGIN:{name}")).await;
		match client.recv().await {
			ServerFrame::LoginOk { username } => assert_eq!(username, user(name)),
			other => panic!("expected OK, got {other:?}"),
		}
		client
	}
}

#[tokio::test]
async fn duplicate_login_is_rejected() {
	let (addr, _shutdown, _store) = start_server(false).await;

	let _alice = Client::login(addr, "alice").await;

	let mut second = Client::connect(addr).await;
	second.send_line("LOGIN:alice").await;
	match second.recv().await {
		ServerFrame::Error { reason } => assert!(reason.contains("alice"), "reason should name the user: {reason}"),
		other => panic!("expected Error, got {other:?}"),
	}
}

#[tokio::test]
async fn reserved_username_is_refused_with_a_distinct_reason() {
	let (addr, _shutdown, _store) = start_server(false).await;

	let mut client = Client::connect(addr).await;
	client.send_line("LOGIN:Server").await;
	match client.recv().await {
		ServerFrame::Error { reason } => assert!(reason.contains("reserved"), "reason: {reason}"),
		other => panic!("expected Error, got {other:?}"),
	}
}

#[tokio::test]
async fn login_before_anything_else_is_enforced() {
	let (addr, _shutdown, _store) = start_server(false).await;

	let mut client = Client::connect(addr).await;
	client.send_line("MESSAGE:too early").await;
	assert!(matches!(client.recv().await, ServerFrame::Error { .. }));
}

#[tokio::test]
async fn broadcast_reaches_others_but_not_the_sender() {
	let (addr, _shutdown, _store) = start_server(false).await;

	let mut alice = Client::login(addr, "alice").await;
	let mut bob = Client::login(addr, "bob").await;

	alice.send_line("MESSAGE:hello everyone").await;

	let frame = bob.recv_until(|f| matches!(f, ServerFrame::General { .. })).await;
	match frame {
		ServerFrame::General { sender, body } => {
			assert_eq!(sender, user("alice"));
			assert_eq!(body, "hello everyone");
		}
		other => panic!("expected General, got {other:?}"),
	}

	// Alice sees bob's join traffic but never her own broadcast.
	alice
		.recv_until(|f| matches!(f, ServerFrame::General { sender, .. } if *sender == Username::server()))
		.await;
	alice.assert_silent(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn private_message_is_delivered_and_echoed() {
	let (addr, _shutdown, _store) = start_server(false).await;

	let mut alice = Client::login(addr, "alice").await;
	let mut bob = Client::login(addr, "bob").await;

	alice.send_line("PRIVATE:bob:meet at noon").await;

	match bob.recv_until(|f| matches!(f, ServerFrame::Private { .. })).await {
		ServerFrame::Private { sender, body } => {
			assert_eq!(sender, user("alice"));
			assert_eq!(body, "meet at noon");
		}
		other => panic!("expected Private, got {other:?}"),
	}

	match alice.recv_until(|f| matches!(f, ServerFrame::Sent { .. })).await {
		ServerFrame::Sent { recipient, body } => {
			assert_eq!(recipient, user("bob"));
			assert_eq!(body, "meet at noon");
		}
		other => panic!("expected Sent echo, got {other:?}"),
	}
}

#[tokio::test]
async fn offline_private_message_is_delivered_exactly_once() {
	let (addr, _shutdown, _store) = start_server(false).await;

	let mut alice = Client::login(addr, "alice").await;
	alice.send_line("PRIVATE:bob:saved for later").await;
	// Sender is told the recipient is away; the message is stored anyway.
	alice.recv_until(|f| matches!(f, ServerFrame::Error { .. })).await;

	// First login replays the backlog.
	let mut bob = Client::login(addr, "bob").await;
	match bob.recv_until(|f| matches!(f, ServerFrame::Private { .. })).await {
		ServerFrame::Private { sender, body } => {
			assert_eq!(sender, user("alice"));
			assert_eq!(body, "saved for later");
		}
		other => panic!("expected backlog Private, got {other:?}"),
	}

	bob.send_line("LOGOUT").await;
	drop(bob);

	// Second login must not see it again.
	let mut bob = Client::login(addr, "bob").await;
	bob.recv_until(|f| matches!(f, ServerFrame::UserList { .. })).await;
	bob.assert_silent(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn roster_updates_on_join_and_leave() {
	let (addr, _shutdown, _store) = start_server(false).await;

	let mut alice = Client::login(addr, "alice").await;

	let mut bob = Client::login(addr, "bob").await;
	match alice.recv_until(|f| matches!(f, ServerFrame::UserList { users } if users.len() == 2)).await {
		ServerFrame::UserList { users } => assert_eq!(users, vec![user("alice"), user("bob")]),
		other => panic!("expected UserList, got {other:?}"),
	}

	bob.send_line("LOGOUT").await;
	drop(bob);

	match alice.recv_until(|f| matches!(f, ServerFrame::UserList { users } if users.len() == 1)).await {
		ServerFrame::UserList { users } => assert_eq!(users, vec![user("alice")]),
		other => panic!("expected UserList, got {other:?}"),
	}
}

#[tokio::test]
async fn file_broadcast_carries_the_payload() {
	let (addr, _shutdown, _store) = start_server(false).await;

	let mut alice = Client::login(addr, "alice").await;
	let mut bob = Client::login(addr, "bob").await;

	// "hi there" in base64.
	alice.send_line("FILE:greeting.txt:aGkgdGhlcmU=").await;

	match bob.recv_until(|f| matches!(f, ServerFrame::File { .. })).await {
		ServerFrame::File { sender, filename, payload } => {
			assert_eq!(sender, user("alice"));
			assert_eq!(filename, "greeting.txt");
			assert_eq!(payload, b"hi there");
		}
		other => panic!("expected File, got {other:?}"),
	}
}

#[tokio::test]
async fn malformed_frames_cost_an_error_but_not_the_connection() {
	let (addr, _shutdown, _store) = start_server(false).await;

	let mut alice = Client::login(addr, "alice").await;
	let mut bob = Client::login(addr, "bob").await;

	alice.send_line("BOGUS:whatever").await;
	assert!(matches!(
		alice.recv_until(|f| matches!(f, ServerFrame::Error { .. })).await,
		ServerFrame::Error { .. }
	));

	// The session still works afterwards.
	alice.send_line("MESSAGE:still here").await;
	let frame = bob.recv_until(|f| matches!(f, ServerFrame::General { sender, .. } if *sender == user("alice"))).await;
	match frame {
		ServerFrame::General { body, .. } => assert_eq!(body, "still here"),
		other => panic!("expected General, got {other:?}"),
	}
}

#[tokio::test]
async fn password_mode_registers_then_enforces_credentials() {
	let (addr, _shutdown, _store) = start_server(true).await;

	// First login registers the account.
	let mut alice = Client::connect(addr).await;
	alice.send_line("LOGIN:alice:hunter2").await;
	assert!(matches!(alice.recv().await, ServerFrame::LoginOk { .. }));
	alice.send_line("LOGOUT").await;
	drop(alice);

	// Wrong password is refused.
	let mut intruder = Client::connect(addr).await;
	intruder.send_line("LOGIN:alice:wrong").await;
	assert!(matches!(intruder.recv().await, ServerFrame::Error { .. }));

	// Right password gets back in.
	let mut alice = Client::connect(addr).await;
	alice.send_line("LOGIN:alice:hunter2").await;
	assert!(matches!(alice.recv().await, ServerFrame::LoginOk { .. }));

	// Password mode with no password at all is refused too.
	let mut anon = Client::connect(addr).await;
	anon.send_line("LOGIN:someone").await;
	assert!(matches!(anon.recv().await, ServerFrame::Error { .. }));
}

#[tokio::test]
async fn shutdown_notifies_sessions() {
	let (addr, shutdown, _store) = start_server(false).await;

	let mut alice = Client::login(addr, "alice").await;
	shutdown.send(true).expect("signal shutdown");

	let frame = alice
		.recv_until(|f| matches!(f, ServerFrame::General { sender, .. } if *sender == Username::server()))
		.await;
	match frame {
		ServerFrame::General { body, .. } => assert!(body.contains("shutting down"), "notice body: {body}"),
		other => panic!("expected shutdown notice, got {other:?}"),
	}
}

#[tokio::test]
async fn shutdown_unblocks_idle_sessions_before_the_grace_expires() {
	init_test_logging();

	// A deliberately long grace window: finishing promptly proves the
	// idle reader was woken, not aborted at the deadline.
	let store = Arc::new(MemoryStore::new());
	let server = ChatServer::bind(
		"127.0.0.1:0".parse().expect("valid addr"),
		Arc::clone(&store) as Arc<dyn AuthGateway>,
		Arc::clone(&store) as Arc<dyn MessageStore>,
		Arc::new(NoopCipher),
		SessionSettings {
			max_line_bytes: 64 * 1024,
			require_password: false,
		},
		Duration::from_secs(30),
	)
	.await
	.expect("bind server");
	let addr = server.local_addr().expect("local addr");
	let shutdown = server.shutdown_handle();
	let run = tokio::spawn(server.run());

	let mut alice = Client::login(addr, "alice").await;
	shutdown.send(true).expect("signal shutdown");

	alice
		.recv_until(|f| matches!(f, ServerFrame::General { sender, .. } if *sender == Username::server()))
		.await;

	// An idle session is sitting in a blocking read; it must still see
	// the connection close almost immediately.
	let mut line = String::new();
	let n = timeout(Duration::from_secs(2), alice.reader.read_line(&mut line))
		.await
		.expect("connection should close promptly")
		.expect("read after shutdown");
	assert_eq!(n, 0, "expected EOF, got {line:?}");

	timeout(Duration::from_secs(2), run)
		.await
		.expect("server should stop well inside the grace window")
		.expect("join server task")
		.expect("server run");
}
