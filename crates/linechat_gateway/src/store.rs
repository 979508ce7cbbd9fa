#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use linechat_domain::{UnreadMessage, Username};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use sqlx::Row as _;
use tracing::info;

use crate::{AuthGateway, MessageStore};

const SALT_LEN: usize = 16;

/// SQL-backed credential and message store.
///
/// The backend is picked from the database URL scheme; the same store
/// serves both the auth gateway and the message persistence gateway.
#[derive(Clone)]
pub struct SqlStore {
	backend: Backend,
}

#[derive(Clone)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

fn generate_salt() -> String {
	let mut salt = [0u8; SALT_LEN];
	OsRng.fill_bytes(&mut salt);
	BASE64.encode(salt)
}

fn hash_password(password: &str, salt_b64: &str) -> anyhow::Result<String> {
	let salt = BASE64.decode(salt_b64).context("decode stored salt")?;
	let mut hasher = Sha256::new();
	hasher.update(&salt);
	hasher.update(password.as_bytes());
	Ok(BASE64.encode(hasher.finalize()))
}

fn now_unix_ms() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			Backend::Sqlite(sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			Backend::Postgres(sqlx::PgPool::connect(database_url).await.context("connect postgres")?)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			Backend::Mysql(sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?)
		} else {
			return Err(anyhow!("unsupported database_url scheme"));
		};

		let store = Self { backend };
		store.init_schema().await?;
		info!("message store ready");
		Ok(store)
	}

	async fn init_schema(&self) -> anyhow::Result<()> {
		let (users, private_messages, general_messages) = match &self.backend {
			Backend::Sqlite(_) => (
				"CREATE TABLE IF NOT EXISTS users (\
					id INTEGER PRIMARY KEY AUTOINCREMENT, \
					username TEXT UNIQUE NOT NULL, \
					password_hash TEXT NOT NULL, \
					salt TEXT NOT NULL, \
					created_at_ms INTEGER NOT NULL)",
				"CREATE TABLE IF NOT EXISTS private_messages (\
					id INTEGER PRIMARY KEY AUTOINCREMENT, \
					sender TEXT NOT NULL, \
					recipient TEXT NOT NULL, \
					body TEXT NOT NULL, \
					timestamp_ms INTEGER NOT NULL, \
					is_read INTEGER NOT NULL DEFAULT 0)",
				"CREATE TABLE IF NOT EXISTS general_messages (\
					id INTEGER PRIMARY KEY AUTOINCREMENT, \
					sender TEXT NOT NULL, \
					body TEXT NOT NULL, \
					timestamp_ms INTEGER NOT NULL)",
			),
			Backend::Postgres(_) => (
				"CREATE TABLE IF NOT EXISTS users (\
					id BIGSERIAL PRIMARY KEY, \
					username TEXT UNIQUE NOT NULL, \
					password_hash TEXT NOT NULL, \
					salt TEXT NOT NULL, \
					created_at_ms BIGINT NOT NULL)",
				"CREATE TABLE IF NOT EXISTS private_messages (\
					id BIGSERIAL PRIMARY KEY, \
					sender TEXT NOT NULL, \
					recipient TEXT NOT NULL, \
					body TEXT NOT NULL, \
					timestamp_ms BIGINT NOT NULL, \
					is_read BOOLEAN NOT NULL DEFAULT FALSE)",
				"CREATE TABLE IF NOT EXISTS general_messages (\
					id BIGSERIAL PRIMARY KEY, \
					sender TEXT NOT NULL, \
					body TEXT NOT NULL, \
					timestamp_ms BIGINT NOT NULL)",
			),
			Backend::Mysql(_) => (
				"CREATE TABLE IF NOT EXISTS users (\
					id BIGINT PRIMARY KEY AUTO_INCREMENT, \
					username VARCHAR(64) UNIQUE NOT NULL, \
					password_hash TEXT NOT NULL, \
					salt TEXT NOT NULL, \
					created_at_ms BIGINT NOT NULL)",
				"CREATE TABLE IF NOT EXISTS private_messages (\
					id BIGINT PRIMARY KEY AUTO_INCREMENT, \
					sender VARCHAR(64) NOT NULL, \
					recipient VARCHAR(64) NOT NULL, \
					body TEXT NOT NULL, \
					timestamp_ms BIGINT NOT NULL, \
					is_read BOOLEAN NOT NULL DEFAULT FALSE)",
				"CREATE TABLE IF NOT EXISTS general_messages (\
					id BIGINT PRIMARY KEY AUTO_INCREMENT, \
					sender VARCHAR(64) NOT NULL, \
					body TEXT NOT NULL, \
					timestamp_ms BIGINT NOT NULL)",
			),
		};

		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(users).execute(pool).await.context("create users (sqlite)")?;
				sqlx::query(private_messages)
					.execute(pool)
					.await
					.context("create private_messages (sqlite)")?;
				sqlx::query(general_messages)
					.execute(pool)
					.await
					.context("create general_messages (sqlite)")?;
			}
			Backend::Postgres(pool) => {
				sqlx::query(users).execute(pool).await.context("create users (postgres)")?;
				sqlx::query(private_messages)
					.execute(pool)
					.await
					.context("create private_messages (postgres)")?;
				sqlx::query(general_messages)
					.execute(pool)
					.await
					.context("create general_messages (postgres)")?;
			}
			Backend::Mysql(pool) => {
				sqlx::query(users).execute(pool).await.context("create users (mysql)")?;
				sqlx::query(private_messages)
					.execute(pool)
					.await
					.context("create private_messages (mysql)")?;
				sqlx::query(general_messages)
					.execute(pool)
					.await
					.context("create general_messages (mysql)")?;
			}
		}

		Ok(())
	}

	async fn fetch_credentials(&self, username: &Username) -> anyhow::Result<Option<(String, String)>> {
		let row: Option<(String, String)> = match &self.backend {
			Backend::Sqlite(pool) => {
				match sqlx::query("SELECT password_hash, salt FROM users WHERE username = ?")
					.bind(username.as_str())
					.fetch_optional(pool)
					.await
					.context("select credentials (sqlite)")?
				{
					Some(row) => Some((row.try_get("password_hash")?, row.try_get("salt")?)),
					None => None,
				}
			}
			Backend::Postgres(pool) => {
				match sqlx::query("SELECT password_hash, salt FROM users WHERE username = $1")
					.bind(username.as_str())
					.fetch_optional(pool)
					.await
					.context("select credentials (postgres)")?
				{
					Some(row) => Some((row.try_get("password_hash")?, row.try_get("salt")?)),
					None => None,
				}
			}
			Backend::Mysql(pool) => {
				match sqlx::query("SELECT password_hash, salt FROM users WHERE username = ?")
					.bind(username.as_str())
					.fetch_optional(pool)
					.await
					.context("select credentials (mysql)")?
				{
					Some(row) => Some((row.try_get("password_hash")?, row.try_get("salt")?)),
					None => None,
				}
			}
		};

		match row {
			Some((hash, salt)) => Ok(Some((hash, salt))),
			None => Ok(None),
		}
	}
}

#[async_trait::async_trait]
impl AuthGateway for SqlStore {
	async fn authenticate(&self, username: &Username, password: &str) -> anyhow::Result<bool> {
		let Some((stored_hash, salt)) = self.fetch_credentials(username).await? else {
			return Ok(false);
		};
		Ok(hash_password(password, &salt)? == stored_hash)
	}

	async fn register(&self, username: &Username, password: &str) -> anyhow::Result<bool> {
		if self.fetch_credentials(username).await?.is_some() {
			return Ok(false);
		}

		let salt = generate_salt();
		let hash = hash_password(password, &salt)?;
		let now = now_unix_ms();

		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("INSERT INTO users (username, password_hash, salt, created_at_ms) VALUES (?, ?, ?, ?)")
					.bind(username.as_str())
					.bind(&hash)
					.bind(&salt)
					.bind(now)
					.execute(pool)
					.await
					.context("insert user (sqlite)")?;
			}
			Backend::Postgres(pool) => {
				sqlx::query("INSERT INTO users (username, password_hash, salt, created_at_ms) VALUES ($1, $2, $3, $4)")
					.bind(username.as_str())
					.bind(&hash)
					.bind(&salt)
					.bind(now)
					.execute(pool)
					.await
					.context("insert user (postgres)")?;
			}
			Backend::Mysql(pool) => {
				sqlx::query("INSERT INTO users (username, password_hash, salt, created_at_ms) VALUES (?, ?, ?, ?)")
					.bind(username.as_str())
					.bind(&hash)
					.bind(&salt)
					.bind(now)
					.execute(pool)
					.await
					.context("insert user (mysql)")?;
			}
		}

		info!(user = %username, "registered user");
		Ok(true)
	}

	async fn all_users(&self) -> anyhow::Result<Vec<Username>> {
		let rows: Vec<String> = match &self.backend {
			Backend::Sqlite(pool) => {
				let rows = sqlx::query("SELECT username FROM users ORDER BY username")
					.fetch_all(pool)
					.await
					.context("select users (sqlite)")?;
				let mut names = Vec::with_capacity(rows.len());
				for row in rows {
					names.push(row.try_get("username")?);
				}
				names
			}
			Backend::Postgres(pool) => {
				let rows = sqlx::query("SELECT username FROM users ORDER BY username")
					.fetch_all(pool)
					.await
					.context("select users (postgres)")?;
				let mut names = Vec::with_capacity(rows.len());
				for row in rows {
					names.push(row.try_get("username")?);
				}
				names
			}
			Backend::Mysql(pool) => {
				let rows = sqlx::query("SELECT username FROM users ORDER BY username")
					.fetch_all(pool)
					.await
					.context("select users (mysql)")?;
				let mut names = Vec::with_capacity(rows.len());
				for row in rows {
					names.push(row.try_get("username")?);
				}
				names
			}
		};

		let mut users = Vec::with_capacity(rows.len());
		for name in rows {
			users.push(Username::new(name).context("stored username no longer parses")?);
		}
		Ok(users)
	}
}

impl SqlStore {
	async fn insert_private(&self, sender: &Username, recipient: &Username, body: &str, read: bool) -> anyhow::Result<()> {
		let now = now_unix_ms();

		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO private_messages (sender, recipient, body, timestamp_ms, is_read) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(sender.as_str())
				.bind(recipient.as_str())
				.bind(body)
				.bind(now)
				.bind(read)
				.execute(pool)
				.await
				.context("insert private message (sqlite)")?;
			}
			Backend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO private_messages (sender, recipient, body, timestamp_ms, is_read) VALUES ($1, $2, $3, $4, $5)",
				)
				.bind(sender.as_str())
				.bind(recipient.as_str())
				.bind(body)
				.bind(now)
				.bind(read)
				.execute(pool)
				.await
				.context("insert private message (postgres)")?;
			}
			Backend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO private_messages (sender, recipient, body, timestamp_ms, is_read) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(sender.as_str())
				.bind(recipient.as_str())
				.bind(body)
				.bind(now)
				.bind(read)
				.execute(pool)
				.await
				.context("insert private message (mysql)")?;
			}
		}

		Ok(())
	}
}

#[async_trait::async_trait]
impl MessageStore for SqlStore {
	async fn save_message(&self, sender: &Username, recipient: Option<&Username>, body: &str) -> anyhow::Result<()> {
		let now = now_unix_ms();

		match (recipient, &self.backend) {
			(Some(recipient), _) => {
				return self.insert_private(sender, recipient, body, false).await;
			}
			(None, Backend::Sqlite(pool)) => {
				sqlx::query("INSERT INTO general_messages (sender, body, timestamp_ms) VALUES (?, ?, ?)")
					.bind(sender.as_str())
					.bind(body)
					.bind(now)
					.execute(pool)
					.await
					.context("insert general message (sqlite)")?;
			}
			(None, Backend::Postgres(pool)) => {
				sqlx::query("INSERT INTO general_messages (sender, body, timestamp_ms) VALUES ($1, $2, $3)")
					.bind(sender.as_str())
					.bind(body)
					.bind(now)
					.execute(pool)
					.await
					.context("insert general message (postgres)")?;
			}
			(None, Backend::Mysql(pool)) => {
				sqlx::query("INSERT INTO general_messages (sender, body, timestamp_ms) VALUES (?, ?, ?)")
					.bind(sender.as_str())
					.bind(body)
					.bind(now)
					.execute(pool)
					.await
					.context("insert general message (mysql)")?;
			}
		}

		Ok(())
	}

	async fn save_delivered(&self, sender: &Username, recipient: &Username, body: &str) -> anyhow::Result<()> {
		self.insert_private(sender, recipient, body, true).await
	}

	async fn take_unread(&self, recipient: &Username) -> anyhow::Result<Vec<UnreadMessage>> {
		let rows: Vec<(String, String, i64)> = match &self.backend {
			Backend::Sqlite(pool) => {
				let rows = sqlx::query(
					"SELECT sender, body, timestamp_ms FROM private_messages \
					WHERE recipient = ? AND is_read = 0 ORDER BY timestamp_ms, id",
				)
				.bind(recipient.as_str())
				.fetch_all(pool)
				.await
				.context("select unread (sqlite)")?;
				let mut out = Vec::with_capacity(rows.len());
				for row in rows {
					out.push((row.try_get("sender")?, row.try_get("body")?, row.try_get("timestamp_ms")?));
				}
				out
			}
			Backend::Postgres(pool) => {
				let rows = sqlx::query(
					"SELECT sender, body, timestamp_ms FROM private_messages \
					WHERE recipient = $1 AND is_read = FALSE ORDER BY timestamp_ms, id",
				)
				.bind(recipient.as_str())
				.fetch_all(pool)
				.await
				.context("select unread (postgres)")?;
				let mut out = Vec::with_capacity(rows.len());
				for row in rows {
					out.push((row.try_get("sender")?, row.try_get("body")?, row.try_get("timestamp_ms")?));
				}
				out
			}
			Backend::Mysql(pool) => {
				let rows = sqlx::query(
					"SELECT sender, body, timestamp_ms FROM private_messages \
					WHERE recipient = ? AND is_read = FALSE ORDER BY timestamp_ms, id",
				)
				.bind(recipient.as_str())
				.fetch_all(pool)
				.await
				.context("select unread (mysql)")?;
				let mut out = Vec::with_capacity(rows.len());
				for row in rows {
					out.push((row.try_get("sender")?, row.try_get("body")?, row.try_get("timestamp_ms")?));
				}
				out
			}
		};

		let mut messages = Vec::with_capacity(rows.len());
		for (sender, body, timestamp_unix_ms) in rows {
			messages.push(UnreadMessage {
				sender: Username::new(sender).context("stored sender no longer parses")?,
				recipient: Some(recipient.clone()),
				body,
				timestamp_unix_ms,
				read: false,
			});
		}

		if !messages.is_empty() {
			match &self.backend {
				Backend::Sqlite(pool) => {
					sqlx::query("UPDATE private_messages SET is_read = 1 WHERE recipient = ? AND is_read = 0")
						.bind(recipient.as_str())
						.execute(pool)
						.await
						.context("mark read (sqlite)")?;
				}
				Backend::Postgres(pool) => {
					sqlx::query("UPDATE private_messages SET is_read = TRUE WHERE recipient = $1 AND is_read = FALSE")
						.bind(recipient.as_str())
						.execute(pool)
						.await
						.context("mark read (postgres)")?;
				}
				Backend::Mysql(pool) => {
					sqlx::query("UPDATE private_messages SET is_read = TRUE WHERE recipient = ? AND is_read = FALSE")
						.bind(recipient.as_str())
						.execute(pool)
						.await
						.context("mark read (mysql)")?;
				}
			}
		}

		Ok(messages)
	}
}
