#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use linechat_gateway::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.linechat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".linechat").join("config.toml"))
}

/// Load the server config from TOML at `path` plus env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub persistence: PersistenceSettings,
}

/// Listener and observability settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Maximum accepted frame length in bytes; longer lines are rejected.
	pub max_line_bytes: usize,
	/// How long shutdown waits for sessions to drain before closing.
	pub shutdown_grace_secs: u64,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			health_bind: None,
			max_line_bytes: linechat_protocol::DEFAULT_MAX_LINE_BYTES,
			shutdown_grace_secs: 5,
		}
	}
}

/// Login policy.
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	/// When set, LOGIN must carry a password and the credential store is
	/// consulted. Unknown names are auto-registered on first login.
	pub require_password: bool,
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable the SQL-backed store; otherwise everything stays in memory.
	pub enabled: bool,
	/// Database URL (sqlite:, postgres: or mysql:).
	pub database_url: Option<String>,
	/// Passphrase for encrypting stored message bodies. Absent means
	/// bodies are stored in the clear.
	pub encryption_key: Option<SecretString>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	max_line_bytes: Option<usize>,
	shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	require_password: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
	encryption_key: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				max_line_bytes: file.server.max_line_bytes.filter(|v| *v > 0).unwrap_or(defaults.max_line_bytes),
				shutdown_grace_secs: file.server.shutdown_grace_secs.unwrap_or(defaults.shutdown_grace_secs),
			},
			auth: AuthSettings {
				require_password: file.auth.require_password.unwrap_or(false),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
				encryption_key: file
					.persistence
					.encryption_key
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("LINECHAT_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LINECHAT_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LINECHAT_MAX_LINE_BYTES")
		&& let Ok(bytes) = v.trim().parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_line_bytes = bytes;
		info!(bytes, "server config: max_line_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("LINECHAT_SHUTDOWN_GRACE_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.server.shutdown_grace_secs = secs;
		info!(secs, "server config: shutdown_grace_secs overridden by env");
	}

	if let Ok(v) = std::env::var("LINECHAT_REQUIRE_PASSWORD")
		&& let Some(required) = parse_env_bool(&v)
	{
		cfg.auth.require_password = required;
		info!(required, "auth config: require_password overridden by env");
	}

	if let Ok(v) = std::env::var("LINECHAT_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("LINECHAT_PERSISTENCE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LINECHAT_ENCRYPTION_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.encryption_key = Some(SecretString::new(v));
			info!("persistence: encryption_key overridden by env");
		}
	}
}
