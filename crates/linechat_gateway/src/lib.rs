#![forbid(unsafe_code)]

//! Service seams the chat core consumes but does not implement:
//! credential checks, message persistence and the symmetric cipher that
//! protects stored bodies. The server only ever talks to the traits here.

use core::fmt;

use linechat_domain::{UnreadMessage, Username};

pub mod cipher;
pub mod memory;
pub mod store;

pub use cipher::{AesGcmCipher, NoopCipher};
pub use memory::MemoryStore;
pub use store::SqlStore;

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Credential store consulted at login and by the operator console.
#[async_trait::async_trait]
pub trait AuthGateway: Send + Sync {
	/// Check a username/password pair against stored credentials.
	async fn authenticate(&self, username: &Username, password: &str) -> anyhow::Result<bool>;

	/// Create an account. Returns `false` when the name is already taken.
	async fn register(&self, username: &Username, password: &str) -> anyhow::Result<bool>;

	/// All registered account names, whether online or not.
	async fn all_users(&self) -> anyhow::Result<Vec<Username>>;
}

/// Message persistence consumed by the router and the login backlog.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Persist one message; `recipient == None` records general history.
	/// Private messages land unread, awaiting backlog delivery.
	async fn save_message(&self, sender: &Username, recipient: Option<&Username>, body: &str) -> anyhow::Result<()>;

	/// Persist a private message that was delivered live. The record is
	/// stored already read so it never enters the unread backlog.
	async fn save_delivered(&self, sender: &Username, recipient: &Username, body: &str) -> anyhow::Result<()>;

	/// Fetch the ordered unread backlog for `recipient` and mark it
	/// consumed, so a later login never sees the same records again.
	async fn take_unread(&self, recipient: &Username) -> anyhow::Result<Vec<UnreadMessage>>;
}

/// Symmetric cipher applied to stored message bodies. The key comes from
/// configuration; the core never embeds one.
pub trait MessageCipher: Send + Sync {
	fn encrypt(&self, plaintext: &str) -> anyhow::Result<String>;
	fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_string_redacts_debug_and_display() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(format!("{s}"), "<redacted>");
		assert_eq!(s.expose(), "hunter2");
	}
}
