#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Reserved identity used for server-originated notices; clients may not log in with it.
pub const SERVER_NAME: &str = "server";

/// Maximum accepted username length in bytes.
pub const MAX_USERNAME_LEN: usize = 32;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("value too long: {len} > {max}")]
	TooLong { len: usize, max: usize },
	#[error("invalid character: {0:?}")]
	InvalidChar(char),
}

/// A validated chat username.
///
/// Usernames are restricted to ASCII alphanumerics plus `_`, `-` and `.` so
/// they can never collide with the wire field delimiter (`:`) or the roster
/// separator (`|`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(try_from = "String", into = "String"))]
pub struct Username(String);

impl Username {
	/// Create a validated `Username`.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let trimmed = name.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.len() > MAX_USERNAME_LEN {
			return Err(ParseIdError::TooLong {
				len: trimmed.len(),
				max: MAX_USERNAME_LEN,
			});
		}
		if let Some(c) = trimmed
			.chars()
			.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
		{
			return Err(ParseIdError::InvalidChar(c));
		}
		Ok(Self(trimmed.to_string()))
	}

	/// The reserved server identity used for join/leave notices.
	pub fn server() -> Self {
		Self(SERVER_NAME.to_string())
	}

	/// Whether this name is reserved for the server itself.
	pub fn is_reserved(&self) -> bool {
		self.0.eq_ignore_ascii_case(SERVER_NAME)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::new(s)
	}
}

impl TryFrom<String> for Username {
	type Error = ParseIdError;

	fn try_from(s: String) -> Result<Self, Self::Error> {
		Username::new(s)
	}
}

impl From<Username> for String {
	fn from(u: Username) -> Self {
		u.into_string()
	}
}

/// Opaque per-connection session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct SessionId(Uuid);

impl SessionId {
	/// Generate a fresh random session id.
	pub fn generate() -> Self {
		Self(Uuid::new_v4())
	}

	pub fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl Default for SessionId {
	fn default() -> Self {
		Self::generate()
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// An inbound message after the session has stamped its authenticated
/// identity onto it. The `sender` is never client-supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
	General {
		sender: Username,
		body: String,
	},
	Private {
		sender: Username,
		recipient: Username,
		body: String,
	},
	/// A file relayed in one blob; `recipient == None` means broadcast.
	FileChunk {
		sender: Username,
		recipient: Option<Username>,
		filename: String,
		payload: Vec<u8>,
	},
	Login {
		username: Username,
	},
	Logout,
	Error {
		reason: String,
	},
}

impl Message {
	/// Payload size for file messages, zero otherwise.
	pub fn size_bytes(&self) -> usize {
		match self {
			Message::FileChunk { payload, .. } => payload.len(),
			_ => 0,
		}
	}
}

/// A persisted private message awaiting delivery.
///
/// Lifecycle is owned by the persistence gateway; the core only consumes
/// these at login to deliver the backlog.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UnreadMessage {
	pub sender: Username,
	pub recipient: Option<Username>,
	pub body: String,
	pub timestamp_unix_ms: i64,
	pub read: bool,
}
