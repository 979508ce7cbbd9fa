#![forbid(unsafe_code)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use linechat_domain::{ParseIdError, Username};
use thiserror::Error;

/// Default maximum accepted line length (one frame) in bytes.
///
/// File payloads travel base64-encoded inside a single line, so this bounds
/// the largest transferable blob at roughly 1.5 MiB of raw bytes.
pub const DEFAULT_MAX_LINE_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
	#[error("empty frame")]
	Empty,

	/// Unrecognized frame kind. Typed rather than fatal so the session can
	/// reply with an error frame and keep reading.
	#[error("unknown command: {0}")]
	UnknownCommand(String),

	#[error("{kind} frame is missing field {field}")]
	MissingField {
		kind: &'static str,
		field: &'static str,
	},

	#[error("invalid username: {0}")]
	InvalidUsername(#[from] ParseIdError),

	#[error("invalid payload encoding: {0}")]
	InvalidPayload(String),

	#[error("invalid escape sequence: \\{0}")]
	InvalidEscape(char),

	#[error("truncated escape sequence")]
	TruncatedEscape,

	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge { len: usize, max: usize },
}

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
	/// `LOGIN:<username>[:<password>]` — must be the first frame on a connection.
	Login {
		username: Username,
		password: Option<String>,
	},
	/// `MESSAGE:<body>` — general chat.
	General { body: String },
	/// `PRIVATE:<recipient>:<body>`
	Private { recipient: Username, body: String },
	/// `FILE:<filename>:<base64>` — broadcast file.
	File { filename: String, payload: Vec<u8> },
	/// `PRIVATE_FILE:<recipient>:<filename>:<base64>`
	PrivateFile {
		recipient: Username,
		filename: String,
		payload: Vec<u8>,
	},
	/// `LOGOUT`
	Logout,
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
	/// `OK:<username>` — successful login.
	LoginOk { username: Username },
	/// `ERROR:<reason>`
	Error { reason: String },
	/// `MESSAGE:<sender>:<body>` — general chat delivery.
	General { sender: Username, body: String },
	/// `PRIVATE:<sender>:<body>` — private delivery (live or backlog).
	Private { sender: Username, body: String },
	/// `SENT:<recipient>:<body>` — self-echo of an outgoing private message.
	Sent { recipient: Username, body: String },
	/// `FILE:<sender>:<filename>:<base64>` — broadcast file delivery.
	File {
		sender: Username,
		filename: String,
		payload: Vec<u8>,
	},
	/// `PRIVATE_FILE:<sender>:<filename>:<base64>`
	PrivateFile {
		sender: Username,
		filename: String,
		payload: Vec<u8>,
	},
	/// `USER_LIST:<name1>|<name2>|...` — roster push.
	UserList { users: Vec<Username> },
}

/// Escape a free-text field so it can never contain the frame delimiter
/// (newline) or the field delimiter (colon) unescaped.
fn escape_text(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	for c in s.chars() {
		match c {
			'\\' => out.push_str("\\\\"),
			'\n' => out.push_str("\\n"),
			'\r' => out.push_str("\\r"),
			':' => out.push_str("\\:"),
			other => out.push(other),
		}
	}
	out
}

fn unescape_text(s: &str) -> Result<String, DecodeError> {
	let mut out = String::with_capacity(s.len());
	let mut chars = s.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some('\\') => out.push('\\'),
			Some('n') => out.push('\n'),
			Some('r') => out.push('\r'),
			Some(':') => out.push(':'),
			Some(other) => return Err(DecodeError::InvalidEscape(other)),
			None => return Err(DecodeError::TruncatedEscape),
		}
	}
	Ok(out)
}

/// Split an escaped field off the front of `rest` at the first unescaped colon.
///
/// Returns the raw (still escaped) field and the remainder after the colon,
/// or `None` when no unescaped colon exists.
fn split_field(rest: &str) -> Option<(&str, &str)> {
	let bytes = rest.as_bytes();
	let mut i = 0;
	while i < bytes.len() {
		match bytes[i] {
			b'\\' => i += 2,
			b':' => return Some((&rest[..i], &rest[i + 1..])),
			_ => i += 1,
		}
	}
	None
}

fn decode_payload(b64: &str) -> Result<Vec<u8>, DecodeError> {
	BASE64.decode(b64.trim()).map_err(|e| DecodeError::InvalidPayload(e.to_string()))
}

/// Encode a client frame as one line (no trailing newline).
pub fn encode_client(frame: &ClientFrame) -> String {
	match frame {
		ClientFrame::Login { username, password } => match password {
			Some(password) => format!("LOGIN:{username}:{}", escape_text(password)),
			None => format!("LOGIN:{username}"),
		},
		ClientFrame::General { body } => format!("MESSAGE:{}", escape_text(body)),
		ClientFrame::Private { recipient, body } => format!("PRIVATE:{recipient}:{}", escape_text(body)),
		ClientFrame::File { filename, payload } => {
			format!("FILE:{}:{}", escape_text(filename), BASE64.encode(payload))
		}
		ClientFrame::PrivateFile {
			recipient,
			filename,
			payload,
		} => format!("PRIVATE_FILE:{recipient}:{}:{}", escape_text(filename), BASE64.encode(payload)),
		ClientFrame::Logout => "LOGOUT".to_string(),
	}
}

/// Decode one client line into a typed frame.
///
/// Never panics on malformed input; unrecognized kinds come back as
/// `DecodeError::UnknownCommand`.
pub fn decode_client(line: &str) -> Result<ClientFrame, DecodeError> {
	let line = line.trim_end_matches(['\r', '\n']);
	if line.is_empty() {
		return Err(DecodeError::Empty);
	}

	let (kind, rest) = match line.split_once(':') {
		Some((kind, rest)) => (kind, Some(rest)),
		None => (line, None),
	};

	match kind {
		"LOGIN" => {
			let rest = rest.ok_or(DecodeError::MissingField {
				kind: "LOGIN",
				field: "username",
			})?;
			let (name, password) = match split_field(rest) {
				Some((name, password)) => (name, Some(unescape_text(password)?)),
				None => (rest, None),
			};
			Ok(ClientFrame::Login {
				username: Username::new(name)?,
				password,
			})
		}
		"MESSAGE" => {
			let rest = rest.ok_or(DecodeError::MissingField {
				kind: "MESSAGE",
				field: "body",
			})?;
			Ok(ClientFrame::General {
				body: unescape_text(rest)?,
			})
		}
		"PRIVATE" => {
			let rest = rest.ok_or(DecodeError::MissingField {
				kind: "PRIVATE",
				field: "recipient",
			})?;
			let (recipient, body) = split_field(rest).ok_or(DecodeError::MissingField {
				kind: "PRIVATE",
				field: "body",
			})?;
			Ok(ClientFrame::Private {
				recipient: Username::new(recipient)?,
				body: unescape_text(body)?,
			})
		}
		"FILE" => {
			let rest = rest.ok_or(DecodeError::MissingField {
				kind: "FILE",
				field: "filename",
			})?;
			let (filename, payload) = split_field(rest).ok_or(DecodeError::MissingField {
				kind: "FILE",
				field: "payload",
			})?;
			Ok(ClientFrame::File {
				filename: unescape_text(filename)?,
				payload: decode_payload(payload)?,
			})
		}
		"PRIVATE_FILE" => {
			let rest = rest.ok_or(DecodeError::MissingField {
				kind: "PRIVATE_FILE",
				field: "recipient",
			})?;
			let (recipient, rest) = split_field(rest).ok_or(DecodeError::MissingField {
				kind: "PRIVATE_FILE",
				field: "filename",
			})?;
			let (filename, payload) = split_field(rest).ok_or(DecodeError::MissingField {
				kind: "PRIVATE_FILE",
				field: "payload",
			})?;
			Ok(ClientFrame::PrivateFile {
				recipient: Username::new(recipient)?,
				filename: unescape_text(filename)?,
				payload: decode_payload(payload)?,
			})
		}
		"LOGOUT" => Ok(ClientFrame::Logout),
		other => Err(DecodeError::UnknownCommand(other.to_string())),
	}
}

/// Encode a server frame as one line (no trailing newline).
pub fn encode_server(frame: &ServerFrame) -> String {
	match frame {
		ServerFrame::LoginOk { username } => format!("OK:{username}"),
		ServerFrame::Error { reason } => format!("ERROR:{}", escape_text(reason)),
		ServerFrame::General { sender, body } => format!("MESSAGE:{sender}:{}", escape_text(body)),
		ServerFrame::Private { sender, body } => format!("PRIVATE:{sender}:{}", escape_text(body)),
		ServerFrame::Sent { recipient, body } => format!("SENT:{recipient}:{}", escape_text(body)),
		ServerFrame::File {
			sender,
			filename,
			payload,
		} => format!("FILE:{sender}:{}:{}", escape_text(filename), BASE64.encode(payload)),
		ServerFrame::PrivateFile {
			sender,
			filename,
			payload,
		} => format!("PRIVATE_FILE:{sender}:{}:{}", escape_text(filename), BASE64.encode(payload)),
		ServerFrame::UserList { users } => {
			let names: Vec<&str> = users.iter().map(|u| u.as_str()).collect();
			format!("USER_LIST:{}", names.join("|"))
		}
	}
}

/// Decode one server line into a typed frame.
pub fn decode_server(line: &str) -> Result<ServerFrame, DecodeError> {
	let line = line.trim_end_matches(['\r', '\n']);
	if line.is_empty() {
		return Err(DecodeError::Empty);
	}

	let (kind, rest) = line.split_once(':').ok_or_else(|| DecodeError::UnknownCommand(line.to_string()))?;

	match kind {
		"OK" => Ok(ServerFrame::LoginOk {
			username: Username::new(rest)?,
		}),
		"ERROR" => Ok(ServerFrame::Error {
			reason: unescape_text(rest)?,
		}),
		"MESSAGE" => {
			let (sender, body) = split_field(rest).ok_or(DecodeError::MissingField {
				kind: "MESSAGE",
				field: "body",
			})?;
			Ok(ServerFrame::General {
				sender: Username::new(sender)?,
				body: unescape_text(body)?,
			})
		}
		"PRIVATE" => {
			let (sender, body) = split_field(rest).ok_or(DecodeError::MissingField {
				kind: "PRIVATE",
				field: "body",
			})?;
			Ok(ServerFrame::Private {
				sender: Username::new(sender)?,
				body: unescape_text(body)?,
			})
		}
		"SENT" => {
			let (recipient, body) = split_field(rest).ok_or(DecodeError::MissingField {
				kind: "SENT",
				field: "body",
			})?;
			Ok(ServerFrame::Sent {
				recipient: Username::new(recipient)?,
				body: unescape_text(body)?,
			})
		}
		"FILE" => {
			let (sender, rest) = split_field(rest).ok_or(DecodeError::MissingField {
				kind: "FILE",
				field: "filename",
			})?;
			let (filename, payload) = split_field(rest).ok_or(DecodeError::MissingField {
				kind: "FILE",
				field: "payload",
			})?;
			Ok(ServerFrame::File {
				sender: Username::new(sender)?,
				filename: unescape_text(filename)?,
				payload: decode_payload(payload)?,
			})
		}
		"PRIVATE_FILE" => {
			let (sender, rest) = split_field(rest).ok_or(DecodeError::MissingField {
				kind: "PRIVATE_FILE",
				field: "filename",
			})?;
			let (filename, payload) = split_field(rest).ok_or(DecodeError::MissingField {
				kind: "PRIVATE_FILE",
				field: "payload",
			})?;
			Ok(ServerFrame::PrivateFile {
				sender: Username::new(sender)?,
				filename: unescape_text(filename)?,
				payload: decode_payload(payload)?,
			})
		}
		"USER_LIST" => {
			let users = if rest.is_empty() {
				Vec::new()
			} else {
				rest.split('|').map(Username::new).collect::<Result<Vec<_>, _>>()?
			};
			Ok(ServerFrame::UserList { users })
		}
		other => Err(DecodeError::UnknownCommand(other.to_string())),
	}
}
