#![forbid(unsafe_code)]

pub mod codec;

pub use codec::{
	ClientFrame, DEFAULT_MAX_LINE_BYTES, DecodeError, ServerFrame, decode_client, decode_server, encode_client,
	encode_server,
};
