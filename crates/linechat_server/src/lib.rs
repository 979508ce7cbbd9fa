#![forbid(unsafe_code)]

//! Line-oriented TCP chat server: session lifecycle, the username
//! registry, message routing and the operator console. The binary in
//! `main.rs` wires configuration and gateways around [`server::ChatServer`].

pub mod config;
pub mod server;
pub mod util;
