#![forbid(unsafe_code)]

pub mod connection;
pub mod console;
pub mod health;
pub mod listener;
pub mod registry;
pub mod router;
pub mod session;

pub use listener::{ChatServer, SessionSettings};

#[cfg(test)]
mod registry_tests;
