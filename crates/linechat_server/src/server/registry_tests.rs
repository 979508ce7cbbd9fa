#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use linechat_domain::Username;

use crate::server::registry::{Registry, ReserveOutcome};
use crate::server::session::Session;

fn user(name: &str) -> Username {
	Username::new(name).expect("valid username")
}

fn addr() -> SocketAddr {
	"127.0.0.1:0".parse().expect("valid addr")
}

fn session(name: &str) -> Arc<Session> {
	let (_client, server) = tokio::io::duplex(1024);
	Arc::new(Session::new(user(name), addr(), server))
}

#[tokio::test]
async fn reserve_blocks_duplicates_until_released() {
	let registry = Registry::new();
	let alice = user("alice");

	assert_eq!(registry.try_reserve(&alice), ReserveOutcome::Reserved);
	assert_eq!(registry.try_reserve(&alice), ReserveOutcome::Taken, "second reservation must fail");

	registry.release(&alice);
	assert_eq!(registry.try_reserve(&alice), ReserveOutcome::Reserved, "released name is claimable again");
}

#[tokio::test]
async fn reserved_word_is_never_claimable() {
	let registry = Registry::new();
	assert_eq!(registry.try_reserve(&Username::server()), ReserveOutcome::ReservedName);
	assert_eq!(
		registry.try_reserve(&user("SERVER")),
		ReserveOutcome::ReservedName,
		"reserved word check is case-insensitive"
	);
}

#[tokio::test]
async fn bind_consumes_the_reservation_and_blocks_the_name() {
	let registry = Registry::new();
	let alice = user("alice");

	assert_eq!(registry.try_reserve(&alice), ReserveOutcome::Reserved);
	registry.bind(session("alice"));

	assert!(registry.is_online(&alice));
	assert_eq!(registry.try_reserve(&alice), ReserveOutcome::Taken, "online name must stay unavailable");
	assert_eq!(registry.online_count(), 1);
}

#[tokio::test]
async fn remove_frees_the_name() {
	let registry = Registry::new();
	let alice = user("alice");

	assert_eq!(registry.try_reserve(&alice), ReserveOutcome::Reserved);
	registry.bind(session("alice"));

	assert!(registry.remove(&alice).is_some());
	assert!(registry.remove(&alice).is_none(), "second remove is a no-op");
	assert!(!registry.is_online(&alice));
	assert_eq!(registry.try_reserve(&alice), ReserveOutcome::Reserved);
}

#[tokio::test]
async fn usernames_are_sorted_for_a_stable_roster() {
	let registry = Registry::new();
	for name in ["zed", "alice", "mid"] {
		assert_eq!(registry.try_reserve(&user(name)), ReserveOutcome::Reserved);
		registry.bind(session(name));
	}

	assert_eq!(registry.usernames(), vec![user("alice"), user("mid"), user("zed")]);
}

#[tokio::test]
async fn snapshot_returns_every_live_session() {
	let registry = Registry::new();
	for name in ["a", "b"] {
		assert_eq!(registry.try_reserve(&user(name)), ReserveOutcome::Reserved);
		registry.bind(session(name));
	}

	let snapshot = registry.snapshot();
	assert_eq!(snapshot.len(), 2);
	assert!(snapshot.iter().all(|s| s.is_alive()));
}
