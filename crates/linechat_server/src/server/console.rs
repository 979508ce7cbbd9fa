#![forbid(unsafe_code)]

use std::sync::Arc;

use linechat_gateway::AuthGateway;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::server::registry::Registry;

/// Operator console on stdin. `stop` flips the shutdown switch; the
/// task ends on `stop` or when stdin closes.
pub fn spawn_console(registry: Arc<Registry>, auth: Arc<dyn AuthGateway>, shutdown: watch::Sender<bool>) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut lines = BufReader::new(tokio::io::stdin()).lines();

		loop {
			let line = match lines.next_line().await {
				Ok(Some(line)) => line,
				Ok(None) => break,
				Err(e) => {
					warn!(error = %e, "console read failed");
					break;
				}
			};

			match line.trim().to_ascii_lowercase().as_str() {
				"" => {}
				"list" => {
					let names = registry.usernames();
					println!("{} user(s) online", names.len());
					for name in names {
						println!("  {name}");
					}
				}
				"users" => match auth.all_users().await {
					Ok(names) => {
						println!("{} registered account(s)", names.len());
						for name in names {
							println!("  {name}");
						}
					}
					Err(e) => println!("could not list accounts: {e}"),
				},
				"stop" | "exit" | "quit" => {
					println!("stopping server");
					let _ = shutdown.send(true);
					break;
				}
				"help" => {
					println!("commands:");
					println!("  list   online users");
					println!("  users  all registered accounts");
					println!("  stop   shut the server down");
					println!("  help   this text");
				}
				other => println!("unknown command: {other} (try help)"),
			}
		}
	})
}
