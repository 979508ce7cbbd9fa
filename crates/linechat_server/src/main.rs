#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use linechat_gateway::{AesGcmCipher, AuthGateway, MemoryStore, MessageCipher, MessageStore, NoopCipher, SqlStore};
use linechat_server::config;
use linechat_server::server::console::spawn_console;
use linechat_server::server::health::{HealthState, spawn_health_server};
use linechat_server::server::{ChatServer, SessionSettings};
use linechat_util::endpoint::TcpEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: linechat_server [--bind tcp://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: tcp://127.0.0.1:5000)\n\
\t         Format: tcp://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "tcp://127.0.0.1:5000".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected tcp://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = TcpEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,linechat_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("linechat_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	let config_path = config::default_config_path()?;
	let server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let (auth, store): (Arc<dyn AuthGateway>, Arc<dyn MessageStore>) = if server_cfg.persistence.enabled {
		let Some(database_url) = server_cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		let sql = Arc::new(SqlStore::connect(database_url).await?);
		(Arc::clone(&sql) as Arc<dyn AuthGateway>, sql)
	} else {
		info!("persistence disabled, using in-memory store");
		let memory = Arc::new(MemoryStore::new());
		(Arc::clone(&memory) as Arc<dyn AuthGateway>, memory)
	};

	let cipher: Arc<dyn MessageCipher> = match server_cfg.persistence.encryption_key.as_ref() {
		Some(key) => {
			info!("stored message bodies will be encrypted");
			Arc::new(AesGcmCipher::new(key))
		}
		None => Arc::new(NoopCipher),
	};

	let settings = SessionSettings {
		max_line_bytes: server_cfg.server.max_line_bytes,
		require_password: server_cfg.auth.require_password,
	};
	let grace = Duration::from_secs(server_cfg.server.shutdown_grace_secs);

	let server = ChatServer::bind(bind_addr, Arc::clone(&auth), store, cipher, settings, grace).await?;
	info!(bind = %server.local_addr()?, "chat server listening");

	let shutdown = server.shutdown_handle();
	spawn_console(server.registry(), auth, shutdown.clone());

	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("ctrl-c received, shutting down");
			let _ = shutdown.send(true);
		}
	});

	health_state.mark_ready();
	server.run().await
}
