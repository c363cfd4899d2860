#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow, bail};
use chatproxy_domain::{RoomId, UserId};
use chatproxy_platform::authz::STEAM_COMMUNITY_BASE_URL;
use chatproxy_platform::profile::STEAM_WEB_API_BASE_URL;
use chatproxy_platform::{
	AllowList, Authorizer, CachedProfiles, Credentials, DemoNetwork, DemoProfiles, GroupMemberList, MemorySessionStore,
	ProfileLookup, SecretString, SessionStore, SignedTokenStore, SteamWebApi, start_adapter,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

use crate::config::ServerConfig;
use crate::server::connection::{ConnectionSettings, serve};
use crate::server::context::{Collaborators, Context};
use crate::server::dispatch::{spawn_dispatcher, spawn_proxy_event_forwarder};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::hub::HubConfig;
use crate::server::status::StatusConfig;
use crate::util::endpoint::{DEFAULT_BIND, WsEndpoint};

const ADAPTER_CONTROL_CAPACITY: usize = 64;
const ADAPTER_EVENTS_CAPACITY: usize = 1024;

/// Room joined by the demo network when no group is configured.
const DEMO_ROOM_ID: &str = "103582791430000000";

struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatproxy_server [--bind ws://host:port] [--config PATH]\n\
\n\
Options:\n\
\t--bind    WebSocket endpoint (default: {DEFAULT_BIND})\n\
\t--config  Config file (default: ~/.chatproxy/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: None,
		config: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatproxy_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("chatproxy_server");
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

fn build_profiles(cfg: &ServerConfig, demo: &DemoNetwork) -> anyhow::Result<Arc<dyn ProfileLookup>> {
	let capacity = cfg.profiles.cache_capacity;
	let ttl = cfg.profiles.cache_ttl;

	match cfg.profiles.api_key.clone() {
		Some(key) => {
			let base = Url::parse(cfg.profiles.base_url.as_deref().unwrap_or(STEAM_WEB_API_BASE_URL))
				.context("profiles base_url")?;
			info!(%base, capacity, ttl_secs = ttl.as_secs(), "profile lookups via web API");
			Ok(Arc::new(CachedProfiles::with_policy(SteamWebApi::new(base, key), capacity, ttl)))
		}
		None => {
			warn!("profiles config: no api_key; using demo profiles");
			Ok(Arc::new(CachedProfiles::with_policy(
				DemoProfiles::for_network(demo),
				capacity,
				ttl,
			)))
		}
	}
}

fn build_authorizer(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn Authorizer>> {
	if let Some(group) = cfg.proxy.group_id.clone() {
		let base = Url::parse(
			cfg.authorization
				.community_base_url
				.as_deref()
				.unwrap_or(STEAM_COMMUNITY_BASE_URL),
		)
		.context("authorization community_base_url")?;
		info!(%group, %base, "authorizing against group member list");
		return Ok(Arc::new(GroupMemberList::new(base, group)));
	}

	let ids = |raw: &[String]| -> anyhow::Result<Vec<UserId>> {
		raw.iter()
			.map(|s| UserId::new(s.as_str()).with_context(|| format!("invalid user id {s:?}")))
			.collect()
	};
	let allow = ids(&cfg.authorization.allow)?;
	let block = ids(&cfg.authorization.block)?;
	warn!(
		allowed = allow.len(),
		blocked = block.len(),
		"no group configured; authorizing against static lists"
	);
	Ok(Arc::new(AllowList::new(allow, block)))
}

fn build_sessions(cfg: &ServerConfig) -> Arc<dyn SessionStore> {
	match cfg.server.session_hmac_secret.clone() {
		Some(secret) => Arc::new(SignedTokenStore::new(secret)),
		None => {
			warn!("server auth: no session_hmac_secret; sessions are in-memory only");
			Arc::new(MemorySessionStore::new())
		}
	}
}

fn build_status_config(cfg: &ServerConfig) -> anyhow::Result<StatusConfig> {
	let room = RoomId::new(cfg.proxy.group_id.as_deref().unwrap_or(DEMO_ROOM_ID)).context("proxy group_id")?;
	let credentials = Credentials {
		username: cfg.proxy.username.clone().unwrap_or_else(|| "chatproxy".to_string()),
		password: cfg.proxy.password.clone().unwrap_or_else(|| SecretString::new(String::new())),
		guard_code: cfg.proxy.guard_code.clone(),
	};

	let mut status_cfg = StatusConfig::new(room, credentials);
	status_cfg.poll_interval = cfg.proxy.poll_interval;
	status_cfg.login_timeout = cfg.proxy.login_timeout;
	status_cfg.join_timeout = cfg.proxy.join_timeout;
	status_cfg.rejoin_delay = cfg.proxy.rejoin_delay;
	status_cfg.reconnect_interval = cfg.proxy.reconnect_interval;
	Ok(status_cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let bind_raw = args
		.bind
		.or_else(|| cfg.server.bind.clone())
		.unwrap_or_else(|| DEFAULT_BIND.to_string());
	let bind = WsEndpoint::parse(&bind_raw).map_err(|e| anyhow!(e))?;

	if !cfg.demo.enabled {
		bail!("no chat network adapter available; enable [demo] in the config or set CHATPROXY_DEMO=1");
	}
	info!("starting demo chat network (enabled by config)");

	let demo = DemoNetwork::new();
	let profiles = build_profiles(&cfg, &demo)?;
	let (adapter, events_rx) = start_adapter(Box::new(demo), ADAPTER_CONTROL_CAPACITY, ADAPTER_EVENTS_CAPACITY);
	let adapter = Arc::new(adapter);

	let ctx = Context::new(
		Collaborators {
			client: adapter.clone(),
			sessions: build_sessions(&cfg),
			authorizer: build_authorizer(&cfg)?,
			profiles,
		},
		build_status_config(&cfg)?,
		HubConfig {
			connection_queue_capacity: cfg.server.connection_queue_capacity,
			debug_logs: cfg.server.debug_logs,
		},
	);

	let _dispatcher = spawn_dispatcher(ctx.clone(), events_rx);
	let _forwarder = spawn_proxy_event_forwarder(ctx.clone());

	let shutdown = CancellationToken::new();
	let _reconnect = ctx.status.spawn_reconnect_loop(shutdown.clone());

	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, HealthState::new(ctx.clone()));
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let listener = TcpListener::bind(bind.hostport())
		.await
		.with_context(|| format!("bind websocket listener on {}", bind.hostport()))?;
	info!(bind = %bind.hostport(), room = %ctx.status.config().room, "chatproxy_server: websocket listener ready");

	{
		let shutdown = shutdown.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				info!("interrupt received; shutting down");
			}
			shutdown.cancel();
		});
	}

	let settings = ConnectionSettings {
		session_cookie: cfg.server.session_cookie.clone(),
		max_frame_bytes: cfg.server.max_frame_bytes,
	};
	serve(listener, ctx, settings, shutdown).await?;

	adapter.shutdown().await;
	Ok(())
}
