#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chatproxy_platform::SecretString;
use chatproxy_platform::profile::{PROFILE_CACHE_CAPACITY, PROFILE_CACHE_TTL};
use chatproxy_protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::server::connection::DEFAULT_SESSION_COOKIE;
use crate::server::status::{DEFAULT_CONFIRM_TIMEOUT, DEFAULT_RECONNECT_INTERVAL, DEFAULT_REJOIN_DELAY};
use crate::server::waiter::DEFAULT_POLL_INTERVAL;

const DEFAULT_CONNECTION_QUEUE_CAPACITY: usize = 1024;

/// Default config path: `~/.chatproxy/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatproxy").join("config.toml"))
}

/// Load the config from TOML at `path`, then apply `CHATPROXY_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |name| std::env::var(name).ok());

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub proxy: ProxySettings,
	pub profiles: ProfileSettings,
	pub authorization: AuthorizationSettings,
	pub demo: DemoSettings,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// WebSocket endpoint, `ws://host:port`. The command line wins over this.
	pub bind: Option<String>,
	pub metrics_bind: Option<String>,
	pub health_bind: Option<String>,
	/// Cookie name carrying the session token.
	pub session_cookie: String,
	/// Enables signed stateless session tokens.
	pub session_hmac_secret: Option<SecretString>,
	pub max_frame_bytes: usize,
	pub connection_queue_capacity: usize,
	/// Log every lag marker at debug level.
	pub debug_logs: bool,
}

/// Proxy account and room settings.
#[derive(Debug, Clone)]
pub struct ProxySettings {
	pub username: Option<String>,
	pub password: Option<SecretString>,
	/// Steam Guard code, when the account requires one.
	pub guard_code: Option<SecretString>,
	/// Group whose chat room is proxied. Also the member list used for authorization.
	pub group_id: Option<String>,
	pub reconnect_interval: Duration,
	pub rejoin_delay: Duration,
	pub login_timeout: Duration,
	pub join_timeout: Duration,
	pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ProfileSettings {
	pub api_key: Option<SecretString>,
	pub base_url: Option<String>,
	pub cache_capacity: u64,
	pub cache_ttl: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct AuthorizationSettings {
	pub community_base_url: Option<String>,
	/// Used instead of the group member list when no group is configured.
	pub allow: Vec<String>,
	pub block: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DemoSettings {
	/// Run against the in-process demo network instead of a real chat network.
	pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	proxy: FileProxySettings,

	#[serde(default)]
	profiles: FileProfileSettings,

	#[serde(default)]
	authorization: FileAuthorizationSettings,

	#[serde(default)]
	demo: FileDemoSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	session_cookie: Option<String>,
	session_hmac_secret: Option<String>,
	max_frame_bytes: Option<usize>,
	connection_queue_capacity: Option<usize>,
	debug_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileProxySettings {
	username: Option<String>,
	password: Option<String>,
	guard_code: Option<String>,
	group_id: Option<String>,
	reconnect_interval_secs: Option<u64>,
	rejoin_delay_ms: Option<u64>,
	login_timeout_ms: Option<u64>,
	join_timeout_ms: Option<u64>,
	poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileProfileSettings {
	api_key: Option<String>,
	base_url: Option<String>,
	cache_capacity: Option<u64>,
	cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthorizationSettings {
	community_base_url: Option<String>,
	#[serde(default)]
	allow: Vec<String>,
	#[serde(default)]
	block: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDemoSettings {
	enabled: Option<bool>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn non_zero_duration(v: Option<u64>, unit: fn(u64) -> Duration, default: Duration) -> Duration {
	v.filter(|n| *n > 0).map(unit).unwrap_or(default)
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let server = ServerSettings {
			bind: non_empty(file.server.bind),
			metrics_bind: non_empty(file.server.metrics_bind),
			health_bind: non_empty(file.server.health_bind),
			session_cookie: non_empty(file.server.session_cookie).unwrap_or_else(|| DEFAULT_SESSION_COOKIE.to_string()),
			session_hmac_secret: non_empty(file.server.session_hmac_secret).map(SecretString::new),
			max_frame_bytes: file
				.server
				.max_frame_bytes
				.filter(|n| *n > 0)
				.unwrap_or(DEFAULT_MAX_FRAME_SIZE),
			connection_queue_capacity: file
				.server
				.connection_queue_capacity
				.filter(|n| *n > 0)
				.unwrap_or(DEFAULT_CONNECTION_QUEUE_CAPACITY),
			debug_logs: file.server.debug_logs.unwrap_or(false),
		};

		let proxy = ProxySettings {
			username: non_empty(file.proxy.username),
			password: non_empty(file.proxy.password).map(SecretString::new),
			guard_code: non_empty(file.proxy.guard_code).map(SecretString::new),
			group_id: non_empty(file.proxy.group_id),
			reconnect_interval: non_zero_duration(
				file.proxy.reconnect_interval_secs,
				Duration::from_secs,
				DEFAULT_RECONNECT_INTERVAL,
			),
			rejoin_delay: file
				.proxy
				.rejoin_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(DEFAULT_REJOIN_DELAY),
			login_timeout: non_zero_duration(file.proxy.login_timeout_ms, Duration::from_millis, DEFAULT_CONFIRM_TIMEOUT),
			join_timeout: non_zero_duration(file.proxy.join_timeout_ms, Duration::from_millis, DEFAULT_CONFIRM_TIMEOUT),
			poll_interval: non_zero_duration(file.proxy.poll_interval_ms, Duration::from_millis, DEFAULT_POLL_INTERVAL),
		};

		let profiles = ProfileSettings {
			api_key: non_empty(file.profiles.api_key).map(SecretString::new),
			base_url: non_empty(file.profiles.base_url),
			cache_capacity: file
				.profiles
				.cache_capacity
				.filter(|n| *n > 0)
				.unwrap_or(PROFILE_CACHE_CAPACITY),
			cache_ttl: non_zero_duration(file.profiles.cache_ttl_secs, Duration::from_secs, PROFILE_CACHE_TTL),
		};

		let authorization = AuthorizationSettings {
			community_base_url: non_empty(file.authorization.community_base_url),
			allow: file.authorization.allow.into_iter().filter_map(|s| non_empty(Some(s))).collect(),
			block: file.authorization.block.into_iter().filter_map(|s| non_empty(Some(s))).collect(),
		};

		Self {
			server,
			proxy,
			profiles,
			authorization,
			demo: DemoSettings {
				enabled: file.demo.enabled.unwrap_or(false),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => parse_toml(&s).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let text = |name: &str| non_empty(env(name));

	if let Some(v) = text("CHATPROXY_BIND") {
		cfg.server.bind = Some(v);
		info!("server config: bind overridden by env");
	}

	if let Some(v) = text("CHATPROXY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = text("CHATPROXY_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = text("CHATPROXY_SESSION_COOKIE") {
		cfg.server.session_cookie = v;
		info!("server config: session_cookie overridden by env");
	}

	if let Some(v) = text("CHATPROXY_SESSION_HMAC_SECRET") {
		cfg.server.session_hmac_secret = Some(SecretString::new(v));
		info!("server auth: session_hmac_secret overridden by env");
	}

	if let Some(v) = text("CHATPROXY_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Some(v) = text("CHATPROXY_USERNAME") {
		cfg.proxy.username = Some(v);
		info!("proxy config: username overridden by env");
	}

	if let Some(v) = text("CHATPROXY_PASSWORD") {
		cfg.proxy.password = Some(SecretString::new(v));
		info!("proxy config: password overridden by env");
	}

	if let Some(v) = text("CHATPROXY_GUARD_CODE") {
		cfg.proxy.guard_code = Some(SecretString::new(v));
		info!("proxy config: guard_code overridden by env");
	}

	if let Some(v) = text("CHATPROXY_GROUP_ID") {
		cfg.proxy.group_id = Some(v);
		info!("proxy config: group_id overridden by env");
	}

	if let Some(v) = text("CHATPROXY_RECONNECT_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.proxy.reconnect_interval = Duration::from_secs(secs);
		debug!(secs, "proxy config: reconnect_interval overridden by env");
	}

	if let Some(v) = text("CHATPROXY_STEAM_API_KEY") {
		cfg.profiles.api_key = Some(SecretString::new(v));
		info!("profiles config: api_key overridden by env");
	}

	if let Some(v) = env("CHATPROXY_DEMO")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.demo.enabled = enabled;
		info!(enabled, "demo config: enabled overridden by env");
	}

	if cfg.proxy.poll_interval > cfg.proxy.login_timeout || cfg.proxy.poll_interval > cfg.proxy.join_timeout {
		warn!(
			poll_ms = cfg.proxy.poll_interval.as_millis(),
			"proxy config: poll_interval exceeds a confirmation timeout; waits will check at most once"
		);
	}

	if !cfg.demo.enabled && cfg.proxy.username.is_none() {
		warn!("proxy config: no username configured");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		move |name| map.get(name).cloned()
	}

	#[test]
	fn defaults_match_runtime_constants() {
		let cfg = ServerConfig::default();
		assert_eq!(cfg.server.session_cookie, DEFAULT_SESSION_COOKIE);
		assert_eq!(cfg.server.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
		assert_eq!(cfg.proxy.login_timeout, DEFAULT_CONFIRM_TIMEOUT);
		assert_eq!(cfg.proxy.reconnect_interval, DEFAULT_RECONNECT_INTERVAL);
		assert_eq!(cfg.profiles.cache_capacity, PROFILE_CACHE_CAPACITY);
		assert_eq!(cfg.profiles.cache_ttl, PROFILE_CACHE_TTL);
		assert!(!cfg.demo.enabled);
	}

	#[test]
	fn toml_sections_are_parsed() {
		let file = parse_toml(
			r#"
			[server]
			bind = "ws://0.0.0.0:9000"
			session_cookie = "sid"

			[proxy]
			username = "proxybot"
			password = "hunter2"
			group_id = "103582791430000000"
			join_timeout_ms = 500
			rejoin_delay_ms = 0

			[authorization]
			allow = ["76561190000000001", "  "]

			[demo]
			enabled = true
			"#,
		)
		.unwrap();
		let cfg = ServerConfig::from_file(file);

		assert_eq!(cfg.server.bind.as_deref(), Some("ws://0.0.0.0:9000"));
		assert_eq!(cfg.server.session_cookie, "sid");
		assert_eq!(cfg.proxy.username.as_deref(), Some("proxybot"));
		assert_eq!(cfg.proxy.password.as_ref().map(|p| p.expose()), Some("hunter2"));
		assert_eq!(cfg.proxy.join_timeout, Duration::from_millis(500));
		assert_eq!(cfg.proxy.rejoin_delay, Duration::ZERO);
		assert_eq!(cfg.authorization.allow, vec!["76561190000000001".to_string()]);
		assert!(cfg.demo.enabled);
	}

	#[test]
	fn blank_values_fall_back_to_defaults() {
		let file = parse_toml(
			r#"
			[server]
			session_cookie = "   "
			max_frame_bytes = 0

			[proxy]
			username = ""
			login_timeout_ms = 0
			"#,
		)
		.unwrap();
		let cfg = ServerConfig::from_file(file);

		assert_eq!(cfg.server.session_cookie, DEFAULT_SESSION_COOKIE);
		assert_eq!(cfg.server.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
		assert!(cfg.proxy.username.is_none());
		assert_eq!(cfg.proxy.login_timeout, DEFAULT_CONFIRM_TIMEOUT);
	}

	#[test]
	fn env_overrides_win_over_file() {
		let mut cfg = ServerConfig::default();
		apply_env_overrides(
			&mut cfg,
			env_from(&[
				("CHATPROXY_USERNAME", " envbot "),
				("CHATPROXY_DEMO", "yes"),
				("CHATPROXY_MAX_FRAME_BYTES", "4096"),
				("CHATPROXY_GROUP_ID", ""),
			]),
		);

		assert_eq!(cfg.proxy.username.as_deref(), Some("envbot"));
		assert!(cfg.demo.enabled);
		assert_eq!(cfg.server.max_frame_bytes, 4096);
		assert!(cfg.proxy.group_id.is_none());
	}

	#[test]
	fn unparseable_env_values_are_ignored() {
		let mut cfg = ServerConfig::default();
		apply_env_overrides(
			&mut cfg,
			env_from(&[("CHATPROXY_DEMO", "maybe"), ("CHATPROXY_MAX_FRAME_BYTES", "lots")]),
		);

		assert!(!cfg.demo.enabled);
		assert_eq!(cfg.server.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
	}

	#[test]
	fn malformed_toml_is_an_error() {
		assert!(parse_toml("[server\nbind = 1").is_err());
	}
}
