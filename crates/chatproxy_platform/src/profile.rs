#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use chatproxy_domain::{Profile, UserId};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::SecretString;

pub const STEAM_WEB_API_BASE_URL: &str = "https://api.steampowered.com";
pub const PROFILE_CACHE_CAPACITY: u64 = 100;
pub const PROFILE_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Errors from remote lookups (profiles, authorization, sessions).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
	#[error("request failed: {0}")]
	Http(String),

	#[error("unexpected http status {0}")]
	Status(u16),

	#[error("invalid response: {0}")]
	InvalidResponse(String),
}

impl From<reqwest::Error> for LookupError {
	fn from(e: reqwest::Error) -> Self {
		LookupError::Http(e.to_string())
	}
}

/// Resolves display name and avatar for a user id.
#[async_trait]
pub trait ProfileLookup: Send + Sync + 'static {
	async fn profile(&self, id: &UserId) -> Result<Profile, LookupError>;
}

/// `GetPlayerSummaries` client of the public Steam Web API.
#[derive(Debug, Clone)]
pub struct SteamWebApi {
	base_url: Url,
	api_key: SecretString,
	client: reqwest::Client,
}

impl SteamWebApi {
	pub fn new(base_url: Url, api_key: SecretString) -> Self {
		Self {
			base_url,
			api_key,
			client: reqwest::Client::new(),
		}
	}

	fn summaries_url(&self, id: &UserId) -> Result<Url, LookupError> {
		let mut url = self
			.base_url
			.join("ISteamUser/GetPlayerSummaries/v0002/")
			.map_err(|e| LookupError::InvalidResponse(format!("bad base url: {e}")))?;
		url.query_pairs_mut()
			.append_pair("key", self.api_key.expose())
			.append_pair("steamids", id.as_str())
			.append_pair("format", "json");
		Ok(url)
	}
}

#[async_trait]
impl ProfileLookup for SteamWebApi {
	async fn profile(&self, id: &UserId) -> Result<Profile, LookupError> {
		let resp = self.client.get(self.summaries_url(id)?).send().await?;
		match resp.status() {
			StatusCode::OK => {}
			status => return Err(LookupError::Status(status.as_u16())),
		}

		let body: SummariesEnvelope = resp.json().await?;
		profile_from_summaries(body)
	}
}

#[derive(Debug, Deserialize)]
struct SummariesEnvelope {
	response: Option<SummariesResponse>,
}

#[derive(Debug, Deserialize)]
struct SummariesResponse {
	#[serde(default)]
	players: Vec<PlayerSummary>,
}

#[derive(Debug, Deserialize)]
struct PlayerSummary {
	personaname: Option<String>,
	#[serde(default)]
	avatar: String,
}

fn profile_from_summaries(body: SummariesEnvelope) -> Result<Profile, LookupError> {
	let player = body
		.response
		.and_then(|r| r.players.into_iter().next())
		.ok_or_else(|| LookupError::InvalidResponse("no players in response".to_string()))?;

	match player.personaname {
		Some(name) if !name.is_empty() => Ok(Profile::new(name, player.avatar)),
		_ => Err(LookupError::InvalidResponse("player has no persona name".to_string())),
	}
}

/// Memoizing `ProfileLookup` wrapper. Only successful lookups are cached.
pub struct CachedProfiles<L> {
	inner: L,
	cache: moka::sync::Cache<UserId, Profile>,
}

impl<L: ProfileLookup> CachedProfiles<L> {
	pub fn new(inner: L) -> Self {
		Self::with_policy(inner, PROFILE_CACHE_CAPACITY, PROFILE_CACHE_TTL)
	}

	pub fn with_policy(inner: L, capacity: u64, ttl: Duration) -> Self {
		Self {
			inner,
			cache: moka::sync::Cache::builder().max_capacity(capacity).time_to_live(ttl).build(),
		}
	}
}

#[async_trait]
impl<L: ProfileLookup> ProfileLookup for CachedProfiles<L> {
	async fn profile(&self, id: &UserId) -> Result<Profile, LookupError> {
		if let Some(hit) = self.cache.get(id) {
			return Ok(hit);
		}

		let profile = self.inner.profile(id).await?;
		debug!(user = %id, name = %profile.display_name, "profile cached");
		self.cache.insert(id.clone(), profile.clone());
		Ok(profile)
	}
}
