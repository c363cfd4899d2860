#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chatproxy_domain::UserId;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::SecretString;
use crate::profile::LookupError;

const TOKEN_VERSION: &str = "v1";

/// Web session as seen by the bridge. `user_id` is `None` until the browser has signed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
	pub user_id: Option<UserId>,
}

/// Resolves a session token carried by the upgrade request.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
	async fn session(&self, token: &str) -> Result<Option<Session>, LookupError>;
}

/// Find a named cookie in a raw `Cookie` header value.
pub fn token_from_cookie_header(header: &str, cookie_name: &str) -> Option<String> {
	header.split(';').find_map(|pair| {
		let (name, value) = pair.trim().split_once('=')?;
		if name.trim() != cookie_name {
			return None;
		}
		let value = value.trim().trim_matches('"');
		(!value.is_empty()).then(|| value.to_string())
	})
}

/// In-memory session table.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
	sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, token: impl Into<String>, session: Session) {
		self.sessions.write().insert(token.into(), session);
	}

	pub fn remove(&self, token: &str) -> Option<Session> {
		self.sessions.write().remove(token)
	}
}

#[async_trait]
impl SessionStore for MemorySessionStore {
	async fn session(&self, token: &str) -> Result<Option<Session>, LookupError> {
		Ok(self.sessions.read().get(token).cloned())
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
	#[error("invalid token format")]
	Format,

	#[error("invalid token signature")]
	Signature,

	#[error("token expired")]
	Expired,

	#[error("invalid token claims: {0}")]
	Claims(String),
}

/// Claims carried by a signed session token. An empty `sub` is an anonymous session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
	#[serde(default)]
	pub sub: String,
	pub exp: u64,
}

/// Sessions encoded as `v1.<payload>.<signature>` tokens signed with HMAC-SHA256.
#[derive(Debug, Clone)]
pub struct SignedTokenStore {
	secret: SecretString,
}

impl SignedTokenStore {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}

	/// Issue a token for `user` (or an anonymous session) valid for `ttl`.
	pub fn issue(&self, user: Option<&UserId>, ttl: Duration) -> String {
		let claims = SessionClaims {
			sub: user.map(|u| u.as_str().to_string()).unwrap_or_default(),
			exp: unix_now().saturating_add(ttl.as_secs()),
		};
		let payload = serde_json::to_vec(&claims).unwrap_or_default();
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
		let sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes());
		format!("{TOKEN_VERSION}.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig))
	}

	pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
		let mut parts = token.split('.');
		let (Some(version), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
		else {
			return Err(TokenError::Format);
		};
		if version != TOKEN_VERSION {
			return Err(TokenError::Format);
		}

		let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| TokenError::Format)?;
		let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| TokenError::Format)?;
		let expected_sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes());
		if !constant_time_eq(&expected_sig, &provided_sig) {
			return Err(TokenError::Signature);
		}

		let claims: SessionClaims = serde_json::from_slice(&payload).map_err(|e| TokenError::Claims(e.to_string()))?;
		if claims.exp <= unix_now() {
			return Err(TokenError::Expired);
		}
		Ok(claims)
	}
}

#[async_trait]
impl SessionStore for SignedTokenStore {
	async fn session(&self, token: &str) -> Result<Option<Session>, LookupError> {
		let claims = match self.verify(token) {
			Ok(claims) => claims,
			Err(e) => {
				debug!(error = %e, "rejecting session token");
				return Ok(None);
			}
		};

		if claims.sub.trim().is_empty() {
			return Ok(Some(Session { user_id: None }));
		}
		let user_id = UserId::new(claims.sub).map_err(|e| LookupError::InvalidResponse(format!("session subject: {e}")))?;
		Ok(Some(Session { user_id: Some(user_id) }))
	}
}

fn unix_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	// HMAC accepts keys of any length, so construction cannot fail.
	let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
		return Vec::new();
	};
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
