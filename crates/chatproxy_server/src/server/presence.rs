#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use chatproxy_domain::{ConnId, UserId};
use chatproxy_protocol::WebsiteUser;
use parking_lot::Mutex;

/// A web identity with at least one open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebIdentity {
	pub id: UserId,
	pub display_name: String,
	pub avatar_url: String,
	connections: BTreeSet<ConnId>,
}

impl WebIdentity {
	pub fn connection_count(&self) -> usize {
		self.connections.len()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinResult {
	pub is_new_identity: bool,
	pub connections: usize,
}

/// Web identities currently connected, counted per connection.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
	inner: Arc<Mutex<HashMap<UserId, WebIdentity>>>,
}

impl PresenceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn join(&self, id: &UserId, conn: ConnId, display_name: &str, avatar_url: &str) -> JoinResult {
		let mut identities = self.inner.lock();

		if let Some(identity) = identities.get_mut(id) {
			identity.display_name = display_name.to_string();
			identity.avatar_url = avatar_url.to_string();
			identity.connections.insert(conn);
			return JoinResult {
				is_new_identity: false,
				connections: identity.connections.len(),
			};
		}

		identities.insert(
			id.clone(),
			WebIdentity {
				id: id.clone(),
				display_name: display_name.to_string(),
				avatar_url: avatar_url.to_string(),
				connections: BTreeSet::from([conn]),
			},
		);
		JoinResult {
			is_new_identity: true,
			connections: 1,
		}
	}

	/// Drop one connection. Returns the display name when it was the identity's last one.
	pub fn leave(&self, id: &UserId, conn: ConnId) -> Option<String> {
		let mut identities = self.inner.lock();
		let identity = identities.get_mut(id)?;
		identity.connections.remove(&conn);
		if !identity.connections.is_empty() {
			return None;
		}
		identities.remove(id).map(|gone| gone.display_name)
	}

	/// Store new details for a connected identity. Returns whether anything changed.
	pub fn update(&self, id: &UserId, display_name: &str, avatar_url: &str) -> bool {
		let mut identities = self.inner.lock();
		let Some(identity) = identities.get_mut(id) else {
			return false;
		};
		if identity.display_name == display_name && identity.avatar_url == avatar_url {
			return false;
		}
		identity.display_name = display_name.to_string();
		identity.avatar_url = avatar_url.to_string();
		true
	}

	pub fn snapshot(&self) -> BTreeMap<UserId, WebsiteUser> {
		self.inner
			.lock()
			.values()
			.map(|w| {
				(
					w.id.clone(),
					WebsiteUser {
						id: w.id.clone(),
						name: w.display_name.clone(),
						avatar_url: w.avatar_url.clone(),
					},
				)
			})
			.collect()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	pub fn display_name(&self, id: &UserId) -> Option<String> {
		self.inner.lock().get(id).map(|w| w.display_name.clone())
	}

	pub fn connection_count(&self, id: &UserId) -> usize {
		self.inner.lock().get(id).map_or(0, WebIdentity::connection_count)
	}

	/// Answer to the `!proxyusers` room command.
	pub fn roster_text(&self) -> String {
		let users = self.snapshot();
		if users.is_empty() {
			return "No users currently on the chat proxy website.".to_string();
		}

		let mut out = format!("{} users currently on the chat proxy website:", users.len());
		for (id, user) in &users {
			let _ = write!(out, "\n{} ({})", user.name, id.community_profile_url());
		}
		out
	}
}
