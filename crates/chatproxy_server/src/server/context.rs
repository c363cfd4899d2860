#![forbid(unsafe_code)]

use std::sync::Arc;

use chatproxy_platform::{Authorizer, ChatClient, ProfileLookup, SessionStore};

use crate::server::hub::{ConnectionHub, HubConfig};
use crate::server::presence::PresenceRegistry;
use crate::server::status::{StatusConfig, StatusMachine};

/// Everything the gate, relay and dispatcher share. Built once in `main`.
#[derive(Clone)]
pub struct Context {
	pub status: StatusMachine,
	pub presence: PresenceRegistry,
	pub hub: ConnectionHub,
	pub sessions: Arc<dyn SessionStore>,
	pub authorizer: Arc<dyn Authorizer>,
	pub profiles: Arc<dyn ProfileLookup>,
}

/// Collaborators needed to build a `Context`.
pub struct Collaborators {
	pub client: Arc<dyn ChatClient>,
	pub sessions: Arc<dyn SessionStore>,
	pub authorizer: Arc<dyn Authorizer>,
	pub profiles: Arc<dyn ProfileLookup>,
}

impl Context {
	pub fn new(collaborators: Collaborators, status_cfg: StatusConfig, hub_cfg: HubConfig) -> Self {
		Self {
			status: StatusMachine::new(collaborators.client, status_cfg),
			presence: PresenceRegistry::new(),
			hub: ConnectionHub::new(hub_cfg),
			sessions: collaborators.sessions,
			authorizer: collaborators.authorizer,
			profiles: collaborators.profiles,
		}
	}
}
