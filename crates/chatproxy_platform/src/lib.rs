#![forbid(unsafe_code)]

pub mod authz;
pub mod demo;
pub mod profile;
pub mod session;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chatproxy_domain::{ChatMember, MemberStateChange, PersonaState, RoomId, UserId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

pub use authz::{AllowList, Authorizer, GroupMemberList};
pub use demo::{DemoNetwork, DemoProfiles};
pub use profile::{CachedProfiles, LookupError, ProfileLookup, SteamWebApi};
pub use session::{MemorySessionStore, Session, SessionStore, SignedTokenStore, token_from_cookie_header};

/// How long `AdapterHandle::log_on` waits for the adapter to accept a log-on request.
pub const LOG_ON_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Log-on credentials of the proxy identity.
#[derive(Debug, Clone)]
pub struct Credentials {
	pub username: String,
	pub password: SecretString,
	pub guard_code: Option<SecretString>,
}

/// Bridge → adapter control message.
#[derive(Debug)]
pub enum ClientControl {
	/// Start authenticating. The reply only acknowledges the request; completion arrives as `ClientEvent::LoggedOn`.
	LogOn {
		credentials: Credentials,
		resp: oneshot::Sender<Result<(), ClientError>>,
	},

	/// Post a line into a room.
	SendMessage {
		room: RoomId,
		text: String,
	},

	/// Ask to enter a room.
	JoinRoom {
		room: RoomId,
	},

	/// Announce the proxy's persona state.
	SetPersonaState {
		state: PersonaState,
	},

	/// Request a graceful shutdown.
	Shutdown,
}

/// Kind of a chat entry delivered by the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatEntryType {
	ChatMsg,
	Typing,
	Emote,
	Other(u32),
}

/// Adapter → bridge event.
#[derive(Debug, Clone)]
pub enum ClientEvent {
	LoggedOn {
		self_id: UserId,
	},

	Disconnected {
		reason: Option<String>,
	},

	ChatMessage {
		room: RoomId,
		text: String,
		entry_type: ChatEntryType,
		sender: UserId,
	},

	/// Full member list of a room the proxy just entered.
	RoomEntered {
		room: RoomId,
		members: Vec<ChatMember>,
	},

	MemberStateChanged {
		change: MemberStateChange,
		target: UserId,
		room: RoomId,
		actor: Option<UserId>,
	},

	PersonaStateChanged(ChatMember),

	/// Non-fatal adapter error, logged by the bridge.
	Error {
		detail: String,
	},
}

/// Chat client errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
	#[error("chat client unavailable: {0}")]
	Unavailable(String),

	#[error("log on rejected: {0}")]
	LogOnRejected(String),

	#[error("not logged on")]
	NotLoggedOn,
}

/// Operations the bridge may request from the external chat network.
#[async_trait]
pub trait ChatClient: Send + Sync + 'static {
	async fn log_on(&self, credentials: &Credentials) -> Result<(), ClientError>;

	async fn send_message(&self, room: &RoomId, text: &str) -> Result<(), ClientError>;

	async fn join_room(&self, room: &RoomId) -> Result<(), ClientError>;

	async fn set_persona_state(&self, state: PersonaState) -> Result<(), ClientError>;
}

pub type ClientControlTx = mpsc::Sender<ClientControl>;
pub type ClientControlRx = mpsc::Receiver<ClientControl>;
pub type ClientEventTx = mpsc::Sender<ClientEvent>;
pub type ClientEventRx = mpsc::Receiver<ClientEvent>;

/// A chat-network implementation driven over control/event channels.
#[async_trait]
pub trait ChatNetworkAdapter: Send + Sync + 'static {
	fn name(&self) -> &'static str;

	async fn run(self: Box<Self>, control_rx: ClientControlRx, events_tx: ClientEventTx) -> anyhow::Result<()>;
}

/// `ChatClient` implementation that forwards requests to a running adapter task.
#[derive(Debug, Clone)]
pub struct AdapterHandle {
	name: &'static str,
	control_tx: ClientControlTx,
}

impl AdapterHandle {
	pub fn name(&self) -> &'static str {
		self.name
	}

	/// Ask the adapter task to stop.
	pub async fn shutdown(&self) {
		if self.control_tx.send(ClientControl::Shutdown).await.is_ok() {
			debug!(adapter = self.name, "sent adapter Shutdown");
		}
	}

	async fn send_control(&self, ctrl: ClientControl) -> Result<(), ClientError> {
		self.control_tx
			.send(ctrl)
			.await
			.map_err(|_| ClientError::Unavailable(format!("{} control channel closed", self.name)))
	}
}

#[async_trait]
impl ChatClient for AdapterHandle {
	async fn log_on(&self, credentials: &Credentials) -> Result<(), ClientError> {
		let (tx, rx) = oneshot::channel();
		self.send_control(ClientControl::LogOn {
			credentials: credentials.clone(),
			resp: tx,
		})
		.await?;

		match tokio::time::timeout(LOG_ON_ACK_TIMEOUT, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(ClientError::Unavailable("adapter response dropped".to_string())),
			Err(_) => Err(ClientError::Unavailable("adapter log on acknowledgement timed out".to_string())),
		}
	}

	async fn send_message(&self, room: &RoomId, text: &str) -> Result<(), ClientError> {
		self.send_control(ClientControl::SendMessage {
			room: room.clone(),
			text: text.to_string(),
		})
		.await
	}

	async fn join_room(&self, room: &RoomId) -> Result<(), ClientError> {
		self.send_control(ClientControl::JoinRoom { room: room.clone() }).await
	}

	async fn set_persona_state(&self, state: PersonaState) -> Result<(), ClientError> {
		self.send_control(ClientControl::SetPersonaState { state }).await
	}
}

/// Spawn an adapter task and return its request handle and event stream.
pub fn start_adapter(
	adapter: Box<dyn ChatNetworkAdapter>,
	control_capacity: usize,
	events_capacity: usize,
) -> (AdapterHandle, ClientEventRx) {
	let name = adapter.name();
	let (control_tx, control_rx) = mpsc::channel(control_capacity);
	let (events_tx, events_rx) = mpsc::channel(events_capacity);

	tokio::spawn(async move {
		if let Err(e) = adapter.run(control_rx, events_tx).await {
			warn!(adapter = name, error = %e, "chat network adapter exited with error");
		}
	});

	(AdapterHandle { name, control_tx }, events_rx)
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}
