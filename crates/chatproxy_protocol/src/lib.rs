#![forbid(unsafe_code)]

pub mod framing;

use std::collections::BTreeMap;

use chatproxy_domain::{ChatMember, ConnectionStatus, MemberStateChange, ProxyStatus, UserId};
use serde::{Deserialize, Serialize};

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;
}

/// Public details of a web identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDetails {
	#[serde(rename = "steamId")]
	pub id: UserId,
	pub username: String,
	#[serde(rename = "avatarUrl")]
	pub avatar_url: String,
}

/// Entry of the web identity snapshot, shaped like a chat member so clients can render both lists alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsiteUser {
	#[serde(rename = "friendid")]
	pub id: UserId,
	#[serde(rename = "playerName")]
	pub name: String,
	#[serde(rename = "avatarUrl")]
	pub avatar_url: String,
}

/// One chat line shown to browsers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLine {
	#[serde(rename = "steamId")]
	pub sender: UserId,
	pub username: String,
	pub message: String,
}

/// Server → browser events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
	#[serde(rename = "connection status")]
	ConnectionStatus(ConnectionStatus),

	#[serde(rename = "proxy user status change")]
	ProxyStatusChange {
		#[serde(rename = "oldStatus")]
		old_status: Option<ProxyStatus>,
		#[serde(rename = "newStatus")]
		new_status: ProxyStatus,
	},

	#[serde(rename = "all chat member details")]
	AllChatMembers(BTreeMap<UserId, ChatMember>),

	#[serde(rename = "all website user details")]
	AllWebsiteUsers(BTreeMap<UserId, WebsiteUser>),

	#[serde(rename = "logged in user details")]
	LoggedInUser(UserDetails),

	#[serde(rename = "user joined from website")]
	UserJoinedFromWebsite(UserDetails),

	#[serde(rename = "user left website")]
	UserLeftWebsite {
		#[serde(rename = "steamId")]
		id: UserId,
		username: String,
	},

	#[serde(rename = "website user details")]
	WebsiteUserDetails(UserDetails),

	#[serde(rename = "message from chat")]
	ChatMessage(ChatLine),

	#[serde(rename = "user state change")]
	MemberStateChange {
		#[serde(rename = "stateChange")]
		change: MemberStateChange,
		user: ChatMember,
		#[serde(rename = "actedOnBy")]
		acted_on_by: Option<ChatMember>,
	},

	#[serde(rename = "persona state change")]
	PersonaStateChange(ChatMember),
}

impl ServerEvent {
	/// Stable event name used on the wire.
	pub fn name(&self) -> &'static str {
		match self {
			Self::ConnectionStatus(_) => "connection status",
			Self::ProxyStatusChange { .. } => "proxy user status change",
			Self::AllChatMembers(_) => "all chat member details",
			Self::AllWebsiteUsers(_) => "all website user details",
			Self::LoggedInUser(_) => "logged in user details",
			Self::UserJoinedFromWebsite(_) => "user joined from website",
			Self::UserLeftWebsite { .. } => "user left website",
			Self::WebsiteUserDetails(_) => "website user details",
			Self::ChatMessage(_) => "message from chat",
			Self::MemberStateChange { .. } => "user state change",
			Self::PersonaStateChange(_) => "persona state change",
		}
	}
}

/// Browser → server events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
	#[serde(rename = "send message to chat")]
	SendMessageToChat(String),
}
