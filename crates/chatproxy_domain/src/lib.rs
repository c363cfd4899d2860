#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers and wire codes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown code: {0}")]
	UnknownCode(u8),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// External user key (a 64-bit community id rendered as a decimal string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.chars().any(char::is_whitespace) {
			return Err(ParseIdError::InvalidFormat(format!("user id contains whitespace: {trimmed:?}")));
		}
		Ok(Self(trimmed.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}

	/// Public community profile page for this user.
	pub fn community_profile_url(&self) -> String {
		format!("http://steamcommunity.com/profiles/{}", self.0)
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s)
	}
}

/// External group chat room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id.trim().to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s)
	}
}

/// Server-assigned handle of one browser connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Connection and room-membership status of the proxy identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ProxyStatus {
	Offline,
	NotInChat,
	InChatMuted,
	InChatUnmuted,
}

impl ProxyStatus {
	/// Stable wire code.
	pub const fn code(self) -> u8 {
		match self {
			ProxyStatus::Offline => 0,
			ProxyStatus::NotInChat => 1,
			ProxyStatus::InChatMuted => 2,
			ProxyStatus::InChatUnmuted => 3,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			ProxyStatus::Offline => "offline",
			ProxyStatus::NotInChat => "not_in_chat",
			ProxyStatus::InChatMuted => "in_chat_muted",
			ProxyStatus::InChatUnmuted => "in_chat_unmuted",
		}
	}

	/// Whether the proxy is confirmed inside the room.
	pub const fn is_in_chat(self) -> bool {
		matches!(self, ProxyStatus::InChatMuted | ProxyStatus::InChatUnmuted)
	}

	/// In-chat status matching the given mute flag.
	pub const fn in_chat(muted: bool) -> Self {
		if muted {
			ProxyStatus::InChatMuted
		} else {
			ProxyStatus::InChatUnmuted
		}
	}
}

impl fmt::Display for ProxyStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl From<ProxyStatus> for u8 {
	fn from(status: ProxyStatus) -> Self {
		status.code()
	}
}

impl TryFrom<u8> for ProxyStatus {
	type Error = ParseIdError;

	fn try_from(code: u8) -> Result<Self, ParseIdError> {
		match code {
			0 => Ok(ProxyStatus::Offline),
			1 => Ok(ProxyStatus::NotInChat),
			2 => Ok(ProxyStatus::InChatMuted),
			3 => Ok(ProxyStatus::InChatUnmuted),
			other => Err(ParseIdError::UnknownCode(other)),
		}
	}
}

/// Terminal or success status reported to a connecting browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ConnectionStatus {
	Error,
	NoSession,
	NoUser,
	UserNotAllowedToChat,
	UserCanChat,
}

impl ConnectionStatus {
	pub const fn code(self) -> u8 {
		match self {
			ConnectionStatus::Error => 0,
			ConnectionStatus::NoSession => 1,
			ConnectionStatus::NoUser => 2,
			ConnectionStatus::UserNotAllowedToChat => 3,
			ConnectionStatus::UserCanChat => 4,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			ConnectionStatus::Error => "error",
			ConnectionStatus::NoSession => "no_session",
			ConnectionStatus::NoUser => "no_user",
			ConnectionStatus::UserNotAllowedToChat => "user_not_allowed_to_chat",
			ConnectionStatus::UserCanChat => "user_can_chat",
		}
	}
}

impl fmt::Display for ConnectionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl From<ConnectionStatus> for u8 {
	fn from(status: ConnectionStatus) -> Self {
		status.code()
	}
}

impl TryFrom<u8> for ConnectionStatus {
	type Error = ParseIdError;

	fn try_from(code: u8) -> Result<Self, ParseIdError> {
		match code {
			0 => Ok(ConnectionStatus::Error),
			1 => Ok(ConnectionStatus::NoSession),
			2 => Ok(ConnectionStatus::NoUser),
			3 => Ok(ConnectionStatus::UserNotAllowedToChat),
			4 => Ok(ConnectionStatus::UserCanChat),
			other => Err(ParseIdError::UnknownCode(other)),
		}
	}
}

/// Permission category of a web identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authorization {
	NotFound,
	FoundAndBlocked,
	FoundAndAuthorized,
}

/// Presence state announced by a chat-network user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PersonaState {
	#[default]
	Offline,
	Online,
	Busy,
	Away,
	Snooze,
	LookingToTrade,
	LookingToPlay,
}

impl From<PersonaState> for u8 {
	fn from(state: PersonaState) -> Self {
		match state {
			PersonaState::Offline => 0,
			PersonaState::Online => 1,
			PersonaState::Busy => 2,
			PersonaState::Away => 3,
			PersonaState::Snooze => 4,
			PersonaState::LookingToTrade => 5,
			PersonaState::LookingToPlay => 6,
		}
	}
}

impl TryFrom<u8> for PersonaState {
	type Error = ParseIdError;

	fn try_from(code: u8) -> Result<Self, ParseIdError> {
		match code {
			0 => Ok(PersonaState::Offline),
			1 => Ok(PersonaState::Online),
			2 => Ok(PersonaState::Busy),
			3 => Ok(PersonaState::Away),
			4 => Ok(PersonaState::Snooze),
			5 => Ok(PersonaState::LookingToTrade),
			6 => Ok(PersonaState::LookingToPlay),
			other => Err(ParseIdError::UnknownCode(other)),
		}
	}
}

/// Room member state-change bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberStateChange(pub u32);

impl MemberStateChange {
	pub const JOINED: Self = Self(0x01);
	pub const LEFT: Self = Self(0x02);
	pub const DISCONNECTED: Self = Self(0x04);
	pub const KICKED: Self = Self(0x08);
	pub const BANNED: Self = Self(0x10);

	const DEPARTED_MASK: u32 = 0x02 | 0x04 | 0x08 | 0x10;
	const FORCED_MASK: u32 = 0x08 | 0x10;

	pub const fn bits(self) -> u32 {
		self.0
	}

	pub const fn contains(self, other: Self) -> bool {
		self.0 & other.0 == other.0
	}

	pub const fn is_joined(self) -> bool {
		self.0 & Self::JOINED.0 != 0
	}

	/// Left, disconnected, kicked or banned.
	pub const fn is_departed(self) -> bool {
		self.0 & Self::DEPARTED_MASK != 0
	}

	/// Kicked or banned.
	pub const fn is_forced_removal(self) -> bool {
		self.0 & Self::FORCED_MASK != 0
	}
}

impl core::ops::BitOr for MemberStateChange {
	type Output = Self;

	fn bitor(self, rhs: Self) -> Self {
		Self(self.0 | rhs.0)
	}
}

impl fmt::Display for MemberStateChange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		const NAMES: [(MemberStateChange, &str); 5] = [
			(MemberStateChange::JOINED, "joined"),
			(MemberStateChange::LEFT, "left"),
			(MemberStateChange::DISCONNECTED, "disconnected"),
			(MemberStateChange::KICKED, "kicked"),
			(MemberStateChange::BANNED, "banned"),
		];

		let mut first = true;
		for (flag, name) in NAMES {
			if self.contains(flag) {
				if !first {
					f.write_str("|")?;
				}
				f.write_str(name)?;
				first = false;
			}
		}
		if first {
			write!(f, "0x{:02x}", self.0)?;
		}
		Ok(())
	}
}

/// Snapshot of a chat-network user as seen by the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMember {
	#[serde(rename = "friendid")]
	pub id: UserId,
	#[serde(rename = "playerName")]
	pub name: String,
	#[serde(rename = "avatarUrl", default, skip_serializing_if = "Option::is_none")]
	pub avatar_url: Option<String>,
	#[serde(rename = "personaState", default)]
	pub persona_state: PersonaState,
}

impl ChatMember {
	pub fn new(id: UserId, name: impl Into<String>) -> Self {
		Self {
			id,
			name: name.into(),
			avatar_url: None,
			persona_state: PersonaState::Online,
		}
	}
}

/// Display name and avatar resolved for a web identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
	pub display_name: String,
	pub avatar_url: String,
}

impl Profile {
	pub fn new(display_name: impl Into<String>, avatar_url: impl Into<String>) -> Self {
		Self {
			display_name: display_name.into(),
			avatar_url: avatar_url.into(),
		}
	}
}
