#![forbid(unsafe_code)]

use std::collections::HashSet;

use async_trait::async_trait;
use chatproxy_domain::{Authorization, UserId};
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::profile::LookupError;

pub const STEAM_COMMUNITY_BASE_URL: &str = "https://steamcommunity.com";

/// Decides whether a web identity may take part in the chat.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
	async fn authorization(&self, id: &UserId) -> Result<Authorization, LookupError>;
}

/// Members of one community group are authorized; everybody else is blocked.
#[derive(Debug, Clone)]
pub struct GroupMemberList {
	base_url: Url,
	group_id: String,
	client: reqwest::Client,
}

impl GroupMemberList {
	pub fn new(base_url: Url, group_id: impl Into<String>) -> Self {
		Self {
			base_url,
			group_id: group_id.into(),
			client: reqwest::Client::new(),
		}
	}

	fn member_list_url(&self) -> Result<Url, LookupError> {
		let mut url = self
			.base_url
			.join(&format!("gid/{}/memberslistxml/", self.group_id))
			.map_err(|e| LookupError::InvalidResponse(format!("bad base url: {e}")))?;
		url.query_pairs_mut().append_pair("xml", "1");
		Ok(url)
	}
}

#[async_trait]
impl Authorizer for GroupMemberList {
	async fn authorization(&self, id: &UserId) -> Result<Authorization, LookupError> {
		let resp = self.client.get(self.member_list_url()?).send().await?;
		match resp.status() {
			StatusCode::OK => {}
			status => return Err(LookupError::Status(status.as_u16())),
		}

		let body = resp.text().await?;
		let members = parse_member_ids(&body)?;
		debug!(group = %self.group_id, members = members.len(), "group member list fetched");

		if members.iter().any(|m| m == id.as_str()) {
			Ok(Authorization::FoundAndAuthorized)
		} else {
			Ok(Authorization::FoundAndBlocked)
		}
	}
}

/// Extract every `<steamID64>` under `<members>` from a group member list document.
pub fn parse_member_ids(xml: &str) -> Result<Vec<String>, LookupError> {
	let mut reader = Reader::from_str(xml);
	reader.config_mut().trim_text(true);

	let mut ids = Vec::new();
	let mut saw_members = false;
	let mut in_members = false;
	let mut in_id = false;

	loop {
		match reader.read_event() {
			Ok(Event::Start(e)) => match e.name().as_ref() {
				b"members" => {
					in_members = true;
					saw_members = true;
				}
				b"steamID64" if in_members => in_id = true,
				_ => {}
			},
			Ok(Event::Empty(e)) if e.name().as_ref() == b"members" => saw_members = true,
			Ok(Event::End(e)) => match e.name().as_ref() {
				b"members" => in_members = false,
				b"steamID64" => in_id = false,
				_ => {}
			},
			Ok(Event::Text(t)) if in_id => {
				let text = t
					.unescape()
					.map_err(|e| LookupError::InvalidResponse(format!("member id text: {e}")))?;
				ids.push(text.trim().to_string());
			}
			Ok(Event::CData(t)) if in_id => {
				ids.push(String::from_utf8_lossy(&t.into_inner()).trim().to_string());
			}
			Ok(Event::Eof) => break,
			Ok(_) => {}
			Err(e) => {
				return Err(LookupError::InvalidResponse(format!(
					"member list xml at {}: {e}",
					reader.buffer_position()
				)));
			}
		}
	}

	if !saw_members {
		return Err(LookupError::InvalidResponse("member list has no members element".to_string()));
	}
	if ids.is_empty() {
		return Err(LookupError::InvalidResponse("member list has no member ids".to_string()));
	}
	Ok(ids)
}

/// Static authorization lists; ids on neither list are `NotFound`.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
	authorized: HashSet<UserId>,
	blocked: HashSet<UserId>,
}

impl AllowList {
	pub fn new(authorized: impl IntoIterator<Item = UserId>, blocked: impl IntoIterator<Item = UserId>) -> Self {
		Self {
			authorized: authorized.into_iter().collect(),
			blocked: blocked.into_iter().collect(),
		}
	}
}

#[async_trait]
impl Authorizer for AllowList {
	async fn authorization(&self, id: &UserId) -> Result<Authorization, LookupError> {
		if self.blocked.contains(id) {
			Ok(Authorization::FoundAndBlocked)
		} else if self.authorized.contains(id) {
			Ok(Authorization::FoundAndAuthorized)
		} else {
			Ok(Authorization::NotFound)
		}
	}
}
