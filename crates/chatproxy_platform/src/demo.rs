#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chatproxy_domain::{ChatMember, PersonaState, Profile, RoomId, UserId};
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

use crate::profile::{LookupError, ProfileLookup};
use crate::{
	ChatEntryType, ChatNetworkAdapter, ClientControl, ClientControlRx, ClientError, ClientEvent, ClientEventTx,
	new_session_id,
};

/// In-process stand-in for the chat network, used for local runs and end-to-end tests.
pub struct DemoNetwork {
	self_member: ChatMember,
	members: Vec<ChatMember>,
	tick: Duration,
	log_on_delay: Duration,
	join_delay: Duration,
	chatter_every: Option<Duration>,
	drop_after: Option<Duration>,
}

impl Default for DemoNetwork {
	fn default() -> Self {
		Self::new()
	}
}

impl DemoNetwork {
	pub fn new() -> Self {
		let member = |id: &str, name: &str| UserId::new(id).map(|id| ChatMember::new(id, name));
		let members = [member("76561190000000001", "DemoAlice"), member("76561190000000002", "DemoBob")]
			.into_iter()
			.flatten()
			.collect();

		Self {
			self_member: ChatMember::new(demo_self_id(), "ChatProxy"),
			members,
			tick: Duration::from_millis(25),
			log_on_delay: Duration::from_millis(200),
			join_delay: Duration::from_millis(200),
			chatter_every: Some(Duration::from_secs(15)),
			drop_after: None,
		}
	}

	pub fn with_self(mut self, id: UserId, name: impl Into<String>) -> Self {
		self.self_member = ChatMember::new(id, name);
		self
	}

	pub fn with_members(mut self, members: Vec<ChatMember>) -> Self {
		self.members = members;
		self
	}

	pub fn with_delays(mut self, log_on: Duration, join: Duration) -> Self {
		self.log_on_delay = log_on;
		self.join_delay = join;
		self
	}

	/// `None` disables the periodic chatter from demo members.
	pub fn with_chatter(mut self, every: Option<Duration>) -> Self {
		self.chatter_every = every;
		self
	}

	/// Simulate a network drop this long after each successful log-on.
	pub fn with_drop_after(mut self, after: Option<Duration>) -> Self {
		self.drop_after = after;
		self
	}

	fn room_members(&self) -> Vec<ChatMember> {
		let mut out = Vec::with_capacity(self.members.len() + 1);
		out.push(self.self_member.clone());
		out.extend(self.members.iter().cloned());
		out
	}
}

fn demo_self_id() -> UserId {
	UserId::new(DEMO_SELF_ID).unwrap_or_else(|_| unreachable!("demo id literal is non-empty"))
}

const DEMO_SELF_ID: &str = "76561190000000000";

#[derive(Default)]
struct DemoState {
	logged_on: bool,
	log_on_at: Option<Instant>,
	drop_at: Option<Instant>,
	pending_joins: Vec<(Instant, RoomId)>,
	joined: HashSet<RoomId>,
	next_chatter: Option<Instant>,
	chatter_seq: u64,
}

impl DemoState {
	fn reset(&mut self) {
		self.logged_on = false;
		self.log_on_at = None;
		self.drop_at = None;
		self.pending_joins.clear();
		self.joined.clear();
		self.next_chatter = None;
	}
}

fn emit(events_tx: &ClientEventTx, ev: ClientEvent) {
	if events_tx.try_send(ev).is_err() {
		warn!("demo network events channel full; dropping event");
	}
}

#[async_trait]
impl ChatNetworkAdapter for DemoNetwork {
	fn name(&self) -> &'static str {
		"demo"
	}

	async fn run(self: Box<Self>, mut control_rx: ClientControlRx, events_tx: ClientEventTx) -> anyhow::Result<()> {
		let session_id = new_session_id();
		let mut state = DemoState::default();

		let mut interval: Interval = tokio::time::interval(self.tick);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		info!(%session_id, self_id = %self.self_member.id, "demo network started");

		loop {
			tokio::select! {
				_ = interval.tick() => {
					let now = Instant::now();

					if state.log_on_at.is_some_and(|at| at <= now) {
						state.log_on_at = None;
						state.logged_on = true;
						state.drop_at = self.drop_after.map(|d| now + d);
						info!(%session_id, "demo network logged on");
						emit(&events_tx, ClientEvent::LoggedOn { self_id: self.self_member.id.clone() });
					}

					if state.drop_at.is_some_and(|at| at <= now) {
						state.reset();
						info!(%session_id, "demo network simulating disconnect");
						emit(&events_tx, ClientEvent::Disconnected { reason: Some("simulated network drop".to_string()) });
						continue;
					}

					let (due, waiting): (Vec<_>, Vec<_>) = state.pending_joins.drain(..).partition(|(at, _)| *at <= now);
					state.pending_joins = waiting;
					for (_, room) in due {
						if state.joined.insert(room.clone()) {
							debug!(%room, "demo network entered room");
							emit(&events_tx, ClientEvent::RoomEntered { room, members: self.room_members() });
							if state.next_chatter.is_none() {
								state.next_chatter = self.chatter_every.map(|d| now + d);
							}
						}
					}

					let chatter_due = state.next_chatter.is_some_and(|at| at <= now) && !self.members.is_empty();
					if let (true, Some(every)) = (chatter_due, self.chatter_every) {
						state.next_chatter = Some(now + every);
						for room in &state.joined {
							state.chatter_seq += 1;
							let speaker = &self.members[(state.chatter_seq as usize) % self.members.len()];
							emit(&events_tx, ClientEvent::ChatMessage {
								room: room.clone(),
								text: format!("demo chatter #{}", state.chatter_seq),
								entry_type: ChatEntryType::ChatMsg,
								sender: speaker.id.clone(),
							});
						}
					}
				}

				cmd = control_rx.recv() => {
					let Some(cmd) = cmd else {
						info!("demo network control channel closed; shutting down");
						break;
					};

					match cmd {
						ClientControl::LogOn { credentials, resp } => {
							if credentials.username.trim().is_empty() {
								let _ = resp.send(Err(ClientError::LogOnRejected("missing account name".to_string())));
								continue;
							}

							if !state.logged_on && state.log_on_at.is_none() {
								state.log_on_at = Some(Instant::now() + self.log_on_delay);
								debug!(account = %credentials.username, "demo network log on scheduled");
							}
							let _ = resp.send(Ok(()));
						}

						ClientControl::JoinRoom { room } => {
							if !state.logged_on {
								emit(&events_tx, ClientEvent::Error { detail: format!("join {room} while logged off") });
								continue;
							}
							if state.joined.contains(&room) || state.pending_joins.iter().any(|(_, r)| *r == room) {
								continue;
							}
							state.pending_joins.push((Instant::now() + self.join_delay, room));
						}

						ClientControl::SendMessage { room, text } => {
							if !state.joined.contains(&room) {
								emit(&events_tx, ClientEvent::Error { detail: format!("send to {room} while not in room") });
								continue;
							}
							debug!(%room, len = text.len(), "demo network accepted message");
						}

						ClientControl::SetPersonaState { state: persona } => {
							if persona == PersonaState::Offline && !state.joined.is_empty() {
								debug!(rooms = state.joined.len(), "demo network dropped rooms on persona offline");
								state.joined.clear();
								state.pending_joins.clear();
								state.next_chatter = None;
							}
						}

						ClientControl::Shutdown => {
							info!("demo network received Shutdown");
							break;
						}
					}
				}
			}
		}

		emit(&events_tx, ClientEvent::Disconnected { reason: Some("demo network stopped".to_string()) });
		Ok(())
	}
}

/// Profile source for demo runs: known demo members resolve to their names, anyone else gets a
/// generated name.
pub struct DemoProfiles {
	known: Vec<ChatMember>,
}

impl DemoProfiles {
	pub fn new(known: Vec<ChatMember>) -> Self {
		Self { known }
	}

	pub fn for_network(net: &DemoNetwork) -> Self {
		Self::new(net.room_members())
	}
}

#[async_trait]
impl ProfileLookup for DemoProfiles {
	async fn profile(&self, id: &UserId) -> Result<Profile, LookupError> {
		if let Some(member) = self.known.iter().find(|m| m.id == *id) {
			return Ok(Profile::new(member.name.clone(), member.avatar_url.clone().unwrap_or_default()));
		}

		let s = id.as_str();
		let tail: String = s.chars().skip(s.chars().count().saturating_sub(4)).collect();
		Ok(Profile::new(format!("WebUser{tail}"), String::new()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{ChatClient, Credentials, SecretString, start_adapter};

	fn creds(name: &str) -> Credentials {
		Credentials {
			username: name.to_string(),
			password: SecretString::new("pw"),
			guard_code: None,
		}
	}

	fn fast() -> DemoNetwork {
		DemoNetwork::new()
			.with_delays(Duration::from_millis(10), Duration::from_millis(10))
			.with_chatter(None)
	}

	#[tokio::test]
	async fn log_on_then_join_reports_members() {
		let (handle, mut events) = start_adapter(Box::new(fast()), 8, 8);

		handle.log_on(&creds("proxy")).await.unwrap();
		let ev = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
		assert!(matches!(ev, ClientEvent::LoggedOn { .. }));

		let room = RoomId::new("103582791430000000").unwrap();
		handle.join_room(&room).await.unwrap();
		let ev = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
		match ev {
			ClientEvent::RoomEntered { room: entered, members } => {
				assert_eq!(entered, room);
				assert_eq!(members.len(), 3);
				assert_eq!(members[0].id, demo_self_id());
			}
			other => panic!("unexpected event: {other:?}"),
		}

		handle.shutdown().await;
	}

	#[tokio::test]
	async fn empty_account_name_is_rejected() {
		let (handle, _events) = start_adapter(Box::new(fast()), 8, 8);
		let err = handle.log_on(&creds("  ")).await.unwrap_err();
		assert!(matches!(err, ClientError::LogOnRejected(_)));
	}

	#[tokio::test]
	async fn drop_after_emits_disconnect() {
		let net = fast().with_drop_after(Some(Duration::from_millis(30)));
		let (handle, mut events) = start_adapter(Box::new(net), 8, 8);

		handle.log_on(&creds("proxy")).await.unwrap();
		let first = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
		assert!(matches!(first, ClientEvent::LoggedOn { .. }));
		let second = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
		assert!(matches!(second, ClientEvent::Disconnected { .. }));
	}

	#[tokio::test]
	async fn demo_profiles_resolve_members_and_strangers() {
		let profiles = DemoProfiles::for_network(&DemoNetwork::new());

		let alice = UserId::new("76561190000000001").unwrap();
		assert_eq!(profiles.profile(&alice).await.unwrap().display_name, "DemoAlice");

		let stranger = UserId::new("76561190000004242").unwrap();
		assert_eq!(profiles.profile(&stranger).await.unwrap().display_name, "WebUser4242");
	}
}
