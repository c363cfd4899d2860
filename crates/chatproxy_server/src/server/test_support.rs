#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chatproxy_domain::{ChatMember, ConnId, PersonaState, Profile, ProxyStatus, RoomId, UserId};
use chatproxy_platform::{
	AllowList, ChatClient, ClientError, ClientEvent, ClientEventTx, Credentials, LookupError, MemorySessionStore,
	ProfileLookup, SecretString, Session,
};
use chatproxy_protocol::ServerEvent;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::server::context::{Collaborators, Context};
use crate::server::dispatch::{spawn_dispatcher, spawn_proxy_event_forwarder};
use crate::server::gate::{self, Admission, GateError};
use crate::server::hub::{HubConfig, HubItem};
use crate::server::status::StatusConfig;

pub(crate) const ROOM: &str = "103582791430000000";
pub(crate) const PROXY_ID: &str = "76561190000000000";

pub(crate) fn uid(s: &str) -> UserId {
	UserId::new(s).expect("valid UserId")
}

pub(crate) fn room() -> RoomId {
	RoomId::new(ROOM).expect("valid RoomId")
}

pub(crate) fn member(id: &str, name: &str) -> ChatMember {
	ChatMember::new(uid(id), name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
	LogOn,
	Join(RoomId),
	Send(RoomId, String),
	Persona(PersonaState),
}

/// `ChatClient` that records every call and optionally answers like a live network.
pub(crate) struct FakeChatClient {
	calls: Mutex<Vec<Call>>,
	events_tx: ClientEventTx,
	answer_log_on: AtomicBool,
	answer_join: AtomicBool,
	members: Mutex<Vec<ChatMember>>,
}

impl FakeChatClient {
	pub(crate) fn calls(&self) -> Vec<Call> {
		self.calls.lock().clone()
	}

	pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
		self.calls.lock().iter().filter(|c| pred(c)).count()
	}

	pub(crate) fn sent_texts(&self) -> Vec<String> {
		self.calls
			.lock()
			.iter()
			.filter_map(|c| match c {
				Call::Send(_, text) => Some(text.clone()),
				_ => None,
			})
			.collect()
	}

	pub(crate) fn set_members(&self, members: Vec<ChatMember>) {
		*self.members.lock() = members;
	}

	fn record(&self, call: Call) {
		self.calls.lock().push(call);
	}
}

#[async_trait]
impl ChatClient for FakeChatClient {
	async fn log_on(&self, _credentials: &Credentials) -> Result<(), ClientError> {
		self.record(Call::LogOn);
		if self.answer_log_on.load(Ordering::SeqCst) {
			let _ = self.events_tx.try_send(ClientEvent::LoggedOn { self_id: uid(PROXY_ID) });
		}
		Ok(())
	}

	async fn send_message(&self, room: &RoomId, text: &str) -> Result<(), ClientError> {
		self.record(Call::Send(room.clone(), text.to_string()));
		Ok(())
	}

	async fn join_room(&self, room: &RoomId) -> Result<(), ClientError> {
		self.record(Call::Join(room.clone()));
		if self.answer_join.load(Ordering::SeqCst) {
			let mut members = vec![member(PROXY_ID, "ChatProxy")];
			members.extend(self.members.lock().iter().cloned());
			let _ = self.events_tx.try_send(ClientEvent::RoomEntered {
				room: room.clone(),
				members,
			});
		}
		Ok(())
	}

	async fn set_persona_state(&self, state: PersonaState) -> Result<(), ClientError> {
		self.record(Call::Persona(state));
		Ok(())
	}
}

/// Profile table; unknown ids fail the lookup.
#[derive(Default)]
pub(crate) struct StaticProfiles {
	profiles: Mutex<HashMap<UserId, Profile>>,
	lookups: AtomicUsize,
}

impl StaticProfiles {
	pub(crate) fn set(&self, id: &str, name: &str) {
		self.profiles
			.lock()
			.insert(uid(id), Profile::new(name, format!("https://avatars.test/{id}.jpg")));
	}

	pub(crate) fn lookups(&self) -> usize {
		self.lookups.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl ProfileLookup for StaticProfiles {
	async fn profile(&self, id: &UserId) -> Result<Profile, LookupError> {
		self.lookups.fetch_add(1, Ordering::SeqCst);
		self.profiles.lock().get(id).cloned().ok_or(LookupError::Status(404))
	}
}

/// A bridge wired to fakes, with the chat event dispatcher running.
///
/// Sessions: `tok-<id>` for ids 42, 43, 44, 7, 666 and 404; `tok-anon` has no user.
/// Authorization: 42, 43, 44 and 7 are authorized, 666 is blocked, anyone else is unknown.
/// Profiles: every id above except 44.
pub(crate) struct Harness {
	pub ctx: Context,
	pub client: Arc<FakeChatClient>,
	pub profiles: Arc<StaticProfiles>,
	pub events_tx: ClientEventTx,
}

impl Harness {
	/// Network answers log-on and join requests.
	pub(crate) fn new() -> Self {
		Self::build(true, true, |_| {})
	}

	/// Network never answers.
	pub(crate) fn silent() -> Self {
		Self::build(false, false, |_| {})
	}

	pub(crate) fn build(answer_log_on: bool, answer_join: bool, tweak: impl FnOnce(&mut StatusConfig)) -> Self {
		let (events_tx, events_rx) = mpsc::channel(256);

		let client = Arc::new(FakeChatClient {
			calls: Mutex::new(Vec::new()),
			events_tx: events_tx.clone(),
			answer_log_on: AtomicBool::new(answer_log_on),
			answer_join: AtomicBool::new(answer_join),
			members: Mutex::new(Vec::new()),
		});

		let sessions = Arc::new(MemorySessionStore::new());
		for id in ["42", "43", "44", "7", "666", "404"] {
			sessions.insert(format!("tok-{id}"), Session { user_id: Some(uid(id)) });
		}
		sessions.insert("tok-anon", Session { user_id: None });

		let authorizer = Arc::new(AllowList::new(
			["42", "43", "44", "7"].into_iter().map(uid),
			[uid("666")],
		));

		let profiles = Arc::new(StaticProfiles::default());
		profiles.set("42", "Answer");
		profiles.set("43", "Fortythree");
		profiles.set("7", "Alice");
		profiles.set("666", "Mallory");
		profiles.set("404", "Ghost");

		let credentials = Credentials {
			username: "proxybot".to_string(),
			password: SecretString::new("pw"),
			guard_code: None,
		};
		let mut status_cfg = StatusConfig::new(room(), credentials);
		status_cfg.poll_interval = Duration::from_millis(10);
		status_cfg.login_timeout = Duration::from_millis(500);
		status_cfg.join_timeout = Duration::from_millis(500);
		status_cfg.rejoin_delay = Duration::from_millis(20);
		status_cfg.reconnect_interval = Duration::from_secs(3600);
		tweak(&mut status_cfg);

		let ctx = Context::new(
			Collaborators {
				client: client.clone(),
				sessions,
				authorizer,
				profiles: profiles.clone(),
			},
			status_cfg,
			HubConfig::default(),
		);

		let _dispatcher = spawn_dispatcher(ctx.clone(), events_rx);

		Self {
			ctx,
			client,
			profiles,
			events_tx,
		}
	}

	pub(crate) fn forward_proxy_events(&self) {
		let _forwarder = spawn_proxy_event_forwarder(self.ctx.clone());
	}

	/// Log on and join; the proxy ends up InChatUnmuted.
	pub(crate) async fn ready(&self) {
		self.ctx
			.status
			.login_if_offline(Duration::from_millis(500))
			.await
			.expect("log on");
		self.ctx
			.status
			.join_chat(Duration::from_millis(500))
			.await
			.expect("join");
		assert_eq!(self.ctx.status.status(), ProxyStatus::InChatUnmuted);
	}

	/// Feed an event to the dispatcher as if the network sent it.
	pub(crate) async fn network(&self, ev: ClientEvent) {
		self.events_tx.send(ev).await.expect("dispatcher running");
	}

	pub(crate) async fn connect(&self, conn: u64, token: Option<&str>) -> (Result<Admission, GateError>, mpsc::Receiver<HubItem>) {
		let (tx, rx) = self.ctx.hub.outbound_channel();
		let result = gate::admit(&self.ctx, ConnId(conn), token, &tx).await;
		(result, rx)
	}
}

/// Everything queued on a connection right now.
pub(crate) fn drain(rx: &mut mpsc::Receiver<HubItem>) -> Vec<ServerEvent> {
	let mut out = Vec::new();
	while let Ok(item) = rx.try_recv() {
		if let HubItem::Event(ev) = item {
			out.push(ev);
		}
	}
	out
}

/// Poll `cond` every few milliseconds for up to two seconds.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
	while tokio::time::Instant::now() < deadline {
		if cond() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	cond()
}
