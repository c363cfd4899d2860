#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chatproxy_domain::{ChatMember, MemberStateChange, PersonaState, ProxyStatus, RoomId, UserId};
use chatproxy_platform::{ChatClient, ClientError, Credentials};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::waiter::{DEFAULT_POLL_INTERVAL, PollingWaiter, WaitError, WaitOutcome};

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REJOIN_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

const PROXY_EVENTS_CAPACITY: usize = 1024;

/// Settings for `StatusMachine`.
#[derive(Debug, Clone)]
pub struct StatusConfig {
	pub room: RoomId,
	pub credentials: Credentials,
	pub poll_interval: Duration,
	pub login_timeout: Duration,
	pub join_timeout: Duration,
	/// Delay between going invisible and re-announcing Online when leaving the room.
	pub rejoin_delay: Duration,
	pub reconnect_interval: Duration,
}

impl StatusConfig {
	pub fn new(room: RoomId, credentials: Credentials) -> Self {
		Self {
			room,
			credentials,
			poll_interval: DEFAULT_POLL_INTERVAL,
			login_timeout: DEFAULT_CONFIRM_TIMEOUT,
			join_timeout: DEFAULT_CONFIRM_TIMEOUT,
			rejoin_delay: DEFAULT_REJOIN_DELAY,
			reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
		}
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StatusError {
	#[error("{what} was not confirmed after {} ms", .after.as_millis())]
	Timeout {
		what: &'static str,
		after: Duration,
	},

	#[error("{what} cancelled")]
	Cancelled {
		what: &'static str,
	},

	#[error(transparent)]
	Client(#[from] ClientError),
}

impl From<WaitError> for StatusError {
	fn from(e: WaitError) -> Self {
		match e {
			WaitError::Timeout { what, after } => StatusError::Timeout { what, after },
			WaitError::Cancelled { what } => StatusError::Cancelled { what },
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
	AlreadyConnected,
	Connected,
}

impl fmt::Display for LoginOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			LoginOutcome::AlreadyConnected => f.write_str("already connected"),
			LoginOutcome::Connected => f.write_str("successfully connected"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
	AlreadyInChat,
	/// The network already listed the proxy in the room; only the local status was corrected.
	Reconciled,
	Joined,
	SkippedOffline,
}

impl fmt::Display for JoinOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			JoinOutcome::AlreadyInChat => f.write_str("already in chat"),
			JoinOutcome::Reconciled => f.write_str("already in chat but status was wrong"),
			JoinOutcome::Joined => f.write_str("successfully joined chat"),
			JoinOutcome::SkippedOffline => f.write_str("skipped: offline"),
		}
	}
}

/// Events published by the status machine, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
	StatusChanged {
		old: ProxyStatus,
		new: ProxyStatus,
	},

	MemberStateChanged {
		change: MemberStateChange,
		user: ChatMember,
		acted_on_by: Option<ChatMember>,
	},

	PersonaChanged(ChatMember),
}

type WaitResult = Result<WaitOutcome, StatusError>;
type SharedWait = Shared<BoxFuture<'static, WaitResult>>;

struct WaitSlot {
	id: u64,
	fut: SharedWait,
}

struct Inner {
	status: ProxyStatus,
	muted: bool,
	self_id: Option<UserId>,

	/// Every user the network has told us about.
	personas: HashMap<UserId, ChatMember>,
	/// Ids currently in our room.
	roster: HashSet<UserId>,

	login_wait: Option<WaitSlot>,
	join_wait: Option<WaitSlot>,
	next_wait_id: u64,

	/// Cancelled (and replaced) whenever the network connection drops.
	epoch: CancellationToken,
}

/// Owns the proxy identity's status, the mute flag and the room-membership cache.
#[derive(Clone)]
pub struct StatusMachine {
	inner: Arc<Mutex<Inner>>,
	client: Arc<dyn ChatClient>,
	cfg: Arc<StatusConfig>,
	events: broadcast::Sender<ProxyEvent>,
}

impl StatusMachine {
	pub fn new(client: Arc<dyn ChatClient>, cfg: StatusConfig) -> Self {
		let (events, _) = broadcast::channel(PROXY_EVENTS_CAPACITY);
		metrics::gauge!("chatproxy_proxy_status").set(f64::from(ProxyStatus::Offline.code()));

		Self {
			inner: Arc::new(Mutex::new(Inner {
				status: ProxyStatus::Offline,
				muted: false,
				self_id: None,
				personas: HashMap::new(),
				roster: HashSet::new(),
				login_wait: None,
				join_wait: None,
				next_wait_id: 0,
				epoch: CancellationToken::new(),
			})),
			client,
			cfg: Arc::new(cfg),
			events,
		}
	}

	pub fn config(&self) -> &StatusConfig {
		&self.cfg
	}

	pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
		self.events.subscribe()
	}

	pub fn status(&self) -> ProxyStatus {
		self.inner.lock().status
	}

	pub fn is_muted(&self) -> bool {
		self.inner.lock().muted
	}

	pub fn self_id(&self) -> Option<UserId> {
		self.inner.lock().self_id.clone()
	}

	/// Whether the network lists the proxy identity in our room.
	pub fn proxy_in_room(&self) -> bool {
		let inner = self.inner.lock();
		proxy_in_roster(&inner)
	}

	pub fn is_user_in_room(&self, id: &UserId) -> bool {
		self.inner.lock().roster.contains(id)
	}

	/// Known display name of a network user.
	pub fn member_name(&self, id: &UserId) -> Option<String> {
		self.inner.lock().personas.get(id).map(|m| m.name.clone())
	}

	/// Current room members with a known persona.
	pub fn chat_members(&self) -> BTreeMap<UserId, ChatMember> {
		let inner = self.inner.lock();
		inner
			.roster
			.iter()
			.filter_map(|id| inner.personas.get(id).map(|m| (id.clone(), m.clone())))
			.collect()
	}

	/// Request a log-on unless one is unnecessary or already being awaited.
	pub async fn connect(&self) {
		{
			let inner = self.inner.lock();
			if inner.status != ProxyStatus::Offline || inner.login_wait.is_some() {
				return;
			}
		}

		info!(account = %self.cfg.credentials.username, "requesting chat network log on");
		if let Err(e) = self.client.log_on(&self.cfg.credentials).await {
			warn!(error = %e, "chat network log on request failed");
		}
	}

	/// Periodically call `connect` until `shutdown` fires. The first attempt happens immediately.
	pub fn spawn_reconnect_loop(&self, shutdown: CancellationToken) -> JoinHandle<()> {
		let this = self.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(this.cfg.reconnect_interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					_ = shutdown.cancelled() => {
						debug!("reconnect loop stopped");
						break;
					}
					_ = ticker.tick() => this.connect().await,
				}
			}
		})
	}

	pub async fn login_if_offline(&self, timeout: Duration) -> Result<LoginOutcome, StatusError> {
		let fut = {
			let mut inner = self.inner.lock();
			if inner.status != ProxyStatus::Offline {
				return Ok(LoginOutcome::AlreadyConnected);
			}
			let pending = inner.login_wait.as_ref().map(|slot| slot.fut.clone());
			match pending {
				Some(fut) => fut,
				None => {
					let id = next_wait_id(&mut inner);
					let fut = self.spawn_login_wait(id, timeout, inner.epoch.clone());
					inner.login_wait = Some(WaitSlot { id, fut: fut.clone() });
					fut
				}
			}
		};

		let outcome = fut.await?;
		debug!(%outcome, "log on wait finished");
		Ok(LoginOutcome::Connected)
	}

	fn spawn_login_wait(&self, id: u64, timeout: Duration, cancel: CancellationToken) -> SharedWait {
		let this = self.clone();
		let task = tokio::spawn(async move {
			let result = match this.client.log_on(&this.cfg.credentials).await {
				Ok(()) => {
					let waiter = PollingWaiter::new(this.cfg.poll_interval, timeout);
					waiter
						.wait("log on", || this.status() != ProxyStatus::Offline, &cancel)
						.await
						.map_err(StatusError::from)
				}
				Err(e) => Err(StatusError::Client(e)),
			};

			let mut inner = this.inner.lock();
			if inner.login_wait.as_ref().is_some_and(|slot| slot.id == id) {
				inner.login_wait = None;
			}
			result
		});

		flatten_join(task, "log on")
	}

	pub async fn join_chat(&self, timeout: Duration) -> Result<JoinOutcome, StatusError> {
		let fut = {
			let mut inner = self.inner.lock();
			match inner.status {
				ProxyStatus::Offline => return Ok(JoinOutcome::SkippedOffline),
				ProxyStatus::InChatMuted | ProxyStatus::InChatUnmuted => return Ok(JoinOutcome::AlreadyInChat),
				ProxyStatus::NotInChat => {}
			}

			if proxy_in_roster(&inner) {
				let target = ProxyStatus::in_chat(inner.muted);
				self.transition(&mut inner, target);
				info!(status = %target, "proxy already in room; status reconciled");
				return Ok(JoinOutcome::Reconciled);
			}

			let pending = inner.join_wait.as_ref().map(|slot| slot.fut.clone());
			match pending {
				Some(fut) => fut,
				None => {
					let id = next_wait_id(&mut inner);
					let fut = self.spawn_join_wait(id, timeout, inner.epoch.clone());
					inner.join_wait = Some(WaitSlot { id, fut: fut.clone() });
					fut
				}
			}
		};

		let outcome = fut.await?;
		debug!(%outcome, "join wait finished");
		Ok(JoinOutcome::Joined)
	}

	fn spawn_join_wait(&self, id: u64, timeout: Duration, cancel: CancellationToken) -> SharedWait {
		let this = self.clone();
		let task = tokio::spawn(async move {
			let result = match this.client.join_room(&this.cfg.room).await {
				Ok(()) => {
					let waiter = PollingWaiter::new(this.cfg.poll_interval, timeout);
					waiter
						.wait("room join", || this.proxy_in_room(), &cancel)
						.await
						.map_err(StatusError::from)
				}
				Err(e) => Err(StatusError::Client(e)),
			};

			let mut inner = this.inner.lock();
			if inner.join_wait.as_ref().is_some_and(|slot| slot.id == id) {
				inner.join_wait = None;
			}
			if result.is_ok() && inner.status == ProxyStatus::NotInChat {
				let target = ProxyStatus::in_chat(inner.muted);
				this.transition(&mut inner, target);
			}
			result
		});

		flatten_join(task, "room join")
	}

	/// Leave the room by going invisible, then re-announce Online after the rejoin delay.
	pub async fn leave_chat(&self) {
		{
			let mut inner = self.inner.lock();
			if !inner.status.is_in_chat() {
				return;
			}
			inner.roster.clear();
			self.transition(&mut inner, ProxyStatus::NotInChat);
		}

		if let Err(e) = self.client.set_persona_state(PersonaState::Offline).await {
			warn!(error = %e, "failed to set persona offline while leaving room");
		}

		let this = self.clone();
		tokio::spawn(async move {
			tokio::time::sleep(this.cfg.rejoin_delay).await;
			if this.status() == ProxyStatus::Offline {
				return;
			}
			if let Err(e) = this.client.set_persona_state(PersonaState::Online).await {
				warn!(error = %e, "failed to re-announce persona online");
			}
		});
	}

	pub fn mute(&self) {
		let mut inner = self.inner.lock();
		if inner.status == ProxyStatus::InChatUnmuted {
			self.transition(&mut inner, ProxyStatus::InChatMuted);
		}
	}

	pub fn unmute(&self) {
		let mut inner = self.inner.lock();
		if inner.status == ProxyStatus::InChatMuted {
			self.transition(&mut inner, ProxyStatus::InChatUnmuted);
		}
	}

	pub async fn on_logged_on(&self, self_id: UserId) {
		{
			let mut inner = self.inner.lock();
			info!(self_id = %self_id, "chat network logged on");
			inner.self_id = Some(self_id);
			if inner.status == ProxyStatus::Offline {
				self.transition(&mut inner, ProxyStatus::NotInChat);
			}
		}

		if let Err(e) = self.client.set_persona_state(PersonaState::Online).await {
			warn!(error = %e, "failed to announce persona online");
		}
	}

	/// Force Offline, cancel in-flight waits and drop the membership cache.
	pub fn on_disconnected(&self) {
		let mut inner = self.inner.lock();

		inner.epoch.cancel();
		inner.epoch = CancellationToken::new();
		inner.login_wait = None;
		inner.join_wait = None;
		inner.roster.clear();
		inner.personas.clear();

		if inner.status != ProxyStatus::Offline {
			self.transition(&mut inner, ProxyStatus::Offline);
		}
	}

	pub fn on_room_entered(&self, room: &RoomId, members: Vec<ChatMember>) {
		if *room != self.cfg.room {
			return;
		}

		let mut inner = self.inner.lock();
		inner.roster = members.iter().map(|m| m.id.clone()).collect();
		for member in members {
			inner.personas.insert(member.id.clone(), member);
		}
		debug!(%room, members = inner.roster.len(), "room member list replaced");
	}

	pub fn on_room_state_changed(&self, change: MemberStateChange, target: &UserId, room: &RoomId, actor: Option<&UserId>) {
		if *room != self.cfg.room {
			return;
		}

		let mut inner = self.inner.lock();

		if inner.self_id.as_ref() == Some(target) && change.is_departed() {
			inner.roster.clear();
			if inner.status.is_in_chat() {
				warn!(%change, "proxy left room");
				self.transition(&mut inner, ProxyStatus::NotInChat);
			}
			return;
		}

		if change.is_joined() {
			inner.roster.insert(target.clone());
		} else if change.is_departed() {
			inner.roster.remove(target);
		}

		let Some(user) = inner.personas.get(target).cloned() else {
			debug!(user = %target, %change, "state change for unknown user");
			return;
		};
		let acted_on_by = actor.and_then(|a| inner.personas.get(a).cloned());
		let _ = self.events.send(ProxyEvent::MemberStateChanged {
			change,
			user,
			acted_on_by,
		});
	}

	pub fn on_persona_changed(&self, member: ChatMember) {
		let mut inner = self.inner.lock();
		let in_room = inner.roster.contains(&member.id);
		inner.personas.insert(member.id.clone(), member.clone());
		if in_room {
			let _ = self.events.send(ProxyEvent::PersonaChanged(member));
		}
	}

	/// Post a web user's line as `"{name}: {text}"`. Returns whether it was sent.
	pub async fn send_proxy_message(&self, user: &UserId, name: &str, text: &str) -> Result<bool, ClientError> {
		if name.is_empty() || text.is_empty() || self.status() != ProxyStatus::InChatUnmuted {
			return Ok(false);
		}
		debug!(%user, len = text.len(), "forwarding web line to room");
		self.client.send_message(&self.cfg.room, &format!("{name}: {text}")).await?;
		Ok(true)
	}

	/// Post raw text while in the room, muted or not.
	pub async fn send_notice(&self, text: &str) -> Result<bool, ClientError> {
		if !self.status().is_in_chat() {
			return Ok(false);
		}
		self.client.send_message(&self.cfg.room, text).await?;
		Ok(true)
	}

	pub async fn send_joined_notice(&self, id: &UserId, name: &str) -> Result<bool, ClientError> {
		self.send_presence_notice(id, &format!("* {name} ({id}) joined from website *")).await
	}

	pub async fn send_left_notice(&self, id: &UserId, name: &str) -> Result<bool, ClientError> {
		self.send_presence_notice(id, &format!("* {name} ({id}) left website *")).await
	}

	async fn send_presence_notice(&self, id: &UserId, text: &str) -> Result<bool, ClientError> {
		if self.status() != ProxyStatus::InChatUnmuted || self.is_user_in_room(id) {
			return Ok(false);
		}
		self.client.send_message(&self.cfg.room, text).await?;
		Ok(true)
	}

	/// Publish (old, new) before storing `new`. Mute flag follows in-chat targets.
	fn transition(&self, inner: &mut Inner, new: ProxyStatus) {
		let old = inner.status;
		let _ = self.events.send(ProxyEvent::StatusChanged { old, new });
		inner.status = new;

		match new {
			ProxyStatus::InChatMuted => inner.muted = true,
			ProxyStatus::InChatUnmuted => inner.muted = false,
			ProxyStatus::Offline | ProxyStatus::NotInChat => {}
		}

		metrics::gauge!("chatproxy_proxy_status").set(f64::from(new.code()));
		metrics::counter!("chatproxy_status_transitions_total", "to" => new.as_str()).increment(1);
		info!(%old, %new, "proxy status changed");
	}
}

fn proxy_in_roster(inner: &Inner) -> bool {
	inner.self_id.as_ref().is_some_and(|id| inner.roster.contains(id))
}

fn next_wait_id(inner: &mut Inner) -> u64 {
	inner.next_wait_id += 1;
	inner.next_wait_id
}

fn flatten_join(task: JoinHandle<WaitResult>, what: &'static str) -> SharedWait {
	async move {
		match task.await {
			Ok(result) => result,
			Err(e) => {
				warn!(error = %e, what, "wait task failed");
				Err(StatusError::Cancelled { what })
			}
		}
	}
	.boxed()
	.shared()
}
