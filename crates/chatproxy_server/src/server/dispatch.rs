#![forbid(unsafe_code)]

use chatproxy_platform::{ClientEvent, ClientEventRx};
use chatproxy_protocol::ServerEvent;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::context::Context;
use crate::server::relay::relay_inbound;
use crate::server::status::ProxyEvent;

/// Commands room members can issue to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomCommand {
	Mute,
	Unmute,
	Users,
}

impl RoomCommand {
	pub fn parse(text: &str) -> Option<Self> {
		let text = text.trim();
		if text.eq_ignore_ascii_case("!proxymute") {
			Some(RoomCommand::Mute)
		} else if text.eq_ignore_ascii_case("!proxyunmute") {
			Some(RoomCommand::Unmute)
		} else if text.eq_ignore_ascii_case("!proxyusers") {
			Some(RoomCommand::Users)
		} else {
			None
		}
	}
}

/// Consumes chat-network events in order and applies them to the bridge.
pub struct ChatEventDispatcher {
	ctx: Context,
	events_rx: ClientEventRx,
}

impl ChatEventDispatcher {
	pub fn new(ctx: Context, events_rx: ClientEventRx) -> Self {
		Self { ctx, events_rx }
	}

	/// Run until the adapter's event channel closes.
	pub async fn run(mut self) {
		info!("chat event dispatcher started");

		while let Some(ev) = self.events_rx.recv().await {
			self.dispatch(ev).await;
		}

		info!("chat event dispatcher exiting (adapter event channel closed)");
	}

	pub async fn dispatch(&self, ev: ClientEvent) {
		let ctx = &self.ctx;
		match ev {
			ClientEvent::LoggedOn { self_id } => ctx.status.on_logged_on(self_id).await,

			ClientEvent::Disconnected { reason } => {
				warn!(reason = reason.as_deref().unwrap_or("unknown"), "chat network disconnected");
				ctx.status.on_disconnected();
			}

			ClientEvent::ChatMessage {
				room,
				text,
				entry_type,
				sender,
			} => {
				if !relay_inbound(ctx, &room, &sender, &text, entry_type) {
					return;
				}
				if let Some(cmd) = RoomCommand::parse(&text) {
					self.run_command(cmd).await;
				}
			}

			ClientEvent::RoomEntered { room, members } => ctx.status.on_room_entered(&room, members),

			ClientEvent::MemberStateChanged {
				change,
				target,
				room,
				actor,
			} => ctx.status.on_room_state_changed(change, &target, &room, actor.as_ref()),

			ClientEvent::PersonaStateChanged(member) => ctx.status.on_persona_changed(member),

			ClientEvent::Error { detail } => warn!(%detail, "chat network error"),
		}
	}

	async fn run_command(&self, cmd: RoomCommand) {
		debug!(?cmd, "room command");
		match cmd {
			RoomCommand::Mute => self.ctx.status.mute(),
			RoomCommand::Unmute => self.ctx.status.unmute(),
			RoomCommand::Users => {
				let text = self.ctx.presence.roster_text();
				if let Err(e) = self.ctx.status.send_notice(&text).await {
					warn!(error = %e, "failed to answer user list command");
				}
			}
		}
	}
}

pub fn spawn_dispatcher(ctx: Context, events_rx: ClientEventRx) -> JoinHandle<()> {
	let dispatcher = ChatEventDispatcher::new(ctx, events_rx);
	tokio::spawn(dispatcher.run())
}

/// Map a status machine event onto the browser wire event.
pub fn proxy_event_to_server_event(ev: ProxyEvent) -> ServerEvent {
	match ev {
		ProxyEvent::StatusChanged { old, new } => ServerEvent::ProxyStatusChange {
			old_status: Some(old),
			new_status: new,
		},
		ProxyEvent::MemberStateChanged {
			change,
			user,
			acted_on_by,
		} => ServerEvent::MemberStateChange {
			change,
			user,
			acted_on_by,
		},
		ProxyEvent::PersonaChanged(member) => ServerEvent::PersonaStateChange(member),
	}
}

/// Broadcast every status machine event to admitted connections.
pub fn spawn_proxy_event_forwarder(ctx: Context) -> JoinHandle<()> {
	let mut rx = ctx.status.subscribe();
	tokio::spawn(async move {
		loop {
			match rx.recv().await {
				Ok(ev) => ctx.hub.broadcast(proxy_event_to_server_event(ev)),
				Err(broadcast::error::RecvError::Lagged(n)) => {
					warn!(lagged = n, "proxy event forwarder lagged; some events were not broadcast");
				}
				Err(broadcast::error::RecvError::Closed) => {
					debug!("proxy event forwarder exiting");
					break;
				}
			}
		}
	})
}
