#![forbid(unsafe_code)]

use chatproxy_domain::{ConnId, ProxyStatus, RoomId, UserId};
use chatproxy_platform::ChatEntryType;
use chatproxy_protocol::{ChatLine, ServerEvent, UserDetails};
use tracing::{debug, warn};

use crate::server::context::Context;

/// Display name used when an inbound speaker is unknown.
pub const UNKNOWN_SPEAKER: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
	/// Broadcast to the web and handed to the room.
	Forwarded,
	/// Broadcast to the web, but the room send did not happen.
	NotSent,
	Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
	EmptyText,
	NotUnmuted,
	ProfileUnavailable,
}

/// Web → room.
pub async fn relay_outbound(ctx: &Context, user: &UserId, text: &str, source: ConnId) -> RelayOutcome {
	let text = text.trim();
	if text.is_empty() {
		return RelayOutcome::Rejected(RejectReason::EmptyText);
	}
	if ctx.status.status() != ProxyStatus::InChatUnmuted {
		debug!(%source, %user, status = %ctx.status.status(), "dropping web line while not unmuted");
		return RelayOutcome::Rejected(RejectReason::NotUnmuted);
	}

	let profile = match ctx.profiles.profile(user).await {
		Ok(profile) => profile,
		Err(e) => {
			warn!(%source, %user, error = %e, "profile lookup failed; dropping web line");
			return RelayOutcome::Rejected(RejectReason::ProfileUnavailable);
		}
	};

	if ctx.presence.update(user, &profile.display_name, &profile.avatar_url) {
		ctx.hub.broadcast(ServerEvent::WebsiteUserDetails(UserDetails {
			id: user.clone(),
			username: profile.display_name.clone(),
			avatar_url: profile.avatar_url.clone(),
		}));
	}

	ctx.hub.broadcast(ServerEvent::ChatMessage(ChatLine {
		sender: user.clone(),
		username: profile.display_name.clone(),
		message: text.to_string(),
	}));
	metrics::counter!("chatproxy_relay_outbound_total").increment(1);

	match ctx.status.send_proxy_message(user, &profile.display_name, text).await {
		Ok(true) => RelayOutcome::Forwarded,
		Ok(false) => RelayOutcome::NotSent,
		Err(e) => {
			warn!(%source, %user, error = %e, "failed to forward web line to room");
			RelayOutcome::NotSent
		}
	}
}

/// Room → web. Returns whether the line was a chat message for our room.
pub fn relay_inbound(ctx: &Context, room: &RoomId, sender: &UserId, text: &str, entry_type: ChatEntryType) -> bool {
	if *room != ctx.status.config().room || entry_type != ChatEntryType::ChatMsg {
		return false;
	}

	let username = ctx
		.status
		.member_name(sender)
		.or_else(|| ctx.presence.display_name(sender))
		.unwrap_or_else(|| UNKNOWN_SPEAKER.to_string());

	ctx.hub.broadcast(ServerEvent::ChatMessage(ChatLine {
		sender: sender.clone(),
		username,
		message: text.to_string(),
	}));
	metrics::counter!("chatproxy_relay_inbound_total").increment(1);
	true
}
