#![forbid(unsafe_code)]

use chatproxy_domain::{Authorization, ConnId, ConnectionStatus, Profile, UserId};
use chatproxy_protocol::{ServerEvent, UserDetails};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::server::context::Context;
use crate::server::hub::{HubItem, Outbound};

/// Why a connection was turned away. Each variant is reported as one terminal status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
	#[error("no session")]
	NoSession,

	#[error("user not found")]
	NoUser,

	#[error("user not allowed to chat")]
	NotAllowed,

	#[error("{0}")]
	Upstream(String),
}

impl GateError {
	pub fn connection_status(&self) -> ConnectionStatus {
		match self {
			GateError::NoSession => ConnectionStatus::NoSession,
			GateError::NoUser => ConnectionStatus::NoUser,
			GateError::NotAllowed => ConnectionStatus::UserNotAllowedToChat,
			GateError::Upstream(_) => ConnectionStatus::Error,
		}
	}

	fn reason(&self) -> &'static str {
		match self {
			GateError::NoSession => "no_session",
			GateError::NoUser => "no_user",
			GateError::NotAllowed => "not_allowed",
			GateError::Upstream(_) => "error",
		}
	}
}

/// An admitted connection's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
	pub user: UserId,
	pub profile: Profile,
	pub is_new_identity: bool,
}

impl Admission {
	pub fn details(&self) -> UserDetails {
		UserDetails {
			id: self.user.clone(),
			username: self.profile.display_name.clone(),
			avatar_url: self.profile.avatar_url.clone(),
		}
	}
}

/// Run the handshake for one connection. On rejection the terminal status has already been sent.
pub async fn admit(ctx: &Context, conn: ConnId, session_token: Option<&str>, out: &Outbound) -> Result<Admission, GateError> {
	match authorize(ctx, conn, session_token).await {
		Ok((user, profile)) => Ok(enter(ctx, conn, user, profile, out).await),
		Err(e) => {
			metrics::counter!("chatproxy_gate_rejections_total", "reason" => e.reason()).increment(1);
			info!(%conn, error = %e, "connection rejected");
			send(out, ServerEvent::ConnectionStatus(e.connection_status())).await;
			Err(e)
		}
	}
}

async fn authorize(ctx: &Context, conn: ConnId, session_token: Option<&str>) -> Result<(UserId, Profile), GateError> {
	let Some(token) = session_token else {
		return Err(GateError::NoSession);
	};

	let session = match ctx.sessions.session(token).await {
		Ok(session) => session,
		Err(e) => {
			warn!(%conn, error = %e, "session lookup failed");
			None
		}
	};
	let Some(user) = session.and_then(|s| s.user_id) else {
		return Err(GateError::NoSession);
	};

	match ctx.authorizer.authorization(&user).await {
		Ok(Authorization::FoundAndAuthorized) => {}
		Ok(Authorization::NotFound) => return Err(GateError::NoUser),
		Ok(Authorization::FoundAndBlocked) => return Err(GateError::NotAllowed),
		Err(e) => return Err(GateError::Upstream(format!("authorization lookup: {e}"))),
	}

	let profile = ctx
		.profiles
		.profile(&user)
		.await
		.map_err(|e| GateError::Upstream(format!("profile lookup: {e}")))?;

	let cfg = ctx.status.config();
	let login = ctx
		.status
		.login_if_offline(cfg.login_timeout)
		.await
		.map_err(|e| GateError::Upstream(format!("log on: {e}")))?;
	let join = ctx
		.status
		.join_chat(cfg.join_timeout)
		.await
		.map_err(|e| GateError::Upstream(format!("join chat: {e}")))?;
	debug!(%conn, user = %user, %login, %join, "proxy ready for connection");

	Ok((user, profile))
}

async fn enter(ctx: &Context, conn: ConnId, user: UserId, profile: Profile, out: &Outbound) -> Admission {
	ctx.hub.admit(conn, out.clone());
	let joined = ctx.presence.join(&user, conn, &profile.display_name, &profile.avatar_url);

	let admission = Admission {
		user,
		profile,
		is_new_identity: joined.is_new_identity,
	};
	let details = admission.details();

	let first = ctx.status.status();
	send(out, ServerEvent::ProxyStatusChange {
		old_status: None,
		new_status: first,
	})
	.await;
	send(out, ServerEvent::ConnectionStatus(ConnectionStatus::UserCanChat)).await;
	send(out, ServerEvent::AllChatMembers(ctx.status.chat_members())).await;
	send(out, ServerEvent::AllWebsiteUsers(ctx.presence.snapshot())).await;
	send(out, ServerEvent::ProxyStatusChange {
		old_status: Some(first),
		new_status: ctx.status.status(),
	})
	.await;
	send(out, ServerEvent::LoggedInUser(details.clone())).await;

	metrics::counter!("chatproxy_connections_total", "result" => "admitted").increment(1);
	info!(
		%conn,
		user = %admission.user,
		new_identity = joined.is_new_identity,
		connections = joined.connections,
		"connection admitted"
	);

	if joined.is_new_identity {
		ctx.hub.broadcast_except(conn, ServerEvent::UserJoinedFromWebsite(details.clone()));
		ctx.hub.emit_to(conn, ServerEvent::LoggedInUser(details));

		if let Err(e) = ctx
			.status
			.send_joined_notice(&admission.user, &admission.profile.display_name)
			.await
		{
			warn!(%conn, error = %e, "failed to send joined notice to room");
		}
	}

	admission
}

/// Departure of an admitted connection.
pub async fn depart(ctx: &Context, conn: ConnId, user: &UserId) {
	ctx.hub.remove(conn);

	let Some(username) = ctx.presence.leave(user, conn) else {
		debug!(%conn, %user, "connection closed; identity still present");
		return;
	};

	info!(%conn, %user, "identity left website");
	ctx.hub.broadcast(ServerEvent::UserLeftWebsite {
		id: user.clone(),
		username: username.clone(),
	});

	if let Err(e) = ctx.status.send_left_notice(user, &username).await {
		warn!(%conn, error = %e, "failed to send left notice to room");
	}

	if ctx.presence.is_empty() {
		info!("no web users remain; leaving room");
		ctx.status.leave_chat().await;
	}
}

async fn send(out: &Outbound, event: ServerEvent) {
	if out.send(HubItem::Event(event)).await.is_err() {
		debug!("connection outbound closed during handshake");
	}
}
