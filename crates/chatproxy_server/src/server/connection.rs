#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use chatproxy_domain::ConnId;
use chatproxy_platform::token_from_cookie_header;
use chatproxy_protocol::{ClientEvent, DEFAULT_MAX_FRAME_SIZE, decode_frame, encode_frame};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::context::Context;
use crate::server::gate;
use crate::server::hub::HubItem;
use crate::server::relay::relay_outbound;

pub const DEFAULT_SESSION_COOKIE: &str = "chatproxy_session";

/// Per-connection transport settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Cookie carrying the session token.
	pub session_cookie: String,

	/// Largest accepted or emitted JSON text frame.
	pub max_frame_bytes: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

/// Accept WebSocket connections until `shutdown` fires.
pub async fn serve(
	listener: TcpListener,
	ctx: Context,
	settings: ConnectionSettings,
	shutdown: CancellationToken,
) -> anyhow::Result<()> {
	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = tokio::select! {
			_ = shutdown.cancelled() => {
				info!("websocket listener shutting down");
				break;
			}
			accepted = listener.accept() => accepted.context("accept tcp connection")?,
		};

		let conn = ConnId(next_conn_id);
		next_conn_id += 1;
		metrics::counter!("chatproxy_connections_total", "result" => "accepted").increment(1);

		let ctx = ctx.clone();
		let settings = settings.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_connection(conn, remote, stream, ctx, settings).await {
				warn!(%conn, error = %e, "connection handler exited with error");
			}
		});
	}

	Ok(())
}

pub async fn handle_connection(
	conn: ConnId,
	remote: SocketAddr,
	stream: TcpStream,
	ctx: Context,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	let cookie_header: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
	let captured = Arc::clone(&cookie_header);

	let ws = tokio_tungstenite::accept_hdr_async(
		stream,
		move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
			if let Some(value) = req.headers().get("cookie").and_then(|v| v.to_str().ok()) {
				*captured.lock() = Some(value.to_string());
			}
			Ok(response)
		},
	)
	.await
	.context("websocket handshake")?;

	info!(%conn, %remote, "accepted websocket connection");

	let token = cookie_header
		.lock()
		.take()
		.and_then(|header| token_from_cookie_header(&header, &settings.session_cookie));

	let (mut sink, mut source) = ws.split();
	let (out_tx, mut out_rx) = ctx.hub.outbound_channel();

	let max_frame_bytes = settings.max_frame_bytes;
	let writer = tokio::spawn(async move {
		while let Some(item) = out_rx.recv().await {
			let ev = match item {
				HubItem::Event(ev) => ev,
				HubItem::Lagged { dropped } => {
					warn!(%conn, dropped, "connection lagging; events dropped");
					continue;
				}
			};

			let frame = match encode_frame(&ev, max_frame_bytes) {
				Ok(frame) => frame,
				Err(e) => {
					warn!(%conn, event = ev.name(), error = %e, "failed to encode event");
					continue;
				}
			};

			if let Err(e) = sink.send(Message::text(frame)).await {
				debug!(%conn, error = %e, "websocket write failed");
				break;
			}
		}
		let _ = sink.close().await;
	});

	let admission = match gate::admit(&ctx, conn, token.as_deref(), &out_tx).await {
		Ok(admission) => admission,
		Err(_) => {
			drop(out_tx);
			let _ = writer.await;
			return Ok(());
		}
	};

	while let Some(msg) = source.next().await {
		let msg = match msg {
			Ok(msg) => msg,
			Err(e) => {
				debug!(%conn, error = %e, "websocket read failed");
				break;
			}
		};

		match msg {
			Message::Text(text) => match decode_frame::<ClientEvent>(text.as_str(), max_frame_bytes) {
				Ok(ClientEvent::SendMessageToChat(line)) => {
					let outcome = relay_outbound(&ctx, &admission.user, &line, conn).await;
					debug!(%conn, ?outcome, "web line handled");
				}
				Err(e) => debug!(%conn, error = %e, "ignoring malformed client frame"),
			},
			Message::Close(_) => break,
			_ => {}
		}
	}

	gate::depart(&ctx, conn, &admission.user).await;
	drop(out_tx);
	let _ = writer.await;

	info!(%conn, "websocket connection closed");
	Ok(())
}
