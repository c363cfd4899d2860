#![forbid(unsafe_code)]

use std::net::SocketAddr;

use bytes::Bytes;
use chatproxy_domain::ProxyStatus;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::context::Context;

/// Health and readiness view of the bridge. Ready once the proxy is logged on.
#[derive(Clone)]
pub struct HealthState {
	ctx: Context,
}

impl HealthState {
	pub fn new(ctx: Context) -> Self {
		Self { ctx }
	}

	pub fn is_ready(&self) -> bool {
		self.ctx.status.status() != ProxyStatus::Offline
	}

	pub fn status_json(&self) -> serde_json::Value {
		let status = self.ctx.status.status();
		serde_json::json!({
			"proxyStatus": status.code(),
			"proxyStatusName": status.as_str(),
			"muted": self.ctx.status.is_muted(),
			"roomMembers": self.ctx.status.chat_members().len(),
			"websiteUsers": self.ctx.presence.len(),
			"admittedConnections": self.ctx.hub.admitted_count(),
		})
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(reply(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()));
	}

	Ok(route(req.uri().path(), &state))
}

fn route(path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	match path {
		"/healthz" => reply(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" => {
			if state.is_ready() {
				reply(StatusCode::OK, Bytes::from_static(b"ready"))
			} else {
				reply(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready"))
			}
		}
		"/status" => {
			let mut resp = reply(StatusCode::OK, Bytes::from(state.status_json().to_string()));
			resp.headers_mut()
				.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
			resp
		}
		_ => reply(StatusCode::NOT_FOUND, Bytes::new()),
	}
}

fn reply(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp
}
