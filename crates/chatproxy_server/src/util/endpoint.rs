#![forbid(unsafe_code)]

use url::Url;

pub const DEFAULT_BIND: &str = "ws://127.0.0.1:8080";

/// Parsed `ws://host:port` listen endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsEndpoint {
	pub host: String,
	pub port: u16,
}

impl WsEndpoint {
	/// `host:port`, IPv6 hosts stay bracketed. Accepted by `TcpListener::bind`.
	pub fn hostport(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	pub fn parse(s: &str) -> Result<Self, String> {
		let s = s.trim();
		if s.is_empty() {
			return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
		}

		let url = Url::parse(s).map_err(|e| format!("invalid endpoint {s}: {e}"))?;
		if url.scheme() != "ws" {
			return Err(format!("invalid endpoint scheme (expected ws://host:port): {s}"));
		}
		if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
			return Err(format!("invalid endpoint (expected ws://host:port without path/query/fragment): {s}"));
		}

		let host = url
			.host_str()
			.filter(|h| !h.is_empty())
			.ok_or_else(|| format!("invalid endpoint host (expected ws://host:port): {s}"))?;
		let port = url
			.port_or_known_default()
			.filter(|p| *p != 0)
			.ok_or_else(|| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

		Ok(Self {
			host: host.to_string(),
			port,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_default_bind() {
		let e = WsEndpoint::parse(DEFAULT_BIND).unwrap();
		assert_eq!(e.host, "127.0.0.1");
		assert_eq!(e.port, 8080);
		assert_eq!(e.hostport(), "127.0.0.1:8080");
	}

	#[test]
	fn parses_hostname_and_ipv6() {
		let e = WsEndpoint::parse("ws://chat.example.com:9000").unwrap();
		assert_eq!(e.hostport(), "chat.example.com:9000");

		let e6 = WsEndpoint::parse("ws://[::1]:9000").unwrap();
		assert_eq!(e6.hostport(), "[::1]:9000");
	}

	#[test]
	fn missing_port_uses_scheme_default() {
		assert_eq!(WsEndpoint::parse("ws://localhost").unwrap().port, 80);
	}

	#[test]
	fn rejects_other_schemes_and_paths() {
		assert!(WsEndpoint::parse("").is_err());
		assert!(WsEndpoint::parse("http://127.0.0.1:8080").is_err());
		assert!(WsEndpoint::parse("ws://127.0.0.1:8080/chat").is_err());
		assert!(WsEndpoint::parse("ws://127.0.0.1:8080?x=y").is_err());
	}
}
