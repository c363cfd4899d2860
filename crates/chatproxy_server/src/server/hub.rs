#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chatproxy_domain::ConnId;
use chatproxy_protocol::ServerEvent;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Fan-out of server events to every admitted browser connection.
#[derive(Debug, Clone)]
pub struct ConnectionHub {
	inner: Arc<Mutex<Inner>>,
	cfg: HubConfig,
}

/// Configuration for `ConnectionHub`.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Maximum number of queued items per connection.
	pub connection_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			connection_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// Items delivered on a connection's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum HubItem {
	Event(ServerEvent),

	/// The connection fell behind and this many items were dropped.
	Lagged {
		dropped: u64,
	},
}

pub type Outbound = mpsc::Sender<HubItem>;

impl ConnectionHub {
	pub fn new(cfg: HubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Outbound queue for a connection that has not been admitted yet.
	pub fn outbound_channel(&self) -> (Outbound, mpsc::Receiver<HubItem>) {
		mpsc::channel(self.cfg.connection_queue_capacity)
	}

	pub fn admit(&self, conn: ConnId, tx: Outbound) {
		let mut inner = self.inner.lock();
		prune_closed(&mut inner);
		inner.connections.insert(conn, Subscriber { tx, pending_lag: 0 });

		if self.cfg.debug_logs {
			debug!(%conn, admitted = inner.connections.len(), "hub: admitted");
		}
	}

	pub fn remove(&self, conn: ConnId) -> bool {
		self.inner.lock().connections.remove(&conn).is_some()
	}

	pub fn admitted_count(&self) -> usize {
		let inner = self.inner.lock();
		inner.connections.values().filter(|s| !s.tx.is_closed()).count()
	}

	/// Deliver to one admitted connection.
	pub fn emit_to(&self, conn: ConnId, event: ServerEvent) {
		let mut inner = self.inner.lock();
		if let Some(sub) = inner.connections.get_mut(&conn) {
			deliver(sub, &HubItem::Event(event));
		}
	}

	pub fn broadcast(&self, event: ServerEvent) {
		self.publish(None, event);
	}

	pub fn broadcast_except(&self, skip: ConnId, event: ServerEvent) {
		self.publish(Some(skip), event);
	}

	fn publish(&self, skip: Option<ConnId>, event: ServerEvent) {
		let mut inner = self.inner.lock();
		prune_closed(&mut inner);

		let name = event.name();
		let item = HubItem::Event(event);
		let mut dropped_total: u64 = 0;

		for (conn, sub) in inner.connections.iter_mut() {
			if Some(*conn) == skip {
				continue;
			}
			if !deliver(sub, &item) {
				dropped_total += 1;
			}
		}

		prune_closed(&mut inner);

		if self.cfg.debug_logs && dropped_total > 0 {
			debug!(
				event = name,
				dropped = dropped_total,
				"hub: dropped due to full connection queues"
			);
		}
	}
}

#[derive(Debug, Default)]
struct Inner {
	connections: BTreeMap<ConnId, Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
	tx: Outbound,

	/// Items dropped since the last lag marker went through.
	pending_lag: u64,
}

/// Try to enqueue `item`. Returns false when the queue was full.
fn deliver(sub: &mut Subscriber, item: &HubItem) -> bool {
	match sub.tx.try_send(item.clone()) {
		Ok(()) => {
			if sub.pending_lag > 0 && sub.tx.try_send(HubItem::Lagged { dropped: sub.pending_lag }).is_ok() {
				sub.pending_lag = 0;
			}
			true
		}
		Err(mpsc::error::TrySendError::Full(_)) => {
			sub.pending_lag = sub.pending_lag.saturating_add(1);
			false
		}
		Err(mpsc::error::TrySendError::Closed(_)) => true,
	}
}

fn prune_closed(inner: &mut Inner) {
	inner.connections.retain(|_, sub| !sub.tx.is_closed());
}
