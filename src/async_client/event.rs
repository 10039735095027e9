//! The session's observer-facing events, delivered over a broadcast channel
//! obtained from [`Client::events`](super::Client::events). Every subscriber
//! sees every event; a slow subscriber drops the oldest unread ones rather
//! than holding the session back.

use crate::packets::{ConnAck, Disconnect};
use crate::Packet;
use tokio::sync::broadcast;

/// How many events a lagging subscriber may fall behind before older ones
/// are dropped in favor of newer ones.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A single lifecycle or wire-level occurrence, broadcast to every
/// [`Events`] subscriber.
#[derive(Clone, Debug)]
pub enum Event {
	/// CONNACK received and accepted.
	Connect(ConnAck),
	/// A new connection attempt is starting after a prior one ended.
	Reconnect,
	/// The transport dropped; the session is no longer connected.
	Offline,
	/// The connection closed, whether cleanly or not.
	Close,
	/// A DISCONNECT packet was received from the broker (v5 only).
	Disconnect(Disconnect),
	/// `end` completed; the session task is exiting.
	End,
	/// An error the session couldn't route to a more specific caller.
	Error(String),
	/// A packet was written to the transport.
	PacketSend(Packet),
	/// A packet was read from the transport.
	PacketReceive(Packet),
	/// The outgoing store has no entries left in flight.
	OutgoingEmpty,
}

pub(crate) type EventTx = broadcast::Sender<Event>;

/// A subscription to a session's [`Event`] stream.
#[derive(Debug)]
pub struct Events(broadcast::Receiver<Event>);

impl Events {
	pub(crate) fn new(rx: broadcast::Receiver<Event>) -> Self {
		Self(rx)
	}

	/// Receives the next event, transparently skipping over any that were
	/// dropped because this subscriber fell behind.
	pub async fn recv(&mut self) -> Option<Event> {
		loop {
			match self.0.recv().await {
				Ok(event) => return Some(event),
				Err(broadcast::error::RecvError::Lagged(_)) => continue,
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	}
}

pub(crate) fn emit(tx: &EventTx, event: Event) {
	let _ = tx.send(event);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn recv_returns_events_in_order() {
		let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		let mut events = Events::new(rx);
		emit(&tx, Event::Reconnect);
		emit(&tx, Event::Offline);
		assert!(matches!(events.recv().await, Some(Event::Reconnect)));
		assert!(matches!(events.recv().await, Some(Event::Offline)));
	}

	#[tokio::test]
	async fn recv_skips_lagged_gap_instead_of_stalling() {
		let (tx, rx) = broadcast::channel(2);
		let mut events = Events::new(rx);
		for _ in 0..5 {
			emit(&tx, Event::Offline);
		}
		// The receiver lagged behind the 2-entry channel; `recv` should
		// still make progress rather than returning `None`.
		assert!(events.recv().await.is_some());
	}

	#[tokio::test]
	async fn recv_returns_none_once_every_sender_is_gone() {
		let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		let mut events = Events::new(rx);
		drop(tx);
		assert!(events.recv().await.is_none());
	}
}
