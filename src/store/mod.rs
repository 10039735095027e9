//! The persistent outgoing/incoming message store and its restartable
//! replay stream.
//!
//! The store trait is synchronous: the one backend this crate ships
//! (`MemoryStore`) never blocks, and keeping the trait free of `async fn`
//! avoids pulling in an async-trait shim the rest of the stack doesn't use.
//! A backend that needs real blocking I/O can perform it from inside the
//! session task via `tokio::task::spawn_blocking` at the call site.

mod memory;

pub use memory::MemoryStore;

use crate::{packets::Packet, PacketId};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("no entry for packet id {0}")]
	NotFound(PacketId),
	#[error(transparent)]
	Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// A durable `messageId -> packet` mapping for QoS ≥ 1 packets awaiting
/// acknowledgement, on either the outgoing or incoming side of a session.
pub trait Store: fmt::Debug + Send {
	/// Overwrites any prior entry for the packet's id.
	fn put(&mut self, id: PacketId, packet: Packet) -> Result<(), StoreError>;

	fn get(&self, id: PacketId) -> Result<Option<Packet>, StoreError>;

	fn del(&mut self, id: PacketId) -> Result<(), StoreError>;

	/// Opens a [`RestartableStream`] over the store's current contents, in
	/// put-order.
	fn create_stream(&self) -> Box<dyn RestartableStream + '_>;

	fn close(&mut self) -> Result<(), StoreError>;
}

/// An iterator-like abstraction over a store's contents that can be
/// destroyed and reopened mid-replay, matching the restartable-sequence
/// requirement in the replay algorithm: if new packets are stored while a
/// replay is in progress, the engine restarts the stream to pick them up
/// rather than missing them.
pub trait RestartableStream {
	/// Returns the next packet in put-order, or `None` once exhausted.
	fn next(&mut self) -> Option<(PacketId, Packet)>;

	/// Restarts iteration from the beginning of the store's current
	/// contents.
	fn restart(&mut self);

	/// Ends iteration early; no further calls to `next` are required.
	fn destroy(&mut self) {}
}
