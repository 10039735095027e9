use super::{RestartableStream, Store, StoreError};
use crate::{packets::Packet, PacketId};
use std::collections::BTreeMap;

/// A `Store` backed by an in-process ordered map. Not durable across
/// process restarts; the reference implementation for tests, examples, and
/// sessions that don't need reconnect durability to survive a crash.
#[derive(Debug, Default)]
pub struct MemoryStore {
	/// Keyed by insertion sequence, so `create_stream` yields put-order even
	/// after intervening deletes, not numeric packet-id order.
	entries: BTreeMap<u64, (PacketId, Packet)>,
	next_sequence: u64,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

impl Store for MemoryStore {
	fn put(&mut self, id: PacketId, packet: Packet) -> Result<(), StoreError> {
		if let Some(existing_sequence) = self
			.entries
			.iter()
			.find(|(_, (entry_id, _))| *entry_id == id)
			.map(|(sequence, _)| *sequence)
		{
			self.entries.remove(&existing_sequence);
		}
		let sequence = self.next_sequence;
		self.next_sequence += 1;
		self.entries.insert(sequence, (id, packet));
		Ok(())
	}

	fn get(&self, id: PacketId) -> Result<Option<Packet>, StoreError> {
		Ok(self
			.entries
			.values()
			.find(|(entry_id, _)| *entry_id == id)
			.map(|(_, packet)| packet.clone()))
	}

	fn del(&mut self, id: PacketId) -> Result<(), StoreError> {
		self.entries.retain(|_, (entry_id, _)| *entry_id != id);
		Ok(())
	}

	fn create_stream(&self) -> Box<dyn RestartableStream + '_> {
		Box::new(MemoryStream {
			store: self,
			position: 0,
		})
	}

	fn close(&mut self) -> Result<(), StoreError> {
		Ok(())
	}
}

struct MemoryStream<'s> {
	store: &'s MemoryStore,
	position: usize,
}

impl RestartableStream for MemoryStream<'_> {
	fn next(&mut self) -> Option<(PacketId, Packet)> {
		let entry = self.store.entries.values().nth(self.position)?;
		self.position += 1;
		Some(entry.clone())
	}

	fn restart(&mut self) {
		self.position = 0;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::packets::{Packet, PubAck};
	use std::num::NonZeroU16;

	fn id(n: u16) -> PacketId {
		NonZeroU16::new(n).unwrap()
	}

	fn ack(n: u16) -> Packet {
		PubAck::new(id(n)).into()
	}

	#[test]
	fn put_then_get_roundtrips() {
		let mut store = MemoryStore::new();
		store.put(id(1), ack(1)).unwrap();
		let retrieved = store.get(id(1)).unwrap().unwrap();
		assert_eq!(retrieved.packet_type(), crate::packets::PacketType::PubAck);
	}

	#[test]
	fn put_overwrites_existing_entry_for_id() {
		let mut store = MemoryStore::new();
		store.put(id(1), ack(1)).unwrap();
		store.put(id(1), ack(1)).unwrap();
		assert_eq!(store.entries.len(), 1);
	}

	#[test]
	fn del_removes_entry() {
		let mut store = MemoryStore::new();
		store.put(id(1), ack(1)).unwrap();
		store.del(id(1)).unwrap();
		assert!(store.get(id(1)).unwrap().is_none());
	}

	#[test]
	fn stream_yields_put_order_and_restarts() {
		let mut store = MemoryStore::new();
		store.put(id(1), ack(1)).unwrap();
		store.put(id(2), ack(2)).unwrap();

		let mut stream = store.create_stream();
		let (first, _) = stream.next().unwrap();
		assert_eq!(first, id(1));
		let (second, _) = stream.next().unwrap();
		assert_eq!(second, id(2));
		assert!(stream.next().is_none());

		stream.restart();
		let (first_again, _) = stream.next().unwrap();
		assert_eq!(first_again, id(1));
	}

	#[test]
	fn stream_reflects_new_entries_after_restart() {
		let mut store = MemoryStore::new();
		store.put(id(1), ack(1)).unwrap();

		let mut stream = store.create_stream();
		stream.next().unwrap();
		assert!(stream.next().is_none());
		drop(stream);

		store.put(id(2), ack(2)).unwrap();
		let mut stream = store.create_stream();
		stream.next().unwrap();
		let (second, _) = stream.next().unwrap();
		assert_eq!(second, id(2));
	}
}
