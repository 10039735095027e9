use crate::{store::Store, PacketId, PacketIdProvider};

/// Drains a store's outgoing (or incoming) entries for retransmission after
/// a reconnect, in put-order.
///
/// Runs once per successful CONNACK, before the session accepts new
/// user-initiated publish/subscribe/unsubscribe calls (the store-processing
/// interlock in [`super::State`] is what actually blocks those
/// calls; this type only concerns itself with walking the store).
pub struct ReplayEngine;

impl ReplayEngine {
	/// Returns every entry in `store`, registering each id with `packet_ids`
	/// so a concurrently-allocated new publish can't collide with one
	/// being replayed. An id that's already registered (e.g. the offline
	/// queue already claimed it while it was drained ahead of replay) is
	/// skipped rather than resent, matching the "don't duplicate" rule for
	/// ids already seen during this store-processing cycle.
	///
	/// The stream is restarted if replay reaches the end and the store has
	/// grown since the snapshot was taken. The only backend shipped here
	/// (`MemoryStore`) never mutates concurrently with a replay (the session
	/// task is single-threaded), so in practice this loop runs once, but
	/// the restart path keeps the type correct for a `Store` whose `put`
	/// can race a `create_stream` consumer.
	pub fn drain(store: &dyn Store, packet_ids: &mut PacketIdProvider) -> Vec<(PacketId, crate::packets::Packet)> {
		let mut out = Vec::new();
		let mut seen_count;
		loop {
			seen_count = out.len();
			let mut stream = store.create_stream();
			for _ in 0..out.len() {
				stream.next();
			}
			while let Some((id, packet)) = stream.next() {
				if packet_ids.register(id) {
					out.push((id, packet));
				} else {
					tracing::debug!(%id, "skipping replay of id already registered this cycle");
				}
			}
			if out.len() == seen_count {
				break;
			}
		}
		out
	}
}
