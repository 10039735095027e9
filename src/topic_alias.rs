//! v5 topic-alias registries: bidirectional topic/alias maps used to
//! compress repeated topic strings onto the wire.
//!
//! `TopicAliasSend` tracks the aliases this client has handed the broker for
//! outbound PUBLISHes and evicts the least-recently-used slot when a new
//! topic needs one and the table is full. `TopicAliasRecv` tracks aliases
//! the broker has assigned for inbound PUBLISHes; it has no eviction policy
//! of its own since the broker dictates the assignment.

use std::collections::HashMap;

/// Outbound (client→broker) topic alias table, bounded by the value the
/// broker advertised in its CONNACK `topicAliasMaximum` property.
#[derive(Debug)]
pub struct TopicAliasSend {
	max: u16,
	topic_to_alias: HashMap<String, u16>,
	alias_to_topic: HashMap<u16, String>,
	/// Most-recently-used aliases at the back.
	lru: Vec<u16>,
}

impl TopicAliasSend {
	/// Returns `None` if `max == 0`: the broker advertised no topic alias
	/// support, so this registry should not be instantiated at all.
	pub fn new(max: u16) -> Option<Self> {
		if max == 0 {
			return None;
		}
		Some(Self {
			max,
			topic_to_alias: HashMap::new(),
			alias_to_topic: HashMap::new(),
			lru: Vec::new(),
		})
	}

	pub fn max(&self) -> u16 {
		self.max
	}

	/// Registers `topic` under `alias`, updating LRU order. Fails if `alias`
	/// is out of the `[1..max]` range.
	pub fn put(&mut self, topic: &str, alias: u16) -> bool {
		if alias == 0 || alias > self.max {
			return false;
		}
		if let Some(old_alias) = self.topic_to_alias.get(topic).copied() {
			self.alias_to_topic.remove(&old_alias);
			self.lru.retain(|&a| a != old_alias);
		}
		if let Some(old_topic) = self.alias_to_topic.insert(alias, topic.to_owned()) {
			self.topic_to_alias.remove(&old_topic);
		}
		self.topic_to_alias.insert(topic.to_owned(), alias);
		self.lru.retain(|&a| a != alias);
		self.lru.push(alias);
		true
	}

	pub fn get_alias_by_topic(&self, topic: &str) -> Option<u16> {
		self.topic_to_alias.get(topic).copied()
	}

	pub fn get_topic_by_alias(&self, alias: u16) -> Option<&str> {
		self.alias_to_topic.get(&alias).map(String::as_str)
	}

	/// Returns the least-recently-used alias: the next slot to hand out when
	/// all `max` slots are already assigned, or the next unused slot if any
	/// remain.
	pub fn get_lru_alias(&self) -> u16 {
		if (self.alias_to_topic.len() as u16) < self.max {
			(1..=self.max)
				.find(|alias| !self.alias_to_topic.contains_key(alias))
				.expect("fewer than max aliases assigned implies a free one exists")
		} else {
			*self.lru.first().expect("max > 0 implies lru is non-empty once full")
		}
	}
}

/// Inbound (broker→client) topic alias table. Cleared on every disconnect,
/// since the broker does not guarantee alias assignments survive a session
/// resumption the way the outgoing store does.
#[derive(Debug, Default)]
pub struct TopicAliasRecv {
	max: u16,
	alias_to_topic: HashMap<u16, String>,
}

impl TopicAliasRecv {
	pub fn new(max: u16) -> Self {
		Self {
			max,
			alias_to_topic: HashMap::new(),
		}
	}

	pub fn max(&self) -> u16 {
		self.max
	}

	/// Registers `topic` under `alias`. Fails if `alias` is out of
	/// `[1..max]`.
	pub fn put(&mut self, topic: &str, alias: u16) -> bool {
		if alias == 0 || alias > self.max {
			return false;
		}
		self.alias_to_topic.insert(alias, topic.to_owned());
		true
	}

	pub fn get(&self, alias: u16) -> Option<&str> {
		self.alias_to_topic.get(&alias).map(String::as_str)
	}

	pub fn clear(&mut self) {
		self.alias_to_topic.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::{TopicAliasRecv, TopicAliasSend};

	#[test]
	fn zero_max_disables_send_registry() {
		assert!(TopicAliasSend::new(0).is_none());
	}

	#[test]
	fn assigns_free_slots_before_evicting() {
		let mut send = TopicAliasSend::new(2).unwrap();
		assert_eq!(send.get_lru_alias(), 1);
		send.put("a", 1);
		assert_eq!(send.get_lru_alias(), 2);
		send.put("b", 2);
		// both slots full; least-recently-used is "a"'s alias (1).
		assert_eq!(send.get_lru_alias(), 1);
	}

	#[test]
	fn put_updates_lru_order() {
		let mut send = TopicAliasSend::new(2).unwrap();
		send.put("a", 1);
		send.put("b", 2);
		// touch "a" again; "b" becomes least-recently-used.
		send.put("a", 1);
		assert_eq!(send.get_lru_alias(), 2);
	}

	#[test]
	fn rejects_out_of_range_alias() {
		let mut send = TopicAliasSend::new(2).unwrap();
		assert!(!send.put("a", 3));
		let mut recv = TopicAliasRecv::new(2);
		assert!(!recv.put("a", 0));
		assert!(!recv.put("a", 3));
	}

	#[test]
	fn recv_roundtrip() {
		let mut recv = TopicAliasRecv::new(4);
		assert!(recv.put("sensors/t1", 1));
		assert_eq!(recv.get(1), Some("sensors/t1"));
		recv.clear();
		assert_eq!(recv.get(1), None);
	}
}
