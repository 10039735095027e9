use super::{PublishTx, StateError};
use crate::{
	async_client::command::PublishCommand,
	async_client::hooks::{is_acceptable_ack_reason_code, AckPolicy},
	error::SessionError,
	packets::{Packet, PacketType, PubAck, PubComp, PubRec, PubRel, Publish, ReasonCode},
	store::Store,
	topic_alias::TopicAliasSend,
	PacketId, PacketIdProvider, QoS,
};
use std::{
	collections::{HashMap, HashSet},
	time::Duration,
};
use tokio::sync::mpsc::error::SendTimeoutError;

/// QoS 1/2 receive-side bookkeeping: which ids are mid-handshake, and which
/// acks arrived out of the order the happy path expects (PUBCOMP generated
/// by a user `MessageGuard` drop before the matching PUBREL has arrived, or
/// vice versa).
#[derive(Debug, Default)]
pub struct IncomingPublishManager {
	awaiting_pubrel: HashSet<PacketId>,
	queued_pubrel: HashSet<PacketId>,
	queued_pubcomp: HashSet<PacketId>,
}

/// QoS 1/2 send-side bookkeeping: which ids are awaiting which ack.
#[derive(Debug, Default)]
pub struct OutgoingPublishManager {
	awaiting_puback: HashMap<PacketId, super::ResponseTx<Result<(), SessionError>>>,
	awaiting_pubrec: HashMap<PacketId, super::ResponseTx<Result<(), SessionError>>>,
	awaiting_pubcomp: HashMap<PacketId, super::ResponseTx<Result<(), SessionError>>>,
}

impl IncomingPublishManager {
	/// The local `MessageGuard` for a QoS 2 delivery has been dropped/
	/// completed; the matching PUBREL may or may not have arrived yet.
	pub fn handle_pubcomp_command(&mut self, id: PacketId) -> Option<Packet> {
		if self.queued_pubrel.remove(&id) {
			Some(PubComp::new(id).into())
		} else {
			tracing::debug!(%id, "queueing PubComp to await incoming PubRel");
			self.queued_pubcomp.insert(id);
			None
		}
	}

	/// Delivers an inbound PUBLISH to the matching local subscription
	/// channel (if any) and returns the ack packet, if one is due.
	///
	/// QoS 1/2 publishes first consult `ack_policy` (v5 `customHandleAcks`)
	/// for the reason code to ack with; a code outside the broker-acceptable
	/// set fails the delivery rather than being sent, and a non-success code
	/// skips local delivery entirely, acking the rejection straight back.
	///
	/// QoS 2 publishes accepted for delivery are additionally persisted to
	/// the incoming store: a QoS 2 id in flight lives there until its
	/// PUBREL/PUBCOMP handshake completes, deleted once that handshake
	/// resolves in [`handle_pubrel`].
	pub async fn handle_publish(
		&mut self,
		find_channel: impl FnOnce(&str) -> Option<PublishTx>,
		store: &mut dyn Store,
		ack_policy: &AckPolicy,
		publish: Publish,
	) -> Result<Option<Packet>, StateError> {
		let Some(channel) = find_channel(publish.topic()) else {
			tracing::debug!(topic = publish.topic(), "no local subscriber for inbound publish");
			return Ok(None);
		};

		let qos = publish.qos();

		if qos == QoS::AtMostOnce {
			let _ = channel.send_timeout(publish, Duration::from_millis(250)).await;
			return Ok(None);
		}

		let id = publish.id().expect("QoS 1/2 publishes always carry a packet id");
		let reason_code = ack_policy(publish.topic(), publish.payload(), qos);
		if !is_acceptable_ack_reason_code(reason_code) {
			return Err(StateError::InvalidAckReasonCode(reason_code));
		}

		if reason_code != ReasonCode::SUCCESS.0 {
			tracing::debug!(%id, reason_code, "ack policy rejected inbound publish");
			let packet = match qos {
				QoS::AtLeastOnce => {
					let mut ack = PubAck::new(id);
					ack.reason_code = ReasonCode(reason_code);
					ack.into()
				}
				QoS::ExactlyOnce => {
					let mut ack = PubRec::new(id);
					ack.reason_code = ReasonCode(reason_code);
					ack.into()
				}
				QoS::AtMostOnce => unreachable!("handled above"),
			};
			return Ok(Some(packet));
		}

		if qos == QoS::ExactlyOnce {
			if let Err(error) = store.put(id, publish.clone().into()) {
				tracing::warn!(%id, %error, "failed to persist inbound QoS 2 publish");
			}
			self.awaiting_pubrel.insert(id);
		}

		match channel.send_timeout(publish, Duration::from_millis(250)).await {
			Err(SendTimeoutError::Closed(publish)) => {
				tracing::warn!(?publish, "local subscriber channel closed mid-delivery");
				Ok(None)
			}
			Err(SendTimeoutError::Timeout(publish)) => Err(StateError::DeliveryFailure(Box::new(publish))),
			Ok(()) => Ok(Some(match qos {
				QoS::AtLeastOnce => PubAck::new(id).into(),
				QoS::ExactlyOnce => PubRec::new(id).into(),
				QoS::AtMostOnce => unreachable!("handled above"),
			})),
		}
	}

	pub fn handle_pubrel(&mut self, pubrel: PubRel, store: &mut dyn Store) -> Result<Option<Packet>, StateError> {
		if !self.awaiting_pubrel.remove(&pubrel.id) {
			// The broker may be redelivering a PUBREL after we've already
			// completed the handshake; respond as if nothing was amiss.
			return Ok(Some(PubComp::new(pubrel.id).into()));
		}

		let _ = store.del(pubrel.id);

		if self.queued_pubcomp.remove(&pubrel.id) {
			Ok(Some(PubComp::new(pubrel.id).into()))
		} else {
			self.queued_pubrel.insert(pubrel.id);
			Ok(None)
		}
	}
}

impl OutgoingPublishManager {
	/// Builds and accounts for a new user-initiated publish. QoS 0 resolves
	/// its callback immediately. QoS 1/2 allocate a packet id, optionally
	/// apply a v5 topic alias, persist the full-topic clone into the
	/// outgoing store, then register the caller's response channel to
	/// resolve when the ack arrives.
	///
	/// Returns the command back to the caller (unmodified) if a packet id
	/// could not be allocated, so it can be deferred behind the
	/// store-processing queue. A store failure or a caller-supplied topic
	/// alias that the registry rejects is terminal and reported to the
	/// caller's response channel directly (`Ok(None)`), rather than being
	/// retried.
	pub fn submit(
		&mut self,
		command: PublishCommand,
		packet_ids: &mut PacketIdProvider,
		store: &mut dyn Store,
		topic_alias: &mut Option<TopicAliasSend>,
		auto_assign_topic_alias: bool,
		auto_use_topic_alias: bool,
	) -> Result<Option<Packet>, PublishCommand> {
		let PublishCommand {
			topic,
			payload,
			qos,
			retain,
			properties,
			response_tx,
		} = command;

		if qos == QoS::AtMostOnce {
			let mut packet = Publish::AtMostOnce {
				retain,
				topic,
				payload,
				properties,
			};
			let result = apply_topic_alias(&mut packet, topic_alias, auto_assign_topic_alias, auto_use_topic_alias);
			if let Err(error) = result {
				let _ = response_tx.send(Err(error));
				return Ok(None);
			}
			let _ = response_tx.send(Ok(()));
			return Ok(Some(packet.into()));
		}

		let Some(id) = packet_ids.allocate() else {
			return Err(PublishCommand {
				topic,
				payload,
				qos,
				retain,
				properties,
				response_tx,
			});
		};

		let mut packet = match qos {
			QoS::AtLeastOnce => Publish::AtLeastOnce {
				id,
				retain,
				duplicate: false,
				topic,
				payload,
				properties,
			},
			QoS::ExactlyOnce => Publish::ExactlyOnce {
				id,
				retain,
				duplicate: false,
				topic,
				payload,
				properties,
			},
			QoS::AtMostOnce => unreachable!("handled above"),
		};

		if let Err(error) = apply_topic_alias(&mut packet, topic_alias, auto_assign_topic_alias, auto_use_topic_alias) {
			packet_ids.deallocate(id);
			let _ = response_tx.send(Err(error));
			return Ok(None);
		}

		let stored = packet.clone_for_store(&recover_full_topic(&packet, topic_alias.as_ref()));
		if let Err(error) = store.put(id, stored.into()) {
			packet_ids.deallocate(id);
			let _ = response_tx.send(Err(SessionError::Store(error.into())));
			return Ok(None);
		}

		self.register(id, qos, response_tx);
		Ok(Some(packet.into()))
	}

	/// Registers a newly-sent QoS ≥ 1 publish's id so the matching ack can
	/// later resolve `response_tx`.
	fn register(&mut self, id: PacketId, qos: QoS, response_tx: super::ResponseTx<Result<(), SessionError>>) {
		match qos {
			QoS::AtMostOnce => unreachable!("QoS 0 publishes are never registered"),
			QoS::AtLeastOnce => {
				self.awaiting_puback.insert(id, response_tx);
			}
			QoS::ExactlyOnce => {
				self.awaiting_pubrec.insert(id, response_tx);
			}
		}
	}

	pub fn handle_puback(
		&mut self,
		puback: PubAck,
		packet_ids: &mut PacketIdProvider,
		store: &mut dyn Store,
	) -> Result<(), StateError> {
		let tx = self
			.awaiting_puback
			.remove(&puback.id)
			.ok_or(StateError::Unsolicited(PacketType::PubAck))?;

		let _ = store.del(puback.id);
		packet_ids.deallocate(puback.id);

		let result = ack_result(puback.reason_code);
		let _ = tx.send(result);
		Ok(())
	}

	pub fn handle_pubrec(
		&mut self,
		pubrec: PubRec,
		packet_ids: &mut PacketIdProvider,
		store: &mut dyn Store,
	) -> Result<Option<Packet>, StateError> {
		let tx = self
			.awaiting_pubrec
			.remove(&pubrec.id)
			.ok_or(StateError::Unsolicited(PacketType::PubRec))?;

		if pubrec.reason_code.is_success() {
			self.awaiting_pubcomp.insert(pubrec.id, tx);
			let pubrel = PubRel::new(pubrec.id);
			if let Err(error) = store.put(pubrec.id, pubrel.clone().into()) {
				tracing::warn!(id = %pubrec.id, %error, "failed to persist PubRel replacing stored Publish");
			}
			Ok(Some(pubrel.into()))
		} else {
			// A non-success PUBREC is terminal: no PUBREL follows it.
			let _ = store.del(pubrec.id);
			packet_ids.deallocate(pubrec.id);
			let _ = tx.send(Err(SessionError::Rejected(pubrec.reason_code)));
			Ok(None)
		}
	}

	pub fn handle_pubcomp(
		&mut self,
		pubcomp: PubComp,
		packet_ids: &mut PacketIdProvider,
		store: &mut dyn Store,
	) -> Result<(), StateError> {
		let tx = self
			.awaiting_pubcomp
			.remove(&pubcomp.id)
			.ok_or(StateError::Unsolicited(PacketType::PubComp))?;

		let _ = store.del(pubcomp.id);
		packet_ids.deallocate(pubcomp.id);

		let result = ack_result(pubcomp.reason_code);
		let _ = tx.send(result);
		Ok(())
	}

	/// Removes all bookkeeping for `id` without resolving its callback,
	/// returning whether anything was in flight for it. Used by
	/// `removeOutgoingMessage`.
	pub fn remove(&mut self, id: PacketId) -> bool {
		self.awaiting_puback.remove(&id).is_some()
			| self.awaiting_pubrec.remove(&id).is_some()
			| self.awaiting_pubcomp.remove(&id).is_some()
	}

	pub fn is_empty(&self) -> bool {
		self.awaiting_puback.is_empty() && self.awaiting_pubrec.is_empty() && self.awaiting_pubcomp.is_empty()
	}
}

fn ack_result(reason_code: ReasonCode) -> Result<(), SessionError> {
	if reason_code.is_success() {
		Ok(())
	} else {
		Err(SessionError::Rejected(reason_code))
	}
}

/// If the caller supplied their own topic alias (`publish.properties().topic_alias`
/// already set), that takes priority: register it in the send registry
/// against the given topic and leave the topic in place for the broker to
/// learn the mapping, failing with [`SessionError::TopicAliasOutOfRange`] if
/// the alias is outside the registry's range or no registry is installed at
/// all. Otherwise, for publishes the caller didn't tag with one of their
/// own, substitutes a registered alias for the topic string (or registers a
/// fresh one) per `auto_assign`/`auto_use`.
fn apply_topic_alias(
	publish: &mut Publish,
	registry: &mut Option<TopicAliasSend>,
	auto_assign: bool,
	auto_use: bool,
) -> Result<(), SessionError> {
	if publish.topic().is_empty() {
		return Ok(());
	}

	if let Some(alias) = publish.properties().topic_alias {
		return match registry.as_mut() {
			Some(registry) if registry.put(publish.topic(), alias) => Ok(()),
			_ => Err(SessionError::TopicAliasOutOfRange),
		};
	}

	let Some(registry) = registry.as_mut() else {
		return Ok(());
	};
	if auto_assign {
		if let Some(alias) = registry.get_alias_by_topic(publish.topic()) {
			publish.properties_mut().topic_alias = Some(alias);
			publish.set_topic(String::new());
		} else {
			let alias = registry.get_lru_alias();
			registry.put(publish.topic(), alias);
			publish.properties_mut().topic_alias = Some(alias);
		}
	} else if auto_use {
		if let Some(alias) = registry.get_alias_by_topic(publish.topic()) {
			publish.properties_mut().topic_alias = Some(alias);
			publish.set_topic(String::new());
		}
	}
	Ok(())
}

/// Recovers the full topic string for a packet about to be persisted to the
/// outgoing store: if the packet carries a topic alias in place of the
/// topic, look the full topic back up in the send registry.
fn recover_full_topic(publish: &Publish, registry: Option<&TopicAliasSend>) -> String {
	if !publish.topic().is_empty() {
		return publish.topic().to_owned();
	}
	let alias = publish
		.properties()
		.topic_alias
		.expect("empty topic implies a topic alias was applied");
	registry
		.and_then(|r| r.get_topic_by_alias(alias))
		.expect("alias was just registered in the send registry")
		.to_owned()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::MemoryStore;
	use bytes::Bytes;
	use std::sync::Arc;
	use tokio::sync::{mpsc, oneshot};

	fn publish(qos: QoS) -> Publish {
		match qos {
			QoS::AtLeastOnce => Publish::AtLeastOnce {
				id: PacketId::new(1).unwrap(),
				retain: false,
				duplicate: false,
				topic: "a/b".into(),
				payload: Bytes::from_static(b"hi"),
				properties: Default::default(),
			},
			QoS::ExactlyOnce => Publish::ExactlyOnce {
				id: PacketId::new(1).unwrap(),
				retain: false,
				duplicate: false,
				topic: "a/b".into(),
				payload: Bytes::from_static(b"hi"),
				properties: Default::default(),
			},
			QoS::AtMostOnce => unreachable!(),
		}
	}

	#[tokio::test]
	async fn ack_policy_success_delivers_and_acks_with_zero() {
		let mut manager = IncomingPublishManager::default();
		let mut store = MemoryStore::new();
		let (tx, mut rx) = mpsc::channel(1);
		let policy: AckPolicy = Arc::new(|_, _, _| 0);

		let ack = manager
			.handle_publish(|_| Some(tx.clone()), &mut store, &policy, publish(QoS::AtLeastOnce))
			.await
			.unwrap();

		assert!(matches!(ack, Some(Packet::PubAck(pkt)) if pkt.reason_code.0 == 0));
		assert!(rx.try_recv().is_ok());
	}

	#[tokio::test]
	async fn ack_policy_rejection_skips_delivery_and_acks_with_its_code() {
		let mut manager = IncomingPublishManager::default();
		let mut store = MemoryStore::new();
		let (tx, mut rx) = mpsc::channel(1);
		let policy: AckPolicy = Arc::new(|_, _, _| 135);

		let ack = manager
			.handle_publish(|_| Some(tx.clone()), &mut store, &policy, publish(QoS::AtLeastOnce))
			.await
			.unwrap();

		assert!(matches!(ack, Some(Packet::PubAck(pkt)) if pkt.reason_code.0 == 135));
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn ack_policy_rejection_for_qos_two_skips_the_incoming_store() {
		let mut manager = IncomingPublishManager::default();
		let mut store = MemoryStore::new();
		let (tx, _rx) = mpsc::channel(1);
		let policy: AckPolicy = Arc::new(|_, _, _| 131);

		let ack = manager
			.handle_publish(|_| Some(tx.clone()), &mut store, &policy, publish(QoS::ExactlyOnce))
			.await
			.unwrap();

		assert!(matches!(ack, Some(Packet::PubRec(pkt)) if pkt.reason_code.0 == 131));
		assert!(matches!(store.get(PacketId::new(1).unwrap()), Ok(None)));
	}

	#[tokio::test]
	async fn ack_policy_returning_an_unacceptable_code_fails_the_delivery() {
		let mut manager = IncomingPublishManager::default();
		let mut store = MemoryStore::new();
		let (tx, _rx) = mpsc::channel(1);
		let policy: AckPolicy = Arc::new(|_, _, _| 200);

		let result = manager
			.handle_publish(|_| Some(tx.clone()), &mut store, &policy, publish(QoS::AtLeastOnce))
			.await;

		assert!(matches!(result, Err(StateError::InvalidAckReasonCode(200))));
	}

	fn publish_command(
		qos: QoS,
		properties: crate::packets::Properties,
	) -> (PublishCommand, oneshot::Receiver<Result<(), SessionError>>) {
		let (response_tx, response_rx) = oneshot::channel();
		(
			PublishCommand {
				topic: "a/b".into(),
				payload: Bytes::from_static(b"hi"),
				qos,
				retain: false,
				properties,
				response_tx,
			},
			response_rx,
		)
	}

	#[test]
	fn caller_supplied_alias_is_registered_and_kept_in_the_outgoing_packet() {
		let mut manager = OutgoingPublishManager::default();
		let mut packet_ids = PacketIdProvider::new();
		let mut store = MemoryStore::new();
		let mut topic_alias = TopicAliasSend::new(4);
		let properties = crate::packets::Properties {
			topic_alias: Some(2),
			..Default::default()
		};
		let (cmd, mut response_rx) = publish_command(QoS::AtLeastOnce, properties);

		let packet = manager
			.submit(cmd, &mut packet_ids, &mut store, &mut topic_alias, false, false)
			.unwrap()
			.unwrap();

		assert!(matches!(packet, Packet::Publish(p) if p.topic() == "a/b" && p.properties().topic_alias == Some(2)));
		assert_eq!(topic_alias.as_ref().unwrap().get_alias_by_topic("a/b"), Some(2));
		assert!(response_rx.try_recv().is_err());
	}

	#[test]
	fn caller_supplied_alias_out_of_range_fails_without_sending() {
		let mut manager = OutgoingPublishManager::default();
		let mut packet_ids = PacketIdProvider::new();
		let mut store = MemoryStore::new();
		let mut topic_alias = TopicAliasSend::new(1);
		let properties = crate::packets::Properties {
			topic_alias: Some(9),
			..Default::default()
		};
		let (cmd, mut response_rx) = publish_command(QoS::AtLeastOnce, properties);

		let result = manager.submit(cmd, &mut packet_ids, &mut store, &mut topic_alias, false, false);

		assert!(matches!(result, Ok(None)));
		assert!(matches!(
			response_rx.try_recv().unwrap(),
			Err(SessionError::TopicAliasOutOfRange)
		));
	}

	#[test]
	fn caller_supplied_alias_without_a_registry_fails() {
		let mut manager = OutgoingPublishManager::default();
		let mut packet_ids = PacketIdProvider::new();
		let mut store = MemoryStore::new();
		let mut topic_alias = None;
		let properties = crate::packets::Properties {
			topic_alias: Some(1),
			..Default::default()
		};
		let (cmd, mut response_rx) = publish_command(QoS::AtLeastOnce, properties);

		let result = manager.submit(cmd, &mut packet_ids, &mut store, &mut topic_alias, false, false);

		assert!(matches!(result, Ok(None)));
		assert!(matches!(
			response_rx.try_recv().unwrap(),
			Err(SessionError::TopicAliasOutOfRange)
		));
	}
}
