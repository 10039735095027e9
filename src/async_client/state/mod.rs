mod publish;
mod replay;
mod subscriptions;

use self::{
	publish::{IncomingPublishManager, OutgoingPublishManager},
	replay::ReplayEngine,
	subscriptions::SubscriptionsManager,
};
use super::command::{Command, PublishCommand, SubscribeCommand, UnsubscribeCommand};
use super::hooks::{default_ack_policy, AckPolicy, AuthHandler};
use crate::{
	packets::{Auth, Disconnect, Publish},
	store::Store,
	topic_alias::{TopicAliasRecv, TopicAliasSend},
	Packet, PacketId, PacketIdProvider, PacketType, QoS, SessionError,
};
use std::collections::VecDeque;
use tokio::sync::mpsc;

pub type PublishTx = mpsc::Sender<Publish>;
pub type PublishRx = mpsc::Receiver<Publish>;
pub(super) type ResponseTx<T> = tokio::sync::oneshot::Sender<T>;
pub(super) type ResponseRx<T> = tokio::sync::oneshot::Receiver<T>;

/// A user-initiated call deferred behind the store-processing interlock:
/// while a replay is draining, or anything is already queued ahead of it,
/// new publish/subscribe/unsubscribe calls wait here rather than
/// transmitting ahead of the replayed packets.
#[derive(Debug)]
enum Deferred {
	Publish(PublishCommand),
	Subscribe(SubscribeCommand),
	Unsubscribe(UnsubscribeCommand),
}

/// Session state carried across the lifetime of a `client_task`: packet-id
/// allocation, the outgoing/incoming persistent stores, the v5 topic-alias
/// registries, and the store-processing queue that the replay engine
/// interlocks against.
pub struct State {
	packet_ids: PacketIdProvider,
	outgoing_store: Box<dyn Store>,
	incoming_store: Box<dyn Store>,
	topic_alias_send: Option<TopicAliasSend>,
	topic_alias_recv: TopicAliasRecv,
	auto_assign_topic_alias: bool,
	auto_use_topic_alias: bool,
	ack_policy: AckPolicy,
	auth_handler: Option<AuthHandler>,

	subscriptions: SubscriptionsManager,
	incoming_publish: IncomingPublishManager,
	outgoing_publish: OutgoingPublishManager,

	/// Set from successful CONNACK until the outgoing-store replay this
	/// connection triggered has fully drained.
	store_processing: bool,
	deferred: VecDeque<Deferred>,

	/// True from CONNACK until the transport is lost. While false, new
	/// publish/subscribe/unsubscribe calls go onto `offline_queue` instead of
	/// producing a packet immediately.
	online: bool,
	/// QoS 0 publishes made while disconnected: queued here if
	/// `queue_qos_zero`, otherwise rejected with `NotConnected` on submission.
	queue_qos_zero: bool,
	offline_queue: VecDeque<Deferred>,
}

impl std::fmt::Debug for State {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("State")
			.field("packet_ids", &self.packet_ids)
			.field("outgoing_store", &self.outgoing_store)
			.field("incoming_store", &self.incoming_store)
			.field("topic_alias_send", &self.topic_alias_send)
			.field("topic_alias_recv", &self.topic_alias_recv)
			.field("auto_assign_topic_alias", &self.auto_assign_topic_alias)
			.field("auto_use_topic_alias", &self.auto_use_topic_alias)
			.field("ack_policy", &"<fn>")
			.field("auth_handler", &self.auth_handler.is_some())
			.field("subscriptions", &self.subscriptions)
			.field("incoming_publish", &self.incoming_publish)
			.field("outgoing_publish", &self.outgoing_publish)
			.field("store_processing", &self.store_processing)
			.field("deferred", &self.deferred)
			.field("online", &self.online)
			.field("queue_qos_zero", &self.queue_qos_zero)
			.field("offline_queue", &self.offline_queue)
			.finish()
	}
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
	#[error("received unsolicited {0}")]
	Unsolicited(PacketType),

	/// The Client recevied a packet that the Server should not send.
	#[error("received a packet the server must not send")]
	InvalidPacket,

	#[error("protocol error: {0}")]
	ProtocolError(&'static str),

	#[error("local subscriber channel did not keep up with delivery")]
	DeliveryFailure(Box<Publish>),

	#[error("ack policy returned reason code {0}, which no broker accepts for an inbound publish ack")]
	InvalidAckReasonCode(u8),
}

impl State {
	pub fn new(
		outgoing_store: Box<dyn Store>,
		incoming_store: Box<dyn Store>,
		topic_alias_recv_max: u16,
		auto_assign_topic_alias: bool,
		auto_use_topic_alias: bool,
		queue_qos_zero: bool,
	) -> Self {
		Self {
			packet_ids: PacketIdProvider::new(),
			outgoing_store,
			incoming_store,
			topic_alias_send: None,
			topic_alias_recv: TopicAliasRecv::new(topic_alias_recv_max),
			auto_assign_topic_alias,
			auto_use_topic_alias,
			ack_policy: default_ack_policy(),
			auth_handler: None,
			subscriptions: SubscriptionsManager::default(),
			incoming_publish: IncomingPublishManager::default(),
			outgoing_publish: OutgoingPublishManager::default(),
			store_processing: false,
			deferred: VecDeque::new(),
			online: false,
			queue_qos_zero,
			offline_queue: VecDeque::new(),
		}
	}

	/// Installs the `customHandleAcks`-equivalent policy consulted for every
	/// inbound QoS 1/2 PUBLISH. Defaults to always-success.
	pub fn with_ack_policy(mut self, ack_policy: AckPolicy) -> Self {
		self.ack_policy = ack_policy;
		self
	}

	/// Installs the `handleAuth`-equivalent hook for inbound v5 AUTH
	/// packets. Left unset, every inbound AUTH is refused.
	pub fn with_auth_handler(mut self, auth_handler: AuthHandler) -> Self {
		self.auth_handler = Some(auth_handler);
		self
	}

	/// Flips the connected flag. `true` on a successful CONNACK (before the
	/// offline queue and replay are flushed), `false` the moment the
	/// transport is known gone.
	pub fn set_online(&mut self, online: bool) {
		self.online = online;
	}

	/// Drains every call queued while disconnected, in arrival order. Called
	/// right after CONNACK, before `begin_replay`, so the ids it allocates
	/// can't collide with ones the store replay is about to reuse. Stops
	/// (leaving the rest queued) on the first call that can't be admitted.
	pub fn drain_offline_queue(&mut self) -> Vec<Packet> {
		let mut packets = Vec::new();
		while let Some(deferred) = self.offline_queue.pop_front() {
			match self.dispatch_deferred(deferred) {
				Ok(produced) => packets.extend(produced),
				Err(deferred) => {
					self.offline_queue.push_front(deferred);
					break;
				}
			}
		}
		packets
	}

	/// The packet-id space is session-scoped. Called exactly at a successful
	/// CONNACK (start of session) and from `end`.
	pub fn clear_packet_ids(&mut self) {
		self.packet_ids.clear();
	}

	/// Instantiates the outbound topic-alias registry from the broker's
	/// CONNACK `topicAliasMaximum` property. A value of `0` or absent means
	/// the broker doesn't support aliasing; the registry stays uninstalled
	/// and `applyTopicAlias` becomes a no-op.
	pub fn adopt_topic_alias_maximum(&mut self, max: Option<u16>) {
		self.topic_alias_send = max.filter(|&m| m > 0).and_then(TopicAliasSend::new);
	}

	/// Marks the store-processing interlock engaged and returns every
	/// outgoing-store packet to retransmit, in insertion order, with `dup`
	/// set.
	pub fn begin_replay(&mut self) -> Vec<Packet> {
		self.store_processing = true;
		ReplayEngine::drain(self.outgoing_store.as_ref(), &mut self.packet_ids)
			.into_iter()
			.map(|(_, mut packet)| {
				if let Packet::Publish(publish) = &mut packet {
					publish.set_duplicate(true);
				}
				packet
			})
			.collect()
	}

	/// Clears the interlock and flushes every call that was deferred while
	/// it was held, in the order they arrived. Stops (leaving the rest
	/// queued) the moment one can't be admitted, e.g. packet-id exhaustion.
	pub fn end_replay(&mut self) -> Vec<Packet> {
		self.store_processing = false;
		let mut packets = Vec::new();
		while let Some(deferred) = self.deferred.pop_front() {
			match self.dispatch_deferred(deferred) {
				Ok(produced) => packets.extend(produced),
				Err(deferred) => {
					self.deferred.push_front(deferred);
					break;
				}
			}
		}
		packets
	}

	fn dispatch_deferred(&mut self, deferred: Deferred) -> Result<Vec<Packet>, Deferred> {
		match deferred {
			Deferred::Publish(cmd) => match self.try_publish(cmd) {
				Ok(packet) => Ok(packet.into_iter().collect()),
				Err(cmd) => Err(Deferred::Publish(cmd)),
			},
			Deferred::Subscribe(cmd) => {
				let Some(id) = self.packet_ids.allocate() else {
					return Err(Deferred::Subscribe(cmd));
				};
				Ok(self.subscriptions.build_subscribe(id, cmd).into_iter().collect())
			}
			Deferred::Unsubscribe(cmd) => {
				let Some(id) = self.packet_ids.allocate() else {
					return Err(Deferred::Unsubscribe(cmd));
				};
				Ok(self.subscriptions.build_unsubscribe(id, cmd).into_iter().collect())
			}
		}
	}

	fn try_publish(&mut self, cmd: PublishCommand) -> Result<Option<Packet>, PublishCommand> {
		self.outgoing_publish.submit(
			cmd,
			&mut self.packet_ids,
			self.outgoing_store.as_mut(),
			&mut self.topic_alias_send,
			self.auto_assign_topic_alias,
			self.auto_use_topic_alias,
		)
	}

	/// Dispatches a user-initiated command, either producing the packet(s)
	/// to transmit immediately or deferring it behind the store-processing
	/// queue.
	pub fn process_client_command(&mut self, command: Command) -> Vec<Packet> {
		match command {
			Command::Publish(cmd) => self.submit_publish(cmd),
			Command::Subscribe(cmd) => self.submit_subscribe(cmd),
			Command::Unsubscribe(cmd) => self.submit_unsubscribe(cmd),
			Command::PublishComplete { id } => {
				self.incoming_publish.handle_pubcomp_command(id).into_iter().collect()
			}
			Command::RemoveOutgoingMessage { id, response_tx } => {
				let removed = self.outgoing_publish.remove(id);
				if removed {
					let _ = self.outgoing_store.del(id);
					self.packet_ids.deallocate(id);
				}
				let _ = response_tx.send(removed);
				Vec::new()
			}
			Command::Reconnect => Vec::new(),
			Command::End { response_tx, .. } => {
				let _ = response_tx.send(());
				vec![Disconnect::default().into()]
			}
			Command::GetLastMessageId { response_tx } => {
				let _ = response_tx.send(self.get_last_message_id());
				Vec::new()
			}
		}
	}

	fn submit_publish(&mut self, cmd: PublishCommand) -> Vec<Packet> {
		if !self.online {
			if cmd.qos == QoS::AtMostOnce && !self.queue_qos_zero {
				let _ = cmd.response_tx.send(Err(SessionError::NotConnected));
			} else {
				self.offline_queue.push_back(Deferred::Publish(cmd));
			}
			return Vec::new();
		}
		if self.store_processing || !self.deferred.is_empty() {
			self.deferred.push_back(Deferred::Publish(cmd));
			return Vec::new();
		}
		match self.try_publish(cmd) {
			Ok(packet) => packet.into_iter().collect(),
			Err(cmd) => {
				tracing::debug!("packet ids exhausted; deferring publish");
				self.deferred.push_back(Deferred::Publish(cmd));
				Vec::new()
			}
		}
	}

	fn submit_subscribe(&mut self, cmd: SubscribeCommand) -> Vec<Packet> {
		if !self.online {
			self.offline_queue.push_back(Deferred::Subscribe(cmd));
			return Vec::new();
		}
		if self.store_processing || !self.deferred.is_empty() {
			self.deferred.push_back(Deferred::Subscribe(cmd));
			return Vec::new();
		}
		if cmd.filters.is_empty() {
			// build_subscribe resolves the empty-filter case itself before
			// ever touching the id-keyed table; the id is unused.
			let placeholder = PacketId::new(1).expect("1 is non-zero");
			return self.subscriptions.build_subscribe(placeholder, cmd).into_iter().collect();
		}
		let Some(id) = self.packet_ids.allocate() else {
			tracing::debug!("packet ids exhausted; deferring subscribe");
			self.deferred.push_back(Deferred::Subscribe(cmd));
			return Vec::new();
		};
		self.subscriptions.build_subscribe(id, cmd).into_iter().collect()
	}

	fn submit_unsubscribe(&mut self, cmd: UnsubscribeCommand) -> Vec<Packet> {
		if !self.online {
			self.offline_queue.push_back(Deferred::Unsubscribe(cmd));
			return Vec::new();
		}
		if self.store_processing || !self.deferred.is_empty() {
			self.deferred.push_back(Deferred::Unsubscribe(cmd));
			return Vec::new();
		}
		if cmd.filters.is_empty() {
			let placeholder = PacketId::new(1).expect("1 is non-zero");
			return self.subscriptions.build_unsubscribe(placeholder, cmd).into_iter().collect();
		}
		let Some(id) = self.packet_ids.allocate() else {
			tracing::debug!("packet ids exhausted; deferring unsubscribe");
			self.deferred.push_back(Deferred::Unsubscribe(cmd));
			return Vec::new();
		};
		self.subscriptions.build_unsubscribe(id, cmd).into_iter().collect()
	}

	/// Process an incoming Packet from the broker.
	pub async fn process_incoming_packet(&mut self, packet: Packet) -> Result<Option<Packet>, StateError> {
		match packet {
			Packet::Publish(mut publish) => {
				self.resolve_topic_alias(&mut publish)?;
				self.incoming_publish
					.handle_publish(
						|topic| self.subscriptions.find_publish_channel(topic),
						self.incoming_store.as_mut(),
						&self.ack_policy,
						*publish,
					)
					.await
			}
			Packet::PubAck(pkt) => self
				.outgoing_publish
				.handle_puback(pkt, &mut self.packet_ids, self.outgoing_store.as_mut())
				.map(|_| None),
			Packet::PubRec(pkt) => {
				self.outgoing_publish
					.handle_pubrec(pkt, &mut self.packet_ids, self.outgoing_store.as_mut())
			}
			Packet::PubRel(pkt) => self.incoming_publish.handle_pubrel(pkt, self.incoming_store.as_mut()),
			Packet::PubComp(pkt) => self
				.outgoing_publish
				.handle_pubcomp(pkt, &mut self.packet_ids, self.outgoing_store.as_mut())
				.map(|_| None),
			Packet::SubAck(pkt) => {
				let id = pkt.id;
				self.subscriptions.handle_suback(pkt)?;
				self.packet_ids.deallocate(id);
				Ok(None)
			}
			Packet::UnsubAck(pkt) => {
				let id = pkt.id;
				self.subscriptions.handle_unsuback(pkt)?;
				self.packet_ids.deallocate(id);
				Ok(None)
			}
			Packet::PingResp => Ok(None),
			Packet::Disconnect(_) => Ok(None),
			Packet::Auth(auth) => self.handle_auth(auth),
			Packet::Connect(_) | Packet::ConnAck(_) | Packet::Subscribe(_) | Packet::Unsubscribe(_) | Packet::PingReq => {
				Err(StateError::InvalidPacket)
			}
		}
	}

	/// AUTH is a v5-only extended-authentication exchange (§4.6). Reason
	/// code 24 ("Continue authentication") is forwarded to the installed
	/// `auth_handler`, and its reply sent straight back; every other reason
	/// code, and an unset or declining handler, is treated as a refusal.
	fn handle_auth(&mut self, auth: Auth) -> Result<Option<Packet>, StateError> {
		const CONTINUE_AUTHENTICATION: u8 = 24;
		if auth.reason_code.0 != CONTINUE_AUTHENTICATION {
			return Err(StateError::InvalidPacket);
		}
		let handler = self.auth_handler.as_ref().ok_or(StateError::InvalidPacket)?;
		handler(auth).map(|reply| Some(reply.into())).ok_or(StateError::InvalidPacket)
	}

	/// Resolves a v5 topic alias against the client's receive-side registry,
	/// substituting the known topic when the broker omitted it, or
	/// registering a fresh mapping when it didn't.
	fn resolve_topic_alias(&mut self, publish: &mut Publish) -> Result<(), StateError> {
		let Some(alias) = publish.properties().topic_alias else {
			return Ok(());
		};
		if publish.topic().is_empty() {
			let topic = self
				.topic_alias_recv
				.get(alias)
				.ok_or(StateError::ProtocolError("Received unregistered Topic Alias"))?
				.to_owned();
			publish.set_topic(topic);
		} else if !self.topic_alias_recv.put(publish.topic(), alias) {
			return Err(StateError::ProtocolError("Received Topic Alias is out of range"));
		}
		Ok(())
	}

	/// Clears receive-side alias state; called on every disconnect since the
	/// broker gives no guarantee these survive a session resumption.
	pub fn clear_topic_alias_recv(&mut self) {
		self.topic_alias_recv.clear();
	}

	/// On transport close: flush volatile (SUBSCRIBE/UNSUBSCRIBE ack)
	/// in-flight entries with `Disconnected`. Non-volatile outbound QoS ≥ 1
	/// entries are left untouched for replay.
	pub fn flush_volatile(&mut self) {
		self.subscriptions.flush_volatile();
	}

	/// After a reconnect whose CONNACK doesn't resume a broker-side session,
	/// re-issue SUBSCRIBE for every topic the resubscribe table remembers.
	pub fn connected(&mut self, session_present: bool) -> Vec<Packet> {
		if session_present {
			return Vec::new();
		}
		self.subscriptions.generate_resubscribe(&mut self.packet_ids)
	}

	pub fn outgoing_in_flight_is_empty(&self) -> bool {
		self.outgoing_publish.is_empty()
	}

	pub fn get_last_message_id(&self) -> Option<PacketId> {
		self.packet_ids.get_last_allocated()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::MemoryStore;
	use bytes::Bytes;
	use tokio::sync::{mpsc, oneshot};

	fn new_state(queue_qos_zero: bool) -> State {
		State::new(Box::new(MemoryStore::new()), Box::new(MemoryStore::new()), 0, false, false, queue_qos_zero)
	}

	fn publish_cmd(qos: QoS) -> (PublishCommand, oneshot::Receiver<Result<(), SessionError>>) {
		let (response_tx, response_rx) = oneshot::channel();
		(
			PublishCommand {
				topic: "a/b".into(),
				payload: Bytes::from_static(b"payload"),
				qos,
				retain: false,
				properties: Default::default(),
				response_tx,
			},
			response_rx,
		)
	}

	#[test]
	fn qos_zero_publish_fails_immediately_when_offline_and_not_queueing() {
		let mut state = new_state(false);
		let (cmd, mut response_rx) = publish_cmd(QoS::AtMostOnce);
		let packets = state.process_client_command(Command::Publish(cmd));
		assert!(packets.is_empty());
		assert!(matches!(
			response_rx.try_recv().unwrap(),
			Err(SessionError::NotConnected)
		));
	}

	#[test]
	fn qos_zero_publish_queues_when_offline_and_queueing_enabled() {
		let mut state = new_state(true);
		let (cmd, mut response_rx) = publish_cmd(QoS::AtMostOnce);
		let packets = state.process_client_command(Command::Publish(cmd));
		assert!(packets.is_empty());
		assert!(response_rx.try_recv().is_err());

		state.set_online(true);
		let drained = state.drain_offline_queue();
		assert_eq!(drained.len(), 1);
		assert!(matches!(drained[0], Packet::Publish(_)));
	}

	#[test]
	fn qos_one_publish_queues_while_offline_regardless_of_queue_qos_zero() {
		let mut state = new_state(false);
		let (cmd, mut response_rx) = publish_cmd(QoS::AtLeastOnce);
		let packets = state.process_client_command(Command::Publish(cmd));
		assert!(packets.is_empty());
		assert!(response_rx.try_recv().is_err());

		state.set_online(true);
		let drained = state.drain_offline_queue();
		assert_eq!(drained.len(), 1);
	}

	#[test]
	fn offline_queue_drains_in_arrival_order_before_replay() {
		let mut state = new_state(true);
		let (cmd_a, _rx_a) = publish_cmd(QoS::AtMostOnce);
		let (cmd_b, _rx_b) = publish_cmd(QoS::AtLeastOnce);
		state.process_client_command(Command::Publish(cmd_a));
		state.process_client_command(Command::Publish(cmd_b));

		state.set_online(true);
		let drained = state.drain_offline_queue();
		assert_eq!(drained.len(), 2);
		// first queued is QoS 0 (no packet id), second is QoS 1 (carries one).
		match (&drained[0], &drained[1]) {
			(Packet::Publish(first), Packet::Publish(second)) => {
				assert_eq!(first.qos(), QoS::AtMostOnce);
				assert_eq!(second.qos(), QoS::AtLeastOnce);
			}
			_ => panic!("expected two Publish packets"),
		}
	}

	#[test]
	fn subscribe_queues_while_offline_and_drains_on_reconnect() {
		let mut state = new_state(false);
		let (response_tx, mut response_rx) = oneshot::channel();
		let (publish_tx, _publish_rx) = mpsc::channel(1);
		let filter = crate::FilterBuf::new("a/b").unwrap();
		let cmd = SubscribeCommand {
			filters: vec![(filter, QoS::AtMostOnce)],
			publish_tx,
			response_tx,
		};
		let packets = state.process_client_command(Command::Subscribe(cmd));
		assert!(packets.is_empty());
		assert!(response_rx.try_recv().is_err());

		state.set_online(true);
		let drained = state.drain_offline_queue();
		assert_eq!(drained.len(), 1);
		assert!(matches!(drained[0], Packet::Subscribe(_)));
	}

	#[test]
	fn online_state_dispatches_publish_without_queueing() {
		let mut state = new_state(false);
		state.set_online(true);
		let (cmd, mut response_rx) = publish_cmd(QoS::AtMostOnce);
		let packets = state.process_client_command(Command::Publish(cmd));
		assert_eq!(packets.len(), 1);
		assert!(matches!(response_rx.try_recv().unwrap(), Ok(())));
	}

	#[tokio::test]
	async fn unsolicited_auth_without_a_handler_is_a_protocol_error() {
		let mut state = new_state(false);
		let auth = crate::packets::Auth::new(24);
		let result = state.process_incoming_packet(Packet::Auth(auth)).await;
		assert!(matches!(result, Err(StateError::InvalidPacket)));
	}

	#[tokio::test]
	async fn continue_authentication_is_forwarded_to_the_installed_handler() {
		let mut state =
			new_state(false).with_auth_handler(std::sync::Arc::new(|_auth| Some(crate::packets::Auth::new(24))));
		let auth = crate::packets::Auth::new(24);
		let result = state.process_incoming_packet(Packet::Auth(auth)).await.unwrap();
		assert!(matches!(result, Some(Packet::Auth(_))));
	}

	#[tokio::test]
	async fn non_continue_reason_code_is_refused_even_with_a_handler() {
		let mut state =
			new_state(false).with_auth_handler(std::sync::Arc::new(|_auth| Some(crate::packets::Auth::new(24))));
		let auth = crate::packets::Auth::new(0);
		let result = state.process_incoming_packet(Packet::Auth(auth)).await;
		assert!(matches!(result, Err(StateError::InvalidPacket)));
	}
}
