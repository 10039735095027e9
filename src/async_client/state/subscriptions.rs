use super::{PublishTx, StateError};
use crate::async_client::command::{ResponseTx, SubscribeCommand, UnsubscribeCommand};
use crate::{
	packets::{Packet, PacketType, SubAck, Subscribe, SubscribeFilter, UnsubAck, Unsubscribe},
	FilterBuf, PacketId, PacketIdProvider, QoS,
};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::oneshot;

#[derive(Debug, Default)]
pub struct SubscriptionsManager {
	/// State for subscribe requests awaiting a SubAck from the broker.
	subscribe_state: HashMap<PacketId, SubscribeState>,
	unsubscribe_state: HashMap<PacketId, UnsubscribeState>,

	/// Active subscriptions, keyed by filter.
	subscriptions: BTreeMap<FilterBuf, PublishTx>,

	/// Filters the peer should be re-subscribed to on a reconnect that
	/// doesn't resume a broker-side session (`session_present == false`).
	resubscribe_table: BTreeMap<FilterBuf, QoS>,
}

#[derive(Debug)]
struct SubscribeState {
	requested_filters: Vec<(FilterBuf, QoS)>,
	/// Filters granted from the resubscribe table without sending a new
	/// SUBSCRIBE; folded into the result alongside whatever `requested_filters`
	/// comes back acknowledged as.
	already_subscribed: Vec<(FilterBuf, QoS)>,
	publish_tx: PublishTx,
	response_tx: ResponseTx<Vec<(FilterBuf, QoS)>>,
}

#[derive(Debug)]
struct UnsubscribeState {
	filters: Vec<FilterBuf>,
	response_tx: ResponseTx<()>,
}

impl SubscriptionsManager {
	/// Builds the SUBSCRIBE packet for a user-initiated subscribe command,
	/// skipping filters already present in the resubscribe table at an
	/// equal-or-higher QoS (mirroring the broker's own de-duplication).
	pub fn build_subscribe(&mut self, id: PacketId, command: SubscribeCommand) -> Option<Packet> {
		let SubscribeCommand {
			filters,
			publish_tx,
			response_tx,
		} = command;

		if filters.is_empty() {
			let _ = response_tx.send(Vec::new());
			return None;
		}

		let mut to_send = Vec::new();
		let mut already_subscribed = Vec::new();
		for (filter, qos) in filters {
			match self.resubscribe_table.get(&filter) {
				Some(existing) if *existing >= qos => {
					self.subscriptions.insert(filter.clone(), publish_tx.clone());
					already_subscribed.push((filter, *existing));
				}
				_ => to_send.push((filter, qos)),
			}
		}

		if to_send.is_empty() {
			let _ = response_tx.send(already_subscribed);
			return None;
		}

		self.subscribe_state.insert(
			id,
			SubscribeState {
				requested_filters: to_send.clone(),
				already_subscribed,
				publish_tx,
				response_tx,
			},
		);

		let packet_filters = to_send
			.into_iter()
			.map(|(filter, qos)| SubscribeFilter::new(filter, qos))
			.collect();

		Some(
			Subscribe {
				id,
				filters: packet_filters,
				properties: Default::default(),
			}
			.into(),
		)
	}

	pub fn build_unsubscribe(&mut self, id: PacketId, command: UnsubscribeCommand) -> Option<Packet> {
		let UnsubscribeCommand {
			filters,
			response_tx,
		} = command;

		if filters.is_empty() {
			let _ = response_tx.send(());
			return None;
		}

		self.unsubscribe_state.insert(
			id,
			UnsubscribeState {
				filters: filters.clone(),
				response_tx,
			},
		);

		Some(
			Unsubscribe {
				id,
				filters,
				properties: Default::default(),
			}
			.into(),
		)
	}

	pub fn handle_suback(&mut self, suback: SubAck) -> Result<(), StateError> {
		let Some(state) = self.subscribe_state.remove(&suback.id) else {
			return Err(StateError::Unsolicited(PacketType::SubAck));
		};

		let SubscribeState {
			requested_filters,
			already_subscribed,
			publish_tx,
			response_tx,
		} = state;

		if suback.reason_codes.len() != requested_filters.len() {
			return Err(StateError::ProtocolError(
				"SubAck payload length does not correspond to Subscribe payload length",
			));
		}

		let mut successful_filters = already_subscribed;
		for (reason_code, (filter, requested_qos)) in
			suback.reason_codes.into_iter().zip(requested_filters)
		{
			if reason_code.is_success() {
				// The low two bits of a successful SubAck reason code carry
				// the granted QoS (0/1/2); anything else is a v5 "success
				// with conditions" code we still treat as the requested QoS.
				let granted = QoS::try_from(reason_code.0 & 0x03).unwrap_or(requested_qos);
				self.subscriptions.insert(filter.clone(), publish_tx.clone());
				self.resubscribe_table.insert(filter.clone(), granted);
				successful_filters.push((filter, granted));
			} else {
				self.resubscribe_table.remove(&filter);
			}
		}

		if response_tx.send(successful_filters).is_err() {
			tracing::debug!(id = %suback.id, "response channel for SubAck closed");
		}

		Ok(())
	}

	pub fn handle_unsuback(&mut self, unsuback: UnsubAck) -> Result<(), StateError> {
		let Some(state) = self.unsubscribe_state.remove(&unsuback.id) else {
			return Err(StateError::Unsolicited(PacketType::UnsubAck));
		};

		let UnsubscribeState {
			filters,
			response_tx,
		} = state;

		let before = self.subscriptions.len();
		self.subscriptions.retain(|key, _| !filters.contains(key));
		for filter in &filters {
			self.resubscribe_table.remove(filter);
		}
		tracing::debug!(
			removed = before - self.subscriptions.len(),
			remaining = self.subscriptions.len(),
			"processed UnsubAck"
		);

		if response_tx.send(()).is_err() {
			tracing::debug!("response channel for Unsubscribe command closed");
		}

		Ok(())
	}

	/// Finds the best-matching local subscription channel for an inbound
	/// publish's topic, per the highest-scoring filter (most exact levels,
	/// fewest wildcards).
	pub fn find_publish_channel(&self, topic: &str) -> Option<PublishTx> {
		self.subscriptions
			.iter()
			.filter_map(|(filter, channel)| filter.matches_topic(topic).map(|score| (score, channel)))
			.max_by_key(|(score, _)| *score)
			.map(|(_, channel)| channel.clone())
	}

	/// Builds one SUBSCRIBE packet per filter remembered in the resubscribe
	/// table, for a reconnect where the broker reports
	/// `session_present == false`. One packet per topic preserves any
	/// per-topic v5 properties rather than merging them into a single
	/// multi-filter SUBSCRIBE. Each packet reuses the topic's existing live
	/// channel, so messages resume flowing to the same `Subscription` the
	/// caller already holds; the response is discarded since nothing is
	/// waiting on it.
	///
	/// Filters whose original channel is no longer present (e.g. the
	/// `Subscription` was dropped while offline) are skipped rather than
	/// resubscribed.
	pub fn generate_resubscribe(&mut self, packet_ids: &mut PacketIdProvider) -> Vec<Packet> {
		let mut packets = Vec::new();
		for (filter, qos) in self.resubscribe_table.clone() {
			let Some(publish_tx) = self.subscriptions.get(&filter).cloned() else {
				continue;
			};
			let Some(id) = packet_ids.allocate() else {
				tracing::warn!(%filter, "packet ids exhausted while resubscribing");
				break;
			};

			let (response_tx, _response_rx) = oneshot::channel();
			self.subscribe_state.insert(
				id,
				SubscribeState {
					requested_filters: vec![(filter.clone(), qos)],
					already_subscribed: Vec::new(),
					publish_tx,
					response_tx,
				},
			);

			packets.push(
				Subscribe {
					id,
					filters: vec![SubscribeFilter::new(filter, qos)],
					properties: Default::default(),
				}
				.into(),
			);
		}
		packets
	}

	/// Flushes every in-flight SUBSCRIBE/UNSUBSCRIBE handshake with
	/// `Disconnected`: these acks cannot survive a transport close, unlike
	/// QoS ≥ 1 publishes.
	pub fn flush_volatile(&mut self) {
		for (_, state) in self.subscribe_state.drain() {
			let _ = state.response_tx.send(Vec::new());
		}
		for (_, state) in self.unsubscribe_state.drain() {
			let _ = state.response_tx.send(());
		}
	}
}
