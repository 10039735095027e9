//! The asynchronous, `tokio`-based client: a single session task
//! (`task::client_task`) that owns the transport and protocol state
//! (`state::State`), driven by commands from the public [`client::Client`]
//! handle over an mpsc channel.
//!
//! The session is single-threaded by construction: the task is the one
//! logical thread, and channel sends/receives and timer ticks are its
//! suspension points, so no field of `state::State` needs a lock.

mod client;
mod command;
mod event;
mod hooks;
mod packetstream;
mod state;
mod task;

use crate::{
	misc::{generate_client_id, Credentials, Will},
	packets::ProtocolVersion,
	store::{MemoryStore, Store},
};
use bytes::Bytes;
use std::{fmt, time::Duration};
use tokio::{
	sync::{broadcast, mpsc},
	task::JoinHandle,
};

pub use client::{Client, Message, MessageGuard, Subscription};
pub use event::{Event, Events};
pub use hooks::{AckPolicy, AuthHandler};
pub use state::StateError;

/// Everything the session task needs up front to build its CONNECT packet
/// and govern its lifecycle. The stores are passed separately to
/// [`client_with_stores`] rather than living on this record, since they
/// aren't `Clone`/`Debug` the way the rest of the options are.
#[derive(Clone)]
pub struct Options {
	pub host: String,
	pub port: u16,
	pub tls: bool,

	/// Protocol level to negotiate. v3.1.1 is the conservative default;
	/// v5-only behavior (topic aliasing, enhanced auth, reason codes beyond
	/// the v3.1.1 range) is inert unless this is [`ProtocolVersion::V5`].
	pub protocol_version: ProtocolVersion,

	pub client_id: String,
	pub credentials: Option<Credentials>,
	pub will: Option<Will>,

	/// Seconds; `0` disables the keep-alive ping protocol.
	pub keep_alive: u16,
	/// Reset the keep-alive deadline on every outbound packet, not only on
	/// PINGREQ/PINGRESP.
	pub reschedule_pings: bool,

	/// `clean_start` (v5) / `clean_session` (v3.1.1): discard broker-side
	/// subscription state on connect.
	pub clean_session: bool,
	/// Re-issue SUBSCRIBE for the resubscribe table's topics after a
	/// reconnect that didn't resume a broker-side session.
	pub resubscribe: bool,
	/// Queue QoS 0 publishes made while disconnected instead of failing
	/// them outright.
	pub queue_qos_zero: bool,

	/// How long to wait for CONNACK before treating the attempt as failed.
	pub connect_timeout: Duration,
	/// Delay between reconnect attempts; `Duration::ZERO` disables
	/// automatic reconnection entirely.
	pub reconnect_period: Duration,

	/// This client's receive-side topic alias capacity, advertised to the
	/// broker via the v5 CONNECT `topicAliasMaximum` property.
	pub topic_alias_maximum: u16,
	pub auto_assign_topic_alias: bool,
	pub auto_use_topic_alias: bool,

	/// v5 CONNECT properties.
	pub maximum_packet_size: Option<u32>,
	pub authentication_method: Option<String>,
	pub authentication_data: Option<Bytes>,

	/// v5 only: chooses the PUBACK/PUBREC reason code for every inbound
	/// QoS 1/2 PUBLISH (`customHandleAcks`). Defaults to always-success.
	pub ack_policy: AckPolicy,
	/// v5 only: answers an inbound AUTH packet mid-session (`handleAuth`).
	/// `None` refuses every such exchange.
	pub auth_handler: Option<AuthHandler>,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			host: String::new(),
			port: 1883,
			tls: false,
			protocol_version: ProtocolVersion::V311,
			client_id: generate_client_id(),
			credentials: None,
			will: None,
			keep_alive: 60,
			reschedule_pings: true,
			clean_session: true,
			resubscribe: true,
			queue_qos_zero: true,
			connect_timeout: Duration::from_secs(30),
			reconnect_period: Duration::from_secs(1),
			topic_alias_maximum: 0,
			auto_assign_topic_alias: false,
			auto_use_topic_alias: false,
			maximum_packet_size: None,
			authentication_method: None,
			authentication_data: None,
			ack_policy: hooks::default_ack_policy(),
			auth_handler: None,
		}
	}
}

impl fmt::Debug for Options {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Options")
			.field("host", &self.host)
			.field("port", &self.port)
			.field("tls", &self.tls)
			.field("protocol_version", &self.protocol_version)
			.field("client_id", &self.client_id)
			.field("credentials", &self.credentials)
			.field("will", &self.will)
			.field("keep_alive", &self.keep_alive)
			.field("reschedule_pings", &self.reschedule_pings)
			.field("clean_session", &self.clean_session)
			.field("resubscribe", &self.resubscribe)
			.field("queue_qos_zero", &self.queue_qos_zero)
			.field("connect_timeout", &self.connect_timeout)
			.field("reconnect_period", &self.reconnect_period)
			.field("topic_alias_maximum", &self.topic_alias_maximum)
			.field("auto_assign_topic_alias", &self.auto_assign_topic_alias)
			.field("auto_use_topic_alias", &self.auto_use_topic_alias)
			.field("maximum_packet_size", &self.maximum_packet_size)
			.field("authentication_method", &self.authentication_method)
			.field("authentication_data", &self.authentication_data)
			.field("ack_policy", &"<fn>")
			.field("auth_handler", &self.auth_handler.is_some())
			.finish()
	}
}

impl<H: AsRef<str>> From<(H, u16)> for Options {
	fn from(value: (H, u16)) -> Self {
		let (host, port) = value;
		Self {
			host: host.as_ref().into(),
			port,
			..Default::default()
		}
	}
}

/// Constructs a new asynchronous MQTT client, backed by in-memory
/// outgoing/incoming stores. The returned session task starts connecting
/// immediately.
pub fn client(options: impl Into<Options>) -> (Client, JoinHandle<crate::Result<()>>) {
	client_with_stores(options, Box::new(MemoryStore::new()), Box::new(MemoryStore::new()))
}

/// As [`client`], but with caller-supplied [`Store`] backends for the
/// outgoing (QoS ≥ 1 publish replay) and incoming (QoS 2 receive) message
/// stores, giving a real deployment the durability to survive a process
/// restart, which [`MemoryStore`] does not provide.
pub fn client_with_stores(
	options: impl Into<Options>,
	outgoing_store: Box<dyn Store>,
	incoming_store: Box<dyn Store>,
) -> (Client, JoinHandle<crate::Result<()>>) {
	let (tx, rx) = mpsc::unbounded_channel();
	let (events_tx, _) = broadcast::channel(event::EVENT_CHANNEL_CAPACITY);
	let handle = tokio::spawn(task::client_task(
		options.into(),
		outgoing_store,
		incoming_store,
		rx,
		events_tx.clone(),
	));

	(Client::new(tx, events_tx), handle)
}
