//! # mqtt-session
//!
//! A client-side session state machine and delivery engine for MQTT 3.1.1
//! and 5.0: packet codec, QoS 0/1/2 delivery protocols, packet-id
//! allocation, persistent outgoing/incoming stores with replay-on-reconnect,
//! v5 topic-alias compression, and automatic reconnection.
//!
//! The transport (TCP, TLS, WebSocket, ...) and concrete `Store` backends
//! beyond the in-memory reference are supplied by the host application.

#[cfg(feature = "async-client")]
pub mod async_client;

pub mod error;
pub mod packet_id;
pub mod packets;
pub mod store;
pub mod topic_alias;

mod filter;
mod misc;
mod qos;

pub use self::{
	error::SessionError,
	filter::{Filter, FilterBuf, InvalidFilter, InvalidTopic},
	misc::{Credentials, Will},
	packet_id::PacketIdProvider,
	packets::{Packet, PacketType},
	qos::{InvalidQoS, QoS},
	topic_alias::{TopicAliasRecv, TopicAliasSend},
};

#[cfg(feature = "async-client")]
pub use self::misc::generate_client_id;

/// MQTT packet identifier: non-zero by construction, 1..=65535.
pub type PacketId = std::num::NonZeroU16;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
