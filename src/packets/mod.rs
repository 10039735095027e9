//! Wire packets for MQTT 3.1.1 and 5.0, and the framing codec that turns a
//! byte stream into a sequence of [`Packet`]s.

pub(crate) mod serde;

mod auth;
mod connack;
mod connect;
mod properties;
mod publish;
mod subscribe;

pub use auth::Auth;
pub use connack::ConnAck;
pub use connect::Connect;
pub use properties::Properties;
pub use publish::Publish;
pub use subscribe::{SubAck, Subscribe, Unsubscribe, UnsubAck};

use crate::PacketId;
use bytes::BufMut;
use std::{fmt, io, str::Utf8Error};

/// The MQTT protocol level negotiated for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
	V311,
	V5,
}

impl ProtocolVersion {
	#[inline]
	pub fn level(self) -> u8 {
		match self {
			Self::V311 => 4,
			Self::V5 => 5,
		}
	}

	#[inline]
	pub fn has_properties(self) -> bool {
		matches!(self, Self::V5)
	}
}

impl TryFrom<u8> for ProtocolVersion {
	type Error = ParseError;
	fn try_from(value: u8) -> Result<Self, Self::Error> {
		match value {
			4 => Ok(Self::V311),
			5 => Ok(Self::V5),
			_ => Err(ParseError::UnsupportedProtocolVersion(value)),
		}
	}
}

#[derive(Clone, Debug)]
pub enum Packet {
	Connect(Box<Connect>),
	ConnAck(ConnAck),
	Publish(Box<Publish>),
	PubAck(PubAck),
	PubRec(PubRec),
	PubRel(PubRel),
	PubComp(PubComp),
	Subscribe(Box<Subscribe>),
	SubAck(SubAck),
	Unsubscribe(Box<Unsubscribe>),
	UnsubAck(UnsubAck),
	PingReq,
	PingResp,
	Disconnect(Disconnect),
	Auth(Auth),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
	Connect,
	ConnAck,
	Publish,
	PubAck,
	PubRec,
	PubRel,
	PubComp,
	Subscribe,
	SubAck,
	Unsubscribe,
	UnsubAck,
	PingReq,
	PingResp,
	Disconnect,
	Auth,
}

impl fmt::Display for PacketType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const PUBACK: u8 = 0x40;
const PUBREC: u8 = 0x50;
const PUBREL: u8 = 0x60;
const PUBCOMP: u8 = 0x70;
const SUBSCRIBE: u8 = 0x80;
const SUBACK: u8 = 0x90;
const UNSUBSCRIBE: u8 = 0xa0;
const UNSUBACK: u8 = 0xb0;
const PINGREQ: u8 = 0xc0;
const PINGRESP: u8 = 0xd0;
const DISCONNECT: u8 = 0xe0;
const AUTH: u8 = 0xf0;

impl Packet {
	/// Checks whether a complete packet can be decoded from `src`. If so,
	/// returns the extent (in bytes) of the packet.
	pub fn check(src: &mut io::Cursor<&[u8]>) -> Result<usize, ParseError> {
		let header = serde::get_u8(src)?;
		if header == 0 {
			return Err(ParseError::InvalidHeader);
		}

		let length = serde::get_var(src)?;
		let _ = serde::get_slice(src, length)?;
		Ok(src.position() as usize)
	}

	/// Parses a [`Packet`] from `src`, given the protocol version negotiated
	/// for the session (v5 packets carry a properties section that v3.1.1
	/// packets don't).
	pub fn parse(src: &mut io::Cursor<&[u8]>, protocol: ProtocolVersion) -> Result<Self, ParseError> {
		let header = serde::get_u8(src)?;
		let length = serde::get_var(src)?;
		let payload = serde::get_slice(src, length)?;

		match (header & 0xf0, header & 0x0f) {
			(CONNECT, 0x00) => Ok(Connect::parse(payload)?.into()),
			(CONNACK, 0x00) => Ok(ConnAck::parse(payload, protocol)?.into()),
			(PUBLISH, flags) => Ok(Publish::parse(payload, flags, protocol)?.into()),
			(PUBACK, 0x00) => Ok(PubAck::parse(payload, protocol)?.into()),
			(PUBREC, 0x00) => Ok(PubRec::parse(payload, protocol)?.into()),
			(PUBREL, 0x02) => Ok(PubRel::parse(payload, protocol)?.into()),
			(PUBCOMP, 0x00) => Ok(PubComp::parse(payload, protocol)?.into()),
			(SUBSCRIBE, 0x02) => Ok(Subscribe::parse(payload, protocol)?.into()),
			(SUBACK, 0x00) => Ok(SubAck::parse(payload, protocol)?.into()),
			(UNSUBSCRIBE, 0x02) => Ok(Unsubscribe::parse(payload, protocol)?.into()),
			(UNSUBACK, 0x00) => Ok(UnsubAck::parse(payload, protocol)?.into()),
			(PINGREQ, 0x00) => {
				if !payload.is_empty() {
					return Err(ParseError::MalformedPacket("PingReq must have empty payload"));
				}
				Ok(Packet::PingReq)
			}
			(PINGRESP, 0x00) => {
				if !payload.is_empty() {
					return Err(ParseError::MalformedPacket("PingResp must have empty payload"));
				}
				Ok(Packet::PingResp)
			}
			(DISCONNECT, 0x00) => Ok(Disconnect::parse(payload, protocol)?.into()),
			(AUTH, 0x00) if protocol.has_properties() => Ok(Auth::parse(payload)?.into()),
			_ => Err(ParseError::InvalidHeader),
		}
	}

	pub fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), serde::WriteError> {
		match self {
			Self::Connect(connect) => connect.serialize_to_bytes(dst),
			Self::ConnAck(connack) => connack.serialize_to_bytes(dst),
			Self::Publish(publish) => publish.serialize_to_bytes(dst),
			Self::PubAck(puback) => puback.serialize_to_bytes(dst),
			Self::PubRec(pubrec) => pubrec.serialize_to_bytes(dst),
			Self::PubRel(pubrel) => pubrel.serialize_to_bytes(dst),
			Self::PubComp(pubcomp) => pubcomp.serialize_to_bytes(dst),
			Self::Subscribe(subscribe) => subscribe.serialize_to_bytes(dst),
			Self::SubAck(suback) => suback.serialize_to_bytes(dst),
			Self::Unsubscribe(unsubscribe) => unsubscribe.serialize_to_bytes(dst),
			Self::UnsubAck(unsuback) => unsuback.serialize_to_bytes(dst),
			Self::PingReq => {
				serde::put_u8(dst, PINGREQ)?;
				serde::put_var(dst, 0)
			}
			Self::PingResp => {
				serde::put_u8(dst, PINGRESP)?;
				serde::put_var(dst, 0)
			}
			Self::Disconnect(disconnect) => disconnect.serialize_to_bytes(dst),
			Self::Auth(auth) => auth.serialize_to_bytes(dst),
		}
	}

	#[inline]
	pub fn packet_type(&self) -> PacketType {
		match self {
			Self::Connect(_) => PacketType::Connect,
			Self::ConnAck(_) => PacketType::ConnAck,
			Self::Publish(_) => PacketType::Publish,
			Self::PubAck(_) => PacketType::PubAck,
			Self::PubRec(_) => PacketType::PubRec,
			Self::PubRel(_) => PacketType::PubRel,
			Self::PubComp(_) => PacketType::PubComp,
			Self::Subscribe(_) => PacketType::Subscribe,
			Self::SubAck(_) => PacketType::SubAck,
			Self::Unsubscribe(_) => PacketType::Unsubscribe,
			Self::UnsubAck(_) => PacketType::UnsubAck,
			Self::PingReq => PacketType::PingReq,
			Self::PingResp => PacketType::PingResp,
			Self::Disconnect(_) => PacketType::Disconnect,
			Self::Auth(_) => PacketType::Auth,
		}
	}
}

/// A reason/return code attached to an ACK-style packet. Carries both the
/// numeric value and a human-readable message drawn from the fixed
/// [`crate::error::reason_message`] lookup table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReasonCode(pub u8);

impl ReasonCode {
	pub const SUCCESS: ReasonCode = ReasonCode(0);

	#[inline]
	pub fn is_success(self) -> bool {
		// 0 = Success, 16 = "Success" with conditions (e.g. No matching
		// subscribers); both are non-error outcomes.
		matches!(self.0, 0 | 16)
	}
}

impl Default for ReasonCode {
	#[inline]
	fn default() -> Self {
		Self::SUCCESS
	}
}

impl fmt::Display for ReasonCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} ({})", self.0, crate::error::reason_message(self.0))
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
	#[error("not enough data buffered to parse a complete packet")]
	Incomplete,
	#[error("invalid QoS value")]
	InvalidQoS,
	#[error(transparent)]
	InvalidFilter(#[from] crate::filter::InvalidFilter),
	#[error(transparent)]
	InvalidTopic(#[from] crate::filter::InvalidTopic),
	#[error("invalid packet header")]
	InvalidHeader,
	#[error("packet identifier must be non-zero")]
	ZeroPacketId,
	#[error("malformed variable-length field")]
	MalformedLength,
	#[error("malformed packet: {0}")]
	MalformedPacket(&'static str),
	#[error("packet of {actual} bytes exceeds the {limit}-byte maximum this client advertised")]
	PacketTooLarge { actual: usize, limit: u32 },
	#[error("unsupported property identifier {0:#04x}")]
	UnsupportedProperty(u8),
	#[error("unsupported protocol version {0}")]
	UnsupportedProtocolVersion(u8),
	#[error(transparent)]
	Utf8Error(#[from] Utf8Error),
}

impl From<crate::InvalidQoS> for ParseError {
	#[inline]
	fn from(_: crate::InvalidQoS) -> Self {
		Self::InvalidQoS
	}
}

macro_rules! id_reason_packet {
	($name:ident, $variant:expr, $control:expr, $flags:expr) => {
		#[derive(Clone, Debug)]
		pub struct $name {
			pub id: PacketId,
			pub reason_code: ReasonCode,
			pub properties: Properties,
		}

		impl $name {
			pub fn new(id: PacketId) -> Self {
				Self {
					id,
					reason_code: ReasonCode::SUCCESS,
					properties: Properties::default(),
				}
			}

			pub fn parse(payload: &[u8], protocol: ProtocolVersion) -> Result<Self, ParseError> {
				let mut cursor = io::Cursor::new(payload);
				let id = serde::get_id(&mut cursor)?;

				// Reason code and properties may be omitted entirely when the
				// reason is Success and there are no properties (v5 §3.4.2.1
				// and siblings).
				use bytes::Buf;
				if !cursor.has_remaining() {
					return Ok(Self {
						id,
						reason_code: ReasonCode::SUCCESS,
						properties: Properties::default(),
					});
				}

				let reason_code = ReasonCode(serde::get_u8(&mut cursor)?);
				let properties = if protocol.has_properties() && cursor.has_remaining() {
					Properties::parse(&mut cursor)?
				} else {
					Properties::default()
				};

				Ok(Self {
					id,
					reason_code,
					properties,
				})
			}

			pub fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), serde::WriteError> {
				let has_reason = self.reason_code.0 != 0 || !self.properties.is_empty();
				let len = if has_reason {
					2 + 1 + self.properties.total_len()
				} else {
					2
				};

				serde::put_u8(dst, $control | $flags)?;
				serde::put_var(dst, len)?;
				serde::put_u16(dst, self.id.get())?;
				if has_reason {
					serde::put_u8(dst, self.reason_code.0)?;
					self.properties.serialize_to_bytes(dst)?;
				}
				Ok(())
			}
		}

		impl From<$name> for Packet {
			#[inline]
			fn from(value: $name) -> Packet {
				$variant(value)
			}
		}
	};
}

id_reason_packet!(PubAck, Packet::PubAck, PUBACK, 0x00);
id_reason_packet!(PubRec, Packet::PubRec, PUBREC, 0x00);
id_reason_packet!(PubRel, Packet::PubRel, PUBREL, 0x02);
id_reason_packet!(PubComp, Packet::PubComp, PUBCOMP, 0x00);

#[derive(Clone, Debug, Default)]
pub struct Disconnect {
	pub reason_code: ReasonCode,
	pub properties: Properties,
}

impl Disconnect {
	pub fn new(reason_code: u8) -> Self {
		Self {
			reason_code: ReasonCode(reason_code),
			properties: Properties::default(),
		}
	}

	pub fn parse(payload: &[u8], protocol: ProtocolVersion) -> Result<Self, ParseError> {
		if payload.is_empty() {
			return Ok(Self::default());
		}
		let mut cursor = io::Cursor::new(payload);
		let reason_code = ReasonCode(serde::get_u8(&mut cursor)?);
		let properties = if protocol.has_properties() {
			use bytes::Buf;
			if cursor.has_remaining() {
				Properties::parse(&mut cursor)?
			} else {
				Properties::default()
			}
		} else {
			Properties::default()
		};
		Ok(Self {
			reason_code,
			properties,
		})
	}

	pub fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), serde::WriteError> {
		let has_body = self.reason_code.0 != 0 || !self.properties.is_empty();
		serde::put_u8(dst, DISCONNECT)?;
		if has_body {
			serde::put_var(dst, 1 + self.properties.total_len())?;
			serde::put_u8(dst, self.reason_code.0)?;
			self.properties.serialize_to_bytes(dst)?;
		} else {
			serde::put_var(dst, 0)?;
		}
		Ok(())
	}
}

impl From<Disconnect> for Packet {
	#[inline]
	fn from(value: Disconnect) -> Self {
		Self::Disconnect(value)
	}
}
