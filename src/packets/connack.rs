use super::{serde, Packet, ParseError, Properties, ProtocolVersion, ReasonCode};
use bytes::{Buf, BufMut};
use std::io;

/// A ConnAck packet is sent by the Server to the Client to acknowledge a
/// new session. The Client may send packets to the Server before receiving
/// ConnAck, but the Server shouldn't send any packets to the Client before
/// it.
#[derive(Clone, Debug)]
pub struct ConnAck {
	/// Indicates that the Server has existing session state for the client.
	pub session_present: bool,

	/// CONNACK return code (v3.1.1) or reason code (v5).
	pub code: ReasonCode,

	/// v5 properties: `topicAliasMaximum`, `serverKeepAlive`,
	/// `maximumPacketSize`, etc. Always empty for v3.1.1 sessions.
	pub properties: Properties,
}

impl ConnAck {
	pub fn parse(payload: &[u8], protocol: ProtocolVersion) -> Result<Self, ParseError> {
		let mut cursor = io::Cursor::new(payload);
		let flags = serde::get_u8(&mut cursor)?;
		let code = serde::get_u8(&mut cursor)?;

		if flags & 0xfe != 0 {
			return Err(ParseError::MalformedPacket(
				"upper 7 bits in ConnAck flags must be zero",
			));
		}

		let session_present = flags & 0x01 == 0x01;

		let properties = if protocol.has_properties() && cursor.has_remaining() {
			Properties::parse(&mut cursor)?
		} else {
			Properties::default()
		};

		Ok(Self {
			session_present,
			code: ReasonCode(code),
			properties,
		})
	}

	pub fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), serde::WriteError> {
		let Self {
			session_present,
			code,
			properties,
		} = self;

		serde::put_u8(dst, 0x20)?;
		serde::put_var(dst, 2 + properties.total_len())?;
		serde::put_u8(dst, if *session_present { 0x01 } else { 0x00 })?;
		serde::put_u8(dst, code.0)?;
		properties.serialize_to_bytes(dst)?;
		Ok(())
	}
}

impl From<ConnAck> for Packet {
	#[inline]
	fn from(value: ConnAck) -> Self {
		Self::ConnAck(value)
	}
}
