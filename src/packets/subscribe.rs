use super::{serde, Packet, ParseError, Properties, ProtocolVersion, ReasonCode};
use crate::{FilterBuf, PacketId, QoS};
use bytes::{Buf, BufMut};
use std::io;

/// A single filter/options pair within a Subscribe packet. v3.1.1 only ever
/// sets `qos`; the remaining fields are v5 subscription options.
#[derive(Clone, Debug)]
pub struct SubscribeFilter {
	pub filter: FilterBuf,
	pub qos: QoS,
	pub no_local: bool,
	pub retain_as_published: bool,
}

impl SubscribeFilter {
	pub fn new(filter: FilterBuf, qos: QoS) -> Self {
		Self {
			filter,
			qos,
			no_local: false,
			retain_as_published: false,
		}
	}
}

/// A Subscribe packet is sent by the Client to the Server to create or
/// modify a subscription.
#[derive(Clone, Debug)]
pub struct Subscribe {
	pub id: PacketId,
	pub filters: Vec<SubscribeFilter>,
	pub properties: Properties,
}

impl Subscribe {
	pub fn parse(payload: &[u8], protocol: ProtocolVersion) -> Result<Self, ParseError> {
		let mut cursor = io::Cursor::new(payload);
		let id = serde::get_id(&mut cursor)?;

		let properties = if protocol.has_properties() {
			Properties::parse(&mut cursor)?
		} else {
			Properties::default()
		};

		let mut filters = Vec::new();
		while cursor.has_remaining() {
			let filter = FilterBuf::new(serde::get_str(&mut cursor)?.to_owned())?;
			let options = serde::get_u8(&mut cursor)?;
			let qos: QoS = (options & 0x03).try_into()?;
			let no_local = options & 0x04 == 0x04;
			let retain_as_published = options & 0x08 == 0x08;
			filters.push(SubscribeFilter {
				filter,
				qos,
				no_local,
				retain_as_published,
			});
		}

		if filters.is_empty() {
			return Err(ParseError::MalformedPacket(
				"Subscribe must contain at least one filter",
			));
		}

		Ok(Self {
			id,
			filters,
			properties,
		})
	}

	pub fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), serde::WriteError> {
		let filters_len: usize = self
			.filters
			.iter()
			.map(|f| 2 + f.filter.as_str().len() + 1)
			.sum();
		let len = 2 + self.properties.total_len() + filters_len;

		serde::put_u8(dst, 0x80 | 0x02)?;
		serde::put_var(dst, len)?;
		serde::put_u16(dst, self.id.get())?;
		self.properties.serialize_to_bytes(dst)?;

		for entry in &self.filters {
			serde::put_str(dst, entry.filter.as_str())?;
			let mut options = entry.qos as u8;
			if entry.no_local {
				options |= 0x04;
			}
			if entry.retain_as_published {
				options |= 0x08;
			}
			serde::put_u8(dst, options)?;
		}

		Ok(())
	}
}

impl From<Subscribe> for Packet {
	#[inline]
	fn from(value: Subscribe) -> Self {
		Self::Subscribe(Box::new(value))
	}
}

/// A SubAck packet is sent by the Server to the Client to acknowledge a
/// Subscribe packet, one reason code per requested filter, in order.
#[derive(Clone, Debug)]
pub struct SubAck {
	pub id: PacketId,
	pub reason_codes: Vec<ReasonCode>,
	pub properties: Properties,
}

impl SubAck {
	pub fn new(id: PacketId, reason_codes: Vec<ReasonCode>) -> Self {
		Self {
			id,
			reason_codes,
			properties: Properties::default(),
		}
	}

	pub fn parse(payload: &[u8], protocol: ProtocolVersion) -> Result<Self, ParseError> {
		let mut cursor = io::Cursor::new(payload);
		let id = serde::get_id(&mut cursor)?;

		let properties = if protocol.has_properties() {
			Properties::parse(&mut cursor)?
		} else {
			Properties::default()
		};

		let mut reason_codes = Vec::new();
		while cursor.has_remaining() {
			reason_codes.push(ReasonCode(serde::get_u8(&mut cursor)?));
		}

		if reason_codes.is_empty() {
			return Err(ParseError::MalformedPacket(
				"SubAck must contain at least one reason code",
			));
		}

		Ok(Self {
			id,
			reason_codes,
			properties,
		})
	}

	pub fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), serde::WriteError> {
		let len = 2 + self.properties.total_len() + self.reason_codes.len();

		serde::put_u8(dst, 0x90)?;
		serde::put_var(dst, len)?;
		serde::put_u16(dst, self.id.get())?;
		self.properties.serialize_to_bytes(dst)?;
		for code in &self.reason_codes {
			serde::put_u8(dst, code.0)?;
		}

		Ok(())
	}
}

impl From<SubAck> for Packet {
	#[inline]
	fn from(value: SubAck) -> Self {
		Self::SubAck(value)
	}
}

/// An Unsubscribe packet is sent by the Client to the Server to remove one
/// or more existing subscriptions.
#[derive(Clone, Debug)]
pub struct Unsubscribe {
	pub id: PacketId,
	pub filters: Vec<FilterBuf>,
	pub properties: Properties,
}

impl Unsubscribe {
	pub fn parse(payload: &[u8], protocol: ProtocolVersion) -> Result<Self, ParseError> {
		let mut cursor = io::Cursor::new(payload);
		let id = serde::get_id(&mut cursor)?;

		let properties = if protocol.has_properties() {
			Properties::parse(&mut cursor)?
		} else {
			Properties::default()
		};

		let mut filters = Vec::new();
		while cursor.has_remaining() {
			filters.push(FilterBuf::new(serde::get_str(&mut cursor)?.to_owned())?);
		}

		if filters.is_empty() {
			return Err(ParseError::MalformedPacket(
				"Unsubscribe must contain at least one filter",
			));
		}

		Ok(Self {
			id,
			filters,
			properties,
		})
	}

	pub fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), serde::WriteError> {
		let filters_len: usize = self.filters.iter().map(|f| 2 + f.as_str().len()).sum();
		let len = 2 + self.properties.total_len() + filters_len;

		serde::put_u8(dst, 0xa0 | 0x02)?;
		serde::put_var(dst, len)?;
		serde::put_u16(dst, self.id.get())?;
		self.properties.serialize_to_bytes(dst)?;
		for filter in &self.filters {
			serde::put_str(dst, filter.as_str())?;
		}

		Ok(())
	}
}

impl From<Unsubscribe> for Packet {
	#[inline]
	fn from(value: Unsubscribe) -> Self {
		Self::Unsubscribe(Box::new(value))
	}
}

/// An UnsubAck packet is sent by the Server to the Client to acknowledge an
/// Unsubscribe packet. v3.1.1 has no payload beyond the packet identifier;
/// v5 carries one reason code per requested filter.
#[derive(Clone, Debug)]
pub struct UnsubAck {
	pub id: PacketId,
	pub reason_codes: Vec<ReasonCode>,
	pub properties: Properties,
}

impl UnsubAck {
	pub fn new(id: PacketId, reason_codes: Vec<ReasonCode>) -> Self {
		Self {
			id,
			reason_codes,
			properties: Properties::default(),
		}
	}

	pub fn parse(payload: &[u8], protocol: ProtocolVersion) -> Result<Self, ParseError> {
		let mut cursor = io::Cursor::new(payload);
		let id = serde::get_id(&mut cursor)?;

		if !protocol.has_properties() {
			return Ok(Self {
				id,
				reason_codes: Vec::new(),
				properties: Properties::default(),
			});
		}

		let properties = Properties::parse(&mut cursor)?;

		let mut reason_codes = Vec::new();
		while cursor.has_remaining() {
			reason_codes.push(ReasonCode(serde::get_u8(&mut cursor)?));
		}

		Ok(Self {
			id,
			reason_codes,
			properties,
		})
	}

	pub fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), serde::WriteError> {
		if self.reason_codes.is_empty() && self.properties.is_empty() {
			serde::put_u8(dst, 0xb0)?;
			serde::put_var(dst, 2)?;
			serde::put_u16(dst, self.id.get())?;
			return Ok(());
		}

		let len = 2 + self.properties.total_len() + self.reason_codes.len();
		serde::put_u8(dst, 0xb0)?;
		serde::put_var(dst, len)?;
		serde::put_u16(dst, self.id.get())?;
		self.properties.serialize_to_bytes(dst)?;
		for code in &self.reason_codes {
			serde::put_u8(dst, code.0)?;
		}

		Ok(())
	}
}

impl From<UnsubAck> for Packet {
	#[inline]
	fn from(value: UnsubAck) -> Self {
		Self::UnsubAck(value)
	}
}
