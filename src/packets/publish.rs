use super::{serde, Packet, ParseError, Properties, ProtocolVersion};
use crate::{PacketId, QoS};
use bytes::{Buf, BufMut, Bytes};
use std::{fmt, io};

const PUBLISH_HEADER_CONTROL: u8 = 0x30;
const PUBLISH_HEADER_RETAIN_FLAG: u8 = 0x01;
const PUBLISH_HEADER_DUPLICATE_FLAG: u8 = 0x08;
const PUBLISH_HEADER_QOS_MASK: u8 = 0x06;

/// An application message delivered in either direction, tagged by the QoS
/// it was sent with. QoS 0 carries no packet identifier; QoS 1/2 do.
#[derive(Clone)]
pub enum Publish {
	AtMostOnce {
		retain: bool,
		topic: String,
		payload: Bytes,
		properties: Properties,
	},
	AtLeastOnce {
		id: PacketId,
		retain: bool,
		duplicate: bool,
		topic: String,
		payload: Bytes,
		properties: Properties,
	},
	ExactlyOnce {
		id: PacketId,
		retain: bool,
		duplicate: bool,
		topic: String,
		payload: Bytes,
		properties: Properties,
	},
}

impl Publish {
	pub fn parse(payload: &[u8], flags: u8, protocol: ProtocolVersion) -> Result<Self, ParseError> {
		let mut cursor = io::Cursor::new(payload);
		let retain = flags & PUBLISH_HEADER_RETAIN_FLAG == PUBLISH_HEADER_RETAIN_FLAG;
		let duplicate = flags & PUBLISH_HEADER_DUPLICATE_FLAG == PUBLISH_HEADER_DUPLICATE_FLAG;
		let qos: QoS = ((flags & PUBLISH_HEADER_QOS_MASK) >> 1).try_into()?;

		let topic = serde::get_str(&mut cursor)?.to_owned();

		let id = match qos {
			QoS::AtMostOnce => None,
			_ => Some(serde::get_id(&mut cursor)?),
		};

		let properties = if protocol.has_properties() {
			Properties::parse(&mut cursor)?
		} else {
			Properties::default()
		};

		let remaining = cursor.remaining();
		let body = Bytes::copy_from_slice(serde::get_slice(&mut cursor, remaining)?);

		Ok(match (qos, id) {
			(QoS::AtMostOnce, _) => {
				if duplicate {
					return Err(ParseError::MalformedPacket(
						"duplicate flag must be 0 for Publish packets with QoS of AtMostOnce",
					));
				}
				Self::AtMostOnce {
					retain,
					topic,
					payload: body,
					properties,
				}
			}
			(QoS::AtLeastOnce, Some(id)) => Self::AtLeastOnce {
				id,
				retain,
				duplicate,
				topic,
				payload: body,
				properties,
			},
			(QoS::ExactlyOnce, Some(id)) => Self::ExactlyOnce {
				id,
				retain,
				duplicate,
				topic,
				payload: body,
				properties,
			},
			_ => unreachable!("QoS 1/2 always carries a packet id"),
		})
	}

	pub fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), serde::WriteError> {
		let header_flags = (self.retain().then_some(PUBLISH_HEADER_RETAIN_FLAG).unwrap_or(0))
			| (self.duplicate().then_some(PUBLISH_HEADER_DUPLICATE_FLAG).unwrap_or(0))
			| (self.qos() as u8) << 1;

		let id_len = if self.id().is_some() { 2 } else { 0 };
		let properties_len = self.properties().total_len();
		let len = 2 + self.topic().len() + id_len + properties_len + self.payload().len();

		serde::put_u8(dst, PUBLISH_HEADER_CONTROL | header_flags)?;
		serde::put_var(dst, len)?;
		serde::put_str(dst, self.topic())?;
		if let Some(id) = self.id() {
			serde::put_u16(dst, id.get())?;
		}
		self.properties().serialize_to_bytes(dst)?;
		serde::put_slice(dst, self.payload())?;

		Ok(())
	}

	/// Returns the topic of the Publish packet. Empty when a v5 topic alias
	/// is being used in place of the topic string.
	#[inline]
	pub fn topic(&self) -> &str {
		match self {
			Self::AtMostOnce { topic, .. } => topic,
			Self::AtLeastOnce { topic, .. } => topic,
			Self::ExactlyOnce { topic, .. } => topic,
		}
	}

	#[inline]
	pub fn set_topic(&mut self, new_topic: String) {
		match self {
			Self::AtMostOnce { topic, .. } => *topic = new_topic,
			Self::AtLeastOnce { topic, .. } => *topic = new_topic,
			Self::ExactlyOnce { topic, .. } => *topic = new_topic,
		}
	}

	#[inline]
	pub fn payload(&self) -> &Bytes {
		match self {
			Self::AtMostOnce { payload, .. } => payload,
			Self::AtLeastOnce { payload, .. } => payload,
			Self::ExactlyOnce { payload, .. } => payload,
		}
	}

	#[inline]
	pub fn qos(&self) -> QoS {
		match self {
			Self::AtMostOnce { .. } => QoS::AtMostOnce,
			Self::AtLeastOnce { .. } => QoS::AtLeastOnce,
			Self::ExactlyOnce { .. } => QoS::ExactlyOnce,
		}
	}

	#[inline]
	pub fn retain(&self) -> bool {
		match self {
			Self::AtMostOnce { retain, .. } => *retain,
			Self::AtLeastOnce { retain, .. } => *retain,
			Self::ExactlyOnce { retain, .. } => *retain,
		}
	}

	/// Returns the Packet ID of the Publish packet; always `None` for QoS 0.
	#[inline]
	pub fn id(&self) -> Option<PacketId> {
		match self {
			Self::AtMostOnce { .. } => None,
			Self::AtLeastOnce { id, .. } => Some(*id),
			Self::ExactlyOnce { id, .. } => Some(*id),
		}
	}

	/// Returns the duplicate flag; always `false` for QoS 0.
	#[inline]
	pub fn duplicate(&self) -> bool {
		match self {
			Self::AtMostOnce { .. } => false,
			Self::AtLeastOnce { duplicate, .. } => *duplicate,
			Self::ExactlyOnce { duplicate, .. } => *duplicate,
		}
	}

	#[inline]
	pub fn set_duplicate(&mut self, value: bool) {
		match self {
			Self::AtMostOnce { .. } => {}
			Self::AtLeastOnce { duplicate, .. } => *duplicate = value,
			Self::ExactlyOnce { duplicate, .. } => *duplicate = value,
		}
	}

	#[inline]
	pub fn properties(&self) -> &Properties {
		match self {
			Self::AtMostOnce { properties, .. } => properties,
			Self::AtLeastOnce { properties, .. } => properties,
			Self::ExactlyOnce { properties, .. } => properties,
		}
	}

	#[inline]
	pub fn properties_mut(&mut self) -> &mut Properties {
		match self {
			Self::AtMostOnce { properties, .. } => properties,
			Self::AtLeastOnce { properties, .. } => properties,
			Self::ExactlyOnce { properties, .. } => properties,
		}
	}

	/// Clones the packet with its v5 topic alias property removed and the
	/// given topic substituted, for persisting into the outgoing store
	/// without relying on an alias the broker may not remember after a
	/// reconnect.
	pub fn clone_for_store(&self, full_topic: &str) -> Self {
		let mut clone = match self {
			Self::AtMostOnce {
				retain,
				payload,
				properties,
				..
			} => Self::AtMostOnce {
				retain: *retain,
				topic: full_topic.to_owned(),
				payload: payload.clone(),
				properties: properties.clone(),
			},
			Self::AtLeastOnce {
				id,
				retain,
				duplicate,
				payload,
				properties,
				..
			} => Self::AtLeastOnce {
				id: *id,
				retain: *retain,
				duplicate: *duplicate,
				topic: full_topic.to_owned(),
				payload: payload.clone(),
				properties: properties.clone(),
			},
			Self::ExactlyOnce {
				id,
				retain,
				duplicate,
				payload,
				properties,
				..
			} => Self::ExactlyOnce {
				id: *id,
				retain: *retain,
				duplicate: *duplicate,
				topic: full_topic.to_owned(),
				payload: payload.clone(),
				properties: properties.clone(),
			},
		};
		clone.properties_mut().topic_alias = None;
		clone
	}
}

impl fmt::Debug for Publish {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Publish")
			.field("id", &self.id())
			.field("qos", &self.qos())
			.field("retain", &self.retain())
			.field("duplicate", &self.duplicate())
			.field("topic", &self.topic())
			.field("payload length", &self.payload().len())
			.finish()
	}
}

impl From<Publish> for Packet {
	#[inline]
	fn from(value: Publish) -> Self {
		Self::Publish(Box::new(value))
	}
}
