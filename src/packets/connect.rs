use super::{serde, ParseError, Packet, Properties, ProtocolVersion};
use crate::misc::{Credentials, Will};
use crate::QoS;
use bytes::{BufMut, Bytes};
use std::io;

const DEFAULT_PROTOCOL_NAME: &str = "MQTT";

/// A `Connect` packet is sent by the Client to the Server to initiate a
/// session.
#[derive(Clone, Debug)]
pub struct Connect {
	pub protocol_version: ProtocolVersion,
	pub client_id: String,
	pub keep_alive: u16,
	pub clean_start: bool,
	pub will: Option<Will>,
	pub credentials: Option<Credentials>,
	pub properties: Properties,
}

impl Default for Connect {
	fn default() -> Self {
		Self {
			protocol_version: ProtocolVersion::V311,
			client_id: String::new(),
			keep_alive: 0,
			clean_start: true,
			will: None,
			credentials: None,
			properties: Properties::default(),
		}
	}
}

impl Connect {
	pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
		let mut cursor = io::Cursor::new(payload);
		match serde::get_str(&mut cursor)? {
			DEFAULT_PROTOCOL_NAME => {}
			_ => return Err(ParseError::MalformedPacket("invalid protocol name")),
		};

		let protocol_version = ProtocolVersion::try_from(serde::get_u8(&mut cursor)?)?;
		let flags = serde::get_u8(&mut cursor)?;
		let keep_alive = serde::get_u16(&mut cursor)?;

		let properties = if protocol_version.has_properties() {
			Properties::parse(&mut cursor)?
		} else {
			Properties::default()
		};

		let client_id = serde::get_str(&mut cursor)?.to_owned();

		let clean_start = flags & 0x02 == 0x02;
		let will = if flags & 0x04 == 0x04 {
			if protocol_version.has_properties() {
				let _ = Properties::parse(&mut cursor)?;
			}
			let topic = serde::get_str(&mut cursor)?.to_owned();
			let len = serde::get_u16(&mut cursor)? as usize;
			let payload = Bytes::copy_from_slice(serde::get_slice(&mut cursor, len)?);
			let qos: QoS = ((flags & 0x18) >> 3).try_into()?;
			let retain = flags & 0x20 == 0x20;

			Some(Will {
				topic,
				payload,
				qos,
				retain,
			})
		} else {
			None
		};

		let credentials = if flags & 0x80 == 0x80 {
			let username = serde::get_str(&mut cursor)?.to_owned();
			let password = if flags & 0x40 == 0x40 {
				Some(serde::get_str(&mut cursor)?.to_owned())
			} else {
				None
			};
			Some(Credentials { username, password })
		} else {
			None
		};

		Ok(Self {
			protocol_version,
			client_id,
			keep_alive,
			clean_start,
			will,
			credentials,
			properties,
		})
	}

	pub fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), serde::WriteError> {
		serde::put_u8(dst, 0x10)?;
		serde::put_var(dst, self.payload_len())?;

		serde::put_str(dst, DEFAULT_PROTOCOL_NAME)?;
		serde::put_u8(dst, self.protocol_version.level())?;
		serde::put_u8(dst, self.flags())?;
		serde::put_u16(dst, self.keep_alive)?;

		if self.protocol_version.has_properties() {
			self.properties.serialize_to_bytes(dst)?;
		}

		serde::put_str(dst, &self.client_id)?;

		if let Some(will) = &self.will {
			serde::put_str(dst, &will.topic)?;
			serde::put_u16(dst, will.payload.len() as u16)?;
			serde::put_slice(dst, &will.payload)?;
		}

		if let Some(credentials) = &self.credentials {
			serde::put_str(dst, &credentials.username)?;
			if let Some(password) = &credentials.password {
				serde::put_str(dst, password)?;
			}
		}

		Ok(())
	}

	fn payload_len(&self) -> usize {
		let mut len = 2 + DEFAULT_PROTOCOL_NAME.len() + 4 + (2 + self.client_id.len());

		if self.protocol_version.has_properties() {
			len += self.properties.total_len();
		}

		if let Some(will) = &self.will {
			len += 2 + will.topic.len() + 2 + will.payload.len();
		}

		if let Some(credentials) = &self.credentials {
			len += 2 + credentials.username.len();
			if let Some(password) = &credentials.password {
				len += 2 + password.len();
			}
		}

		len
	}

	fn flags(&self) -> u8 {
		let mut flags = 0;

		if self.clean_start {
			flags |= 0x02;
		}

		if let Some(will) = &self.will {
			flags |= 0x04;
			flags |= (will.qos as u8) << 3;
			if will.retain {
				flags |= 0x20;
			}
		}

		if let Some(credentials) = &self.credentials {
			flags |= 0x80;
			if credentials.password.is_some() {
				flags |= 0x40;
			}
		}

		flags
	}
}

impl From<Connect> for Packet {
	#[inline]
	fn from(value: Connect) -> Self {
		Self::Connect(Box::new(value))
	}
}
