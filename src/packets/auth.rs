use super::{serde, Packet, ParseError, Properties};
use bytes::{Buf, BufMut};
use std::io;

/// A v5-only Auth packet, used to carry data for an extended authentication
/// exchange (e.g. challenge/response) either during Connect processing or
/// to re-authenticate an established session.
#[derive(Clone, Debug, Default)]
pub struct Auth {
	pub reason_code: super::ReasonCode,
	pub properties: Properties,
}

impl Auth {
	pub fn new(reason_code: u8) -> Self {
		Self {
			reason_code: super::ReasonCode(reason_code),
			properties: Properties::default(),
		}
	}

	pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
		if payload.is_empty() {
			return Ok(Self::default());
		}
		let mut cursor = io::Cursor::new(payload);
		let reason_code = super::ReasonCode(serde::get_u8(&mut cursor)?);
		let properties = if cursor.has_remaining() {
			Properties::parse(&mut cursor)?
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
		serde::put_u8(dst, 0xf0)?;
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

impl From<Auth> for Packet {
	#[inline]
	fn from(value: Auth) -> Self {
		Self::Auth(value)
	}
}
