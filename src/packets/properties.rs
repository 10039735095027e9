//! MQTT 5.0 "Properties", the variable-header extension that carries
//! topic aliasing, authentication data, and the other v5-only fields
//! referenced throughout the session state machine.
//!
//! Only the subset of property identifiers the session engine actually
//! reads or writes are modelled; an unrecognized identifier on the wire is
//! a [`ParseError::MalformedPacket`] rather than being silently skipped,
//! since we don't track the value-type table for the full v5 property set.

use super::{serde, ParseError};
use bytes::{BufMut, Bytes};
use std::io;

const PROP_SERVER_KEEP_ALIVE: u8 = 0x13;
const PROP_AUTHENTICATION_METHOD: u8 = 0x15;
const PROP_AUTHENTICATION_DATA: u8 = 0x16;
const PROP_REASON_STRING: u8 = 0x1f;
const PROP_TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
const PROP_TOPIC_ALIAS: u8 = 0x23;
const PROP_USER_PROPERTY: u8 = 0x26;
const PROP_MAXIMUM_PACKET_SIZE: u8 = 0x27;

/// The set of v5 properties understood by this crate, shared across every
/// packet kind that may carry properties. Fields not relevant to a given
/// packet kind are simply left `None`/empty by that packet's constructor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
	pub server_keep_alive: Option<u16>,
	pub authentication_method: Option<String>,
	pub authentication_data: Option<Bytes>,
	pub reason_string: Option<String>,
	pub topic_alias_maximum: Option<u16>,
	pub topic_alias: Option<u16>,
	pub maximum_packet_size: Option<u32>,
	pub user_properties: Vec<(String, String)>,
}

impl Properties {
	pub fn is_empty(&self) -> bool {
		self == &Properties::default()
	}

	pub fn encoded_len(&self) -> usize {
		let mut len = 0;
		if self.server_keep_alive.is_some() {
			len += 1 + 2;
		}
		if let Some(method) = &self.authentication_method {
			len += 1 + 2 + method.len();
		}
		if let Some(data) = &self.authentication_data {
			len += 1 + 2 + data.len();
		}
		if let Some(reason) = &self.reason_string {
			len += 1 + 2 + reason.len();
		}
		if self.topic_alias_maximum.is_some() {
			len += 1 + 2;
		}
		if self.topic_alias.is_some() {
			len += 1 + 2;
		}
		if self.maximum_packet_size.is_some() {
			len += 1 + 4;
		}
		for (key, value) in &self.user_properties {
			len += 1 + 2 + key.len() + 2 + value.len();
		}
		len
	}

	/// Total encoded size, including the leading variable-length prefix.
	pub fn total_len(&self) -> usize {
		let body = self.encoded_len();
		serde::var_len(body) + body
	}

	pub fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), serde::WriteError> {
		serde::put_var(dst, self.encoded_len())?;

		if let Some(keep_alive) = self.server_keep_alive {
			serde::put_u8(dst, PROP_SERVER_KEEP_ALIVE)?;
			serde::put_u16(dst, keep_alive)?;
		}
		if let Some(method) = &self.authentication_method {
			serde::put_u8(dst, PROP_AUTHENTICATION_METHOD)?;
			serde::put_str(dst, method)?;
		}
		if let Some(data) = &self.authentication_data {
			serde::put_u8(dst, PROP_AUTHENTICATION_DATA)?;
			serde::put_u16(dst, data.len() as u16)?;
			serde::put_slice(dst, data)?;
		}
		if let Some(reason) = &self.reason_string {
			serde::put_u8(dst, PROP_REASON_STRING)?;
			serde::put_str(dst, reason)?;
		}
		if let Some(max) = self.topic_alias_maximum {
			serde::put_u8(dst, PROP_TOPIC_ALIAS_MAXIMUM)?;
			serde::put_u16(dst, max)?;
		}
		if let Some(alias) = self.topic_alias {
			serde::put_u8(dst, PROP_TOPIC_ALIAS)?;
			serde::put_u16(dst, alias)?;
		}
		if let Some(max) = self.maximum_packet_size {
			serde::put_u8(dst, PROP_MAXIMUM_PACKET_SIZE)?;
			serde::put_u32(dst, max)?;
		}
		for (key, value) in &self.user_properties {
			serde::put_u8(dst, PROP_USER_PROPERTY)?;
			serde::put_str(dst, key)?;
			serde::put_str(dst, value)?;
		}

		Ok(())
	}

	pub fn parse(src: &mut io::Cursor<&[u8]>) -> Result<Self, ParseError> {
		let len = serde::get_var(src)?;
		let end = src.position() as usize + len;
		let mut properties = Properties::default();

		while (src.position() as usize) < end {
			match serde::get_u8(src)? {
				PROP_SERVER_KEEP_ALIVE => {
					properties.server_keep_alive = Some(serde::get_u16(src)?);
				}
				PROP_AUTHENTICATION_METHOD => {
					properties.authentication_method = Some(serde::get_str(src)?.to_owned());
				}
				PROP_AUTHENTICATION_DATA => {
					let data_len = serde::get_u16(src)? as usize;
					properties.authentication_data =
						Some(Bytes::copy_from_slice(serde::get_slice(src, data_len)?));
				}
				PROP_REASON_STRING => {
					properties.reason_string = Some(serde::get_str(src)?.to_owned());
				}
				PROP_TOPIC_ALIAS_MAXIMUM => {
					properties.topic_alias_maximum = Some(serde::get_u16(src)?);
				}
				PROP_TOPIC_ALIAS => {
					properties.topic_alias = Some(serde::get_u16(src)?);
				}
				PROP_MAXIMUM_PACKET_SIZE => {
					properties.maximum_packet_size = Some(serde::get_u32(src)?);
				}
				PROP_USER_PROPERTY => {
					let key = serde::get_str(src)?.to_owned();
					let value = serde::get_str(src)?.to_owned();
					properties.user_properties.push((key, value));
				}
				other => {
					return Err(ParseError::UnsupportedProperty(other));
				}
			}
		}

		Ok(properties)
	}
}
