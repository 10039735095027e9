//! The crate's error taxonomy: the [`SessionError`] type returned from the
//! public client API, and [`reason_message`], the fixed lookup table behind
//! [`ReasonCode`](crate::packets::ReasonCode)'s `Display` impl.

use crate::packets::ParseError;
use thiserror::Error;

/// Errors surfaced to callers of the async client's public API.
#[derive(Debug, Error)]
pub enum SessionError {
	#[error("not connected to a broker")]
	NotConnected,
	#[error("session task has shut down")]
	Disconnected,
	#[error("packet exceeds the broker's maximum packet size")]
	PacketTooLarge,
	#[error("no packet identifiers available; too many in-flight QoS 1/2 messages")]
	PacketIdsExhausted,
	#[error("invalid topic filter: {0}")]
	InvalidFilter(#[from] crate::filter::InvalidFilter),
	#[error("invalid topic name: {0}")]
	InvalidTopic(#[from] crate::filter::InvalidTopic),
	#[error("broker rejected the request: {0}")]
	Rejected(crate::packets::ReasonCode),
	#[error("no in-flight outgoing message with that packet id")]
	NotInFlight,
	#[error("topic alias is out of range for this session's negotiated maximum")]
	TopicAliasOutOfRange,
	#[error("failed to decode a packet from the broker: {0}")]
	Protocol(#[from] ParseError),
	#[error("persistent store error: {0}")]
	Store(#[source] Box<dyn std::error::Error + Send + Sync>),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// Looks up the human-readable description for a CONNACK return code
/// (v3.1.1) or a v5 reason code. The v3.1.1 and v5 tables share the same
/// low values by design; codes above that range are v5-only.
pub fn reason_message(code: u8) -> &'static str {
	match code {
		0 => "Success",
		1 => "Unacceptable protocol version",
		2 => "Identifier rejected",
		3 => "Server unavailable",
		4 => "Bad user name or password",
		5 => "Not authorized",
		16 => "No matching subscribers",
		17 => "No subscription existed",
		24 => "Continue authentication",
		25 => "Re-authenticate",
		128 => "Unspecified error",
		129 => "Malformed packet",
		130 => "Protocol error",
		131 => "Implementation specific error",
		132 => "Unsupported protocol version",
		133 => "Client identifier not valid",
		134 => "Bad user name or password",
		135 => "Not authorized",
		136 => "Server unavailable",
		137 => "Server busy",
		138 => "Banned",
		139 => "Server shutting down",
		140 => "Bad authentication method",
		141 => "Keep alive timeout",
		142 => "Session taken over",
		143 => "Topic filter invalid",
		144 => "Topic name invalid",
		145 => "Packet identifier in use",
		146 => "Packet identifier not found",
		147 => "Receive maximum exceeded",
		148 => "Topic alias invalid",
		149 => "Packet too large",
		150 => "Message rate too high",
		151 => "Quota exceeded",
		152 => "Administrative action",
		153 => "Payload format invalid",
		154 => "Retain not supported",
		155 => "QoS not supported",
		156 => "Use another server",
		157 => "Server moved",
		158 => "Shared subscriptions not supported",
		159 => "Connection rate exceeded",
		160 => "Maximum connect time",
		161 => "Subscription identifiers not supported",
		162 => "Wildcard subscriptions not supported",
		_ => "Unknown reason code",
	}
}

#[cfg(test)]
mod tests {
	use super::reason_message;

	#[test]
	fn known_codes_have_messages() {
		assert_eq!(reason_message(0), "Success");
		assert_eq!(reason_message(135), "Not authorized");
		assert_eq!(reason_message(162), "Wildcard subscriptions not supported");
	}

	#[test]
	fn unknown_codes_fall_back() {
		assert_eq!(reason_message(200), "Unknown reason code");
	}
}
