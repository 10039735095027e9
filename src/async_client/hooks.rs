//! Overridable v5-only session policy hooks, set on [`super::Options`]:
//! the inbound-ack reason-code policy and the inbound AUTH responder.

use crate::packets::Auth;
use crate::QoS;
use bytes::Bytes;
use std::sync::Arc;

/// Consulted for every inbound QoS 1/2 PUBLISH to choose the PUBACK/PUBREC
/// reason code sent back to the broker. The default always returns success
/// (`0`). A code outside [`ACCEPTABLE_ACK_REASON_CODES`] fails the delivery
/// with a protocol error rather than being sent.
pub type AckPolicy = Arc<dyn Fn(&str, &Bytes, QoS) -> u8 + Send + Sync>;

/// Answers an inbound v5 AUTH packet received mid-session. `None` is
/// treated the same as declining to answer: the exchange is refused.
pub type AuthHandler = Arc<dyn Fn(Auth) -> Option<Auth> + Send + Sync>;

/// PUBACK/PUBREC reason codes a broker is willing to see in response to an
/// inbound PUBLISH: Success, No matching subscribers, and the v5 rejection
/// codes (Unspecified error, Implementation specific error, Not authorized,
/// Topic Name invalid, Packet identifier in use, Quota exceeded, Payload
/// format invalid).
pub const ACCEPTABLE_ACK_REASON_CODES: [u8; 9] = [0, 16, 128, 131, 135, 144, 145, 151, 153];

pub fn is_acceptable_ack_reason_code(code: u8) -> bool {
	ACCEPTABLE_ACK_REASON_CODES.contains(&code)
}

pub fn default_ack_policy() -> AckPolicy {
	Arc::new(|_topic, _payload, _qos| 0)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_the_documented_reason_codes() {
		for code in ACCEPTABLE_ACK_REASON_CODES {
			assert!(is_acceptable_ack_reason_code(code));
		}
	}

	#[test]
	fn rejects_everything_else() {
		assert!(!is_acceptable_ack_reason_code(1));
		assert!(!is_acceptable_ack_reason_code(131 + 1));
	}

	#[test]
	fn default_policy_always_succeeds() {
		let policy = default_ack_policy();
		assert_eq!(policy("a/b", &Bytes::new(), QoS::AtLeastOnce), 0);
	}
}
