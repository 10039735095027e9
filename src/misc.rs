use bytes::Bytes;

use crate::QoS;

#[derive(Clone, Debug)]
pub struct Credentials {
	pub username: String,
	pub password: Option<String>,
}

impl From<String> for Credentials {
	fn from(username: String) -> Self {
		Self {
			username,
			password: None,
		}
	}
}

impl From<&str> for Credentials {
	fn from(username: &str) -> Self {
		Self {
			username: String::from(username),
			password: None,
		}
	}
}

impl From<(String, String)> for Credentials {
	fn from((username, password): (String, String)) -> Self {
		Self {
			username,
			password: Some(password),
		}
	}
}

impl From<(&str, &str)> for Credentials {
	fn from((username, password): (&str, &str)) -> Self {
		Self {
			username: String::from(username),
			password: Some(String::from(password)),
		}
	}
}

#[derive(Clone, Debug)]
pub struct Will {
	pub topic: String,
	pub payload: Bytes,
	pub qos: QoS,
	pub retain: bool,
}

/// Generates a default client id of the form `"mqttjs_" + 8 hex chars`.
///
/// The broker ultimately assigns the session identity; this only needs to
/// be probably-unique, not cryptographically secure.
#[cfg(feature = "async-client")]
pub fn generate_client_id() -> String {
	use rand::RngCore;

	let mut bytes = [0u8; 4];
	rand::rngs::OsRng.fill_bytes(&mut bytes);
	format!("mqttjs_{:02x}{:02x}{:02x}{:02x}", bytes[0], bytes[1], bytes[2], bytes[3])
}
