//! The session task: one connection attempt at a time, driven by a
//! reconnect loop around [`HoldOff`], with [`State`] as the protocol brain
//! and [`PacketStream`] as the framing codec over whatever transport
//! `connect_and_handshake` hands back.

use crate::async_client::{
	command::{Command, CommandRx},
	event::{emit, Event, EventTx},
	packetstream::PacketStream,
	state::{State, StateError},
	Options,
};
use crate::{
	packets::{ConnAck, Connect, Disconnect, ParseError, Properties},
	store::Store,
	Packet,
};
use std::time::Duration;
use tokio::{
	io::{AsyncRead, AsyncWrite},
	net::TcpStream,
	time::{self, Instant},
};

mod holdoff;
use self::holdoff::HoldOff;

const HOLDOFF_MIN: Duration = Duration::from_millis(50);
const READ_BUFFER_LEN: usize = 8 * 1024;
/// Grace period `end(force: false)` gives in-flight QoS ≥ 1 deliveries to
/// drain before the session sends DISCONNECT regardless.
const END_GRACE_PERIOD: Duration = Duration::from_secs(5);

trait AsyncReadWrite: AsyncRead + AsyncWrite + Send {}
impl AsyncReadWrite for TcpStream {}
#[cfg(feature = "tls")]
impl AsyncReadWrite for tokio_rustls::client::TlsStream<TcpStream> {}

type Transport = Box<dyn AsyncReadWrite + Unpin>;

/// Drives a session for as long as the `Client` handle exists: connects,
/// replays the outgoing store, then alternates between serving commands
/// and incoming packets until the connection drops, `end` is called, or
/// the handle (and with it `rx`) is dropped.
#[tracing::instrument(skip_all, err)]
pub async fn client_task(
	options: Options,
	outgoing_store: Box<dyn Store>,
	incoming_store: Box<dyn Store>,
	mut rx: CommandRx,
	events: EventTx,
) -> crate::Result<()> {
	let mut state = State::new(
		outgoing_store,
		incoming_store,
		options.topic_alias_maximum,
		options.auto_assign_topic_alias,
		options.auto_use_topic_alias,
		options.queue_qos_zero,
	)
	.with_ack_policy(options.ack_policy.clone());
	if let Some(auth_handler) = options.auth_handler.clone() {
		state = state.with_auth_handler(auth_handler);
	}

	let ceiling = options.reconnect_period.max(HOLDOFF_MIN);
	let mut holdoff = HoldOff::new(HOLDOFF_MIN..ceiling);
	let mut first_connection = true;

	'reconnect: loop {
		if options.reconnect_period.is_zero() && !first_connection {
			tracing::debug!("automatic reconnection disabled; ending session");
			return Ok(());
		}

		if first_connection {
			holdoff.increase_with(|delay| delay * 2);
		} else {
			emit(&events, Event::Reconnect);
			holdoff.wait_and_increase_with(|delay| delay * 2).await;
		}

		let (mut stream, connack) = match connect_and_handshake(&options, &events).await {
			Ok(Some(connected)) => connected,
			Ok(None) => continue,
			Err(error) => {
				tracing::warn!(%error, "connect attempt failed");
				emit(&events, Event::Error(error.to_string()));
				continue;
			}
		};
		holdoff.reset();
		first_connection = false;
		let session_present = connack.session_present;
		emit(&events, Event::Connect(connack));

		state.clear_packet_ids();
		state.clear_topic_alias_recv();
		state.set_online(true);

		if let Err(error) = flush_offline_queue(&mut state, &mut stream, &events).await {
			tracing::warn!(%error, "failed writing queued offline packets");
			state.set_online(false);
			state.flush_volatile();
			emit(&events, Event::Offline);
			continue 'reconnect;
		}

		if let Err(error) = flush_replay(&mut state, &mut stream, &events).await {
			tracing::warn!(%error, "failed writing replayed packets");
			state.set_online(false);
			state.flush_volatile();
			emit(&events, Event::Offline);
			continue 'reconnect;
		}

		if options.resubscribe {
			let resubscribe_packets = state.connected(session_present);
			if let Err(error) = write_all(&mut stream, &resubscribe_packets, &events).await {
				tracing::warn!(%error, "failed writing resubscribe packets");
				state.set_online(false);
				state.flush_volatile();
				emit(&events, Event::Offline);
				continue 'reconnect;
			}
		}

		if state.outgoing_in_flight_is_empty() {
			emit(&events, Event::OutgoingEmpty);
		}

		match run_session(&mut stream, &mut state, &mut rx, &options, &events).await {
			SessionOutcome::Ended => {
				emit(&events, Event::End);
				return Ok(());
			}
			SessionOutcome::HandleDropped => return Ok(()),
			SessionOutcome::Closed => {
				state.set_online(false);
				state.flush_volatile();
				state.clear_topic_alias_recv();
				emit(&events, Event::Close);
				emit(&events, Event::Offline);
			}
		}
	}
}

enum SessionOutcome {
	/// `end` completed; the task should exit.
	Ended,
	/// The `Client` handle (and `rx`) was dropped.
	HandleDropped,
	/// The connection was lost or a protocol error forced a disconnect;
	/// the outer loop should reconnect.
	Closed,
}

/// Serves commands and incoming packets until the connection closes or
/// `end` is called.
async fn run_session(
	stream: &mut PacketStream<Transport>,
	state: &mut State,
	rx: &mut CommandRx,
	options: &Options,
	events: &EventTx,
) -> SessionOutcome {
	let keep_alive = Duration::from_secs(options.keep_alive as u64);
	let mut deadline = Instant::now() + keep_alive;
	let mut ping_pending = false;

	loop {
		tokio::select! {
			command = rx.recv() => {
				let Some(command) = command else {
					return SessionOutcome::HandleDropped;
				};
				tracing::trace!(?command, "client command");

				match command {
					Command::Reconnect => return SessionOutcome::Closed,
					Command::End { force, response_tx } => {
						if !force {
							wait_for_drain(stream, state, events).await;
						}
						let _ = write_packet(stream, &Disconnect::default().into(), events).await;
						let _ = response_tx.send(());
						return SessionOutcome::Ended;
					}
					other => {
						for packet in state.process_client_command(other) {
							if reschedule_after_write(stream, &packet, options, &mut deadline, events).await.is_err() {
								return SessionOutcome::Closed;
							}
						}
						if state.outgoing_in_flight_is_empty() {
							emit(events, Event::OutgoingEmpty);
						}
					}
				}
			}

			packet = stream.read_packet() => {
				match packet {
					Ok(Some(packet)) => {
						emit(events, Event::PacketReceive(packet.clone()));
						if matches!(packet, Packet::PingResp) {
							ping_pending = false;
						}
						if let Packet::Disconnect(disconnect) = &packet {
							emit(events, Event::Disconnect(disconnect.clone()));
						}
						match state.process_incoming_packet(packet).await {
							Ok(Some(reply)) => {
								if reschedule_after_write(stream, &reply, options, &mut deadline, events).await.is_err() {
									return SessionOutcome::Closed;
								}
								if state.outgoing_in_flight_is_empty() {
									emit(events, Event::OutgoingEmpty);
								}
							}
							Ok(None) => {}
							Err(error) => {
								tracing::warn!(%error, "protocol error; disconnecting");
								emit(events, Event::Error(error.to_string()));
								let _ = write_packet(stream, &Disconnect::new(protocol_error_reason(&error)).into(), events).await;
								return SessionOutcome::Closed;
							}
						}
					}
					Ok(None) => {
						tracing::info!("connection closed by broker");
						return SessionOutcome::Closed;
					}
					Err(error) => {
						if let Some(ParseError::PacketTooLarge { .. }) = error.downcast_ref::<ParseError>() {
							let _ = write_packet(stream, &Disconnect::new(149).into(), events).await;
						}
						tracing::warn!(%error, "read failed; disconnecting");
						emit(events, Event::Error(error.to_string()));
						return SessionOutcome::Closed;
					}
				}
			}

			_ = time::sleep_until(deadline), if options.keep_alive > 0 => {
				if ping_pending {
					tracing::warn!("keep-alive timeout; no PingResp from broker");
					return SessionOutcome::Closed;
				}
				ping_pending = true;
				if write_packet(stream, &Packet::PingReq, events).await.is_err() {
					return SessionOutcome::Closed;
				}
				deadline = Instant::now() + keep_alive;
			}
		}
	}
}

fn protocol_error_reason(error: &StateError) -> u8 {
	match error {
		StateError::Unsolicited(_) => 130,
		StateError::InvalidPacket => 130,
		StateError::ProtocolError(_) => 130,
		StateError::DeliveryFailure(_) => 131,
	}
}

/// Writes `packet`, resetting the keep-alive deadline if `reschedule_pings`
/// is set (every outbound packet counts as activity, not only PINGREQ).
async fn reschedule_after_write(
	stream: &mut PacketStream<Transport>,
	packet: &Packet,
	options: &Options,
	deadline: &mut Instant,
	events: &EventTx,
) -> crate::Result<()> {
	write_packet(stream, packet, events).await?;
	if options.reschedule_pings && options.keep_alive > 0 {
		*deadline = Instant::now() + Duration::from_secs(options.keep_alive as u64);
	}
	Ok(())
}

async fn write_packet(stream: &mut PacketStream<Transport>, packet: &Packet, events: &EventTx) -> crate::Result<()> {
	stream.write_packet(packet).await?;
	emit(events, Event::PacketSend(packet.clone()));
	Ok(())
}

async fn write_all(stream: &mut PacketStream<Transport>, packets: &[Packet], events: &EventTx) -> crate::Result<()> {
	for packet in packets {
		write_packet(stream, packet, events).await?;
	}
	Ok(())
}

/// Transmits everything queued while disconnected, before replay starts, so
/// offline publishes keep their relative order ahead of retransmitted ones.
async fn flush_offline_queue(
	state: &mut State,
	stream: &mut PacketStream<Transport>,
	events: &EventTx,
) -> crate::Result<()> {
	for packet in state.drain_offline_queue() {
		write_packet(stream, &packet, events).await?;
	}
	Ok(())
}

/// Transmits everything the outgoing store holds before admitting new
/// commands. The store-processing interlock itself lives in `State`; this
/// only walks the two halves of it.
async fn flush_replay(state: &mut State, stream: &mut PacketStream<Transport>, events: &EventTx) -> crate::Result<()> {
	for packet in state.begin_replay() {
		write_packet(stream, &packet, events).await?;
	}
	for packet in state.end_replay() {
		write_packet(stream, &packet, events).await?;
	}
	Ok(())
}

/// Gives in-flight QoS ≥ 1 deliveries up to [`END_GRACE_PERIOD`] to
/// complete, continuing to service the broker's acks while it waits.
async fn wait_for_drain(stream: &mut PacketStream<Transport>, state: &mut State, events: &EventTx) {
	let deadline = Instant::now() + END_GRACE_PERIOD;
	while !state.outgoing_in_flight_is_empty() {
		tokio::select! {
			packet = stream.read_packet() => {
				match packet {
					Ok(Some(packet)) => {
						emit(events, Event::PacketReceive(packet.clone()));
						if let Ok(Some(reply)) = state.process_incoming_packet(packet).await {
							let _ = write_packet(stream, &reply, events).await;
						}
					}
					_ => break,
				}
			}
			_ = time::sleep_until(deadline) => {
				tracing::debug!("grace period expired with deliveries still in flight");
				break;
			}
		}
	}
}

/// Opens the transport, sends CONNECT and waits for CONNACK within
/// `options.connect_timeout`. Returns `Ok(None)` for a failure the caller
/// should just retry after the next hold-off; `Err` is reserved for
/// configuration errors (e.g. TLS requested without the feature) that
/// won't be fixed by retrying.
///
/// A `Command::End` arriving during this window isn't observed until the
/// next reconnect attempt; the window is a handful of round trips, and
/// racing it against the handshake would complicate the one place in this
/// task that's still a straight line.
async fn connect_and_handshake(
	options: &Options,
	events: &EventTx,
) -> crate::Result<Option<(PacketStream<Transport>, ConnAck)>> {
	let tcp = match TcpStream::connect((options.host.as_str(), options.port)).await {
		Ok(tcp) => tcp,
		Err(error) => {
			tracing::debug!(%error, "tcp connect failed");
			return Ok(None);
		}
	};
	tcp.set_nodelay(true).ok();

	let transport: Transport = if options.tls {
		connect_tls(options, tcp).await?
	} else {
		Box::new(tcp)
	};

	let mut stream = PacketStream::new(transport, READ_BUFFER_LEN, options.protocol_version);
	stream.set_max_packet_size(options.maximum_packet_size);

	let connect = build_connect(options);
	if let Err(error) = write_packet(&mut stream, &connect, events).await {
		tracing::debug!(%error, "failed to send Connect");
		return Ok(None);
	}

	match time::timeout(options.connect_timeout, wait_for_connack(&mut stream, events)).await {
		Ok(Ok(Some(connack))) => {
			tracing::info!(session_present = connack.session_present, code = %connack.code, "connected");
			Ok(Some((stream, connack)))
		}
		Ok(Ok(None)) => {
			tracing::debug!("connection closed before ConnAck");
			Ok(None)
		}
		Ok(Err(error)) => {
			tracing::debug!(%error, "connect rejected");
			Ok(None)
		}
		Err(_) => {
			tracing::debug!("timed out waiting for ConnAck");
			Ok(None)
		}
	}
}

async fn wait_for_connack(stream: &mut PacketStream<Transport>, events: &EventTx) -> crate::Result<Option<ConnAck>> {
	loop {
		match stream.read_packet().await? {
			Some(Packet::ConnAck(connack)) if connack.code.is_success() => {
				emit(events, Event::PacketReceive(Packet::ConnAck(connack.clone())));
				return Ok(Some(connack));
			}
			Some(Packet::ConnAck(connack)) => {
				emit(events, Event::PacketReceive(Packet::ConnAck(connack.clone())));
				return Err(format!("broker rejected Connect: {}", connack.code).into());
			}
			Some(other) => return Err(format!("unexpected packet before ConnAck: {other:?}").into()),
			None => return Ok(None),
		}
	}
}

/// Translates session options into a CONNECT packet. The one place
/// `Options` becomes a wire packet.
fn build_connect(options: &Options) -> Packet {
	let mut properties = Properties::default();
	if options.protocol_version.has_properties() {
		properties.topic_alias_maximum = (options.topic_alias_maximum > 0).then_some(options.topic_alias_maximum);
		properties.maximum_packet_size = options.maximum_packet_size;
		properties.authentication_method = options.authentication_method.clone();
		properties.authentication_data = options.authentication_data.clone();
	}

	Connect {
		protocol_version: options.protocol_version,
		client_id: options.client_id.clone(),
		keep_alive: options.keep_alive,
		clean_start: options.clean_session,
		will: options.will.clone(),
		credentials: options.credentials.clone(),
		properties,
	}
	.into()
}

#[cfg(feature = "tls")]
async fn connect_tls(options: &Options, tcp: TcpStream) -> crate::Result<Transport> {
	use std::sync::Arc;
	use tokio_rustls::{rustls::ServerName, TlsConnector};

	let connector = TlsConnector::from(Arc::clone(tls::config()));
	let server_name = ServerName::try_from(options.host.as_str())
		.map_err(|_| format!("'{}' is not a valid DNS name for TLS", options.host))?;

	let stream = connector.connect(server_name, tcp).await?;
	Ok(Box::new(stream))
}

#[cfg(not(feature = "tls"))]
async fn connect_tls(_options: &Options, _tcp: TcpStream) -> crate::Result<Transport> {
	Err("TLS was requested but this build doesn't have the `tls` feature enabled".into())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		async_client::command::PublishCommand,
		packets::{Publish, ProtocolVersion},
		store::MemoryStore,
		PacketType, QoS,
	};
	use bytes::Bytes;

	impl AsyncReadWrite for tokio::io::DuplexStream {}

	fn test_stream() -> (PacketStream<Transport>, PacketStream<tokio::io::DuplexStream>) {
		let (client, server) = tokio::io::duplex(4096);
		let transport: Transport = Box::new(client);
		(
			PacketStream::new(transport, READ_BUFFER_LEN, ProtocolVersion::V311),
			PacketStream::new(server, READ_BUFFER_LEN, ProtocolVersion::V311),
		)
	}

	#[test]
	fn protocol_error_reason_maps_each_state_error() {
		assert_eq!(protocol_error_reason(&StateError::Unsolicited(PacketType::PubAck)), 130);
		assert_eq!(protocol_error_reason(&StateError::InvalidPacket), 130);
		assert_eq!(protocol_error_reason(&StateError::ProtocolError("bad")), 130);

		let publish = Publish::AtMostOnce {
			retain: false,
			topic: "a/b".into(),
			payload: Bytes::new(),
			properties: Default::default(),
		};
		assert_eq!(protocol_error_reason(&StateError::DeliveryFailure(Box::new(publish))), 131);
	}

	#[test]
	fn build_connect_carries_v5_properties_only_under_v5() {
		let mut options = Options {
			protocol_version: ProtocolVersion::V311,
			topic_alias_maximum: 4,
			..Default::default()
		};

		match build_connect(&options) {
			Packet::Connect(connect) => assert!(connect.properties.topic_alias_maximum.is_none()),
			_ => panic!("expected a Connect packet"),
		}

		options.protocol_version = ProtocolVersion::V5;
		match build_connect(&options) {
			Packet::Connect(connect) => assert_eq!(connect.properties.topic_alias_maximum, Some(4)),
			_ => panic!("expected a Connect packet"),
		}
	}

	#[tokio::test]
	async fn flush_offline_queue_writes_queued_packets_before_returning() {
		let mut state = State::new(Box::new(MemoryStore::new()), Box::new(MemoryStore::new()), 0, false, false, true);
		let (response_tx, _response_rx) = tokio::sync::oneshot::channel();
		state.process_client_command(Command::Publish(PublishCommand {
			topic: "a/b".into(),
			payload: Bytes::from_static(b"hi"),
			qos: QoS::AtMostOnce,
			retain: false,
			properties: Default::default(),
			response_tx,
		}));
		state.set_online(true);

		let (mut client_side, mut server_side) = test_stream();
		let (events, _) = tokio::sync::broadcast::channel(16);
		flush_offline_queue(&mut state, &mut client_side, &events).await.unwrap();

		let packet = server_side.read_packet().await.unwrap();
		assert!(matches!(packet, Some(Packet::Publish(_))));
	}

	#[tokio::test]
	async fn flush_replay_resends_stored_publishes_with_duplicate_set() {
		let mut outgoing_store = MemoryStore::new();
		let id = crate::PacketId::new(1).unwrap();
		outgoing_store
			.put(
				id,
				Publish::AtLeastOnce {
					id,
					retain: false,
					duplicate: false,
					topic: "a/b".into(),
					payload: Bytes::from_static(b"hi"),
					properties: Default::default(),
				}
				.into(),
			)
			.unwrap();

		let mut state = State::new(Box::new(outgoing_store), Box::new(MemoryStore::new()), 0, false, false, false);

		let (mut client_side, mut server_side) = test_stream();
		let (events, _) = tokio::sync::broadcast::channel(16);
		flush_replay(&mut state, &mut client_side, &events).await.unwrap();

		match server_side.read_packet().await.unwrap() {
			Some(Packet::Publish(publish)) => assert!(publish.duplicate()),
			other => panic!("expected a replayed Publish, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn run_session_emits_packetsend_and_packetreceive() {
		let mut state = State::new(Box::new(MemoryStore::new()), Box::new(MemoryStore::new()), 0, false, false, false);
		state.set_online(true);
		let (mut client_side, mut server_side) = test_stream();
		let (events_tx, mut events_rx) = tokio::sync::broadcast::channel(16);
		let (_cmd_tx, mut cmd_rx) = tokio::sync::mpsc::unbounded_channel();
		let options = Options::default();

		// run_session only returns once the connection drops or the
		// handle disappears, neither of which happens here; drive it in
		// the background and abort once the exchange has been observed.
		let session = tokio::spawn(async move {
			run_session(&mut client_side, &mut state, &mut cmd_rx, &options, &events_tx).await;
		});

		server_side.write_packet(&Packet::PingResp).await.unwrap();
		time::sleep(Duration::from_millis(50)).await;
		session.abort();

		let mut saw_receive = false;
		while let Ok(event) = events_rx.try_recv() {
			if matches!(event, Event::PacketReceive(Packet::PingResp)) {
				saw_receive = true;
			}
		}
		assert!(saw_receive);
	}
}

#[cfg(feature = "tls")]
mod tls {
	use std::sync::{Arc, OnceLock};
	use tokio_rustls::rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore};

	pub fn config() -> &'static Arc<ClientConfig> {
		static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
		CONFIG.get_or_init(|| {
			let mut root_cert_store = RootCertStore::empty();
			root_cert_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
				OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
			}));

			Arc::new(
				ClientConfig::builder()
					.with_safe_defaults()
					.with_root_certificates(root_cert_store)
					.with_no_client_auth(),
			)
		})
	}
}
