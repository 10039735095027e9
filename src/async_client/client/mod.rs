//! The public facade: `publish`, `subscribe`, `unsubscribe`, `end`,
//! `reconnect`, `remove_outgoing_message`, `get_last_message_id`. Every
//! call is a message sent to the session task over an unbounded mpsc
//! channel; the task is the sole owner of protocol and transport state, so
//! these methods never touch it directly.

use super::command::{
	Command, CommandTx, PublishCommand, ResponseRx, SubscribeCommand, UnsubscribeCommand,
};
use super::event::{EventTx, Events};
use crate::{filter::validate_topic, packets::Properties, FilterBuf, PacketId, QoS, SessionError};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

mod subscription;
pub use subscription::{Message, MessageGuard, Subscription};

impl<T> From<mpsc::error::SendError<T>> for SessionError {
	fn from(_: mpsc::error::SendError<T>) -> Self {
		SessionError::Disconnected
	}
}

impl From<oneshot::error::RecvError> for SessionError {
	fn from(_: oneshot::error::RecvError) -> Self {
		SessionError::Disconnected
	}
}

async fn recv<T>(rx: ResponseRx<T>) -> Result<T, SessionError> {
	rx.await.map_err(Into::into)
}

/// A handle to a running session task. Cheaply `Clone`-able; every clone
/// shares the same underlying session.
#[derive(Clone, Debug)]
pub struct Client {
	tx: CommandTx,
	events: EventTx,
}

impl Client {
	pub(crate) fn new(tx: CommandTx, events: EventTx) -> Self {
		Self { tx, events }
	}

	/// Subscribes to the session's lifecycle and wire-level events
	/// (`connect`, `reconnect`, `offline`, `close`, `disconnect`, `end`,
	/// `error`, `packetsend`, `packetreceive`, `outgoingEmpty`). Each call
	/// returns an independent subscriber; none of them can block the
	/// session or one another.
	pub fn events(&self) -> Events {
		Events::new(self.events.subscribe())
	}

	/// Publishes `payload` to `topic`. `topic` is validated (no wildcards,
	/// non-empty, ≤ 65,535 bytes) before the command reaches the session task.
	#[tracing::instrument(skip(self, payload), ret, err)]
	pub async fn publish(
		&self,
		topic: impl Into<String> + std::fmt::Debug,
		payload: impl Into<Bytes>,
		qos: QoS,
		retain: bool,
	) -> Result<(), SessionError> {
		self.publish_with_properties(topic, payload, qos, retain, Properties::default()).await
	}

	/// As [`publish`](Self::publish), but also takes v5 publish properties
	/// (user properties, authentication data carried alongside a message, or
	/// a caller-chosen topic alias via `properties.topic_alias`). A
	/// caller-supplied alias takes priority over the session's own
	/// auto-assign/auto-use policy and fails with
	/// [`SessionError::TopicAliasOutOfRange`] if it's outside the broker's
	/// advertised range or no alias registry was negotiated at all.
	#[tracing::instrument(skip(self, payload, properties), ret, err)]
	pub async fn publish_with_properties(
		&self,
		topic: impl Into<String> + std::fmt::Debug,
		payload: impl Into<Bytes>,
		qos: QoS,
		retain: bool,
		properties: Properties,
	) -> Result<(), SessionError> {
		let topic = topic.into();
		validate_topic(&topic)?;

		let (response_tx, response_rx) = oneshot::channel();
		self.tx.send(Command::Publish(PublishCommand {
			topic,
			payload: payload.into(),
			qos,
			retain,
			properties,
			response_tx,
		}))?;
		recv(response_rx).await?
	}

	/// Subscribes to every filter, returning a live [`Subscription`]. Each
	/// filter was already validated at construction time by [`crate::FilterBuf::new`].
	#[tracing::instrument(skip(self), ret, err)]
	pub async fn subscribe(&self, filters: Vec<(FilterBuf, QoS)>) -> Result<Subscription, SessionError> {
		let (response_tx, response_rx) = oneshot::channel();
		let (publish_tx, publish_rx) = mpsc::channel(32);
		self.tx.send(Command::Subscribe(SubscribeCommand {
			filters,
			publish_tx,
			response_tx,
		}))?;

		let granted = recv(response_rx).await?;
		Ok(Subscription::new(granted, publish_rx, self.tx.clone()))
	}

	/// Unsubscribes from every filter.
	#[tracing::instrument(skip(self), ret, err)]
	pub async fn unsubscribe(&self, filters: Vec<FilterBuf>) -> Result<(), SessionError> {
		let (response_tx, response_rx) = oneshot::channel();
		self.tx.send(Command::Unsubscribe(UnsubscribeCommand {
			filters,
			response_tx,
		}))?;
		recv(response_rx).await
	}

	/// Ends the session. `force=true` abandons any in-flight QoS ≥ 1
	/// publishes immediately; `force=false` gives them a short grace period
	/// to complete first.
	#[tracing::instrument(skip(self), ret, err)]
	pub async fn end(&self, force: bool) -> Result<(), SessionError> {
		let (response_tx, response_rx) = oneshot::channel();
		self.tx.send(Command::End { force, response_tx })?;
		recv(response_rx).await
	}

	/// Forces an immediate reconnect attempt, bypassing the current
	/// hold-off wait. A no-op if the session has already ended.
	pub fn reconnect(&self) -> Result<(), SessionError> {
		self.tx.send(Command::Reconnect).map_err(Into::into)
	}

	/// Drops bookkeeping for a still in-flight QoS ≥ 1 publish and deletes
	/// it from the outgoing store, without waiting for the broker to
	/// acknowledge it. The original `publish` call's future then resolves
	/// with [`SessionError::Disconnected`].
	#[tracing::instrument(skip(self), ret, err)]
	pub async fn remove_outgoing_message(&self, id: PacketId) -> Result<(), SessionError> {
		let (response_tx, response_rx) = oneshot::channel();
		self.tx.send(Command::RemoveOutgoingMessage { id, response_tx })?;
		if recv(response_rx).await? {
			Ok(())
		} else {
			Err(SessionError::NotInFlight)
		}
	}

	/// The most recently allocated outbound packet id, if any.
	pub async fn get_last_message_id(&self) -> Result<Option<PacketId>, SessionError> {
		let (response_tx, response_rx) = oneshot::channel();
		self.tx.send(Command::GetLastMessageId { response_tx })?;
		recv(response_rx).await
	}

	/// Ends the session, abandoning any in-flight operations immediately.
	/// Equivalent to `end(true)`, provided as a convenience for callers
	/// that don't need to observe completion.
	pub async fn disconnect(self) -> Result<(), SessionError> {
		self.end(true).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_client(tx: CommandTx) -> Client {
		let (events, _) = tokio::sync::broadcast::channel(16);
		Client::new(tx, events)
	}

	fn spawn_fake_task(mut rx: mpsc::UnboundedReceiver<Command>) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			while let Some(command) = rx.recv().await {
				match command {
					Command::Publish(cmd) => {
						let _ = cmd.response_tx.send(Ok(()));
					}
					Command::GetLastMessageId { response_tx } => {
						let _ = response_tx.send(None);
					}
					Command::End { response_tx, .. } => {
						let _ = response_tx.send(());
						return;
					}
					_ => {}
				}
			}
		})
	}

	#[tokio::test]
	async fn publish_rejects_wildcard_topic_before_reaching_the_task() {
		let (tx, rx) = mpsc::unbounded_channel();
		let _task = spawn_fake_task(rx);
		let client = test_client(tx);
		let result = client.publish("a/+/b", Bytes::new(), QoS::AtMostOnce, false).await;
		assert!(matches!(result, Err(SessionError::InvalidTopic(_))));
	}

	#[tokio::test]
	async fn publish_round_trips_through_the_command_channel() {
		let (tx, rx) = mpsc::unbounded_channel();
		let task = spawn_fake_task(rx);
		let client = test_client(tx);
		client
			.publish("a/b", Bytes::from_static(b"hi"), QoS::AtMostOnce, false)
			.await
			.unwrap();
		client.end(true).await.unwrap();
		task.await.unwrap();
	}

	#[tokio::test]
	async fn publish_with_properties_carries_a_caller_supplied_topic_alias() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let client = test_client(tx);
		let properties = Properties {
			topic_alias: Some(7),
			..Default::default()
		};
		let sent = tokio::spawn({
			let properties = properties.clone();
			async move {
				client
					.publish_with_properties("a/b", Bytes::from_static(b"hi"), QoS::AtMostOnce, false, properties)
					.await
			}
		});

		let Command::Publish(cmd) = rx.recv().await.unwrap() else {
			panic!("expected a Publish command");
		};
		assert_eq!(cmd.properties.topic_alias, Some(7));
		let _ = cmd.response_tx.send(Ok(()));
		sent.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn calls_fail_with_disconnected_once_the_task_is_gone() {
		let (tx, rx) = mpsc::unbounded_channel();
		drop(rx);
		let client = test_client(tx);
		let result = client.get_last_message_id().await;
		assert!(matches!(result, Err(SessionError::Disconnected)));
	}
}
