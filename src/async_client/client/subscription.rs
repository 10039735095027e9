use crate::async_client::{
	command::{Command, CommandTx, UnsubscribeCommand},
	state::PublishRx,
};
use crate::{FilterBuf, PacketId, QoS, SessionError};
use bytes::Bytes;
use std::ops;
use tokio::sync::oneshot;

/// A single delivered application message.
#[derive(Debug)]
pub struct Message {
	pub topic: String,
	pub payload: Bytes,
}

/// A QoS 2 delivery awaiting completion. Dropping or [`complete`]ing it
/// sends the local [`Command::PublishComplete`] signal that lets the
/// session answer the broker's PUBREL with PUBCOMP. Other traffic keeps
/// flowing while a guard is held; only this one delivery's PUBCOMP waits.
///
/// [`complete`]: MessageGuard::complete
#[derive(Debug)]
pub struct MessageGuard {
	msg: Option<Message>,
	sig: Option<(PacketId, CommandTx)>,
}

/// A live subscription to one or more topic filters, created by
/// [`Client::subscribe`](super::Client::subscribe).
#[derive(Debug)]
pub struct Subscription {
	tx: CommandTx,
	rx: PublishRx,
	filters: Vec<(FilterBuf, QoS)>,
}

impl Subscription {
	pub(crate) fn new(filters: Vec<(FilterBuf, QoS)>, rx: PublishRx, tx: CommandTx) -> Self {
		Self { tx, rx, filters }
	}

	/// Receives the next message delivered to this subscription.
	///
	/// # Example
	/// ```ignore
	/// let mut subscription = client.subscribe(vec![("a/b".try_into()?, QoS::AtMostOnce)]).await?;
	/// while let Some(message) = subscription.recv().await {
	///     println!("{}: {:?}", &message.topic, &message.payload[..]);
	/// }
	/// ```
	pub async fn recv(&mut self) -> Option<MessageGuard> {
		let Some(next_message) = self.rx.recv().await else {
			// All matching senders were closed; the Drop impl would just
			// resend an unsubscribe the task is no longer listening for.
			self.filters.drain(..);
			return None;
		};

		match next_message {
			crate::packets::Publish::AtMostOnce { topic, payload, .. } => Some(MessageGuard {
				msg: Some(Message { topic, payload }),
				sig: None,
			}),
			crate::packets::Publish::AtLeastOnce { topic, payload, .. } => Some(MessageGuard {
				msg: Some(Message { topic, payload }),
				sig: None,
			}),
			crate::packets::Publish::ExactlyOnce {
				topic, payload, id, ..
			} => Some(MessageGuard {
				msg: Some(Message { topic, payload }),
				sig: Some((id, self.tx.clone())),
			}),
		}
	}

	/// Unsubscribes every filter held by this subscription. Doesn't return
	/// until the broker's UNSUBACK has been processed.
	#[tracing::instrument(ret, err)]
	pub async fn unsubscribe(mut self) -> Result<(), SessionError> {
		let (response_tx, response_rx) = oneshot::channel();

		let filters = self.filters.drain(..).map(|(f, _)| f).collect();
		self.tx.send(Command::Unsubscribe(UnsubscribeCommand {
			filters,
			response_tx,
		}))?;

		response_rx.await?;
		Ok(())
	}

	/// The filters this subscription currently covers, with their granted
	/// QoS.
	pub fn filters(&self) -> &[(FilterBuf, QoS)] {
		&self.filters
	}
}

impl MessageGuard {
	/// Marks the message as complete and returns its contents. For QoS 2
	/// deliveries, this sends the PUBCOMP that completes the handshake.
	pub fn complete(mut self) -> Message {
		if let Some((id, tx)) = self.sig.take() {
			let _ = tx.send(Command::PublishComplete { id });
		}
		self.msg.take().expect("msg is only taken once, here or in Drop")
	}
}

impl Drop for MessageGuard {
	fn drop(&mut self) {
		if let Some((id, tx)) = self.sig.take() {
			let _ = tx.send(Command::PublishComplete { id });
		}
	}
}

impl ops::Deref for MessageGuard {
	type Target = Message;
	fn deref(&self) -> &Self::Target {
		self.msg.as_ref().expect("msg is only taken on completion")
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if !self.filters.is_empty() {
			let (tx, _) = oneshot::channel();
			let _ = self.tx.send(Command::Unsubscribe(UnsubscribeCommand {
				filters: self.filters.drain(..).map(|(f, _)| f).collect(),
				response_tx: tx,
			}));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::sync::mpsc;

	fn id(n: u16) -> PacketId {
		PacketId::new(n).unwrap()
	}

	#[test]
	fn complete_sends_publish_complete_for_qos_two() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let guard = MessageGuard {
			msg: Some(Message {
				topic: "a/b".into(),
				payload: Bytes::from_static(b"hi"),
			}),
			sig: Some((id(1), tx)),
		};
		let message = guard.complete();
		assert_eq!(message.topic, "a/b");
		match rx.try_recv() {
			Ok(Command::PublishComplete { id: received }) => assert_eq!(received, id(1)),
			other => panic!("expected PublishComplete, got {other:?}"),
		}
	}

	#[test]
	fn dropping_an_uncompleted_qos_two_guard_still_sends_publish_complete() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let guard = MessageGuard {
			msg: Some(Message {
				topic: "a/b".into(),
				payload: Bytes::from_static(b"hi"),
			}),
			sig: Some((id(1), tx)),
		};
		drop(guard);
		assert!(matches!(rx.try_recv(), Ok(Command::PublishComplete { .. })));
	}

	#[test]
	fn qos_zero_guard_never_sends_publish_complete() {
		let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
		let guard = MessageGuard {
			msg: Some(Message {
				topic: "a/b".into(),
				payload: Bytes::new(),
			}),
			sig: None,
		};
		drop(guard);
		drop(tx);
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn dropping_a_subscription_with_live_filters_sends_unsubscribe() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let (_publish_tx, publish_rx) = mpsc::channel(1);
		let filter = FilterBuf::new("a/b").unwrap();
		let subscription = Subscription::new(vec![(filter, QoS::AtMostOnce)], publish_rx, tx);
		drop(subscription);
		assert!(matches!(rx.recv().await, Some(Command::Unsubscribe(_))));
	}
}
