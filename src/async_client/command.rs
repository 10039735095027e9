use crate::{
	packets::{Properties, Publish},
	FilterBuf, PacketId, QoS, SessionError,
};
use bytes::Bytes;
use tokio::sync::{
	mpsc::{self, UnboundedReceiver, UnboundedSender},
	oneshot,
};

pub type CommandTx = UnboundedSender<Command>;
pub type CommandRx = UnboundedReceiver<Command>;

/// A response channel for a command that the session task may have to defer
/// behind store replay; `send` is a no-op if the caller has stopped
/// listening.
pub type ResponseTx<T> = oneshot::Sender<T>;
pub type ResponseRx<T> = oneshot::Receiver<T>;

#[derive(Debug)]
pub enum Command {
	Publish(PublishCommand),
	Subscribe(SubscribeCommand),
	Unsubscribe(UnsubscribeCommand),
	PublishComplete { id: PacketId },
	/// Removes a QoS ≥ 1 outgoing message that is still in flight, without
	/// waiting for the broker to acknowledge it.
	RemoveOutgoingMessage {
		id: PacketId,
		response_tx: ResponseTx<bool>,
	},
	/// Forces an immediate reconnect attempt, bypassing the current
	/// hold-off wait.
	Reconnect,
	/// Ends the session. `force=true` abandons in-flight operations
	/// immediately; `force=false` waits for the in-flight table to drain.
	End {
		force: bool,
		response_tx: ResponseTx<()>,
	},
	/// `getLastMessageId`: the most recently allocated outbound packet id.
	GetLastMessageId { response_tx: ResponseTx<Option<PacketId>> },
}

#[derive(Debug)]
pub struct PublishCommand {
	pub topic: String,
	pub payload: Bytes,
	pub qos: QoS,
	pub retain: bool,
	/// v5 publish properties, including a caller-chosen topic alias
	/// (`properties.topic_alias`), which takes priority over whatever
	/// auto-assign/auto-use policy the session is otherwise configured with.
	pub properties: Properties,
	pub response_tx: ResponseTx<Result<(), SessionError>>,
}

#[derive(Debug)]
pub struct SubscribeCommand {
	pub filters: Vec<(FilterBuf, QoS)>,
	pub publish_tx: mpsc::Sender<Publish>,
	pub response_tx: ResponseTx<Vec<(FilterBuf, QoS)>>,
}

#[derive(Debug)]
pub struct UnsubscribeCommand {
	pub filters: Vec<FilterBuf>,
	pub response_tx: ResponseTx<()>,
}
