use thiserror::Error;

use crate::message::Message;

/// Notification surfaced by the transport collaborator when drained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The physical channel has come up and can carry messages.
    ChannelUp,
    /// The physical channel was lost; a reason is carried for diagnostics.
    ChannelDown { reason: String },
    /// A decoded message arrived on the channel.
    Message(Message),
}

/// Errors that can occur handing a message to the transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The channel is not connected
    #[error("Channel is not connected; the message cannot be delivered")]
    NotConnected,

    /// The transport refused the message
    #[error("Transport rejected the outgoing message: {reason}")]
    Rejected { reason: String },
}

/// Errors that can occur draining the transport's ready queue
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecvError {
    /// The transport failed internally while receiving
    #[error("Transport receive failed: {reason}")]
    Failed { reason: String },
}

/// Boundary to the reactor-style transport/codec collaborator.
///
/// Socket I/O, connection establishment and byte-level encoding all live
/// behind this trait; the watchlist only sees decoded messages and channel
/// transitions. Implementations are driven from a single thread, so no
/// `Send`/`Sync` bounds are required.
pub trait Transport {
    /// Begins a connection attempt. The outcome arrives later as a
    /// `ChannelUp` or `ChannelDown` event from `receive`.
    fn connect(&mut self) -> Result<(), SendError>;

    /// Queues one message for delivery. Fire-and-forget: a failure here is
    /// treated as a channel loss by the caller.
    fn send(&mut self, message: Message) -> Result<(), SendError>;

    /// Drains the next ready notification, if any.
    fn receive(&mut self) -> Result<Option<TransportEvent>, RecvError>;
}
