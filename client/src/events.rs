use std::collections::{vec_deque::IntoIter, VecDeque};

use feedwatch_shared::{DomainType, NakCode, PostId, RefreshMsg, StreamState, UpdateMsg};

use crate::handle::StreamHandle;

/// A solicited or unsolicited image delivered on a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshEvent {
    pub handle: StreamHandle,
    pub msg: RefreshMsg,
}

/// An incremental data change delivered on a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateEvent {
    pub handle: StreamHandle,
    pub msg: UpdateMsg,
}

/// Why a status event was generated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCause {
    /// The provider sent the state on the wire.
    Provider,
    /// No refresh or status arrived within the request timeout.
    RequestTimeout,
    /// The owning service transitioned down or was withdrawn.
    ServiceDown,
    /// The requested service never appeared within the configured wait.
    ServiceNotFound,
    /// The owning service was gone after a reconnect.
    ServiceNotAvailable,
    /// The owning service does not serve the requested domain.
    CapabilityMismatch,
    /// Reconnection attempts were exhausted or disabled.
    RecoveryFailed,
    /// Internal identifier space ran out while routing the stream.
    ResourceExhausted,
    /// The login session ended, taking the stream with it.
    SessionClosed,
    /// Every member of the batch has closed.
    BatchComplete,
}

/// A stream-state notification, provider-sent or synthesized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEvent {
    pub handle: StreamHandle,
    pub domain: DomainType,
    pub state: StreamState,
    pub cause: StatusCause,
}

/// Acknowledgment outcome for a submitted post. `nak_code` is present on
/// negative acknowledgments, including the synthesized no-response case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckEvent {
    pub handle: StreamHandle,
    pub post_id: PostId,
    pub nak_code: Option<NakCode>,
    pub text: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelEventKind {
    /// The channel is up and the session is being (re)established.
    Up,
    /// The channel was lost; recovery may follow.
    Down,
    /// A reconnection attempt is starting.
    Reconnecting,
    /// The session is over: recovery was exhausted or login ended it.
    Closed,
}

/// A channel lifecycle notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelEvent {
    pub kind: ChannelEventKind,
    pub reason: Option<String>,
}

/// One application-visible event. Consumed by exhaustive matching; the
/// variant set is closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchlistEvent {
    Refresh(RefreshEvent),
    Update(UpdateEvent),
    Status(StatusEvent),
    Ack(AckEvent),
    Channel(ChannelEvent),
}

/// Events collected during one dispatch cycle, in generation order: events
/// for a given handle appear in the order they were produced, and events
/// across handles follow processing order.
#[derive(Default)]
pub struct Events {
    list: VecDeque<WatchlistEvent>,
}

impl Events {
    pub fn new() -> Self {
        Self {
            list: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WatchlistEvent> {
        self.list.iter()
    }

    pub(crate) fn push_refresh(&mut self, handle: StreamHandle, msg: RefreshMsg) {
        self.list
            .push_back(WatchlistEvent::Refresh(RefreshEvent { handle, msg }));
    }

    pub(crate) fn push_update(&mut self, handle: StreamHandle, msg: UpdateMsg) {
        self.list
            .push_back(WatchlistEvent::Update(UpdateEvent { handle, msg }));
    }

    pub(crate) fn push_status(
        &mut self,
        handle: StreamHandle,
        domain: DomainType,
        state: StreamState,
        cause: StatusCause,
    ) {
        self.list.push_back(WatchlistEvent::Status(StatusEvent {
            handle,
            domain,
            state,
            cause,
        }));
    }

    pub(crate) fn push_ack(
        &mut self,
        handle: StreamHandle,
        post_id: PostId,
        nak_code: Option<NakCode>,
        text: Option<String>,
    ) {
        self.list.push_back(WatchlistEvent::Ack(AckEvent {
            handle,
            post_id,
            nak_code,
            text,
        }));
    }

    pub(crate) fn push_channel(&mut self, kind: ChannelEventKind, reason: Option<String>) {
        self.list
            .push_back(WatchlistEvent::Channel(ChannelEvent { kind, reason }));
    }
}

impl IntoIterator for Events {
    type Item = WatchlistEvent;
    type IntoIter = IntoIter<WatchlistEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.list.into_iter()
    }
}
