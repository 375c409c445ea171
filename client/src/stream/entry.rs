use std::collections::HashSet;
use std::time::Duration;

use feedwatch_shared::{DomainType, ItemKey, RequestMsg, StreamId, Timer};

use crate::handle::StreamHandle;

/// Watchlist-side lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    /// Submitted but not yet established: waiting for login, for its
    /// service, or for the solicited refresh.
    Pending,
    /// Established; refreshes and updates flow.
    Open,
    /// A reissue went to the wire; waiting for the answering refresh.
    ReissuePending,
    /// Detached from the wire by a channel loss; queued for replay.
    Recovering,
    /// Terminal. The handle is gone and will never be reused.
    Closed,
}

/// One application-visible subscription.
///
/// Wire identity lives in `wire_id` and is only valid for the current
/// channel session; everything needed to re-request the stream after a
/// reconnect is kept in `request`.
pub(crate) struct StreamEntry {
    pub handle: StreamHandle,
    pub domain: DomainType,
    pub key: ItemKey,
    pub status: StreamStatus,
    pub wire_id: Option<StreamId>,
    /// Replayed verbatim on recovery; superseded by reissues.
    pub request: RequestMsg,
    /// Members still open, when this entry is a batch aggregate.
    pub batch_members: Option<HashSet<StreamHandle>>,
    /// Owning aggregate, when this entry was fanned out of a batch.
    pub parent: Option<StreamHandle>,
    pub request_timer: Timer,
}

impl StreamEntry {
    pub fn new(handle: StreamHandle, request: RequestMsg, request_timeout: Duration) -> Self {
        Self {
            handle,
            domain: request.domain,
            key: request.key.clone(),
            status: StreamStatus::Pending,
            wire_id: None,
            request,
            batch_members: None,
            parent: None,
            request_timer: Timer::new(request_timeout),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.batch_members.is_some()
    }

    /// Detaches the entry from the wire, keeping the request for replay.
    pub fn detach_from_wire(&mut self) {
        self.wire_id = None;
        self.request_timer.disarm();
    }
}
