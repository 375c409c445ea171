use std::collections::HashMap;

use feedwatch_shared::{DomainType, RequestMsg, StreamId, ViewSpec, ITEM_STREAM_ID_START};

use crate::{error::WatchlistError, gap::GapTracker, handle::StreamHandle};

/// Identity a wire stream serves: domain, service and item name. Requests
/// made by service identifier are normalized to the service name before
/// routing, so that two spellings of the same service share a wire stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct RouteKey {
    pub domain: DomainType,
    pub service: String,
    pub item: String,
}

/// One protocol-level stream multiplexing one or more application handles.
pub(crate) struct WireStream {
    pub key: RouteKey,
    /// Member handles with their individual views, in join order.
    pub members: Vec<(StreamHandle, Option<ViewSpec>)>,
    /// The view actually on the wire: the union of all member views.
    pub view: Option<ViewSpec>,
    pub gap: GapTracker,
    /// Whether further handles may share this stream. Symbol lists and
    /// snapshots always stand alone.
    pub mergeable: bool,
}

impl WireStream {
    pub fn handles(&self) -> Vec<StreamHandle> {
        self.members.iter().map(|(h, _)| *h).collect()
    }

    fn effective_view(&self) -> Option<ViewSpec> {
        let mut merged: Option<ViewSpec> = None;
        for (_, view) in &self.members {
            match view {
                // one full-image member widens the wire to a full image
                None => return None,
                Some(view) => {
                    merged = Some(match merged {
                        None => view.clone(),
                        Some(current) => current.union(view),
                    });
                }
            }
        }
        merged
    }
}

/// Where a placed request ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Joined an existing wire stream.
    Joined(StreamId),
    /// A new wire stream was opened.
    Opened(StreamId),
}

/// What removing a handle from its wire stream requires on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Unplace {
    /// The last member left; the wire stream must be closed.
    Close(StreamId),
    /// The effective view narrowed; one reissue must be sent.
    Narrow(StreamId, Option<ViewSpec>),
    /// Remaining members already cover the wire view; nothing to send.
    Kept(StreamId),
}

/// Aggregates application requests onto wire streams, deduplicating shared
/// subscriptions.
///
/// Merging requires identical routing identity and compatible views: both
/// absent, or one a subset of the other. Incomparable views never merge;
/// each gets its own wire stream rather than risking over-delivery.
pub(crate) struct Multiplexer {
    streams: HashMap<StreamId, WireStream>,
    routes: HashMap<RouteKey, Vec<StreamId>>,
    next_id: StreamId,
    gap_window: usize,
}

impl Multiplexer {
    pub fn new(gap_window: usize) -> Self {
        Self {
            streams: HashMap::new(),
            routes: HashMap::new(),
            next_id: ITEM_STREAM_ID_START,
            gap_window,
        }
    }

    pub fn get(&self, id: StreamId) -> Option<&WireStream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut WireStream> {
        self.streams.get_mut(&id)
    }

    /// Whether the identifier space for this channel session is used up.
    pub fn exhausted(&self) -> bool {
        self.next_id == StreamId::MAX
    }

    fn alloc_id(&mut self) -> Result<StreamId, WatchlistError> {
        if self.next_id == StreamId::MAX {
            return Err(WatchlistError::StreamIdExhausted);
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    /// Routes a request onto a wire stream, preferring an existing
    /// compatible one.
    pub fn place(
        &mut self,
        handle: StreamHandle,
        request: &RequestMsg,
        key: RouteKey,
    ) -> Result<Placement, WatchlistError> {
        let mergeable = request.streaming && request.domain != DomainType::SymbolList;

        if mergeable {
            if let Some(candidates) = self.routes.get(&key) {
                for id in candidates {
                    let stream = &self.streams[id];
                    if stream.mergeable && views_compatible(&stream.view, &request.view) {
                        let id = *id;
                        let stream = self.streams.get_mut(&id).expect("routed stream exists");
                        stream.members.push((handle, request.view.clone()));
                        stream.view = stream.effective_view();
                        return Ok(Placement::Joined(id));
                    }
                }
            }
        }

        let id = self.alloc_id()?;
        self.streams.insert(
            id,
            WireStream {
                key: key.clone(),
                members: vec![(handle, request.view.clone())],
                view: request.view.clone(),
                gap: GapTracker::new(self.gap_window),
                mergeable,
            },
        );
        self.routes.entry(key).or_default().push(id);
        Ok(Placement::Opened(id))
    }

    /// Replaces one member's view and recomputes the wire view. Returns the
    /// new effective view when it changed and a reissue is needed. The
    /// caller is responsible for having checked compatibility.
    pub fn update_member_view(
        &mut self,
        id: StreamId,
        handle: StreamHandle,
        view: Option<ViewSpec>,
    ) -> Option<Option<ViewSpec>> {
        let stream = self.streams.get_mut(&id)?;
        for member in stream.members.iter_mut() {
            if member.0 == handle {
                member.1 = view;
                break;
            }
        }
        let effective = stream.effective_view();
        if effective != stream.view {
            stream.view = effective.clone();
            Some(effective)
        } else {
            None
        }
    }

    /// Detaches a handle from its wire stream.
    pub fn remove_handle(&mut self, id: StreamId, handle: StreamHandle) -> Option<Unplace> {
        let stream = self.streams.get_mut(&id)?;
        stream.members.retain(|(h, _)| *h != handle);

        if stream.members.is_empty() {
            let stream = self.streams.remove(&id).expect("stream present");
            self.unroute(&stream.key, id);
            return Some(Unplace::Close(id));
        }

        let effective = stream.effective_view();
        if effective != stream.view {
            stream.view = effective.clone();
            Some(Unplace::Narrow(id, effective))
        } else {
            Some(Unplace::Kept(id))
        }
    }

    /// Drops a wire stream wholesale (provider closed it, or it is being
    /// re-requested under a new identity). Members are returned to the
    /// caller for per-handle handling.
    pub fn remove_stream(&mut self, id: StreamId) -> Option<WireStream> {
        let stream = self.streams.remove(&id)?;
        self.unroute(&stream.key, id);
        Some(stream)
    }

    fn unroute(&mut self, key: &RouteKey, id: StreamId) {
        if let Some(ids) = self.routes.get_mut(key) {
            ids.retain(|candidate| *candidate != id);
            if ids.is_empty() {
                self.routes.remove(key);
            }
        }
    }

    /// Channel loss: every wire identity is void and the identifier space
    /// restarts for the next session.
    pub fn reset(&mut self) {
        self.streams.clear();
        self.routes.clear();
        self.next_id = ITEM_STREAM_ID_START;
    }
}

fn views_compatible(wire: &Option<ViewSpec>, candidate: &Option<ViewSpec>) -> bool {
    match (wire, candidate) {
        (None, None) => true,
        (Some(wire), Some(candidate)) => wire.is_comparable_with(candidate),
        _ => false,
    }
}
