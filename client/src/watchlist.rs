use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use log::{info, trace, warn};

use feedwatch_shared::{
    AckMsg, CloseMsg, DataState, DomainType, LoginFeatures, LoginRequest, Message, NakCode,
    Payload, PostMsg, RefreshMsg, RequestMsg, ServiceAction, ServiceDirectory, ServiceEvent,
    ServiceId, ServiceRef, ServiceState, StatusMsg, StreamId, StreamState, StreamStateKind,
    Transport, TransportEvent, UpdateMsg, ViewSpec, WatchlistConfig, DIRECTORY_STREAM_ID,
    LOGIN_STREAM_ID,
};

use crate::{
    directory::DirectorySession,
    error::WatchlistError,
    events::{ChannelEventKind, Events, StatusCause},
    gap::GapOutcome,
    handle::StreamHandle,
    multiplex::{Multiplexer, Placement, RouteKey, Unplace},
    recovery::{ReconnectDecision, RecoveryController},
    session::{LoginSession, LoginState},
    stream::{StreamEntry, StreamStatus, StreamTable},
    timeout::{TimeoutAction, TimeoutManager},
};

/// Watchlist-side view of the physical channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChannelPhase {
    Down,
    Connecting,
    Up,
}

/// The client-side reliability layer for a publish/subscribe market-data
/// session.
///
/// Applications open logical subscriptions; the watchlist keeps them alive
/// and consistent across connection churn, packet loss and provider
/// failures, surfacing a single ordered event stream per dispatch cycle.
///
/// Everything is synchronous and single-threaded: state only moves inside
/// `submit`/`reissue`/`unregister` and the periodic `dispatch` call.
/// Callers must serialize those calls per instance.
pub struct Watchlist {
    config: WatchlistConfig,
    transport: Box<dyn Transport>,
    table: StreamTable,
    mux: Multiplexer,
    login: LoginSession,
    directory: DirectorySession,
    recovery: RecoveryController,
    timeouts: TimeoutManager,
    events: Events,
    phase: ChannelPhase,
    /// Deferred channel loss noticed while sending; folded in between
    /// processing steps so send sites never re-enter teardown mid-loop.
    channel_failure: Option<String>,
}

impl Watchlist {
    /// Creates a watchlist over the given transport. The configuration is
    /// validated here, before any channel activity.
    pub fn new(
        config: WatchlistConfig,
        transport: Box<dyn Transport>,
    ) -> Result<Self, WatchlistError> {
        config.validate()?;
        Ok(Self {
            mux: Multiplexer::new(config.gap_recovery_buffer_size),
            login: LoginSession::new(config.request_timeout),
            directory: DirectorySession::new(),
            recovery: RecoveryController::new(&config),
            timeouts: TimeoutManager::new(&config),
            table: StreamTable::new(),
            events: Events::new(),
            phase: ChannelPhase::Down,
            channel_failure: None,
            config,
            transport,
        })
    }

    /// Begins the initial connection attempt. The outcome arrives through
    /// `dispatch` as a channel event.
    pub fn connect(&mut self) -> Result<(), WatchlistError> {
        self.transport.connect()?;
        self.phase = ChannelPhase::Connecting;
        Ok(())
    }

    // Session streams

    /// Submits (or reissues) the login. The first call opens the login
    /// stream; later calls replace the parameters on the same stream, but
    /// may not change the negotiated user name.
    pub fn login(&mut self, request: LoginRequest) -> Result<StreamHandle, WatchlistError> {
        let now = Instant::now();

        if let Some(handle) = self.login.handle {
            let same_user = self
                .login
                .request
                .as_ref()
                .map(|existing| existing.user_name == request.user_name)
                .unwrap_or(true);
            if !same_user {
                return Err(WatchlistError::LoginIdentityChange);
            }
            self.login.request = Some(request);
            if self.phase == ChannelPhase::Up
                && matches!(
                    self.login.state,
                    LoginState::LoginPending | LoginState::LoggedIn
                )
            {
                self.send_login(now);
            }
            self.flush_channel_failure(now);
            return Ok(handle);
        }

        let handle = self.table.next_handle();
        self.login.handle = Some(handle);
        self.login.request = Some(request);
        let wire = self.login.wire_request().expect("parameters just stored");
        self.table
            .insert(StreamEntry::new(handle, wire, self.config.request_timeout), false);

        if self.phase == ChannelPhase::Up {
            self.send_login(now);
        }
        self.flush_channel_failure(now);
        Ok(handle)
    }

    /// Registers application interest in the directory stream. The stream
    /// itself is perpetual and internal; this just mirrors its traffic as
    /// events. Filter bits are added to whatever the watchlist already
    /// requests for its own routing needs.
    pub fn request_directory(&mut self, filter: u32) -> Result<StreamHandle, WatchlistError> {
        if let Some(handle) = self.directory.handle {
            return Ok(handle);
        }

        self.directory.filter |= filter;
        let handle = self.table.next_handle();
        self.directory.handle = Some(handle);
        let request = self.directory.wire_request();
        self.table
            .insert(StreamEntry::new(handle, request, Duration::ZERO), false);

        if self.directory.loaded {
            // the session already holds a directory image
            let refresh = self.directory_refresh_from_cache();
            if let Some(entry) = self.table.get_mut(handle) {
                entry.status = StreamStatus::Open;
                entry.wire_id = Some(DIRECTORY_STREAM_ID);
            }
            self.events.push_refresh(handle, refresh);
        }
        Ok(handle)
    }

    // Item streams

    /// Opens a subscription and returns its handle. The request is held
    /// `Pending` until the channel, the login and the owning service allow
    /// it onto the wire.
    pub fn submit(&mut self, request: RequestMsg) -> Result<StreamHandle, WatchlistError> {
        let now = Instant::now();

        if !request.domain.is_item() {
            return Err(WatchlistError::SessionDomain {
                domain: request.domain,
            });
        }
        if request.key.service.is_none() {
            return Err(WatchlistError::MissingService);
        }
        if request.batch_items.is_empty() && request.key.name.is_empty() {
            return Err(WatchlistError::EmptyBatch);
        }
        if self.mux.exhausted() {
            return Err(WatchlistError::StreamIdExhausted);
        }
        if request.view.is_some()
            && self.login.is_logged_in()
            && !self.login.features.supports_view_requests
        {
            return Err(WatchlistError::FeatureUnavailable { feature: "view" });
        }

        if !request.batch_items.is_empty() {
            return self.submit_batch(request, now);
        }

        let handle = self.create_item_entry(request, None);
        self.try_activate(handle, now, false);
        self.flush_channel_failure(now);
        Ok(handle)
    }

    /// Fans a batch out into independent per-item streams plus one
    /// aggregate handle that closes only when every member has closed.
    fn submit_batch(
        &mut self,
        request: RequestMsg,
        now: Instant,
    ) -> Result<StreamHandle, WatchlistError> {
        if self.login.is_logged_in() && !self.login.features.supports_batch_requests {
            return Err(WatchlistError::FeatureUnavailable { feature: "batch" });
        }

        let aggregate = self.table.next_handle();
        let mut members = HashSet::new();
        let mut ordered = Vec::new();
        for name in &request.batch_items {
            let mut member_request = request.clone();
            member_request.batch_items = Vec::new();
            member_request.key.name = name.clone();
            let handle = self.create_item_entry(member_request, Some(aggregate));
            members.insert(handle);
            ordered.push(handle);
        }

        let mut aggregate_entry =
            StreamEntry::new(aggregate, request, self.config.request_timeout);
        aggregate_entry.batch_members = Some(members);
        self.table.insert(aggregate_entry, false);

        for handle in ordered {
            self.try_activate(handle, now, false);
        }
        self.flush_channel_failure(now);
        Ok(aggregate)
    }

    /// Replaces a stream's request (view, streaming mode, payload). The
    /// domain and item identity must stay the same.
    pub fn reissue(
        &mut self,
        handle: StreamHandle,
        request: RequestMsg,
    ) -> Result<(), WatchlistError> {
        let now = Instant::now();

        if Some(handle) == self.login.handle {
            return Err(WatchlistError::SessionDomain {
                domain: DomainType::Login,
            });
        }
        if Some(handle) == self.directory.handle {
            return Err(WatchlistError::SessionDomain {
                domain: DomainType::Directory,
            });
        }
        {
            let Some(entry) = self.table.get(handle) else {
                return Err(WatchlistError::UnknownHandle { handle });
            };
            if entry.is_aggregate() {
                return Err(WatchlistError::BatchAggregate);
            }
            if entry.domain != request.domain || entry.key != request.key {
                return Err(WatchlistError::IdentityMismatch);
            }
        }
        if request.view.is_some()
            && self.login.is_logged_in()
            && !self.login.features.supports_view_requests
        {
            return Err(WatchlistError::FeatureUnavailable { feature: "view" });
        }

        let wire_id = {
            let entry = self.table.get_mut(handle).expect("checked above");
            let mut stored = request.clone();
            stored.batch_items.clear();
            entry.request = stored;
            entry.wire_id
        };

        match wire_id {
            // not on the wire: the superseding request is simply what
            // recovery or activation will send
            None => {}
            Some(id) => {
                let sole_member = self
                    .mux
                    .get(id)
                    .map(|ws| ws.members.len() == 1)
                    .unwrap_or(false);
                if sole_member {
                    self.mux.update_member_view(id, handle, request.view.clone());
                    let wire_view = self.mux.get(id).and_then(|ws| ws.view.clone());
                    let mut wire_request = request;
                    wire_request.stream_id = id;
                    wire_request.view = wire_view;
                    wire_request.batch_items.clear();
                    {
                        let entry = self.table.get_mut(handle).expect("checked above");
                        if entry.status == StreamStatus::Open {
                            entry.status = StreamStatus::ReissuePending;
                        }
                        entry.request_timer.arm(now);
                    }
                    self.send_to_wire(Message::Request(wire_request));
                } else {
                    // shared stream: re-route, which re-merges if the new
                    // view still fits and splits off otherwise
                    self.detach_and_replace(handle, id, now);
                }
            }
        }
        self.flush_channel_failure(now);
        Ok(())
    }

    /// Closes a subscription. Synchronous: no further events are delivered
    /// for the handle, even if messages for it are already in flight.
    pub fn unregister(&mut self, handle: StreamHandle) -> Result<(), WatchlistError> {
        let now = Instant::now();

        if Some(handle) == self.login.handle {
            self.logout();
            self.flush_channel_failure(now);
            return Ok(());
        }
        if Some(handle) == self.directory.handle {
            self.directory.handle = None;
            self.table.remove(handle);
            return Ok(());
        }

        let Some(entry) = self.table.get(handle) else {
            return Err(WatchlistError::UnknownHandle { handle });
        };

        if entry.is_aggregate() {
            let members: Vec<StreamHandle> = entry
                .batch_members
                .iter()
                .flat_map(|set| set.iter().copied())
                .collect();
            // the aggregate goes first so member teardown cannot re-close it
            self.table.remove(handle);
            for member in members {
                self.finish_closed_entry(member, now, true);
            }
        } else {
            self.finish_closed_entry(handle, now, true);
        }
        self.flush_channel_failure(now);
        Ok(())
    }

    /// Sends an application post on an open stream and starts the
    /// acknowledgment clock.
    pub fn submit_post(
        &mut self,
        handle: StreamHandle,
        mut post: PostMsg,
    ) -> Result<(), WatchlistError> {
        let now = Instant::now();

        if !self.login.features.supports_posting {
            return Err(WatchlistError::FeatureUnavailable { feature: "posting" });
        }
        let wire_id = {
            let Some(entry) = self.table.get(handle) else {
                return Err(WatchlistError::UnknownHandle { handle });
            };
            if entry.status != StreamStatus::Open {
                return Err(WatchlistError::StreamNotOpen);
            }
            entry.wire_id.ok_or(WatchlistError::StreamNotOpen)?
        };

        post.stream_id = wire_id;
        let post_id = post.post_id;
        self.send_to_wire(Message::Post(post));
        self.timeouts.track_post(handle, post_id, now);
        self.flush_channel_failure(now);
        Ok(())
    }

    /// Single entry point advancing timers, draining the transport and
    /// collecting events. `budget` bounds how long inbound processing may
    /// keep going once events are flowing.
    pub fn dispatch(&mut self, budget: Duration) -> Events {
        let start = Instant::now();
        self.poll_timers(start);
        self.flush_channel_failure(start);

        let deadline = start + budget;
        loop {
            match self.transport.receive() {
                Ok(Some(event)) => {
                    let now = Instant::now();
                    self.process_transport_event(event, now);
                    self.flush_channel_failure(now);
                    if Instant::now() >= deadline {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("Transport receive failed: {err}");
                    break;
                }
            }
        }

        std::mem::take(&mut self.events)
    }

    // Queries

    pub fn stream_status(&self, handle: StreamHandle) -> Option<StreamStatus> {
        self.table.get(handle).map(|entry| entry.status)
    }

    pub fn login_state(&self) -> LoginState {
        self.login.state
    }

    pub fn features(&self) -> LoginFeatures {
        self.login.features
    }

    pub fn services(&self) -> &ServiceDirectory {
        &self.directory.cache
    }

    /// Members of a batch aggregate that are still open.
    pub fn batch_members(&self, handle: StreamHandle) -> Option<Vec<StreamHandle>> {
        let entry = self.table.get(handle)?;
        let members = entry.batch_members.as_ref()?;
        let mut list: Vec<StreamHandle> = members.iter().copied().collect();
        list.sort();
        Some(list)
    }

    // Entry bookkeeping

    fn create_item_entry(
        &mut self,
        request: RequestMsg,
        parent: Option<StreamHandle>,
    ) -> StreamHandle {
        let handle = self.table.next_handle();
        let mut entry = StreamEntry::new(handle, request, self.config.request_timeout);
        entry.parent = parent;
        self.table.insert(entry, true);
        handle
    }

    /// Pushes a pending entry onto the wire if the channel, session and
    /// owning service allow it. During recovery replay a missing service
    /// closes the stream instead of waiting for it.
    fn try_activate(&mut self, handle: StreamHandle, now: Instant, replaying: bool) {
        if self.phase != ChannelPhase::Up
            || !self.login.is_logged_in()
            || !self.directory.loaded
        {
            return;
        }

        let (service_ref, domain, request) = {
            let Some(entry) = self.table.get(handle) else { return };
            if entry.status != StreamStatus::Pending
                || entry.wire_id.is_some()
                || entry.is_aggregate()
            {
                return;
            }
            let Some(service_ref) = entry.key.service.clone() else { return };
            (service_ref, entry.domain, entry.request.clone())
        };

        let resolved = self
            .directory
            .cache
            .resolve(&service_ref)
            .map(|service| (service.name.clone(), service.state, service.supports(domain)));

        match resolved {
            None if replaying => {
                self.close_entry_with_status(
                    handle,
                    StreamState::closed("Service not available"),
                    StatusCause::ServiceNotAvailable,
                    now,
                );
            }
            None => {
                // wait for the service; the request timeout doubles as the
                // service wait
                if let Some(entry) = self.table.get_mut(handle) {
                    if !entry.request_timer.is_armed() {
                        entry.request_timer.arm(now);
                    }
                }
            }
            Some((_, _, false)) => {
                self.close_entry_with_status(
                    handle,
                    StreamState::closed("Service does not serve the requested domain"),
                    StatusCause::CapabilityMismatch,
                    now,
                );
            }
            Some((_, ServiceState::Down, true)) => {
                // hold until the service comes back up
                if let Some(entry) = self.table.get_mut(handle) {
                    if !entry.request_timer.is_armed() {
                        entry.request_timer.arm(now);
                    }
                }
            }
            Some((name, ServiceState::Up, true)) => {
                let key = RouteKey {
                    domain,
                    service: name,
                    item: request.key.name.clone(),
                };
                match self.mux.place(handle, &request, key) {
                    Err(err) => {
                        warn!("Cannot route stream onto the wire: {err}");
                        self.close_entry_with_status(
                            handle,
                            StreamState::closed("Stream identifier space exhausted"),
                            StatusCause::ResourceExhausted,
                            now,
                        );
                    }
                    Ok(placement) => {
                        let id = match placement {
                            Placement::Joined(id) => id,
                            Placement::Opened(id) => id,
                        };
                        let wire_view = self.mux.get(id).and_then(|ws| ws.view.clone());
                        {
                            let entry = self.table.get_mut(handle).expect("placed entry exists");
                            entry.wire_id = Some(id);
                            entry.request_timer.arm(now);
                        }
                        let mut wire_request = request;
                        wire_request.stream_id = id;
                        wire_request.view = wire_view;
                        wire_request.batch_items.clear();
                        self.send_to_wire(Message::Request(wire_request));
                    }
                }
            }
        }
    }

    /// Pulls a handle off its shared wire stream and routes it again under
    /// its current request.
    fn detach_and_replace(&mut self, handle: StreamHandle, id: StreamId, now: Instant) {
        match self.mux.remove_handle(id, handle) {
            Some(Unplace::Close(id)) => {
                self.send_to_wire(Message::Close(CloseMsg { stream_id: id }));
            }
            Some(Unplace::Narrow(id, view)) => self.send_narrowing_reissue(id, view),
            _ => {}
        }
        if let Some(entry) = self.table.get_mut(handle) {
            entry.wire_id = None;
            entry.status = StreamStatus::Pending;
        }
        self.try_activate(handle, now, false);
    }

    /// One reissue narrowing a wire stream's view after a member left.
    fn send_narrowing_reissue(&mut self, id: StreamId, view: Option<ViewSpec>) {
        let template = {
            let Some(ws) = self.mux.get(id) else { return };
            let Some((first, _)) = ws.members.first() else { return };
            let Some(entry) = self.table.get(*first) else { return };
            entry.request.clone()
        };
        let mut wire_request = template;
        wire_request.stream_id = id;
        wire_request.view = view;
        wire_request.batch_items.clear();
        self.send_to_wire(Message::Request(wire_request));
    }

    /// Removes a closed entry: timers, wire routing and batch membership.
    /// Emits no event for the handle itself.
    fn finish_closed_entry(&mut self, handle: StreamHandle, now: Instant, send_wire_close: bool) {
        let Some(entry) = self.table.remove(handle) else { return };
        self.timeouts.forget_handle(handle);
        if let Some(id) = entry.wire_id {
            match self.mux.remove_handle(id, handle) {
                Some(Unplace::Close(id)) => {
                    if send_wire_close && self.phase == ChannelPhase::Up {
                        self.send_to_wire(Message::Close(CloseMsg { stream_id: id }));
                    }
                }
                Some(Unplace::Narrow(id, view)) => self.send_narrowing_reissue(id, view),
                _ => {}
            }
        }
        if let Some(parent) = entry.parent {
            self.member_closed(parent, handle);
        }
    }

    /// Emits a terminal status for the handle, then tears it down.
    fn close_entry_with_status(
        &mut self,
        handle: StreamHandle,
        state: StreamState,
        cause: StatusCause,
        now: Instant,
    ) {
        let Some(domain) = self.table.get(handle).map(|entry| entry.domain) else {
            return;
        };
        self.events.push_status(handle, domain, state, cause);
        self.finish_closed_entry(handle, now, true);
    }

    /// A batch member closed; the aggregate follows when the last one does.
    fn member_closed(&mut self, parent: StreamHandle, member: StreamHandle) {
        let mut aggregate_done = false;
        if let Some(aggregate) = self.table.get_mut(parent) {
            if let Some(members) = aggregate.batch_members.as_mut() {
                members.remove(&member);
                aggregate_done = members.is_empty();
            }
        }
        if aggregate_done {
            if let Some(aggregate) = self.table.remove(parent) {
                self.events.push_status(
                    parent,
                    aggregate.domain,
                    StreamState {
                        stream: StreamStateKind::Closed,
                        data: DataState::Ok,
                        text: Some("All batch members closed".to_string()),
                    },
                    StatusCause::BatchComplete,
                );
            }
        }
    }

    // Channel lifecycle

    fn process_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::ChannelUp => self.handle_channel_up(now),
            TransportEvent::ChannelDown { reason } => self.handle_channel_down(reason, now),
            TransportEvent::Message(message) => self.demultiplex(message, now),
        }
    }

    fn handle_channel_up(&mut self, now: Instant) {
        self.phase = ChannelPhase::Up;
        self.recovery.connected();
        self.events.push_channel(ChannelEventKind::Up, None);
        if self.login.request.is_some() {
            self.send_login(now);
        }
    }

    fn handle_channel_down(&mut self, reason: String, now: Instant) {
        match self.phase {
            // duplicate or unsolicited; nothing left to tear down
            ChannelPhase::Down => return,
            ChannelPhase::Connecting if self.recovery.has_job() => {
                self.phase = ChannelPhase::Down;
                self.events
                    .push_channel(ChannelEventKind::Down, Some(reason.clone()));
                match self.recovery.connection_failed(now) {
                    ReconnectDecision::Schedule(delay) => {
                        trace!("Reconnect attempt failed; next in {:?}", delay);
                    }
                    ReconnectDecision::GiveUp => self.abandon_recovery(&reason),
                }
                return;
            }
            _ => {}
        }

        // a live (or first) connection was lost: detach everything and
        // queue the replay
        self.phase = ChannelPhase::Down;
        self.events
            .push_channel(ChannelEventKind::Down, Some(reason.clone()));

        self.login.reset_for_reconnect();
        if let Some(handle) = self.login.handle {
            if let Some(entry) = self.table.get_mut(handle) {
                entry.status = StreamStatus::Recovering;
                entry.detach_from_wire();
            }
        }
        self.directory.reset_for_reconnect();
        if let Some(handle) = self.directory.handle {
            if let Some(entry) = self.table.get_mut(handle) {
                entry.status = StreamStatus::Recovering;
                entry.detach_from_wire();
            }
        }
        self.mux.reset();

        let mut replay = VecDeque::new();
        for handle in self.table.ordered_handles() {
            let Some(entry) = self.table.get_mut(handle) else { continue };
            match entry.status {
                // Recovering entries from an earlier loss whose replay never
                // ran re-enter the queue in the same submission order
                StreamStatus::Open
                | StreamStatus::Pending
                | StreamStatus::ReissuePending
                | StreamStatus::Recovering => {
                    entry.status = StreamStatus::Recovering;
                    entry.detach_from_wire();
                    replay.push_back(handle);
                }
                StreamStatus::Closed => {}
            }
        }

        match self.recovery.begin(replay, now) {
            ReconnectDecision::Schedule(delay) => {
                info!("Channel down ({reason}); reconnecting in {:?}", delay);
            }
            ReconnectDecision::GiveUp => self.abandon_recovery(&reason),
        }
    }

    /// Recovery is over: every stream that was waiting on it closes.
    fn abandon_recovery(&mut self, reason: &str) {
        info!("Reconnection abandoned: {reason}");
        let state = StreamState::closed("Recovery failed; reconnection exhausted");
        if let Some(handle) = self.login.handle {
            if self.table.remove(handle).is_some() {
                self.events.push_status(
                    handle,
                    DomainType::Login,
                    state.clone(),
                    StatusCause::RecoveryFailed,
                );
            }
        }
        self.teardown_session(state, StatusCause::RecoveryFailed, Some(reason.to_string()));
    }

    /// Closes every stream the session carries and resets session state.
    /// The login entry is expected to be gone already.
    fn teardown_session(
        &mut self,
        state: StreamState,
        cause: StatusCause,
        channel_closed_reason: Option<String>,
    ) {
        if self.table.len() > 0 {
            info!("Closing {} streams with the session", self.table.len());
        }
        let mut handles: Vec<StreamHandle> = Vec::new();
        if let Some(handle) = self.directory.handle.take() {
            handles.push(handle);
        }
        handles.extend(self.table.ordered_handles());
        for handle in self.table.all_handles() {
            if !handles.contains(&handle) {
                handles.push(handle);
            }
        }
        for handle in handles {
            let Some(entry) = self.table.remove(handle) else { continue };
            self.events
                .push_status(handle, entry.domain, state.clone(), cause);
        }

        self.table.clear();
        self.mux.reset();
        self.timeouts.clear();
        self.login.reset();
        self.directory.cache.clear();
        self.directory.loaded = false;

        if let Some(reason) = channel_closed_reason {
            self.events
                .push_channel(ChannelEventKind::Closed, Some(reason));
        }
    }

    /// Application-driven logout: the login stream closes and every
    /// dependent stream closes with it.
    fn logout(&mut self) {
        if self.phase == ChannelPhase::Up {
            self.send_to_wire(Message::Close(CloseMsg {
                stream_id: LOGIN_STREAM_ID,
            }));
        }
        if let Some(handle) = self.login.handle {
            self.table.remove(handle);
        }
        self.teardown_session(
            StreamState::closed("Login session ended"),
            StatusCause::SessionClosed,
            None,
        );
    }

    // Outbound session traffic

    fn send_login(&mut self, now: Instant) {
        let Some(request) = self.login.wire_request() else { return };
        if let Some(handle) = self.login.handle {
            if let Some(entry) = self.table.get_mut(handle) {
                entry.wire_id = Some(LOGIN_STREAM_ID);
                entry.status = StreamStatus::Pending;
                entry.request_timer.arm(now);
            }
        }
        if self.login.state != LoginState::LoggedIn {
            self.login.state = LoginState::LoginPending;
        }
        info!("Login request sent");
        self.send_to_wire(Message::Request(request));
    }

    fn after_login(&mut self) {
        info!("Session established; requesting directory");
        let request = self.directory.wire_request();
        if let Some(handle) = self.directory.handle {
            if let Some(entry) = self.table.get_mut(handle) {
                entry.wire_id = Some(DIRECTORY_STREAM_ID);
                entry.status = StreamStatus::Pending;
            }
        }
        self.send_to_wire(Message::Request(request));
    }

    fn directory_refresh_from_cache(&self) -> RefreshMsg {
        let actions: Vec<ServiceAction> = self
            .directory
            .cache
            .services()
            .cloned()
            .map(ServiceAction::Add)
            .collect();
        RefreshMsg {
            stream_id: DIRECTORY_STREAM_ID,
            domain: DomainType::Directory,
            state: StreamState::open_ok(),
            solicited: false,
            complete: true,
            seq_num: None,
            body: Payload::Services(actions),
        }
    }

    // Inbound demultiplexing

    fn demultiplex(&mut self, message: Message, now: Instant) {
        match message.stream_id() {
            LOGIN_STREAM_ID => self.on_login_message(message),
            DIRECTORY_STREAM_ID => self.on_directory_message(message, now),
            _ => self.on_item_message(message, now),
        }
    }

    fn on_login_message(&mut self, message: Message) {
        let Some(handle) = self.login.handle else {
            warn!("Login-stream message without a login session; dropping");
            return;
        };
        match message {
            Message::Refresh(refresh) => {
                if let Payload::Login(features) = &refresh.body {
                    self.login.features = *features;
                }
                if let Some(entry) = self.table.get_mut(handle) {
                    entry.request_timer.disarm();
                }
                let state = refresh.state.clone();
                self.events.push_refresh(handle, refresh);

                if state.is_closing() {
                    self.login_failed(state, StatusCause::Provider, false);
                } else if state.stream == StreamStateKind::Open && state.data == DataState::Ok {
                    let newly_established = !self.login.is_logged_in();
                    self.login.state = LoginState::LoggedIn;
                    if let Some(entry) = self.table.get_mut(handle) {
                        entry.status = StreamStatus::Open;
                    }
                    if newly_established {
                        self.after_login();
                    }
                }
                // an open/suspect login refresh leaves the gate shut
            }
            Message::Status(status) => {
                let state = status.state.unwrap_or(StreamState {
                    stream: StreamStateKind::Unspecified,
                    data: DataState::NoChange,
                    text: None,
                });
                if state.is_closing() {
                    self.login_failed(state, StatusCause::Provider, true);
                } else {
                    self.events
                        .push_status(handle, DomainType::Login, state, StatusCause::Provider);
                }
            }
            Message::Update(update) => {
                self.events.push_update(handle, update);
            }
            other => {
                warn!("Unexpected message on the login stream: {:?}", other);
            }
        }
    }

    /// Login rejection or timeout: the session never opened (or just
    /// ended); every stream closes and a session-level error surfaces.
    fn login_failed(&mut self, state: StreamState, cause: StatusCause, emit_login_status: bool) {
        warn!("Login failed: {:?}", state.text);
        if let Some(handle) = self.login.handle {
            if emit_login_status {
                self.events
                    .push_status(handle, DomainType::Login, state.clone(), cause);
            }
            self.table.remove(handle);
        }
        let reason = state
            .text
            .clone()
            .unwrap_or_else(|| "Login failed".to_string());
        self.teardown_session(
            StreamState::closed("Login session ended"),
            StatusCause::SessionClosed,
            Some(reason),
        );
    }

    fn on_directory_message(&mut self, message: Message, now: Instant) {
        match message {
            Message::Refresh(refresh) => {
                let actions = match &refresh.body {
                    Payload::Services(actions) => actions.clone(),
                    _ => Vec::new(),
                };
                let service_events = self.directory.apply_refresh(actions);
                if let Some(handle) = self.directory.handle {
                    if let Some(entry) = self.table.get_mut(handle) {
                        entry.status = StreamStatus::Open;
                        entry.wire_id = Some(DIRECTORY_STREAM_ID);
                    }
                    self.events.push_refresh(handle, refresh);
                }
                // recovering streams replay against the fresh image before
                // per-service deltas are folded in
                self.run_replay(now);
                self.process_service_events(service_events, now);
                self.flush_pending(now);
            }
            Message::Update(update) => {
                let actions = match &update.body {
                    Payload::Services(actions) => actions.clone(),
                    _ => Vec::new(),
                };
                let service_events = self.directory.apply_update(actions);
                if let Some(handle) = self.directory.handle {
                    self.events.push_update(handle, update);
                }
                self.process_service_events(service_events, now);
                self.flush_pending(now);
            }
            Message::Status(status) => {
                let state = status.state.unwrap_or(StreamState {
                    stream: StreamStateKind::Unspecified,
                    data: DataState::NoChange,
                    text: None,
                });
                if state.is_closing() {
                    warn!("Provider closed the directory stream: {:?}", state.text);
                }
                if let Some(handle) = self.directory.handle {
                    self.events.push_status(
                        handle,
                        DomainType::Directory,
                        state,
                        StatusCause::Provider,
                    );
                }
            }
            other => {
                warn!("Unexpected message on the directory stream: {:?}", other);
            }
        }
    }

    /// Replays recovering item streams in original submission order.
    /// Streams whose service did not survive the reconnect close here.
    fn run_replay(&mut self, now: Instant) {
        let Some(job) = self.recovery.take_job() else { return };
        if !job.replay.is_empty() {
            info!("Replaying {} item streams after reconnect", job.replay.len());
        }
        for handle in job.replay {
            let recovering = match self.table.get_mut(handle) {
                Some(entry) if entry.status == StreamStatus::Recovering => {
                    entry.status = StreamStatus::Pending;
                    true
                }
                _ => false,
            };
            if recovering {
                self.try_activate(handle, now, true);
            }
        }
    }

    /// Activates whatever became activatable, in submission order.
    fn flush_pending(&mut self, now: Instant) {
        for handle in self.table.ordered_handles() {
            let pending = self
                .table
                .get(handle)
                .map(|entry| {
                    entry.status == StreamStatus::Pending
                        && entry.wire_id.is_none()
                        && !entry.is_aggregate()
                })
                .unwrap_or(false);
            if pending {
                self.try_activate(handle, now, false);
            }
        }
    }

    fn process_service_events(&mut self, service_events: Vec<ServiceEvent>, now: Instant) {
        for event in service_events {
            match event {
                // newly routable services are picked up by flush_pending
                ServiceEvent::Added(_) | ServiceEvent::StateChanged(_, ServiceState::Up) => {}
                ServiceEvent::StateChanged(id, ServiceState::Down) => {
                    let name = self.directory.cache.get(id).map(|s| s.name.clone());
                    for handle in self.bound_handles(id, name.as_deref()) {
                        let Some(domain) = self.table.get(handle).map(|e| e.domain) else {
                            continue;
                        };
                        // the stream stays open; the service may return
                        self.events.push_status(
                            handle,
                            domain,
                            StreamState::open_suspect("Service is down"),
                            StatusCause::ServiceDown,
                        );
                    }
                }
                ServiceEvent::Removed(id, name) => {
                    for handle in self.bound_handles(id, Some(&name)) {
                        self.service_withdrawn(handle, now);
                    }
                }
            }
        }
    }

    /// Item handles bound to a service by identifier or by name.
    fn bound_handles(&self, id: ServiceId, name: Option<&str>) -> Vec<StreamHandle> {
        let mut bound = Vec::new();
        for handle in self.table.ordered_handles() {
            let Some(entry) = self.table.get(handle) else { continue };
            let matches = match &entry.key.service {
                Some(ServiceRef::Id(service_id)) => *service_id == id,
                Some(ServiceRef::Name(service_name)) => name == Some(service_name.as_str()),
                None => false,
            };
            if matches {
                bound.push(handle);
            }
        }
        bound
    }

    /// The owning service was deleted from the directory.
    fn service_withdrawn(&mut self, handle: StreamHandle, now: Instant) {
        if !self.config.single_open {
            self.close_entry_with_status(
                handle,
                StreamState::closed("Service was withdrawn"),
                StatusCause::ServiceNotAvailable,
                now,
            );
            return;
        }

        // hold the subscription for the service's return
        let info = {
            let Some(entry) = self.table.get(handle) else { return };
            if entry.status == StreamStatus::Closed {
                return;
            }
            (entry.domain, entry.wire_id)
        };
        let (domain, wire_id) = info;
        if let Some(id) = wire_id {
            match self.mux.remove_handle(id, handle) {
                Some(Unplace::Close(id)) => {
                    if self.phase == ChannelPhase::Up {
                        self.send_to_wire(Message::Close(CloseMsg { stream_id: id }));
                    }
                }
                Some(Unplace::Narrow(id, view)) => self.send_narrowing_reissue(id, view),
                _ => {}
            }
        }
        if let Some(entry) = self.table.get_mut(handle) {
            entry.status = StreamStatus::Pending;
            entry.wire_id = None;
            entry.request_timer.arm(now);
        }
        self.events.push_status(
            handle,
            domain,
            StreamState::open_suspect("Service was withdrawn"),
            StatusCause::ServiceDown,
        );
    }

    // Item streams

    fn on_item_message(&mut self, message: Message, now: Instant) {
        let id = message.stream_id();
        if self.mux.get(id).is_none() {
            // late traffic for an unregistered or re-routed stream
            trace!("Message for unknown stream {id}; dropping");
            return;
        }
        match message {
            Message::Refresh(refresh) => self.on_item_refresh(id, refresh, now),
            Message::Update(update) => self.on_item_update(id, update, now),
            Message::Status(status) => self.on_item_status(id, status, now),
            Message::Ack(ack) => self.on_item_ack(ack),
            other => {
                warn!("Unexpected message on item stream {id}: {:?}", other);
            }
        }
    }

    fn on_item_refresh(&mut self, id: StreamId, refresh: RefreshMsg, now: Instant) {
        if let Some(ws) = self.mux.get_mut(id) {
            ws.gap.baseline(refresh.seq_num);
        }
        let handles = match self.mux.get(id) {
            Some(ws) => ws.handles(),
            None => return,
        };

        let state = refresh.state.clone();
        let provider_closes = state.is_closing();
        let suspect_closes =
            state.is_suspect() && !self.config.allow_suspect_data && !provider_closes;

        let mut closed: Vec<(StreamHandle, DomainType)> = Vec::new();
        for handle in handles {
            let Some(entry) = self.table.get_mut(handle) else { continue };
            entry.request_timer.disarm();

            let snapshot_done = refresh.complete
                && (!entry.request.streaming || state.stream == StreamStateKind::NonStreaming);
            let terminal = provider_closes || suspect_closes || snapshot_done;
            entry.status = if terminal {
                StreamStatus::Closed
            } else {
                StreamStatus::Open
            };
            let domain = entry.domain;

            let msg = refresh.clone();
            self.events.push_refresh(handle, msg);
            if terminal {
                closed.push((handle, domain));
            }
        }

        for (handle, domain) in closed {
            if suspect_closes {
                self.events.push_status(
                    handle,
                    domain,
                    StreamState::closed("Suspect data is not allowed on this session"),
                    StatusCause::Provider,
                );
            }
            // a provider-completed stream needs no close on the wire
            self.finish_closed_entry(handle, now, suspect_closes);
        }
    }

    fn on_item_update(&mut self, id: StreamId, update: UpdateMsg, now: Instant) {
        let outcome = match self.mux.get_mut(id) {
            Some(ws) => ws.gap.on_update(update),
            None => return,
        };
        match outcome {
            GapOutcome::Deliver(messages) => {
                let handles = self.mux.get(id).map(|ws| ws.handles()).unwrap_or_default();
                for message in messages {
                    for handle in &handles {
                        self.events.push_update(*handle, message.clone());
                    }
                }
            }
            GapOutcome::Buffered | GapOutcome::Stale => {}
            GapOutcome::Resync => self.resync_stream(id, now),
        }
    }

    /// A sequence gap outgrew the buffer: the stream is re-requested on the
    /// same wire identity. Internal transition, surfaced to nobody.
    fn resync_stream(&mut self, id: StreamId, now: Instant) {
        info!("Sequence gap outgrew the buffer on stream {id}; re-requesting");
        let (view, handles) = match self.mux.get(id) {
            Some(ws) => (ws.view.clone(), ws.handles()),
            None => return,
        };
        let template = handles
            .first()
            .and_then(|handle| self.table.get(*handle))
            .map(|entry| entry.request.clone());

        for handle in &handles {
            if let Some(entry) = self.table.get_mut(*handle) {
                if entry.status == StreamStatus::Open {
                    entry.status = StreamStatus::Pending;
                }
                entry.request_timer.arm(now);
            }
        }
        if let Some(mut request) = template {
            request.stream_id = id;
            request.view = view;
            request.batch_items.clear();
            self.send_to_wire(Message::Request(request));
        }
    }

    fn on_item_status(&mut self, id: StreamId, status: StatusMsg, now: Instant) {
        let state = status.state.unwrap_or(StreamState {
            stream: StreamStateKind::Unspecified,
            data: DataState::NoChange,
            text: None,
        });
        let handles = self.mux.get(id).map(|ws| ws.handles()).unwrap_or_default();

        match state.stream {
            StreamStateKind::ClosedRecover if self.config.single_open => {
                // recoverable interruption: surfaced as open/suspect, the
                // streams re-request under the same service
                self.mux.remove_stream(id);
                for handle in &handles {
                    let Some(entry) = self.table.get_mut(*handle) else { continue };
                    entry.status = StreamStatus::Pending;
                    entry.wire_id = None;
                    entry.request_timer.disarm();
                    let domain = entry.domain;
                    let mut surfaced = state.clone();
                    surfaced.stream = StreamStateKind::Open;
                    surfaced.data = DataState::Suspect;
                    self.events
                        .push_status(*handle, domain, surfaced, StatusCause::Provider);
                }
                for handle in handles {
                    self.try_activate(handle, now, false);
                }
            }
            StreamStateKind::Closed | StreamStateKind::ClosedRecover => {
                self.mux.remove_stream(id);
                for handle in handles {
                    let Some(domain) = self.table.get(handle).map(|e| e.domain) else {
                        continue;
                    };
                    self.events
                        .push_status(handle, domain, state.clone(), StatusCause::Provider);
                    self.finish_closed_entry(handle, now, false);
                }
            }
            _ => {
                let closes = state.is_suspect() && !self.config.allow_suspect_data;
                for handle in handles {
                    let Some(domain) = self.table.get(handle).map(|e| e.domain) else {
                        continue;
                    };
                    let mut surfaced = state.clone();
                    if closes {
                        surfaced.stream = StreamStateKind::Closed;
                    }
                    self.events
                        .push_status(handle, domain, surfaced, StatusCause::Provider);
                    if closes {
                        self.finish_closed_entry(handle, now, true);
                    }
                }
            }
        }
    }

    fn on_item_ack(&mut self, ack: AckMsg) {
        let Some(record) = self.timeouts.acknowledge(ack.ack_id) else {
            warn!("Ack {} does not match an in-flight post; dropping", ack.ack_id);
            return;
        };
        self.events
            .push_ack(record.handle, record.post_id, ack.nak_code, ack.text);
    }

    // Timers

    fn poll_timers(&mut self, now: Instant) {
        if self.recovery.ready_to_connect(now) {
            self.events.push_channel(ChannelEventKind::Reconnecting, None);
            info!("Reconnect attempt {}", self.recovery.attempts());
            self.phase = ChannelPhase::Connecting;
            if self.transport.connect().is_err() {
                self.phase = ChannelPhase::Down;
                match self.recovery.connection_failed(now) {
                    ReconnectDecision::Schedule(delay) => {
                        trace!("Connect failed immediately; next attempt in {:?}", delay);
                    }
                    ReconnectDecision::GiveUp => {
                        self.abandon_recovery("Transport connect failed");
                    }
                }
            }
        }

        for action in self.timeouts.scan(&self.table, now) {
            match action {
                TimeoutAction::Request(handle) => self.request_timed_out(handle, now),
                TimeoutAction::Post(record) => {
                    // the stream itself is unaffected
                    self.events.push_ack(
                        record.handle,
                        record.post_id,
                        Some(NakCode::NoResponse),
                        Some("No acknowledgment received within the configured interval".to_string()),
                    );
                }
            }
        }
    }

    fn request_timed_out(&mut self, handle: StreamHandle, now: Instant) {
        if Some(handle) == self.login.handle {
            self.login_failed(
                StreamState::closed("Login request timed out"),
                StatusCause::RequestTimeout,
                true,
            );
            return;
        }

        let waiting_for_service = {
            let Some(entry) = self.table.get_mut(handle) else { return };
            entry.request_timer.disarm();
            entry.wire_id.is_none()
        };
        if waiting_for_service {
            self.close_entry_with_status(
                handle,
                StreamState::closed("Service was not found within the configured wait"),
                StatusCause::ServiceNotFound,
                now,
            );
        } else {
            self.close_entry_with_status(
                handle,
                StreamState::closed("Request timed out"),
                StatusCause::RequestTimeout,
                now,
            );
        }
    }

    // Wire plumbing

    /// Fire-and-forget send. A failure is remembered and folded into
    /// channel-down handling between processing steps.
    fn send_to_wire(&mut self, message: Message) {
        if let Err(err) = self.transport.send(message) {
            warn!("Transport send failed: {err}");
            if self.channel_failure.is_none() {
                self.channel_failure = Some(format!("Send failed: {err}"));
            }
        }
    }

    fn flush_channel_failure(&mut self, now: Instant) {
        if let Some(reason) = self.channel_failure.take() {
            if self.phase != ChannelPhase::Down {
                self.handle_channel_down(reason, now);
            }
        }
    }
}
