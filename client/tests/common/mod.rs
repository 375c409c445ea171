//! Shared fixture for the scenario tests: a scripted in-memory transport
//! plus provider-side helpers for logging in, publishing services and
//! feeding streams.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use feedwatch_client::{StreamHandle, Watchlist, WatchlistEvent};
use feedwatch_shared::{
    AckMsg, DomainType, LoginFeatures, LoginRequest, Message, NakCode, Payload, PostId,
    RecvError, RefreshMsg, RequestMsg, SendError, Service, ServiceAction, ServiceRef, StatusMsg,
    StreamId, StreamState, Transport, TransportEvent, UpdateMsg, WatchlistConfig,
    DIRECTORY_STREAM_ID, LOGIN_STREAM_ID,
};

#[derive(Default)]
struct Shared {
    inbound: VecDeque<TransportEvent>,
    sent: Vec<Message>,
    connect_calls: usize,
    refuse_connect: bool,
    fail_sends: bool,
}

/// The watchlist-facing side of the scripted transport.
pub struct ScriptedTransport {
    shared: Rc<RefCell<Shared>>,
}

impl Transport for ScriptedTransport {
    fn connect(&mut self) -> Result<(), SendError> {
        let mut shared = self.shared.borrow_mut();
        shared.connect_calls += 1;
        if shared.refuse_connect {
            return Err(SendError::NotConnected);
        }
        Ok(())
    }

    fn send(&mut self, message: Message) -> Result<(), SendError> {
        let mut shared = self.shared.borrow_mut();
        if shared.fail_sends {
            return Err(SendError::NotConnected);
        }
        shared.sent.push(message);
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<TransportEvent>, RecvError> {
        Ok(self.shared.borrow_mut().inbound.pop_front())
    }
}

/// The provider/test side of the scripted transport.
#[derive(Clone)]
pub struct Remote {
    shared: Rc<RefCell<Shared>>,
}

impl Remote {
    pub fn push(&self, event: TransportEvent) {
        self.shared.borrow_mut().inbound.push_back(event);
    }

    pub fn push_msg(&self, message: Message) {
        self.push(TransportEvent::Message(message));
    }

    pub fn channel_up(&self) {
        self.push(TransportEvent::ChannelUp);
    }

    pub fn channel_down(&self, reason: &str) {
        self.push(TransportEvent::ChannelDown {
            reason: reason.to_string(),
        });
    }

    /// Drains everything the watchlist sent to the wire.
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut self.shared.borrow_mut().sent)
    }

    pub fn connect_calls(&self) -> usize {
        self.shared.borrow().connect_calls
    }

    pub fn set_refuse_connect(&self, refuse: bool) {
        self.shared.borrow_mut().refuse_connect = refuse;
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.shared.borrow_mut().fail_sends = fail;
    }
}

pub fn transport_pair() -> (Box<dyn Transport>, Remote) {
    let shared = Rc::new(RefCell::new(Shared::default()));
    (
        Box::new(ScriptedTransport {
            shared: shared.clone(),
        }),
        Remote { shared },
    )
}

// Message builders (the provider side of the conversation)

pub fn default_service() -> Service {
    Service::new(
        1,
        "FEED",
        vec![
            DomainType::MarketPrice,
            DomainType::MarketByOrder,
            DomainType::SymbolList,
        ],
    )
}

pub fn feed() -> ServiceRef {
    ServiceRef::Name("FEED".to_string())
}

pub fn login_accept(features: LoginFeatures) -> Message {
    Message::Refresh(RefreshMsg {
        stream_id: LOGIN_STREAM_ID,
        domain: DomainType::Login,
        state: StreamState::open_ok(),
        solicited: true,
        complete: true,
        seq_num: None,
        body: Payload::Login(features),
    })
}

pub fn login_reject(text: &str) -> Message {
    Message::Status(StatusMsg {
        stream_id: LOGIN_STREAM_ID,
        domain: DomainType::Login,
        state: Some(StreamState::closed(text)),
    })
}

pub fn directory_refresh(services: Vec<Service>) -> Message {
    Message::Refresh(RefreshMsg {
        stream_id: DIRECTORY_STREAM_ID,
        domain: DomainType::Directory,
        state: StreamState::open_ok(),
        solicited: true,
        complete: true,
        seq_num: None,
        body: Payload::Services(services.into_iter().map(ServiceAction::Add).collect()),
    })
}

pub fn directory_update(actions: Vec<ServiceAction>) -> Message {
    Message::Update(UpdateMsg {
        stream_id: DIRECTORY_STREAM_ID,
        domain: DomainType::Directory,
        seq_num: None,
        body: Payload::Services(actions),
    })
}

pub fn item_refresh(stream_id: StreamId, seq_num: Option<u32>) -> Message {
    Message::Refresh(RefreshMsg {
        stream_id,
        domain: DomainType::MarketPrice,
        state: StreamState::open_ok(),
        solicited: true,
        complete: true,
        seq_num,
        body: Payload::Opaque(vec![0xfe, 0xed]),
    })
}

pub fn item_update(stream_id: StreamId, seq_num: Option<u32>) -> Message {
    Message::Update(UpdateMsg {
        stream_id,
        domain: DomainType::MarketPrice,
        seq_num,
        body: Payload::Opaque(vec![0xbe, 0xef]),
    })
}

pub fn item_status(stream_id: StreamId, state: StreamState) -> Message {
    Message::Status(StatusMsg {
        stream_id,
        domain: DomainType::MarketPrice,
        state: Some(state),
    })
}

pub fn post_ack(stream_id: StreamId, ack_id: PostId, nak_code: Option<NakCode>) -> Message {
    Message::Ack(AckMsg {
        stream_id,
        ack_id,
        nak_code,
        text: None,
    })
}

// Inspection helpers

/// Requests the watchlist put on the wire, in send order.
pub fn requests_of(sent: &[Message]) -> Vec<&RequestMsg> {
    sent.iter()
        .filter_map(|message| match message {
            Message::Request(request) => Some(request),
            _ => None,
        })
        .collect()
}

/// The wire stream id assigned to the request for the given item name.
pub fn wire_id_for(sent: &[Message], name: &str) -> StreamId {
    requests_of(sent)
        .iter()
        .rev()
        .find(|request| request.key.name == name)
        .map(|request| request.stream_id)
        .unwrap_or_else(|| panic!("no request for item {name:?} was sent"))
}

// Fixture

pub struct Fixture {
    pub watchlist: Watchlist,
    pub remote: Remote,
}

impl Fixture {
    pub fn new(config: WatchlistConfig) -> Self {
        let (transport, remote) = transport_pair();
        let watchlist = Watchlist::new(config, transport).expect("configuration is valid");
        Self { watchlist, remote }
    }

    pub fn dispatch(&mut self) -> Vec<WatchlistEvent> {
        self.watchlist
            .dispatch(Duration::from_secs(1))
            .into_iter()
            .collect()
    }

    /// Brings the session up: channel up, login accepted with the given
    /// capabilities, directory published. Returns the login handle.
    /// Events produced along the way are drained.
    pub fn establish_session_with(
        &mut self,
        features: LoginFeatures,
        services: Vec<Service>,
    ) -> StreamHandle {
        let login = self
            .watchlist
            .login(LoginRequest::new("user"))
            .expect("login accepted");
        self.remote.channel_up();
        self.remote.push_msg(login_accept(features));
        self.remote.push_msg(directory_refresh(services));
        self.dispatch();
        self.remote.take_sent();
        login
    }

    /// Standard session: every capability granted, one service "FEED" up.
    pub fn establish_session(&mut self) -> StreamHandle {
        self.establish_session_with(LoginFeatures::all(), vec![default_service()])
    }

    /// Submits a market-price item on FEED and feeds its solicited refresh.
    /// Returns the handle and the assigned wire stream id.
    pub fn open_item(&mut self, name: &str) -> (StreamHandle, StreamId) {
        let handle = self
            .watchlist
            .submit(RequestMsg::market_price(feed(), name))
            .expect("submit accepted");
        let sent = self.remote.take_sent();
        let id = wire_id_for(&sent, name);
        self.remote.push_msg(item_refresh(id, None));
        self.dispatch();
        (handle, id)
    }
}
