use crate::{
    service::ServiceAction,
    state::StreamState,
    types::{PostId, SequenceNumber, ServiceId, StreamId},
    view::ViewSpec,
};

/// Message-model domain a stream belongs to. Opaque to the reliability
/// layer beyond routing: session domains (login, directory) are handled
/// internally, everything else is an item subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DomainType {
    Login,
    Directory,
    MarketPrice,
    MarketByOrder,
    SymbolList,
}

impl DomainType {
    /// Whether streams of this domain are item subscriptions routed through
    /// the service directory, as opposed to session-level streams.
    pub fn is_item(&self) -> bool {
        !matches!(self, DomainType::Login | DomainType::Directory)
    }
}

/// Reference to a service, by provider-assigned identifier or by name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ServiceRef {
    Id(ServiceId),
    Name(String),
}

/// Identity of a subscription: the service it is requested from and the
/// item name within that service.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub service: Option<ServiceRef>,
    pub name: String,
}

impl ItemKey {
    pub fn new(service: ServiceRef, name: impl Into<String>) -> Self {
        Self {
            service: Some(service),
            name: name.into(),
        }
    }
}

/// Login parameters; replayed verbatim when a session is re-established.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginRequest {
    pub user_name: String,
    pub application_id: String,
    pub position: String,
}

impl LoginRequest {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            application_id: String::new(),
            position: String::new(),
        }
    }
}

/// Capabilities negotiated in the login refresh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoginFeatures {
    pub supports_batch_requests: bool,
    pub supports_view_requests: bool,
    pub supports_posting: bool,
}

impl LoginFeatures {
    pub fn all() -> Self {
        Self {
            supports_batch_requests: true,
            supports_view_requests: true,
            supports_posting: true,
        }
    }
}

/// Negative-acknowledgment reason carried on an ack message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NakCode {
    AccessDenied,
    DeniedBySource,
    SourceDown,
    NoResources,
    /// No acknowledgment arrived within the configured interval.
    NoResponse,
    SymbolUnknown,
    NotOpen,
    InvalidContent,
}

/// Membership change on a symbol-list stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SymbolAction {
    Add(String),
    Update(String),
    Delete(String),
}

/// Decoded message body. Item payloads stay opaque to the reliability
/// layer; only session domains carry structured content it inspects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Payload {
    #[default]
    None,
    /// Undecoded item data, passed through untouched.
    Opaque(Vec<u8>),
    /// Capabilities granted in a login refresh.
    Login(LoginFeatures),
    /// Service description actions in a directory refresh or update.
    Services(Vec<ServiceAction>),
    /// Membership actions on a symbol-list stream.
    Symbols(Vec<SymbolAction>),
}

/// A subscription request, either application-submitted or generated for
/// the wire. `stream_id` is meaningless until the watchlist assigns one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub key: ItemKey,
    /// Streaming subscriptions stay open after the refresh; non-streaming
    /// requests are snapshots that end with it.
    pub streaming: bool,
    pub view: Option<ViewSpec>,
    /// Member item names when this is a batch request.
    pub batch_items: Vec<String>,
    /// Filter bits on a directory request; zero elsewhere.
    pub filter: u32,
    /// Login parameters on a login request; absent elsewhere.
    pub credentials: Option<LoginRequest>,
}

impl RequestMsg {
    fn item(domain: DomainType, key: ItemKey) -> Self {
        Self {
            stream_id: 0,
            domain,
            key,
            streaming: true,
            view: None,
            batch_items: Vec::new(),
            filter: 0,
            credentials: None,
        }
    }

    pub fn market_price(service: ServiceRef, name: impl Into<String>) -> Self {
        Self::item(DomainType::MarketPrice, ItemKey::new(service, name))
    }

    pub fn market_by_order(service: ServiceRef, name: impl Into<String>) -> Self {
        Self::item(DomainType::MarketByOrder, ItemKey::new(service, name))
    }

    pub fn symbol_list(service: ServiceRef, name: impl Into<String>) -> Self {
        Self::item(DomainType::SymbolList, ItemKey::new(service, name))
    }

    pub fn batch(service: ServiceRef, items: Vec<String>) -> Self {
        let mut request = Self::item(DomainType::MarketPrice, ItemKey::new(service, ""));
        request.batch_items = items;
        request
    }

    pub fn snapshot(mut self) -> Self {
        self.streaming = false;
        self
    }

    pub fn with_view(mut self, view: ViewSpec) -> Self {
        self.view = Some(view);
        self
    }
}

/// A solicited or unsolicited image for a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub state: StreamState,
    pub solicited: bool,
    /// Whether this refresh completes the image.
    pub complete: bool,
    pub seq_num: Option<SequenceNumber>,
    pub body: Payload,
}

/// An incremental change to a stream's data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub seq_num: Option<SequenceNumber>,
    pub body: Payload,
}

/// A stream-state notification without data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub state: Option<StreamState>,
}

/// Closes a stream from the consumer side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseMsg {
    pub stream_id: StreamId,
}

/// An application-originated message requiring provider acknowledgment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostMsg {
    pub stream_id: StreamId,
    pub post_id: PostId,
    pub body: Payload,
}

impl PostMsg {
    pub fn new(post_id: PostId, body: Payload) -> Self {
        Self {
            stream_id: 0,
            post_id,
            body,
        }
    }
}

/// Provider acknowledgment (positive or negative) of a post.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckMsg {
    pub stream_id: StreamId,
    pub ack_id: PostId,
    pub nak_code: Option<NakCode>,
    pub text: Option<String>,
}

/// A decoded wire message. The codec collaborator produces and consumes
/// these; the reliability layer never sees bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Request(RequestMsg),
    Refresh(RefreshMsg),
    Update(UpdateMsg),
    Status(StatusMsg),
    Close(CloseMsg),
    Post(PostMsg),
    Ack(AckMsg),
}

impl Message {
    pub fn stream_id(&self) -> StreamId {
        match self {
            Message::Request(msg) => msg.stream_id,
            Message::Refresh(msg) => msg.stream_id,
            Message::Update(msg) => msg.stream_id,
            Message::Status(msg) => msg.stream_id,
            Message::Close(msg) => msg.stream_id,
            Message::Post(msg) => msg.stream_id,
            Message::Ack(msg) => msg.stream_id,
        }
    }
}
