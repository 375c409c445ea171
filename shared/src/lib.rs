//! # Feedwatch Shared
//! Message model, transport abstraction and configuration shared between
//! the feedwatch crates.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod config;
mod message;
mod sequence;
mod service;
mod state;
mod timer;
mod transport;
mod types;
mod view;

pub use config::{ConfigError, ReconnectLimit, WatchlistConfig};
pub use message::{
    AckMsg, CloseMsg, DomainType, ItemKey, LoginFeatures, LoginRequest, Message, NakCode, Payload,
    PostMsg, RefreshMsg, RequestMsg, ServiceRef, StatusMsg, SymbolAction, UpdateMsg,
};
pub use sequence::{seq_advance, seq_greater_than, seq_less_than, seq_next};
pub use service::{
    Qos, QosRate, QosTimeliness, Service, ServiceAction, ServiceDirectory, ServiceEvent,
    ServiceState, ServiceUpdate, DIRECTORY_FILTER_GROUP, DIRECTORY_FILTER_INFO,
    DIRECTORY_FILTER_STATE,
};
pub use state::{DataState, StreamState, StreamStateKind};
pub use timer::Timer;
pub use transport::{RecvError, SendError, Transport, TransportEvent};
pub use types::{
    PostId, SequenceNumber, ServiceId, StreamId, DIRECTORY_STREAM_ID, ITEM_STREAM_ID_START,
    LOGIN_STREAM_ID,
};
pub use view::ViewSpec;
