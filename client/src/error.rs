use thiserror::Error;

use feedwatch_shared::{ConfigError, DomainType, SendError};

use crate::handle::StreamHandle;

/// Errors that can occur submitting operations to the watchlist
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchlistError {
    /// No stream exists for the given handle
    #[error("Unknown stream handle {handle:?}. The stream was closed, unregistered, or never existed")]
    UnknownHandle { handle: StreamHandle },

    /// Session-level domains have dedicated entry points
    #[error("{domain:?} streams cannot be opened through submit; use login() or request_directory()")]
    SessionDomain { domain: DomainType },

    /// Item requests must be routable through the directory
    #[error("Item requests must name a service")]
    MissingService,

    /// A reissue may change view, streaming mode or payload, nothing else
    #[error("A reissue must keep the stream's domain and item identity; open a new stream instead")]
    IdentityMismatch,

    /// The negotiated login identity is fixed for the session
    #[error("Login user name cannot change on reissue")]
    LoginIdentityChange,

    /// Batch requests need at least one member
    #[error("Batch request must name at least one item")]
    EmptyBatch,

    /// Batch aggregates have no wire stream of their own
    #[error("Batch aggregates cannot be reissued; reissue the member streams instead")]
    BatchAggregate,

    /// The provider did not grant the required capability at login
    #[error("Provider did not negotiate {feature} support on this session")]
    FeatureUnavailable { feature: &'static str },

    /// The operation needs an established stream
    #[error("Stream is not open; the operation needs an established stream")]
    StreamNotOpen,

    /// No more wire stream identifiers can be allocated on this channel
    #[error("Stream identifier space is exhausted on this channel")]
    StreamIdExhausted,

    /// The configuration was rejected before any channel activity
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The transport refused to start a connection attempt
    #[error("Transport connect failed: {0}")]
    Connect(#[from] SendError),
}
