//! # Feedwatch Client
//! The client-side watchlist: keeps market-data subscriptions alive and
//! semantically consistent across connection churn, packet loss and
//! provider failures, surfacing a single ordered event stream to the
//! application.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod directory;
mod error;
mod events;
mod gap;
mod handle;
mod multiplex;
mod recovery;
mod session;
mod stream;
mod timeout;
mod watchlist;

pub use error::WatchlistError;
pub use events::{
    AckEvent, ChannelEvent, ChannelEventKind, Events, RefreshEvent, StatusCause, StatusEvent,
    UpdateEvent, WatchlistEvent,
};
pub use handle::StreamHandle;
pub use session::LoginState;
pub use stream::StreamStatus;
pub use watchlist::Watchlist;
