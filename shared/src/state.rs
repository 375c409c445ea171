/// Health of the data flowing on a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataState {
    /// The message does not change the previously communicated data state.
    NoChange,
    /// Data is current and usable.
    Ok,
    /// Data may be stale; the provider is unable to guarantee currency.
    Suspect,
}

/// Provider-assigned lifecycle of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStateKind {
    Unspecified,
    /// The stream is established and further data may arrive.
    Open,
    /// The refresh completes the stream; nothing further will arrive.
    NonStreaming,
    /// The stream is finished and must not be re-requested.
    Closed,
    /// The stream is finished but may be re-requested later.
    ClosedRecover,
}

impl StreamStateKind {
    /// Whether this state ends the stream from the provider's point of view.
    pub fn is_closing(&self) -> bool {
        matches!(self, StreamStateKind::Closed | StreamStateKind::ClosedRecover)
    }
}

/// State information carried on refresh and status messages: the stream's
/// lifecycle, the health of its data, and an optional human-readable text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamState {
    pub stream: StreamStateKind,
    pub data: DataState,
    pub text: Option<String>,
}

impl StreamState {
    pub fn open_ok() -> Self {
        Self {
            stream: StreamStateKind::Open,
            data: DataState::Ok,
            text: None,
        }
    }

    pub fn open_suspect(text: impl Into<String>) -> Self {
        Self {
            stream: StreamStateKind::Open,
            data: DataState::Suspect,
            text: Some(text.into()),
        }
    }

    pub fn non_streaming() -> Self {
        Self {
            stream: StreamStateKind::NonStreaming,
            data: DataState::Ok,
            text: None,
        }
    }

    pub fn closed(text: impl Into<String>) -> Self {
        Self {
            stream: StreamStateKind::Closed,
            data: DataState::Suspect,
            text: Some(text.into()),
        }
    }

    pub fn closed_recover(text: impl Into<String>) -> Self {
        Self {
            stream: StreamStateKind::ClosedRecover,
            data: DataState::Suspect,
            text: Some(text.into()),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.stream.is_closing()
    }

    pub fn is_suspect(&self) -> bool {
        self.data == DataState::Suspect
    }
}
