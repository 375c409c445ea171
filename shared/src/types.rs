/// Protocol-level stream identifier. Unique among currently-open streams on
/// a channel; reassigned on every reconnect.
pub type StreamId = i32;

/// Wrapping sequence number carried on multicast-fed streams.
pub type SequenceNumber = u32;

/// Identifier a provider assigns to one of its services.
pub type ServiceId = u16;

/// Application-chosen identifier correlating a post with its acknowledgment.
pub type PostId = u32;

/// The login stream always occupies the first stream identifier on a channel.
pub const LOGIN_STREAM_ID: StreamId = 1;

/// The directory stream always occupies the second stream identifier on a channel.
pub const DIRECTORY_STREAM_ID: StreamId = 2;

/// Item streams are allocated identifiers from here upward, per channel session.
pub const ITEM_STREAM_ID_START: StreamId = 3;
