use std::collections::VecDeque;
use std::time::{Duration, Instant};

use feedwatch_shared::{PostId, WatchlistConfig};

use crate::{handle::StreamHandle, stream::StreamTable};

/// An in-flight post awaiting provider acknowledgment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PostRecord {
    pub handle: StreamHandle,
    pub post_id: PostId,
    pub deadline: Instant,
}

/// A deadline that fired during the timer scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TimeoutAction {
    /// A sent request went unanswered past the request timeout.
    Request(StreamHandle),
    /// A post went unacknowledged past the post-ack timeout.
    Post(PostRecord),
}

/// Coarse timer scan driven by each dispatch call.
///
/// Request deadlines live on the stream entries themselves; post deadlines
/// are tracked here because a post's lifetime is independent of its
/// stream's state. The post queue stays sorted by construction since every
/// post gets the same interval.
pub(crate) struct TimeoutManager {
    post_ack_timeout: Duration,
    posts: VecDeque<PostRecord>,
}

impl TimeoutManager {
    pub fn new(config: &WatchlistConfig) -> Self {
        Self {
            post_ack_timeout: config.post_ack_timeout,
            posts: VecDeque::new(),
        }
    }

    /// Starts the acknowledgment clock for a post. A zero interval disables
    /// tracking.
    pub fn track_post(&mut self, handle: StreamHandle, post_id: PostId, now: Instant) {
        if self.post_ack_timeout.is_zero() {
            return;
        }
        self.posts.push_back(PostRecord {
            handle,
            post_id,
            deadline: now + self.post_ack_timeout,
        });
    }

    /// Settles the oldest in-flight post with the given identifier.
    pub fn acknowledge(&mut self, post_id: PostId) -> Option<PostRecord> {
        let index = self.posts.iter().position(|p| p.post_id == post_id)?;
        self.posts.remove(index)
    }

    /// Unregistration stops all event delivery for the handle, pending
    /// acknowledgments included.
    pub fn forget_handle(&mut self, handle: StreamHandle) {
        self.posts.retain(|p| p.handle != handle);
    }

    /// Session teardown drops every in-flight post.
    pub fn clear(&mut self) {
        self.posts.clear();
    }

    /// Scans every deadline once. Ringing request timers are left armed;
    /// the caller decides whether the stream closes or retries.
    pub fn scan(&mut self, table: &StreamTable, now: Instant) -> Vec<TimeoutAction> {
        let mut actions = Vec::new();

        for handle in table.all_handles() {
            if let Some(entry) = table.get(handle) {
                if entry.request_timer.ringing(now) {
                    actions.push(TimeoutAction::Request(handle));
                }
            }
        }

        while let Some(front) = self.posts.front() {
            if front.deadline > now {
                break;
            }
            let record = self.posts.pop_front().expect("front exists");
            actions.push(TimeoutAction::Post(record));
        }

        actions
    }
}
