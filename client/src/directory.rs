use std::collections::HashSet;

use feedwatch_shared::{
    DomainType, ItemKey, RequestMsg, ServiceAction, ServiceDirectory, ServiceEvent,
    DIRECTORY_FILTER_GROUP, DIRECTORY_FILTER_INFO, DIRECTORY_FILTER_STATE, DIRECTORY_STREAM_ID,
};

use crate::handle::StreamHandle;

/// The directory stream and its service cache.
///
/// The stream itself is perpetual and consumer-internal: it is opened right
/// after every successful login whether or not the application registered
/// interest. An application handle, when present, just mirrors the
/// directory traffic as events.
pub(crate) struct DirectorySession {
    pub handle: Option<StreamHandle>,
    pub filter: u32,
    pub cache: ServiceDirectory,
    /// Whether a refresh has populated the cache since the last channel-up.
    pub loaded: bool,
}

impl DirectorySession {
    pub fn new() -> Self {
        Self {
            handle: None,
            filter: DIRECTORY_FILTER_INFO | DIRECTORY_FILTER_STATE | DIRECTORY_FILTER_GROUP,
            cache: ServiceDirectory::new(),
            loaded: false,
        }
    }

    pub fn wire_request(&self) -> RequestMsg {
        RequestMsg {
            stream_id: DIRECTORY_STREAM_ID,
            domain: DomainType::Directory,
            key: ItemKey {
                service: None,
                name: String::new(),
            },
            streaming: true,
            view: None,
            batch_items: Vec::new(),
            filter: self.filter,
            credentials: None,
        }
    }

    /// A refresh replaces the cache wholesale. Services that were known but
    /// are absent from the new image are surfaced as removals so bound
    /// streams can react.
    pub fn apply_refresh(&mut self, actions: Vec<ServiceAction>) -> Vec<ServiceEvent> {
        let previous: Vec<(u16, String)> = self
            .cache
            .services()
            .map(|s| (s.id, s.name.clone()))
            .collect();
        self.cache.clear();

        let mut events = Vec::new();
        for action in actions {
            if let Some(event) = self.cache.apply(action) {
                events.push(event);
            }
        }

        let surviving: HashSet<u16> = self.cache.services().map(|s| s.id).collect();
        for (id, name) in previous {
            if !surviving.contains(&id) {
                events.push(ServiceEvent::Removed(id, name));
            }
        }

        self.loaded = true;
        events
    }

    /// Updates apply incremental deltas on top of the current cache.
    pub fn apply_update(&mut self, actions: Vec<ServiceAction>) -> Vec<ServiceEvent> {
        actions
            .into_iter()
            .filter_map(|action| self.cache.apply(action))
            .collect()
    }

    /// Channel loss: the cache is stale until the next refresh, but its
    /// contents stick around so replay decisions have something to compare
    /// against.
    pub fn reset_for_reconnect(&mut self) {
        self.loaded = false;
    }
}
