use std::collections::HashMap;

use crate::{
    handle::{HandleGenerator, StreamHandle},
    stream::entry::StreamEntry,
};

/// The authoritative map from application handle to stream state.
///
/// Item submission order is tracked separately so that recovery can replay
/// streams in the relative order the application created them.
pub(crate) struct StreamTable {
    entries: HashMap<StreamHandle, StreamEntry>,
    order: Vec<StreamHandle>,
    handles: HandleGenerator,
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            handles: HandleGenerator::new(),
        }
    }

    pub fn next_handle(&mut self) -> StreamHandle {
        self.handles.generate()
    }

    /// Inserts an entry. Item entries join the submission-order list;
    /// session streams and batch aggregates do not.
    pub fn insert(&mut self, entry: StreamEntry, track_order: bool) {
        let handle = entry.handle;
        debug_assert!(!self.entries.contains_key(&handle));
        if track_order {
            self.order.push(handle);
        }
        self.entries.insert(handle, entry);
    }

    pub fn get(&self, handle: StreamHandle) -> Option<&StreamEntry> {
        self.entries.get(&handle)
    }

    pub fn get_mut(&mut self, handle: StreamHandle) -> Option<&mut StreamEntry> {
        self.entries.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: StreamHandle) -> Option<StreamEntry> {
        self.order.retain(|h| *h != handle);
        self.entries.remove(&handle)
    }

    /// Item handles in original submission order.
    pub fn ordered_handles(&self) -> Vec<StreamHandle> {
        self.order.clone()
    }

    /// Every handle in the table, in no particular order.
    pub fn all_handles(&self) -> Vec<StreamHandle> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod stream_table_tests {
    use super::*;
    use feedwatch_shared::{RequestMsg, ServiceRef};
    use std::time::Duration;

    fn entry_for(table: &mut StreamTable, name: &str) -> StreamEntry {
        let handle = table.next_handle();
        StreamEntry::new(
            handle,
            RequestMsg::market_price(ServiceRef::Name("FEED".to_string()), name),
            Duration::from_secs(15),
        )
    }

    #[test]
    fn submission_order_is_preserved() {
        let mut table = StreamTable::new();

        let first = entry_for(&mut table, "A");
        let second = entry_for(&mut table, "B");
        let third = entry_for(&mut table, "C");
        let (h1, h2, h3) = (first.handle, second.handle, third.handle);
        table.insert(first, true);
        table.insert(second, true);
        table.insert(third, true);

        assert_eq!(table.ordered_handles(), vec![h1, h2, h3]);
    }

    #[test]
    fn removal_drops_entry_and_order_slot() {
        let mut table = StreamTable::new();

        let first = entry_for(&mut table, "A");
        let second = entry_for(&mut table, "B");
        let (h1, h2) = (first.handle, second.handle);
        table.insert(first, true);
        table.insert(second, true);

        assert!(table.remove(h1).is_some());
        assert!(table.get(h1).is_none());
        assert_eq!(table.ordered_handles(), vec![h2]);
        assert!(table.remove(h1).is_none());
    }

    #[test]
    fn untracked_entries_stay_out_of_replay_order() {
        let mut table = StreamTable::new();

        let session = entry_for(&mut table, "LOGIN");
        let item = entry_for(&mut table, "A");
        let item_handle = item.handle;
        table.insert(session, false);
        table.insert(item, true);

        assert_eq!(table.ordered_handles(), vec![item_handle]);
        assert_eq!(table.len(), 2);
    }
}
