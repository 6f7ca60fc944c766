// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Owning collections of publishers and subscribers, keyed by a stable
//! generation+index handle (§3 invariant 4: registering a colliding address
//! key is rejected rather than silently shadowing the existing entry).

use crate::error::{TrdpError, TrdpResult};
use crate::pd::publisher::{Publisher, PublisherHandle};
use crate::pd::subscriber::{Subscriber, SubscriberHandle};

/// Every active publisher in a session.
#[derive(Default)]
pub struct PublisherTable {
    entries: Vec<Option<Publisher>>,
    next_generation: u32,
}

impl PublisherTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_generation: 1,
        }
    }

    /// Register `publisher`, rejecting it with [`TrdpError::Param`] if its
    /// address key collides with an existing publisher's.
    pub fn insert(&mut self, mut publisher: Publisher) -> TrdpResult<PublisherHandle> {
        if self.entries.iter().flatten().any(|p| p.addr.collides_with(&publisher.addr)) {
            return Err(TrdpError::Param("publisher address already registered"));
        }
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        publisher.generation = generation;
        if let Some(idx) = self.entries.iter().position(|e| e.is_none()) {
            self.entries[idx] = Some(publisher);
            return Ok(PublisherHandle { index: idx, generation });
        }
        self.entries.push(Some(publisher));
        Ok(PublisherHandle {
            index: self.entries.len() - 1,
            generation,
        })
    }

    pub fn remove(&mut self, handle: PublisherHandle) -> Option<Publisher> {
        let slot = self.entries.get_mut(handle.index)?;
        if slot.as_ref()?.generation != handle.generation {
            return None;
        }
        slot.take()
    }

    #[must_use]
    pub fn get(&self, handle: PublisherHandle) -> Option<&Publisher> {
        self.entries
            .get(handle.index)
            .and_then(|e| e.as_ref())
            .filter(|e| e.generation == handle.generation)
    }

    #[must_use]
    pub fn get_mut(&mut self, handle: PublisherHandle) -> Option<&mut Publisher> {
        self.entries
            .get_mut(handle.index)
            .and_then(|e| e.as_mut())
            .filter(|e| e.generation == handle.generation)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PublisherHandle, &mut Publisher)> {
        self.entries.iter_mut().enumerate().filter_map(|(i, e)| {
            e.as_mut().map(|p| {
                (
                    PublisherHandle {
                        index: i,
                        generation: p.generation,
                    },
                    p,
                )
            })
        })
    }

    /// Find the publisher nominated to answer a PD-Pull `Pr` for `com_id`
    /// (§4.3). At most one publisher is ever registered per comId
    /// (invariant 4 over the address key), so the first match is the only
    /// one.
    pub fn find_by_com_id_mut(&mut self, com_id: u32) -> Option<&mut Publisher> {
        self.entries.iter_mut().flatten().find(|p| p.addr.com_id == com_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every active subscriber in a session.
///
/// `index`/`fast_path` implement §4.3's "Indexed fast-path": when enabled,
/// subscribers are additionally tracked in a `(comId, entry index)` array
/// kept sorted by `comId`, so dispatch can binary-search instead of
/// scanning every subscriber. The array is only as fresh as the last
/// [`Self::update_session`] call; inserts/removals after that mark it
/// dirty and [`Self::for_each_matching`] falls back to a linear scan until
/// the index is rebuilt, exactly as the reference "duplicates fall back to
/// linear scan" rule describes.
#[derive(Default)]
pub struct SubscriberTable {
    entries: Vec<Option<Subscriber>>,
    next_generation: u32,
    fast_path: bool,
    index: Vec<(u32, usize)>,
    index_dirty: bool,
}

impl SubscriberTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_generation: 1,
            fast_path: false,
            index: Vec::new(),
            index_dirty: true,
        }
    }

    /// Turn on the indexed fast-path and build the initial index.
    pub fn enable_fast_path(&mut self) {
        self.fast_path = true;
        self.update_session();
    }

    /// Rebuild the `comId`-sorted index from the current entries. Called
    /// explicitly after bulk registration, per §4.3.
    pub fn update_session(&mut self) {
        self.index.clear();
        self.index
            .extend(self.entries.iter().enumerate().filter_map(|(i, e)| e.as_ref().map(|s| (s.addr.com_id, i))));
        self.index.sort_unstable_by_key(|(com_id, _)| *com_id);
        self.index_dirty = false;
    }

    pub fn insert(&mut self, mut subscriber: Subscriber) -> TrdpResult<SubscriberHandle> {
        if self.entries.iter().flatten().any(|s| s.addr.collides_with(&subscriber.addr)) {
            return Err(TrdpError::Param("subscriber address already registered"));
        }
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        subscriber.generation = generation;
        self.index_dirty = true;
        if let Some(idx) = self.entries.iter().position(|e| e.is_none()) {
            self.entries[idx] = Some(subscriber);
            return Ok(SubscriberHandle { index: idx, generation });
        }
        self.entries.push(Some(subscriber));
        Ok(SubscriberHandle {
            index: self.entries.len() - 1,
            generation,
        })
    }

    pub fn remove(&mut self, handle: SubscriberHandle) -> Option<Subscriber> {
        let slot = self.entries.get_mut(handle.index)?;
        if slot.as_ref()?.generation != handle.generation {
            return None;
        }
        self.index_dirty = true;
        slot.take()
    }

    #[must_use]
    pub fn get(&self, handle: SubscriberHandle) -> Option<&Subscriber> {
        self.entries
            .get(handle.index)
            .and_then(|e| e.as_ref())
            .filter(|e| e.generation == handle.generation)
    }

    #[must_use]
    pub fn get_mut(&mut self, handle: SubscriberHandle) -> Option<&mut Subscriber> {
        self.entries
            .get_mut(handle.index)
            .and_then(|e| e.as_mut())
            .filter(|e| e.generation == handle.generation)
    }

    /// Every registered subscriber, regardless of comId — used by the
    /// scheduler to sweep receive deadlines independent of which comId just
    /// arrived.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SubscriberHandle, &mut Subscriber)> {
        self.entries.iter_mut().enumerate().filter_map(|(i, e)| {
            e.as_mut().map(|s| {
                (
                    SubscriberHandle {
                        index: i,
                        generation: s.generation,
                    },
                    s,
                )
            })
        })
    }

    /// Every subscriber registered under `com_id`, passed one at a time to
    /// `f` (a callback rather than a returned iterator, since the indexed
    /// path looks up disjoint entries by index rather than scanning a
    /// contiguous run). When the fast-path is enabled and the index is not
    /// stale, this binary-searches the sorted `(comId, index)` array;
    /// otherwise it falls back to a linear scan of every subscriber, per
    /// §4.3's "falling back to a linear scan on duplicates" rule.
    pub fn for_each_matching(&mut self, com_id: u32, mut f: impl FnMut(SubscriberHandle, &mut Subscriber)) {
        if self.fast_path && !self.index_dirty {
            let start = self.index.partition_point(|(c, _)| *c < com_id);
            let mut i = start;
            while i < self.index.len() && self.index[i].0 == com_id {
                let entry_idx = self.index[i].1;
                if let Some(s) = self.entries.get_mut(entry_idx).and_then(|e| e.as_mut()) {
                    f(
                        SubscriberHandle {
                            index: entry_idx,
                            generation: s.generation,
                        },
                        s,
                    );
                }
                i += 1;
            }
            return;
        }
        for (i, e) in self.entries.iter_mut().enumerate() {
            if let Some(s) = e {
                if s.addr.com_id == com_id {
                    f(
                        SubscriberHandle {
                            index: i,
                            generation: s.generation,
                        },
                        s,
                    );
                }
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PdTimeoutBehavior, SendParams};
    use crate::pd::AddressKey;
    use std::time::Duration;

    #[test]
    fn colliding_publisher_registration_rejected() {
        let mut table = PublisherTable::new();
        let p1 = Publisher::new(AddressKey::for_com_id(10), Duration::from_millis(10), 0, SendParams::default(), b"a").unwrap();
        table.insert(p1).unwrap();
        let p2 = Publisher::new(AddressKey::for_com_id(10), Duration::from_millis(10), 0, SendParams::default(), b"b").unwrap();
        assert!(table.insert(p2).is_err());
    }

    #[test]
    fn distinct_com_ids_both_register() {
        let mut table = PublisherTable::new();
        let p1 = Publisher::new(AddressKey::for_com_id(10), Duration::from_millis(10), 0, SendParams::default(), b"a").unwrap();
        let p2 = Publisher::new(AddressKey::for_com_id(11), Duration::from_millis(10), 0, SendParams::default(), b"b").unwrap();
        table.insert(p1).unwrap();
        table.insert(p2).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn stale_handle_after_removal_does_not_resolve() {
        let mut table = SubscriberTable::new();
        let s = Subscriber::new(AddressKey::for_com_id(20), Duration::from_millis(100), PdTimeoutBehavior::KeepLastValue);
        let h = table.insert(s).unwrap();
        table.remove(h);
        let s2 = Subscriber::new(AddressKey::for_com_id(21), Duration::from_millis(100), PdTimeoutBehavior::KeepLastValue);
        let h2 = table.insert(s2).unwrap();
        assert_eq!(h2.index, h.index);
        assert_ne!(h2.generation, h.generation);
        assert!(table.get(h).is_none());
        assert!(table.get(h2).is_some());
    }

    #[test]
    fn for_each_matching_linear_scan_finds_by_com_id() {
        let mut table = SubscriberTable::new();
        table
            .insert(Subscriber::new(AddressKey::for_com_id(2001), Duration::from_millis(100), PdTimeoutBehavior::KeepLastValue))
            .unwrap();
        table
            .insert(Subscriber::new(AddressKey::for_com_id(2002), Duration::from_millis(100), PdTimeoutBehavior::KeepLastValue))
            .unwrap();
        let mut hits = 0;
        table.for_each_matching(2001, |_, _| hits += 1);
        assert_eq!(hits, 1);
    }

    #[test]
    fn for_each_matching_uses_index_once_fast_path_enabled() {
        let mut table = SubscriberTable::new();
        for com_id in [2001, 2002, 2003] {
            table
                .insert(Subscriber::new(AddressKey::for_com_id(com_id), Duration::from_millis(100), PdTimeoutBehavior::KeepLastValue))
                .unwrap();
        }
        table.enable_fast_path();
        let mut hits = Vec::new();
        table.for_each_matching(2002, |h, s| hits.push((h, s.addr.com_id)));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, 2002);
    }

    #[test]
    fn fast_path_falls_back_to_linear_scan_after_insert_without_update_session() {
        let mut table = SubscriberTable::new();
        table
            .insert(Subscriber::new(AddressKey::for_com_id(3001), Duration::from_millis(100), PdTimeoutBehavior::KeepLastValue))
            .unwrap();
        table.enable_fast_path();
        table
            .insert(Subscriber::new(AddressKey::for_com_id(3002), Duration::from_millis(100), PdTimeoutBehavior::KeepLastValue))
            .unwrap();
        // Index is stale (insert happened after enable_fast_path); the new
        // entry is still found via the linear-scan fallback.
        let mut hits = 0;
        table.for_each_matching(3002, |_, _| hits += 1);
        assert_eq!(hits, 1);
        table.update_session();
        let mut hits_after_rebuild = 0;
        table.for_each_matching(3002, |_, _| hits_after_rebuild += 1);
        assert_eq!(hits_after_rebuild, 1);
    }
}
