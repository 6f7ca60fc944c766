// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MD listener table: registered `(comId, srcUri)` filters that incoming
//! `Mn`/`Mr` traffic is matched against, each carrying a typed callback
//! (replacing the reference implementation's duck-typed `void*` callback
//! pointer with a trait object, per the Rust-mapping design note).

use std::net::Ipv4Addr;

/// Snapshot of header/addressing fields handed to a listener callback —
/// the fields an application actually needs to decide how to respond.
#[derive(Debug, Clone, Copy)]
pub struct MdInfo {
    pub com_id: u32,
    pub session_id: [u8; 16],
    pub src_ip: Ipv4Addr,
    pub sequence_counter: u32,
}

/// Application callback invoked when an incoming `Mn`/`Mr` matches a
/// listener's filter. Implementors typically queue the event and let the
/// application thread call `reply`/`confirm` on the session separately;
/// the callback itself is not expected to block.
pub trait MdCallback: Send {
    /// A notify (`Mn`) matched this listener. No reply is expected.
    fn on_notify(&self, info: &MdInfo, data: &[u8]);

    /// A request (`Mr`) matched this listener. The application replies
    /// later via the session table's `reply`/`prepare_reply`, keyed by
    /// `info.session_id`.
    fn on_request(&self, info: &MdInfo, data: &[u8]);
}

/// Stable handle to a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

/// One registered listener entry.
pub struct ListenerEntry {
    pub(crate) generation: u32,
    pub com_id: u32,
    /// Source-IP filter; `UNSPECIFIED` is a wildcard.
    pub src_ip: Ipv4Addr,
    pub callback: Box<dyn MdCallback>,
}

/// The listener table: every registered `(comId, srcIp)` → callback mapping.
#[derive(Default)]
pub struct ListenerTable {
    entries: Vec<Option<ListenerEntry>>,
    next_generation: u32,
}

impl ListenerTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_generation: 1,
        }
    }

    /// Register a listener for `com_id`, optionally narrowed to `src_ip`.
    pub fn add(&mut self, com_id: u32, src_ip: Ipv4Addr, callback: Box<dyn MdCallback>) -> ListenerHandle {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        let entry = ListenerEntry {
            generation,
            com_id,
            src_ip,
            callback,
        };
        if let Some(idx) = self.entries.iter().position(|e| e.is_none()) {
            self.entries[idx] = Some(entry);
            return ListenerHandle { index: idx, generation };
        }
        self.entries.push(Some(entry));
        ListenerHandle {
            index: self.entries.len() - 1,
            generation,
        }
    }

    /// Deregister a listener.
    pub fn remove(&mut self, handle: ListenerHandle) -> bool {
        if let Some(slot) = self.entries.get_mut(handle.index) {
            if slot.as_ref().is_some_and(|e| e.generation == handle.generation) {
                *slot = None;
                return true;
            }
        }
        false
    }

    /// Find the first listener matching `com_id`/`src_ip`. An exact-IP
    /// registration wins over a wildcard one when both would match.
    #[must_use]
    pub fn find(&self, com_id: u32, src_ip: Ipv4Addr) -> Option<&ListenerEntry> {
        let exact = self
            .entries
            .iter()
            .filter_map(|e| e.as_ref())
            .find(|e| e.com_id == com_id && e.src_ip == src_ip);
        exact.or_else(|| {
            self.entries
                .iter()
                .filter_map(|e| e.as_ref())
                .find(|e| e.com_id == com_id && e.src_ip == Ipv4Addr::UNSPECIFIED)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingCallback {
        notifies: Arc<AtomicUsize>,
        requests: Arc<AtomicUsize>,
    }

    impl MdCallback for CountingCallback {
        fn on_notify(&self, _info: &MdInfo, _data: &[u8]) {
            self.notifies.fetch_add(1, Ordering::SeqCst);
        }

        fn on_request(&self, _info: &MdInfo, _data: &[u8]) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn wildcard_listener_matches_any_source() {
        let mut table = ListenerTable::new();
        let notifies = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));
        table.add(
            100,
            Ipv4Addr::UNSPECIFIED,
            Box::new(CountingCallback {
                notifies: notifies.clone(),
                requests: requests.clone(),
            }),
        );
        let found = table.find(100, Ipv4Addr::new(10, 0, 0, 5)).unwrap();
        let info = MdInfo {
            com_id: 100,
            session_id: [0; 16],
            src_ip: Ipv4Addr::new(10, 0, 0, 5),
            sequence_counter: 1,
        };
        found.callback.on_notify(&info, b"x");
        assert_eq!(notifies.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exact_match_preferred_over_wildcard() {
        let mut table = ListenerTable::new();
        table.add(200, Ipv4Addr::UNSPECIFIED, Box::new(CountingCallback {
            notifies: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(AtomicUsize::new(0)),
        }));
        let exact_requests = Arc::new(AtomicUsize::new(0));
        table.add(
            200,
            Ipv4Addr::new(10, 0, 0, 9),
            Box::new(CountingCallback {
                notifies: Arc::new(AtomicUsize::new(0)),
                requests: exact_requests.clone(),
            }),
        );
        let found = table.find(200, Ipv4Addr::new(10, 0, 0, 9)).unwrap();
        let info = MdInfo {
            com_id: 200,
            session_id: [0; 16],
            src_ip: Ipv4Addr::new(10, 0, 0, 9),
            sequence_counter: 1,
        };
        found.callback.on_request(&info, b"x");
        assert_eq!(exact_requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_matching_com_id_returns_none() {
        let mut table = ListenerTable::new();
        table.add(300, Ipv4Addr::UNSPECIFIED, Box::new(CountingCallback {
            notifies: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(AtomicUsize::new(0)),
        }));
        assert!(table.find(301, Ipv4Addr::new(1, 1, 1, 1)).is_none());
    }

    #[test]
    fn removed_listener_is_no_longer_found() {
        let mut table = ListenerTable::new();
        let h = table.add(400, Ipv4Addr::UNSPECIFIED, Box::new(CountingCallback {
            notifies: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(AtomicUsize::new(0)),
        }));
        assert!(table.remove(h));
        assert!(table.find(400, Ipv4Addr::new(1, 1, 1, 1)).is_none());
    }
}
