// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Directory Name Resolver client (C7): URI→IP cache backed by a static
//! hosts file and/or a TCN-DNS request/reply round-trip.
//!
//! The cache itself (this module) is transport-agnostic: [`DnrCache`] holds
//! up to [`MAX_ENTRIES`] entries and answers `lookup` purely from local
//! state. Actually sending a TCN-DNS `Mr` and waiting for the `Mp` lives in
//! the session layer, which owns the MD session table; it calls
//! [`DnrCache::pending_refresh`] to build the batched request and
//! [`DnrCache::apply_reply`] to fold the answer back in.

use std::net::Ipv4Addr;
use std::str::FromStr;

/// Upper bound on cache size (§4.7).
pub const MAX_ENTRIES: usize = 50;

/// One cached URI→IP mapping.
#[derive(Debug, Clone)]
pub struct DnrEntry {
    pub uri: String,
    pub ip: Ipv4Addr,
    pub etb_topo_cnt: u32,
    pub op_trn_topo_cnt: u32,
    /// Set for hosts-file entries; never invalidated by a topo-count change.
    pub fixed: bool,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    /// A dotted-quad shortcut; no cache entry involved.
    DottedIp(Ipv4Addr),
    /// A cached, still-valid entry.
    Hit(Ipv4Addr),
    /// A cached entry exists but its topo counters are stale; the caller
    /// must refresh via TCN-DNS or classic DNS.
    Stale,
    /// Nothing cached for this URI.
    Miss,
}

/// The URI→IP cache (C7). Kept sorted by `uri` so lookup can binary-search.
#[derive(Debug, Default)]
pub struct DnrCache {
    entries: Vec<DnrEntry>,
}

impl DnrCache {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn find_index(&self, uri: &str) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.uri.as_str().cmp(uri))
    }

    /// Insert or update an entry, then re-sort (§4.7 "re-sort the array by
    /// URI" after a reply). Evicts the stalest non-fixed entry if the cache
    /// is full and `uri` is not already present.
    pub fn upsert(&mut self, uri: &str, ip: Ipv4Addr, etb_topo_cnt: u32, op_trn_topo_cnt: u32, fixed: bool) {
        if let Ok(idx) = self.find_index(uri) {
            let entry = &mut self.entries[idx];
            entry.ip = ip;
            entry.etb_topo_cnt = etb_topo_cnt;
            entry.op_trn_topo_cnt = op_trn_topo_cnt;
            entry.fixed = entry.fixed || fixed;
            return;
        }
        if self.entries.len() >= MAX_ENTRIES {
            if let Some(evict) = self
                .entries
                .iter()
                .position(|e| !e.fixed)
            {
                self.entries.remove(evict);
            } else {
                return;
            }
        }
        self.entries.push(DnrEntry {
            uri: uri.to_string(),
            ip,
            etb_topo_cnt,
            op_trn_topo_cnt,
            fixed,
        });
        self.entries.sort_by(|a, b| a.uri.cmp(&b.uri));
    }

    /// Load a plain-text hosts file, one `IP URI` pair per line (`#` starts
    /// a comment, blank lines ignored). Entries loaded this way are fixed
    /// and never invalidated by a topo-count change.
    pub fn load_hosts_text(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(ip_str), Some(uri)) = (parts.next(), parts.next()) else {
                continue;
            };
            if let Ok(ip) = Ipv4Addr::from_str(ip_str) {
                self.upsert(uri, ip, 0, 0, true);
            }
        }
    }

    /// `uri_to_addr` steps 1-3 (§4.7): dotted-IP shortcut, then cache
    /// lookup honoring the fixed/topo-match/zero-topo rules. Step 4 (the
    /// actual DNS/TCN-DNS round trip) is the caller's responsibility.
    #[must_use]
    pub fn lookup(&self, uri: &str, session_etb: u32, session_op: u32) -> LookupResult {
        if let Ok(ip) = Ipv4Addr::from_str(uri) {
            return LookupResult::DottedIp(ip);
        }
        let Ok(idx) = self.find_index(uri) else {
            return LookupResult::Miss;
        };
        let entry = &self.entries[idx];
        let topo_fresh = session_etb == 0 && session_op == 0
            || (entry.etb_topo_cnt == session_etb && entry.op_trn_topo_cnt == session_op);
        if entry.fixed || topo_fresh {
            LookupResult::Hit(entry.ip)
        } else {
            LookupResult::Stale
        }
    }

    /// Every non-fixed entry whose topo counters differ from the session's
    /// current ones, for batching into one TCN-DNS request (§4.7 "Batching").
    #[must_use]
    pub fn pending_refresh(&self, session_etb: u32, session_op: u32) -> Vec<String> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.fixed && (e.etb_topo_cnt != session_etb || e.op_trn_topo_cnt != session_op))
            .map(|e| e.uri.clone())
            .collect();
        if !stale.is_empty() {
            crate::debug!("[DNR] {} entries stale against topo ({}, {}), batching refresh", stale.len(), session_etb, session_op);
        }
        stale
    }

    /// Fold a TCN-DNS/classic-DNS answer back into the cache.
    pub fn apply_reply(&mut self, uri: &str, ip: Ipv4Addr, session_etb: u32, session_op: u32) {
        crate::debug!("[DNR] {} resolved to {} (topo {}, {})", uri, ip, session_etb, session_op);
        self.upsert(uri, ip, session_etb, session_op, false);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_ip_is_a_shortcut_bypassing_cache() {
        let cache = DnrCache::new();
        let result = cache.lookup("10.0.0.5", 0, 0);
        assert_eq!(result, LookupResult::DottedIp(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn miss_on_empty_cache() {
        let cache = DnrCache::new();
        assert_eq!(cache.lookup("testUri", 1, 1), LookupResult::Miss);
    }

    #[test]
    fn zero_session_topo_counts_never_invalidate() {
        let mut cache = DnrCache::new();
        cache.upsert("testUri", Ipv4Addr::new(1, 2, 3, 4), 5, 6, false);
        assert_eq!(cache.lookup("testUri", 0, 0), LookupResult::Hit(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn stale_topo_counts_report_stale() {
        let mut cache = DnrCache::new();
        cache.upsert("testUri", Ipv4Addr::new(1, 2, 3, 4), 1, 1, false);
        assert_eq!(cache.lookup("testUri", 2, 1), LookupResult::Stale);
    }

    #[test]
    fn fixed_hosts_entry_never_invalidates() {
        let mut cache = DnrCache::new();
        cache.upsert("fixedHost", Ipv4Addr::new(9, 9, 9, 9), 1, 1, true);
        assert_eq!(cache.lookup("fixedHost", 99, 99), LookupResult::Hit(Ipv4Addr::new(9, 9, 9, 9)));
    }

    #[test]
    fn hosts_file_parses_ip_and_uri_pairs() {
        let mut cache = DnrCache::new();
        cache.load_hosts_text("# comment\n10.0.0.1 devA\n10.0.0.2 devB  \n\nmalformed-line\n");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup("devA", 0, 0), LookupResult::Hit(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn refresh_then_resolve_scenario() {
        // Mirrors S5: cache holds testUri→IP1 at (1,1); advancing topo counts
        // makes it stale; applying the new reply resolves it to IP2; a
        // further advance stales it again, resolving to IP3.
        let mut cache = DnrCache::new();
        cache.upsert("testUri", Ipv4Addr::new(1, 1, 1, 1), 1, 1, false);
        assert_eq!(cache.lookup("testUri", 2, 1), LookupResult::Stale);
        let pending = cache.pending_refresh(2, 1);
        assert_eq!(pending, vec!["testUri".to_string()]);
        cache.apply_reply("testUri", Ipv4Addr::new(2, 2, 2, 2), 2, 1);
        assert_eq!(cache.lookup("testUri", 2, 1), LookupResult::Hit(Ipv4Addr::new(2, 2, 2, 2)));
        assert_eq!(cache.lookup("testUri", 2, 2), LookupResult::Stale);
        cache.apply_reply("testUri", Ipv4Addr::new(3, 3, 3, 3), 2, 2);
        assert_eq!(cache.lookup("testUri", 2, 2), LookupResult::Hit(Ipv4Addr::new(3, 3, 3, 3)));
    }

    #[test]
    fn cache_evicts_non_fixed_entry_when_full() {
        let mut cache = DnrCache::new();
        for i in 0..MAX_ENTRIES {
            cache.upsert(&format!("uri{i}"), Ipv4Addr::new(10, 0, 0, i as u8), 1, 1, false);
        }
        assert_eq!(cache.len(), MAX_ENTRIES);
        cache.upsert("oneMore", Ipv4Addr::new(10, 1, 0, 1), 1, 1, false);
        assert_eq!(cache.len(), MAX_ENTRIES);
    }

    #[test]
    fn fixed_entries_are_not_evicted() {
        let mut cache = DnrCache::new();
        cache.upsert("fixedHost", Ipv4Addr::new(9, 9, 9, 9), 0, 0, true);
        for i in 0..MAX_ENTRIES - 1 {
            cache.upsert(&format!("uri{i}"), Ipv4Addr::new(10, 0, 0, i as u8), 1, 1, false);
        }
        cache.upsert("anotherOne", Ipv4Addr::new(10, 2, 0, 1), 1, 1, false);
        assert!(cache.lookup("fixedHost", 0, 0) == LookupResult::Hit(Ipv4Addr::new(9, 9, 9, 9)));
    }
}
