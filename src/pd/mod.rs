// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process Data (C3): cyclic publish/subscribe over UDP.
//!
//! Two lists per session — the publish queue (outgoing, cyclic or
//! on-request) and the subscribe queue (incoming, with a last-value cache
//! and a receive deadline) — plus the per-subscriber sequence tracker (C5).

pub mod publisher;
pub mod sequence;
pub mod subscriber;
pub mod table;

pub use publisher::{Publisher, PublisherHandle};
pub use sequence::{Admission, SequenceTracker};
pub use subscriber::{PdInfo, Subscriber, SubscriberHandle};
pub use table::{PublisherTable, SubscriberTable};

use std::net::Ipv4Addr;

/// The `(comId, srcIp, dstIp)` addressing key plus the optional narrowing
/// fields from §3: a source-IP range, a multicast group, and a service id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressKey {
    /// Application-chosen logical endpoint id.
    pub com_id: u32,
    /// Source IP filter; `UNSPECIFIED` is a wildcard.
    pub src_ip: Ipv4Addr,
    /// Upper bound of an (inclusive) source-IP range; `UNSPECIFIED` means no range.
    pub src_ip_range_high: Ipv4Addr,
    /// Destination IP (unicast target, or the multicast group's nominal address).
    pub dst_ip: Ipv4Addr,
    /// Multicast group narrowing receive, or `UNSPECIFIED` for none.
    pub mc_group: Ipv4Addr,
    /// Service registry id, or 0 for none.
    pub service_id: u32,
}

impl AddressKey {
    /// A key with only a comId set; every other field is wildcard/unused.
    #[must_use]
    pub fn for_com_id(com_id: u32) -> Self {
        Self {
            com_id,
            src_ip: Ipv4Addr::UNSPECIFIED,
            src_ip_range_high: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            mc_group: Ipv4Addr::UNSPECIFIED,
            service_id: 0,
        }
    }

    /// True if `src` satisfies this key's source-IP filter (possibly a range).
    #[must_use]
    pub fn accepts_src(&self, src: Ipv4Addr) -> bool {
        if self.src_ip == Ipv4Addr::UNSPECIFIED {
            return true;
        }
        if self.src_ip_range_high == Ipv4Addr::UNSPECIFIED {
            return src == self.src_ip;
        }
        u32::from(src) >= u32::from(self.src_ip) && u32::from(src) <= u32::from(self.src_ip_range_high)
    }

    /// Two subscribers collide iff every narrowing field matches (invariant 4, §3).
    #[must_use]
    pub fn collides_with(&self, other: &Self) -> bool {
        self.com_id == other.com_id
            && self.src_ip == other.src_ip
            && self.src_ip_range_high == other.src_ip_range_high
            && self.dst_ip == other.dst_ip
            && self.service_id == other.service_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_src_accepts_anything() {
        let key = AddressKey::for_com_id(1);
        assert!(key.accepts_src(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn exact_src_rejects_mismatch() {
        let mut key = AddressKey::for_com_id(1);
        key.src_ip = Ipv4Addr::new(10, 0, 3, 100);
        assert!(key.accepts_src(Ipv4Addr::new(10, 0, 3, 100)));
        assert!(!key.accepts_src(Ipv4Addr::new(10, 0, 3, 101)));
    }

    #[test]
    fn range_src_accepts_inclusive_bounds() {
        let mut key = AddressKey::for_com_id(1);
        key.src_ip = Ipv4Addr::new(10, 0, 3, 100);
        key.src_ip_range_high = Ipv4Addr::new(10, 0, 3, 110);
        assert!(key.accepts_src(Ipv4Addr::new(10, 0, 3, 100)));
        assert!(key.accepts_src(Ipv4Addr::new(10, 0, 3, 105)));
        assert!(key.accepts_src(Ipv4Addr::new(10, 0, 3, 110)));
        assert!(!key.accepts_src(Ipv4Addr::new(10, 0, 3, 111)));
    }

    #[test]
    fn duplicate_registration_detected_by_collision() {
        let a = AddressKey::for_com_id(2001);
        let b = AddressKey::for_com_id(2001);
        assert!(a.collides_with(&b));
        let c = AddressKey::for_com_id(2002);
        assert!(!a.collides_with(&c));
    }
}
