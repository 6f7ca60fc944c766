// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber entries: the incoming half of the PD queue (§4.3 "Subscribe").

use crate::codec::pd::{decode_and_validate_pd_header, encode_pd_header, PdHeader, ValidateOptions, PD_HEADER_SIZE};
use crate::codec::MsgType;
use crate::config::PdTimeoutBehavior;
use crate::error::{TrdpError, TrdpResult};
use crate::pd::sequence::{Admission, SequenceTracker};
use crate::pd::AddressKey;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Stable handle to a subscriber entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberHandle {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

/// Info snapshot returned alongside the cached payload by [`Subscriber::get`],
/// mirroring the `TRDP_PD_INFO_T` fields an application actually consults.
#[derive(Debug, Clone, Copy)]
pub struct PdInfo {
    pub src_ip: Ipv4Addr,
    pub seq_count: u32,
    pub timed_out: bool,
}

/// Optional per-subscriber callback, invoked by the scheduler instead of
/// (or in addition to) a polling `get`. Mirrors [`crate::md::MdCallback`]:
/// a typed trait in place of the reference implementation's `void*` user
/// callback pointer.
pub trait PdCallback: Send {
    /// A valid packet was just cached.
    fn on_data(&self, info: &PdInfo, data: &[u8]);
    /// The subscriber's receive deadline elapsed; invoked exactly once per
    /// gap, matching [`Subscriber::apply_timeout_if_due`].
    fn on_timeout(&self);
}

/// One incoming PD subscription: last-value cache, receive deadline, and
/// the timeout behavior to apply once the deadline passes.
pub struct Subscriber {
    pub(crate) generation: u32,
    pub addr: AddressKey,
    pub timeout: Duration,
    pub timeout_behavior: PdTimeoutBehavior,
    sequence: SequenceTracker,
    cache: Vec<u8>,
    last_src_ip: Ipv4Addr,
    last_seq_cnt: u32,
    deadline: Instant,
    /// True once a timeout has been reported for the current gap, so it is
    /// reported exactly once until the next valid packet re-arms it.
    timeout_reported: bool,
    has_ever_received: bool,
    callback: Option<Box<dyn PdCallback>>,
    /// Socket-pool slot this subscriber receives on, set by the scheduler
    /// once it has acquired (or shared) a receiving socket.
    pub socket_slot: Option<usize>,
    /// Sequence counter for this subscriber's own PD-Pull `Pr` requests,
    /// separate from the admission tracker above (which only ever observes
    /// counters the *peer* assigned to its `Pd`/`Pp` sends).
    request_seq_cnt: u32,
}

impl Subscriber {
    #[must_use]
    pub fn new(addr: AddressKey, timeout: Duration, timeout_behavior: PdTimeoutBehavior) -> Self {
        Self {
            generation: 0,
            addr,
            timeout,
            timeout_behavior,
            sequence: SequenceTracker::new(),
            cache: Vec::new(),
            last_src_ip: Ipv4Addr::UNSPECIFIED,
            last_seq_cnt: 0,
            deadline: Instant::now() + timeout,
            timeout_reported: false,
            has_ever_received: false,
            callback: None,
            socket_slot: None,
            request_seq_cnt: 0,
        }
    }

    /// Attach a callback, invoked by the scheduler on each accepted packet
    /// and on the timeout transition.
    #[must_use]
    pub fn with_callback(mut self, callback: Box<dyn PdCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Process one received, already-socket-filtered datagram: decode and
    /// validate the header, apply the source-IP filter, check the sequence
    /// tracker for a duplicate/stale counter, and on acceptance update the
    /// cache and re-arm the deadline. Order follows §4.3: codec validation
    /// first, then addressing, then sequencing, matching the rejection order
    /// an application would want to diagnose (wire-level errors first).
    pub fn on_receive(&mut self, src_ip: Ipv4Addr, raw: &[u8], opts: &ValidateOptions) -> TrdpResult<bool> {
        let header = decode_and_validate_pd_header(raw, opts)?;
        if !self.addr.accepts_src(src_ip) {
            return Ok(false);
        }
        if matches!(self.sequence.admit(src_ip, header.msg_type, header.sequence_counter), Admission::Duplicate) {
            return Ok(false);
        }
        let payload_start = crate::codec::pd::PD_HEADER_SIZE;
        let payload_end = payload_start + header.dataset_length as usize;
        let payload = raw.get(payload_start..payload_end).ok_or(TrdpError::Size)?;
        self.cache.clear();
        self.cache.extend_from_slice(payload);
        self.last_src_ip = src_ip;
        self.last_seq_cnt = header.sequence_counter;
        self.deadline = Instant::now() + self.timeout;
        self.timeout_reported = false;
        self.has_ever_received = true;
        if let Some(cb) = &self.callback {
            cb.on_data(
                &PdInfo {
                    src_ip,
                    seq_count: header.sequence_counter,
                    timed_out: false,
                },
                &self.cache,
            );
        }
        Ok(true)
    }

    /// This subscriber's current receive deadline, for the scheduler's
    /// `get_interval` sweep across every armed timer.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// True once `now` has passed the receive deadline and no later packet
    /// has re-armed it.
    #[must_use]
    pub fn is_timed_out(&self, now: Instant) -> bool {
        self.has_ever_received && now >= self.deadline
    }

    /// Apply this subscriber's timeout behavior once, on the transition into
    /// timeout. Idempotent: calling repeatedly while still timed out is a
    /// no-op so the caller doesn't need to track "already reported" itself.
    pub fn apply_timeout_if_due(&mut self, now: Instant) -> bool {
        if !self.is_timed_out(now) || self.timeout_reported {
            return false;
        }
        match self.timeout_behavior {
            PdTimeoutBehavior::KeepLastValue => {}
            PdTimeoutBehavior::ZeroOnTimeout => {
                for b in &mut self.cache {
                    *b = 0;
                }
            }
            PdTimeoutBehavior::Invalidate => {
                self.cache.clear();
            }
        }
        self.timeout_reported = true;
        if let Some(cb) = &self.callback {
            cb.on_timeout();
        }
        true
    }

    /// Fetch the cached payload and info snapshot.
    /// Returns [`TrdpError::NoData`] if nothing has ever been received.
    pub fn get(&self, now: Instant) -> TrdpResult<(PdInfo, &[u8])> {
        if !self.has_ever_received {
            return Err(TrdpError::NoData);
        }
        let info = PdInfo {
            src_ip: self.last_src_ip,
            seq_count: self.last_seq_cnt,
            timed_out: self.is_timed_out(now),
        };
        Ok((info, &self.cache))
    }

    /// Build a PD-Pull `Pr` request (§4.3): a zero-payload packet under this
    /// subscriber's own comId, naming `reply_com_id` and `reply_ip` so the
    /// nominated publisher knows what to send back and where.
    pub fn build_pull_request(&mut self, reply_com_id: u32, reply_ip: Ipv4Addr) -> TrdpResult<Vec<u8>> {
        self.request_seq_cnt = self.request_seq_cnt.wrapping_add(1).max(1);
        let header = PdHeader {
            sequence_counter: self.request_seq_cnt,
            msg_type: MsgType::Pr,
            com_id: self.addr.com_id,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            dataset_length: 0,
            reply_com_id,
            reply_ip: u32::from(reply_ip),
        };
        let mut buf = vec![0u8; PD_HEADER_SIZE];
        encode_pd_header(&header, &mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::pd::encode_pd_header;
    use crate::codec::pd::{PdHeader, PD_HEADER_SIZE};
    use crate::codec::MsgType;

    fn frame(seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; PD_HEADER_SIZE + payload.len()];
        let header = PdHeader {
            sequence_counter: seq,
            msg_type: MsgType::Pd,
            com_id: 2001,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            dataset_length: payload.len() as u32,
            reply_com_id: 0,
            reply_ip: 0,
        };
        encode_pd_header(&header, &mut buf).unwrap();
        buf[PD_HEADER_SIZE..].copy_from_slice(payload);
        buf
    }

    #[test]
    fn first_valid_packet_is_cached() {
        let mut sub = Subscriber::new(AddressKey::for_com_id(2001), Duration::from_millis(100), PdTimeoutBehavior::KeepLastValue);
        let raw = frame(1, b"hello");
        let src = Ipv4Addr::new(10, 0, 0, 1);
        assert!(sub.on_receive(src, &raw, &ValidateOptions::default()).unwrap());
        let (info, data) = sub.get(Instant::now()).unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(info.seq_count, 1);
        assert!(!info.timed_out);
    }

    #[test]
    fn get_before_any_receive_is_no_data() {
        let sub = Subscriber::new(AddressKey::for_com_id(2001), Duration::from_millis(100), PdTimeoutBehavior::KeepLastValue);
        assert!(matches!(sub.get(Instant::now()), Err(TrdpError::NoData)));
    }

    #[test]
    fn wrong_src_ip_is_rejected() {
        let mut key = AddressKey::for_com_id(2001);
        key.src_ip = Ipv4Addr::new(10, 0, 0, 1);
        let mut sub = Subscriber::new(key, Duration::from_millis(100), PdTimeoutBehavior::KeepLastValue);
        let raw = frame(1, b"hello");
        let other = Ipv4Addr::new(10, 0, 0, 2);
        assert!(!sub.on_receive(other, &raw, &ValidateOptions::default()).unwrap());
    }

    #[test]
    fn duplicate_sequence_is_rejected() {
        let mut sub = Subscriber::new(AddressKey::for_com_id(2001), Duration::from_millis(100), PdTimeoutBehavior::KeepLastValue);
        let src = Ipv4Addr::new(10, 0, 0, 1);
        assert!(sub.on_receive(src, &frame(5, b"a"), &ValidateOptions::default()).unwrap());
        assert!(!sub.on_receive(src, &frame(5, b"b"), &ValidateOptions::default()).unwrap());
    }

    #[test]
    fn keep_last_value_retains_cache_on_timeout() {
        let mut sub = Subscriber::new(AddressKey::for_com_id(2001), Duration::from_millis(1), PdTimeoutBehavior::KeepLastValue);
        let src = Ipv4Addr::new(10, 0, 0, 1);
        sub.on_receive(src, &frame(1, b"data"), &ValidateOptions::default()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let now = Instant::now();
        assert!(sub.apply_timeout_if_due(now));
        let (info, data) = sub.get(now).unwrap();
        assert!(info.timed_out);
        assert_eq!(data, b"data");
    }

    #[test]
    fn zero_on_timeout_clears_bytes_but_keeps_length() {
        let mut sub = Subscriber::new(AddressKey::for_com_id(2001), Duration::from_millis(1), PdTimeoutBehavior::ZeroOnTimeout);
        let src = Ipv4Addr::new(10, 0, 0, 1);
        sub.on_receive(src, &frame(1, b"data"), &ValidateOptions::default()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let now = Instant::now();
        sub.apply_timeout_if_due(now);
        let (_, data) = sub.get(now).unwrap();
        assert_eq!(data, &[0, 0, 0, 0]);
    }

    #[test]
    fn invalidate_clears_cache_entirely() {
        let mut sub = Subscriber::new(AddressKey::for_com_id(2001), Duration::from_millis(1), PdTimeoutBehavior::Invalidate);
        let src = Ipv4Addr::new(10, 0, 0, 1);
        sub.on_receive(src, &frame(1, b"data"), &ValidateOptions::default()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let now = Instant::now();
        sub.apply_timeout_if_due(now);
        let (_, data) = sub.get(now).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn callback_is_invoked_on_data_and_on_timeout() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct CountingCallback {
            data: Arc<AtomicUsize>,
            timeouts: Arc<AtomicUsize>,
        }
        impl PdCallback for CountingCallback {
            fn on_data(&self, _info: &PdInfo, _data: &[u8]) {
                self.data.fetch_add(1, Ordering::SeqCst);
            }
            fn on_timeout(&self) {
                self.timeouts.fetch_add(1, Ordering::SeqCst);
            }
        }

        let data_count = Arc::new(AtomicUsize::new(0));
        let timeout_count = Arc::new(AtomicUsize::new(0));
        let mut sub = Subscriber::new(AddressKey::for_com_id(2001), Duration::from_millis(1), PdTimeoutBehavior::KeepLastValue)
            .with_callback(Box::new(CountingCallback {
                data: data_count.clone(),
                timeouts: timeout_count.clone(),
            }));
        let src = Ipv4Addr::new(10, 0, 0, 1);
        sub.on_receive(src, &frame(1, b"data"), &ValidateOptions::default()).unwrap();
        assert_eq!(data_count.load(Ordering::SeqCst), 1);
        std::thread::sleep(Duration::from_millis(5));
        sub.apply_timeout_if_due(Instant::now());
        assert_eq!(timeout_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pull_request_carries_reply_com_id_and_ip() {
        let mut sub = Subscriber::new(AddressKey::for_com_id(2001), Duration::from_millis(100), PdTimeoutBehavior::KeepLastValue);
        let buf = sub.build_pull_request(9001, Ipv4Addr::new(10, 0, 3, 101)).unwrap();
        let header = decode_and_validate_pd_header(&buf, &ValidateOptions::default()).unwrap();
        assert_eq!(header.msg_type, MsgType::Pr);
        assert_eq!(header.com_id, 2001);
        assert_eq!(header.reply_com_id, 9001);
        assert_eq!(header.reply_ip, u32::from(Ipv4Addr::new(10, 0, 3, 101)));
    }

    #[test]
    fn timeout_reported_exactly_once_until_rearmed() {
        let mut sub = Subscriber::new(AddressKey::for_com_id(2001), Duration::from_millis(1), PdTimeoutBehavior::KeepLastValue);
        let src = Ipv4Addr::new(10, 0, 0, 1);
        sub.on_receive(src, &frame(1, b"data"), &ValidateOptions::default()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let now = Instant::now();
        assert!(sub.apply_timeout_if_due(now));
        assert!(!sub.apply_timeout_if_due(now));
        assert!(sub.on_receive(src, &frame(2, b"new"), &ValidateOptions::default()).unwrap());
        assert!(!sub.is_timed_out(Instant::now()));
    }
}
