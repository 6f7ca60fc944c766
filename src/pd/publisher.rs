// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher entries: the outgoing half of the PD queue (§4.3 "Publish").

use crate::codec::pd::{encode_pd_header, pad4, update_pd_header, PdHeader, PD_HEADER_SIZE};
use crate::codec::MsgType;
use crate::config::SendParams;
use crate::error::{TrdpError, TrdpResult};
use crate::pd::AddressKey;
use std::time::{Duration, Instant};

/// Stable handle to a publisher entry (generation + index, per the
/// "owned collections + stable indices" design note).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublisherHandle {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

/// One outgoing PD publication.
pub struct Publisher {
    pub(crate) generation: u32,
    /// Addressing key this publisher sends under.
    pub addr: AddressKey,
    /// Cyclic interval; 0 means "send on request only" (PD-Pull replier).
    pub interval: Duration,
    /// Redundancy group id; 0 = non-redundant, >0 = leader-elected.
    pub redundancy_group: u32,
    /// Whether this session is currently the leader of its redundancy group.
    pub is_leader: bool,
    /// Fully-encoded wire buffer: header followed by padded payload.
    buffer: Vec<u8>,
    /// Declared (unpadded) payload length.
    payload_len: usize,
    /// Time of the next scheduled send.
    pub next_send_time: Instant,
    /// Last sequence counter used (0 before the first send).
    pub last_seq_cnt: u32,
    /// Send parameters (QoS/TTL/retries) for this publication.
    pub send_params: SendParams,
    /// Socket-pool slot this publisher sends on.
    pub socket_slot: Option<usize>,
    /// True once the wire buffer needs its CRC refreshed before the next send.
    dirty: bool,
}

impl Publisher {
    /// Create a publisher per §4.3: the buffer is `header + pad4(size)`,
    /// payload zeroed, and the first send is scheduled to `now + interval`
    /// (never immediately, to avoid a burst on a leadership switch).
    pub fn new(
        addr: AddressKey,
        interval: Duration,
        redundancy_group: u32,
        send_params: SendParams,
        initial_data: &[u8],
    ) -> TrdpResult<Self> {
        if initial_data.len() > crate::config::MAX_PD_DATA_SIZE {
            return Err(TrdpError::Size);
        }
        let padded = pad4(initial_data.len());
        let mut buffer = vec![0u8; PD_HEADER_SIZE + padded];
        buffer[PD_HEADER_SIZE..PD_HEADER_SIZE + initial_data.len()].copy_from_slice(initial_data);
        let header = PdHeader {
            sequence_counter: 0,
            msg_type: MsgType::Pd,
            com_id: addr.com_id,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            dataset_length: initial_data.len() as u32,
            reply_com_id: 0,
            reply_ip: 0,
        };
        encode_pd_header(&header, &mut buffer)?;
        Ok(Self {
            generation: 0,
            addr,
            interval,
            redundancy_group,
            is_leader: redundancy_group == 0,
            buffer,
            payload_len: initial_data.len(),
            next_send_time: Instant::now() + interval,
            last_seq_cnt: 0,
            send_params,
            socket_slot: None,
            dirty: false,
        })
    }

    /// Copy new payload into the publisher's buffer, growing it if needed,
    /// and mark it for a CRC refresh before the next send.
    pub fn put(&mut self, data: &[u8]) -> TrdpResult<()> {
        if data.len() > crate::config::MAX_PD_DATA_SIZE {
            return Err(TrdpError::Size);
        }
        let padded = pad4(data.len());
        let needed = PD_HEADER_SIZE + padded;
        if self.buffer.len() < needed {
            self.buffer.resize(needed, 0);
        }
        self.buffer[PD_HEADER_SIZE..PD_HEADER_SIZE + data.len()].copy_from_slice(data);
        for b in &mut self.buffer[PD_HEADER_SIZE + data.len()..needed] {
            *b = 0;
        }
        self.buffer[20..24].copy_from_slice(&(data.len() as u32).to_be_bytes());
        self.payload_len = data.len();
        self.dirty = true;
        Ok(())
    }

    /// The current payload (unpadded).
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buffer[PD_HEADER_SIZE..PD_HEADER_SIZE + self.payload_len]
    }

    /// Set this session's leadership for `self.redundancy_group`. Followers
    /// stay silent but keep advancing their sequence counter so a
    /// leadership switch produces no gap at the subscriber.
    pub fn set_redundant_leader(&mut self, is_leader: bool) {
        self.is_leader = is_leader;
    }

    /// True if `now` has reached the scheduled send time. Followers in a
    /// redundancy group never report ready to transmit.
    #[must_use]
    pub fn ready_to_send(&self, now: Instant) -> bool {
        self.interval > Duration::ZERO && self.is_leader && now >= self.next_send_time
    }

    /// Refresh the sequence counter and CRC, reschedule, and return the
    /// wire-ready buffer for the scheduler to send. Always advances
    /// `last_seq_cnt`, even for a silent follower (see
    /// [`Self::tick_follower_sequence`]), so switching leadership never
    /// produces an out-of-order counter.
    pub fn prepare_send(&mut self, now: Instant) -> TrdpResult<&[u8]> {
        self.last_seq_cnt = self.last_seq_cnt.wrapping_add(1).max(1);
        update_pd_header(&mut self.buffer, self.last_seq_cnt)?;
        self.next_send_time = now + self.interval;
        self.dirty = false;
        Ok(&self.buffer)
    }

    /// Advance the sequence counter without producing a send, for a
    /// follower that must stay in lockstep with the leader.
    pub fn tick_follower_sequence(&mut self, now: Instant) {
        self.last_seq_cnt = self.last_seq_cnt.wrapping_add(1).max(1);
        self.next_send_time = now + self.interval;
    }

    /// Rebuild the CRC (but not the sequence counter) after an out-of-band
    /// edit to the payload via [`Self::put`].
    pub fn refresh_crc_if_dirty(&mut self) -> TrdpResult<()> {
        if self.dirty {
            update_pd_header(&mut self.buffer, self.last_seq_cnt.max(1))?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Build a `Pp` reply to an incoming PD-Pull `Pr` (§4.3): the nominated
    /// publisher answers with its current payload under `reply_com_id`
    /// (falling back to its own comId if the requester left it unset),
    /// consuming the same sequence counter a cyclic send would so a puller
    /// and a cyclic subscriber see one monotonic sequence.
    pub fn build_pull_reply(&mut self, reply_com_id: u32) -> TrdpResult<Vec<u8>> {
        self.last_seq_cnt = self.last_seq_cnt.wrapping_add(1).max(1);
        let com_id = if reply_com_id != 0 { reply_com_id } else { self.addr.com_id };
        let header = PdHeader {
            sequence_counter: self.last_seq_cnt,
            msg_type: MsgType::Pp,
            com_id,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            dataset_length: self.payload_len as u32,
            reply_com_id: 0,
            reply_ip: 0,
        };
        let padded = pad4(self.payload_len);
        let mut buf = vec![0u8; PD_HEADER_SIZE + padded];
        buf[PD_HEADER_SIZE..PD_HEADER_SIZE + self.payload_len].copy_from_slice(self.payload());
        encode_pd_header(&header, &mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_send_not_before_interval() {
        let interval = Duration::from_millis(100);
        let pub_ = Publisher::new(
            AddressKey::for_com_id(2001),
            interval,
            0,
            SendParams::default(),
            b"Hello World!",
        )
        .unwrap();
        assert!(!pub_.ready_to_send(Instant::now()));
        assert!(pub_.ready_to_send(Instant::now() + interval));
    }

    #[test]
    fn sequence_counter_is_monotonic_across_sends() {
        let mut p = Publisher::new(
            AddressKey::for_com_id(2001),
            Duration::from_millis(1),
            0,
            SendParams::default(),
            b"x",
        )
        .unwrap();
        let mut last = 0;
        for _ in 0..10 {
            p.prepare_send(Instant::now()).unwrap();
            assert!(p.last_seq_cnt > last);
            last = p.last_seq_cnt;
        }
    }

    #[test]
    fn follower_does_not_report_ready() {
        let mut p = Publisher::new(
            AddressKey::for_com_id(2001),
            Duration::from_millis(1),
            1,
            SendParams::default(),
            b"x",
        )
        .unwrap();
        p.set_redundant_leader(false);
        std::thread::sleep(Duration::from_millis(2));
        assert!(!p.ready_to_send(Instant::now()));
    }

    #[test]
    fn leadership_switch_preserves_sequence_continuity() {
        let mut p = Publisher::new(
            AddressKey::for_com_id(2001),
            Duration::from_millis(1),
            1,
            SendParams::default(),
            b"x",
        )
        .unwrap();
        p.set_redundant_leader(false);
        p.tick_follower_sequence(Instant::now());
        p.tick_follower_sequence(Instant::now());
        let before = p.last_seq_cnt;
        p.set_redundant_leader(true);
        p.prepare_send(Instant::now()).unwrap();
        assert_eq!(p.last_seq_cnt, before + 1);
    }

    #[test]
    fn put_grows_buffer_and_updates_dataset_length() {
        let mut p = Publisher::new(
            AddressKey::for_com_id(1234),
            Duration::from_millis(10),
            0,
            SendParams::default(),
            b"a",
        )
        .unwrap();
        p.put(b"a longer payload than before").unwrap();
        assert_eq!(p.payload(), b"a longer payload than before");
    }

    #[test]
    fn pull_reply_carries_current_payload_under_requested_com_id() {
        let mut p = Publisher::new(AddressKey::for_com_id(2001), Duration::ZERO, 0, SendParams::default(), b"state").unwrap();
        let buf = p.build_pull_reply(9001).unwrap();
        let header = crate::codec::pd::decode_and_validate_pd_header(&buf, &crate::codec::pd::ValidateOptions::default()).unwrap();
        assert_eq!(header.msg_type, MsgType::Pp);
        assert_eq!(header.com_id, 9001);
        assert_eq!(&buf[PD_HEADER_SIZE..PD_HEADER_SIZE + 5], b"state");
    }

    #[test]
    fn pull_reply_falls_back_to_own_com_id_when_unset() {
        let mut p = Publisher::new(AddressKey::for_com_id(2001), Duration::ZERO, 0, SendParams::default(), b"x").unwrap();
        let buf = p.build_pull_reply(0).unwrap();
        let header = crate::codec::pd::decode_and_validate_pd_header(&buf, &crate::codec::pd::ValidateOptions::default()).unwrap();
        assert_eq!(header.com_id, 2001);
    }

    #[test]
    fn oversized_payload_rejected() {
        let big = vec![0u8; crate::config::MAX_PD_DATA_SIZE + 1];
        let err = Publisher::new(
            AddressKey::for_com_id(1),
            Duration::from_millis(10),
            0,
            SendParams::default(),
            &big,
        )
        .unwrap_err();
        assert!(matches!(err, TrdpError::Size));
    }
}
