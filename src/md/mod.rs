// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message Data (C4): request/reply/notify/confirm session table.
//!
//! Two lists per session — send and receive — plus a listener table (see
//! [`listener`]); every entry is a finite state machine with timers. The
//! table itself only builds wire buffers and advances state: actual socket
//! I/O and the retry/timeout sweep are driven by the scheduler, which holds
//! the socket-pool slot each entry references.

pub mod listener;

pub use listener::{ListenerEntry, ListenerHandle, ListenerTable, MdCallback, MdInfo};

use crate::codec::md::{encode_md_header, MdHeader, SessionId, MD_HEADER_SIZE};
use crate::codec::pd::pad4;
use crate::codec::MsgType;
use crate::config::SendParams;
use crate::error::{TrdpError, TrdpResult};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// MD session states (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdState {
    Idle,
    TxNotifyArm,
    TxRequestArm,
    TxReplyArm,
    TxReplyQueryArm,
    TxConfirmArm,
    TxRequestW4Reply,
    TxReplyReceived,
    TxReqW4ApConfirm,
    RxNotifyReceived,
    RxReqW4ApReply,
    RxReplyQueryW4C,
    RxConfReceived,
}

/// Which side of the conversation a session entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdDirection {
    Send,
    Receive,
}

/// Stable handle to an MD session entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MdSessionHandle {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

/// Per-session callback, invoked by the scheduler when a send entry's
/// outcome is known, in place of polling `MdSessionTable::get`. Mirrors
/// [`MdCallback`] on the listener side.
pub trait MdSessionCallback: Send {
    /// A reply (`Mp`/`Mq`) arrived for this session.
    fn on_reply(&self, info: &MdInfo, data: &[u8]);
    /// The session ended in error (timeout, confirm timeout, or a received `Me`).
    fn on_error(&self, err: &TrdpError);
}

/// Outcome of feeding an incoming `Mr`/`Mn` through duplicate detection
/// (§4.4 "Duplicate-request detection").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateOutcome {
    /// Not seen before; the caller should create a new receive entry.
    New,
    /// Discard silently (rules 1-4: exact repeat, TCP, multicast, reply pending).
    Discard,
    /// Topo counters changed (rule 5): ignore this entry and search listeners fresh.
    FallThroughToListener,
    /// Retransmit the previously-queued reply with a refreshed sequence counter.
    Retransmit(MdSessionHandle),
}

/// One MD session table entry.
pub struct MdSession {
    pub(crate) generation: u32,
    pub state: MdState,
    pub direction: MdDirection,
    pub session_id: SessionId,
    pub com_id: u32,
    /// Topology counters this entry was created under, for duplicate
    /// detection rule 5 (§4.4): a later `Mr`/`Mn` with the same session id
    /// but different counters falls through to a fresh listener search
    /// instead of being treated as a retransmit of this entry.
    pub etb_topo_cnt: u32,
    pub op_trn_topo_cnt: u32,
    pub peer_ip: Ipv4Addr,
    pub is_tcp: bool,
    pub is_multicast: bool,
    pub num_expected_replies: u32,
    pub num_replies: u32,
    pub num_replies_query: u32,
    pub num_confirm_sent: u32,
    pub num_confirm_timeout: u32,
    pub num_retries: u32,
    pub num_retries_max: u32,
    pub deadline: Instant,
    pub retry_interval: Duration,
    pub reply_timeout: Duration,
    pub confirm_timeout: Duration,
    /// Wire-ready buffer (header + padded payload) for the last message sent
    /// on this entry; kept around so a retry can resend it after bumping the
    /// sequence counter and refreshing the CRC.
    buffer: Vec<u8>,
    pub socket_slot: Option<usize>,
    pub morituri: bool,
    last_seq_cnt: u32,
    callback: Option<Box<dyn MdSessionCallback>>,
}

impl MdSession {
    fn build(
        direction: MdDirection,
        msg_type: MsgType,
        session_id: SessionId,
        com_id: u32,
        peer_ip: Ipv4Addr,
        source_uri: &str,
        destination_uri: &str,
        payload: &[u8],
        reply_timeout: Duration,
    ) -> TrdpResult<Self> {
        if payload.len() > crate::config::MAX_MD_DATA_SIZE {
            return Err(TrdpError::Size);
        }
        let mut header = MdHeader::new(msg_type, com_id, session_id, source_uri, destination_uri);
        header.dataset_length = payload.len() as u32;
        header.reply_timeout_us = reply_timeout.as_micros().min(u64::from(u32::MAX) as u128) as u32;
        let padded = pad4(payload.len());
        let mut buffer = vec![0u8; MD_HEADER_SIZE + padded];
        buffer[MD_HEADER_SIZE..MD_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        encode_md_header(&header, &mut buffer)?;
        Ok(Self {
            generation: 0,
            state: MdState::Idle,
            direction,
            session_id,
            com_id,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            peer_ip,
            is_tcp: false,
            is_multicast: false,
            num_expected_replies: 0,
            num_replies: 0,
            num_replies_query: 0,
            num_confirm_sent: 0,
            num_confirm_timeout: 0,
            num_retries: 0,
            num_retries_max: 0,
            deadline: Instant::now(),
            retry_interval: Duration::from_secs(1),
            reply_timeout,
            confirm_timeout: Duration::from_secs(0),
            buffer,
            socket_slot: None,
            morituri: false,
            last_seq_cnt: 0,
            callback: None,
        })
    }

    /// The wire-ready buffer the scheduler should send for this entry's
    /// current state.
    #[must_use]
    pub fn wire_buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// This entry's callback, if the caller attached one via
    /// [`MdSessionTable::set_callback`]; the scheduler invokes it with the
    /// reply/error data it decoded once `process()` advances this entry.
    #[must_use]
    pub fn callback(&self) -> Option<&dyn MdSessionCallback> {
        self.callback.as_deref()
    }

    fn bump_and_recrc(&mut self) -> TrdpResult<()> {
        self.last_seq_cnt = self.last_seq_cnt.wrapping_add(1).max(1);
        self.buffer[0..4].copy_from_slice(&self.last_seq_cnt.to_be_bytes());
        let crc = crate::codec::crc::crc32(&self.buffer[..MD_HEADER_SIZE - 4]);
        crate::codec::crc::write_crc_le(&mut self.buffer[..MD_HEADER_SIZE], crc);
        Ok(())
    }
}

/// Outcome of [`MdSessionTable::process_timeouts`] for one expired entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Resend the entry's buffer; the session stays alive.
    Retry(MdSessionHandle),
    /// The session failed; the application's error callback should fire
    /// with the given reply-status style error.
    Fatal(MdSessionHandle, TrdpError),
}

/// The MD session table (C4): send list, receive list, and their shared
/// duplicate-detection/retry logic. Send and receive entries live in the
/// same indexed table, distinguished by [`MdSession::direction`].
pub struct MdSessionTable {
    entries: Vec<Option<MdSession>>,
    max_sessions: usize,
    next_generation: u32,
}

impl MdSessionTable {
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_sessions,
            next_generation: 1,
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

    #[must_use]
    pub fn get(&self, handle: MdSessionHandle) -> Option<&MdSession> {
        self.entries
            .get(handle.index)
            .and_then(|e| e.as_ref())
            .filter(|e| e.generation == handle.generation)
    }

    #[must_use]
    pub fn get_mut(&mut self, handle: MdSessionHandle) -> Option<&mut MdSession> {
        self.entries
            .get_mut(handle.index)
            .and_then(|e| e.as_mut())
            .filter(|e| e.generation == handle.generation)
    }

    fn insert(&mut self, mut entry: MdSession) -> TrdpResult<MdSessionHandle> {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        entry.generation = generation;
        if let Some(idx) = self.entries.iter().position(|e| e.is_none()) {
            self.entries[idx] = Some(entry);
            return Ok(MdSessionHandle { index: idx, generation });
        }
        if self.entries.len() >= self.max_sessions {
            return Err(TrdpError::Mem);
        }
        self.entries.push(Some(entry));
        Ok(MdSessionHandle {
            index: self.entries.len() - 1,
            generation,
        })
    }

    /// Attach a callback to an existing entry, invoked by the scheduler
    /// instead of (or alongside) polling `get` for this session's outcome.
    pub fn set_callback(&mut self, handle: MdSessionHandle, callback: Box<dyn MdSessionCallback>) -> TrdpResult<()> {
        let entry = self.get_mut(handle).ok_or(TrdpError::NoSession)?;
        entry.callback = Some(callback);
        Ok(())
    }

    /// An incoming `Me` matching a `TxRequestW4Reply` entry: marks it for
    /// cleanup and hands back its handle so the caller can fire the error
    /// callback before the next sweep removes it.
    pub fn mark_error(&mut self, session_id: &SessionId) -> Option<MdSessionHandle> {
        let (idx, generation) = self.find_by_session_id(session_id)?;
        let handle = MdSessionHandle { index: idx, generation };
        let entry = self.get_mut(handle)?;
        entry.morituri = true;
        Some(handle)
    }

    fn find_by_session_id(&self, session_id: &SessionId) -> Option<(usize, u32)> {
        self.entries.iter().enumerate().find_map(|(i, e)| {
            e.as_ref()
                .filter(|e| &e.session_id == session_id)
                .map(|e| (i, e.generation))
        })
    }

    /// `notify(comId, ...)`: create a one-shot send entry in `TxNotifyArm`.
    pub fn notify(
        &mut self,
        session_id: SessionId,
        com_id: u32,
        peer_ip: Ipv4Addr,
        source_uri: &str,
        destination_uri: &str,
        payload: &[u8],
        send_params: SendParams,
    ) -> TrdpResult<MdSessionHandle> {
        let _ = send_params;
        let mut entry = MdSession::build(
            MdDirection::Send,
            MsgType::Mn,
            session_id,
            com_id,
            peer_ip,
            source_uri,
            destination_uri,
            payload,
            Duration::ZERO,
        )?;
        entry.state = MdState::TxNotifyArm;
        self.insert(entry)
    }

    /// `request(comId, numReplies, replyTimeout, ...)`: create a send entry
    /// in `TxRequestArm`. After the caller sends the buffer, call
    /// [`Self::mark_sent`] to transition to `TxRequestW4Reply`.
    pub fn request(
        &mut self,
        session_id: SessionId,
        com_id: u32,
        peer_ip: Ipv4Addr,
        source_uri: &str,
        destination_uri: &str,
        payload: &[u8],
        num_expected_replies: u32,
        reply_timeout: Duration,
        num_retries_max: u32,
    ) -> TrdpResult<MdSessionHandle> {
        let mut entry = MdSession::build(
            MdDirection::Send,
            MsgType::Mr,
            session_id,
            com_id,
            peer_ip,
            source_uri,
            destination_uri,
            payload,
            reply_timeout,
        )?;
        entry.state = MdState::TxRequestArm;
        entry.num_expected_replies = num_expected_replies;
        entry.num_retries_max = num_retries_max;
        self.insert(entry)
    }

    /// Transition a freshly-sent entry to its post-send state and arm its
    /// deadline. `TxNotifyArm` becomes `morituri` immediately (fire-and-forget);
    /// `TxRequestArm` becomes `TxRequestW4Reply` with `deadline = now + replyTimeout`.
    pub fn mark_sent(&mut self, handle: MdSessionHandle) -> TrdpResult<()> {
        let entry = self.get_mut(handle).ok_or(TrdpError::NoSession)?;
        match entry.state {
            MdState::TxNotifyArm => {
                entry.morituri = true;
            }
            MdState::TxRequestArm => {
                entry.state = MdState::TxRequestW4Reply;
                entry.deadline = Instant::now() + entry.reply_timeout;
            }
            MdState::TxReplyArm | MdState::TxReplyQueryArm => {
                entry.morituri = entry.state == MdState::TxReplyArm;
                if entry.state == MdState::TxReplyQueryArm {
                    entry.state = MdState::RxReplyQueryW4C;
                    entry.deadline = Instant::now() + entry.confirm_timeout;
                }
            }
            MdState::TxConfirmArm => {
                entry.morituri = true;
            }
            _ => return Err(TrdpError::Param("mark_sent called in an unexpected state")),
        }
        Ok(())
    }

    /// Feed an incoming `Mp`/`Mq` reply to its matching `TxRequestW4Reply`
    /// entry by session id.
    pub fn on_reply_received(&mut self, header: &MdHeader) -> TrdpResult<Option<MdSessionHandle>> {
        let Some((idx, generation)) = self.find_by_session_id(&header.session_id) else {
            return Ok(None);
        };
        let handle = MdSessionHandle { index: idx, generation };
        let entry = self.get_mut(handle).ok_or(TrdpError::NoSession)?;
        if entry.state != MdState::TxRequestW4Reply {
            return Ok(None);
        }
        match header.msg_type {
            MsgType::Mp => {
                entry.num_replies += 1;
                if entry.num_replies + entry.num_replies_query >= entry.num_expected_replies {
                    entry.morituri = true;
                } else {
                    entry.state = MdState::TxReplyReceived;
                }
            }
            MsgType::Mq => {
                entry.num_replies_query += 1;
                entry.state = MdState::TxReqW4ApConfirm;
                entry.deadline = Instant::now() + entry.confirm_timeout;
            }
            _ => return Ok(None),
        }
        Ok(Some(handle))
    }

    /// `confirm(sessionId, ...)` on a `TxReqW4ApConfirm` entry: prepares an
    /// `Mc` buffer. Once sent, call [`Self::mark_confirm_sent`].
    pub fn prepare_confirm(
        &mut self,
        handle: MdSessionHandle,
        source_uri: &str,
        destination_uri: &str,
    ) -> TrdpResult<()> {
        let entry = self.get_mut(handle).ok_or(TrdpError::NoSession)?;
        if entry.state != MdState::TxReqW4ApConfirm {
            return Err(TrdpError::Param("confirm called outside TxReqW4ApConfirm"));
        }
        let mut header = MdHeader::new(MsgType::Mc, entry.com_id, entry.session_id, source_uri, destination_uri);
        header.dataset_length = 0;
        let mut buffer = vec![0u8; MD_HEADER_SIZE];
        encode_md_header(&header, &mut buffer)?;
        entry.buffer = buffer;
        entry.state = MdState::TxConfirmArm;
        Ok(())
    }

    /// After sending the `Mc` built by [`Self::prepare_confirm`]: increments
    /// `num_confirm_sent` and, once every expected reply has been confirmed,
    /// marks the entry `morituri`.
    pub fn mark_confirm_sent(&mut self, handle: MdSessionHandle) -> TrdpResult<()> {
        let entry = self.get_mut(handle).ok_or(TrdpError::NoSession)?;
        entry.num_confirm_sent += 1;
        if entry.num_confirm_sent >= entry.num_replies_query && entry.num_replies + entry.num_replies_query >= entry.num_expected_replies {
            entry.morituri = true;
        }
        Ok(())
    }

    /// Duplicate-request detection for an incoming `Mr`/`Mn` (§4.4 rules 1-6).
    pub fn check_duplicate(&self, header: &MdHeader, is_tcp: bool, is_multicast: bool) -> DuplicateOutcome {
        let Some((idx, generation)) = self.find_by_session_id(&header.session_id) else {
            return DuplicateOutcome::New;
        };
        let existing = self.entries[idx].as_ref().expect("found by id");
        if existing.last_seq_cnt == header.sequence_counter {
            return DuplicateOutcome::Discard;
        }
        if is_tcp {
            return DuplicateOutcome::Discard;
        }
        if is_multicast {
            return DuplicateOutcome::Discard;
        }
        // A reply is only queued once the application has answered the
        // matched entry, moving it out of RxReqW4ApReply; a duplicate
        // arriving before that point has nothing to retransmit yet.
        let reply_already_sent = existing.state != MdState::RxReqW4ApReply;
        if !reply_already_sent {
            return DuplicateOutcome::Discard;
        }
        if existing.etb_topo_cnt != header.etb_topo_cnt || existing.op_trn_topo_cnt != header.op_trn_topo_cnt {
            crate::debug!("[MD] sessionId matches but topo counters differ, falling through to listener lookup");
            return DuplicateOutcome::FallThroughToListener;
        }
        crate::debug!("[MD] retransmitting last reply for known session");
        DuplicateOutcome::Retransmit(MdSessionHandle { index: idx, generation })
    }

    /// Create a receive entry for a fresh incoming `Mn` (listener matched),
    /// in `RxNotifyReceived`, already `morituri` per §4.4 (the notify path
    /// has no reply to wait for).
    pub fn create_rx_notify(&mut self, header: &MdHeader, peer_ip: Ipv4Addr, is_tcp: bool, is_multicast: bool) -> TrdpResult<MdSessionHandle> {
        let mut entry = MdSession::build(
            MdDirection::Receive,
            MsgType::Mn,
            header.session_id,
            header.com_id,
            peer_ip,
            "",
            "",
            &[],
            Duration::ZERO,
        )?;
        entry.state = MdState::RxNotifyReceived;
        entry.is_tcp = is_tcp;
        entry.is_multicast = is_multicast;
        entry.etb_topo_cnt = header.etb_topo_cnt;
        entry.op_trn_topo_cnt = header.op_trn_topo_cnt;
        entry.last_seq_cnt = header.sequence_counter;
        entry.morituri = true;
        self.insert(entry)
    }

    /// Create a receive entry for a fresh incoming `Mr` (listener matched),
    /// in `RxReqW4ApReply`, awaiting the application's `reply`/`confirm` call.
    pub fn create_rx_request(
        &mut self,
        header: &MdHeader,
        peer_ip: Ipv4Addr,
        is_tcp: bool,
        is_multicast: bool,
    ) -> TrdpResult<MdSessionHandle> {
        let reply_timeout = Duration::from_micros(u64::from(header.reply_timeout_us));
        let mut entry = MdSession::build(
            MdDirection::Receive,
            MsgType::Mr,
            header.session_id,
            header.com_id,
            peer_ip,
            "",
            "",
            &[],
            reply_timeout,
        )?;
        entry.state = MdState::RxReqW4ApReply;
        entry.is_tcp = is_tcp;
        entry.is_multicast = is_multicast;
        entry.etb_topo_cnt = header.etb_topo_cnt;
        entry.op_trn_topo_cnt = header.op_trn_topo_cnt;
        entry.last_seq_cnt = header.sequence_counter;
        entry.deadline = Instant::now() + reply_timeout;
        self.insert(entry)
    }

    /// `reply(sessionId, comId, ...)` on an `RxReqW4ApReply` entry: prepares
    /// an `Mp` (plain reply) or `Mq` (reply-query, expects a confirm) buffer.
    pub fn prepare_reply(
        &mut self,
        handle: MdSessionHandle,
        want_confirm: bool,
        source_uri: &str,
        destination_uri: &str,
        payload: &[u8],
    ) -> TrdpResult<()> {
        let entry = self.get_mut(handle).ok_or(TrdpError::NoSession)?;
        if entry.state != MdState::RxReqW4ApReply {
            return Err(TrdpError::Param("reply called outside RxReqW4ApReply"));
        }
        if payload.len() > crate::config::MAX_MD_DATA_SIZE {
            return Err(TrdpError::Size);
        }
        let msg_type = if want_confirm { MsgType::Mq } else { MsgType::Mp };
        let mut header = MdHeader::new(msg_type, entry.com_id, entry.session_id, source_uri, destination_uri);
        header.dataset_length = payload.len() as u32;
        let padded = pad4(payload.len());
        let mut buffer = vec![0u8; MD_HEADER_SIZE + padded];
        buffer[MD_HEADER_SIZE..MD_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        encode_md_header(&header, &mut buffer)?;
        entry.buffer = buffer;
        entry.state = if want_confirm { MdState::TxReplyQueryArm } else { MdState::TxReplyArm };
        Ok(())
    }

    /// An incoming `Mc` matching an `RxReplyQueryW4C` entry: records the
    /// confirm and marks the entry for cleanup.
    pub fn on_confirm_received(&mut self, header: &MdHeader) -> TrdpResult<Option<MdSessionHandle>> {
        let Some((idx, generation)) = self.find_by_session_id(&header.session_id) else {
            return Ok(None);
        };
        let handle = MdSessionHandle { index: idx, generation };
        let entry = self.get_mut(handle).ok_or(TrdpError::NoSession)?;
        if entry.state != MdState::RxReplyQueryW4C {
            return Ok(None);
        }
        entry.state = MdState::RxConfReceived;
        entry.morituri = true;
        Ok(Some(handle))
    }

    /// Build the unicast `Me` (error) response sent when an `Mr` matches no
    /// listener: carries `reply_status` to cue the caller its request cannot
    /// be serviced.
    pub fn build_error_response(
        header: &MdHeader,
        reply_status: i32,
        source_uri: &str,
        destination_uri: &str,
    ) -> TrdpResult<Vec<u8>> {
        let mut out_header = MdHeader::new(MsgType::Me, header.com_id, header.session_id, source_uri, destination_uri);
        out_header.reply_status = reply_status;
        let mut buffer = vec![0u8; MD_HEADER_SIZE];
        encode_md_header(&out_header, &mut buffer)?;
        Ok(buffer)
    }

    /// Drive every deadline-expired entry per the §4.4 retry rules. Retries
    /// apply only to unicast UDP entries expecting at most one reply, with
    /// retries remaining; everything else is fatal once its deadline passes.
    pub fn process_timeouts(&mut self, now: Instant) -> Vec<TimeoutAction> {
        let mut actions = Vec::new();
        let indices: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().filter(|e| !e.morituri && e.deadline <= now).map(|_| i))
            .collect();
        for idx in indices {
            let generation = self.entries[idx].as_ref().expect("filtered above").generation;
            let handle = MdSessionHandle { index: idx, generation };
            let entry = self.entries[idx].as_mut().expect("filtered above");
            let can_retry = !entry.is_tcp
                && entry.num_expected_replies <= 1
                && entry.state == MdState::TxRequestW4Reply
                && entry.num_retries < entry.num_retries_max;
            if can_retry {
                entry.num_retries += 1;
                entry.deadline = now + entry.retry_interval;
                let _ = entry.bump_and_recrc();
                crate::debug!("[MD] comId={} retry {}/{}", entry.com_id, entry.num_retries, entry.num_retries_max);
                actions.push(TimeoutAction::Retry(handle));
            } else {
                entry.morituri = true;
                let err = match entry.state {
                    MdState::TxRequestW4Reply => TrdpError::ReplyTimeout,
                    MdState::TxReqW4ApConfirm => TrdpError::ConfirmTimeout,
                    MdState::RxReqW4ApReply => TrdpError::AppReplyTimeout,
                    MdState::RxReplyQueryW4C => TrdpError::AppConfirmTimeout,
                    _ => TrdpError::Timeout,
                };
                if matches!(entry.state, MdState::RxReplyQueryW4C) {
                    entry.num_confirm_timeout += 1;
                }
                crate::warn!("[MD] comId={} session timed out in state {:?}: {}", entry.com_id, entry.state, err);
                actions.push(TimeoutAction::Fatal(handle, err));
            }
        }
        actions
    }

    /// Earliest deadline among entries still alive, for the scheduler's
    /// `get_interval`. `None` if no entry is currently armed.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .iter()
            .flatten()
            .filter(|e| !e.morituri)
            .map(|e| e.deadline)
            .min()
    }

    /// Remove every entry marked `morituri`, returning the socket-pool
    /// slots those entries referenced so the caller can release them.
    pub fn sweep(&mut self) -> Vec<usize> {
        let mut freed = Vec::new();
        for slot in &mut self.entries {
            if slot.as_ref().is_some_and(|e| e.morituri) {
                if let Some(idx) = slot.as_ref().and_then(|e| e.socket_slot) {
                    freed.push(idx);
                }
                *slot = None;
            }
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(b: u8) -> SessionId {
        [b; 16]
    }

    #[test]
    fn notify_then_mark_sent_becomes_morituri() {
        let mut table = MdSessionTable::new(10);
        let h = table
            .notify(sid(1), 100, Ipv4Addr::new(10, 0, 0, 1), "a", "b", b"hi", SendParams::default())
            .unwrap();
        assert_eq!(table.get(h).unwrap().state, MdState::TxNotifyArm);
        table.mark_sent(h).unwrap();
        assert!(table.get(h).unwrap().morituri);
    }

    #[test]
    fn request_arms_wait_for_reply_after_send() {
        let mut table = MdSessionTable::new(10);
        let h = table
            .request(sid(2), 200, Ipv4Addr::new(10, 0, 0, 2), "a", "b", b"req", 1, Duration::from_secs(2), 2)
            .unwrap();
        table.mark_sent(h).unwrap();
        let entry = table.get(h).unwrap();
        assert_eq!(entry.state, MdState::TxRequestW4Reply);
    }

    #[test]
    fn reply_transitions_request_to_morituri_when_fully_satisfied() {
        let mut table = MdSessionTable::new(10);
        let h = table
            .request(sid(3), 300, Ipv4Addr::new(10, 0, 0, 3), "a", "b", b"req", 1, Duration::from_secs(2), 0)
            .unwrap();
        table.mark_sent(h).unwrap();
        let mut reply_header = MdHeader::new(MsgType::Mp, 300, sid(3), "b", "a");
        reply_header.sequence_counter = 1;
        let matched = table.on_reply_received(&reply_header).unwrap();
        assert_eq!(matched, Some(h));
        assert!(table.get(h).unwrap().morituri);
    }

    #[test]
    fn reply_query_then_confirm_full_cycle() {
        let mut table = MdSessionTable::new(10);
        let h = table
            .request(sid(4), 400, Ipv4Addr::new(10, 0, 0, 4), "a", "b", b"req", 1, Duration::from_secs(2), 0)
            .unwrap();
        table.mark_sent(h).unwrap();
        let mq = MdHeader::new(MsgType::Mq, 400, sid(4), "b", "a");
        table.on_reply_received(&mq).unwrap();
        assert_eq!(table.get(h).unwrap().state, MdState::TxReqW4ApConfirm);
        table.prepare_confirm(h, "a", "b").unwrap();
        assert_eq!(table.get(h).unwrap().state, MdState::TxConfirmArm);
        table.mark_confirm_sent(h).unwrap();
        assert!(table.get(h).unwrap().morituri);
    }

    #[test]
    fn rx_request_reply_without_confirm_marks_morituri_on_send() {
        let mut table = MdSessionTable::new(10);
        let req_header = MdHeader::new(MsgType::Mr, 500, sid(5), "peer", "me");
        let h = table.create_rx_request(&req_header, Ipv4Addr::new(10, 0, 0, 5), false, false).unwrap();
        table.prepare_reply(h, false, "me", "peer", b"ok").unwrap();
        assert_eq!(table.get(h).unwrap().state, MdState::TxReplyArm);
        table.mark_sent(h).unwrap();
        assert!(table.get(h).unwrap().morituri);
    }

    #[test]
    fn rx_request_reply_query_then_confirm_received() {
        let mut table = MdSessionTable::new(10);
        let req_header = MdHeader::new(MsgType::Mr, 600, sid(6), "peer", "me");
        let h = table.create_rx_request(&req_header, Ipv4Addr::new(10, 0, 0, 6), false, false).unwrap();
        table.prepare_reply(h, true, "me", "peer", b"ok").unwrap();
        table.mark_sent(h).unwrap();
        assert_eq!(table.get(h).unwrap().state, MdState::RxReplyQueryW4C);
        let confirm_header = MdHeader::new(MsgType::Mc, 600, sid(6), "peer", "me");
        let matched = table.on_confirm_received(&confirm_header).unwrap();
        assert_eq!(matched, Some(h));
        assert!(table.get(h).unwrap().morituri);
    }

    #[test]
    fn duplicate_exact_repeat_is_discarded() {
        let mut table = MdSessionTable::new(10);
        let req_header = MdHeader::new(MsgType::Mr, 700, sid(7), "peer", "me");
        table.create_rx_request(&req_header, Ipv4Addr::new(10, 0, 0, 7), false, false).unwrap();
        let outcome = table.check_duplicate(&req_header, false, false);
        assert_eq!(outcome, DuplicateOutcome::Discard);
    }

    #[test]
    fn duplicate_on_tcp_is_discarded_even_with_new_sequence() {
        let mut table = MdSessionTable::new(10);
        let mut req_header = MdHeader::new(MsgType::Mr, 700, sid(8), "peer", "me");
        req_header.sequence_counter = 1;
        table.create_rx_request(&req_header, Ipv4Addr::new(10, 0, 0, 7), true, false).unwrap();
        req_header.sequence_counter = 2;
        let outcome = table.check_duplicate(&req_header, true, false);
        assert_eq!(outcome, DuplicateOutcome::Discard);
    }

    #[test]
    fn fresh_session_id_is_new() {
        let table = MdSessionTable::new(10);
        let header = MdHeader::new(MsgType::Mr, 1, sid(9), "a", "b");
        assert_eq!(table.check_duplicate(&header, false, false), DuplicateOutcome::New);
    }

    #[test]
    fn duplicate_with_changed_topo_counters_falls_through_to_listener() {
        let mut table = MdSessionTable::new(10);
        let mut req_header = MdHeader::new(MsgType::Mr, 700, sid(17), "peer", "me");
        req_header.etb_topo_cnt = 1;
        let h = table.create_rx_request(&req_header, Ipv4Addr::new(10, 0, 0, 17), false, false).unwrap();
        table.prepare_reply(h, false, "me", "peer", b"ok").unwrap();
        req_header.sequence_counter = 1;
        req_header.etb_topo_cnt = 2;
        let outcome = table.check_duplicate(&req_header, false, false);
        assert_eq!(outcome, DuplicateOutcome::FallThroughToListener);
    }

    #[test]
    fn duplicate_after_reply_queued_retransmits() {
        let mut table = MdSessionTable::new(10);
        let req_header = MdHeader::new(MsgType::Mr, 700, sid(18), "peer", "me");
        let h = table.create_rx_request(&req_header, Ipv4Addr::new(10, 0, 0, 18), false, false).unwrap();
        table.prepare_reply(h, false, "me", "peer", b"ok").unwrap();
        let mut retry_header = req_header.clone();
        retry_header.sequence_counter = 1;
        let outcome = table.check_duplicate(&retry_header, false, false);
        assert_eq!(outcome, DuplicateOutcome::Retransmit(h));
    }

    #[test]
    fn retryable_request_retries_before_giving_up() {
        let mut table = MdSessionTable::new(10);
        let h = table
            .request(sid(10), 1000, Ipv4Addr::new(10, 0, 0, 10), "a", "b", b"req", 1, Duration::from_millis(1), 2)
            .unwrap();
        table.mark_sent(h).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let actions = table.process_timeouts(Instant::now());
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], TimeoutAction::Retry(_)));
        assert_eq!(table.get(h).unwrap().num_retries, 1);
    }

    #[test]
    fn request_exhausting_retries_becomes_fatal() {
        let mut table = MdSessionTable::new(10);
        let h = table
            .request(sid(11), 1100, Ipv4Addr::new(10, 0, 0, 11), "a", "b", b"req", 1, Duration::from_millis(1), 0)
            .unwrap();
        table.mark_sent(h).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let actions = table.process_timeouts(Instant::now());
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], TimeoutAction::Fatal(_, TrdpError::ReplyTimeout)));
        assert!(table.get(h).unwrap().morituri);
    }

    #[test]
    fn multi_reply_request_is_never_retried() {
        let mut table = MdSessionTable::new(10);
        let h = table
            .request(sid(12), 1200, Ipv4Addr::new(10, 0, 0, 12), "a", "b", b"req", 3, Duration::from_millis(1), 2)
            .unwrap();
        table.mark_sent(h).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let actions = table.process_timeouts(Instant::now());
        assert!(matches!(actions[0], TimeoutAction::Fatal(_, _)));
    }

    #[test]
    fn sweep_removes_morituri_and_returns_freed_slots() {
        let mut table = MdSessionTable::new(10);
        let h = table
            .notify(sid(13), 1300, Ipv4Addr::new(10, 0, 0, 13), "a", "b", b"hi", SendParams::default())
            .unwrap();
        table.get_mut(h).unwrap().socket_slot = Some(42);
        table.mark_sent(h).unwrap();
        let freed = table.sweep();
        assert_eq!(freed, vec![42]);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn callback_is_reachable_through_the_entry_after_set_callback() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct CountingCallback(Arc<AtomicUsize>);
        impl MdSessionCallback for CountingCallback {
            fn on_reply(&self, _info: &MdInfo, _data: &[u8]) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn on_error(&self, _err: &TrdpError) {}
        }

        let mut table = MdSessionTable::new(10);
        let h = table
            .request(sid(15), 1500, Ipv4Addr::new(10, 0, 0, 15), "a", "b", b"req", 1, Duration::from_secs(2), 0)
            .unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        table.set_callback(h, Box::new(CountingCallback(count.clone()))).unwrap();
        let info = MdInfo {
            com_id: 1500,
            session_id: sid(15),
            src_ip: Ipv4Addr::new(10, 0, 0, 15),
            sequence_counter: 1,
        };
        table.get(h).unwrap().callback().unwrap().on_reply(&info, b"data");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mark_error_marks_matching_entry_morituri() {
        let mut table = MdSessionTable::new(10);
        let h = table
            .request(sid(16), 1600, Ipv4Addr::new(10, 0, 0, 16), "a", "b", b"req", 1, Duration::from_secs(2), 0)
            .unwrap();
        table.mark_sent(h).unwrap();
        let matched = table.mark_error(&sid(16));
        assert_eq!(matched, Some(h));
        assert!(table.get(h).unwrap().morituri);
    }

    #[test]
    fn error_response_carries_reply_status() {
        let header = MdHeader::new(MsgType::Mr, 1400, sid(14), "peer", "me");
        let buf = MdSessionTable::build_error_response(&header, -1, "me", "peer").unwrap();
        let decoded = crate::codec::md::decode_and_validate_md_header(&buf, &Default::default()).unwrap();
        assert_eq!(decoded.msg_type, MsgType::Me);
        assert_eq!(decoded.reply_status, -1);
    }
}
