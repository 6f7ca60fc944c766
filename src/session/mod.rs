// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session scheduler (C6, "the core"): owns every other component and
//! drives PD send/receive, MD send/receive/timeout, and socket-pool upkeep
//! from one `process()` call, exactly as an application's main loop would
//! call `tlProcess` in the reference API.
//!
//! `get_interval`/`process` remains the portable, caller-driven interface;
//! on unix it is backed by an [`mio`]-based [`reactor::Reactor`] so
//! `process` blocks in `epoll`/`kqueue` instead of busy-polling every slot
//! (see the reactor module doc comment). Non-unix targets fall back to
//! scanning every slot each call, matching how `transport::ttl` already
//! splits a unix fast path from a portable one.

#[cfg(unix)]
mod reactor;

use crate::codec::md::{decode_and_validate_md_header, MdHeader, SessionId};
use crate::codec::pd::{decode_and_validate_pd_header, ValidateOptions as PdValidateOptions};
use crate::codec::MsgType;
use crate::config::{PdTimeoutBehavior, SendParams, SessionConfig};
use crate::dnr::DnrCache;
use crate::error::{TrdpError, TrdpResult};
use crate::md::listener::{ListenerHandle, ListenerTable, MdCallback, MdInfo};
use crate::md::{DuplicateOutcome, MdSessionCallback, MdSessionHandle, MdSessionTable, TimeoutAction};
use crate::pd::publisher::{Publisher, PublisherHandle};
use crate::pd::subscriber::{PdCallback, PdInfo, Subscriber, SubscriberHandle};
use crate::pd::table::{PublisherTable, SubscriberTable};
use crate::pd::AddressKey;
use crate::transport::socket_pool::{SocketDirection, SocketHandle, SocketPool, SocketRequest};
use crate::ttdb::TtdbCache;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

#[cfg(unix)]
use reactor::Reactor;

/// Upper bound `get_interval` ever returns when nothing else is pending,
/// so a caller blocked in `process` still wakes up to service housekeeping.
const IDLE_INTERVAL_CAP: Duration = Duration::from_millis(1000);

/// The session scheduler: every table from C1-C9 in one place, plus the
/// reactor that drives `process()`.
pub struct Session {
    config: SessionConfig,
    host_ip: Ipv4Addr,
    pub(crate) etb_topo_cnt: u32,
    pub(crate) op_trn_topo_cnt: u32,
    pool: SocketPool,
    publishers: PublisherTable,
    subscribers: SubscriberTable,
    md_sessions: MdSessionTable,
    listeners: ListenerTable,
    dnr: DnrCache,
    ttdb: TtdbCache,
    #[cfg(unix)]
    reactor: Reactor,
    next_session_id: u128,
}

impl Session {
    /// Open a session: resolve this host's own IP (used as the default
    /// source address for outgoing publishers and MD requests) and
    /// initialize every table empty. Mirrors `tlOpenSession`.
    pub fn open(config: SessionConfig) -> TrdpResult<Self> {
        config.validate().map_err(TrdpError::Param)?;
        let host_ip = crate::transport::get_primary_interface_ip().map_err(TrdpError::Sock)?;
        let max_sessions = config.md.max_sessions;
        Ok(Self {
            host_ip,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            pool: SocketPool::new(max_sessions * 2 + 16),
            publishers: PublisherTable::new(),
            subscribers: SubscriberTable::new(),
            md_sessions: MdSessionTable::new(max_sessions),
            listeners: ListenerTable::new(),
            dnr: DnrCache::new(),
            ttdb: TtdbCache::new(),
            #[cfg(unix)]
            reactor: Reactor::new().map_err(TrdpError::Sock)?,
            next_session_id: 1,
            config,
        })
    }

    /// `tlSetETBTopoCount`/`tlSetOpTrainTopoCount`: narrow which packets the
    /// decode path accepts and which DNR entries are considered fresh.
    pub fn set_topo_counts(&mut self, etb: u32, op_trn: u32) {
        self.etb_topo_cnt = etb;
        self.op_trn_topo_cnt = op_trn;
    }

    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.config.host_name
    }

    /// The DNR client's cache, for `uri_to_addr` callers and hosts-file loading.
    pub fn dnr(&mut self) -> &mut DnrCache {
        &mut self.dnr
    }

    /// The TTDB client's cache, for `getOwnIds`/`getCstInfo` callers.
    pub fn ttdb(&mut self) -> &mut TtdbCache {
        &mut self.ttdb
    }

    fn next_session_id(&mut self) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1).max(1);
        let mut out = [0u8; 16];
        out.copy_from_slice(&id.to_be_bytes());
        out
    }

    // ---------------------------------------------------------------
    // Process Data (C3)
    // ---------------------------------------------------------------

    /// `tlPublish`: register a cyclic (or on-request, if `interval` is
    /// zero) outgoing publication and acquire its sending socket.
    #[allow(clippy::too_many_arguments)]
    pub fn pd_publish(
        &mut self,
        com_id: u32,
        dst_ip: Ipv4Addr,
        interval: Duration,
        redundancy_group: u32,
        send_params: SendParams,
        initial_data: &[u8],
    ) -> TrdpResult<PublisherHandle> {
        let mut addr = AddressKey::for_com_id(com_id);
        addr.dst_ip = dst_ip;
        let mut publisher = Publisher::new(addr, interval, redundancy_group, send_params, initial_data)?;
        let slot = self.pool.request(SocketRequest {
            port: 0,
            send_params,
            src_ip: self.host_ip,
            sock_type: SocketDirection::PdUdp,
            rcv_mostly: false,
            ..SocketRequest::default()
        })?;
        publisher.socket_slot = Some(slot);
        self.publishers.insert(publisher)
    }

    /// `tlUnpublish`.
    pub fn pd_unpublish(&mut self, handle: PublisherHandle) -> TrdpResult<()> {
        let publisher = self.publishers.remove(handle).ok_or(TrdpError::NoSession)?;
        if let Some(slot) = publisher.socket_slot {
            self.pool.release(slot, self.config.md.connect_timeout, None)?;
        }
        Ok(())
    }

    /// `tlPut`: update a publisher's payload ahead of its next cyclic send.
    pub fn pd_put(&mut self, handle: PublisherHandle, data: &[u8]) -> TrdpResult<()> {
        self.publishers.get_mut(handle).ok_or(TrdpError::NoSession)?.put(data)
    }

    /// `tlSubscribe`: register an incoming subscription and acquire (or
    /// share) its receiving socket, joining `mc_group` if given.
    pub fn pd_subscribe(
        &mut self,
        com_id: u32,
        src_ip: Ipv4Addr,
        mc_group: Option<Ipv4Addr>,
        timeout: Duration,
        timeout_behavior: PdTimeoutBehavior,
        callback: Option<Box<dyn PdCallback>>,
    ) -> TrdpResult<SubscriberHandle> {
        let mut addr = AddressKey::for_com_id(com_id);
        addr.src_ip = src_ip;
        if let Some(group) = mc_group {
            addr.mc_group = group;
        }
        let mut subscriber = Subscriber::new(addr, timeout, timeout_behavior);
        if let Some(cb) = callback {
            subscriber = subscriber.with_callback(cb);
        }
        let slot = self.pool.request(SocketRequest {
            port: crate::config::PD_UDP_PORT,
            src_ip: Ipv4Addr::UNSPECIFIED,
            mc_group,
            sock_type: SocketDirection::PdUdp,
            rcv_mostly: true,
            ..SocketRequest::default()
        })?;
        subscriber.socket_slot = Some(slot);
        self.subscribers.insert(subscriber)
    }

    /// `tlUnsubscribe`.
    pub fn pd_unsubscribe(&mut self, handle: SubscriberHandle) -> TrdpResult<()> {
        let subscriber = self.subscribers.remove(handle).ok_or(TrdpError::NoSession)?;
        if let Some(slot) = subscriber.socket_slot {
            self.pool.release(slot, self.config.md.connect_timeout, None)?;
        }
        Ok(())
    }

    /// `tlGet`: fetch the last cached value and its info snapshot.
    pub fn pd_get(&self, handle: SubscriberHandle) -> TrdpResult<(PdInfo, Vec<u8>)> {
        let subscriber = self.subscribers.get(handle).ok_or(TrdpError::NoSession)?;
        let (info, data) = subscriber.get(Instant::now())?;
        Ok((info, data.to_vec()))
    }

    /// Turn on the subscriber table's indexed fast-path (§4.3): dispatch
    /// binary-searches a `comId`-sorted index instead of scanning every
    /// subscriber. Intended for sessions with many subscriptions.
    pub fn pd_enable_fast_path(&mut self) {
        self.subscribers.enable_fast_path();
    }

    /// Rebuild the fast-path index after bulk subscriber registration.
    /// Subscribers added since the last call are still found (by linear
    /// scan) but without the index's O(log N) lookup until this runs.
    pub fn pd_update_session(&mut self) {
        self.subscribers.update_session();
    }

    // ---------------------------------------------------------------
    // Message Data (C4)
    // ---------------------------------------------------------------

    /// `tlAddListener`.
    pub fn md_add_listener(&mut self, com_id: u32, src_ip: Ipv4Addr, callback: Box<dyn MdCallback>) -> ListenerHandle {
        self.listeners.add(com_id, src_ip, callback)
    }

    /// `tlRemoveListener`.
    pub fn md_remove_listener(&mut self, handle: ListenerHandle) -> bool {
        self.listeners.remove(handle)
    }

    fn md_socket_slot(&mut self, peer_ip: Ipv4Addr, use_tcp: bool, send_params: SendParams) -> TrdpResult<usize> {
        if use_tcp {
            self.pool.request(SocketRequest {
                port: crate::config::MD_TCP_PORT,
                src_ip: self.host_ip,
                corner_ip: Some(peer_ip),
                sock_type: SocketDirection::MdTcp,
                send_params,
                rcv_mostly: false,
                ..SocketRequest::default()
            })
        } else {
            self.pool.request(SocketRequest {
                port: 0,
                src_ip: self.host_ip,
                sock_type: SocketDirection::MdUdp,
                send_params,
                rcv_mostly: false,
                ..SocketRequest::default()
            })
        }
    }

    fn send_on_slot(&mut self, slot: usize, peer_ip: Ipv4Addr, port: u16, data: &[u8]) -> TrdpResult<()> {
        let entry = self.pool.get_mut(slot).ok_or(TrdpError::NoSession)?;
        match &mut entry.handle {
            SocketHandle::Udp(sock) => {
                let dest = SocketAddr::V4(SocketAddrV4::new(peer_ip, port));
                sock.send_to(data, dest).map_err(TrdpError::Sock)?;
            }
            SocketHandle::TcpStream(stream) => {
                use std::io::Write;
                stream.write_all(data).map_err(TrdpError::Sock)?;
            }
            SocketHandle::TcpListener(_) => return Err(TrdpError::Param("cannot send on a listening socket")),
        }
        Ok(())
    }

    /// `tlNotify`: fire-and-forget MD send.
    pub fn md_notify(&mut self, com_id: u32, peer_ip: Ipv4Addr, payload: &[u8], send_params: SendParams, use_tcp: bool) -> TrdpResult<MdSessionHandle> {
        let session_id = self.next_session_id();
        let slot = self.md_socket_slot(peer_ip, use_tcp, send_params)?;
        let handle = self.md_sessions.notify(session_id, com_id, peer_ip, &self.config.host_name, "", payload, send_params)?;
        if let Some(entry) = self.md_sessions.get_mut(handle) {
            entry.is_tcp = use_tcp;
            entry.socket_slot = Some(slot);
        }
        self.dispatch_send(handle)?;
        self.md_sessions.mark_sent(handle)?;
        Ok(handle)
    }

    /// `tlRequest`: send an `Mr` and arm the reply timeout.
    #[allow(clippy::too_many_arguments)]
    pub fn md_request(
        &mut self,
        com_id: u32,
        peer_ip: Ipv4Addr,
        payload: &[u8],
        num_expected_replies: u32,
        reply_timeout: Duration,
        use_tcp: bool,
        send_params: SendParams,
    ) -> TrdpResult<MdSessionHandle> {
        let session_id = self.next_session_id();
        let slot = self.md_socket_slot(peer_ip, use_tcp, send_params)?;
        let timeout = if reply_timeout.is_zero() { self.config.md.reply_timeout } else { reply_timeout };
        let handle = self.md_sessions.request(
            session_id,
            com_id,
            peer_ip,
            &self.config.host_name,
            "",
            payload,
            num_expected_replies,
            timeout,
            self.config.md.retries,
        )?;
        if let Some(entry) = self.md_sessions.get_mut(handle) {
            entry.is_tcp = use_tcp;
            entry.socket_slot = Some(slot);
        }
        self.dispatch_send(handle)?;
        self.md_sessions.mark_sent(handle)?;
        Ok(handle)
    }

    /// Attach a callback to a send-side session (notify or request),
    /// invoked once `process()` learns the outcome.
    pub fn md_set_callback(&mut self, handle: MdSessionHandle, callback: Box<dyn MdSessionCallback>) -> TrdpResult<()> {
        self.md_sessions.set_callback(handle, callback)
    }

    /// `tlReply`/`tlReplyQuery`: answer an `Mr` this session is holding in
    /// `RxReqW4ApReply`.
    pub fn md_reply(&mut self, handle: MdSessionHandle, want_confirm: bool, payload: &[u8]) -> TrdpResult<()> {
        self.md_sessions.prepare_reply(handle, want_confirm, &self.config.host_name, "", payload)?;
        self.dispatch_send(handle)?;
        self.md_sessions.mark_sent(handle)
    }

    /// `tlConfirm`: confirm a reply-query this session received in
    /// `TxReqW4ApConfirm`.
    pub fn md_confirm(&mut self, handle: MdSessionHandle) -> TrdpResult<()> {
        self.md_sessions.prepare_confirm(handle, &self.config.host_name, "")?;
        self.dispatch_send(handle)?;
        self.md_sessions.mark_confirm_sent(handle)
    }

    fn dispatch_send(&mut self, handle: MdSessionHandle) -> TrdpResult<()> {
        let entry = self.md_sessions.get(handle).ok_or(TrdpError::NoSession)?;
        let slot = entry.socket_slot.ok_or(TrdpError::NoSession)?;
        let peer_ip = entry.peer_ip;
        let is_tcp = entry.is_tcp;
        let buffer = entry.wire_buffer().to_vec();
        let port = if is_tcp { crate::config::MD_TCP_PORT } else { crate::config::MD_UDP_PORT };
        self.send_on_slot(slot, peer_ip, port, &buffer)
    }

    // ---------------------------------------------------------------
    // Scheduler (C6)
    // ---------------------------------------------------------------

    /// `tlGetInterval`: the longest a caller may block in `select`/`poll`
    /// before calling `process()` again without missing a deadline.
    #[must_use]
    pub fn get_interval(&mut self) -> Duration {
        let now = Instant::now();
        let mut next: Option<Instant> = None;
        let mut consider = |t: Instant| {
            next = Some(next.map_or(t, |n| n.min(t)));
        };
        for (_, p) in self.publishers.iter_mut() {
            if p.interval > Duration::ZERO && p.is_leader {
                consider(p.next_send_time);
            }
        }
        for (_, s) in self.subscribers.iter_mut() {
            consider(s.deadline());
        }
        if let Some(d) = self.md_sessions.next_deadline() {
            consider(d);
        }
        if let Some(d) = self.pool.next_close_deadline() {
            consider(d);
        }
        match next {
            Some(t) if t > now => (t - now).min(self.config.cycle_time.max(IDLE_INTERVAL_CAP)),
            Some(_) => Duration::ZERO,
            None => self.config.cycle_time.max(IDLE_INTERVAL_CAP).min(IDLE_INTERVAL_CAP),
        }
    }

    /// `tlProcess`: one iteration of the scheduler. Drains every socket
    /// that has data ready, sends every publisher whose interval elapsed,
    /// sweeps MD timeouts, and releases sockets the sweep frees.
    pub fn process(&mut self, timeout: Option<Duration>) -> TrdpResult<()> {
        self.poll_ready_sockets(timeout)?;
        self.send_ready_publishers()?;
        self.sweep_md_timeouts()?;
        let freed = self.md_sessions.sweep();
        for slot in freed {
            let _ = self.pool.release(slot, self.config.md.connect_timeout, None);
        }
        self.apply_subscriber_timeouts();
        self.pool.sweep(Instant::now(), false);
        Ok(())
    }

    #[cfg(unix)]
    fn poll_ready_sockets(&mut self, timeout: Option<Duration>) -> TrdpResult<()> {
        self.reactor.sync(&self.pool);
        let ready = self.reactor.poll(timeout).map_err(TrdpError::Sock)?;
        for r in ready {
            if r.writable {
                self.handle_tcp_connect_writable(r.slot);
            }
            if r.readable {
                self.handle_readable_slot(r.slot)?;
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn poll_ready_sockets(&mut self, timeout: Option<Duration>) -> TrdpResult<()> {
        if let Some(t) = timeout {
            std::thread::sleep(t.min(Duration::from_millis(50)));
        }
        let indices: Vec<usize> = self.pool.iter().map(|(idx, _)| idx).collect();
        for idx in indices {
            self.handle_readable_slot(idx)?;
        }
        Ok(())
    }

    fn handle_tcp_connect_writable(&mut self, slot: usize) {
        let Some(entry) = self.pool.get_mut(slot) else { return };
        if !entry.tcp.as_ref().is_some_and(|t| t.connect_deadline.is_some()) {
            return;
        }
        let result = match &entry.handle {
            SocketHandle::TcpStream(stream) => connect_error(stream),
            _ => return,
        };
        match result {
            Ok(None) => {
                if let Some(tcp) = entry.tcp.as_mut() {
                    tcp.connect_deadline = None;
                }
            }
            Ok(Some(_)) | Err(_) => {
                entry.closing = true;
                entry.close_deadline = Some(Instant::now());
            }
        }
    }

    fn handle_readable_slot(&mut self, slot: usize) -> TrdpResult<()> {
        let Some(sock_type) = self.pool.get(slot).map(|s| s.sock_type) else { return Ok(()) };
        match sock_type {
            SocketDirection::PdUdp | SocketDirection::PdTsn => self.drain_pd_udp(slot),
            SocketDirection::MdUdp => self.drain_md_udp(slot),
            SocketDirection::MdTcp => self.drain_md_tcp(slot),
        }
    }

    fn drain_pd_udp(&mut self, slot: usize) -> TrdpResult<()> {
        let mut buf = [0u8; crate::config::MAX_PD_DATA_SIZE + 64];
        loop {
            let (n, src) = {
                let Some(entry) = self.pool.get_mut(slot) else { return Ok(()) };
                let SocketHandle::Udp(sock) = &entry.handle else { return Ok(()) };
                match sock.recv_from(&mut buf) {
                    Ok(v) => v,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                    Err(_) => return Ok(()),
                }
            };
            let Ipv4Source(src_ip) = Ipv4Source::from(src);
            let opts = PdValidateOptions {
                check_data_too: true,
                etb_topo_cnt: self.etb_topo_cnt,
                op_trn_topo_cnt: self.op_trn_topo_cnt,
            };
            let Ok(header) = decode_and_validate_pd_header(&buf[..n], &opts) else {
                continue;
            };
            if header.msg_type == MsgType::Pr {
                self.answer_pd_pull(&header);
                continue;
            }
            self.subscribers.for_each_matching(header.com_id, |_, sub| {
                let _ = sub.on_receive(src_ip, &buf[..n], &opts);
            });
        }
    }

    /// Answer an incoming PD-Pull `Pr` (§4.3): if a publisher is registered
    /// under the requested comId, send it a one-shot `Pp` carrying the
    /// publisher's current payload to the requester's named reply address;
    /// no listener match is not an error here, PD has no `Me`-style
    /// not-found reply.
    fn answer_pd_pull(&mut self, header: &crate::codec::pd::PdHeader) {
        let Some(publisher) = self.publishers.find_by_com_id_mut(header.com_id) else { return };
        let Ok(buf) = publisher.build_pull_reply(header.reply_com_id) else { return };
        let reply_ip = Ipv4Addr::from(header.reply_ip);
        let Some(slot) = publisher.socket_slot else { return };
        let _ = self.send_on_slot(slot, reply_ip, crate::config::PD_UDP_PORT, &buf);
    }

    /// `tlRequest` (PD side, PD-Pull): ask the publisher nominated for this
    /// subscriber's comId to send one `Pp` back, to `dst_ip`, replying under
    /// `reply_com_id` (0 keeps the publisher's own comId).
    pub fn pd_request(&mut self, handle: SubscriberHandle, dst_ip: Ipv4Addr, reply_com_id: u32) -> TrdpResult<()> {
        let host_ip = self.host_ip;
        let subscriber = self.subscribers.get_mut(handle).ok_or(TrdpError::NoSession)?;
        let slot = subscriber.socket_slot.ok_or(TrdpError::NoSession)?;
        let buf = subscriber.build_pull_request(reply_com_id, host_ip)?;
        self.send_on_slot(slot, dst_ip, crate::config::PD_UDP_PORT, &buf)
    }

    fn drain_md_udp(&mut self, slot: usize) -> TrdpResult<()> {
        let mut buf = vec![0u8; crate::config::MAX_MD_DATA_SIZE + 256];
        loop {
            let (n, src) = {
                let Some(entry) = self.pool.get_mut(slot) else { return Ok(()) };
                let SocketHandle::Udp(sock) = &entry.handle else { return Ok(()) };
                match sock.recv_from(&mut buf) {
                    Ok(v) => v,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                    Err(_) => return Ok(()),
                }
            };
            let Ipv4Source(src_ip) = Ipv4Source::from(src);
            self.dispatch_md_frame(&buf[..n], src_ip, false, false);
        }
    }

    fn drain_md_tcp(&mut self, slot: usize) -> TrdpResult<()> {
        let is_listener = matches!(self.pool.get(slot).map(|s| &s.handle), Some(SocketHandle::TcpListener(_)));
        if is_listener {
            return self.accept_md_tcp(slot);
        }
        let peer_ip = self
            .pool
            .get(slot)
            .and_then(|s| s.tcp.as_ref())
            .map(|t| t.corner_ip)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        loop {
            let frame = {
                let Some(entry) = self.pool.get_mut(slot) else { return Ok(()) };
                let SocketHandle::TcpStream(stream) = &mut entry.handle else { return Ok(()) };
                let Some(tcp) = entry.tcp.as_mut() else { return Ok(()) };
                match tcp.read_state.read_message(stream) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return Ok(()),
                    Err(_) => {
                        entry.closing = true;
                        entry.close_deadline = Some(Instant::now());
                        return Ok(());
                    }
                }
            };
            self.dispatch_md_frame(&frame, peer_ip, true, false);
        }
    }

    fn accept_md_tcp(&mut self, listener_slot: usize) -> TrdpResult<()> {
        loop {
            let accepted = {
                let Some(entry) = self.pool.get_mut(listener_slot) else { return Ok(()) };
                let SocketHandle::TcpListener(listener) = &entry.handle else { return Ok(()) };
                match listener.accept() {
                    Ok(v) => v,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                    Err(_) => return Ok(()),
                }
            };
            let (stream, peer) = accepted;
            let _ = stream.set_nonblocking(true);
            let SocketAddr::V4(peer_v4) = peer else { continue };
            let slot = crate::transport::socket_pool::SocketSlot {
                handle: SocketHandle::TcpStream(stream),
                bind_addr: SocketAddrV4::new(self.host_ip, crate::config::MD_TCP_PORT),
                src_ip: self.host_ip,
                sock_type: SocketDirection::MdTcp,
                send_params: SendParams::default(),
                usage: 1,
                rcv_mostly: true,
                mc_groups: Vec::new(),
                tcp: Some(crate::transport::socket_pool::TcpSlotState {
                    corner_ip: *peer_v4.ip(),
                    connect_deadline: None,
                    send_not_ok: false,
                    send_not_ok_deadline: None,
                    read_state: crate::transport::tcp::ReadState::new(),
                }),
                closing: false,
                close_deadline: None,
            };
            let _ = self.pool.insert_accepted(slot);
        }
    }

    fn dispatch_md_frame(&mut self, raw: &[u8], src_ip: Ipv4Addr, is_tcp: bool, is_multicast: bool) {
        let opts = crate::codec::md::ValidateOptions {
            etb_topo_cnt: self.etb_topo_cnt,
            op_trn_topo_cnt: self.op_trn_topo_cnt,
        };
        let Ok(header) = decode_and_validate_md_header(raw, &opts) else { return };
        let payload_start = crate::codec::md::MD_HEADER_SIZE;
        let payload = raw.get(payload_start..payload_start + header.dataset_length as usize).unwrap_or(&[]);
        match header.msg_type {
            MsgType::Mp | MsgType::Mq => {
                if let Ok(Some(handle)) = self.md_sessions.on_reply_received(&header) {
                    self.invoke_reply_callback(handle, &header, src_ip, payload);
                }
            }
            MsgType::Mc => {
                let _ = self.md_sessions.on_confirm_received(&header);
            }
            MsgType::Me => {
                if let Some(handle) = self.md_sessions.mark_error(&header.session_id) {
                    if let Some(entry) = self.md_sessions.get(handle) {
                        if let Some(cb) = entry.callback() {
                            cb.on_error(&TrdpError::Param("peer returned Me (reply status error)"));
                        }
                    }
                }
            }
            MsgType::Mn | MsgType::Mr => {
                self.dispatch_incoming_md_request_or_notify(&header, src_ip, payload, is_tcp, is_multicast);
            }
            _ => {}
        }
    }

    fn invoke_reply_callback(&mut self, handle: MdSessionHandle, header: &MdHeader, src_ip: Ipv4Addr, payload: &[u8]) {
        let Some(entry) = self.md_sessions.get(handle) else { return };
        let Some(cb) = entry.callback() else { return };
        let info = MdInfo {
            com_id: header.com_id,
            session_id: header.session_id,
            src_ip,
            sequence_counter: header.sequence_counter,
        };
        cb.on_reply(&info, payload);
    }

    fn dispatch_incoming_md_request_or_notify(&mut self, header: &MdHeader, src_ip: Ipv4Addr, payload: &[u8], is_tcp: bool, is_multicast: bool) {
        match self.md_sessions.check_duplicate(header, is_tcp, is_multicast) {
            DuplicateOutcome::Discard => return,
            DuplicateOutcome::Retransmit(handle) => {
                let _ = self.dispatch_send(handle);
                return;
            }
            DuplicateOutcome::FallThroughToListener | DuplicateOutcome::New => {}
        }
        let Some(listener) = self.listeners.find(header.com_id, src_ip) else {
            if header.msg_type == MsgType::Mr {
                if let Ok(err_buf) = MdSessionTable::build_error_response(header, -1, &self.config.host_name, "") {
                    let slot = self.md_socket_slot(src_ip, is_tcp, SendParams::default());
                    if let Ok(slot) = slot {
                        let _ = self.send_on_slot(slot, src_ip, crate::config::MD_UDP_PORT, &err_buf);
                        let _ = self.pool.release(slot, self.config.md.connect_timeout, None);
                    }
                }
            }
            return;
        };
        let info = MdInfo {
            com_id: header.com_id,
            session_id: header.session_id,
            src_ip,
            sequence_counter: header.sequence_counter,
        };
        match header.msg_type {
            MsgType::Mn => {
                listener.callback.on_notify(&info, payload);
                let _ = self.md_sessions.create_rx_notify(header, src_ip, is_tcp, is_multicast);
            }
            MsgType::Mr => {
                listener.callback.on_request(&info, payload);
                let _ = self.md_sessions.create_rx_request(header, src_ip, is_tcp, is_multicast);
            }
            _ => {}
        }
    }

    fn send_ready_publishers(&mut self) -> TrdpResult<()> {
        let now = Instant::now();
        let mut sends: Vec<(usize, Ipv4Addr, Vec<u8>)> = Vec::new();
        for (_, publisher) in self.publishers.iter_mut() {
            publisher.refresh_crc_if_dirty()?;
            if !publisher.ready_to_send(now) {
                continue;
            }
            let Some(slot) = publisher.socket_slot else { continue };
            let dst = publisher.addr.dst_ip;
            let buf = publisher.prepare_send(now)?.to_vec();
            sends.push((slot, dst, buf));
        }
        for (slot, dst, buf) in sends {
            let _ = self.send_on_slot(slot, dst, crate::config::PD_UDP_PORT, &buf);
        }
        Ok(())
    }

    fn sweep_md_timeouts(&mut self) -> TrdpResult<()> {
        let now = Instant::now();
        for action in self.md_sessions.process_timeouts(now) {
            match action {
                TimeoutAction::Retry(handle) => {
                    let _ = self.dispatch_send(handle);
                }
                TimeoutAction::Fatal(handle, err) => {
                    if let Some(entry) = self.md_sessions.get(handle) {
                        if let Some(cb) = entry.callback() {
                            cb.on_error(&err);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_subscriber_timeouts(&mut self) {
        let now = Instant::now();
        for (_, sub) in self.subscribers.iter_mut() {
            sub.apply_timeout_if_due(now);
        }
    }
}

struct Ipv4Source(Ipv4Addr);

impl From<SocketAddr> for Ipv4Source {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Ipv4Source(*v4.ip()),
            SocketAddr::V6(_) => Ipv4Source(Ipv4Addr::UNSPECIFIED),
        }
    }
}

#[cfg(unix)]
fn connect_error(stream: &std::net::TcpStream) -> std::io::Result<Option<std::io::Error>> {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: fd is a valid, open socket descriptor for the lifetime of this
    // call (borrowed from `stream`); `err`/`len` are stack locals sized
    // exactly as `getsockopt` expects for `SO_ERROR`.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::addr_of_mut!(err).cast(),
            &mut len,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(std::io::Error::from_raw_os_error(err)))
    }
}

#[cfg(not(unix))]
fn connect_error(_stream: &std::net::TcpStream) -> std::io::Result<Option<std::io::Error>> {
    Ok(None)
}
