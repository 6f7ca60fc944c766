// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP socket construction for PD and MD traffic.
//!
//! A thin wrapper over `socket2::Socket` that applies the options the
//! socket pool (C2) needs (reuse-address, TTL, multicast join/loop,
//! non-blocking) and hands back a `std::net::UdpSocket`.

use crate::config::SendParams;
use crate::transport::multicast::{join_multicast_group, leave_multicast_group};
use crate::transport::ttl::{set_multicast_ttl, set_socket2_unicast_ttl};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

/// Options applied when opening a UDP socket for the pool.
#[derive(Debug, Clone, Copy)]
pub struct UdpOpenOptions {
    /// Local address to bind to.
    pub bind_addr: SocketAddrV4,
    /// Multicast group to join immediately after bind, if any.
    pub join_group: Option<Ipv4Addr>,
    /// Send parameters (TTL is the only field this layer consumes).
    pub send_params: SendParams,
    /// Whether to set `SO_REUSEADDR`.
    pub reuse_addr: bool,
    /// Whether to enable multicast loopback (same-host delivery).
    pub multicast_loop: bool,
    /// Put the socket in non-blocking mode.
    pub nonblocking: bool,
}

impl Default for UdpOpenOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            join_group: None,
            send_params: SendParams::default(),
            reuse_addr: true,
            multicast_loop: true,
            nonblocking: true,
        }
    }
}

/// Open and configure one UDP socket per the given options.
pub fn open_udp_socket(opts: &UdpOpenOptions) -> io::Result<UdpSocket> {
    let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket2.set_reuse_address(opts.reuse_addr)?;
    socket2.bind(&SocketAddr::V4(opts.bind_addr).into())?;
    set_socket2_unicast_ttl(&socket2, opts.send_params.ttl).ok();

    let socket: UdpSocket = socket2.into();
    socket.set_nonblocking(opts.nonblocking)?;

    if let Some(group) = opts.join_group {
        join_multicast_group(&socket, group)?;
        socket.set_multicast_loop_v4(opts.multicast_loop)?;
        set_multicast_ttl(&socket, opts.send_params.ttl).ok();
    }

    Ok(socket)
}

/// Leave a previously joined multicast group on `socket`.
pub fn leave_group(socket: &UdpSocket, group: Ipv4Addr) -> io::Result<()> {
    leave_multicast_group(socket, group)
}
