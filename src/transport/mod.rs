// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP and TCP transport for TRDP PD and MD traffic.
//!
//! # Modules
//!
//! - `udp` - UDP socket construction (PD datagrams, MD datagram mode)
//! - `tcp` - TCP connection management for MD streamed mode
//! - `multicast` - Multicast group joining and interface discovery
//! - `ttl` - Multicast/unicast TTL configuration
//! - `socket_pool` - Shared-socket pool keyed by bind address and direction (C2)

pub mod multicast;
pub mod socket_pool;
pub mod tcp;
pub mod ttl;
pub mod udp;

pub use multicast::{
    get_multicast_interfaces, get_primary_interface_ip, join_multicast_group,
    leave_multicast_group,
};
pub use socket_pool::{SocketDirection, SocketPool, SocketSlot};
pub use ttl::{get_multicast_ttl, get_unicast_ttl, set_multicast_ttl, set_unicast_ttl, TtlConfig};
pub use udp::{open_udp_socket, leave_group, UdpOpenOptions};
