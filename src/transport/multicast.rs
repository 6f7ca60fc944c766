// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast group management and interface discovery.
//!
//! TRDP multicast groups are per-subscriber (the `mcGroup` field of the
//! addressing key), not fixed protocol constants, so joining takes the
//! group as a parameter rather than hardcoding it.

use std::io;
use std::net::{Ipv4Addr, UdpSocket};

/// Join `group` on every suitable local interface.
///
/// Mirrors how a multi-homed router joins a multicast group once per
/// physical interface rather than once for the whole host.
pub fn join_multicast_group(socket: &UdpSocket, group: Ipv4Addr) -> io::Result<Ipv4Addr> {
    let interfaces = get_multicast_interfaces()?;

    if interfaces.is_empty() {
        log::debug!("[MC] no suitable interfaces found for {}, using UNSPECIFIED", group);
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    } else {
        for iface in &interfaces {
            match socket.join_multicast_v4(&group, iface) {
                Ok(()) => log::debug!("[MC] join_multicast_v4({}) on {}", group, iface),
                Err(e) if e.raw_os_error() == Some(98) => {
                    log::debug!("[MC] join_multicast_v4({}) on {} - already joined", group, iface);
                }
                Err(e) => {
                    log::debug!("[MC] join_multicast_v4({}) on {} failed (non-fatal): {}", group, iface, e);
                }
            }
        }
    }

    Ok(interfaces.first().copied().unwrap_or(Ipv4Addr::UNSPECIFIED))
}

/// Leave `group` on every interface it was joined on.
pub fn leave_multicast_group(socket: &UdpSocket, group: Ipv4Addr) -> io::Result<()> {
    let interfaces = get_multicast_interfaces()?;
    if interfaces.is_empty() {
        return socket.leave_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED);
    }
    for iface in &interfaces {
        if let Err(e) = socket.leave_multicast_v4(&group, iface) {
            log::debug!("[MC] leave_multicast_v4({}) on {} failed: {}", group, iface, e);
        }
    }
    Ok(())
}

/// Get all non-loopback IPv4 interfaces suitable for multicast.
///
/// - Linux: parses `ip -4 addr show` output
/// - Other platforms: uses the `local_ip_address` crate
pub fn get_multicast_interfaces() -> io::Result<Vec<Ipv4Addr>> {
    if let Ok(var) = std::env::var("TRDP_MULTICAST_IF") {
        if let Ok(addr) = var.parse::<Ipv4Addr>() {
            log::debug!("[MC] using TRDP_MULTICAST_IF override: {}", addr);
            return Ok(vec![addr]);
        }
    }

    get_multicast_interfaces_platform()
}

/// Linux: parse `ip -4 addr show` to discover interfaces.
/// Falls back to `local_ip_address` if the `ip` command is unavailable.
#[cfg(target_os = "linux")]
fn get_multicast_interfaces_platform() -> io::Result<Vec<Ipv4Addr>> {
    use std::process::Command;

    let output = match Command::new("ip").args(["-4", "addr", "show"]).output() {
        Ok(o) => o,
        Err(_) => {
            log::debug!("[MC] 'ip' command not found, using local_ip_address crate");
            return get_multicast_interfaces_crate();
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut interfaces = Vec::new();

    for line in stdout.lines() {
        if line.contains("127.0.0.1") || line.contains("host lo") {
            continue;
        }
        if let Some(inet_part) = line.trim().strip_prefix("inet ") {
            if let Some(addr_str) = inet_part.split('/').next() {
                if let Ok(addr) = addr_str.trim().parse::<Ipv4Addr>() {
                    interfaces.push(addr);
                }
            }
        }
    }

    Ok(interfaces)
}

/// Windows/other: use `local_ip_address` for interface discovery.
#[cfg(not(target_os = "linux"))]
fn get_multicast_interfaces_platform() -> io::Result<Vec<Ipv4Addr>> {
    get_multicast_interfaces_crate()
}

/// Portable interface discovery via `local_ip_address`.
fn get_multicast_interfaces_crate() -> io::Result<Vec<Ipv4Addr>> {
    use std::net::IpAddr;

    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifs) => ifs,
        Err(e) => {
            log::debug!("[MC] failed to list network interfaces: {}", e);
            return Ok(vec![]);
        }
    };

    let mut addrs = Vec::new();
    for (_name, ip) in interfaces {
        if let IpAddr::V4(ipv4) = ip {
            if !ipv4.is_loopback() {
                addrs.push(ipv4);
            }
        }
    }

    log::debug!("[MC] discovered {} non-loopback interfaces (portable)", addrs.len());
    Ok(addrs)
}

/// Get the primary interface IP (the one used for the default route).
///
/// Returns the IP to bind unicast sockets to, avoiding 0.0.0.0 binding
/// issues on multi-interface machines.
pub fn get_primary_interface_ip() -> io::Result<Ipv4Addr> {
    let interfaces = get_multicast_interfaces()?;

    if let Some(&ip) = interfaces.first() {
        log::debug!("[MC] using primary interface IP: {}", ip);
        return Ok(ip);
    }

    log::debug!("[MC] no suitable interface found, using UNSPECIFIED");
    Ok(Ipv4Addr::UNSPECIFIED)
}
