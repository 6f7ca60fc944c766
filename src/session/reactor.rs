// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The scheduler's event loop (§4.6 "(ADDED) Reactor implementation"): an
//! `mio::Poll` instance that tracks the socket-pool's slots by raw file
//! descriptor, so `process()` only ever touches sockets that actually have
//! something to do instead of scanning every slot on every call.
//!
//! Slots are registered via [`mio::unix::SourceFd`] rather than by moving
//! them into `mio::net::*` wrappers: the pool already owns and configures
//! `std::net`/`socket2` sockets (TTL, multicast membership, non-blocking
//! mode), and `SourceFd` lets the reactor observe readiness without taking
//! that ownership away from [`crate::transport::socket_pool::SocketPool`].

use crate::transport::socket_pool::{SocketDirection, SocketHandle, SocketPool};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

const MAX_EVENTS: usize = 256;

/// Readiness reported for one slot by [`Reactor::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub slot: usize,
    pub readable: bool,
    pub writable: bool,
}

/// Tracks which socket-pool slots are currently registered with the
/// underlying `mio::Poll`, re-syncing the registration set to the pool's
/// actual contents before every wait.
pub struct Reactor {
    poll: Poll,
    events: Events,
    registered: HashMap<usize, (RawFd, Interest)>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(MAX_EVENTS),
            registered: HashMap::new(),
        })
    }

    fn desired_interest(pool: &SocketPool, idx: usize) -> Interest {
        let slot = pool.get(idx).expect("caller holds a valid index");
        let mut interest = Interest::READABLE;
        if let SocketHandle::TcpStream(_) = &slot.handle {
            if slot.sock_type == SocketDirection::MdTcp
                && slot.tcp.as_ref().is_some_and(|t| t.connect_deadline.is_some())
            {
                interest |= Interest::WRITABLE;
            }
        }
        interest
    }

    /// Bring the reactor's registration table in line with `pool`: register
    /// new slots, re-register ones whose desired interest changed (a TCP
    /// sender completing its connect no longer needs `WRITABLE`), and
    /// deregister slots the pool no longer holds.
    pub fn sync(&mut self, pool: &SocketPool) {
        let live: HashMap<usize, RawFd> = pool.iter().map(|(idx, slot)| (idx, slot.as_raw_fd())).collect();

        let stale: Vec<usize> = self
            .registered
            .keys()
            .copied()
            .filter(|idx| live.get(idx) != self.registered.get(idx).map(|(fd, _)| fd))
            .collect();
        for idx in stale {
            if let Some((fd, _)) = self.registered.remove(&idx) {
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            }
        }

        for (idx, fd) in &live {
            let desired = Self::desired_interest(pool, *idx);
            match self.registered.get(idx) {
                Some((_, current)) if *current == desired => continue,
                Some(_) => {
                    let _ = self.poll.registry().reregister(&mut SourceFd(fd), Token(*idx), desired);
                }
                None => {
                    let _ = self.poll.registry().register(&mut SourceFd(fd), Token(*idx), desired);
                }
            }
            self.registered.insert(*idx, (*fd, desired));
        }
    }

    /// Wait up to `timeout` for readiness on any registered slot, returning
    /// one [`Readiness`] entry per slot token that fired.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        self.poll.poll(&mut self.events, timeout)?;
        Ok(self
            .events
            .iter()
            .map(|e| Readiness {
                slot: e.token().0,
                readable: e.is_readable(),
                writable: e.is_writable(),
            })
            .collect())
    }
}
