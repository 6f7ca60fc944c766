// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # trdp - Train Real-Time Data Protocol
//!
//! A pure Rust implementation of IEC 61375-2-3 (TRDP), the process-data and
//! message-data stack used on train consist networks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use trdp::config::SessionConfig;
//! use trdp::session::Session;
//! use std::net::Ipv4Addr;
//! use std::time::Duration;
//!
//! fn main() -> trdp::error::TrdpResult<()> {
//!     let mut session = Session::open(SessionConfig::default().with_host_name("vehDev01"))?;
//!
//!     let publisher = session.pd_publish(
//!         2001,
//!         Ipv4Addr::new(239, 1, 1, 1),
//!         Duration::from_millis(100),
//!         0,
//!         Default::default(),
//!         b"initial payload",
//!     )?;
//!
//!     loop {
//!         let interval = session.get_interval();
//!         session.process(Some(interval))?;
//!         # break;
//!     }
//!     # let _ = publisher;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                       Application Layer                             |
//! |        Session::pd_publish/pd_subscribe, md_request/md_reply        |
//! +---------------------------------------------------------------------+
//! |                     Session Scheduler (C6)                          |
//! |   get_interval/process, reactor-driven readiness, timeout sweeps    |
//! +---------------------------------------------------------------------+
//! |     PD queues (C3)     |  MD session table (C4) | sequence (C5)    |
//! |   publisher/subscriber |   13-state FSM, retries | per-comId sn    |
//! +---------------------------------------------------------------------+
//! |        Socket pool (C2)       |        codec (C1)                  |
//! |  multiplexed UDP/TCP slots    | PD/MD header encode+decode+CRC     |
//! +---------------------------------------------------------------------+
//! |              dnr | srm | ttdb (directory/service/topology clients) |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`session::Session`] | Entry point: owns every table, drives `process()` |
//! | [`config::SessionConfig`] | PD/MD timing and retry configuration |
//! | [`pd::publisher::Publisher`] / [`pd::subscriber::Subscriber`] | Cyclic process-data endpoints |
//! | [`md::MdSessionTable`] | Message-data request/reply/notify/confirm session FSM |
//! | [`error::TrdpError`] | Unified error type for the whole stack |
//!
//! ## Modules Overview
//!
//! - [`session`] - Scheduler that ties every other module together (start here)
//! - [`config`] - Session/PD/MD configuration and protocol constants
//! - [`codec`] - Wire-format header encode/decode/validate for PD and MD
//! - [`pd`] - Process data: publishers, subscribers, sequence tracking
//! - [`md`] - Message data: session table, listeners, state machine
//! - [`transport`] - UDP/TCP socket pool, multicast, TTL
//! - [`dnr`] - TCN-DNS client cache (URI-to-address resolution)
//! - [`srm`] - Service registry client (add/update/delete/list)
//! - [`ttdb`] - Train topology database client (own IDs, consist info, directory)
//! - [`logging`] - Compile-time configurable logging macros
//! - [`error`] - Shared error and result types
//!
//! ## See Also
//!
//! - [IEC 61375-2-3](https://www.iec.ch/) - Train Real-Time Data Protocol

// Clippy: No blanket suppressions. Fix issues properly or use inline #[allow] with justification.

/// Wire-format header codec for PD and MD telegrams (C1).
pub mod codec;
/// Session, PD, and MD configuration plus protocol constants.
pub mod config;
/// TCN-DNS client: URI-to-`Ipv4Addr` resolution cache (C7).
pub mod dnr;
/// Shared error and result types for the whole stack.
pub mod error;
/// Compile-time configurable logging system (zero-cost when disabled).
pub mod logging;
/// Message Data: session table, listeners, duplicate detection, retries (C4).
pub mod md;
/// Process Data: publishers, subscribers, sequence tracking (C3, C5).
pub mod pd;
/// The session scheduler: owns every table and drives `process()` (C6).
pub mod session;
/// Service registry client: add/update/delete/list service entries (C8).
pub mod srm;
/// Shared socket pool and UDP/TCP/multicast transport primitives (C2).
pub mod transport;
/// Train topology database client: own IDs, consist info, directory (C9).
pub mod ttdb;

pub use error::{TrdpError, TrdpResult};
pub use session::Session;

/// `trdp` crate version string.
pub const VERSION: &str = "0.1.0";
