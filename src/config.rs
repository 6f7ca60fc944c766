// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire constants and session configuration.
//!
//! This is the single source of truth for the fixed values IEC 61375-2-3
//! assigns to TRDP: UDP/TCP port numbers, size limits, and retry defaults.
//! Everything else (intervals, timeouts, QoS/TTL) is per-session and lives
//! in [`SessionConfig`], [`PdConfig`] and [`MdConfig`] below.

use std::time::Duration;

/// UDP port for Process Data.
pub const PD_UDP_PORT: u16 = 17224;
/// UDP port for Message Data.
pub const MD_UDP_PORT: u16 = 17225;
/// TCP port for Message Data.
pub const MD_TCP_PORT: u16 = 17225;

/// Maximum PD payload size (bytes), including padding.
pub const MAX_PD_DATA_SIZE: usize = 1432;
/// Maximum MD payload size (bytes).
pub const MAX_MD_DATA_SIZE: usize = 65_388;

/// Default number of MD retries.
pub const MAX_MD_RETRIES: u32 = 2;
/// Maximum length of a URI label (comId/device labels), including NUL.
pub const MAX_LABEL_LEN: usize = 16;
/// Maximum length of an MD header's source/destination URI-user field
/// (functional group plus host part), including NUL. Twice
/// [`MAX_LABEL_LEN`], per `TRDP_MAX_URI_USER_LEN`.
pub const MAX_URI_USER_LEN: usize = 2 * MAX_LABEL_LEN;
/// Maximum number of concurrent MD sessions.
pub const MD_MAX_NUM_SESSIONS: usize = 1000;

/// `replyTimeout` (and similarly `confirmTimeout`) of zero means "use the
/// session's configured default" at session-creation call sites, but means
/// "wait forever" once encoded on the wire and reflected back by a peer.
/// Call sites must track which of the two they mean; this crate never
/// collapses the distinction into a single sentinel (see design notes).
pub const TIMEOUT_USE_DEFAULT: u32 = 0;

/// Behavior when a subscription's receive deadline elapses without a
/// fresh packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdTimeoutBehavior {
    /// Keep serving the last received value, but report the timeout once.
    KeepLastValue,
    /// Clear the cached value to zero.
    ZeroOnTimeout,
    /// Make subsequent `get` calls fail with `TIMEOUT_ERR` until refreshed.
    Invalidate,
}

/// Quality-of-service / send parameters applied to a socket-pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendParams {
    /// IP ToS/DSCP value.
    pub qos: u8,
    /// IP time-to-live / hop limit.
    pub ttl: u8,
    /// Number of retries for best-effort retransmission (PD pull, MD unicast).
    pub retries: u32,
    /// VLAN id, or 0 for untagged. Stored and surfaced in stats only; see
    /// the VLAN/TSN scope note in the socket pool.
    pub vlan: u16,
}

impl Default for SendParams {
    fn default() -> Self {
        Self {
            qos: 0,
            ttl: 64,
            retries: MAX_MD_RETRIES,
            vlan: 0,
        }
    }
}

/// Per-session PD defaults, applied to a publisher/subscriber unless
/// overridden at creation.
#[derive(Debug, Clone, Copy)]
pub struct PdConfig {
    /// Flags controlling marshalling / callback behavior (opaque passthrough).
    pub flags: u32,
    /// Default subscriber timeout.
    pub timeout: Duration,
    /// Default subscriber timeout behavior.
    pub timeout_behavior: PdTimeoutBehavior,
    /// Default send parameters for publishers.
    pub send_params: SendParams,
}

impl Default for PdConfig {
    fn default() -> Self {
        Self {
            flags: 0,
            timeout: Duration::from_millis(1_200),
            timeout_behavior: PdTimeoutBehavior::KeepLastValue,
            send_params: SendParams::default(),
        }
    }
}

/// Per-session MD defaults.
#[derive(Debug, Clone, Copy)]
pub struct MdConfig {
    /// Default time to wait for a reply.
    pub reply_timeout: Duration,
    /// Default time to wait for a confirm after a reply-query.
    pub confirm_timeout: Duration,
    /// Default time to wait for an outbound TCP connect to complete.
    pub connect_timeout: Duration,
    /// Default time to wait for a blocked TCP send before killing the session.
    pub sending_timeout: Duration,
    /// Default retry budget for unicast UDP requests.
    pub retries: u32,
    /// Default QoS/TTL for MD sockets.
    pub send_params: SendParams,
    /// Maximum concurrent sessions (send + receive) before `MEM_ERR`.
    pub max_sessions: usize,
}

impl Default for MdConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(5),
            confirm_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            sending_timeout: Duration::from_secs(5),
            retries: MAX_MD_RETRIES,
            send_params: SendParams::default(),
            max_sessions: MD_MAX_NUM_SESSIONS,
        }
    }
}

/// Top-level session configuration (the would-be deserialization target of
/// an XML configuration front-end; the front-end itself is out of scope).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Scheduler cycle time; `get_interval` never returns more than this.
    pub cycle_time: Duration,
    /// This node's own hostname / URI label, used as the default source URI.
    pub host_name: String,
    /// The current redundancy leader's URI label, or empty if non-redundant.
    pub leader_name: String,
    /// Reject non-blocking would-block conditions instead of looping, when false.
    pub blocking_io: bool,
    /// Disable `SO_REUSEADDR` on created sockets.
    pub no_reuse_addr: bool,
    /// Disable multicast loopback on created sockets.
    pub no_multicast_loop: bool,
    /// Disable UDP checksum generation (link layer already guarantees integrity).
    pub no_udp_checksum: bool,
    /// PD defaults.
    pub pd: PdConfig,
    /// MD defaults.
    pub md: MdConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cycle_time: Duration::from_millis(10),
            host_name: String::new(),
            leader_name: String::new(),
            blocking_io: false,
            no_reuse_addr: false,
            no_multicast_loop: false,
            no_udp_checksum: false,
            pd: PdConfig::default(),
            md: MdConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Builder: set the scheduler cycle time.
    #[must_use]
    pub fn with_cycle_time(mut self, cycle_time: Duration) -> Self {
        self.cycle_time = cycle_time;
        self
    }

    /// Builder: set this node's host URI label.
    #[must_use]
    pub fn with_host_name(mut self, name: impl Into<String>) -> Self {
        self.host_name = name.into();
        self
    }

    /// Builder: override PD defaults.
    #[must_use]
    pub fn with_pd(mut self, pd: PdConfig) -> Self {
        self.pd = pd;
        self
    }

    /// Builder: override MD defaults.
    #[must_use]
    pub fn with_md(mut self, md: MdConfig) -> Self {
        self.md = md;
        self
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.cycle_time.is_zero() {
            return Err("cycle_time must be > 0");
        }
        if self.host_name.len() >= MAX_LABEL_LEN {
            return Err("host_name exceeds MAX_LABEL_LEN");
        }
        if self.md.max_sessions == 0 {
            return Err("md.max_sessions must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_cycle_time_rejected() {
        let cfg = SessionConfig::default().with_cycle_time(Duration::ZERO);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn oversized_host_name_rejected() {
        let cfg = SessionConfig::default().with_host_name("x".repeat(MAX_LABEL_LEN));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn builder_overrides_take_effect() {
        let cfg = SessionConfig::default().with_pd(PdConfig {
            timeout: Duration::from_millis(500),
            ..PdConfig::default()
        });
        assert_eq!(cfg.pd.timeout, Duration::from_millis(500));
    }
}
