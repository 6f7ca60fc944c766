// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message Data packet header: encode, decode, validate.

use super::crc::{crc32, read_crc_le, write_crc_le};
use super::{MsgType, PROTOCOL_VERSION};
use crate::config::MAX_URI_USER_LEN;
use crate::error::TrdpError;

/// Size of the fixed MD header, in bytes.
pub const MD_HEADER_SIZE: usize = 116;

/// 16-byte MD session identifier.
pub type SessionId = [u8; 16];

/// Parsed MD header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdHeader {
    /// Per-(srcIp, msgType) monotonic counter, used for retransmit detection.
    pub sequence_counter: u32,
    /// Message type tag (`Mn`, `Mr`, `Mp`, `Mq`, `Mc`, or `Me`).
    pub msg_type: MsgType,
    /// Application-chosen logical endpoint id.
    pub com_id: u32,
    /// Ethernet Train Backbone topology counter filter.
    pub etb_topo_cnt: u32,
    /// Operational train topology counter filter.
    pub op_trn_topo_cnt: u32,
    /// Declared payload length, before 4-byte padding.
    pub dataset_length: u32,
    /// Session this packet belongs to.
    pub session_id: SessionId,
    /// Reply timeout in microseconds (0 means the encoded "infinite").
    pub reply_timeout_us: u32,
    /// Reply status code. Negative on a protocol-level `Me` error; on a
    /// successful reply this field carries the application's own status
    /// word instead (there is no separate wire slot for it, see
    /// [`MdHeader::user_status`]).
    pub reply_status: i32,
    /// Source URI, NUL-padded to `MAX_URI_USER_LEN`.
    pub source_uri: [u8; MAX_URI_USER_LEN],
    /// Destination URI, NUL-padded to `MAX_URI_USER_LEN`.
    pub destination_uri: [u8; MAX_URI_USER_LEN],
}

fn uri(s: &str) -> [u8; MAX_URI_USER_LEN] {
    let mut out = [0u8; MAX_URI_USER_LEN];
    let bytes = s.as_bytes();
    let n = bytes.len().min(MAX_URI_USER_LEN - 1);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

impl MdHeader {
    /// Build a header with URIs supplied as plain strings.
    #[must_use]
    pub fn new(
        msg_type: MsgType,
        com_id: u32,
        session_id: SessionId,
        source_uri: &str,
        destination_uri: &str,
    ) -> Self {
        Self {
            sequence_counter: 0,
            msg_type,
            com_id,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            dataset_length: 0,
            session_id,
            reply_timeout_us: 0,
            reply_status: 0,
            source_uri: uri(source_uri),
            destination_uri: uri(destination_uri),
        }
    }

    /// Application status word piggybacked on `reply_status`: non-negative
    /// values are the caller's own status, negative values are a protocol
    /// error and carry no application status.
    #[must_use]
    pub fn user_status(&self) -> u16 {
        if self.reply_status >= 0 {
            self.reply_status as u16
        } else {
            0
        }
    }
}

/// Encode `header` into `out[..MD_HEADER_SIZE]`, computing and writing the
/// trailing CRC.
pub fn encode_md_header(header: &MdHeader, out: &mut [u8]) -> Result<(), TrdpError> {
    if out.len() < MD_HEADER_SIZE {
        return Err(TrdpError::Size);
    }
    out[0..4].copy_from_slice(&header.sequence_counter.to_be_bytes());
    out[4..6].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    out[6..8].copy_from_slice(&(header.msg_type as u16).to_be_bytes());
    out[8..12].copy_from_slice(&header.com_id.to_be_bytes());
    out[12..16].copy_from_slice(&header.etb_topo_cnt.to_be_bytes());
    out[16..20].copy_from_slice(&header.op_trn_topo_cnt.to_be_bytes());
    out[20..24].copy_from_slice(&header.dataset_length.to_be_bytes());
    out[24..40].copy_from_slice(&header.session_id);
    out[40..44].copy_from_slice(&header.reply_timeout_us.to_be_bytes());
    out[44..48].copy_from_slice(&header.reply_status.to_be_bytes());
    out[48..48 + MAX_URI_USER_LEN].copy_from_slice(&header.source_uri);
    out[48 + MAX_URI_USER_LEN..48 + 2 * MAX_URI_USER_LEN].copy_from_slice(&header.destination_uri);
    let crc = crc32(&out[..MD_HEADER_SIZE - 4]);
    write_crc_le(&mut out[..MD_HEADER_SIZE], crc);
    Ok(())
}

/// Options controlling MD header validation strictness.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOptions {
    /// Session's etbTopoCnt filter (0 = accept any).
    pub etb_topo_cnt: u32,
    /// Session's opTrnTopoCnt filter (0 = accept any).
    pub op_trn_topo_cnt: u32,
}

/// Decode and validate an MD header from `buf`.
pub fn decode_and_validate_md_header(
    buf: &[u8],
    opts: &ValidateOptions,
) -> Result<MdHeader, TrdpError> {
    if buf.len() < MD_HEADER_SIZE {
        return Err(TrdpError::Size);
    }
    let stored_crc = read_crc_le(&buf[..MD_HEADER_SIZE]);
    if crc32(&buf[..MD_HEADER_SIZE - 4]) != stored_crc {
        return Err(TrdpError::Crc);
    }
    let version = u16::from_be_bytes(buf[4..6].try_into().expect("2 bytes"));
    if version >> 8 != PROTOCOL_VERSION >> 8 {
        return Err(TrdpError::Wire);
    }
    let msg_type_raw = u16::from_be_bytes(buf[6..8].try_into().expect("2 bytes"));
    let msg_type = MsgType::from_u16(msg_type_raw).ok_or(TrdpError::Wire)?;
    if !matches!(
        msg_type,
        MsgType::Mn | MsgType::Mr | MsgType::Mp | MsgType::Mq | MsgType::Mc | MsgType::Me
    ) {
        return Err(TrdpError::Wire);
    }
    let etb_topo_cnt = u32::from_be_bytes(buf[12..16].try_into().expect("4 bytes"));
    let op_trn_topo_cnt = u32::from_be_bytes(buf[16..20].try_into().expect("4 bytes"));
    if opts.etb_topo_cnt != 0 && etb_topo_cnt != 0 && etb_topo_cnt != opts.etb_topo_cnt {
        return Err(TrdpError::Topo);
    }
    if opts.op_trn_topo_cnt != 0 && op_trn_topo_cnt != 0 && op_trn_topo_cnt != opts.op_trn_topo_cnt
    {
        return Err(TrdpError::Topo);
    }
    let mut session_id = [0u8; 16];
    session_id.copy_from_slice(&buf[24..40]);
    let mut source_uri = [0u8; MAX_URI_USER_LEN];
    source_uri.copy_from_slice(&buf[48..48 + MAX_URI_USER_LEN]);
    let mut destination_uri = [0u8; MAX_URI_USER_LEN];
    destination_uri
        .copy_from_slice(&buf[48 + MAX_URI_USER_LEN..48 + 2 * MAX_URI_USER_LEN]);
    Ok(MdHeader {
        sequence_counter: u32::from_be_bytes(buf[0..4].try_into().expect("4 bytes")),
        msg_type,
        com_id: u32::from_be_bytes(buf[8..12].try_into().expect("4 bytes")),
        etb_topo_cnt,
        op_trn_topo_cnt,
        dataset_length: u32::from_be_bytes(buf[20..24].try_into().expect("4 bytes")),
        session_id,
        reply_timeout_us: u32::from_be_bytes(buf[40..44].try_into().expect("4 bytes")),
        reply_status: i32::from_be_bytes(buf[44..48].try_into().expect("4 bytes")),
        source_uri,
        destination_uri,
    })
}
