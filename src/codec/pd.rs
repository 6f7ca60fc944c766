// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process Data packet header: encode, decode, validate.

use super::crc::{crc32, read_crc_le, write_crc_le};
use super::{MsgType, PROTOCOL_VERSION};
use crate::error::TrdpError;

/// Size of the fixed PD header, in bytes.
pub const PD_HEADER_SIZE: usize = 40;

/// Parsed PD header. Payload is handled separately by the caller since it
/// is opaque to the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdHeader {
    /// Per-(srcIp, msgType) monotonic counter, used for duplicate detection.
    pub sequence_counter: u32,
    /// Message type tag (`Pd`, `Pp`, `Pr`, or `Pe`).
    pub msg_type: MsgType,
    /// Application-chosen logical endpoint id.
    pub com_id: u32,
    /// Ethernet Train Backbone topology counter filter.
    pub etb_topo_cnt: u32,
    /// Operational train topology counter filter.
    pub op_trn_topo_cnt: u32,
    /// Declared payload length, before 4-byte padding.
    pub dataset_length: u32,
    /// comId the receiver should use if it replies (PD-Pull).
    pub reply_com_id: u32,
    /// IP the receiver should reply to (PD-Pull).
    pub reply_ip: u32,
}

/// Round `size` up to the next multiple of 4.
#[must_use]
pub const fn pad4(size: usize) -> usize {
    (size + 3) & !3
}

/// Encode `header` into `out[..PD_HEADER_SIZE]`, computing and writing the
/// trailing CRC. `out` must be at least `PD_HEADER_SIZE` bytes.
pub fn encode_pd_header(header: &PdHeader, out: &mut [u8]) -> Result<(), TrdpError> {
    if out.len() < PD_HEADER_SIZE {
        return Err(TrdpError::Size);
    }
    out[0..4].copy_from_slice(&header.sequence_counter.to_be_bytes());
    out[4..6].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    out[6..8].copy_from_slice(&(header.msg_type as u16).to_be_bytes());
    out[8..12].copy_from_slice(&header.com_id.to_be_bytes());
    out[12..16].copy_from_slice(&header.etb_topo_cnt.to_be_bytes());
    out[16..20].copy_from_slice(&header.op_trn_topo_cnt.to_be_bytes());
    out[20..24].copy_from_slice(&header.dataset_length.to_be_bytes());
    out[24..28].copy_from_slice(&0u32.to_be_bytes()); // reserved
    out[28..32].copy_from_slice(&header.reply_com_id.to_be_bytes());
    out[32..36].copy_from_slice(&header.reply_ip.to_be_bytes());
    let crc = crc32(&out[..36]);
    write_crc_le(&mut out[..PD_HEADER_SIZE], crc);
    Ok(())
}

/// Refresh the sequence counter and CRC of an already-encoded header in
/// place, without re-deriving the rest of the fields. Used by the
/// publisher path on every send.
pub fn update_pd_header(buf: &mut [u8], sequence_counter: u32) -> Result<(), TrdpError> {
    if buf.len() < PD_HEADER_SIZE {
        return Err(TrdpError::Size);
    }
    buf[0..4].copy_from_slice(&sequence_counter.to_be_bytes());
    let crc = crc32(&buf[..36]);
    write_crc_le(&mut buf[..PD_HEADER_SIZE], crc);
    Ok(())
}

/// Options controlling header validation strictness.
#[derive(Debug, Clone, Copy)]
pub struct ValidateOptions {
    /// Reject packets whose declared `datasetLength` exceeds the bytes
    /// actually available after the header.
    pub check_data_too: bool,
    /// Session's etbTopoCnt filter (0 = accept any).
    pub etb_topo_cnt: u32,
    /// Session's opTrnTopoCnt filter (0 = accept any).
    pub op_trn_topo_cnt: u32,
}

/// Decode and fully validate a PD header from `buf`.
///
/// Validation order: size, CRC, version, message type, declared-vs-available
/// size, topology filter.
pub fn decode_and_validate_pd_header(
    buf: &[u8],
    opts: &ValidateOptions,
) -> Result<PdHeader, TrdpError> {
    if buf.len() < PD_HEADER_SIZE {
        return Err(TrdpError::Size);
    }
    let stored_crc = read_crc_le(&buf[..PD_HEADER_SIZE]);
    if crc32(&buf[..36]) != stored_crc {
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
        MsgType::Pd | MsgType::Pp | MsgType::Pr | MsgType::Pe
    ) {
        return Err(TrdpError::Wire);
    }
    let dataset_length = u32::from_be_bytes(buf[20..24].try_into().expect("4 bytes"));
    if opts.check_data_too && buf.len() < PD_HEADER_SIZE + dataset_length as usize {
        return Err(TrdpError::Size);
    }
    let header = PdHeader {
        sequence_counter: u32::from_be_bytes(buf[0..4].try_into().expect("4 bytes")),
        msg_type,
        com_id: u32::from_be_bytes(buf[8..12].try_into().expect("4 bytes")),
        etb_topo_cnt: u32::from_be_bytes(buf[12..16].try_into().expect("4 bytes")),
        op_trn_topo_cnt: u32::from_be_bytes(buf[16..20].try_into().expect("4 bytes")),
        dataset_length,
        reply_com_id: u32::from_be_bytes(buf[28..32].try_into().expect("4 bytes")),
        reply_ip: u32::from_be_bytes(buf[32..36].try_into().expect("4 bytes")),
    };
    if opts.etb_topo_cnt != 0 && header.etb_topo_cnt != 0 && header.etb_topo_cnt != opts.etb_topo_cnt
    {
        return Err(TrdpError::Topo);
    }
    if opts.op_trn_topo_cnt != 0
        && header.op_trn_topo_cnt != 0
        && header.op_trn_topo_cnt != opts.op_trn_topo_cnt
    {
        return Err(TrdpError::Topo);
    }
    Ok(header)
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            check_data_too: true,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> PdHeader {
        PdHeader {
            sequence_counter: 1,
            msg_type: MsgType::Pd,
            com_id: 2001,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            dataset_length: 32,
            reply_com_id: 0,
            reply_ip: 0,
        }
    }

    #[test]
    fn round_trip() {
        let mut buf = vec![0u8; PD_HEADER_SIZE + 32];
        encode_pd_header(&sample_header(), &mut buf).unwrap();
        let decoded = decode_and_validate_pd_header(&buf, &ValidateOptions::default()).unwrap();
        assert_eq!(decoded, sample_header());
    }

    #[test]
    fn bit_flip_triggers_crc_error() {
        let mut buf = vec![0u8; PD_HEADER_SIZE + 32];
        encode_pd_header(&sample_header(), &mut buf).unwrap();
        buf[10] ^= 0x01;
        let err = decode_and_validate_pd_header(&buf, &ValidateOptions::default()).unwrap_err();
        assert!(matches!(err, TrdpError::Crc));
    }

    #[test]
    fn update_advances_sequence_counter_and_crc() {
        let mut buf = vec![0u8; PD_HEADER_SIZE + 32];
        encode_pd_header(&sample_header(), &mut buf).unwrap();
        update_pd_header(&mut buf, 2).unwrap();
        let decoded = decode_and_validate_pd_header(&buf, &ValidateOptions::default()).unwrap();
        assert_eq!(decoded.sequence_counter, 2);
    }

    #[test]
    fn topo_filter_rejects_mismatch() {
        let mut buf = vec![0u8; PD_HEADER_SIZE + 32];
        let mut h = sample_header();
        h.etb_topo_cnt = 5;
        encode_pd_header(&h, &mut buf).unwrap();
        let opts = ValidateOptions {
            etb_topo_cnt: 7,
            ..ValidateOptions::default()
        };
        assert!(matches!(
            decode_and_validate_pd_header(&buf, &opts).unwrap_err(),
            TrdpError::Topo
        ));
    }

    #[test]
    fn zero_topo_filter_accepts_anything() {
        let mut buf = vec![0u8; PD_HEADER_SIZE + 32];
        let mut h = sample_header();
        h.etb_topo_cnt = 5;
        encode_pd_header(&h, &mut buf).unwrap();
        assert!(decode_and_validate_pd_header(&buf, &ValidateOptions::default()).is_ok());
    }

    #[test]
    fn truncated_buffer_is_size_error() {
        let buf = vec![0u8; PD_HEADER_SIZE - 1];
        assert!(matches!(
            decode_and_validate_pd_header(&buf, &ValidateOptions::default()).unwrap_err(),
            TrdpError::Size
        ));
    }
}
