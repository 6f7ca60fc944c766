// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service Registry Manager client (C8): add/update/delete/list service
//! instances by constructing MD request payloads for the local controller.
//!
//! Actually sending these payloads is the session layer's job (via
//! [`crate::md::MdSessionTable::request`]/`notify`); this module only
//! builds and parses the wire bytes, the same split [`crate::dnr`] uses.

use crate::config::MAX_LABEL_LEN;
use crate::error::{TrdpError, TrdpResult};

/// One service-registry entry as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub service_id: u32,
    pub instance_id: u16,
    /// Interface/host label this instance is reachable on.
    pub uri: String,
    /// Whether the instance advertises itself to the train network.
    pub visible: bool,
}

const ENTRY_WIRE_SIZE: usize = 4 + 2 + 2 + MAX_LABEL_LEN;

fn encode_label(uri: &str) -> [u8; MAX_LABEL_LEN] {
    let mut out = [0u8; MAX_LABEL_LEN];
    let bytes = uri.as_bytes();
    let n = bytes.len().min(MAX_LABEL_LEN - 1);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn decode_label(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn encode_entry(entry: &ServiceEntry, out: &mut Vec<u8>) {
    out.extend_from_slice(&entry.service_id.to_be_bytes());
    out.extend_from_slice(&entry.instance_id.to_be_bytes());
    out.extend_from_slice(&(u16::from(entry.visible)).to_be_bytes());
    out.extend_from_slice(&encode_label(&entry.uri));
}

fn decode_entry(buf: &[u8]) -> TrdpResult<ServiceEntry> {
    if buf.len() < ENTRY_WIRE_SIZE {
        return Err(TrdpError::Size);
    }
    Ok(ServiceEntry {
        service_id: u32::from_be_bytes(buf[0..4].try_into().expect("4 bytes")),
        instance_id: u16::from_be_bytes(buf[4..6].try_into().expect("2 bytes")),
        visible: u16::from_be_bytes(buf[6..8].try_into().expect("2 bytes")) != 0,
        uri: decode_label(&buf[8..8 + MAX_LABEL_LEN]),
    })
}

/// Build the MD request payload for `srm_add`/`srm_update` (same wire
/// shape; the controller treats a matching `(service_id, instance_id)` as
/// an update).
#[must_use]
pub fn encode_add_or_update_request(entry: &ServiceEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENTRY_WIRE_SIZE);
    encode_entry(entry, &mut out);
    out
}

/// Build the MD request payload for `srm_delete`.
#[must_use]
pub fn encode_delete_request(service_id: u32, instance_id: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(6);
    out.extend_from_slice(&service_id.to_be_bytes());
    out.extend_from_slice(&instance_id.to_be_bytes());
    out
}

/// Build the (empty) MD request payload for `srm_list`.
#[must_use]
pub fn encode_list_request() -> Vec<u8> {
    Vec::new()
}

/// Parse an `srm_list` reply: a flat array of fixed-size entries.
pub fn decode_list_reply(buf: &[u8]) -> TrdpResult<Vec<ServiceEntry>> {
    if buf.len() % ENTRY_WIRE_SIZE != 0 {
        return Err(TrdpError::Size);
    }
    buf.chunks_exact(ENTRY_WIRE_SIZE).map(decode_entry).collect()
}
