// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Train Topology Database client (C9): `getOwnIds`/`getCstInfo` and the
//! train/operational/network directory blobs, served from a local cache
//! refreshed on PD100 `TTDB_STATUS` or an explicit MD request.
//!
//! Directory contents beyond the typed own-id/consist-info fields are opaque
//! payload (no marshalling engine is specified, per the non-goals); this
//! client caches them as raw bytes and leaves interpretation to the caller.

use crate::error::{TrdpError, TrdpResult};
use std::collections::HashMap;
use std::time::Instant;

/// This device's identity within its consist, per `getOwnIds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnIds {
    pub device_id: u32,
    pub vehicle_id: u32,
    pub consist_id: u32,
}

/// Per-consist metadata, per `getCstInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistInfo {
    pub consist_id: u32,
    pub vehicle_count: u16,
    pub label: String,
}

pub fn encode_own_ids(ids: &OwnIds) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&ids.device_id.to_be_bytes());
    out.extend_from_slice(&ids.vehicle_id.to_be_bytes());
    out.extend_from_slice(&ids.consist_id.to_be_bytes());
    out
}

pub fn decode_own_ids(buf: &[u8]) -> TrdpResult<OwnIds> {
    if buf.len() < 12 {
        return Err(TrdpError::Size);
    }
    Ok(OwnIds {
        device_id: u32::from_be_bytes(buf[0..4].try_into().expect("4 bytes")),
        vehicle_id: u32::from_be_bytes(buf[4..8].try_into().expect("4 bytes")),
        consist_id: u32::from_be_bytes(buf[8..12].try_into().expect("4 bytes")),
    })
}

pub fn decode_consist_info(buf: &[u8]) -> TrdpResult<ConsistInfo> {
    if buf.len() < 6 {
        return Err(TrdpError::Size);
    }
    let end = buf[6..].iter().position(|&b| b == 0).map_or(buf.len(), |p| 6 + p);
    Ok(ConsistInfo {
        consist_id: u32::from_be_bytes(buf[0..4].try_into().expect("4 bytes")),
        vehicle_count: u16::from_be_bytes(buf[4..6].try_into().expect("2 bytes")),
        label: String::from_utf8_lossy(&buf[6..end]).into_owned(),
    })
}

pub fn encode_consist_info_request(consist_id: u32) -> Vec<u8> {
    consist_id.to_be_bytes().to_vec()
}

/// Which directory blob a cache entry/refresh applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectoryKind {
    Train,
    OperationalTrain,
    Network,
}

/// The TTDB client's local cache (C9).
#[derive(Default)]
pub struct TtdbCache {
    own_ids: Option<OwnIds>,
    consist_info: HashMap<u32, ConsistInfo>,
    directories: HashMap<DirectoryKind, Vec<u8>>,
    last_refresh: Option<Instant>,
}

impl TtdbCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `get_own_ids`: returns [`TrdpError::NoData`] until the first refresh.
    pub fn get_own_ids(&self) -> TrdpResult<OwnIds> {
        self.own_ids.ok_or(TrdpError::NoData)
    }

    /// Refresh from a PD100 `TTDB_STATUS` payload or an explicit `getOwnIds` reply.
    pub fn refresh_own_ids(&mut self, payload: &[u8]) -> TrdpResult<()> {
        self.own_ids = Some(decode_own_ids(payload)?);
        self.last_refresh = Some(Instant::now());
        Ok(())
    }

    /// `get_consist_info(consistId)`.
    pub fn get_consist_info(&self, consist_id: u32) -> TrdpResult<&ConsistInfo> {
        self.consist_info.get(&consist_id).ok_or(TrdpError::NoData)
    }

    pub fn refresh_consist_info(&mut self, payload: &[u8]) -> TrdpResult<()> {
        let info = decode_consist_info(payload)?;
        self.consist_info.insert(info.consist_id, info);
        self.last_refresh = Some(Instant::now());
        Ok(())
    }

    /// `get_train_directory` / `get_op_train_directory` / `get_network_directory`.
    pub fn get_directory(&self, kind: DirectoryKind) -> TrdpResult<&[u8]> {
        self.directories.get(&kind).map(Vec::as_slice).ok_or(TrdpError::NoData)
    }

    pub fn refresh_directory(&mut self, kind: DirectoryKind, payload: &[u8]) {
        self.directories.insert(kind, payload.to_vec());
        self.last_refresh = Some(Instant::now());
    }

    #[must_use]
    pub fn last_refresh(&self) -> Option<Instant> {
        self.last_refresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_ids_round_trip() {
        let ids = OwnIds {
            device_id: 1,
            vehicle_id: 2,
            consist_id: 3,
        };
        let wire = encode_own_ids(&ids);
        assert_eq!(decode_own_ids(&wire).unwrap(), ids);
    }

    #[test]
    fn get_own_ids_before_refresh_is_no_data() {
        let cache = TtdbCache::new();
        assert!(matches!(cache.get_own_ids(), Err(TrdpError::NoData)));
    }

    #[test]
    fn refresh_then_get_own_ids_succeeds() {
        let mut cache = TtdbCache::new();
        let ids = OwnIds {
            device_id: 10,
            vehicle_id: 20,
            consist_id: 30,
        };
        cache.refresh_own_ids(&encode_own_ids(&ids)).unwrap();
        assert_eq!(cache.get_own_ids().unwrap(), ids);
        assert!(cache.last_refresh().is_some());
    }

    #[test]
    fn consist_info_decodes_label() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(b"trainA\0");
        let info = decode_consist_info(&buf).unwrap();
        assert_eq!(info.consist_id, 7);
        assert_eq!(info.vehicle_count, 4);
        assert_eq!(info.label, "trainA");
    }

    #[test]
    fn consist_info_cached_per_id() {
        let mut cache = TtdbCache::new();
        let mut buf = Vec::new();
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(b"trainA\0");
        cache.refresh_consist_info(&buf).unwrap();
        assert_eq!(cache.get_consist_info(7).unwrap().label, "trainA");
        assert!(matches!(cache.get_consist_info(8), Err(TrdpError::NoData)));
    }

    #[test]
    fn directory_blobs_are_cached_opaquely() {
        let mut cache = TtdbCache::new();
        cache.refresh_directory(DirectoryKind::Train, &[1, 2, 3]);
        assert_eq!(cache.get_directory(DirectoryKind::Train).unwrap(), &[1, 2, 3]);
        assert!(matches!(cache.get_directory(DirectoryKind::Network), Err(TrdpError::NoData)));
    }
}
