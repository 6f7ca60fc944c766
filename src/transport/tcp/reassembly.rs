// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection MD reassembly state machine (§4.4 "TCP specifics", §9
//! design note). The header (`MD_HEADER_SIZE` bytes) is read first, then the
//! declared payload; partial reads are preserved across calls by keeping the
//! in-progress buffer on the socket-pool slot rather than on the stack.

use crate::codec::md::{decode_and_validate_md_header, MD_HEADER_SIZE};
use std::io::{self, Read};

/// Reassembly state for one TCP MD connection.
pub struct ReadState {
    header: Vec<u8>,
    payload: Vec<u8>,
    want_payload: usize,
}

impl ReadState {
    /// A fresh state, expecting a header next.
    #[must_use]
    pub fn new() -> Self {
        Self {
            header: Vec::with_capacity(MD_HEADER_SIZE),
            payload: Vec::new(),
            want_payload: 0,
        }
    }

    fn reading_header(&self) -> bool {
        self.header.len() < MD_HEADER_SIZE
    }

    /// Read as many bytes as are currently available on `stream` (a
    /// non-blocking socket) and advance the state machine. Returns:
    ///
    /// - `Ok(Some(bytes))` once a full header+payload has been reassembled
    ///   (`bytes` is the complete wire frame, header included, ready for
    ///   [`decode_and_validate_md_header`]); the state resets for the next
    ///   message.
    /// - `Ok(None)` if the connection would block with a message still
    ///   in-flight; the partial bytes are retained for the next call.
    /// - `Err` on a genuine I/O error (not `WouldBlock`) or EOF.
    pub fn read_message(&mut self, stream: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
        let mut buf = [0u8; 4096];
        loop {
            if self.reading_header() {
                let need = MD_HEADER_SIZE - self.header.len();
                match stream.read(&mut buf[..need]) {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                    Ok(n) => {
                        self.header.extend_from_slice(&buf[..n]);
                        if self.reading_header() {
                            continue;
                        }
                        self.want_payload = declared_payload_len(&self.header);
                        self.payload = Vec::with_capacity(self.want_payload);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) => return Err(e),
                }
                continue;
            }

            let remaining = self.want_payload - self.payload.len();
            if remaining == 0 {
                let mut frame = std::mem::take(&mut self.header);
                frame.extend_from_slice(&self.payload);
                *self = Self::new();
                return Ok(Some(frame));
            }
            let chunk = remaining.min(buf.len());
            match stream.read(&mut buf[..chunk]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                Ok(n) => {
                    self.payload.extend_from_slice(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for ReadState {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull `datasetLength` out of a (possibly still-incomplete) header buffer.
/// Callers only invoke this once `header.len() == MD_HEADER_SIZE`, but decode
/// validation (CRC, version) is deliberately skipped here: a corrupt length
/// field is caught later when the full frame fails
/// [`decode_and_validate_md_header`], not while still counting bytes.
fn declared_payload_len(header: &[u8]) -> usize {
    if header.len() < 24 {
        return 0;
    }
    u32::from_be_bytes(header[20..24].try_into().expect("4 bytes")) as usize
}
