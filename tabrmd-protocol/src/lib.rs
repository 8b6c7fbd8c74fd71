// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire-level types shared by anything that speaks the device command and
//! response format the broker virtualizes: the fixed header layout, handle
//! family tagging, and the broker's own error-code namespace. This crate
//! does no I/O and pulls in no logging; it exists so the broker core and
//! any client-side helper can agree on byte layout without sharing code
//! that depends on how either side moves bytes around.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder};

/// Size in bytes of the fixed command/response header: `tag:u16 | size:u32 | code:u32`.
pub const HEADER_SIZE: usize = 10;

/// Size in bytes of a single handle word in the handle area.
pub const HANDLE_SIZE: usize = 4;

/// The well-known handle for the password (empty) authorization session.
/// Not a distinct family range; carved out of `PERMANENT` by value.
pub const TPM_RS_PW: u32 = 0x4000_0009;

/// Parsed view of the ten-byte header common to every command and response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u16,
    pub size: u32,
    pub code: u32,
}

impl Header {
    /// Read the header out of `buf`. Fails if `buf` is shorter than
    /// [`HEADER_SIZE`] or if the declared `size` does not match `buf.len()`.
    pub fn parse(buf: &[u8]) -> Result<Header> {
        if buf.len() < HEADER_SIZE {
            return Err(anyhow!(
                "buffer of {} bytes is shorter than the {}-byte header",
                buf.len(),
                HEADER_SIZE
            ));
        }
        let tag = BigEndian::read_u16(&buf[0..2]);
        let size = BigEndian::read_u32(&buf[2..6]);
        let code = BigEndian::read_u32(&buf[6..10]);
        if size as usize != buf.len() {
            return Err(anyhow!(
                "declared size {} does not match buffer length {}",
                size,
                buf.len()
            ));
        }
        Ok(Header { tag, size, code })
    }

    /// Write `self` into the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// Panics if `buf` is shorter than the header; callers are expected to
    /// have already sized the buffer to hold at least the header.
    pub fn write_to(&self, buf: &mut [u8]) {
        BigEndian::write_u16(&mut buf[0..2], self.tag);
        BigEndian::write_u32(&mut buf[2..6], self.size);
        BigEndian::write_u32(&mut buf[6..10], self.code);
    }
}

/// Read the `i`th handle word following the header.
pub fn read_handle(buf: &[u8], i: usize) -> Option<u32> {
    let off = HEADER_SIZE + i * HANDLE_SIZE;
    if buf.len() < off + HANDLE_SIZE {
        return None;
    }
    Some(BigEndian::read_u32(&buf[off..off + HANDLE_SIZE]))
}

/// Overwrite the `i`th handle word following the header.
pub fn write_handle(buf: &mut [u8], i: usize, handle: u32) -> Result<()> {
    let off = HEADER_SIZE + i * HANDLE_SIZE;
    if buf.len() < off + HANDLE_SIZE {
        return Err(anyhow!("buffer too short to hold handle {}", i));
    }
    BigEndian::write_u32(&mut buf[off..off + HANDLE_SIZE], handle);
    Ok(())
}

/// The family a 32-bit handle belongs to, discriminated by its upper byte
/// (with one carve-out by value, not by byte, for the password session).
/// Only `Transient`, `HmacSession`, and `PolicySession` are virtualized by
/// the broker; the rest pass through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleFamily {
    Pcr,
    NvIndex,
    HmacSession,
    PolicySession,
    Permanent,
    PasswordSession,
    Transient,
    Persistent,
    /// A byte range this broker does not recognize. Carried through
    /// unvirtualized, same as `Permanent`.
    Unknown(u8),
}

impl HandleFamily {
    /// Classify `handle` by its upper byte, special-casing the one
    /// well-known permanent handle value that denotes the password session.
    pub fn of(handle: u32) -> HandleFamily {
        if handle == TPM_RS_PW {
            return HandleFamily::PasswordSession;
        }
        match (handle >> 24) as u8 {
            0x00 => HandleFamily::Pcr,
            0x01 => HandleFamily::NvIndex,
            0x02 => HandleFamily::HmacSession,
            0x03 => HandleFamily::PolicySession,
            0x40 => HandleFamily::Permanent,
            0x80 => HandleFamily::Transient,
            0x81 => HandleFamily::Persistent,
            other => HandleFamily::Unknown(other),
        }
    }

    /// Whether the broker maintains a virtual↔physical mapping for handles
    /// in this family. Permanent hierarchies, the password session, PCRs,
    /// NV indices, and persistent objects are addressed directly.
    pub fn is_virtualized(&self) -> bool {
        matches!(
            self,
            HandleFamily::Transient | HandleFamily::HmacSession | HandleFamily::PolicySession
        )
    }

    /// Whether this family denotes a session (as opposed to a transient
    /// object); sessions are virtualized but tracked in the connection's
    /// session list and the session-continuation registry rather than the
    /// per-connection transient `HandleMap`.
    pub fn is_session(&self) -> bool {
        matches!(self, HandleFamily::HmacSession | HandleFamily::PolicySession)
    }
}

/// The broker's own layer in the response-code namespace. Device response
/// codes are forwarded verbatim and never constructed through this type;
/// this only covers codes the broker itself originates.
///
/// Response codes on the wire are tagged by layer the way the underlying
/// device's response-code space already is: bits 16..24 carry a layer
/// number, with 0 reserved for the device's own (format-0/format-1) codes.
/// The broker claims layer `0x09` for its own synthesized codes and layer
/// `0x0a` for transport-level failures, leaving the device's layer (0)
/// untouched.
const BROKER_RC_LAYER: u32 = 0x09;
const TRANSPORT_RC_LAYER: u32 = 0x0a;
const RC_LAYER_SHIFT: u32 = 16;

/// Broker-layer error codes: malformed input, quota exhaustion, and
/// internal bookkeeping failures that are recoverable as a synthesized
/// response rather than fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerError {
    Malformed,
    ObjectMemory,
    SessionMemory,
    OutOfMemory,
    InternalError,
    NotPermitted,
    BadValue,
    NotImplemented,
    GeneralFailure,
}

impl BrokerError {
    fn code(&self) -> u32 {
        match self {
            BrokerError::GeneralFailure => 0x001,
            BrokerError::NotPermitted => 0x00b,
            BrokerError::BadValue => 0x00c,
            BrokerError::NotImplemented => 0x013,
            BrokerError::Malformed => 0x022,
            BrokerError::ObjectMemory => 0x025,
            BrokerError::SessionMemory => 0x026,
            BrokerError::OutOfMemory => 0x027,
            BrokerError::InternalError => 0x028,
        }
    }
}

/// Transport-namespace errors: the device connection itself, as opposed to
/// anything the device said back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    Io,
    Timeout,
    BadSequence,
    NotImplemented,
    Cancelled,
}

impl TransportError {
    fn code(&self) -> u32 {
        match self {
            TransportError::Io => 0x001,
            TransportError::Timeout => 0x002,
            TransportError::BadSequence => 0x003,
            TransportError::NotImplemented => 0x004,
            TransportError::Cancelled => 0x005,
        }
    }
}

/// A response code as it will appear on the wire: a device code passed
/// through verbatim, or one the broker itself originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Success,
    Device(u32),
    Transport(TransportError),
    Broker(BrokerError),
}

impl ResponseCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseCode::Success)
    }

    /// Encode as the 32-bit value that goes in the response header's `code`
    /// field.
    pub fn as_wire(&self) -> u32 {
        match self {
            ResponseCode::Success => 0,
            ResponseCode::Device(code) => *code,
            ResponseCode::Transport(e) => (TRANSPORT_RC_LAYER << RC_LAYER_SHIFT) | e.code(),
            ResponseCode::Broker(e) => (BROKER_RC_LAYER << RC_LAYER_SHIFT) | e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut buf = vec![0u8; HEADER_SIZE + 8];
        let h = Header { tag: 0x8001, size: buf.len() as u32, code: 0x0000_014c };
        h.write_to(&mut buf);
        let parsed = Header::parse(&buf).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn header_rejects_short_buffer() {
        let buf = vec![0u8; HEADER_SIZE - 1];
        assert!(Header::parse(&buf).is_err());
    }

    #[test]
    fn header_rejects_size_mismatch() {
        let mut buf = vec![0u8; HEADER_SIZE];
        Header { tag: 0, size: 9999, code: 0 }.write_to(&mut buf);
        assert!(Header::parse(&buf).is_err());
    }

    #[test]
    fn handle_family_classification() {
        assert_eq!(HandleFamily::of(0x8000_0001), HandleFamily::Transient);
        assert_eq!(HandleFamily::of(0x0200_0000), HandleFamily::HmacSession);
        assert_eq!(HandleFamily::of(0x0300_0000), HandleFamily::PolicySession);
        assert_eq!(HandleFamily::of(0x8100_0001), HandleFamily::Persistent);
        assert_eq!(HandleFamily::of(TPM_RS_PW), HandleFamily::PasswordSession);
        assert_eq!(HandleFamily::of(0x4000_000c), HandleFamily::Permanent);
    }

    #[test]
    fn only_transient_and_session_families_are_virtualized() {
        assert!(HandleFamily::Transient.is_virtualized());
        assert!(HandleFamily::HmacSession.is_virtualized());
        assert!(HandleFamily::PolicySession.is_virtualized());
        assert!(!HandleFamily::Permanent.is_virtualized());
        assert!(!HandleFamily::PasswordSession.is_virtualized());
        assert!(!HandleFamily::Pcr.is_virtualized());
    }

    #[test]
    fn handle_read_write_round_trip() {
        let mut buf = vec![0u8; HEADER_SIZE + 2 * HANDLE_SIZE];
        write_handle(&mut buf, 0, 0x8000_0001).unwrap();
        write_handle(&mut buf, 1, 0x0200_0005).unwrap();
        assert_eq!(read_handle(&buf, 0), Some(0x8000_0001));
        assert_eq!(read_handle(&buf, 1), Some(0x0200_0005));
        assert_eq!(read_handle(&buf, 2), None);
    }

    #[test]
    fn broker_and_transport_codes_live_in_disjoint_layers() {
        let broker = ResponseCode::Broker(BrokerError::Malformed).as_wire();
        let transport = ResponseCode::Transport(TransportError::Timeout).as_wire();
        assert_ne!(broker >> RC_LAYER_SHIFT, transport >> RC_LAYER_SHIFT);
        assert_eq!(ResponseCode::Success.as_wire(), 0);
    }
}
