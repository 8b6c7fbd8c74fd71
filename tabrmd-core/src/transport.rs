// Copyright 2023 Google LLC
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

//! The single framed byte-stream interface the device proxy consumes. The
//! broker does not define how an implementation is wired up or loaded;
//! `reference_io` under the `reference-io` feature supplies one over TCP
//! for a runnable workspace.

use std::time::Duration;

use tabrmd_protocol::HEADER_SIZE;

/// Sentinel passed to `receive` to block indefinitely.
pub const BLOCK_INDEFINITELY: Option<Duration> = None;

/// Transport-level failures, distinct from anything the device itself said
/// back in a response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRc {
    /// The transport is in the wrong state for the call that was made
    /// (e.g. `transmit` while already `Sent`, or `receive` while `Ready`).
    BadSequence,
    /// Nothing came back before the timeout elapsed.
    Timeout,
    /// The underlying connection failed outright.
    Io,
    /// The operation is not supported by this transport (e.g. `cancel` on
    /// a transport that can't interrupt an in-flight read).
    NotImplemented,
}

/// The transport's own state machine: `Ready -> Sent -> Ready`, with a
/// terminal `Final` once `finalize` has been called. Calling `transmit`
/// while `Sent` or `receive` while `Ready` is a `BadSequence` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Ready,
    Sent,
    Final,
}

/// Single framed byte-stream to the device. Implementations serialize
/// their own I/O; the device proxy additionally wraps every call in its
/// own mutex so at most one `transmit`/`receive` pair is outstanding at a
/// time regardless of how many threads hold a reference to the proxy.
pub trait Transport {
    /// Write the entire framed buffer. Short writes are retried
    /// internally; this returns only on success or a fatal error.
    fn transmit(&mut self, buf: &[u8]) -> Result<(), TransportRc>;

    /// Blocking read of one framed response. Implementations read exactly
    /// `HEADER_SIZE` bytes first to learn the declared length, then read
    /// the remainder; partial reads are retried until the declared length
    /// is satisfied, EOF, or `timeout` elapses. `None` means block
    /// indefinitely.
    fn receive(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, TransportRc>;

    /// Best-effort cancellation of an in-flight `receive`. Transports that
    /// can't support this return `NotImplemented`.
    fn cancel(&mut self) -> Result<(), TransportRc> {
        Err(TransportRc::NotImplemented)
    }

    /// Set the locality to tag subsequent commands with.
    fn set_locality(&mut self, locality: u8) -> Result<(), TransportRc>;
}

/// Validate the declared length in a just-received header against what a
/// transport implementation actually has buffered, the way every
/// `Transport::receive` implementation should before returning.
pub fn validate_received_len(declared_size: u32, buf_len: usize) -> Result<(), TransportRc> {
    if buf_len < HEADER_SIZE || declared_size as usize != buf_len {
        return Err(TransportRc::Io);
    }
    Ok(())
}
