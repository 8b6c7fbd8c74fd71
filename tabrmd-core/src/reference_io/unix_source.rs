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

//! The reference connection factory: accepts raw device-wire-format
//! commands on a Unix domain socket. Plays the role spec.md treats as an
//! opaque, externally supplied collaborator — this module is the concrete
//! instance that makes the workspace runnable, not part of the broker's own
//! specified surface. Conceptually grounded in `tss2-tabd.c`'s
//! `CreateConnection` handler (accept a peer, mint a `session_t`, register
//! it), reimagined over a raw socket instead of D-Bus.

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use tabrmd_protocol::HEADER_SIZE;
use tracing::{debug, info, instrument, warn};

use crate::command::{Command, ResponseItem, WorkItem};
use crate::connection::Connection;
use crate::connection_manager::ConnectionManager;

/// Accept connections on `listener` forever, registering each with
/// `connections` and spawning a dedicated reader thread that parses framed
/// commands off the client's stream and enqueues them on `work_tx`. Returns
/// only if accepting itself fails outright.
#[instrument(skip_all)]
pub fn serve(
    listener: UnixListener,
    connections: Arc<ConnectionManager>,
    max_transient_per_connection: usize,
    transient_virtual_base: u32,
    work_tx: Sender<WorkItem>,
) -> io::Result<()> {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(error = ?e, "accept failed, continuing");
                continue;
            }
        };
        log_peer_credentials(&stream);

        let stream_id = stream.as_raw_fd() as u64;
        let recv = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = ?e, "failed to clone accepted stream, dropping connection");
                continue;
            }
        };

        let conn = Arc::new(Connection::new(
            stream_id,
            Box::new(recv),
            Box::new(stream),
            max_transient_per_connection,
            transient_virtual_base,
        ));

        if connections.insert(conn.clone()).is_err() {
            info!(stream_id, "refusing connection: max_connections reached");
            continue;
        }

        let work_tx = work_tx.clone();
        thread::spawn(move || read_loop(conn, work_tx));
    }
    Ok(())
}

/// Read framed commands off `conn`'s receive stream until EOF or an
/// unrecoverable error, enqueueing each as a `WorkItem::Command`. On exit,
/// enqueues `WorkItem::ConnectionClosed` so teardown (spec §4.9) runs on the
/// resource-manager thread, serialized with respect to in-flight commands
/// from the same connection.
fn read_loop(conn: Arc<Connection>, work_tx: Sender<WorkItem>) {
    loop {
        let buf = {
            let mut recv = conn.recv_lock();
            match read_command_frame(&mut *recv) {
                Ok(Some(buf)) => buf,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = ?e, connection = conn.id(), "read error, closing connection");
                    break;
                }
            }
        };
        if work_tx.send(WorkItem::Command(Command::new(buf, conn.clone()))).is_err() {
            break;
        }
    }
    let _ = work_tx.send(WorkItem::ConnectionClosed(conn));
}

/// Read exactly one framed command: the fixed header, then the remainder
/// implied by its declared size. `Ok(None)` means clean EOF before any
/// bytes of a new frame arrived.
fn read_command_frame(recv: &mut dyn Read) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; HEADER_SIZE];
    match recv.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let declared_size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
    if (declared_size as usize) < HEADER_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "declared size shorter than header"));
    }
    let mut buf = header.to_vec();
    buf.resize(declared_size as usize, 0);
    recv.read_exact(&mut buf[HEADER_SIZE..])?;
    Ok(Some(buf))
}

/// Drain `ResponseItem`s forever, writing each response back to its
/// originating connection. Runs on its own dedicated thread; returns once
/// the resource manager closes the channel or sends `Shutdown`.
#[instrument(skip_all)]
pub fn sink(responses: Receiver<ResponseItem>) {
    loop {
        match responses.recv() {
            Ok(ResponseItem::Response(resp)) => {
                let conn = resp.originating_connection.clone();
                let buf = resp.into_buf();
                let mut send = conn.send_lock();
                if let Err(e) = send.write_all(&buf) {
                    debug!(error = ?e, connection = conn.id(), "failed writing response, client likely gone");
                }
            }
            Ok(ResponseItem::Shutdown) | Err(_) => {
                info!("response sink shutting down");
                return;
            }
        }
    }
}

fn log_peer_credentials(stream: &UnixStream) {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
    match getsockopt(stream, PeerCredentials) {
        Ok(creds) => debug!(pid = creds.pid(), uid = creds.uid(), gid = creds.gid(), "accepted connection"),
        Err(e) => debug!(error = ?e, "could not read peer credentials"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_command_frame_returns_none_on_immediate_eof() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        assert!(read_command_frame(&mut empty).unwrap().is_none());
    }

    #[test]
    fn read_command_frame_reads_declared_length() {
        let mut buf = vec![0u8; HEADER_SIZE + 4];
        tabrmd_protocol::Header { tag: 0x8001, size: buf.len() as u32, code: 0x131 }.write_to(&mut buf);
        let mut cursor = Cursor::new(buf.clone());
        let read = read_command_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(read, buf);
    }

    #[test]
    fn read_command_frame_errors_on_truncated_body() {
        let mut buf = vec![0u8; HEADER_SIZE + 4];
        tabrmd_protocol::Header { tag: 0x8001, size: buf.len() as u32, code: 0x131 }.write_to(&mut buf);
        let mut cursor = Cursor::new(buf[..HEADER_SIZE + 2].to_vec());
        assert!(read_command_frame(&mut cursor).is_err());
    }
}
