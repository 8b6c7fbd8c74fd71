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

//! Parsed views over raw command/response byte buffers, flowing between
//! the command source, the resource manager, and the response sink. A
//! `Command` owns its buffer and is mutated in place during
//! virtual→physical translation; a `Response` owns its (possibly
//! rewritten) buffer on the way back out.

use std::sync::Arc;

use tabrmd_protocol::{read_handle, write_handle, Header, ResponseCode};

use crate::connection::Connection;

pub struct Command {
    buf: Vec<u8>,
    pub originating_connection: Arc<Connection>,
}

impl Command {
    pub fn new(buf: Vec<u8>, originating_connection: Arc<Connection>) -> Command {
        Command { buf, originating_connection }
    }

    pub fn header(&self) -> anyhow::Result<Header> {
        Header::parse(&self.buf)
    }

    pub fn code(&self) -> anyhow::Result<u32> {
        Ok(self.header()?.code)
    }

    pub fn handle(&self, i: usize) -> Option<u32> {
        read_handle(&self.buf, i)
    }

    pub fn set_handle(&mut self, i: usize, handle: u32) -> anyhow::Result<()> {
        write_handle(&mut self.buf, i, handle)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn body(&self) -> &[u8] {
        &self.buf[tabrmd_protocol::HEADER_SIZE..]
    }

    pub fn into_buf(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Response {
    buf: Vec<u8>,
    pub originating_connection: Arc<Connection>,
}

impl Response {
    /// Build a response carrying `code` in the header's code field and no
    /// body, for synthesized error responses.
    pub fn synthesize(tag: u16, code: ResponseCode, originating_connection: Arc<Connection>) -> Response {
        let mut buf = vec![0u8; tabrmd_protocol::HEADER_SIZE];
        Header { tag, size: buf.len() as u32, code: code.as_wire() }.write_to(&mut buf);
        Response { buf, originating_connection }
    }

    /// Wrap a device response buffer as-is, tagged with the connection
    /// that issued the originating command.
    pub fn from_device_buf(buf: Vec<u8>, originating_connection: Arc<Connection>) -> Response {
        Response { buf, originating_connection }
    }

    pub fn header(&self) -> anyhow::Result<Header> {
        Header::parse(&self.buf)
    }

    pub fn is_error(&self) -> anyhow::Result<bool> {
        Ok(self.header()?.code != 0)
    }

    pub fn handle(&self, i: usize) -> Option<u32> {
        read_handle(&self.buf, i)
    }

    pub fn set_handle(&mut self, i: usize, handle: u32) -> anyhow::Result<()> {
        write_handle(&mut self.buf, i, handle)
    }

    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn into_buf(self) -> Vec<u8> {
        self.buf
    }
}

/// Items flowing through the command-source→resource-manager queue. The
/// shutdown sentinel lets the worker drain cooperatively instead of
/// relying on a separate cancellation channel (see spec's design note
/// against "dummy messages" used only to unblock a dequeue — this
/// sentinel carries real meaning, it is not one of those).
pub enum WorkItem {
    Command(Command),
    /// The command source observed EOF (or an unrecoverable read error) on
    /// a connection's receive stream. Routed through the same queue as
    /// ordinary commands so teardown (spec §4.9) is serialized with
    /// respect to command processing, as required.
    ConnectionClosed(Arc<Connection>),
    Shutdown,
}

/// Items flowing through the resource-manager→response-sink queue.
pub enum ResponseItem {
    Response(Response),
    Shutdown,
}
