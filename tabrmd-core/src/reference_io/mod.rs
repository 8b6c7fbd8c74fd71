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

//! Reference implementations of the two collaborators spec.md treats as
//! opaque: a `Transport` to an actual device (here, a TCP-connected
//! simulator) and a connection factory (here, a Unix domain socket
//! listener). Neither is part of the broker's specified surface; both exist
//! so `cargo build --features reference-io` produces a runnable daemon.

mod tcp_transport;
mod unix_source;

pub use tcp_transport::TcpTransport;
pub use unix_source::{serve, sink};
