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

//! Everything involved in standing the broker up as a long-running
//! process: wiring the device proxy, connection manager, session registry
//! and resource manager together (`server`), handling `SIGTERM`/`SIGINT`
//! for a clean shutdown (`signals`), and picking up a systemd-activated
//! listening socket when one is available (`systemd`).

pub mod server;
#[cfg(feature = "reference-io")]
mod signals;
#[cfg(feature = "reference-io")]
mod systemd;

#[cfg(feature = "reference-io")]
pub use server::run;
pub use server::Server;
