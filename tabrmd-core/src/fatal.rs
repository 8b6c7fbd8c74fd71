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

//! Invariant violations in the broker's own bookkeeping are not
//! recoverable: there is no sane response to synthesize for "an entry is
//! present in the handle map with neither a physical handle nor a blob".
//! This mirrors the original implementation's use of `g_error()` for the
//! analogous "the device mutex could not be acquired" conditions, which
//! glib documents as always aborting the process.

use std::fmt::Display;

use tracing::error;

/// Log `msg` at `error` level, then abort the process. Never returns.
pub fn fatal(msg: impl Display) -> ! {
    error!("fatal invariant violation: {}", msg);
    std::process::abort()
}
