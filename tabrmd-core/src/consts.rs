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

use std::time;

/// Depth of the bounded channel between the command-source thread and the
/// resource-manager worker. A full queue is the back-pressure mechanism
/// that rate-limits clients; it is not meant to ever run deep.
pub const COMMAND_QUEUE_DEPTH: usize = 64;

/// Depth of the bounded channel between the resource-manager worker and the
/// response-sink thread.
pub const RESPONSE_QUEUE_DEPTH: usize = 64;

/// How long the device proxy's blocking `receive` will wait for a response
/// before giving up, absent a command-specific override.
pub const DEVICE_RECEIVE_TIMEOUT: time::Duration = time::Duration::from_secs(30);

pub const JOIN_POLL_DURATION: time::Duration = time::Duration::from_millis(100);

/// Starting virtual handle for the transient-object family, one above the
/// family's own tag byte so `0` is never handed out as a virtual handle.
pub const TRANSIENT_VIRTUAL_BASE: u32 = 0x8000_0000;

/// `TPM2_PT_CONTEXT_GAP_MAX`: the capability property the broker rewrites
/// on its way back to the client (see `resource_manager::rewrite_gap_max`).
pub const TPM2_PT_CONTEXT_GAP_MAX: u32 = 0x0000_0205;

/// `TPM2_CC_StartAuthSession`, `TPM2_CC_ContextSave`, `TPM2_CC_ContextLoad`,
/// `TPM2_CC_FlushContext`, `TPM2_CC_CreatePrimary`, `TPM2_CC_GetCapability`:
/// the handful of command codes the resource manager gives command-specific
/// post-processing to, per spec.
pub const TPM2_CC_CREATE_PRIMARY: u32 = 0x0000_0131;
pub const TPM2_CC_CONTEXT_SAVE: u32 = 0x0000_0162;
pub const TPM2_CC_CONTEXT_LOAD: u32 = 0x0000_0161;
pub const TPM2_CC_FLUSH_CONTEXT: u32 = 0x0000_0165;
pub const TPM2_CC_START_AUTH_SESSION: u32 = 0x0000_0176;
pub const TPM2_CC_GET_CAPABILITY: u32 = 0x0000_017a;

/// `TPM2_RC_INITIALIZE`: the device's "already started up" response,
/// coerced to success by the device proxy's `startup` call.
pub const TPM2_RC_INITIALIZE: u32 = 0x0000_0100;

/// `TPM2_CAP_HANDLES`: the capability category used by flush-range sweeps
/// to enumerate live handles in a family before flushing them.
pub const TPM2_CAP_HANDLES: u32 = 0x0000_0001;

/// `TPM2_PT_HR_TRANSIENT_AVAIL`: number of additional transient objects the
/// device can currently hold, queried once at startup to size the
/// resource manager's global eviction budget.
pub const TPM2_PT_HR_TRANSIENT_AVAIL: u32 = 0x0000_011e;

/// Conservative span swept by `flush_all_on_start`, since the device does
/// not expose a count of *resident* (as opposed to available) transient
/// handles to size an exact sweep.
pub const STARTUP_FLUSH_SPAN: u32 = 16;

/// Config defaults, applied whenever the corresponding key is absent from
/// the TOML config file.
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;
pub const DEFAULT_MAX_TRANSIENT_PER_CONNECTION: usize = 8;
pub const DEFAULT_MAX_ACTIVE_SESSIONS: usize = 64;
pub const DEFAULT_MAX_ABANDONED_SESSIONS: usize = 16;
