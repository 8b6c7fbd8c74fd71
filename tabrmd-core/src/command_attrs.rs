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

//! The command-attrs table: a one-time query of per-command metadata from
//! the device, queried at startup and treated as a read-only fact
//! thereafter. Grounded in `command-attrs.c`'s `CommandAttrs`, which packs
//! the handle count for a command into the TPMA_CC bitfield returned
//! alongside the command code.

use std::collections::HashMap;

/// `handle_count`: how many of the 32-bit words following the header are
/// handles to be translated. `modifies_session_state`: whether the
/// resource manager needs to give this command's response the
/// session-specific post-processing of spec §4.8 step 7 (`ContextSave`,
/// `ContextLoad`, `FlushContext`, `StartAuthSession`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandAttrEntry {
    pub handle_count: u8,
    pub modifies_session_state: bool,
}

/// Read-only lookup: command code → attrs. Populated once at startup from
/// `DeviceProxy::get_command_attrs` and never mutated again.
#[derive(Debug, Clone, Default)]
pub struct CommandAttrs {
    table: HashMap<u32, CommandAttrEntry>,
}

impl CommandAttrs {
    pub fn from_entries(entries: impl IntoIterator<Item = (u32, CommandAttrEntry)>) -> CommandAttrs {
        CommandAttrs { table: entries.into_iter().collect() }
    }

    /// Returns the attrs for `code`, or a zero record (no handles, no
    /// session-state side effects) for an unrecognized command code — per
    /// spec §4.3, an unknown command is processed as if it has zero
    /// handles rather than rejected outright.
    pub fn lookup(&self, code: u32) -> CommandAttrEntry {
        self.table.get(&code).copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts;

    #[test]
    fn unknown_command_has_zero_handles() {
        let attrs = CommandAttrs::default();
        let entry = attrs.lookup(0xdead_beef);
        assert_eq!(entry.handle_count, 0);
        assert!(!entry.modifies_session_state);
    }

    #[test]
    fn lookup_returns_populated_entry() {
        let attrs = CommandAttrs::from_entries([(
            consts::TPM2_CC_CREATE_PRIMARY,
            CommandAttrEntry { handle_count: 1, modifies_session_state: false },
        )]);
        assert_eq!(attrs.lookup(consts::TPM2_CC_CREATE_PRIMARY).handle_count, 1);
        assert_eq!(attrs.lookup(0).handle_count, 0);
    }
}
