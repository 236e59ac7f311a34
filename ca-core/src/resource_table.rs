// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Resource ID table (§4.E): maps a client- or server-assigned integer ID
//! to an arbitrary value, with wraparound-safe allocation so long-lived
//! servers never exhaust the ID space.

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u32);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A table of `ResourceId -> V`. IDs are allocated by an incrementing
/// cursor that wraps around `u32::MAX`, skipping any still in use --
/// mirrors the source's `resTable` allocation strategy closely enough that
/// a long-running server never runs out of IDs as long as fewer than
/// `u32::MAX` resources are alive at once.
pub struct ResourceTable<V> {
    entries: HashMap<ResourceId, V>,
    next: u32,
    debug_level: u32,
}

impl<V> ResourceTable<V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next: 1,
            debug_level: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocate a fresh ID and insert `value` under it.
    pub fn install(&mut self, value: V) -> ResourceId {
        loop {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);
            if candidate == 0 {
                continue;
            }
            let id = ResourceId(candidate);
            if !self.entries.contains_key(&id) {
                self.entries.insert(id, value);
                return id;
            }
        }
    }

    /// Insert `value` under a caller-chosen ID (used for client-specified
    /// channel SIDs). Fails if the ID is already in use.
    pub fn install_at(&mut self, id: ResourceId, value: V) -> Result<(), V> {
        if self.entries.contains_key(&id) {
            return Err(value);
        }
        self.entries.insert(id, value);
        Ok(())
    }

    pub fn lookup(&self, id: ResourceId) -> Option<&V> {
        self.entries.get(&id)
    }

    pub fn lookup_mut(&mut self, id: ResourceId) -> Option<&mut V> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: ResourceId) -> Option<V> {
        self.entries.remove(&id)
    }

    /// Iterate over every live entry. Used by callers that need to find
    /// entries matching some predicate on `V` rather than by ID (e.g. the
    /// async I/O table scanning for entries tied to a channel being torn
    /// down).
    pub fn iter(&self) -> impl Iterator<Item = (ResourceId, &V)> {
        self.entries.iter().map(|(id, v)| (*id, v))
    }

    /// Like `iter`, but yielding mutable references -- used to resync a
    /// derived per-entry field (e.g. a monitor's pending-event count) against
    /// some other source of truth without a remove/reinstall round trip.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ResourceId, &mut V)> {
        self.entries.iter_mut().map(|(id, v)| (*id, v))
    }

    pub fn set_debug_level(&mut self, level: u32) {
        self.debug_level = level;
    }

    /// Diagnostic dump, gated by debug level (SPEC_FULL ambient stack: debug
    /// level / describe methods).
    pub fn describe(&self, level: u32) -> String {
        if level == 0 || self.debug_level == 0 {
            return format!("resource table: {} entries", self.entries.len());
        }
        format!(
            "resource table: {} entries, next_id={}",
            self.entries.len(),
            self.next
        )
    }
}

impl<V> Default for ResourceTable<V> {
    fn default() -> Self {
        Self::new()
    }
}
