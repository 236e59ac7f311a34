// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Server-wide shared state (§4.H, §5). One `ServerCore` is shared (behind
//! a `Mutex`) across every client connection; each client additionally
//! keeps its own private state (buffers, event queue, async table) that
//! needs no locking since only that client's thread touches it.

use crate::channel::ChannelRef;
use crate::monitor::EventKindRegistry;
use crate::resource_table::{ResourceId, ResourceTable};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Server-wide state shared by every client. Guarded by a single mutex,
/// matching the source's `caServerI` which is likewise one lock shared by
/// all `casStrmClient`/`casDGClient` instances for the operations that
/// touch cross-client state (channel registration, beacons); each client's
/// own buffers and queues are never touched from another client's thread
/// and so need no lock of their own (§5).
pub struct ServerCore {
    pub channels: ResourceTable<ChannelRef>,
    pub event_kinds: EventKindRegistry,
    max_channels: Option<usize>,
    debug_level: u32,
    events_posted: AtomicU64,
    events_processed: AtomicU64,
    force_anomaly: AtomicBool,
    next_client_id: AtomicU64,
}

impl ServerCore {
    pub fn new() -> Self {
        Self {
            channels: ResourceTable::new(),
            event_kinds: EventKindRegistry::new(),
            max_channels: None,
            debug_level: 0,
            events_posted: AtomicU64::new(0),
            events_processed: AtomicU64::new(0),
            force_anomaly: AtomicBool::new(false),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn with_max_channels(mut self, max: usize) -> Self {
        self.max_channels = Some(max);
        self
    }

    pub fn set_debug_level(&mut self, level: u32) {
        self.debug_level = level;
    }

    pub fn debug_level(&self) -> u32 {
        self.debug_level
    }

    pub fn allocate_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The three predefined event kinds are always registered (SPEC_FULL:
    /// predefined event masks as a fixed bootstrap), so these accessors
    /// never return `None`.
    pub fn value_mask(&self) -> crate::monitor::EventMask {
        self.event_kinds.lookup("value").expect("registered at construction")
    }

    pub fn log_mask(&self) -> crate::monitor::EventMask {
        self.event_kinds.lookup("log").expect("registered at construction")
    }

    pub fn alarm_mask(&self) -> crate::monitor::EventMask {
        self.event_kinds.lookup("alarm").expect("registered at construction")
    }

    /// Whether another channel can be admitted given the server's
    /// configured cap (SPEC_FULL: `max_channels`/`room_for_new_channel`).
    /// With no cap configured, always true.
    pub fn room_for_new_channel(&self) -> bool {
        match self.max_channels {
            Some(max) => self.channels.len() < max,
            None => true,
        }
    }

    /// Allocate a fresh, server-wide-unique `sid` for a newly claimed
    /// channel and register it (§4.E: IDs are unique within the server,
    /// not just within a client). Returns the allocated `sid`.
    pub fn register_channel(&mut self, client_id: u64) -> Option<ResourceId> {
        if !self.room_for_new_channel() {
            return None;
        }
        let sid = self.channels.install(ChannelRef { client_id, sid: ResourceId(0) });
        // Patch in the now-known sid (the table only learns the ID at
        // insertion time).
        if let Some(entry) = self.channels.lookup_mut(sid) {
            entry.sid = sid;
        }
        Some(sid)
    }

    pub fn unregister_channel(&mut self, sid: ResourceId) -> Option<ChannelRef> {
        self.channels.remove(sid)
    }

    pub fn note_event_posted(&self) {
        self.events_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_event_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_posted(&self) -> u64 {
        self.events_posted.load(Ordering::Relaxed)
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    /// Toggle the beacon anomaly governor: when set, the next beacon the
    /// server core authorizes should carry the "I just restarted or
    /// reconfigured" anomaly indication, prompting clients to re-search
    /// (SPEC_FULL: beacon anomaly governor).
    pub fn set_force_anomaly(&self, force: bool) {
        self.force_anomaly.store(force, Ordering::Relaxed);
    }

    /// Consume the anomaly flag: returns true at most once per
    /// `set_force_anomaly(true)` call, clearing it for subsequent beacons.
    pub fn generate_beacon_anomaly(&self) -> bool {
        self.force_anomaly.swap(false, Ordering::Relaxed)
    }

    pub fn describe(&self, level: u32) -> String {
        let base = format!(
            "server core: {} channels, {} posted / {} processed events",
            self.channels.len(),
            self.events_posted(),
            self.events_processed()
        );
        if level == 0 {
            return base;
        }
        format!(
            "{base}, max_channels={:?}, debug_level={}",
            self.max_channels, self.debug_level
        )
    }
}

impl Default for ServerCore {
    fn default() -> Self {
        Self::new()
    }
}

/// The shared handle every client thread holds, mirroring how the source's
/// `casStrmClient` keeps a pointer back to the owning `caServerI`.
pub type SharedServerCore = Arc<std::sync::Mutex<ServerCore>>;

pub fn new_shared_server_core() -> SharedServerCore {
    Arc::new(std::sync::Mutex::new(ServerCore::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_for_new_channel_respects_cap() {
        let mut core = ServerCore::new().with_max_channels(1);
        assert!(core.room_for_new_channel());
        core.register_channel(1).unwrap();
        assert!(!core.room_for_new_channel());
        assert!(core.register_channel(1).is_none());
    }

    #[test]
    fn register_channel_allocates_distinct_sids_across_clients() {
        let mut core = ServerCore::new();
        let sid_a = core.register_channel(1).unwrap();
        let sid_b = core.register_channel(2).unwrap();
        assert_ne!(sid_a, sid_b);
    }

    #[test]
    fn predefined_event_masks_are_registered_at_construction() {
        let core = ServerCore::new();
        assert!(core.event_kinds.lookup("value").is_some());
        assert!(core.event_kinds.lookup("log").is_some());
        assert!(core.event_kinds.lookup("alarm").is_some());
        assert_eq!(core.value_mask(), core.event_kinds.lookup("value").unwrap());
        assert_eq!(core.log_mask(), core.event_kinds.lookup("log").unwrap());
        assert_eq!(core.alarm_mask(), core.event_kinds.lookup("alarm").unwrap());
    }

    #[test]
    fn beacon_anomaly_fires_once() {
        let core = ServerCore::new();
        core.set_force_anomaly(true);
        assert!(core.generate_beacon_anomaly());
        assert!(!core.generate_beacon_anomaly());
    }

    #[test]
    fn event_counters_track_independently() {
        let core = ServerCore::new();
        core.note_event_posted();
        core.note_event_posted();
        core.note_event_processed();
        assert_eq!(core.events_posted(), 2);
        assert_eq!(core.events_processed(), 1);
    }
}
