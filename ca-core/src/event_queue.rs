// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Per-client event queue and flow control (§4.C). Mirrors the source's
//! `casEventSys`: a FIFO of pending queue entries, a three-state flow
//! control machine (Flowing / Saturated / Purging), and coalescing of
//! repeated events for the same monitor ("replace mode") so a slow client
//! degrades to last-value-only delivery instead of unbounded queueing.

use crate::monitor::MonitorId;
use crate::resource_table::ResourceId;

/// Matches the source's `individualEventEntries`: the per-monitor quota of
/// distinct queued (non-coalesced) events before that monitor starts
/// replacing its own queued entry instead of appending.
pub const INDIVIDUAL_EVENT_ENTRIES: usize = 16;

/// Matches the source's `averageEventEntries`: the per-monitor average used
/// to size the aggregate queue capacity (`average_cap * installed monitors`).
pub const AVERAGE_EVENT_ENTRIES: usize = 4;

// The pending count this queue reports per monitor rides in an 8-bit field
// on the wire (§4.C); a cap that didn't fit would silently wrap.
const _: () = if INDIVIDUAL_EVENT_ENTRIES > 255 {
    panic!("individual_cap must fit in the 8-bit pending-count field");
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Flowing,
    Saturated,
    Purging,
}

/// A queued monitor event. The `payload` is opaque to the queue --
/// formatting happens via the closure passed to `process`, which has the
/// monitor metadata (type/count/cid) the queue itself doesn't own.
#[derive(Debug, Clone)]
pub struct QueuedEvent<P> {
    pub monitor: MonitorId,
    pub payload: P,
}

/// The non-monitor half of an event queue entry (§3 Data Model): bookkeeping
/// that rides the same FIFO as monitor events but carries no `DD` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Marks "everything queued before this point is the backlog Purging is
    /// draining"; reaching the head drives `Purging -> Flowing` (§4.C).
    PurgeBarrier,
    AccessRightsChanged(MonitorId),
    ChannelDisconnect(ResourceId),
}

/// One FIFO slot: either a monitor event or a control event (§3 Data Model).
#[derive(Debug, Clone)]
pub enum Entry<P> {
    Monitor(QueuedEvent<P>),
    Control(ControlEvent),
}

/// What `process`'s callback reports back after handling one queued event.
pub enum StepOutcome {
    /// The event was written to the client's out buffer; dequeue it.
    Delivered,
    /// No room to write it right now (out buffer backpressure); stop
    /// draining and leave it at the head of the queue.
    NoRoom,
}

pub struct EventQueue<P> {
    entries: Vec<Entry<P>>,
    state: FlowState,
    events_off: bool,
    /// Latched by `set_events_on` while `Purging` hasn't yet seen its
    /// barrier reach the head; consumed by `on_barrier_passed`.
    events_on_requested: bool,
    has_pending_barrier: bool,
    /// Live monitor count for this client, kept current by the owner
    /// (`StreamClient`) as monitors are installed/removed -- the aggregate
    /// capacity in `full()` scales with it per §4.C.
    monitor_count: usize,
    /// Monotonic counter of events actually handed to the client (SPEC_FULL
    /// ambient diagnostics: event-posted/-processed counters live on
    /// `ServerCore`, but the queue itself tracks its own contribution).
    posted: u64,
}

impl<P> EventQueue<P> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            state: FlowState::Flowing,
            events_off: false,
            events_on_requested: false,
            has_pending_barrier: false,
            monitor_count: 0,
            posted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn flow_state(&self) -> FlowState {
        self.state
    }

    pub fn events_off(&self) -> bool {
        self.events_off
    }

    /// Keep the aggregate-capacity scaling factor (§4.C: `average_cap *
    /// installed monitors`) current as monitors come and go.
    pub fn set_monitor_count(&mut self, n: usize) {
        self.monitor_count = n;
    }

    fn saturation_threshold(&self) -> usize {
        AVERAGE_EVENT_ENTRIES * self.monitor_count.max(1)
    }

    /// §4.C: aggregate usage has reached the installed-monitor-scaled
    /// capacity.
    pub fn full(&self) -> bool {
        self.entries.len() >= self.saturation_threshold()
    }

    /// §8 invariant support: how many monitor entries are currently queued
    /// for `monitor`, used by the owner to keep `Monitor::pending_count` in
    /// sync.
    pub fn pending_count_for(&self, monitor: MonitorId) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, Entry::Monitor(qe) if qe.monitor == monitor))
            .count()
    }

    /// `OutBuf::flush` could not send everything queued for the transport:
    /// the named trigger for `Flowing -> Saturated` (§4.C). Enables
    /// replace-mode by way of `post`'s own state check.
    pub fn note_transport_backpressure(&mut self) {
        if self.state == FlowState::Flowing {
            self.state = FlowState::Saturated;
        }
    }

    /// EVENTS_OFF: stop delivering monitor events, but keep accepting and
    /// coalescing new ones. If the client was `Saturated`, this also enqueues
    /// the purge barrier and transitions to `Purging` (§4.C); a plain pause
    /// from `Flowing` only sets the gate, since there is no backlog to drain.
    pub fn set_events_off(&mut self) {
        self.events_off = true;
        if self.state == FlowState::Saturated && !self.has_pending_barrier {
            self.entries.push(Entry::Control(ControlEvent::PurgeBarrier));
            self.has_pending_barrier = true;
            self.state = FlowState::Purging;
            self.events_on_requested = false;
        }
    }

    /// EVENTS_ON: resume delivery. While `Purging`, the `FlowState` itself
    /// only flips back to `Flowing` once the purge barrier actually reaches
    /// the head of the queue (§4.C) -- this just lifts the delivery gate so
    /// `process()` can drain down to it and latches that events-on was
    /// requested for `on_barrier_passed` to observe when it gets there.
    pub fn set_events_on(&mut self) {
        self.events_off = false;
        self.events_on_requested = true;
    }

    fn on_barrier_passed(&mut self) {
        self.has_pending_barrier = false;
        if self.state == FlowState::Purging && self.events_on_requested {
            self.state = FlowState::Flowing;
            self.events_off = false;
            self.events_on_requested = false;
        }
    }

    /// Post a new monitor event. Returns `true` if a new entry was appended,
    /// `false` if an existing queued entry for this monitor was coalesced
    /// (replaced) instead -- the owner uses this to keep `pending_count`
    /// synced without a second counter inside the queue.
    ///
    /// Replace-mode (§4.C) is active while flow-controlled (`Saturated` or
    /// `Purging`), while `events-off`, or once this monitor has already hit
    /// `individual_cap` pending entries regardless of flow state -- the
    /// per-monitor bound holds unconditionally, not only once backpressure
    /// is observed. Coalescing always replaces the *tail* entry for the
    /// monitor (the most recently queued one), matching "newer value wins".
    pub fn post(&mut self, monitor: MonitorId, payload: P) -> bool {
        let pending = self.pending_count_for(monitor);
        let replace_mode = self.events_off
            || matches!(self.state, FlowState::Saturated | FlowState::Purging)
            || pending >= INDIVIDUAL_EVENT_ENTRIES;

        if replace_mode {
            let existing = self.entries.iter_mut().rev().find_map(|e| match e {
                Entry::Monitor(qe) if qe.monitor == monitor => Some(qe),
                _ => None,
            });
            if let Some(existing) = existing {
                existing.payload = payload;
                return false;
            }
        }

        self.entries.push(Entry::Monitor(QueuedEvent { monitor, payload }));
        true
    }

    /// Drain queued events through `step`, stopping at the first `NoRoom` or
    /// once the queue empties out. Control events are handled internally
    /// (the purge barrier drives `Purging -> Flowing`; other control kinds
    /// are consumed without formatting a response, since no wire opcode is
    /// modeled for them here) and never reach `step`. Returns the number of
    /// monitor events delivered.
    pub fn process<F>(&mut self, mut step: F) -> usize
    where
        F: FnMut(&QueuedEvent<P>) -> StepOutcome,
    {
        let mut delivered = 0;
        loop {
            match self.entries.first() {
                None => break,
                Some(Entry::Control(ControlEvent::PurgeBarrier)) => {
                    self.entries.remove(0);
                    self.on_barrier_passed();
                }
                Some(Entry::Control(_)) => {
                    self.entries.remove(0);
                }
                Some(Entry::Monitor(_)) => {
                    if self.events_off {
                        break;
                    }
                    let outcome = match &self.entries[0] {
                        Entry::Monitor(qe) => step(qe),
                        Entry::Control(_) => unreachable!("checked above"),
                    };
                    match outcome {
                        StepOutcome::Delivered => {
                            self.entries.remove(0);
                            delivered += 1;
                            self.posted += 1;
                        }
                        StepOutcome::NoRoom => break,
                    }
                }
            }
        }
        delivered
    }

    pub fn posted_count(&self) -> u64 {
        self.posted
    }

    /// Drop every queued event for a monitor being cancelled (EVENT_CANCEL).
    pub fn purge_monitor(&mut self, monitor: MonitorId) {
        self.entries
            .retain(|e| !matches!(e, Entry::Monitor(qe) if qe.monitor == monitor));
    }

    /// Append a raw entry at the tail.
    pub fn push(&mut self, entry: Entry<P>) {
        self.entries.push(entry);
    }

    /// Insert a raw entry at the head, ahead of everything already queued.
    pub fn push_front(&mut self, entry: Entry<P>) {
        self.entries.insert(0, entry);
    }

    /// Insert `entry` immediately after the entry currently at `after`
    /// (clamped to the queue's current length).
    pub fn insert_after(&mut self, after: usize, entry: Entry<P>) {
        let pos = (after + 1).min(self.entries.len());
        self.entries.insert(pos, entry);
    }

    /// Remove and return the entry at `index`, if any.
    pub fn remove(&mut self, index: usize) -> Option<Entry<P>> {
        if index < self.entries.len() {
            Some(self.entries.remove(index))
        } else {
            None
        }
    }

    /// Test-suite hook (§4.C): true if two distinct entries reference the
    /// same monitor -- a coalescing-law violation if seen outside a purge
    /// barrier scan.
    pub fn has_duplicate_events(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        for e in &self.entries {
            if let Entry::Monitor(qe) = e {
                if !seen.insert(qe.monitor) {
                    return true;
                }
            }
        }
        false
    }

    pub fn describe(&self, level: u32) -> String {
        if level == 0 {
            return format!("event queue: {} pending", self.entries.len());
        }
        format!(
            "event queue: {} pending, state={:?}, events_off={}, posted={}",
            self.entries.len(),
            self.state,
            self.events_off,
            self.posted
        )
    }
}

impl<P> Default for EventQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_table::ResourceId;

    fn always_delivered(_e: &QueuedEvent<u32>) -> StepOutcome {
        StepOutcome::Delivered
    }

    #[test]
    fn events_off_coalesces_repeated_posts_to_one_entry() {
        let mut q: EventQueue<u32> = EventQueue::new();
        q.set_events_off();
        let mon = ResourceId(1);
        for v in 0..10u32 {
            q.post(mon, v);
        }
        assert_eq!(q.len(), 1);
        assert_eq!(q.pending_count_for(mon), 1);
    }

    #[test]
    fn events_off_blocks_delivery_until_turned_on() {
        let mut q: EventQueue<u32> = EventQueue::new();
        q.set_events_off();
        q.post(ResourceId(1), 1);
        assert_eq!(q.process(always_delivered), 0);
        q.set_events_on();
        assert_eq!(q.process(always_delivered), 1);
    }

    #[test]
    fn process_stops_at_no_room_and_preserves_order() {
        let mut q: EventQueue<u32> = EventQueue::new();
        q.post(ResourceId(1), 1);
        q.post(ResourceId(2), 2);

        let mut calls = 0;
        let delivered = q.process(|_e| {
            calls += 1;
            StepOutcome::NoRoom
        });
        assert_eq!(delivered, 0);
        assert_eq!(calls, 1);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn purge_monitor_drops_only_its_entries() {
        let mut q: EventQueue<u32> = EventQueue::new();
        q.post(ResourceId(1), 1);
        q.post(ResourceId(2), 2);
        q.purge_monitor(ResourceId(1));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pending_count_for(ResourceId(2)), 1);
    }

    #[test]
    fn full_scales_with_installed_monitor_count() {
        // §4.C: aggregate capacity = average_cap (4) * installed monitors,
        // not a fixed constant -- a 1-monitor client saturates far sooner
        // than a 100-monitor one.
        let mut q: EventQueue<u32> = EventQueue::new();
        q.set_monitor_count(1);
        for i in 0..(AVERAGE_EVENT_ENTRIES - 1) {
            q.post(ResourceId(100 + i as u32), i as u32);
        }
        assert!(!q.full());
        q.post(ResourceId(999), 999);
        assert!(q.full());

        let mut wide: EventQueue<u32> = EventQueue::new();
        wide.set_monitor_count(100);
        for i in 0..AVERAGE_EVENT_ENTRIES {
            wide.post(ResourceId(200 + i as u32), i as u32);
        }
        assert!(!wide.full(), "a 100-monitor client must not saturate at the 1-monitor threshold");
    }

    #[test]
    fn coalescing_replaces_the_tail_entry_not_the_first() {
        // Boundary scenario 3, hand-traced: once flow-controlled, repeated
        // posts to one monitor must keep overwriting its single queued
        // entry, not leave the first append stale while the rest pile up
        // untouched.
        let mut q: EventQueue<u32> = EventQueue::new();
        let mon = ResourceId(1);
        q.set_monitor_count(1);
        q.note_transport_backpressure();
        assert_eq!(q.flow_state(), FlowState::Saturated);

        for v in 0..1000u32 {
            q.post(mon, v);
        }
        assert_eq!(q.pending_count_for(mon), 1, "coalescing must collapse to one entry per monitor");
        let mut seen = None;
        q.process(|e| {
            seen = Some(e.payload);
            StepOutcome::Delivered
        });
        assert_eq!(seen, Some(999), "delivered value must be the most recently posted one");
    }

    #[test]
    fn individual_cap_holds_even_while_flowing() {
        // The per-monitor bound (individual_cap = 16) applies unconditionally,
        // not only once the client is flow-controlled.
        let mut q: EventQueue<u32> = EventQueue::new();
        let mon = ResourceId(1);
        for v in 0..1000u32 {
            q.post(mon, v);
        }
        assert!(q.pending_count_for(mon) <= INDIVIDUAL_EVENT_ENTRIES);
    }

    #[test]
    fn flowing_to_saturated_requires_transport_backpressure_not_raw_length() {
        let mut q: EventQueue<u32> = EventQueue::new();
        q.set_monitor_count(1);
        for i in 0..64u32 {
            q.post(ResourceId(1000 + i), i);
        }
        assert_eq!(q.flow_state(), FlowState::Flowing, "a healthy transport must not enter Saturated on queue length alone");

        q.note_transport_backpressure();
        assert_eq!(q.flow_state(), FlowState::Saturated);
    }

    #[test]
    fn saturated_to_purging_needs_an_explicit_events_off() {
        let mut q: EventQueue<u32> = EventQueue::new();
        q.note_transport_backpressure();
        assert_eq!(q.flow_state(), FlowState::Saturated);

        q.set_events_off();
        assert_eq!(q.flow_state(), FlowState::Purging);
        assert!(matches!(q.entries.last(), Some(Entry::Control(ControlEvent::PurgeBarrier))));
    }

    #[test]
    fn purging_to_flowing_needs_barrier_at_head_and_events_on() {
        let mut q: EventQueue<u32> = EventQueue::new();
        q.note_transport_backpressure();
        q.post(ResourceId(1), 1);
        q.set_events_off();
        assert_eq!(q.flow_state(), FlowState::Purging);

        // The backlogged monitor entry sits ahead of the barrier, and
        // events-off still gates it: nothing drains yet.
        let delivered = q.process(always_delivered);
        assert_eq!(delivered, 0, "events-off still gates monitor delivery");
        assert_eq!(q.flow_state(), FlowState::Purging);
        assert_eq!(q.len(), 2, "the backlog entry and the barrier are both still queued");

        // events-on lifts the gate; the backlog drains and the barrier is
        // reached in the same pass, only then flipping the state.
        q.set_events_on();
        let delivered = q.process(always_delivered);
        assert_eq!(delivered, 1);
        assert_eq!(q.flow_state(), FlowState::Flowing);
        assert!(q.is_empty());
    }

    #[test]
    fn purging_to_flowing_when_events_on_arrives_before_the_barrier_is_reached() {
        let mut q: EventQueue<u32> = EventQueue::new();
        q.note_transport_backpressure();
        q.set_events_off();
        assert_eq!(q.flow_state(), FlowState::Purging);

        q.set_events_on();
        assert_eq!(q.flow_state(), FlowState::Purging, "still waiting on the barrier");

        q.process(always_delivered);
        assert_eq!(q.flow_state(), FlowState::Flowing);
    }

    #[test]
    fn push_front_and_insert_after_position_entries_explicitly() {
        let mut q: EventQueue<u32> = EventQueue::new();
        q.push(Entry::Monitor(QueuedEvent { monitor: ResourceId(1), payload: 1 }));
        q.push_front(Entry::Monitor(QueuedEvent { monitor: ResourceId(2), payload: 2 }));
        q.insert_after(0, Entry::Monitor(QueuedEvent { monitor: ResourceId(3), payload: 3 }));

        let monitors: Vec<MonitorId> = q
            .entries
            .iter()
            .map(|e| match e {
                Entry::Monitor(qe) => qe.monitor,
                Entry::Control(_) => panic!("unexpected control entry"),
            })
            .collect();
        assert_eq!(monitors, vec![ResourceId(2), ResourceId(3), ResourceId(1)]);
    }

    #[test]
    fn remove_takes_the_entry_at_the_given_index() {
        let mut q: EventQueue<u32> = EventQueue::new();
        q.push(Entry::Monitor(QueuedEvent { monitor: ResourceId(1), payload: 1 }));
        q.push(Entry::Monitor(QueuedEvent { monitor: ResourceId(2), payload: 2 }));
        let removed = q.remove(0);
        assert!(matches!(removed, Some(Entry::Monitor(qe)) if qe.monitor == ResourceId(1)));
        assert_eq!(q.len(), 1);
        assert!(q.remove(5).is_none());
    }

    #[test]
    fn has_duplicate_events_detects_two_entries_for_one_monitor() {
        let mut q: EventQueue<u32> = EventQueue::new();
        q.push(Entry::Monitor(QueuedEvent { monitor: ResourceId(1), payload: 1 }));
        assert!(!q.has_duplicate_events());
        q.push(Entry::Monitor(QueuedEvent { monitor: ResourceId(1), payload: 2 }));
        assert!(q.has_duplicate_events());
    }
}
