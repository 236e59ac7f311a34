// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The seam between this engine and whatever owns the actual process
//! variables (§1: PV storage and the control-system integration are
//! explicitly out of scope). An `Adapter` answers channel existence,
//! access, reads, writes, and monitor subscriptions; it may finish a
//! request synchronously or hand back a `CompletionToken` and deliver the
//! result later via a `ClientMailbox`.

use crate::dd::DdHandle;
use crate::resource_table::ResourceId;
use ca_protocol::{CaStatus, DbrType};
use std::sync::mpsc::Sender;

/// Identifies one outstanding async request to the adapter, so a later
/// completion can be routed back to the right async-io-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionToken {
    pub client_id: u64,
    pub ioid: ResourceId,
}

/// A completion an adapter posts back once an async request finishes,
/// addressed to a specific client/ioid via a `ClientMailbox`.
#[derive(Debug)]
pub enum Completion {
    ReadDone { token: CompletionToken, status: CaStatus, value: Option<DdHandle> },
    WriteDone { token: CompletionToken, status: CaStatus },
    MonitorEvent { client_id: u64, monitor: ResourceId, value: DdHandle },
}

/// A channel an adapter uses to deliver completions back into the server's
/// event loop, independent of whatever thread actually produced the
/// result. Cloneable so an adapter can stash one per in-flight request.
#[derive(Clone)]
pub struct ClientMailbox {
    tx: Sender<Completion>,
}

impl ClientMailbox {
    pub fn new(tx: Sender<Completion>) -> Self {
        Self { tx }
    }

    pub fn deliver(&self, completion: Completion) -> Result<(), Completion> {
        self.tx.send(completion).map_err(|e| e.0)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExistsOutcome {
    Exists { native_type: DbrType, native_count: u32, writable: bool },
    NotFound,
}

/// Answer to a SEARCH query (§4.G). Distinct from `ExistsOutcome` because
/// SEARCH alone may legitimately defer: the query arrives over a
/// connectionless datagram, so a deferred answer has to be correlated back
/// through an async record (source address + sequence) rather than an
/// open connection's own completion path.
#[derive(Debug)]
pub enum SearchAnswer {
    Found { native_type: DbrType, native_count: u32, writable: bool },
    NotFound,
    /// The adapter will answer later via the `SearchMailbox` it was handed.
    Deferred,
}

/// A completion an adapter posts back for a deferred SEARCH, addressed by
/// the `CompletionToken` handed out when the query was first answered.
#[derive(Debug)]
pub enum SearchCompletion {
    Done { token: CompletionToken, found: bool },
}

/// Delivery channel for deferred SEARCH answers, mirroring `ClientMailbox`
/// but routed to the datagram client rather than a specific stream client
/// (SEARCH has no open connection to hang a per-client mailbox off of).
#[derive(Clone)]
pub struct SearchMailbox {
    tx: Sender<SearchCompletion>,
}

impl SearchMailbox {
    pub fn new(tx: Sender<SearchCompletion>) -> Self {
        Self { tx }
    }

    pub fn deliver(&self, completion: SearchCompletion) -> Result<(), SearchCompletion> {
        self.tx.send(completion).map_err(|e| e.0)
    }
}

#[derive(Debug)]
pub enum ReadOutcome {
    Done { status: CaStatus, value: Option<DdHandle> },
    Pending,
}

#[derive(Debug)]
pub enum WriteOutcome {
    Done { status: CaStatus },
    Pending,
}

/// The engine's view of whatever owns process variables. Every method may
/// either answer immediately or, for the two async-capable ones, return a
/// `Pending` outcome and deliver the real result later through the
/// `ClientMailbox` it was given at construction.
pub trait Adapter: Send + Sync {
    fn exists(&self, name: &str) -> ExistsOutcome;

    /// Answer a SEARCH query (§4.G), optionally deferring to a later
    /// completion delivered through `mailbox`. The default bridges to the
    /// synchronous `exists` check, which is enough for any adapter that
    /// never needs SEARCH specifically to defer; override it to actually
    /// use `token`/`mailbox` for an adapter whose existence check is itself
    /// asynchronous.
    fn search(&self, name: &str, _token: CompletionToken, _mailbox: SearchMailbox) -> SearchAnswer {
        match self.exists(name) {
            ExistsOutcome::Exists { native_type, native_count, writable } => {
                SearchAnswer::Found { native_type, native_count, writable }
            }
            ExistsOutcome::NotFound => SearchAnswer::NotFound,
        }
    }

    fn read(
        &self,
        name: &str,
        dbr_type: DbrType,
        count: u32,
        token: CompletionToken,
    ) -> ReadOutcome;

    fn write(
        &self,
        name: &str,
        dbr_type: DbrType,
        count: u32,
        value: &[u8],
        token: CompletionToken,
    ) -> WriteOutcome;

    /// Subscribe to future value changes for `name` under `mask`; the
    /// adapter delivers events by calling `mailbox.deliver` with
    /// `Completion::MonitorEvent` for as long as the subscription is live.
    fn subscribe(&self, name: &str, monitor: ResourceId, client_id: u64, mailbox: ClientMailbox);

    fn unsubscribe(&self, name: &str, monitor: ResourceId);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    struct NullAdapter;
    impl Adapter for NullAdapter {
        fn exists(&self, _name: &str) -> ExistsOutcome {
            ExistsOutcome::NotFound
        }
        fn read(&self, _n: &str, _t: DbrType, _c: u32, _tok: CompletionToken) -> ReadOutcome {
            ReadOutcome::Done { status: CaStatus::Disconnect, value: None }
        }
        fn write(&self, _n: &str, _t: DbrType, _c: u32, _v: &[u8], _tok: CompletionToken) -> WriteOutcome {
            WriteOutcome::Done { status: CaStatus::Disconnect }
        }
        fn subscribe(&self, _n: &str, _m: ResourceId, _c: u64, _mb: ClientMailbox) {}
        fn unsubscribe(&self, _n: &str, _m: ResourceId) {}
    }

    #[test]
    fn not_found_channel_reports_not_found() {
        let adapter = NullAdapter;
        assert_eq!(adapter.exists("missing:pv"), ExistsOutcome::NotFound);
    }

    #[test]
    fn mailbox_delivers_across_the_channel() {
        let (tx, rx) = channel();
        let mailbox = ClientMailbox::new(tx);
        let token = CompletionToken { client_id: 1, ioid: ResourceId(1) };
        mailbox
            .deliver(Completion::WriteDone { token, status: CaStatus::Normal })
            .unwrap();
        match rx.recv().unwrap() {
            Completion::WriteDone { status, .. } => assert!(status.is_success()),
            _ => panic!("wrong completion variant"),
        }
    }

    #[test]
    fn default_search_bridges_to_the_synchronous_exists_check() {
        let adapter = NullAdapter;
        let (tx, _rx) = channel();
        let mailbox = SearchMailbox::new(tx);
        let token = CompletionToken { client_id: 0, ioid: ResourceId(1) };
        assert!(matches!(adapter.search("missing:pv", token, mailbox), SearchAnswer::NotFound));
    }

    #[test]
    fn search_mailbox_delivers_a_deferred_completion() {
        let (tx, rx) = channel();
        let mailbox = SearchMailbox::new(tx);
        let token = CompletionToken { client_id: 0, ioid: ResourceId(7) };
        mailbox.deliver(SearchCompletion::Done { token, found: true }).unwrap();
        match rx.recv().unwrap() {
            SearchCompletion::Done { found, .. } => assert!(found),
        }
    }
}
