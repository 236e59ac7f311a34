// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The datagram (UDP) client (§4.G): handles SEARCH/VERSION requests that
//! arrive unconnected, and carries the server's periodic beacon. Shares no
//! per-connection buffers with `StreamClient` -- UDP is message-oriented,
//! so each datagram is processed and replied to independently -- but
//! shares the same `ServerCore` and `Adapter` seam.

use crate::adapter::{Adapter, CompletionToken, SearchAnswer, SearchCompletion, SearchMailbox};
use crate::resource_table::{ResourceId, ResourceTable};
use crate::server::SharedServerCore;
use ca_protocol::{Command, DbrType, Hdr};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

/// Reserved `client_id` for search completion tokens: SEARCH has no open
/// connection, so it can't collide with a real `StreamClient`'s id (those
/// start at 1, see `ServerCore::next_client_id`).
const SEARCH_CLIENT_ID: u64 = 0;

/// Decoded contents of one inbound SEARCH request.
pub struct SearchRequest {
    pub cid: u32,
    pub name: String,
    pub reply_required: bool,
}

/// What to do with a processed SEARCH: either the channel exists (reply
/// with its server address so the client can open a TCP connection), it
/// doesn't (silently drop, unless the client asked for a reply either way),
/// or the answer will arrive later (§4.G `Defer`).
pub enum SearchOutcome {
    Found { cid: u32 },
    NotFound { cid: u32, reply_required: bool },
    Deferred,
}

/// A SEARCH awaiting an asynchronous answer: the bits the eventual
/// completion needs to address and correlate its reply (§4.G: "the outbound
/// address and sequence number are captured in the async record and used
/// at completion time"). `cid` doubles as the sequence the client expects
/// echoed back, matching what a synchronous reply already echoes.
struct PendingSearch {
    cid: u32,
    reply_addr: String,
}

pub struct DatagramClient {
    server: SharedServerCore,
    adapter: Arc<dyn Adapter>,
    pending: Mutex<ResourceTable<PendingSearch>>,
    completion_tx: Sender<SearchCompletion>,
    completion_rx: Mutex<Receiver<SearchCompletion>>,
}

impl DatagramClient {
    pub fn new(server: SharedServerCore, adapter: Arc<dyn Adapter>) -> Self {
        let (completion_tx, completion_rx) = channel();
        Self {
            server,
            adapter,
            pending: Mutex::new(ResourceTable::new()),
            completion_tx,
            completion_rx: Mutex::new(completion_rx),
        }
    }

    fn mailbox(&self) -> SearchMailbox {
        SearchMailbox::new(self.completion_tx.clone())
    }

    /// Parse a single SEARCH message body. The wire payload is the PV name,
    /// NUL-padded to the frame's declared payload size.
    pub fn decode_search(hdr: &Hdr, payload: &[u8]) -> SearchRequest {
        let name = String::from_utf8_lossy(payload)
            .trim_end_matches('\0')
            .to_string();
        SearchRequest {
            cid: hdr.cid,
            name,
            // A reply is always required for VERSION-qualified search
            // requests in this implementation; distinguishing "reply only
            // if found" from "always reply" is carried in the response
            // flags this core doesn't model (see DESIGN.md).
            reply_required: true,
        }
    }

    /// Handle one SEARCH, addressed to `reply_addr` (the datagram's source,
    /// opaque to this core -- the transport layer formats and parses it).
    /// If the adapter defers, a record is installed so `drain_completed`
    /// can answer once the adapter calls back through the mailbox.
    pub fn handle_search(&self, req: &SearchRequest, reply_addr: &str) -> SearchOutcome {
        let ioid = self.pending.lock().unwrap().install(PendingSearch {
            cid: req.cid,
            reply_addr: reply_addr.to_string(),
        });
        let token = CompletionToken { client_id: SEARCH_CLIENT_ID, ioid };

        let answer = self.adapter.search(&req.name, token, self.mailbox());
        match answer {
            SearchAnswer::Deferred => SearchOutcome::Deferred,
            SearchAnswer::Found { .. } => {
                self.pending.lock().unwrap().remove(ioid);
                SearchOutcome::Found { cid: req.cid }
            }
            SearchAnswer::NotFound => {
                self.pending.lock().unwrap().remove(ioid);
                SearchOutcome::NotFound { cid: req.cid, reply_required: req.reply_required }
            }
        }
    }

    /// Drain any SEARCH completions the adapter has delivered asynchronously
    /// since the last call, returning the encoded reply header paired with
    /// the address it belongs to.
    pub fn drain_completed(&self) -> Vec<(Hdr, String)> {
        let mut out = Vec::new();
        let rx = self.completion_rx.lock().unwrap();
        while let Ok(SearchCompletion::Done { token, found }) = rx.try_recv() {
            let Some(pending) = self.pending.lock().unwrap().remove(token.ioid) else {
                continue;
            };
            let outcome = if found {
                SearchOutcome::Found { cid: pending.cid }
            } else {
                SearchOutcome::NotFound { cid: pending.cid, reply_required: true }
            };
            if let Some(hdr) = self.encode_search_reply(&outcome) {
                out.push((hdr, pending.reply_addr));
            }
        }
        out
    }

    pub fn encode_search_reply(&self, outcome: &SearchOutcome) -> Option<Hdr> {
        match outcome {
            SearchOutcome::Found { cid } => {
                Some(Hdr::new(Command::Search.to_wire(), 8, DbrType::Long.to_wire(), 0, *cid, 0))
            }
            SearchOutcome::NotFound { reply_required, cid } => {
                if *reply_required {
                    Some(Hdr::new(Command::Search.to_wire(), 0, 0, 0, *cid, 0xFFFF_FFFF))
                } else {
                    None
                }
            }
            SearchOutcome::Deferred => None,
        }
    }

    pub fn handle_version(&self) -> Hdr {
        Hdr::new(Command::Version.to_wire(), 0, 0, 0, 0, 0)
    }

    /// Build the periodic beacon frame, honoring the server's anomaly
    /// governor (SPEC_FULL: beacon anomaly governor -- a forced anomaly
    /// means "I just came up or reconfigured, please re-search").
    pub fn build_beacon(&self, sequence: u32) -> Hdr {
        let anomaly = {
            let server = self.server.lock().unwrap();
            server.generate_beacon_anomaly()
        };
        let response_specific = if anomaly { 1 } else { 0 };
        Hdr::new(Command::Version.to_wire(), 0, 0, sequence, 0, response_specific)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ClientMailbox, Completion, ExistsOutcome, ReadOutcome, WriteOutcome};
    use crate::server::new_shared_server_core;
    use std::sync::Mutex as StdMutex;

    struct StubAdapter {
        known: &'static str,
    }

    impl Adapter for StubAdapter {
        fn exists(&self, name: &str) -> ExistsOutcome {
            if name == self.known {
                ExistsOutcome::Exists { native_type: DbrType::Double, native_count: 1, writable: true }
            } else {
                ExistsOutcome::NotFound
            }
        }
        fn read(&self, _n: &str, _t: DbrType, _c: u32, _tok: CompletionToken) -> ReadOutcome {
            ReadOutcome::Pending
        }
        fn write(&self, _n: &str, _t: DbrType, _c: u32, _v: &[u8], _tok: CompletionToken) -> WriteOutcome {
            WriteOutcome::Pending
        }
        fn subscribe(&self, _n: &str, _m: ResourceId, _c: u64, _mb: ClientMailbox) {}
        fn unsubscribe(&self, _n: &str, _m: ResourceId) {}
    }

    #[test]
    fn search_for_known_pv_reports_found() {
        let dgram = DatagramClient::new(new_shared_server_core(), Arc::new(StubAdapter { known: "test:pv" }));
        let req = SearchRequest { cid: 5, name: "test:pv".into(), reply_required: true };
        let outcome = dgram.handle_search(&req, "127.0.0.1:9999");
        assert!(matches!(outcome, SearchOutcome::Found { cid: 5 }));
        assert!(dgram.encode_search_reply(&outcome).is_some());
    }

    #[test]
    fn search_for_unknown_pv_without_reply_required_is_silent() {
        let dgram = DatagramClient::new(new_shared_server_core(), Arc::new(StubAdapter { known: "test:pv" }));
        let outcome = SearchOutcome::NotFound { cid: 1, reply_required: false };
        assert!(dgram.encode_search_reply(&outcome).is_none());
    }

    #[test]
    fn beacon_carries_forced_anomaly_exactly_once() {
        let server = new_shared_server_core();
        {
            let core = server.lock().unwrap();
            core.set_force_anomaly(true);
        }
        let dgram = DatagramClient::new(server, Arc::new(StubAdapter { known: "test:pv" }));
        let first = dgram.build_beacon(1);
        let second = dgram.build_beacon(2);
        assert_eq!(first.response_specific, 1);
        assert_eq!(second.response_specific, 0);
    }

    /// An adapter that always defers SEARCH and answers later from whatever
    /// thread calls `resolve` -- modeling an adapter whose PV existence
    /// check genuinely has to ask somewhere else first.
    struct DeferringAdapter {
        outstanding: StdMutex<Vec<(CompletionToken, SearchMailbox)>>,
    }

    impl DeferringAdapter {
        fn new() -> Self {
            Self { outstanding: StdMutex::new(Vec::new()) }
        }

        fn resolve_all(&self, found: bool) {
            for (token, mailbox) in self.outstanding.lock().unwrap().drain(..) {
                mailbox.deliver(SearchCompletion::Done { token, found }).unwrap();
            }
        }
    }

    impl Adapter for DeferringAdapter {
        fn exists(&self, _name: &str) -> ExistsOutcome {
            ExistsOutcome::NotFound
        }
        fn read(&self, _n: &str, _t: DbrType, _c: u32, _tok: CompletionToken) -> ReadOutcome {
            ReadOutcome::Pending
        }
        fn write(&self, _n: &str, _t: DbrType, _c: u32, _v: &[u8], _tok: CompletionToken) -> WriteOutcome {
            WriteOutcome::Pending
        }
        fn subscribe(&self, _n: &str, _m: ResourceId, _c: u64, _mb: ClientMailbox) {}
        fn unsubscribe(&self, _n: &str, _m: ResourceId) {}

        fn search(&self, _name: &str, token: CompletionToken, mailbox: SearchMailbox) -> SearchAnswer {
            self.outstanding.lock().unwrap().push((token, mailbox));
            SearchAnswer::Deferred
        }
    }

    #[test]
    fn deferred_search_is_answered_later_through_drain_completed() {
        let adapter = Arc::new(DeferringAdapter::new());
        let dgram = DatagramClient::new(new_shared_server_core(), adapter.clone());

        let req = SearchRequest { cid: 42, name: "slow:pv".into(), reply_required: true };
        let outcome = dgram.handle_search(&req, "10.0.0.5:5064");
        assert!(matches!(outcome, SearchOutcome::Deferred));
        assert!(dgram.drain_completed().is_empty(), "nothing to report before the adapter resolves it");

        adapter.resolve_all(true);
        let replies = dgram.drain_completed();
        assert_eq!(replies.len(), 1);
        let (hdr, addr) = &replies[0];
        assert_eq!(hdr.response_specific, 42);
        assert_eq!(addr, "10.0.0.5:5064");
    }
}
