// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! An in-memory process variable table, standing in for whatever real
//! integration (EPICS device support, a simulation engine, ...) would own
//! actual PV storage in a production deployment. Exists so the server
//! binary has something to serve without depending on external hardware;
//! every value lives in a `HashMap` guarded by one mutex.

use ca_core::adapter::{Adapter, ClientMailbox, Completion, CompletionToken, ExistsOutcome, ReadOutcome, WriteOutcome};
use ca_core::dd::{Dd, DdHandle};
use ca_core::resource_table::ResourceId;
use ca_protocol::{CaStatus, DbrType};
use std::collections::HashMap;
use std::sync::Mutex;

struct Pv {
    dbr_type: DbrType,
    count: u32,
    bytes: Vec<u8>,
    writable: bool,
    subscribers: Vec<(ResourceId, u64, ClientMailbox)>,
}

pub struct MemoryAdapter {
    pvs: Mutex<HashMap<String, Pv>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self { pvs: Mutex::new(HashMap::new()) }
    }

    /// Seed a PV with an initial value. Intended for startup configuration
    /// only, not called once the server is serving requests.
    pub fn seed(&self, name: &str, dbr_type: DbrType, count: u32, bytes: Vec<u8>, writable: bool) {
        let mut pvs = self.pvs.lock().unwrap();
        pvs.insert(
            name.to_string(),
            Pv { dbr_type, count, bytes, writable, subscribers: Vec::new() },
        );
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Adapter for MemoryAdapter {
    fn exists(&self, name: &str) -> ExistsOutcome {
        let pvs = self.pvs.lock().unwrap();
        match pvs.get(name) {
            Some(pv) => ExistsOutcome::Exists {
                native_type: pv.dbr_type,
                native_count: pv.count,
                writable: pv.writable,
            },
            None => ExistsOutcome::NotFound,
        }
    }

    fn read(&self, name: &str, dbr_type: DbrType, count: u32, _token: CompletionToken) -> ReadOutcome {
        let pvs = self.pvs.lock().unwrap();
        match pvs.get(name) {
            Some(pv) => {
                let dd = Dd::new(dbr_type, count.min(pv.count), {
                    let n = dbr_type.value_size(count.min(pv.count)).min(pv.bytes.len());
                    pv.bytes[..n].to_vec()
                });
                ReadOutcome::Done { status: CaStatus::Normal, value: Some(DdHandle::from_owned(dd)) }
            }
            None => ReadOutcome::Done { status: CaStatus::BadResourceId, value: None },
        }
    }

    fn write(&self, name: &str, _dbr_type: DbrType, _count: u32, value: &[u8], _token: CompletionToken) -> WriteOutcome {
        let mut pvs = self.pvs.lock().unwrap();
        match pvs.get_mut(name) {
            Some(pv) if pv.writable => {
                pv.bytes = value.to_vec();
                let dd = Dd::new(pv.dbr_type, pv.count, pv.bytes.clone());
                let handle = DdHandle::from_owned(dd);
                for (monitor, client_id, mailbox) in &pv.subscribers {
                    let _ = mailbox.deliver(Completion::MonitorEvent {
                        client_id: *client_id,
                        monitor: *monitor,
                        value: DdHandle::from_shared(&handle),
                    });
                }
                WriteOutcome::Done { status: CaStatus::Normal }
            }
            Some(_) => WriteOutcome::Done { status: CaStatus::NoWriteAccess },
            None => WriteOutcome::Done { status: CaStatus::BadResourceId },
        }
    }

    fn subscribe(&self, name: &str, monitor: ResourceId, client_id: u64, mailbox: ClientMailbox) {
        let mut pvs = self.pvs.lock().unwrap();
        if let Some(pv) = pvs.get_mut(name) {
            pv.subscribers.push((monitor, client_id, mailbox));
        }
    }

    fn unsubscribe(&self, name: &str, monitor: ResourceId) {
        let mut pvs = self.pvs.lock().unwrap();
        if let Some(pv) = pvs.get_mut(name) {
            pv.subscribers.retain(|(m, _, _)| *m != monitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn seeded_pv_is_readable() {
        let adapter = MemoryAdapter::new();
        adapter.seed("test:pv", DbrType::Double, 1, vec![0u8; 8], true);
        assert!(matches!(adapter.exists("test:pv"), ExistsOutcome::Exists { .. }));

        let token = CompletionToken { client_id: 1, ioid: ResourceId(1) };
        match adapter.read("test:pv", DbrType::Double, 1, token) {
            ReadOutcome::Done { status, value } => {
                assert!(status.is_success());
                assert!(value.is_some());
            }
            ReadOutcome::Pending => panic!("memory adapter never defers"),
        }
    }

    #[test]
    fn write_to_read_only_pv_is_rejected() {
        let adapter = MemoryAdapter::new();
        adapter.seed("test:ro", DbrType::Long, 1, vec![0u8; 4], false);
        let token = CompletionToken { client_id: 1, ioid: ResourceId(1) };
        match adapter.write("test:ro", DbrType::Long, 1, &[1, 2, 3, 4], token) {
            WriteOutcome::Done { status } => assert!(!status.is_success()),
            WriteOutcome::Pending => panic!("memory adapter never defers"),
        }
    }

    #[test]
    fn subscribers_are_notified_on_write() {
        let adapter = MemoryAdapter::new();
        adapter.seed("test:rw", DbrType::Long, 1, vec![0u8; 4], true);

        let (tx, rx) = mpsc::channel();
        let mailbox = ClientMailbox::new(tx);
        adapter.subscribe("test:rw", ResourceId(1), 1, mailbox);

        let token = CompletionToken { client_id: 1, ioid: ResourceId(2) };
        adapter.write("test:rw", DbrType::Long, 1, &[9, 9, 9, 9], token);

        match rx.recv().unwrap() {
            Completion::MonitorEvent { monitor, .. } => assert_eq!(monitor, ResourceId(1)),
            _ => panic!("expected a monitor event"),
        }
    }
}
