// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The stream (TCP) client state machine (§4.F): per-connection buffers,
//! channel table, async I/O table, and event queue, plus the opcode
//! dispatch loop that ties them to a shared `ServerCore` and an `Adapter`.

pub mod datagram;

use crate::adapter::{Adapter, ClientMailbox, Completion, CompletionToken, ExistsOutcome, ReadOutcome, WriteOutcome};
use crate::async_io::{AsyncIoTable, InstallOutcome, PendingIo};
use crate::buf::{FillResult, FlushResult, InBuf, OutBuf, Sink, Source};
use crate::channel::{AccessMode, Chan};
use crate::dd::DdHandle;
use crate::event_queue::{EventQueue, StepOutcome};
use crate::monitor::{EventMask, Monitor, MonitorId};
use crate::resource_table::{ResourceId, ResourceTable};
use crate::server::SharedServerCore;
use crate::Error;
use ca_protocol::{CaStatus, Command, DbrType, Hdr};
use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

/// One pending monitor delivery: pre-formatted value bytes plus the
/// metadata needed to build the EVENT_ADD completion header.
pub struct MonitorPayload {
    pub dbr_type: DbrType,
    pub count: u32,
    pub client_subscription_id: u32,
    pub value: DdHandle,
}

/// A request's context as it flows through dispatch (SPEC_FULL: mirrors
/// the source's `casCtx`, which threads request-scoped state -- the
/// originating header, the channel it targets -- through to completion
/// without a global). Asserts on drop that any async install it recorded
/// was actually followed through, catching dispatch bugs that would
/// otherwise silently leak an async-table slot.
pub struct RequestCtx {
    pub hdr: Hdr,
    async_installs_expected: u32,
    async_installs_done: u32,
}

impl RequestCtx {
    pub fn new(hdr: Hdr) -> Self {
        Self {
            hdr,
            async_installs_expected: 0,
            async_installs_done: 0,
        }
    }

    pub fn expect_async_install(&mut self) {
        self.async_installs_expected += 1;
    }

    pub fn note_async_install(&mut self) {
        self.async_installs_done += 1;
    }
}

impl Drop for RequestCtx {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.async_installs_expected, self.async_installs_done,
            "request claimed an async install but never performed one"
        );
    }
}

/// §4.F payload handling: a scalar (`count == 1`) string write is
/// length-terminated on its first NUL and bounded by `MAX_STRING_SIZE`
/// rather than taken verbatim; any other write is bounded to exactly
/// `dbr_type.value_size(count)` bytes -- the declared element count, not
/// whatever padding the wire alignment (§6) tacked on.
fn prepare_write_value(dbr_type: DbrType, count: u32, payload: &[u8]) -> Vec<u8> {
    if dbr_type.is_string() && count <= 1 {
        let bound = ca_protocol::MAX_STRING_SIZE.min(payload.len());
        let end = payload[..bound]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(bound);
        return payload[..end].to_vec();
    }

    let expected = dbr_type.value_size(count).min(payload.len());
    payload[..expected].to_vec()
}

pub struct StreamClient {
    pub client_id: u64,
    server: SharedServerCore,
    adapter: Arc<dyn Adapter>,
    in_buf: InBuf,
    out_buf: OutBuf,
    async_io: AsyncIoTable,
    event_queue: EventQueue<MonitorPayload>,
    channels: HashMap<ResourceId, Chan>,
    monitors: ResourceTable<Monitor>,
    mailbox_rx: Receiver<Completion>,
    mailbox_tx: Sender<Completion>,
    host_name: Option<String>,
    client_name: Option<String>,
}

impl StreamClient {
    pub fn new(client_id: u64, server: SharedServerCore, adapter: Arc<dyn Adapter>, pool: crate::buf::BufferPool) -> Self {
        let (tx, rx) = std::sync::mpsc::channel();
        Self {
            client_id,
            server,
            adapter,
            in_buf: InBuf::new(pool.clone()),
            out_buf: OutBuf::new(pool),
            async_io: AsyncIoTable::new(),
            event_queue: EventQueue::new(),
            channels: HashMap::new(),
            monitors: ResourceTable::new(),
            mailbox_rx: rx,
            mailbox_tx: tx,
            host_name: None,
            client_name: None,
        }
    }

    pub fn mailbox(&self) -> ClientMailbox {
        ClientMailbox::new(self.mailbox_tx.clone())
    }

    /// Pull more bytes off the transport into `in_buf`.
    pub fn fill(&mut self, source: &mut dyn Source) -> FillResult {
        self.in_buf.fill(source)
    }

    /// Push staged bytes out to the transport. A flush that still leaves
    /// bytes sitting in `out_buf` is live transport backpressure (§4.C):
    /// the event queue's flow state reacts to that, not to its own length.
    pub fn flush(&mut self, sink: &mut dyn Sink) -> FlushResult {
        let result = self.out_buf.flush(sink, 0);
        if self.out_buf.bytes_present() > 0 {
            self.event_queue.note_transport_backpressure();
        }
        result
    }

    /// Drain completions the adapter delivered asynchronously, formatting
    /// each into the out buffer and freeing its async-table slot.
    pub fn drain_mailbox(&mut self) -> Result<(), Error> {
        while let Ok(completion) = self.mailbox_rx.try_recv() {
            self.handle_completion(completion)?;
        }
        Ok(())
    }

    fn handle_completion(&mut self, completion: Completion) -> Result<(), Error> {
        match completion {
            Completion::ReadDone { token, status, value } => {
                let Some(pending) = self.async_io.remove(token.ioid) else {
                    self.async_io.note_dropped_completion();
                    return Ok(());
                };
                self.write_read_notify_response(&pending, status, value)
            }
            Completion::WriteDone { token, status } => {
                let Some(pending) = self.async_io.remove(token.ioid) else {
                    self.async_io.note_dropped_completion();
                    return Ok(());
                };
                self.write_write_notify_response(&pending, status)
            }
            Completion::MonitorEvent { client_id: _, monitor, value } => {
                let Some(mon) = self.monitors.lookup(monitor) else {
                    return Ok(());
                };
                let payload = MonitorPayload {
                    dbr_type: mon.dbr_type,
                    count: mon.count,
                    client_subscription_id: mon.client_subscription_id,
                    value,
                };
                {
                    let server = self.server.lock().unwrap();
                    server.note_event_posted();
                }
                self.event_queue.post(monitor, payload);
                self.resync_monitor_pending_counts();
                Ok(())
            }
        }
    }

    /// Resync each live monitor's `pending_count` against the event
    /// queue's own bookkeeping (§8 invariant), called after any operation
    /// that posts, delivers, or purges queue entries.
    fn resync_monitor_pending_counts(&mut self) {
        let event_queue = &self.event_queue;
        for (id, mon) in self.monitors.iter_mut() {
            mon.pending_count = event_queue.pending_count_for(id).min(u8::MAX as usize) as u8;
        }
    }

    /// Process exactly one complete frame from `in_buf`, if one is fully
    /// buffered. Returns `Ok(true)` if a message was consumed, `Ok(false)`
    /// if more bytes are needed first.
    pub fn process_one(&mut self) -> Result<bool, Error> {
        let available = self.in_buf.msg_ptr();
        let (hdr, consumed) = match Hdr::decode(available) {
            Ok(pair) => pair,
            Err(ca_protocol::ProtocolError::Truncated) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let total = hdr.total_wire_len();
        if (available.len() as u32) < total {
            if !self.in_buf.ensure_capacity(total) {
                return Err(Error::Fatal("message exceeds maximum buffer size".into()));
            }
            return Ok(false);
        }

        // `total` includes the §6 8-byte alignment padding; trim it back
        // off so handlers never see the zero-fill tail as part of the
        // value.
        let payload_end = consumed as usize + hdr.payload_size as usize;
        let payload = available[consumed as usize..payload_end].to_vec();
        self.in_buf.remove_msg(total);
        self.dispatch(hdr, &payload)?;
        Ok(true)
    }

    fn dispatch(&mut self, hdr: Hdr, payload: &[u8]) -> Result<(), Error> {
        // §8 boundary scenario 5: an unknown opcode disconnects the client
        // rather than being answered with an error status.
        let Some(cmd) = Command::from_wire(hdr.command) else {
            return Err(ca_protocol::ProtocolError::UnknownCode(hdr.command).into());
        };

        let mut ctx = RequestCtx::new(hdr);

        match cmd {
            Command::Version => self.handle_version(&ctx),
            Command::Echo => self.handle_echo(&ctx),
            Command::ClientName => {
                self.client_name = Some(String::from_utf8_lossy(payload).trim_end_matches('\0').to_string());
                Ok(())
            }
            Command::HostName => {
                self.host_name = Some(String::from_utf8_lossy(payload).trim_end_matches('\0').to_string());
                Ok(())
            }
            Command::ClaimChannel => self.handle_claim_channel(&ctx, payload),
            Command::ClearChannel => self.handle_clear_channel(&ctx),
            Command::Read => self.handle_read(&mut ctx, Command::Read),
            Command::ReadNotify => self.handle_read(&mut ctx, Command::ReadNotify),
            Command::Write => self.handle_write(&mut ctx, payload, false),
            Command::WriteNotify => self.handle_write(&mut ctx, payload, true),
            Command::EventAdd => self.handle_event_add(&ctx, payload),
            Command::EventCancel => self.handle_event_cancel(&ctx),
            Command::EventsOff => {
                self.event_queue.set_events_off();
                Ok(())
            }
            Command::EventsOn => {
                self.event_queue.set_events_on();
                Ok(())
            }
            Command::ReadSync => Ok(()),
            Command::Search => Ok(()),
        }
    }

    fn chan_of(&self, sid: ResourceId) -> Result<&Chan, Error> {
        self.channels.get(&sid).ok_or(Error::BadResourceId(sid.0))
    }

    fn handle_version(&mut self, ctx: &RequestCtx) -> Result<(), Error> {
        let response = Hdr::new(Command::Version.to_wire(), 0, 0, 0, ctx.hdr.cid, 0);
        let off = self
            .out_buf
            .copy_in_header(&response)
            .map_err(|_| Error::Fatal("out buffer full".into()))?;
        let _ = off;
        self.out_buf.commit_msg(0);
        Ok(())
    }

    fn handle_echo(&mut self, ctx: &RequestCtx) -> Result<(), Error> {
        let response = Hdr::new(Command::Echo.to_wire(), 0, 0, 0, ctx.hdr.cid, 0);
        self.out_buf
            .copy_in_header(&response)
            .map_err(|_| Error::Fatal("out buffer full".into()))?;
        self.out_buf.commit_msg(0);
        Ok(())
    }

    fn handle_claim_channel(&mut self, ctx: &RequestCtx, payload: &[u8]) -> Result<(), Error> {
        let name = String::from_utf8_lossy(payload).trim_end_matches('\0').to_string();

        let status = {
            let server = self.server.lock().unwrap();
            if !server.room_for_new_channel() {
                Some(CaStatus::AllocMem)
            } else {
                None
            }
        };

        if let Some(status) = status {
            return self.write_claim_response(ctx, status, ResourceId(0), DbrType::Long, 0);
        }

        // Boundary scenario 6 (§8): a second CLAIM_CHANNEL reusing a `cid`
        // this client already has an open channel under is rejected; the
        // first channel is left untouched.
        if self.channels.values().any(|c| c.cid == ctx.hdr.cid) {
            return self.write_claim_response(ctx, CaStatus::BadResourceId, ResourceId(0), DbrType::Long, 0);
        }

        match self.adapter.exists(&name) {
            ExistsOutcome::NotFound => self.write_claim_response(ctx, CaStatus::BadResourceId, ResourceId(0), DbrType::Long, 0),
            ExistsOutcome::Exists { native_type, native_count, writable } => {
                // §4.E: sid allocation is server-wide, not per-client, so
                // two clients claiming channels concurrently never collide.
                let registered = {
                    let mut server = self.server.lock().unwrap();
                    server.register_channel(self.client_id)
                };

                match registered {
                    Some(sid) => {
                        let access = if writable { AccessMode::ReadWrite } else { AccessMode::ReadOnly };
                        let chan = Chan {
                            sid,
                            cid: ctx.hdr.cid,
                            name,
                            native_type,
                            native_count,
                            access,
                        };
                        self.channels.insert(sid, chan);
                        self.write_claim_response(ctx, CaStatus::Normal, sid, native_type, native_count)
                    }
                    None => self.write_claim_response(ctx, CaStatus::BadResourceId, ResourceId(0), DbrType::Long, 0),
                }
            }
        }
    }

    fn write_claim_response(
        &mut self,
        ctx: &RequestCtx,
        status: CaStatus,
        sid: ResourceId,
        native_type: DbrType,
        native_count: u32,
    ) -> Result<(), Error> {
        let response = Hdr::new(
            Command::ClaimChannel.to_wire(),
            0,
            native_type.to_wire(),
            native_count,
            ctx.hdr.cid,
            if status.is_success() { sid.0 } else { status.to_wire() },
        );
        self.out_buf
            .copy_in_header(&response)
            .map_err(|_| Error::Fatal("out buffer full".into()))?;
        self.out_buf.commit_msg(0);
        Ok(())
    }

    fn handle_clear_channel(&mut self, ctx: &RequestCtx) -> Result<(), Error> {
        let sid = ResourceId(ctx.hdr.response_specific);
        if let Some(chan) = self.channels.remove(&sid) {
            {
                let mut server = self.server.lock().unwrap();
                server.unregister_channel(sid);
            }
            self.async_io.cancel_for_channel(sid);

            // §4.F: CLEAR_CHANNEL destroys the channel's monitors along
            // with its async records.
            let doomed: Vec<MonitorId> = self
                .monitors
                .iter()
                .filter(|(_, mon)| mon.chan_sid == sid)
                .map(|(id, _)| id)
                .collect();
            for monitor_id in doomed {
                self.monitors.remove(monitor_id);
                self.adapter.unsubscribe(&chan.name, monitor_id);
                self.event_queue.purge_monitor(monitor_id);
            }
            self.event_queue.set_monitor_count(self.monitors.len());

            let response = Hdr::new(Command::ClearChannel.to_wire(), 0, 0, 0, ctx.hdr.cid, 0);
            self.out_buf
                .copy_in_header(&response)
                .map_err(|_| Error::Fatal("out buffer full".into()))?;
            self.out_buf.commit_msg(0);
        }
        Ok(())
    }

    /// `cmd` is `Read` for the deprecated (protocol ≤ 12) opcode or
    /// `ReadNotify` for its modern replacement; the response echoes
    /// whichever opcode the client actually sent (§4.F opcode table).
    fn handle_read(&mut self, ctx: &mut RequestCtx, cmd: Command) -> Result<(), Error> {
        let sid = ResourceId(ctx.hdr.response_specific);
        let dbr_type = DbrType::from_wire(ctx.hdr.data_type)?;
        let count = ctx.hdr.count;
        let chan = self.chan_of(sid)?.clone();

        ctx.expect_async_install();
        let ioid = match self.async_io.install(PendingIo {
            command: cmd,
            chan_sid: sid,
            dbr_type,
            count,
            client_ioid: ctx.hdr.response_specific,
            notify: true,
        }) {
            InstallOutcome::Installed(id) => id,
            InstallOutcome::TooManyInProgress => return Err(Error::TooManyAsyncIo),
        };
        ctx.note_async_install();

        let token = CompletionToken { client_id: self.client_id, ioid };
        match self.adapter.read(&chan.name, dbr_type, count, token) {
            ReadOutcome::Pending => Ok(()),
            ReadOutcome::Done { status, value } => {
                let pending = self.async_io.remove(ioid).expect("just installed");
                self.write_read_notify_response(&pending, status, value)
            }
        }
    }

    fn write_read_notify_response(
        &mut self,
        pending: &PendingIo,
        status: CaStatus,
        value: Option<DdHandle>,
    ) -> Result<(), Error> {
        let body_len = value.as_ref().map(|v| v.bytes().len() as u32).unwrap_or(0);
        let response = Hdr::new(
            pending.command.to_wire(),
            body_len,
            pending.dbr_type.to_wire(),
            pending.count,
            status.to_wire(),
            pending.client_ioid,
        );
        let body_off = self
            .out_buf
            .copy_in_header(&response)
            .map_err(|_| Error::Fatal("out buffer full".into()))?;
        let _ = body_off;
        if let Some(value) = &value {
            self.out_buf.reserved_slice()[..value.bytes().len()].copy_from_slice(value.bytes());
        }
        self.out_buf.commit_msg(body_len);
        {
            let server = self.server.lock().unwrap();
            server.note_event_processed();
        }
        Ok(())
    }

    /// `notify` distinguishes WRITE_NOTIFY (mandatory completion response)
    /// from plain WRITE, which per §4.F answers only on error -- a
    /// successful plain WRITE is silent.
    fn handle_write(&mut self, ctx: &mut RequestCtx, payload: &[u8], notify: bool) -> Result<(), Error> {
        let sid = ResourceId(ctx.hdr.response_specific);
        let dbr_type = DbrType::from_wire(ctx.hdr.data_type)?;
        let count = ctx.hdr.count;
        let chan = self.chan_of(sid)?.clone();

        if !chan.is_writable() {
            return self.write_write_status(ctx.hdr.cid, ctx.hdr.response_specific, CaStatus::NoWriteAccess, true);
        }

        let value = prepare_write_value(dbr_type, count, payload);

        ctx.expect_async_install();
        let ioid = match self.async_io.install(PendingIo {
            command: Command::WriteNotify,
            chan_sid: sid,
            dbr_type,
            count,
            client_ioid: ctx.hdr.response_specific,
            notify,
        }) {
            InstallOutcome::Installed(id) => id,
            InstallOutcome::TooManyInProgress => return Err(Error::TooManyAsyncIo),
        };
        ctx.note_async_install();

        let token = CompletionToken { client_id: self.client_id, ioid };
        match self.adapter.write(&chan.name, dbr_type, count, &value, token) {
            WriteOutcome::Pending => Ok(()),
            WriteOutcome::Done { status } => {
                let pending = self.async_io.remove(ioid).expect("just installed");
                self.write_write_notify_response(&pending, status)
            }
        }
    }

    fn write_write_notify_response(&mut self, pending: &PendingIo, status: CaStatus) -> Result<(), Error> {
        let notify = pending.notify;
        self.write_write_status(0, pending.client_ioid, status, notify)
    }

    /// Emit a WRITE_NOTIFY-shaped completion, unless this was a plain
    /// WRITE that succeeded -- those are silent per §4.F's opcode table.
    fn write_write_status(&mut self, cid: u32, ioid: u32, status: CaStatus, notify: bool) -> Result<(), Error> {
        if !notify && status.is_success() {
            return Ok(());
        }
        let response = Hdr::new(Command::WriteNotify.to_wire(), 0, 0, 0, cid, if status.is_success() { ioid } else { status.to_wire() });
        self.out_buf
            .copy_in_header(&response)
            .map_err(|_| Error::Fatal("out buffer full".into()))?;
        self.out_buf.commit_msg(0);
        Ok(())
    }

    fn handle_event_add(&mut self, ctx: &RequestCtx, _payload: &[u8]) -> Result<(), Error> {
        let sid = ResourceId(ctx.hdr.response_specific);
        let dbr_type = DbrType::from_wire(ctx.hdr.data_type)?;
        let count = ctx.hdr.count;
        let chan = self.chan_of(sid)?.clone();

        let monitor_id = self.monitors.install(Monitor {
            chan_sid: sid,
            dbr_type,
            count,
            mask: EventMask::VALUE,
            client_subscription_id: ctx.hdr.cid,
            pending_count: 0,
        });
        self.event_queue.set_monitor_count(self.monitors.len());

        self.adapter.subscribe(&chan.name, monitor_id, self.client_id, self.mailbox());

        // §4.F opcode table: EVENT_ADD installs the monitor and enqueues an
        // immediate value response alongside it. Only the synchronous path
        // is handled here; if the adapter defers the read, the client still
        // gets its first value through the ordinary subscription path once
        // the adapter posts a change.
        let token = CompletionToken { client_id: self.client_id, ioid: monitor_id };
        if let ReadOutcome::Done { status, value: Some(value) } =
            self.adapter.read(&chan.name, dbr_type, count, token)
        {
            if status.is_success() {
                self.event_queue.post(
                    monitor_id,
                    MonitorPayload {
                        dbr_type,
                        count,
                        client_subscription_id: ctx.hdr.cid,
                        value,
                    },
                );
            }
        }
        self.resync_monitor_pending_counts();
        Ok(())
    }

    fn handle_event_cancel(&mut self, ctx: &RequestCtx) -> Result<(), Error> {
        let monitor_id = MonitorId(ctx.hdr.response_specific);
        if let Some(mon) = self.monitors.remove(monitor_id) {
            let chan = self.chan_of(mon.chan_sid)?;
            self.adapter.unsubscribe(&chan.name, monitor_id);
            self.event_queue.purge_monitor(monitor_id);
            self.event_queue.set_monitor_count(self.monitors.len());
            self.resync_monitor_pending_counts();

            // §4.F: EVENT_CANCEL is acknowledged with a terminating
            // EVENT_ADD reply carrying no value, echoing the cancelled
            // monitor's type/count/subscription id.
            let response = Hdr::new(
                Command::EventAdd.to_wire(),
                0,
                mon.dbr_type.to_wire(),
                mon.count,
                mon.client_subscription_id,
                0,
            );
            self.out_buf
                .copy_in_header(&response)
                .map_err(|_| Error::Fatal("out buffer full".into()))?;
            self.out_buf.commit_msg(0);
        }
        Ok(())
    }

    /// Write as many queued monitor events into the out buffer as there is
    /// room for.
    pub fn pump_events(&mut self) -> Result<(), Error> {
        let out_buf = &mut self.out_buf;
        self.event_queue.process(|event| {
            let p = &event.payload;
            let hdr = Hdr::new(
                Command::EventAdd.to_wire(),
                p.value.bytes().len() as u32,
                p.dbr_type.to_wire(),
                p.count,
                p.client_subscription_id,
                0,
            );
            match out_buf.copy_in_header(&hdr) {
                Ok(_) => {
                    out_buf.reserved_slice()[..p.value.bytes().len()].copy_from_slice(p.value.bytes());
                    out_buf.commit_msg(p.value.bytes().len() as u32);
                    StepOutcome::Delivered
                }
                Err(()) => StepOutcome::NoRoom,
            }
        });
        self.resync_monitor_pending_counts();
        Ok(())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn async_io_len(&self) -> usize {
        self.async_io.len()
    }

    pub fn dropped_completions(&self) -> u64 {
        self.async_io.dropped_completions()
    }
}
