// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! io_uring-driven connection loop: multishot accept and receive keep a
//! single thread fed without a blocking read-per-connection; each
//! completion is handed to the matching `StreamClient` and any reply is
//! queued back out through a `Send` submission.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use io_uring::{cqueue, opcode, types, IoUring};
use log::*;

use ca_core::buf::{BufferPool, FillOutcome, FlushOutcome, Sink, Source};
use ca_core::{Adapter, SharedServerCore, StreamClient};

const GROUP_ID: u16 = 42;

/// Feeds a single already-received chunk of bytes into an `InBuf` via the
/// `Source` seam, then reports would-block -- the ring, not `InBuf`, is
/// what actually waits on the socket.
struct OnceSource {
    chunk: Option<Vec<u8>>,
}

impl Source for OnceSource {
    fn recv_into(&mut self, buf: &mut [u8]) -> FillOutcome {
        match self.chunk.take() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                FillOutcome::Read(n)
            }
            None => FillOutcome::WouldBlock,
        }
    }
}

/// Drains an `OutBuf` into an in-memory queue rather than the socket
/// directly; the caller submits the queued bytes as a ring `Send` op
/// afterward. `flush` always reports everything as written from `OutBuf`'s
/// perspective since the queue has no capacity limit of its own.
struct QueueSink {
    queued: Vec<u8>,
}

impl Sink for QueueSink {
    fn send_from(&mut self, buf: &[u8]) -> FlushOutcome {
        self.queued.extend_from_slice(buf);
        FlushOutcome::Wrote(buf.len())
    }
}

struct ClientConn {
    client: StreamClient,
}

pub struct CaRingServer {
    ring: IoUring,
    listener: TcpListener,
    buffer_map: BufferMap,
    clients: HashMap<i32, ClientConn>,
    server: SharedServerCore,
    adapter: Arc<dyn Adapter>,
    pool: BufferPool,
    next_client_id: u64,
}

impl CaRingServer {
    pub fn new(address: &str, server: SharedServerCore, adapter: Arc<dyn Adapter>) -> io::Result<Self> {
        let mut ring = IoUring::new(1024)?;
        let buffer_map = BufferMap::new(&mut ring);

        let mut server_loop = Self {
            ring,
            listener: TcpListener::bind(address)?,
            buffer_map,
            clients: HashMap::new(),
            server,
            adapter,
            pool: BufferPool::with_defaults(),
            next_client_id: 1,
        };

        server_loop.submit_multishot_accept();
        Ok(server_loop)
    }

    pub fn main_loop(&mut self) -> io::Result<()> {
        loop {
            self.try_submit_and_wait();

            let cqe = self.ring.completion().next().expect("failed to get completion");

            // SAFETY: user data was derived from a Box<Operation>::into_raw().
            let op = unsafe { Operation::from_u64(cqe.user_data()) };

            check_completion_error(&cqe, &op);
            trace!("{op}: {cqe:?}");

            match *op {
                Operation::Accept(ref a) => {
                    let listen_fd = a.fd;
                    op.handle_accept(&mut self.ring, cqe, listen_fd);
                }
                Operation::Recv(ref r) => {
                    let conn_fd = r.fd;
                    op.handle_receive(self, cqe, conn_fd);
                }
                Operation::Send(ref s) => {
                    trace!("send completed on fd {}, {} bytes", s.fd, s.data.len());
                }
            }

            self.pump_async_completions();
        }
    }

    /// Every client may have adapter completions or monitor events sitting
    /// in its mailbox independent of new bytes arriving on the wire; drain
    /// them each time around the loop and flush whatever they produced.
    fn pump_async_completions(&mut self) {
        let fds: Vec<i32> = self.clients.keys().copied().collect();
        for fd in fds {
            let faulted = match self.clients.get_mut(&fd) {
                Some(conn) => {
                    let faulted = conn.client.drain_mailbox().is_err();
                    if !faulted {
                        let _ = conn.client.pump_events();
                    }
                    faulted
                }
                None => continue,
            };

            if faulted {
                self.clients.remove(&fd);
            } else {
                self.flush_client(fd);
            }
        }
    }

    fn flush_client(&mut self, fd: i32) {
        let Some(conn) = self.clients.get_mut(&fd) else { return };
        let mut sink = QueueSink { queued: Vec::new() };
        conn.client.flush(&mut sink);
        if sink.queued.is_empty() {
            return;
        }

        let user_data = Box::new(Operation::Send(Send::new(fd, sink.queued)));
        let submission = opcode::Send::new(types::Fd(fd), user_data.buf_ptr(), user_data.buf_len())
            .build()
            .user_data(user_data.to_u64());

        // SAFETY: the buffer's ownership was passed to the kernel via
        // `to_u64()` on the boxed Operation above.
        unsafe {
            self.ring.submission().push(&submission).expect("queue is full");
        }
    }

    fn submit_multishot_accept(&mut self) {
        let listen_fd = self.listener.as_raw_fd();
        let user_data = Box::new(Operation::Accept(Accept::new(listen_fd)));
        let fd = types::Fd(self.listener.as_raw_fd());
        submit_accept(&mut self.ring, fd, user_data.to_u64());
    }

    fn try_submit_and_wait(&mut self) {
        let Err(e) = self.ring.submit_and_wait(1) else {
            return;
        };

        match nix::errno::Errno::from_raw(e.raw_os_error().unwrap()) {
            nix::Error::EAGAIN => {}
            other => panic!("unexpected error from io_uring_enter(): {other}"),
        }
    }

    fn handle_received_bytes(&mut self, buffer_id: u16, amount: i32, conn_fd: i32) {
        assert!(amount > 0);

        // SAFETY: buffer_id was just reported on this completion.
        let orig_buf = unsafe { self.buffer_map.take_buf(buffer_id) };
        let chunk = orig_buf[..amount as usize].to_vec();

        if !self.clients.contains_key(&conn_fd) {
            let client_id = self.next_client_id;
            self.next_client_id += 1;
            let client = StreamClient::new(client_id, self.server.clone(), self.adapter.clone(), self.pool.clone());
            self.clients.insert(conn_fd, ClientConn { client });
        }

        let mut source = OnceSource { chunk: Some(chunk) };
        let mut faulted = false;
        {
            let conn = self.clients.get_mut(&conn_fd).expect("just inserted above");
            conn.client.fill(&mut source);

            loop {
                match conn.client.process_one() {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        warn!("client on fd {conn_fd} faulted: {e}");
                        faulted = true;
                        break;
                    }
                }
            }

            if !faulted {
                let _ = conn.client.pump_events();
            }
        }

        if faulted {
            self.clients.remove(&conn_fd);
        } else {
            self.flush_client(conn_fd);
        }

        // SAFETY: the buffer being resubmitted was just taken above and
        // has not been resubmitted since.
        unsafe {
            self.buffer_map.resubmit_buf(orig_buf, buffer_id);
        }
    }
}

fn check_completion_error(cqe: &cqueue::Entry, op: &Operation) {
    let res = cqe.result();
    if res >= 0 {
        return;
    }
    match nix::errno::Errno::from_raw(-res) {
        nix::Error::EBADF => panic!("completion returned EBADF: {op}, {cqe:?}"),
        nix::Error::EFAULT => panic!("completion returned EFAULT: {op}, {cqe:?}"),
        _ => {}
    }
}

fn submit_accept(ring: &mut IoUring, listen_fd: types::Fd, user_data: u64) {
    let submission = opcode::AcceptMulti::new(listen_fd).build().user_data(user_data);
    // SAFETY: listen_fd outlives the operation; it is the server's own
    // listening socket.
    unsafe {
        ring.submission().push(&submission).expect("queue is full");
    }
}

#[derive(Debug)]
enum Operation {
    Accept(Accept),
    Recv(Receive),
    Send(Send),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Accept(a) => write!(f, "Accept on FD {}", a.fd),
            Self::Recv(r) => write!(f, "Receive on FD {}", r.fd),
            Self::Send(s) => write!(f, "Send on FD {}", s.fd),
        }
    }
}

impl Operation {
    fn handle_accept(self: Box<Self>, ring: &mut IoUring, cqe: cqueue::Entry, listen_fd: i32) {
        let fd = cqe.result();

        if fd < 0 {
            warn!("accept: error: {fd}: {}", io::Error::from_raw_os_error(fd));
        } else {
            let user_data = Box::new(Operation::Recv(Receive::new(fd)));
            let submission = opcode::RecvMulti::new(types::Fd(fd), GROUP_ID)
                .build()
                .user_data(user_data.to_u64());
            unsafe {
                ring.submission().push(&submission).expect("queue is full");
            }
        }

        if !cqueue::more(cqe.flags()) {
            warn!("multishot accept did not set MORE flag; resubmitting");
            submit_accept(ring, types::Fd(listen_fd), self.to_u64_noexpose());
        } else {
            let _ = self.to_u64_noexpose();
        }
    }

    fn handle_receive(self: Box<Self>, server: &mut CaRingServer, cqe: cqueue::Entry, conn_fd: i32) {
        match cqe.result() {
            res if res < 0 => {
                warn!("error in receive completion: {cqe:?}");
            }
            0 => {
                trace!("closing connection on fd {conn_fd}");
                server.clients.remove(&conn_fd);
                let _ = unsafe { libc::close(conn_fd) };
                return;
            }
            amount => {
                let buffer_id: u16 = cqueue::buffer_select(cqe.flags())
                    .expect("buffer id should be set on a multishot receive");
                server.handle_received_bytes(buffer_id, amount, conn_fd);
            }
        }

        if !cqueue::more(cqe.flags()) {
            warn!("multishot receive did not set MORE flag on fd {conn_fd}; dropping connection");
            server.clients.remove(&conn_fd);
        } else {
            let _ = self.to_u64_noexpose();
        }
    }

    fn to_u64(self: Box<Self>) -> u64 {
        Box::into_raw(self).expose_provenance() as u64
    }

    fn to_u64_noexpose(self: Box<Self>) -> u64 {
        Box::into_raw(self) as u64
    }

    unsafe fn from_u64(p: u64) -> Box<Self> {
        Box::from_raw(std::ptr::with_exposed_provenance::<Operation>(p as usize) as *mut Self)
    }
}

#[derive(Debug)]
struct Accept {
    fd: i32,
}

impl Accept {
    fn new(fd: i32) -> Self {
        Self { fd }
    }
}

#[derive(Debug)]
struct Receive {
    fd: i32,
}

impl Receive {
    fn new(fd: i32) -> Self {
        Self { fd }
    }
}

#[derive(Debug)]
struct Send {
    fd: i32,
    data: Vec<u8>,
}

impl Send {
    fn new(fd: i32, data: Vec<u8>) -> Self {
        Self { fd, data }
    }

    fn buf_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    fn buf_len(&self) -> u32 {
        self.data.len() as u32
    }
}

/// A memory map of a ring of buffer descriptors shared with the kernel,
/// along with the buffers themselves. Mirrors the receive-side buffer pool
/// a multishot recv needs to hand the kernel somewhere to write.
struct BufferMap {
    addr: *mut libc::c_void,
    num_entries: u16,
    buf_size: u32,
    private_tail: u16,
    group_id: u16,
    buffers: Vec<Box<[u8]>>,
}

impl BufferMap {
    pub fn new(ring: &mut IoUring) -> Self {
        let num_entries = 1024;
        let buf_size = 4096;

        assert!(num_entries < u16::MAX);
        assert!(num_entries & (num_entries - 1) == 0);

        let len = (num_entries as usize) * std::mem::size_of::<types::BufRingEntry>();
        let addr = unsafe {
            match libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED | libc::MAP_POPULATE,
                -1,
                0,
            ) {
                libc::MAP_FAILED => panic!("mmap: {:?}", io::Error::last_os_error()),
                addr => addr,
            }
        };

        let mut buffer_map = Self {
            addr,
            num_entries,
            buf_size,
            private_tail: 0,
            group_id: GROUP_ID,
            buffers: Vec::new(),
        };

        unsafe {
            ring.submitter()
                .register_buf_ring(buffer_map.addr as u64, num_entries, buffer_map.group_id)
                .unwrap();
        }

        for i in 0..num_entries {
            buffer_map.buffers.push(vec![0; buf_size as usize].into_boxed_slice());
            let addr: *mut u8 = buffer_map.buffers[i as usize].as_ptr() as *mut u8;
            buffer_map.push_buf(addr, buf_size, i);
        }

        buffer_map.publish_bufs();
        buffer_map
    }

    fn push_buf(&mut self, addr: *mut u8, len: u32, bid: u16) {
        let entries = self.addr as *mut types::BufRingEntry;
        let index: u16 = self.private_tail & self.mask();

        let entry = unsafe { entries.add(index as usize) };
        let entry = unsafe { &mut *entry };

        entry.set_addr(addr as u64);
        entry.set_len(len);
        entry.set_bid(bid);

        self.private_tail = self.private_tail.wrapping_add(1);
    }

    fn publish_bufs(&mut self) {
        let base_entry = self.addr as *const types::BufRingEntry;
        let shared_tail = unsafe { types::BufRingEntry::tail(base_entry) };
        let shared_tail = shared_tail as *const AtomicU16;
        unsafe { (*shared_tail).store(self.private_tail, Ordering::Release) };
    }

    fn mask(&self) -> u16 {
        self.num_entries - 1
    }

    /// SAFETY: `id` must be one just reported on a completion, and must not
    /// already have been taken without being resubmitted.
    pub unsafe fn take_buf(&mut self, id: u16) -> Box<[u8]> {
        std::mem::take(&mut self.buffers[id as usize])
    }

    /// SAFETY: same requirements as `take_buf`.
    pub unsafe fn resubmit_buf(&mut self, mut buf: Box<[u8]>, id: u16) {
        self.push_buf(buf.as_mut_ptr(), self.buf_size, id);
        self.buffers[id as usize] = buf;
        self.publish_bufs();
    }
}
