// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Grow-on-demand framed byte buffers (§4.A). `InBuf` accumulates inbound
//! bytes from the transport; `OutBuf` stages outbound bytes for it. Both
//! draw their backing allocation from a size-tiered `BufferPool` and never
//! shrink -- only grow, one tier at a time, up to the large tier.

use ca_protocol::round_up;

/// The two allocation tiers a buffer can occupy. `Small` is sized for a
/// typical MTU; `Large` accommodates oversized payloads (e.g. big
/// waveforms). There is nothing above `Large` -- requests that don't fit
/// there fail with a protocol error the caller must surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Small,
    Large,
}

impl Tier {
    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::Small => Some(Tier::Large),
            Tier::Large => None,
        }
    }
}

/// A size-tiered allocator for `InBuf`/`OutBuf` backing storage. Stands in
/// for the source's free-list `casBufferFactory`; real pooling/reuse is an
/// optimization left to the transport layer, not a requirement the core
/// depends on (§9).
#[derive(Debug, Clone)]
pub struct BufferPool {
    small_size: u32,
    large_size: u32,
}

impl BufferPool {
    pub fn new(small_size: u32, large_size: u32) -> Self {
        assert!(large_size >= small_size, "large tier must not be smaller than small tier");
        Self {
            small_size,
            large_size,
        }
    }

    /// A pool with the defaults named in §4.A: a 16 KiB small tier, a
    /// 64 KiB large tier.
    pub fn with_defaults() -> Self {
        Self::new(16 * 1024, 64 * 1024)
    }

    pub fn size(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Small => self.small_size,
            Tier::Large => self.large_size,
        }
    }

    fn alloc(&self, tier: Tier) -> Vec<u8> {
        vec![0u8; self.size(tier) as usize]
    }
}

/// Result of a transport read attempt, mirroring `inBufClient::fillCondition`.
#[derive(Debug, PartialEq, Eq)]
pub enum FillOutcome {
    Read(usize),
    WouldBlock,
    Disconnect,
}

/// Result of a transport write attempt, mirroring `outBufClient::flushCondition`.
#[derive(Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    Wrote(usize),
    WouldBlock,
    Disconnect,
}

/// What the per-client frame loop sees after calling `InBuf::fill`.
#[derive(Debug, PartialEq, Eq)]
pub enum FillResult {
    Progress,
    None,
    Disconnect,
}

/// What the per-client frame loop sees after calling `OutBuf::flush`.
#[derive(Debug, PartialEq, Eq)]
pub enum FlushResult {
    Progress,
    None,
    Disconnect,
}

/// The transport seam `InBuf::fill` reads through. Implemented by whatever
/// owns the actual socket (out of scope here, §1).
pub trait Source {
    fn recv_into(&mut self, buf: &mut [u8]) -> FillOutcome;
}

/// The transport seam `OutBuf::flush` writes through.
pub trait Sink {
    fn send_from(&mut self, buf: &[u8]) -> FlushOutcome;
}

/// Inbound ring buffer: accumulates bytes from the transport until a
/// complete header (and payload) is available to parse.
pub struct InBuf {
    pool: BufferPool,
    tier: Tier,
    buf: Vec<u8>,
    /// Number of valid, unconsumed bytes at the front of `buf`.
    filled: usize,
    ctx_recurs_count: u32,
}

impl InBuf {
    pub fn new(pool: BufferPool) -> Self {
        let tier = Tier::Small;
        let buf = pool.alloc(tier);
        Self {
            pool,
            tier,
            buf,
            filled: 0,
            ctx_recurs_count: 0,
        }
    }

    pub fn bytes_present(&self) -> u32 {
        self.filled as u32
    }

    pub fn buffer_size(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn bytes_available(&self) -> u32 {
        self.buffer_size() - self.bytes_present()
    }

    pub fn full(&self) -> bool {
        self.bytes_available() == 0
    }

    fn grow(&mut self) -> bool {
        let Some(next) = self.tier.next() else {
            return false;
        };
        let mut new_buf = self.pool.alloc(next);
        new_buf[..self.filled].copy_from_slice(&self.buf[..self.filled]);
        self.buf = new_buf;
        self.tier = next;
        true
    }

    /// Ensure the buffer's total capacity is at least `needed` bytes,
    /// growing a tier at a time. Returns false if `needed` exceeds even the
    /// large tier.
    pub fn ensure_capacity(&mut self, needed: u32) -> bool {
        while self.buffer_size() < needed {
            if !self.grow() {
                return false;
            }
        }
        true
    }

    /// Read more bytes from `source` into whatever free space remains,
    /// growing first if the buffer is already full.
    pub fn fill(&mut self, source: &mut dyn Source) -> FillResult {
        if self.full() && !self.grow() {
            // No room and can't grow further: the caller is holding an
            // oversized unparsed message. That is a protocol error, not a
            // transport one, but from `fill`'s point of view there is
            // nothing more it can do.
            return FillResult::None;
        }

        let start = self.filled;
        let end = self.buf.len();
        match source.recv_into(&mut self.buf[start..end]) {
            FillOutcome::Read(0) => FillResult::Disconnect,
            FillOutcome::Read(n) => {
                self.filled += n;
                FillResult::Progress
            }
            FillOutcome::WouldBlock => FillResult::None,
            FillOutcome::Disconnect => FillResult::Disconnect,
        }
    }

    /// The unconsumed bytes currently buffered, for header/payload parsing.
    pub fn msg_ptr(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    /// Advance past a fully-parsed message, compacting the remainder to the
    /// front of the buffer.
    pub fn remove_msg(&mut self, n_bytes: u32) {
        let n = n_bytes as usize;
        assert!(n <= self.filled, "remove_msg beyond bytes_present");
        self.buf.copy_within(n..self.filled, 0);
        self.filled -= n;
    }

    /// Reserve a read-only subregion of the unread bytes for a nested
    /// protocol layer (§4.A). Returns a `NoSpace` context if fewer than
    /// `header_size + body_size` unread bytes are present; such a context
    /// must not be popped successfully.
    pub fn push_ctx(&mut self, header_size: u32, body_size: u32) -> InCtx {
        let need = header_size as u64 + body_size as u64;
        if (self.filled as u64) < need {
            return InCtx {
                result: CtxResult::NoSpace,
                header_size: 0,
                max_body_size: 0,
            };
        }
        self.ctx_recurs_count += 1;
        InCtx {
            result: CtxResult::Success,
            header_size,
            max_body_size: body_size,
        }
    }

    /// Pop a context previously returned by `push_ctx`, reporting how many
    /// body bytes the nested layer actually used.
    pub fn pop_ctx(&mut self, ctx: InCtx) -> u32 {
        assert_eq!(ctx.result, CtxResult::Success, "popped a NoSpace context");
        self.ctx_recurs_count -= 1;
        ctx.max_body_size
    }

    pub fn ctx_depth(&self) -> u32 {
        self.ctx_recurs_count
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CtxResult {
    Success,
    NoSpace,
}

#[derive(Debug)]
pub struct InCtx {
    result: CtxResult,
    header_size: u32,
    max_body_size: u32,
}

impl InCtx {
    pub fn is_no_space(&self) -> bool {
        matches!(self.result, CtxResult::NoSpace)
    }
}

/// A reservation made by `alloc_raw_msg` or `copy_in_header`, pending
/// `commit_raw_msg`/`commit_msg`. Only one reservation may be outstanding at
/// a time -- this is the single-writer-per-client invariant from §4.A, not a
/// lock.
enum Reservation {
    Raw { offset: usize, size: u32 },
    Header { offset: usize, header_len: u32, declared_payload: u32 },
}

/// Outbound ring buffer: stages bytes for the transport to drain.
pub struct OutBuf {
    pool: BufferPool,
    tier: Tier,
    buf: Vec<u8>,
    /// Write cursor / bytes currently staged. Named after the source's
    /// `outBuf::stack` member.
    stack: usize,
    ctx_recurs_count: u32,
    reserved: Option<Reservation>,
}

impl OutBuf {
    pub fn new(pool: BufferPool) -> Self {
        let tier = Tier::Small;
        let buf = pool.alloc(tier);
        Self {
            pool,
            tier,
            buf,
            stack: 0,
            ctx_recurs_count: 0,
            reserved: None,
        }
    }

    pub fn bytes_present(&self) -> u32 {
        self.stack as u32
    }

    pub fn buffer_size(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn bytes_available(&self) -> u32 {
        self.buffer_size() - self.bytes_present()
    }

    fn grow(&mut self) -> bool {
        let Some(next) = self.tier.next() else {
            return false;
        };
        let mut new_buf = self.pool.alloc(next);
        new_buf[..self.stack].copy_from_slice(&self.buf[..self.stack]);
        self.buf = new_buf;
        self.tier = next;
        true
    }

    fn ensure_capacity(&mut self, additional: u32) -> bool {
        while self.bytes_available() < additional {
            if !self.grow() {
                return false;
            }
        }
        true
    }

    /// Reserve space for exactly one message of `size` bytes. Returns the
    /// offset at which the caller should write, to be finalized with
    /// `commit_raw_msg`.
    pub fn alloc_raw_msg(&mut self, size: u32) -> Result<usize, ()> {
        assert!(self.reserved.is_none(), "alloc_raw_msg while a reservation is outstanding");
        if !self.ensure_capacity(size) {
            return Err(());
        }
        let offset = self.stack;
        self.reserved = Some(Reservation::Raw { offset, size });
        Ok(offset)
    }

    /// Mutable access to a previously-reserved region, for writing the
    /// message body.
    pub fn reserved_slice(&mut self) -> &mut [u8] {
        match self.reserved {
            Some(Reservation::Raw { offset, size }) => &mut self.buf[offset..offset + size as usize],
            Some(Reservation::Header { offset, header_len, declared_payload }) => {
                let start = offset + header_len as usize;
                let end = start + declared_payload as usize;
                &mut self.buf[start..end]
            }
            None => panic!("reserved_slice without an outstanding reservation"),
        }
    }

    /// Finalize a reservation made by `alloc_raw_msg`; `actual_size` may be
    /// less than the reserved size, but never more.
    pub fn commit_raw_msg(&mut self, actual_size: u32) {
        match self.reserved.take() {
            Some(Reservation::Raw { offset, size }) => {
                assert!(actual_size <= size);
                self.stack = offset + actual_size as usize;
            }
            _ => panic!("commit_raw_msg without a matching alloc_raw_msg"),
        }
    }

    /// Reserve space for a header plus its declared payload (rounded to the
    /// 8-byte alignment, §6), write the header, and return the offset at
    /// which the payload begins.
    pub fn copy_in_header(&mut self, hdr: &ca_protocol::Hdr) -> Result<usize, ()> {
        assert!(self.reserved.is_none(), "copy_in_header while a reservation is outstanding");
        let header_len = hdr.wire_len();
        let declared_payload = hdr.payload_size;
        let total = header_len + round_up(declared_payload, 8);

        if !self.ensure_capacity(total) {
            return Err(());
        }

        let offset = self.stack;
        let mut header_bytes = Vec::with_capacity(header_len as usize);
        hdr.encode(&mut header_bytes);
        self.buf[offset..offset + header_bytes.len()].copy_from_slice(&header_bytes);
        for b in &mut self.buf[offset + header_bytes.len()..offset + total as usize] {
            *b = 0;
        }

        self.reserved = Some(Reservation::Header {
            offset,
            header_len,
            declared_payload,
        });

        Ok(offset + header_len as usize)
    }

    /// Finalize a reservation made by `copy_in_header`, patching the
    /// header's `payload_size` field down to the actual size used (which
    /// can never grow the header's short/extended form, since it can only
    /// shrink from the declared size).
    pub fn commit_msg(&mut self, actual_payload_size: u32) {
        match self.reserved.take() {
            Some(Reservation::Header {
                offset,
                header_len,
                declared_payload,
            }) => {
                assert!(actual_payload_size <= declared_payload);
                if header_len == 16 {
                    self.buf[offset + 2..offset + 4]
                        .copy_from_slice(&(actual_payload_size as u16).to_be_bytes());
                } else {
                    self.buf[offset + 16..offset + 20]
                        .copy_from_slice(&actual_payload_size.to_be_bytes());
                }
                let actual_total = header_len + round_up(actual_payload_size, 8);
                self.stack = offset + actual_total as usize;
            }
            _ => panic!("commit_msg without a matching copy_in_header"),
        }
    }

    /// Reserve a nested subregion (`header_size + max_body_size` bytes) for
    /// a lower protocol layer to write into (§4.A). Fails with a `NoSpace`
    /// context, which must not be popped successfully, if there isn't room
    /// even after growing to the large tier.
    pub fn push_ctx(&mut self, header_size: u32, max_body_size: u32) -> OutCtx {
        let total = header_size + max_body_size;
        if !self.ensure_capacity(total) {
            return OutCtx {
                result: CtxResult::NoSpace,
                offset: 0,
                header_size: 0,
                max_body_size: 0,
            };
        }

        let offset = self.stack;
        self.stack += total as usize;
        self.ctx_recurs_count += 1;

        OutCtx {
            result: CtxResult::Success,
            offset,
            header_size,
            max_body_size,
        }
    }

    /// Install the actual payload size once known, shrinking the reserved
    /// subregion down to `header_size + body_used` bytes. Returns the total
    /// bytes (header + body) actually used.
    pub fn pop_ctx(&mut self, ctx: OutCtx, body_used: u32) -> u32 {
        assert_eq!(ctx.result, CtxResult::Success, "popped a NoSpace context");
        assert!(body_used <= ctx.max_body_size);
        self.ctx_recurs_count -= 1;
        self.stack = ctx.offset + ctx.header_size as usize + body_used as usize;
        ctx.header_size + body_used
    }

    pub fn ctx_buf_mut(&mut self, ctx: &OutCtx) -> &mut [u8] {
        let start = ctx.offset + ctx.header_size as usize;
        let end = start + ctx.max_body_size as usize;
        &mut self.buf[start..end]
    }

    /// Drain staged bytes to the transport. `space_required` is a hint: if
    /// fewer than that many bytes remain free after draining, the buffer
    /// grows preemptively so the next reservation won't need to.
    pub fn flush(&mut self, sink: &mut dyn Sink, space_required: u32) -> FlushResult {
        let mut result = FlushResult::None;

        if self.stack > 0 {
            match sink.send_from(&self.buf[..self.stack]) {
                FlushOutcome::Wrote(0) => {}
                FlushOutcome::Wrote(n) => {
                    self.buf.copy_within(n..self.stack, 0);
                    self.stack -= n;
                    result = FlushResult::Progress;
                }
                FlushOutcome::WouldBlock => {}
                FlushOutcome::Disconnect => return FlushResult::Disconnect,
            }
        }

        if self.bytes_available() < space_required {
            self.ensure_capacity(space_required);
        }

        result
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct OutCtx {
    result: CtxResult,
    offset: usize,
    header_size: u32,
    max_body_size: u32,
}

impl OutCtx {
    pub fn is_no_space(&self) -> bool {
        matches!(self.result, CtxResult::NoSpace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;
    impl Sink for NullSink {
        fn send_from(&mut self, buf: &[u8]) -> FlushOutcome {
            FlushOutcome::Wrote(buf.len())
        }
    }

    struct BlockingSink;
    impl Sink for BlockingSink {
        fn send_from(&mut self, _buf: &[u8]) -> FlushOutcome {
            FlushOutcome::WouldBlock
        }
    }

    struct ChunkSource {
        chunks: Vec<Vec<u8>>,
    }
    impl Source for ChunkSource {
        fn recv_into(&mut self, buf: &mut [u8]) -> FillOutcome {
            if self.chunks.is_empty() {
                return FillOutcome::WouldBlock;
            }
            let chunk = self.chunks.remove(0);
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            FillOutcome::Read(n)
        }
    }

    #[test]
    fn alloc_commit_raw_msg_shrinks_correctly() {
        let mut out = OutBuf::new(BufferPool::new(64, 256));
        let offset = out.alloc_raw_msg(32).unwrap();
        out.reserved_slice()[0] = 7;
        out.commit_raw_msg(10);
        assert_eq!(out.bytes_present(), (offset + 10) as u32);
    }

    #[test]
    fn push_pop_ctx_matches_invariant() {
        let mut out = OutBuf::new(BufferPool::new(64, 256));
        let pre = out.bytes_present();
        let ctx = out.push_ctx(8, 40);
        assert!(!ctx.is_no_space());
        let used = out.pop_ctx(ctx, 12);
        assert_eq!(used, 8 + 12);
        assert_eq!(out.bytes_present(), pre + 8 + 12);
    }

    #[test]
    fn out_buf_grows_past_small_tier() {
        let pool = BufferPool::new(64, 256);
        let mut out = OutBuf::new(pool);
        assert_eq!(out.buffer_size(), 64);
        let offset = out.alloc_raw_msg(200).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(out.buffer_size(), 256);
        out.commit_raw_msg(200);
    }

    #[test]
    fn out_buf_fails_past_large_tier() {
        let mut out = OutBuf::new(BufferPool::new(64, 256));
        assert!(out.alloc_raw_msg(1000).is_err());
    }

    #[test]
    fn flush_drains_and_preallocates_space() {
        let mut out = OutBuf::new(BufferPool::new(64, 256));
        let off = out.alloc_raw_msg(10).unwrap();
        out.reserved_slice()[0] = 1;
        let _ = off;
        out.commit_raw_msg(10);

        let mut sink = NullSink;
        let result = out.flush(&mut sink, 0);
        assert_eq!(result, FlushResult::Progress);
        assert_eq!(out.bytes_present(), 0);
    }

    #[test]
    fn flush_reports_none_when_blocked() {
        let mut out = OutBuf::new(BufferPool::new(64, 256));
        out.alloc_raw_msg(10).unwrap();
        out.commit_raw_msg(10);

        let mut sink = BlockingSink;
        let result = out.flush(&mut sink, 0);
        assert_eq!(result, FlushResult::None);
        assert_eq!(out.bytes_present(), 10);
    }

    #[test]
    fn in_buf_fill_and_remove_msg() {
        let mut inb = InBuf::new(BufferPool::new(64, 256));
        let mut source = ChunkSource {
            chunks: vec![vec![1, 2, 3, 4]],
        };
        assert_eq!(inb.fill(&mut source), FillResult::Progress);
        assert_eq!(inb.bytes_present(), 4);
        assert_eq!(inb.msg_ptr(), &[1, 2, 3, 4]);

        inb.remove_msg(2);
        assert_eq!(inb.bytes_present(), 2);
        assert_eq!(inb.msg_ptr(), &[3, 4]);
    }

    #[test]
    fn in_buf_grows_to_fit_oversized_message() {
        // Boundary scenario 2: a 200,000-byte WRITE body with a 16 KiB
        // initial InBuf.
        let mut inb = InBuf::new(BufferPool::new(16 * 1024, 256 * 1024));
        assert_eq!(inb.buffer_size(), 16 * 1024);
        assert!(inb.ensure_capacity(200_000 + 16));
        assert_eq!(inb.buffer_size(), 256 * 1024);
    }

    #[test]
    fn in_buf_disconnect_on_zero_read() {
        let mut inb = InBuf::new(BufferPool::new(64, 256));
        struct EofSource;
        impl Source for EofSource {
            fn recv_into(&mut self, _buf: &mut [u8]) -> FillOutcome {
                FillOutcome::Read(0)
            }
        }
        assert_eq!(inb.fill(&mut EofSource), FillResult::Disconnect);
    }
}
