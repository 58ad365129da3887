//! Translation cache relay.
//!
//! A child can not keep what it translates, everything is lost on exit. So it
//! reports every block it translates to the controller through a private pipe,
//! and the controller translates the same block in its own address space,
//! where the next forked child will find it already cached.
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};

use bytes::{Buf, BufMut};

/// Guest address, wide enough for every supported guest.
pub type GuestUlong = u64;

/// Program counter of the exit marker record.
pub const INVALID_PC: GuestUlong = GuestUlong::MAX;

/// Complete cache key of a translated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockKey {
    pub pc: GuestUlong,
    pub cs_base: GuestUlong,
    pub flags: u32,
}

impl BlockKey {
    pub const fn new(pc: GuestUlong, cs_base: GuestUlong, flags: u32) -> Self {
        Self { pc, cs_base, flags }
    }
}

/// Request to translate one block, optionally followed by a [`ChainRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationRequest {
    pub block: BlockKey,
    pub cf_mask: u32,
    pub is_chain: bool,
}

/// Request to link the exit `exit_slot` of block `last` to the block of the
/// preceding [`TranslationRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRequest {
    pub last: BlockKey,
    pub cf_mask: u32,
    pub exit_slot: u32,
}

impl TranslationRequest {
    /// Encoded size: pc, cs_base, flags, cf_mask, is_chain.
    pub const SIZE: usize = 8 + 8 + 4 + 4 + 1;

    pub fn new(block: BlockKey, cf_mask: u32) -> Self {
        Self {
            block,
            cf_mask,
            is_chain: false,
        }
    }

    /// Record that ends the relay stream of one persistent iteration.
    pub fn exit_marker() -> Self {
        Self::new(BlockKey::new(INVALID_PC, 0, 0), 0)
    }

    pub fn is_exit_marker(&self) -> bool {
        self.block.pc == INVALID_PC
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        put_key(buf, &self.block);
        put_u32(buf, self.cf_mask);
        buf.put_u8(self.is_chain as u8);
    }

    pub fn decode(raw: &[u8; Self::SIZE]) -> Self {
        let mut buf = &raw[..];
        let block = get_key(&mut buf);
        let cf_mask = get_u32(&mut buf);
        let is_chain = buf.get_u8() != 0;
        Self {
            block,
            cf_mask,
            is_chain,
        }
    }
}

impl ChainRequest {
    /// Encoded size: last pc, last cs_base, last flags, cf_mask, exit_slot.
    pub const SIZE: usize = 8 + 8 + 4 + 4 + 4;

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        put_key(buf, &self.last);
        put_u32(buf, self.cf_mask);
        put_u32(buf, self.exit_slot);
    }

    pub fn decode(raw: &[u8; Self::SIZE]) -> Self {
        let mut buf = &raw[..];
        let last = get_key(&mut buf);
        let cf_mask = get_u32(&mut buf);
        let exit_slot = get_u32(&mut buf);
        Self {
            last,
            cf_mask,
            exit_slot,
        }
    }
}

// Records are in host byte order, both ends always run on the same host.
fn put_key<B: BufMut>(buf: &mut B, key: &BlockKey) {
    if cfg!(target_endian = "little") {
        buf.put_u64_le(key.pc);
        buf.put_u64_le(key.cs_base);
    } else {
        buf.put_u64(key.pc);
        buf.put_u64(key.cs_base);
    }
    put_u32(buf, key.flags);
}

fn put_u32<B: BufMut>(buf: &mut B, val: u32) {
    if cfg!(target_endian = "little") {
        buf.put_u32_le(val)
    } else {
        buf.put_u32(val)
    }
}

fn get_key<B: Buf>(buf: &mut B) -> BlockKey {
    let (pc, cs_base) = if cfg!(target_endian = "little") {
        (buf.get_u64_le(), buf.get_u64_le())
    } else {
        (buf.get_u64(), buf.get_u64())
    };
    let flags = get_u32(buf);
    BlockKey { pc, cs_base, flags }
}

fn get_u32<B: Buf>(buf: &mut B) -> u32 {
    if cfg!(target_endian = "little") {
        buf.get_u32_le()
    } else {
        buf.get_u32()
    }
}

/// Block cache of the emulator, as seen by the relay.
pub trait TranslationEngine {
    /// Handle of a translated block.
    type Block: Copy;

    fn lookup(&mut self, key: &BlockKey, cf_mask: u32) -> Option<Self::Block>;

    /// Can the code at `pc` be read in current address space?
    fn is_valid_addr(&self, pc: GuestUlong) -> bool;

    /// Translate a new block, None if synthesis failed.
    fn generate(&mut self, key: &BlockKey, cf_mask: u32) -> Option<Self::Block>;

    /// Does `block` have a patchable exit at `slot`?
    fn has_exit_slot(&self, block: Self::Block, slot: u32) -> bool;

    /// Patch exit `slot` of `from` to jump to `to` directly.
    fn link(&mut self, from: Self::Block, slot: u32, to: Self::Block);

    /// Run `f` while holding the lock that guards the block structures.
    fn critical<T, F>(&mut self, f: F) -> T
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> T,
    {
        f(self)
    }

    /// Stop re-initialising global locks in forked children, the fork server
    /// takes care of fork safety itself.
    fn disable_fork_handlers(&mut self) {}
}

/// Child side of the relay.
///
/// All writes are best effort, after the first failure the writer turns into
/// a no-op for the rest of the process life.
pub struct RelayWriter {
    sink: Option<Box<dyn Write + Send>>,
    records: u64,
    exits: u64,
    buf: Vec<u8>,
}

impl RelayWriter {
    /// Writer that drops everything.
    pub fn disconnected() -> Self {
        Self {
            sink: None,
            records: 0,
            exits: 0,
            buf: Vec::with_capacity(TranslationRequest::SIZE + ChainRequest::SIZE),
        }
    }

    pub fn new<W: Write + Send + 'static>(sink: W) -> Self {
        let mut w = Self::disconnected();
        w.sink = Some(Box::new(sink));
        w
    }

    /// Take ownership of the inherited relay descriptor.
    ///
    /// # Safety
    /// `fd` must be an open descriptor owned by nobody else.
    pub unsafe fn from_fd(fd: RawFd) -> Self {
        Self::new(File::from_raw_fd(fd))
    }

    pub fn is_connected(&self) -> bool {
        self.sink.is_some()
    }

    /// Number of translation records delivered, exit markers excluded.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Number of exit markers delivered.
    pub fn exits(&self) -> u64 {
        self.exits
    }

    /// Report a translated block, with its predecessor if it was chained.
    pub fn send(&mut self, block: BlockKey, cf_mask: u32, pred: Option<(BlockKey, u32)>) {
        if self.sink.is_none() {
            return;
        }
        let mut req = TranslationRequest::new(block, cf_mask);
        req.is_chain = pred.is_some();
        self.buf.clear();
        req.encode(&mut self.buf);
        if let Some((last, exit_slot)) = pred {
            let chain = ChainRequest {
                last,
                cf_mask,
                exit_slot,
            };
            chain.encode(&mut self.buf);
        }
        if self.flush() {
            self.records += 1;
        }
    }

    /// Tell the controller that current iteration is over, false if the relay is gone.
    pub fn send_exit(&mut self) -> bool {
        if self.sink.is_none() {
            return false;
        }
        self.buf.clear();
        TranslationRequest::exit_marker().encode(&mut self.buf);
        if self.flush() {
            self.exits += 1;
            true
        } else {
            false
        }
    }

    // base and chain record go out in one write, so they can not be split by
    // a failure in between.
    fn flush(&mut self) -> bool {
        let ok = match self.sink.as_mut() {
            Some(sink) => sink.write_all(&self.buf).is_ok(),
            None => false,
        };
        if !ok {
            self.sink = None;
        }
        ok
    }
}

impl std::fmt::Debug for RelayWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayWriter")
            .field("connected", &self.is_connected())
            .field("records", &self.records)
            .field("exits", &self.exits)
            .finish()
    }
}

/// Why draining stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Pipe closed or short read, the child is gone or about to be.
    Eof,
    /// Child finished one persistent iteration.
    ExitMarker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub requests: u64,
    pub generated: u64,
    pub invalid: u64,
    pub chained: u64,
    pub end: RelayEnd,
}

impl Default for RelayStats {
    fn default() -> Self {
        Self {
            requests: 0,
            generated: 0,
            invalid: 0,
            chained: 0,
            end: RelayEnd::Eof,
        }
    }
}

enum Translated<B> {
    Cached(B),
    Generated(B),
    Invalid,
}

/// Controller side of the relay: serve requests until EOF or an exit marker.
pub fn drain_relay<E, R>(engine: &mut E, relay: &mut R) -> RelayStats
where
    E: TranslationEngine,
    R: Read,
{
    let mut stats = RelayStats::default();
    let mut raw = [0; TranslationRequest::SIZE];
    let mut raw_chain = [0; ChainRequest::SIZE];

    loop {
        if let Err(e) = relay.read_exact(&mut raw) {
            log_short_read(&e);
            break;
        }
        let req = TranslationRequest::decode(&raw);
        if req.is_exit_marker() {
            stats.end = RelayEnd::ExitMarker;
            break;
        }
        stats.requests += 1;

        let translated = engine.critical(|e| match e.lookup(&req.block, req.cf_mask) {
            Some(tb) => Translated::Cached(tb),
            None if e.is_valid_addr(req.block.pc) => match e.generate(&req.block, req.cf_mask) {
                Some(tb) => Translated::Generated(tb),
                None => Translated::Invalid,
            },
            None => Translated::Invalid,
        });
        let tb = match translated {
            Translated::Cached(tb) => Some(tb),
            Translated::Generated(tb) => {
                stats.generated += 1;
                Some(tb)
            }
            Translated::Invalid => {
                log::debug!("skipping invalid pc {:#x}", req.block.pc);
                stats.invalid += 1;
                None
            }
        };

        if req.is_chain {
            if let Err(e) = relay.read_exact(&mut raw_chain) {
                log_short_read(&e);
                break;
            }
            let chain = ChainRequest::decode(&raw_chain);
            if let Some(tb) = tb {
                // predecessor may be gone, chaining is only an optimization.
                if let Some(last) = engine.lookup(&chain.last, chain.cf_mask) {
                    if engine.has_exit_slot(last, chain.exit_slot) {
                        engine.link(last, chain.exit_slot, tb);
                        stats.chained += 1;
                    }
                }
            }
        }
    }

    stats
}

fn log_short_read(e: &io::Error) {
    if e.kind() != io::ErrorKind::UnexpectedEof {
        log::debug!("relay read: {}", e);
    }
}
