//! In-memory translation engine.
//!
//! Keeps block descriptors only, no code is generated. Used when the fork
//! server drives a native command, and to observe what the relay asks for.
use crate::config::AddrRange;
use crate::tsl::{BlockKey, GuestUlong, TranslationEngine};

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

/// Number of patchable exits of a block.
pub const EXIT_SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(usize);

#[derive(Debug, Clone)]
struct Block {
    key: BlockKey,
    cf_mask: u32,
    exits: [Option<BlockId>; EXIT_SLOTS],
}

#[derive(Debug)]
pub struct MemEngine {
    cache: FxHashMap<BlockKey, BlockId>,
    blocks: Vec<Block>,
    valid: Vec<AddrRange>,
    generated: u64,
    fork_handlers: bool,
    mmap_lock: Arc<Mutex<()>>,
}

impl MemEngine {
    /// Engine accepting code in `valid` ranges only.
    pub fn new(valid: Vec<AddrRange>) -> Self {
        Self {
            cache: FxHashMap::default(),
            blocks: Vec::new(),
            valid,
            generated: 0,
            fork_handlers: true,
            mmap_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Number of blocks synthesized over the engine's life.
    pub fn generated(&self) -> u64 {
        self.generated
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn fork_handlers_enabled(&self) -> bool {
        self.fork_handlers
    }

    pub fn key(&self, block: BlockId) -> Option<BlockKey> {
        self.blocks.get(block.0).map(|b| b.key)
    }

    pub fn cf_mask(&self, block: BlockId) -> Option<u32> {
        self.blocks.get(block.0).map(|b| b.cf_mask)
    }

    /// Block linked at exit `slot` of `block`.
    pub fn successor(&self, block: BlockId, slot: u32) -> Option<BlockId> {
        self.blocks
            .get(block.0)
            .and_then(|b| b.exits.get(slot as usize).copied().flatten())
    }
}

impl TranslationEngine for MemEngine {
    type Block = BlockId;

    fn lookup(&mut self, key: &BlockKey, _cf_mask: u32) -> Option<BlockId> {
        self.cache.get(key).copied()
    }

    fn is_valid_addr(&self, pc: GuestUlong) -> bool {
        self.valid.iter().any(|r| r.contains(pc))
    }

    fn generate(&mut self, key: &BlockKey, cf_mask: u32) -> Option<BlockId> {
        let id = BlockId(self.blocks.len());
        self.blocks.push(Block {
            key: *key,
            cf_mask,
            exits: [None; EXIT_SLOTS],
        });
        self.cache.insert(*key, id);
        self.generated += 1;
        Some(id)
    }

    fn has_exit_slot(&self, block: BlockId, slot: u32) -> bool {
        self.blocks.get(block.0).is_some() && (slot as usize) < EXIT_SLOTS
    }

    fn link(&mut self, from: BlockId, slot: u32, to: BlockId) {
        if let Some(b) = self.blocks.get_mut(from.0) {
            if let Some(exit) = b.exits.get_mut(slot as usize) {
                *exit = Some(to);
            }
        }
    }

    fn critical<T, F>(&mut self, f: F) -> T
    where
        F: FnOnce(&mut Self) -> T,
    {
        let lock = Arc::clone(&self.mmap_lock);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        f(self)
    }

    fn disable_fork_handlers(&mut self) {
        self.fork_handlers = false;
    }
}
