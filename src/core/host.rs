// This module defines the host-side services the duplication engine depends on without
// owning them. TlsAllocator is the bridge to the host's thread-local storage allocator:
// the engine reserves a block of raw pointer-sized slots under its name, generated code
// addresses them through a segment register, and runtime helpers read and write the
// calling thread's instance by offset. A second reservation under the same owner name is
// how the host reports that the engine is already initialised. ThreadLocalTls is a
// self-contained implementation backed by a thread_local map, used by tests and the CLI.
// Dropping an allocator purges the dropping thread's entries for it; entries other threads
// wrote go away when those threads exit.
// BlockPass is the hook shape the host's pass scheduler drives for every new block.

//! Host services consumed by the engine.
//!
//! The engine only needs three things from the instrumentation host:
//! - Raw thread-local slots it can address from generated code.
//! - A way to read and write the calling thread's slot from runtime helpers.
//! - A pass hook invoked for every fresh basic block.
//!
//! Block fetch/decode lives in [`super::instr`], clean-call lowering in
//! [`crate::x64`].

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use hashbrown::HashMap;
use iced_x86::Register;
use thiserror::Error;

use super::error::DupResult;
use super::instr::InstrList;

/// Size of one raw TLS slot in bytes.
pub const TLS_SLOT_SIZE: u32 = 8;

/// Errors reported by host services.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("TLS slots already reserved by {owner}")]
    AlreadyReserved { owner: &'static str },

    #[error("No TLS slots reserved by {owner}")]
    NotReserved { owner: &'static str },

    #[error("TLS exhausted: requested {requested} slots, {available} available")]
    Exhausted { requested: u32, available: u32 },
}

/// A contiguous block of raw TLS slots reserved by one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsBlock {
    /// Segment register generated code uses to address the slots.
    pub segment: Register,
    /// Segment-relative offset of the first slot.
    pub base_offset: u32,
    /// Number of pointer-sized slots.
    pub count: u32,
}

impl TlsBlock {
    /// Segment-relative offset of slot `index`, if it is inside the block.
    pub fn offset_of(&self, index: u32) -> Option<u32> {
        (index < self.count).then(|| self.base_offset + index * TLS_SLOT_SIZE)
    }

    /// Whether `offset` addresses one of this block's slots.
    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.base_offset
            && offset < self.base_offset + self.count * TLS_SLOT_SIZE
            && (offset - self.base_offset) % TLS_SLOT_SIZE == 0
    }
}

/// The host's thread-local storage allocator.
///
/// Reservations are process-wide; slot values are per thread. Reading a slot
/// the calling thread never wrote yields whatever the host left there (zero for
/// [`ThreadLocalTls`]).
pub trait TlsAllocator: Send + Sync {
    /// Reserve `count` raw slots for `owner`.
    fn reserve(&self, owner: &'static str, count: u32) -> Result<TlsBlock, HostError>;

    /// Release the slots reserved by `owner`.
    fn release(&self, owner: &'static str) -> Result<(), HostError>;

    /// Read the calling thread's slot at `offset`.
    fn read_slot(&self, offset: u32) -> usize;

    /// Write the calling thread's slot at `offset`.
    fn write_slot(&self, offset: u32, value: usize);
}

/// Hook invoked by the host's pass scheduler for every new basic block.
pub trait BlockPass {
    /// Pass name used for ordering relative to other passes.
    fn name(&self) -> &'static str;

    /// Pass priority; lower runs earlier.
    fn priority(&self) -> i32;

    /// Transform the block. `tag` identifies the block to the host.
    fn instrument_block(&mut self, tag: u64, bb: InstrList) -> DupResult<InstrList>;
}

static NEXT_TLS_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    // Keyed by (allocator id, offset) so independent allocators never alias.
    static THREAD_SLOTS: RefCell<HashMap<(usize, u32), usize>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Default)]
struct Reservations {
    owners: HashMap<&'static str, TlsBlock>,
    next_free: u32,
}

/// Thread-local storage allocator backed by Rust `thread_local!` storage.
///
/// Offsets mimic `gs`-relative raw slots of a DBI runtime. Each instance has
/// its own id, so several allocators can coexist in one process (each test
/// gets a fresh one).
///
/// Dropping the allocator clears the dropping thread's slots. Slots written by
/// other threads live until those threads exit.
#[derive(Debug)]
pub struct ThreadLocalTls {
    id: usize,
    base_offset: u32,
    capacity: u32,
    state: Mutex<Reservations>,
}

impl ThreadLocalTls {
    /// Default segment-relative offset of the first slot.
    pub const DEFAULT_BASE: u32 = 0x80;
    /// Default number of slots available.
    pub const DEFAULT_CAPACITY: u32 = 64;

    /// Create an allocator with the default layout.
    pub fn new() -> Self {
        Self::with_layout(Self::DEFAULT_BASE, Self::DEFAULT_CAPACITY)
    }

    /// Create an allocator whose slots start at `base_offset`.
    pub fn with_layout(base_offset: u32, capacity: u32) -> Self {
        Self {
            id: NEXT_TLS_ID.fetch_add(1, Ordering::Relaxed),
            base_offset,
            capacity,
            state: Mutex::new(Reservations::default()),
        }
    }

    /// Slots still available for reservation.
    pub fn available(&self) -> u32 {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.capacity - state.next_free
    }
}

impl Default for ThreadLocalTls {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsAllocator for ThreadLocalTls {
    fn reserve(&self, owner: &'static str, count: u32) -> Result<TlsBlock, HostError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.owners.contains_key(owner) {
            return Err(HostError::AlreadyReserved { owner });
        }
        let available = self.capacity - state.next_free;
        if count > available {
            return Err(HostError::Exhausted { requested: count, available });
        }

        let block = TlsBlock {
            segment: Register::GS,
            base_offset: self.base_offset + state.next_free * TLS_SLOT_SIZE,
            count,
        };
        state.next_free += count;
        state.owners.insert(owner, block);
        log::debug!("TLS: reserved {} slots at {:#x} for {}", count, block.base_offset, owner);
        Ok(block)
    }

    fn release(&self, owner: &'static str) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        // Slots are not recycled; a released range stays unused.
        match state.owners.remove(owner) {
            Some(block) => {
                log::debug!("TLS: released {} slots at {:#x} for {}", block.count, block.base_offset, owner);
                Ok(())
            }
            None => Err(HostError::NotReserved { owner }),
        }
    }

    fn read_slot(&self, offset: u32) -> usize {
        THREAD_SLOTS.with(|slots| slots.borrow().get(&(self.id, offset)).copied().unwrap_or(0))
    }

    fn write_slot(&self, offset: u32, value: usize) {
        THREAD_SLOTS.with(|slots| {
            slots.borrow_mut().insert((self.id, offset), value);
        });
    }
}

impl Drop for ThreadLocalTls {
    fn drop(&mut self) {
        // try_with: the thread's map may already be gone during thread exit.
        let _ = THREAD_SLOTS.try_with(|slots| {
            slots.borrow_mut().retain(|&(id, _), _| id != self.id);
        });
    }
}

/// Slots the calling thread holds for allocator `id`.
#[cfg(test)]
fn thread_entries(id: usize) -> usize {
    THREAD_SLOTS.with(|slots| slots.borrow().keys().filter(|(owner, _)| *owner == id).count())
}
