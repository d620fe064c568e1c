// This module implements the encoding slot: the per-thread cell holding the live case
// encoding that dispatch code compares against. At instrumentation time there is a single
// EncodingSlot descriptor, built from the raw TLS block the engine reserved from the host;
// at run time every thread reads and writes its own instance through the host allocator.
// Besides the encoding itself the reservation carries the spill slots dispatch uses to
// save the application's scratch register, arithmetic flags and wide-compare register, so
// dispatch never touches application memory. The descriptor hands out segment-relative
// memory operands for generated stores and loads. RuntimeCtx is what a clean-call helper
// receives while it runs, and it is the only way to reach `set_encoding` from helpers.

//! Per-thread storage of the runtime case encoding.

use iced_x86::{Instruction, MemoryOperand, Register};

use super::error::{DupError, DupResult};
use super::host::{TlsAllocator, TlsBlock};
use crate::x64::meta;

/// Pointer-sized case encoding.
pub type CaseEncoding = usize;

/// Number of raw TLS slots the engine reserves.
pub const DUP_TLS_SLOTS: u32 = 4;

/// Slots inside the engine's TLS reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotIndex {
    /// Live case encoding.
    Encoding = 0,
    /// Application value of the dispatch scratch register.
    ScratchSpill = 1,
    /// Application arithmetic flags (`lahf` image and overflow flag).
    FlagsSpill = 2,
    /// Application value of the register used for 64-bit compares.
    WideSpill = 3,
}

/// Descriptor of the encoding slot and its companion spill slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingSlot {
    block: TlsBlock,
}

impl EncodingSlot {
    pub(crate) fn new(block: TlsBlock) -> DupResult<Self> {
        if block.count < DUP_TLS_SLOTS {
            return Err(DupError::invalid(format!(
                "TLS block has {} slots, {} needed",
                block.count, DUP_TLS_SLOTS
            )));
        }
        Ok(Self { block })
    }

    /// The underlying TLS reservation.
    pub fn tls_block(&self) -> TlsBlock {
        self.block
    }

    /// Segment-relative offset of the encoding slot.
    pub fn offset(&self) -> u32 {
        self.offset_of(SlotIndex::Encoding)
    }

    /// Segment-relative offset of one of the engine's slots.
    pub fn offset_of(&self, index: SlotIndex) -> u32 {
        self.block.base_offset + index as u32 * super::host::TLS_SLOT_SIZE
    }

    /// Identify which engine slot `offset` addresses.
    pub fn slot_at(&self, offset: u32) -> Option<SlotIndex> {
        [
            SlotIndex::Encoding,
            SlotIndex::ScratchSpill,
            SlotIndex::FlagsSpill,
            SlotIndex::WideSpill,
        ]
        .into_iter()
        .find(|&s| self.offset_of(s) == offset)
    }

    /// Memory operand addressing the encoding slot, for direct stores.
    pub fn operand(&self) -> MemoryOperand {
        self.operand_of(SlotIndex::Encoding)
    }

    pub(crate) fn operand_of(&self, index: SlotIndex) -> MemoryOperand {
        MemoryOperand::new(
            Register::None,
            Register::None,
            1,
            self.offset_of(index) as i64,
            8,
            false,
            self.block.segment,
        )
    }

    /// Meta instruction storing `value` into the encoding slot.
    ///
    /// The store sign-extends a 32-bit immediate; values outside that range
    /// must be written through a clean call instead.
    pub fn store_imm(&self, value: CaseEncoding) -> DupResult<Instruction> {
        let imm = meta::imm32(value).ok_or_else(|| {
            DupError::invalid(format!("encoding {value:#x} does not fit a sign-extended imm32"))
        })?;
        meta::store_imm(self.operand(), imm)
    }

    /// The calling thread's current encoding.
    pub fn get(&self, tls: &dyn TlsAllocator) -> CaseEncoding {
        tls.read_slot(self.offset())
    }

    /// Write the calling thread's encoding.
    pub fn set(&self, tls: &dyn TlsAllocator, value: CaseEncoding) {
        tls.write_slot(self.offset(), value);
    }
}

/// Context handed to a clean-call helper while it runs.
pub struct RuntimeCtx<'a> {
    slot: &'a EncodingSlot,
    tls: &'a dyn TlsAllocator,
}

impl<'a> RuntimeCtx<'a> {
    /// Used by whatever executes clean calls (host runtime or tracer).
    pub fn new(slot: &'a EncodingSlot, tls: &'a dyn TlsAllocator) -> Self {
        Self { slot, tls }
    }

    /// Set the live encoding of the current thread.
    pub fn set_encoding(&self, encoding: CaseEncoding) {
        log::trace!("set_encoding({:#x}) on {:?}", encoding, std::thread::current().id());
        self.slot.set(self.tls, encoding);
    }

    /// Current live encoding of this thread.
    pub fn encoding(&self) -> CaseEncoding {
        self.slot.get(self.tls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::host::ThreadLocalTls;
    use iced_x86::Code;

    fn slot(tls: &ThreadLocalTls) -> EncodingSlot {
        EncodingSlot::new(tls.reserve("bbdup", DUP_TLS_SLOTS).unwrap()).unwrap()
    }

    #[test]
    fn test_slot_layout() {
        let tls = ThreadLocalTls::new();
        let slot = slot(&tls);
        let base = ThreadLocalTls::DEFAULT_BASE;
        assert_eq!(slot.offset(), base);
        assert_eq!(slot.offset_of(SlotIndex::ScratchSpill), base + 8);
        assert_eq!(slot.offset_of(SlotIndex::WideSpill), base + 24);
        assert_eq!(slot.slot_at(base + 16), Some(SlotIndex::FlagsSpill));
        assert_eq!(slot.slot_at(base + 32), None);
    }

    #[test]
    fn test_rejects_small_reservation() {
        let tls = ThreadLocalTls::new();
        let block = tls.reserve("small", 2).unwrap();
        assert!(EncodingSlot::new(block).is_err());
    }

    #[test]
    fn test_operand_is_segment_relative() {
        let tls = ThreadLocalTls::new();
        let slot = slot(&tls);
        let op = slot.operand();
        assert_eq!(op.segment_prefix, Register::GS);
        assert_eq!(op.base, Register::None);
        assert_eq!(op.displacement, slot.offset() as i64);
    }

    #[test]
    fn test_store_imm() {
        let tls = ThreadLocalTls::new();
        let slot = slot(&tls);
        let store = slot.store_imm(5).unwrap();
        assert_eq!(store.code(), Code::Mov_rm64_imm32);
        assert_eq!(store.memory_segment(), Register::GS);
        assert_eq!(store.memory_displacement64(), slot.offset() as u64);
        assert_eq!(store.immediate32to64(), 5);

        assert!(slot.store_imm(usize::MAX).is_ok());
        assert!(slot.store_imm(0x1_0000_0000).is_err());
    }

    #[test]
    fn test_runtime_ctx_sets_current_thread() {
        let tls = ThreadLocalTls::new();
        let slot = slot(&tls);
        let ctx = RuntimeCtx::new(&slot, &tls);
        assert_eq!(ctx.encoding(), 0);
        ctx.set_encoding(42);
        assert_eq!(slot.get(&tls), 42);
        assert_eq!(tls.read_slot(slot.offset()), 42);
    }
}
