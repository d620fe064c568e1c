// This module emits the runtime dispatcher placed ahead of all copies of a duplicated block.
// The sequence starts with the encode region, built by the user's insert_encode callback
// through an EncodeRegion, which is expected to leave the live encoding in the slot. The
// engine then saves the application's scratch register and arithmetic flags into its TLS
// spill slots (plus a second register when some case value needs a 64-bit compare), loads
// the slot into the scratch register, and compares it against every registered case in
// registration order, each match branching to the entry label of that case's copy.
// Nothing matching falls through into the default copy, which is laid out directly after
// the compare chain. Every copy entry runs the restore sequence, so the first application
// instruction of whichever copy executes observes the application state exactly as it was
// before dispatch. Flags are carried as the lahf image plus OF materialised by seto; the
// restore re-derives OF with `add al, 0x7f` before sahf reinstates the rest.

//! Runtime dispatch sequence and encode region.

use iced_x86::{Instruction, MemoryOperand, Register};

use super::error::DupResult;
use super::instr::{CleanCall, Instr, InstrId, InstrList, JumpCondition, LabelId};
use super::slot::{CaseEncoding, EncodingSlot, SlotIndex};
use crate::x64::meta;

/// Register the dispatcher loads the encoding into.
pub const SCRATCH_REG: Register = Register::RAX;
/// Register holding 64-bit case values during compares.
pub const WIDE_REG: Register = Register::RCX;

/// The part of the dispatcher built by [`crate::core::DupClient::insert_encode`].
///
/// Code placed here runs before any application state is saved, so it must
/// preserve registers and flags itself. Clean calls do.
pub struct EncodeRegion<'a> {
    list: &'a mut InstrList,
    slot: &'a EncodingSlot,
}

impl<'a> EncodeRegion<'a> {
    pub(crate) fn new(list: &'a mut InstrList, slot: &'a EncodingSlot) -> Self {
        Self { list, slot }
    }

    /// Memory operand of the encoding slot, for direct stores.
    pub fn encoding_opnd(&self) -> MemoryOperand {
        self.slot.operand()
    }

    pub fn slot(&self) -> &EncodingSlot {
        self.slot
    }

    /// Append a meta instruction.
    pub fn push_meta(&mut self, instruction: Instruction) -> InstrId {
        self.list.push(Instr::meta(instruction))
    }

    /// Append a clean call; the helper may call `RuntimeCtx::set_encoding`.
    pub fn insert_clean_call(&mut self, call: CleanCall) -> InstrId {
        self.list.push(Instr::clean_call(call))
    }

    /// Append a store of a constant encoding into the slot.
    pub fn store_encoding(&mut self, value: CaseEncoding) -> DupResult<InstrId> {
        let store = self.slot.store_imm(value)?;
        Ok(self.push_meta(store))
    }

    /// Instructions emitted so far.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

/// Whether `encoding` can only be compared through [`WIDE_REG`].
pub fn needs_wide(encoding: CaseEncoding) -> bool {
    meta::imm32(encoding).is_none()
}

/// Append save, load and compare chain for `targets` (case, entry label) in
/// order. Returns whether the wide register was spilled.
pub(crate) fn emit_dispatch(
    list: &mut InstrList,
    slot: &EncodingSlot,
    targets: &[(CaseEncoding, LabelId)],
) -> DupResult<bool> {
    let wide = targets.iter().any(|&(enc, _)| needs_wide(enc));

    list.push(Instr::meta(meta::store_reg(slot.operand_of(SlotIndex::ScratchSpill), SCRATCH_REG)?));
    list.push(Instr::meta(meta::lahf()));
    list.push(Instr::meta(meta::seto_al()?));
    list.push(Instr::meta(meta::store_reg(slot.operand_of(SlotIndex::FlagsSpill), SCRATCH_REG)?));
    if wide {
        list.push(Instr::meta(meta::store_reg(slot.operand_of(SlotIndex::WideSpill), WIDE_REG)?));
    }
    list.push(Instr::meta(meta::load_reg(SCRATCH_REG, slot.operand())?));

    for &(encoding, label) in targets {
        match meta::imm32(encoding) {
            Some(imm) => {
                list.push(Instr::meta(meta::cmp_imm(SCRATCH_REG, imm)?));
            }
            None => {
                list.push(Instr::meta(meta::mov_imm64(WIDE_REG, encoding as u64)?));
                list.push(Instr::meta(meta::cmp_reg(SCRATCH_REG, WIDE_REG)?));
            }
        }
        list.push(Instr::jump_if(JumpCondition::Equal, label));
        log::trace!("dispatch: {:#x} -> {}", encoding, label);
    }
    Ok(wide)
}

/// Append the sequence reinstating the state saved by [`emit_dispatch`].
pub(crate) fn emit_restore(list: &mut InstrList, slot: &EncodingSlot, wide: bool) -> DupResult<()> {
    list.push(Instr::meta(meta::load_reg(SCRATCH_REG, slot.operand_of(SlotIndex::FlagsSpill))?));
    list.push(Instr::meta(meta::add_al(0x7f)?));
    list.push(Instr::meta(meta::sahf()));
    if wide {
        list.push(Instr::meta(meta::load_reg(WIDE_REG, slot.operand_of(SlotIndex::WideSpill))?));
    }
    list.push(Instr::meta(meta::load_reg(SCRATCH_REG, slot.operand_of(SlotIndex::ScratchSpill))?));
    Ok(())
}
