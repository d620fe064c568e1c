// This module implements a reference executor for the code the engine places in front of
// application instructions. trace_dispatch starts at the top of an instrumented block with
// a given register and flag state and executes encode region, dispatch, and copy entry
// until the first application instruction is reached. It understands exactly the
// instruction forms the engine emits (segment-relative moves to and from its TLS slots,
// immediate and register compares, lahf/sahf, seto, add al) along with label jumps and
// clean calls, which it runs through a RuntimeCtx so helpers can set the encoding. Memory
// operands must address the engine's own slots, read and written through the host
// allocator for the calling thread. The result names the copy that was entered, and the
// machine state seen by its first application instruction, which lets tests check dispatch
// totality and state preservation without executing generated machine code.

//! Reference execution of dispatch code.

use hashbrown::HashMap;
use iced_x86::{Code, Instruction, OpKind, Register};
use thiserror::Error;

use super::duplicate::InstrumentedBlock;
use super::host::TlsAllocator;
use super::instr::{InstrKind, JumpCondition, LabelId};
use super::slot::{EncodingSlot, RuntimeCtx};

const CF: u8 = 0x01;
const PF: u8 = 0x04;
const AF: u8 = 0x10;
const ZF: u8 = 0x40;
const SF: u8 = 0x80;
/// Bits `sahf` can write.
const SAHF_MASK: u8 = SF | ZF | AF | PF | CF;
/// Bit 1 of the flags image is always set.
const FIXED_BIT: u8 = 0x02;

const STEP_LIMIT: usize = 10_000;

/// Errors raised while tracing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    #[error("Unsupported instruction in dispatch: {instr}")]
    Unsupported { instr: String },

    #[error("Memory access outside the engine's slots at offset {offset:#x}")]
    UnknownMemory { offset: u64 },

    #[error("Jump to unplaced label {label}")]
    UnplacedLabel { label: LabelId },

    #[error("Block ended before any app instruction")]
    NoAppInstruction,

    #[error("Gave up after {limit} steps")]
    StepLimit { limit: usize },
}

/// Register and flag state the tracer models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineState {
    pub rax: u64,
    pub rcx: u64,
    /// Flags in `lahf` layout.
    pub flags: u8,
    pub of: bool,
}

impl MachineState {
    pub fn new(rax: u64, rcx: u64) -> Self {
        Self { rax, rcx, flags: FIXED_BIT, of: false }
    }

    /// Set the arithmetic flags; bits `lahf` cannot observe are ignored.
    pub fn with_flags(mut self, flags: u8, of: bool) -> Self {
        self.flags = (flags & SAHF_MASK) | FIXED_BIT;
        self.of = of;
        self
    }

    pub fn zf(&self) -> bool {
        self.flags & ZF != 0
    }

    fn reg(&self, reg: Register) -> Option<u64> {
        match reg {
            Register::RAX => Some(self.rax),
            Register::RCX => Some(self.rcx),
            Register::AL => Some(self.rax & 0xff),
            _ => None,
        }
    }

    fn set_reg(&mut self, reg: Register, value: u64) -> bool {
        match reg {
            Register::RAX => self.rax = value,
            Register::RCX => self.rcx = value,
            Register::AL => self.rax = (self.rax & !0xff) | (value & 0xff),
            _ => return false,
        }
        true
    }

    fn set_result_flags(&mut self, result: u64, bits: u32, carry: bool, overflow: bool, aux: bool) {
        let sign = 1u64 << (bits - 1);
        let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        let mut flags = FIXED_BIT;
        if carry {
            flags |= CF;
        }
        if (result as u8).count_ones() % 2 == 0 {
            flags |= PF;
        }
        if aux {
            flags |= AF;
        }
        if result & mask == 0 {
            flags |= ZF;
        }
        if result & sign != 0 {
            flags |= SF;
        }
        self.flags = flags;
        self.of = overflow;
    }

    fn compare(&mut self, left: u64, right: u64) {
        let result = left.wrapping_sub(right);
        let overflow = ((left ^ right) & (left ^ result)) >> 63 == 1;
        let aux = (left ^ right ^ result) & 0x10 != 0;
        self.set_result_flags(result, 64, left < right, overflow, aux);
    }

    fn add8(&mut self, left: u8, right: u8) -> u8 {
        let (result, carry) = left.overflowing_add(right);
        let overflow = (left ^ result) & (right ^ result) & 0x80 != 0;
        let aux = (left ^ right ^ result) & 0x10 != 0;
        self.set_result_flags(result as u64, 8, carry, overflow, aux);
        result
    }
}

/// Outcome of tracing one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTrace {
    /// Index of the entered copy in [`InstrumentedBlock::copies`].
    pub copy: usize,
    /// Copy entry label passed on the way, if any.
    pub entry: Option<LabelId>,
    /// State at the first app instruction.
    pub state: MachineState,
    /// Names of the clean calls executed.
    pub clean_calls: Vec<String>,
    pub steps: usize,
}

struct Tracer<'a> {
    slot: &'a EncodingSlot,
    tls: &'a dyn TlsAllocator,
    state: MachineState,
}

impl<'a> Tracer<'a> {
    fn memory_offset(&self, instr: &Instruction) -> Result<u32, TraceError> {
        let offset = instr.memory_displacement64();
        let plain = instr.memory_base() == Register::None && instr.memory_index() == Register::None;
        if !plain || instr.memory_segment() != self.slot.tls_block().segment {
            return Err(TraceError::UnknownMemory { offset });
        }
        let offset32 = u32::try_from(offset).map_err(|_| TraceError::UnknownMemory { offset })?;
        match self.slot.slot_at(offset32) {
            Some(_) => Ok(offset32),
            None => Err(TraceError::UnknownMemory { offset }),
        }
    }

    fn read_op(&self, instr: &Instruction, op: u32) -> Result<u64, TraceError> {
        match instr.op_kind(op) {
            OpKind::Register => self.state.reg(instr.op_register(op)).ok_or_else(|| unsupported(instr)),
            OpKind::Memory => Ok(self.tls.read_slot(self.memory_offset(instr)?) as u64),
            OpKind::Immediate8 => Ok(instr.immediate8() as u64),
            OpKind::Immediate32to64 => Ok(instr.immediate32to64() as u64),
            OpKind::Immediate64 => Ok(instr.immediate64()),
            _ => Err(unsupported(instr)),
        }
    }

    fn write_op(&mut self, instr: &Instruction, op: u32, value: u64) -> Result<(), TraceError> {
        match instr.op_kind(op) {
            OpKind::Register => {
                if self.state.set_reg(instr.op_register(op), value) {
                    Ok(())
                } else {
                    Err(unsupported(instr))
                }
            }
            OpKind::Memory => {
                let offset = self.memory_offset(instr)?;
                self.tls.write_slot(offset, value as usize);
                Ok(())
            }
            _ => Err(unsupported(instr)),
        }
    }

    fn execute(&mut self, instr: &Instruction) -> Result<(), TraceError> {
        match instr.code() {
            Code::Mov_rm64_r64 | Code::Mov_r64_rm64 | Code::Mov_rm64_imm32 | Code::Mov_r64_imm64 => {
                let value = self.read_op(instr, 1)?;
                self.write_op(instr, 0, value)
            }
            Code::Cmp_rm64_imm32 | Code::Cmp_r64_rm64 => {
                let left = self.read_op(instr, 0)?;
                let right = self.read_op(instr, 1)?;
                self.state.compare(left, right);
                Ok(())
            }
            Code::Lahf => {
                let ah = (self.state.flags as u64) << 8;
                self.state.rax = (self.state.rax & !0xff00) | ah;
                Ok(())
            }
            Code::Sahf => {
                let ah = (self.state.rax >> 8) as u8;
                self.state.flags = (ah & SAHF_MASK) | FIXED_BIT;
                Ok(())
            }
            Code::Seto_rm8 => {
                let value = u64::from(self.state.of);
                self.write_op(instr, 0, value)
            }
            Code::Add_AL_imm8 => {
                let al = self.state.rax as u8;
                let result = self.state.add8(al, instr.immediate8());
                self.state.set_reg(Register::AL, result as u64);
                Ok(())
            }
            Code::Nopd | Code::Nopq | Code::Nopw => Ok(()),
            _ => Err(unsupported(instr)),
        }
    }
}

fn unsupported(instr: &Instruction) -> TraceError {
    TraceError::Unsupported { instr: instr.to_string() }
}

/// Execute `block` from its first node up to the first app instruction.
pub fn trace_dispatch(
    block: &InstrumentedBlock,
    slot: &EncodingSlot,
    tls: &dyn TlsAllocator,
    initial: MachineState,
) -> Result<DispatchTrace, TraceError> {
    let nodes: Vec<_> = block.list().iter().collect();
    let labels: HashMap<LabelId, usize> = nodes
        .iter()
        .enumerate()
        .filter_map(|(i, n)| match n.kind() {
            InstrKind::Label(l) => Some((*l, i)),
            _ => None,
        })
        .collect();

    let mut tracer = Tracer { slot, tls, state: initial };
    let mut entry = None;
    let mut clean_calls = Vec::new();
    let mut pc = 0;
    let mut steps = 0;

    while let Some(node) = nodes.get(pc) {
        steps += 1;
        if steps > STEP_LIMIT {
            return Err(TraceError::StepLimit { limit: STEP_LIMIT });
        }
        pc += 1;

        match node.kind() {
            InstrKind::App(_) => {
                let copy = block.copy_of(node.id()).ok_or(TraceError::NoAppInstruction)?;
                return Ok(DispatchTrace { copy, entry, state: tracer.state, clean_calls, steps });
            }
            InstrKind::Meta(instr) => tracer.execute(instr)?,
            InstrKind::Label(label) => {
                if block.copies().iter().any(|c| c.label == Some(*label)) {
                    entry.get_or_insert(*label);
                }
            }
            InstrKind::Jump { cond, target } => {
                let taken = match cond {
                    None => true,
                    Some(JumpCondition::Equal) => tracer.state.zf(),
                    Some(JumpCondition::NotEqual) => !tracer.state.zf(),
                };
                if taken {
                    pc = *labels.get(target).ok_or(TraceError::UnplacedLabel { label: *target })?;
                }
            }
            InstrKind::CleanCall(call) => {
                call.invoke(&RuntimeCtx::new(slot, tls));
                clean_calls.push(call.name().to_string());
            }
        }
    }
    Err(TraceError::NoAppInstruction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::host::ThreadLocalTls;
    use crate::core::slot::{SlotIndex, DUP_TLS_SLOTS};
    use crate::x64::meta;

    #[test]
    fn test_compare_sets_zero_flag() {
        let mut state = MachineState::new(0, 0);
        state.compare(5, 5);
        assert!(state.zf());
        state.compare(5, 6);
        assert!(!state.zf());
        assert_eq!(state.flags & CF, CF);
        assert_eq!(state.flags & SF, SF);
    }

    #[test]
    fn test_overflow_round_trips_through_al() {
        for of in [false, true] {
            let mut state = MachineState::new(0, 0);
            state.set_reg(Register::AL, u64::from(of));
            let al = state.rax as u8;
            state.add8(al, 0x7f);
            assert_eq!(state.of, of);
        }
    }

    #[test]
    fn test_memory_outside_slots_is_rejected() {
        let tls = ThreadLocalTls::new();
        let slot = EncodingSlot::new(tls.reserve("bbdup", DUP_TLS_SLOTS).unwrap()).unwrap();
        let mut tracer = Tracer { slot: &slot, tls: &tls, state: MachineState::new(1, 2) };

        let store = meta::store_reg(slot.operand_of(SlotIndex::ScratchSpill), Register::RAX).unwrap();
        tracer.execute(&store).unwrap();
        assert_eq!(tls.read_slot(slot.offset_of(SlotIndex::ScratchSpill)), 1);

        let mut far = slot.operand();
        far.displacement += 0x1000;
        let bad = meta::store_reg(far, Register::RAX).unwrap();
        assert!(matches!(tracer.execute(&bad), Err(TraceError::UnknownMemory { .. })));

        let push = Instruction::with1(Code::Push_r64, Register::RBX).unwrap();
        assert!(matches!(tracer.execute(&push), Err(TraceError::Unsupported { .. })));
    }
}
