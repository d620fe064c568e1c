// This module lowers instrumented blocks to x86-64 machine code using the iced-x86 code
// assembler. X64Encoder wraps a CodeAssembler and manages labels for the engine's jump
// targets: every LabelId gets one CodeLabel, created on first use by a jump or placement,
// so forward jumps from the dispatch compare chain to copy entries resolve when the copy
// is placed. App and meta nodes are re-encoded as they are (the block encoder fixes up
// relative branches and RIP-relative operands for the new address), label jumps become
// je/jne/jmp, and clean calls become direct calls to the address the host resolves for
// their helper. finalize refuses to assemble when a jump target was never placed and
// reports the offset of every emitted instruction, which assemble uses to locate the
// start of each copy in the final code.

//! x86-64 lowering of instrumented blocks using iced-x86.

use hashbrown::{HashMap, HashSet};
use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, IcedError, Instruction};
use thiserror::Error;

use crate::core::duplicate::InstrumentedBlock;
use crate::core::error::DupError;
use crate::core::instr::{CleanCall, InstrKind, JumpCondition, LabelId};
use crate::core::slot::CaseEncoding;

/// Error types for instruction encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Assembly error: {0}")]
    AssemblyError(String),

    #[error("Label {0} was jumped to but never placed")]
    UnplacedLabel(LabelId),

    #[error("Label {0} placed twice")]
    DuplicateLabel(LabelId),

    #[error("No address for clean call {0}")]
    UnresolvedCall(String),

    #[error("Start of copy {0} could not be located")]
    UnlocatedCopy(usize),
}

impl From<IcedError> for EncodingError {
    fn from(e: IcedError) -> Self {
        EncodingError::AssemblyError(e.to_string())
    }
}

impl From<EncodingError> for DupError {
    fn from(e: EncodingError) -> Self {
        DupError::failed(e.to_string())
    }
}

/// Machine code and per-instruction offsets produced by [`X64Encoder::finalize`].
#[derive(Debug, Clone)]
pub struct EncodedCode {
    pub code: Vec<u8>,
    /// Offset from the base address of every emitted instruction;
    /// `u32::MAX` for instructions the block encoder rewrote.
    pub offsets: Vec<u32>,
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    /// Code assembler for generating instructions.
    assembler: CodeAssembler,
    /// Assembler labels for engine labels.
    labels: HashMap<LabelId, CodeLabel>,
    /// Track which labels have been placed.
    placed: HashSet<LabelId>,
    /// Instructions emitted so far.
    emitted: usize,
}

impl X64Encoder {
    /// Create a new x86-64 encoder.
    pub fn new() -> Result<Self, EncodingError> {
        Ok(Self {
            assembler: CodeAssembler::new(64)?,
            labels: HashMap::new(),
            placed: HashSet::new(),
            emitted: 0,
        })
    }

    /// Number of instructions emitted so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Emit a decoded or constructed instruction unchanged. Returns its index.
    pub fn add_instruction(&mut self, mut instruction: Instruction) -> Result<usize, EncodingError> {
        // Copies repeat the same app addresses; only assembler labels may give an ip.
        instruction.set_ip(0);
        self.assembler.add_instruction(instruction)?;
        Ok(self.bump())
    }

    fn bump(&mut self) -> usize {
        self.emitted += 1;
        self.emitted - 1
    }

    // ==== LABEL MANAGEMENT FOR CONTROL FLOW ====

    /// Create or get the assembler label for `label`.
    pub fn get_or_create_label(&mut self, label: LabelId) -> CodeLabel {
        if let Some(&code_label) = self.labels.get(&label) {
            code_label
        } else {
            let code_label = self.assembler.create_label();
            self.labels.insert(label, code_label);
            code_label
        }
    }

    /// Place `label` at the next emitted instruction.
    pub fn place_label(&mut self, label: LabelId) -> Result<(), EncodingError> {
        if !self.placed.insert(label) {
            return Err(EncodingError::DuplicateLabel(label));
        }
        let mut code_label = self.get_or_create_label(label);
        self.assembler.set_label(&mut code_label)?;
        Ok(())
    }

    pub fn is_label_placed(&self, label: LabelId) -> bool {
        self.placed.contains(&label)
    }

    // ==== CONTROL FLOW INSTRUCTIONS ====

    /// Emit a jump to `label`, unconditional when `condition` is `None`.
    pub fn jump_to_label(
        &mut self,
        condition: Option<JumpCondition>,
        label: LabelId,
    ) -> Result<usize, EncodingError> {
        let target = self.get_or_create_label(label);
        match condition {
            Some(JumpCondition::Equal) => self.assembler.je(target)?,
            Some(JumpCondition::NotEqual) => self.assembler.jne(target)?,
            None => self.assembler.jmp(target)?,
        }
        Ok(self.bump())
    }

    /// Emit a direct call to an absolute address.
    pub fn call(&mut self, target: u64) -> Result<usize, EncodingError> {
        self.assembler.call(target)?;
        Ok(self.bump())
    }

    /// Generate the final machine code at `rip`.
    pub fn finalize(mut self, rip: u64) -> Result<EncodedCode, EncodingError> {
        if let Some(&label) = self.labels.keys().find(|l| !self.placed.contains(*l)) {
            return Err(EncodingError::UnplacedLabel(label));
        }

        let result = self
            .assembler
            .assemble_options(rip, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)?;
        Ok(EncodedCode {
            code: result.inner.code_buffer,
            offsets: result.inner.new_instruction_offsets,
        })
    }
}

/// One copy inside an [`AssembledBlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledCopy {
    pub encoding: CaseEncoding,
    pub is_default: bool,
    /// Offset of the copy's entry from the start of the code.
    pub offset: usize,
    pub size: usize,
}

/// Machine code of an instrumented block.
#[derive(Debug, Clone)]
pub struct AssembledBlock {
    pub tag: u64,
    pub rip: u64,
    pub code: Vec<u8>,
    pub copies: Vec<AssembledCopy>,
}

impl AssembledBlock {
    /// Absolute address of copy `index`.
    pub fn copy_address(&self, index: usize) -> Option<u64> {
        self.copies.get(index).map(|c| self.rip + c.offset as u64)
    }
}

/// Lower `block` to machine code placed at `rip`.
///
/// `resolve` maps each clean call to the address of its helper; calls it
/// cannot place fall back to [`CleanCall::target`].
pub fn assemble<F>(block: &InstrumentedBlock, rip: u64, mut resolve: F) -> Result<AssembledBlock, EncodingError>
where
    F: FnMut(&CleanCall) -> Option<u64>,
{
    let mut encoder = X64Encoder::new()?;
    // Index of the first instruction emitted at or after each node.
    let mut first_emitted = Vec::with_capacity(block.list().len());

    for instr in block.list().iter() {
        first_emitted.push(encoder.emitted());
        match instr.kind() {
            InstrKind::App(i) | InstrKind::Meta(i) => {
                encoder.add_instruction(*i)?;
            }
            InstrKind::Label(label) => encoder.place_label(*label)?,
            InstrKind::Jump { cond, target } => {
                encoder.jump_to_label(*cond, *target)?;
            }
            InstrKind::CleanCall(call) => {
                let target = resolve(call)
                    .or_else(|| (call.target() != 0).then(|| call.target()))
                    .ok_or_else(|| EncodingError::UnresolvedCall(call.name().to_string()))?;
                encoder.call(target)?;
            }
        }
    }

    let encoded = encoder.finalize(rip)?;
    let mut copies = Vec::with_capacity(block.copies().len());
    for (index, layout) in block.copies().iter().enumerate() {
        let first = first_emitted
            .get(layout.range.start)
            .copied()
            .ok_or(EncodingError::UnlocatedCopy(index))?;
        let offset = match first {
            0 => 0,
            n => match encoded.offsets.get(n) {
                Some(&off) if off != u32::MAX => off as usize,
                _ => return Err(EncodingError::UnlocatedCopy(index)),
            },
        };
        copies.push(AssembledCopy { encoding: layout.encoding, is_default: layout.is_default, offset, size: 0 });
    }

    let end = encoded.code.len();
    let mut next = end;
    for copy in copies.iter_mut().rev() {
        copy.size = next - copy.offset;
        next = copy.offset;
    }

    log::debug!("assembled block {:#x}: {} bytes at {:#x}", block.tag(), end, rip);
    Ok(AssembledBlock { tag: block.tag(), rip, code: encoded.code, copies })
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Code, Decoder, DecoderOptions, Mnemonic};

    #[test]
    fn test_forward_label_jump() {
        let mut encoder = X64Encoder::new().unwrap();
        let target = LabelId::fresh();

        encoder.jump_to_label(Some(JumpCondition::Equal), target).unwrap();
        encoder.add_instruction(Instruction::with(Code::Nopd)).unwrap();
        assert!(!encoder.is_label_placed(target));
        encoder.place_label(target).unwrap();
        encoder.add_instruction(Instruction::with(Code::Retnq)).unwrap();
        assert!(encoder.is_label_placed(target));
        assert_eq!(encoder.emitted(), 3);

        let encoded = encoder.finalize(0x1000).unwrap();
        assert_eq!(encoded.offsets.len(), 3);

        let mut decoder = Decoder::with_ip(64, &encoded.code, 0x1000, DecoderOptions::NONE);
        let je = decoder.decode();
        assert_eq!(je.mnemonic(), Mnemonic::Je);
        assert_eq!(je.near_branch64(), 0x1000 + encoded.offsets[2] as u64);
    }

    #[test]
    fn test_unplaced_label_is_an_error() {
        let mut encoder = X64Encoder::new().unwrap();
        let target = LabelId::fresh();
        encoder.jump_to_label(None, target).unwrap();
        assert_eq!(encoder.finalize(0).unwrap_err(), EncodingError::UnplacedLabel(target));
    }

    #[test]
    fn test_label_placed_twice() {
        let mut encoder = X64Encoder::new().unwrap();
        let target = LabelId::fresh();
        encoder.place_label(target).unwrap();
        encoder.add_instruction(Instruction::with(Code::Nopd)).unwrap();
        assert_eq!(encoder.place_label(target), Err(EncodingError::DuplicateLabel(target)));
    }

    #[test]
    fn test_direct_call() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.call(0x2000).unwrap();
        let encoded = encoder.finalize(0x1000).unwrap();
        let mut decoder = Decoder::with_ip(64, &encoded.code, 0x1000, DecoderOptions::NONE);
        let call = decoder.decode();
        assert_eq!(call.mnemonic(), Mnemonic::Call);
        assert_eq!(call.near_branch64(), 0x2000);
    }
}
