//! Builders for the meta instructions the engine emits.
//!
//! Dispatch code is built from a handful of fixed instruction forms so that
//! the tracer in [`crate::core::trace`] can execute it exactly. Every builder
//! returns a plain `iced_x86::Instruction` to be wrapped in a meta node.

use iced_x86::{Code, Instruction, MemoryOperand, Register};

use crate::core::error::DupResult;
use crate::core::slot::CaseEncoding;

/// `value` as a sign-extended 32-bit immediate, if representable.
pub fn imm32(value: CaseEncoding) -> Option<i32> {
    i32::try_from(value as u64 as i64).ok()
}

/// `mov qword ptr [mem], reg`
pub fn store_reg(mem: MemoryOperand, reg: Register) -> DupResult<Instruction> {
    Ok(Instruction::with2(Code::Mov_rm64_r64, mem, reg)?)
}

/// `mov reg, qword ptr [mem]`
pub fn load_reg(reg: Register, mem: MemoryOperand) -> DupResult<Instruction> {
    Ok(Instruction::with2(Code::Mov_r64_rm64, reg, mem)?)
}

/// `mov qword ptr [mem], imm32`
pub fn store_imm(mem: MemoryOperand, imm: i32) -> DupResult<Instruction> {
    Ok(Instruction::with2(Code::Mov_rm64_imm32, mem, imm)?)
}

/// `mov reg, imm64`
pub fn mov_imm64(reg: Register, imm: u64) -> DupResult<Instruction> {
    Ok(Instruction::with2(Code::Mov_r64_imm64, reg, imm)?)
}

/// `cmp reg, imm32`
pub fn cmp_imm(reg: Register, imm: i32) -> DupResult<Instruction> {
    Ok(Instruction::with2(Code::Cmp_rm64_imm32, reg, imm)?)
}

/// `cmp left, right`
pub fn cmp_reg(left: Register, right: Register) -> DupResult<Instruction> {
    Ok(Instruction::with2(Code::Cmp_r64_rm64, left, right)?)
}

/// `lahf`
pub fn lahf() -> Instruction {
    Instruction::with(Code::Lahf)
}

/// `sahf`
pub fn sahf() -> Instruction {
    Instruction::with(Code::Sahf)
}

/// `seto al`
pub fn seto_al() -> DupResult<Instruction> {
    Ok(Instruction::with1(Code::Seto_rm8, Register::AL)?)
}

/// `add al, imm8`
pub fn add_al(imm: i32) -> DupResult<Instruction> {
    Ok(Instruction::with2(Code::Add_AL_imm8, Register::AL, imm)?)
}

/// `jmp target` to an absolute address.
pub fn jmp_abs(target: u64) -> DupResult<Instruction> {
    Ok(Instruction::with_branch(Code::Jmp_rel32_64, target)?)
}
