//! ELF relocatable output for assembled blocks.
//!
//! The block's code goes into `.text` with one symbol for the whole block and
//! one per copy:
//!
//! ```text
//! bbdup_<tag>                 block entry (encode region and dispatch)
//! bbdup_<tag>_default         default copy
//! bbdup_<tag>_case_<enc>      copy for encoding <enc>
//! ```
//!
//! Branches, calls and RIP-relative operands that leave the block were
//! encoded for [`AssembledBlock::rip`]. Each of them gets a PC-relative
//! relocation against a local absolute symbol `bbdup_<tag>_ext_<addr>`, so
//! the section can be linked anywhere and still reach the same addresses.

use hashbrown::HashMap;
use iced_x86::{Decoder, DecoderOptions, Instruction, OpKind};
use object::write::{Object, Relocation, StandardSection, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind, SymbolFlags,
    SymbolKind, SymbolScope,
};

use super::encoder::AssembledBlock;
use crate::core::error::{DupError, DupResult};

/// Name of the symbol for the block entry.
pub fn block_symbol(tag: u64) -> String {
    format!("bbdup_{tag:x}")
}

/// Name of the symbol for one copy.
pub fn copy_symbol(tag: u64, encoding: usize, is_default: bool) -> String {
    if is_default {
        format!("bbdup_{tag:x}_default")
    } else {
        format!("bbdup_{tag:x}_case_{encoding:x}")
    }
}

/// Name of the local absolute symbol for an address outside the block.
pub fn external_symbol(tag: u64, target: u64) -> String {
    format!("bbdup_{tag:x}_ext_{target:x}")
}

/// A PC-relative field whose target lies outside the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalRef {
    /// Offset of the field from the start of the code.
    pub offset: usize,
    /// Field width in bytes.
    pub size: usize,
    /// Offset just past the instruction holding the field.
    pub next: usize,
    pub target: u64,
}

impl ExternalRef {
    /// Addend that makes `S + A - P` equal the displacement the CPU expects.
    pub fn addend(&self) -> i64 {
        self.offset as i64 - self.next as i64
    }
}

/// Collect every PC-relative field of `block` that reaches outside it.
pub fn external_refs(block: &AssembledBlock) -> Vec<ExternalRef> {
    let end = block.rip + block.code.len() as u64;
    let outside = |addr: u64| addr < block.rip || addr >= end;

    let mut decoder = Decoder::with_ip(64, &block.code, block.rip, DecoderOptions::NONE);
    let mut instr = Instruction::default();
    let mut refs = Vec::new();
    while decoder.can_decode() {
        decoder.decode_out(&mut instr);
        let at = (instr.ip() - block.rip) as usize;
        let next = at + instr.len();
        let offsets = decoder.get_constant_offsets(&instr);

        let branches = (0..instr.op_count()).any(|i| instr.op_kind(i) == OpKind::NearBranch64);
        if branches && offsets.has_immediate() && outside(instr.near_branch_target()) {
            refs.push(ExternalRef {
                offset: at + offsets.immediate_offset(),
                size: offsets.immediate_size(),
                next,
                target: instr.near_branch_target(),
            });
        } else if instr.is_ip_rel_memory_operand()
            && offsets.has_displacement()
            && outside(instr.ip_rel_memory_address())
        {
            refs.push(ExternalRef {
                offset: at + offsets.displacement_offset(),
                size: offsets.displacement_size(),
                next,
                target: instr.ip_rel_memory_address(),
            });
        }
    }
    refs
}

/// Build an x86-64 ELF object holding `block`.
pub fn write_object(block: &AssembledBlock) -> DupResult<Vec<u8>> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);

    let refs = external_refs(block);
    let mut code = block.code.clone();
    for r in &refs {
        code[r.offset..r.offset + r.size].fill(0);
    }
    let base = obj.append_section_data(text, &code, 16);

    let mut define = |name: String, value: u64, size: u64| {
        obj.add_symbol(Symbol {
            name: name.into_bytes(),
            value,
            size,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
    };

    define(block_symbol(block.tag), base, block.code.len() as u64);
    for copy in &block.copies {
        define(
            copy_symbol(block.tag, copy.encoding, copy.is_default),
            base + copy.offset as u64,
            copy.size as u64,
        );
    }

    let mut targets: HashMap<u64, SymbolId> = HashMap::new();
    for r in &refs {
        let symbol = *targets.entry(r.target).or_insert_with(|| {
            obj.add_symbol(Symbol {
                name: external_symbol(block.tag, r.target).into_bytes(),
                value: r.target,
                size: 0,
                kind: SymbolKind::Label,
                scope: SymbolScope::Compilation,
                weak: false,
                section: SymbolSection::Absolute,
                flags: SymbolFlags::None,
            })
        });
        obj.add_relocation(
            text,
            Relocation {
                offset: base + r.offset as u64,
                symbol,
                addend: r.addend(),
                flags: RelocationFlags::Generic {
                    kind: RelocationKind::Relative,
                    encoding: RelocationEncoding::Generic,
                    size: (r.size * 8) as u8,
                },
            },
        )
        .map_err(|e| DupError::failed(format!("relocation at {:#x}: {e}", r.offset)))?;
    }

    let bytes = obj
        .write()
        .map_err(|e| DupError::failed(format!("object writer: {e}")))?;
    log::debug!(
        "wrote {} byte object for block {:#x} with {} relocations",
        bytes.len(),
        block.tag,
        refs.len()
    );
    Ok(bytes)
}
