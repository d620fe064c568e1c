// This module implements the duplication manager's data: the per-copy BlockCopy and the
// finished InstrumentedBlock. build_copies clones the original block once per copy (the
// default first, then every registered case in registration order), giving each clone
// fresh instruction ids and, when dispatch is emitted, its own entry label. The boundary
// pair of first and last application instruction is computed once when a copy is built,
// so positional queries during instrumentation are stable no matter how much meta code is
// inserted. link_copies prefixes every dispatched copy with the restore sequence and ends
// each copy that can fall through, unless it is laid out last, with a meta jump to the
// original fallthrough address. assemble concatenates the dispatch head and all copies
// into the final list and records where each copy landed.

//! Block copies and their final layout.

use std::fmt;
use std::ops::Range;

use super::dispatch;
use super::error::{DupError, DupResult};
use super::instr::{Instr, InstrId, InstrList, LabelId};
use super::slot::{CaseEncoding, EncodingSlot};
use crate::x64::meta;

/// One specialised copy of a block.
#[derive(Debug)]
pub struct BlockCopy {
    encoding: CaseEncoding,
    is_default: bool,
    label: Option<LabelId>,
    body: InstrList,
    first: Option<InstrId>,
    last: Option<InstrId>,
}

impl BlockCopy {
    pub(crate) fn new(encoding: CaseEncoding, is_default: bool, label: Option<LabelId>, body: InstrList) -> Self {
        let first = body.first_app().map(Instr::id);
        let last = body.last_app().map(Instr::id);
        Self { encoding, is_default, label, body, first, last }
    }

    pub fn encoding(&self) -> CaseEncoding {
        self.encoding
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// Entry label targeted by dispatch, if dispatch was emitted.
    pub fn label(&self) -> Option<LabelId> {
        self.label
    }

    pub fn body(&self) -> &InstrList {
        &self.body
    }

    pub(crate) fn body_mut(&mut self) -> &mut InstrList {
        &mut self.body
    }

    /// Whether `id` is the first app instruction of this copy.
    pub fn is_first(&self, id: InstrId) -> DupResult<bool> {
        self.check_member(id)?;
        Ok(self.first == Some(id))
    }

    /// Whether `id` is the last app instruction of this copy.
    pub fn is_last(&self, id: InstrId) -> DupResult<bool> {
        self.check_member(id)?;
        Ok(self.last == Some(id))
    }

    fn check_member(&self, id: InstrId) -> DupResult<()> {
        if self.body.contains(id) {
            Ok(())
        } else {
            Err(DupError::invalid(format!(
                "instruction {id} is not part of the copy for {:#x}",
                self.encoding
            )))
        }
    }
}

/// Clone `bb` for the default and every case. Labels are only allocated when
/// the copies will be reached through dispatch.
pub(crate) fn build_copies(
    bb: &InstrList,
    default: CaseEncoding,
    cases: &[CaseEncoding],
    dispatched: bool,
) -> Vec<BlockCopy> {
    let label = || dispatched.then(LabelId::fresh);
    let mut copies = Vec::with_capacity(cases.len() + 1);
    copies.push(BlockCopy::new(default, true, label(), bb.duplicate()));
    for &encoding in cases {
        copies.push(BlockCopy::new(encoding, false, label(), bb.duplicate()));
    }
    copies
}

/// Add entry restore (when `wide` is `Some`, i.e. dispatched) and exit
/// linkage to every copy.
pub(crate) fn link_copies(
    copies: &mut [BlockCopy],
    slot: &EncodingSlot,
    wide: Option<bool>,
    bb: &InstrList,
) -> DupResult<()> {
    let count = copies.len();
    let exit = if bb.falls_through() { bb.fallthrough_pc() } else { None };

    for (index, copy) in copies.iter_mut().enumerate() {
        let mut entry = InstrList::new();
        if let Some(wide) = wide {
            if let Some(label) = copy.label {
                entry.push(Instr::label(label));
            }
            dispatch::emit_restore(&mut entry, slot, wide)?;
        }
        entry.append(std::mem::take(&mut copy.body));
        copy.body = entry;

        if let Some(pc) = exit {
            if index + 1 < count {
                copy.body.push(Instr::meta(meta::jmp_abs(pc)?));
                log::trace!("copy {:#x} exits to {:#x}", copy.encoding, pc);
            }
        }
    }
    Ok(())
}

/// Where one copy ended up in the final list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyLayout {
    pub encoding: CaseEncoding,
    pub is_default: bool,
    pub label: Option<LabelId>,
    pub first: Option<InstrId>,
    pub last: Option<InstrId>,
    /// Index range of the copy's nodes in [`InstrumentedBlock::list`].
    pub range: Range<usize>,
}

/// A duplicated and instrumented block ready to hand back to the host.
#[derive(Debug)]
pub struct InstrumentedBlock {
    tag: u64,
    list: InstrList,
    copies: Vec<CopyLayout>,
    cases: Vec<CaseEncoding>,
    dispatched: bool,
}

impl InstrumentedBlock {
    pub(crate) fn assemble(
        tag: u64,
        head: InstrList,
        copies: Vec<BlockCopy>,
        cases: Vec<CaseEncoding>,
        dispatched: bool,
    ) -> Self {
        let mut list = head;
        let mut layouts = Vec::with_capacity(copies.len());
        for copy in copies {
            let start = list.len();
            let BlockCopy { encoding, is_default, label, body, first, last } = copy;
            list.append(body);
            layouts.push(CopyLayout { encoding, is_default, label, first, last, range: start..list.len() });
        }
        Self { tag, list, copies: layouts, cases, dispatched }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn list(&self) -> &InstrList {
        &self.list
    }

    pub fn into_list(self) -> InstrList {
        self.list
    }

    /// Copies in layout order; index 0 is the default copy.
    pub fn copies(&self) -> &[CopyLayout] {
        &self.copies
    }

    /// Registered cases in compare order.
    pub fn cases(&self) -> &[CaseEncoding] {
        &self.cases
    }

    /// Whether a dispatch sequence was emitted.
    pub fn dispatched(&self) -> bool {
        self.dispatched
    }

    /// Nodes before the first copy: encode region and dispatch.
    pub fn dispatch_len(&self) -> usize {
        self.copies.first().map_or(self.list.len(), |c| c.range.start)
    }

    /// Index of the copy containing `id`.
    pub fn copy_of(&self, id: InstrId) -> Option<usize> {
        let pos = self.list.position(id)?;
        self.copies.iter().position(|c| c.range.contains(&pos))
    }

    /// Index of the copy dispatch selects for a live `encoding`.
    pub fn copy_for_encoding(&self, encoding: CaseEncoding) -> usize {
        self.copies
            .iter()
            .position(|c| !c.is_default && c.encoding == encoding)
            .unwrap_or(0)
    }
}

impl fmt::Display for InstrumentedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block {:#x}: {} copies, dispatch {}", self.tag, self.copies.len(), self.dispatched)?;
        let nodes: Vec<&Instr> = self.list.iter().collect();
        if self.dispatch_len() > 0 {
            writeln!(f, "; dispatch")?;
            for instr in &nodes[..self.dispatch_len()] {
                writeln!(f, "{instr}")?;
            }
        }
        for copy in &self.copies {
            let kind = if copy.is_default { "default" } else { "case" };
            writeln!(f, "; {} {:#x}", kind, copy.encoding)?;
            for instr in &nodes[copy.range.clone()] {
                writeln!(f, "{instr}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::host::{ThreadLocalTls, TlsAllocator};
    use crate::core::instr::{decode_block, InstrKind};
    use crate::core::slot::DUP_TLS_SLOTS;
    use crate::core::test_utils::test::{assemble_block, BLOCK_PC};
    use crate::core::DupStatus;
    use iced_x86::code_asm::*;
    use iced_x86::Code;

    fn slot() -> EncodingSlot {
        let tls = ThreadLocalTls::new();
        EncodingSlot::new(tls.reserve("bbdup", DUP_TLS_SLOTS).unwrap()).unwrap()
    }

    fn straight_line() -> InstrList {
        let bytes = assemble_block(|a| {
            a.add(rax, rbx)?;
            a.sub(rcx, 4)
        });
        decode_block(&bytes, BLOCK_PC).unwrap()
    }

    #[test]
    fn test_copies_are_independent() {
        let bb = straight_line();
        let copies = build_copies(&bb, 0, &[1, 2], true);
        assert_eq!(copies.len(), 3);
        assert!(copies[0].is_default());
        assert_eq!(copies.iter().map(BlockCopy::encoding).collect::<Vec<_>>(), vec![0, 1, 2]);

        let first_ids: Vec<_> = copies.iter().map(|c| c.first).collect();
        assert_ne!(first_ids[0], first_ids[1]);
        assert_ne!(first_ids[1], first_ids[2]);
        assert!(copies.iter().all(|c| c.label().is_some()));
    }

    #[test]
    fn test_positional_queries() {
        let bb = straight_line();
        let copies = build_copies(&bb, 0, &[1], false);
        let ids = copies[1].body().app_ids();
        assert!(copies[1].is_first(ids[0]).unwrap());
        assert!(!copies[1].is_last(ids[0]).unwrap());
        assert!(copies[1].is_last(ids[1]).unwrap());

        let foreign = copies[0].body().app_ids()[0];
        let err = copies[1].is_first(foreign).unwrap_err();
        assert_eq!(err.status(), DupStatus::InvalidParameter);
    }

    #[test]
    fn test_linkage_skips_last_copy() {
        let bb = straight_line();
        let slot = slot();
        let mut copies = build_copies(&bb, 0, &[1, 2], true);
        link_copies(&mut copies, &slot, Some(false), &bb).unwrap();

        let fallthrough = bb.fallthrough_pc().unwrap();
        for (index, copy) in copies.iter().enumerate() {
            assert!(matches!(copy.body().iter().next().unwrap().kind(), InstrKind::Label(_)));
            let tail = copy.body().iter().last().and_then(Instr::instruction).unwrap();
            let links = tail.code() == Code::Jmp_rel32_64 && tail.near_branch64() == fallthrough;
            assert_eq!(links, index + 1 < copies.len());
        }
    }

    #[test]
    fn test_no_linkage_after_return() {
        let bytes = assemble_block(|a| {
            a.add(rax, rbx)?;
            a.ret()
        });
        let bb = decode_block(&bytes, BLOCK_PC).unwrap();
        let slot = slot();
        let mut copies = build_copies(&bb, 0, &[1], true);
        link_copies(&mut copies, &slot, Some(false), &bb).unwrap();
        for copy in &copies {
            assert!(copy.body().iter().last().unwrap().is_app());
        }
    }

    #[test]
    fn test_assembled_layout() {
        let bb = straight_line();
        let slot = slot();
        let mut copies = build_copies(&bb, 5, &[1, 2], true);
        link_copies(&mut copies, &slot, Some(false), &bb).unwrap();
        let mut head = InstrList::new();
        let labels: Vec<_> = copies[1..].iter().map(|c| (c.encoding(), c.label().unwrap())).collect();
        dispatch::emit_dispatch(&mut head, &slot, &labels).unwrap();
        let head_len = head.len();

        let block = InstrumentedBlock::assemble(0x10, head, copies, vec![1, 2], true);
        assert_eq!(block.dispatch_len(), head_len);
        assert_eq!(block.copies()[0].range.start, head_len);
        assert_eq!(block.copies()[2].range.end, block.list().len());
        assert_eq!(block.copy_for_encoding(2), 2);
        assert_eq!(block.copy_for_encoding(99), 0);
        assert_eq!(block.copy_for_encoding(5), 0);

        let last_app = block.copies()[1].last.unwrap();
        assert_eq!(block.copy_of(last_app), Some(1));
        assert!(block.to_string().contains("; case 0x2"));
    }
}
