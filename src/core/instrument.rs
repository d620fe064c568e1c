// This module implements the instrumentation driver. For every copy it walks the copy's
// application instructions in program order, from a snapshot taken before the first
// callback so inserted meta code is never revisited, and hands each one to the client's
// instrument_instr together with an InstrumentCursor bound to that copy. The cursor answers
// the positional queries against the copy's own boundary pair, reports which encoding the
// copy was built for, and offers insertion points that only accept meta nodes, so
// instrumentation can never add or move application instructions. Dispatch, restore and
// linkage code is not part of the walk and is never shown to the callback.

//! Per-copy instrumentation.

use iced_x86::{Instruction, MemoryOperand};

use super::client::DupClient;
use super::duplicate::BlockCopy;
use super::error::{DupError, DupResult};
use super::instr::{CleanCall, Instr, InstrId};
use super::slot::{CaseEncoding, EncodingSlot};

/// View of the copy being instrumented.
pub struct InstrumentCursor<'a> {
    copy: &'a mut BlockCopy,
    slot: &'a EncodingSlot,
}

impl<'a> InstrumentCursor<'a> {
    pub(crate) fn new(copy: &'a mut BlockCopy, slot: &'a EncodingSlot) -> Self {
        Self { copy, slot }
    }

    /// Encoding this copy executes under.
    pub fn encoding(&self) -> CaseEncoding {
        self.copy.encoding()
    }

    pub fn is_default(&self) -> bool {
        self.copy.is_default()
    }

    /// Whether `id` is the first app instruction of the current copy.
    pub fn is_first_instr(&self, id: InstrId) -> DupResult<bool> {
        self.copy.is_first(id)
    }

    /// Whether `id` is the last app instruction of the current copy.
    pub fn is_last_instr(&self, id: InstrId) -> DupResult<bool> {
        self.copy.is_last(id)
    }

    pub fn instr(&self, id: InstrId) -> Option<&Instr> {
        self.copy.body().get(id)
    }

    /// Memory operand of the encoding slot.
    pub fn encoding_opnd(&self) -> MemoryOperand {
        self.slot.operand()
    }

    /// Insert a non-app node before `at`.
    pub fn insert_before(&mut self, at: InstrId, instr: Instr) -> DupResult<InstrId> {
        reject_app(&instr)?;
        self.copy.body_mut().insert_before(at, instr)
    }

    /// Insert a non-app node after `at`.
    pub fn insert_after(&mut self, at: InstrId, instr: Instr) -> DupResult<InstrId> {
        reject_app(&instr)?;
        self.copy.body_mut().insert_after(at, instr)
    }

    pub fn insert_meta_before(&mut self, at: InstrId, instruction: Instruction) -> DupResult<InstrId> {
        self.insert_before(at, Instr::meta(instruction))
    }

    pub fn insert_clean_call_before(&mut self, at: InstrId, call: CleanCall) -> DupResult<InstrId> {
        self.insert_before(at, Instr::clean_call(call))
    }
}

fn reject_app(instr: &Instr) -> DupResult<()> {
    if instr.is_app() {
        return Err(DupError::invalid("instrumentation may only insert meta instructions"));
    }
    Ok(())
}

/// Run `instrument_instr` over every app instruction of `copy`. Returns the
/// number of callbacks made.
pub(crate) fn instrument_copy<K: DupClient>(
    client: &mut K,
    copy: &mut BlockCopy,
    slot: &EncodingSlot,
    orig: Option<&K::OrigAnalysis>,
    case: Option<&K::CaseAnalysis>,
) -> DupResult<usize> {
    let app_ids = copy.body().app_ids();
    log::trace!("instrumenting copy {:#x}: {} app instructions", copy.encoding(), app_ids.len());

    let mut cursor = InstrumentCursor::new(copy, slot);
    for &id in &app_ids {
        client.instrument_instr(&mut cursor, id, orig, case)?;
    }
    Ok(app_ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::DupContext;
    use crate::core::dispatch::EncodeRegion;
    use crate::core::duplicate::build_copies;
    use crate::core::host::{ThreadLocalTls, TlsAllocator};
    use crate::core::instr::{decode_block, InstrList};
    use crate::core::slot::DUP_TLS_SLOTS;
    use crate::core::test_utils::test::{assemble_block, BLOCK_PC};
    use crate::core::DupStatus;
    use iced_x86::code_asm::*;
    use iced_x86::Code;

    /// Puts a nop before the first and after the last instruction of every copy.
    struct Bracket {
        seen: Vec<(CaseEncoding, bool, bool)>,
    }

    impl DupClient for Bracket {
        type OrigAnalysis = ();
        type CaseAnalysis = ();

        fn set_up_bb_dups(&mut self, _ctx: &mut DupContext<'_>, _tag: u64, _bb: &InstrList) -> DupResult<()> {
            Ok(())
        }

        fn insert_encode(&mut self, _region: &mut EncodeRegion<'_>, _tag: u64, _orig: Option<&()>) -> DupResult<()> {
            Ok(())
        }

        fn instrument_instr(
            &mut self,
            cursor: &mut InstrumentCursor<'_>,
            instr: InstrId,
            _orig: Option<&()>,
            _case: Option<&()>,
        ) -> DupResult<()> {
            let first = cursor.is_first_instr(instr)?;
            let last = cursor.is_last_instr(instr)?;
            self.seen.push((cursor.encoding(), first, last));
            let nop = Instruction::with(Code::Nopd);
            if first {
                cursor.insert_meta_before(instr, nop)?;
            }
            if last {
                cursor.insert_after(instr, Instr::meta(nop))?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_walk_sees_each_app_instruction_once() {
        let bytes = assemble_block(|a| {
            a.mov(rax, rbx)?;
            a.add(rax, 1)?;
            a.ret()
        });
        let bb = decode_block(&bytes, BLOCK_PC).unwrap();
        let tls = ThreadLocalTls::new();
        let slot = EncodingSlot::new(tls.reserve("bbdup", DUP_TLS_SLOTS).unwrap()).unwrap();
        let mut copies = build_copies(&bb, 0, &[4], false);
        let mut client = Bracket { seen: Vec::new() };

        for copy in &mut copies {
            let n = instrument_copy(&mut client, copy, &slot, None, None).unwrap();
            assert_eq!(n, 3);
            assert_eq!(copy.body().len(), 5);
        }
        assert_eq!(
            client.seen,
            vec![
                (0, true, false),
                (0, false, false),
                (0, false, true),
                (4, true, false),
                (4, false, false),
                (4, false, true),
            ]
        );
    }

    #[test]
    fn test_cursor_rejects_app_insertion() {
        let bytes = assemble_block(|a| a.ret());
        let bb = decode_block(&bytes, BLOCK_PC).unwrap();
        let tls = ThreadLocalTls::new();
        let slot = EncodingSlot::new(tls.reserve("bbdup", DUP_TLS_SLOTS).unwrap()).unwrap();
        let mut copies = build_copies(&bb, 0, &[], false);
        let id = copies[0].body().app_ids()[0];

        let mut cursor = InstrumentCursor::new(&mut copies[0], &slot);
        let app = Instr::app(Instruction::with(Code::Nopd));
        let status = DupStatus::from(&cursor.insert_before(id, app));
        assert_eq!(status, DupStatus::InvalidParameter);
        assert!(cursor.instr(id).unwrap().is_app());
        assert_eq!(cursor.encoding_opnd().displacement, slot.offset() as i64);
    }
}
