// This module implements the engine: lifecycle management and the per-block driver that
// coordinates every other component. Engine::init reserves the engine's TLS slots from the
// host under the pass name, which doubles as the single-initialisation guard because the
// host refuses a second reservation under the same owner, and exit releases them again.
// For each block instrument_block runs the fixed pipeline: setup callback on a fresh
// registry allocated in the session arena (the block borrows it until it is finished),
// shared analysis, cloning, per-copy analysis, encode region and dispatch, entry restore
// and exit linkage, per-copy instrumentation, and finally destruction of every analysis
// result. Destruction runs on the failure path as well, so a client that errors half-way
// still gets its data back. A setup callback that errors only ends registration; the block
// goes on with the cases it already has. The engine also implements BlockPass so a host
// scheduler can drive it directly at the documented priority.

//! Engine lifecycle and block pipeline.
//!
//! ```text
//! instrument_block(tag, bb)
//!     set_up_bb_dups     -> default, enable flag, cases
//!     analyze_orig
//!     build copies       default first, cases in registration order
//!     analyze_case       per copy
//!     insert_encode      only when dispatching
//!     dispatch           save, load, compare chain
//!     restore + linkage  per copy
//!     instrument_instr   per copy, per app instruction
//!     teardown           case analyses in copy order, then shared
//! ```

use std::sync::Arc;

use bumpalo::Bump;

use super::analysis::AnalysisSet;
use super::client::DupClient;
use super::context::DupContext;
use super::dispatch::{self, EncodeRegion};
use super::duplicate::{self, InstrumentedBlock};
use super::error::{DupError, DupResult};
use super::host::{BlockPass, TlsAllocator};
use super::instr::InstrList;
use super::instrument;
use super::session::{DupSession, DupStats};
use super::slot::{CaseEncoding, EncodingSlot, DUP_TLS_SLOTS};

/// Name the engine registers its pass and TLS reservation under.
pub const PASS_NAME: &str = "bbdup";

/// Pass priority. App-to-app passes must run before this one.
pub const PASS_PRIORITY: i32 = -1500;

/// Engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DupOptions {
    /// Maximum number of non-default cases per block.
    pub dup_limit: u16,
}

impl Default for DupOptions {
    fn default() -> Self {
        Self { dup_limit: 3 }
    }
}

impl DupOptions {
    pub fn with_dup_limit(mut self, dup_limit: u16) -> Self {
        self.dup_limit = dup_limit;
        self
    }

    fn validate(&self) -> DupResult<()> {
        if self.dup_limit == 0 {
            return Err(DupError::invalid("dup_limit must be greater than zero"));
        }
        Ok(())
    }
}

/// Outcome of the setup callback for one block. `cases` lives in the session arena.
struct BlockSetup<'a> {
    default: CaseEncoding,
    enabled: bool,
    cases: &'a [CaseEncoding],
}

/// The block duplication engine.
pub struct Engine<C: DupClient> {
    tls: Arc<dyn TlsAllocator>,
    slot: EncodingSlot,
    options: DupOptions,
    client: C,
    session: DupSession,
    live: bool,
}

impl<C: DupClient> Engine<C> {
    /// Initialise the engine. Fails with `AlreadyInitialised` when the host
    /// already has a live engine.
    pub fn init(tls: Arc<dyn TlsAllocator>, options: DupOptions, client: C) -> DupResult<Self> {
        options.validate()?;
        let block = tls.reserve(PASS_NAME, DUP_TLS_SLOTS)?;
        let slot = match EncodingSlot::new(block) {
            Ok(slot) => slot,
            Err(e) => {
                let _ = tls.release(PASS_NAME);
                return Err(e);
            }
        };
        log::debug!(
            "bbdup initialised: limit {}, encoding slot {:?}:{:#x}",
            options.dup_limit,
            block.segment,
            slot.offset()
        );
        Ok(Self { tls, slot, options, client, session: DupSession::new(), live: true })
    }

    /// Tear the engine down and release its TLS slots.
    pub fn exit(mut self) -> DupResult<()> {
        self.live = false;
        self.tls.release(PASS_NAME)?;
        log::debug!("bbdup exited after {} blocks", self.session.stats().blocks_seen);
        Ok(())
    }

    pub fn slot(&self) -> &EncodingSlot {
        &self.slot
    }

    pub fn tls(&self) -> &Arc<dyn TlsAllocator> {
        &self.tls
    }

    pub fn options(&self) -> DupOptions {
        self.options
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub fn stats(&self) -> &DupStats {
        self.session.stats()
    }

    /// Duplicate and instrument one basic block.
    pub fn instrument_block(&mut self, tag: u64, bb: InstrList) -> DupResult<InstrumentedBlock> {
        if bb.first_app().is_none() {
            return Err(DupError::invalid(format!("block {tag:#x} has no app instructions")));
        }
        self.session.record_block_seen();

        let arena = self.session.take_arena();
        let result = self.run(tag, &bb, &arena);
        self.session.restore_arena(arena);

        match result {
            Ok(block) => {
                log::debug!(
                    "block {:#x}: {} copies, {} nodes, dispatch {}",
                    tag,
                    block.copies().len(),
                    block.list().len(),
                    block.dispatched()
                );
                Ok(block)
            }
            Err(e) => {
                self.session.record_failure();
                log::warn!("block {:#x} failed: {}", tag, e);
                Err(e)
            }
        }
    }

    fn run(&mut self, tag: u64, bb: &InstrList, arena: &Bump) -> DupResult<InstrumentedBlock> {
        let setup = self.set_up(tag, bb, arena);
        let mut analyses = AnalysisSet::analyze_orig(&mut self.client, tag, bb);
        let result = self.build(tag, bb, &setup, &mut analyses);
        let counts = analyses.teardown(&mut self.client);
        self.session.record_analyses(counts);
        result
    }

    /// Run the setup callback. An error stops registration but keeps what
    /// was registered before it.
    fn set_up<'a>(&mut self, tag: u64, bb: &InstrList, arena: &'a Bump) -> BlockSetup<'a> {
        let mut ctx = DupContext::new(arena, self.options.dup_limit);
        let status = self.client.set_up_bb_dups(&mut ctx, tag, bb);
        self.session.record_rejected(ctx.rejected());
        if let Err(e) = status {
            self.session.record_setup_error();
            log::warn!(
                "block {:#x}: setup stopped with {}, keeping {} registered cases",
                tag,
                e,
                ctx.cases().len()
            );
        }
        BlockSetup {
            default: ctx.default_encoding(),
            enabled: ctx.enable_dups(),
            cases: ctx.into_cases(),
        }
    }

    fn build(
        &mut self,
        tag: u64,
        bb: &InstrList,
        setup: &BlockSetup<'_>,
        analyses: &mut AnalysisSet<C>,
    ) -> DupResult<InstrumentedBlock> {
        let mut copies = duplicate::build_copies(bb, setup.default, setup.cases, setup.enabled);
        for copy in &copies {
            analyses.analyze_case(&mut self.client, tag, bb, copy.encoding());
        }

        let mut head = InstrList::new();
        let wide = if setup.enabled {
            let mut region = EncodeRegion::new(&mut head, &self.slot);
            self.client.insert_encode(&mut region, tag, analyses.orig())?;

            let targets: Vec<_> = copies[1..]
                .iter()
                .filter_map(|c| c.label().map(|l| (c.encoding(), l)))
                .collect();
            Some(dispatch::emit_dispatch(&mut head, &self.slot, &targets)?)
        } else {
            None
        };
        duplicate::link_copies(&mut copies, &self.slot, wide, bb)?;

        let mut instrumented = 0;
        for (index, copy) in copies.iter_mut().enumerate() {
            instrumented += instrument::instrument_copy(
                &mut self.client,
                copy,
                &self.slot,
                analyses.orig(),
                analyses.case(index),
            )?;
        }
        self.session.record_instrumented(instrumented);
        self.session
            .record_block(setup.cases.len(), copies.len(), setup.enabled, wide.unwrap_or(false));

        Ok(InstrumentedBlock::assemble(tag, head, copies, setup.cases.to_vec(), setup.enabled))
    }
}

impl<C: DupClient> BlockPass for Engine<C> {
    fn name(&self) -> &'static str {
        PASS_NAME
    }

    fn priority(&self) -> i32 {
        PASS_PRIORITY
    }

    fn instrument_block(&mut self, tag: u64, bb: InstrList) -> DupResult<InstrList> {
        Engine::<C>::instrument_block(self, tag, bb).map(InstrumentedBlock::into_list)
    }
}

impl<C: DupClient> Drop for Engine<C> {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.tls.release(PASS_NAME) {
                log::warn!("bbdup dropped without exit: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::instr::InstrId;
    use crate::core::instrument::InstrumentCursor;
    use crate::core::test_utils::test::{self, host_tls};
    use crate::core::DupStatus;
    use iced_x86::code_asm::*;

    struct Fixed {
        cases: Vec<CaseEncoding>,
        fail_on: Option<CaseEncoding>,
    }

    impl DupClient for Fixed {
        type OrigAnalysis = ();
        type CaseAnalysis = CaseEncoding;

        fn set_up_bb_dups(&mut self, ctx: &mut DupContext<'_>, _tag: u64, _bb: &InstrList) -> DupResult<()> {
            for &c in &self.cases {
                ctx.register_case_encoding(c)?;
            }
            Ok(())
        }

        fn analyze_orig(&mut self, _tag: u64, _bb: &InstrList) -> Option<()> {
            Some(())
        }

        fn analyze_case(&mut self, _tag: u64, _bb: &InstrList, encoding: CaseEncoding, _orig: Option<&()>) -> Option<CaseEncoding> {
            Some(encoding)
        }

        fn insert_encode(&mut self, _region: &mut EncodeRegion<'_>, _tag: u64, _orig: Option<&()>) -> DupResult<()> {
            Ok(())
        }

        fn instrument_instr(
            &mut self,
            cursor: &mut InstrumentCursor<'_>,
            _instr: InstrId,
            _orig: Option<&()>,
            case: Option<&CaseEncoding>,
        ) -> DupResult<()> {
            assert_eq!(case, Some(&cursor.encoding()));
            if Some(cursor.encoding()) == self.fail_on {
                return Err(DupError::failed("client refused"));
            }
            Ok(())
        }
    }

    fn block() -> InstrList {
        test::block(|a| {
            a.inc(rdx)?;
            a.ret()
        })
    }

    #[test]
    fn test_zero_limit_is_invalid() {
        let tls = host_tls();
        let client = Fixed { cases: vec![], fail_on: None };
        let result = Engine::init(tls.clone(), DupOptions::default().with_dup_limit(0), client);
        assert_eq!(DupStatus::from(&result), DupStatus::InvalidParameter);
        // Nothing was reserved, so a valid init still succeeds.
        let client = Fixed { cases: vec![], fail_on: None };
        assert!(Engine::init(tls, DupOptions::default(), client).is_ok());
    }

    #[test]
    fn test_double_init_and_exit() {
        let tls = host_tls();
        let first = Engine::init(tls.clone(), DupOptions::default(), Fixed { cases: vec![], fail_on: None }).unwrap();
        let second = Engine::init(tls.clone(), DupOptions::default(), Fixed { cases: vec![], fail_on: None });
        assert_eq!(second.err(), Some(DupError::AlreadyInitialised));

        first.exit().unwrap();
        let again = Engine::init(tls, DupOptions::default(), Fixed { cases: vec![], fail_on: None }).unwrap();
        assert_eq!(again.name(), PASS_NAME);
        assert_eq!(again.priority(), PASS_PRIORITY);
    }

    #[test]
    fn test_exit_after_host_release_fails() {
        let tls = host_tls();
        let engine = Engine::init(tls.clone(), DupOptions::default(), Fixed { cases: vec![], fail_on: None }).unwrap();
        tls.release(PASS_NAME).unwrap();
        assert_eq!(DupStatus::from(&engine.exit()), DupStatus::Error);
    }

    #[test]
    fn test_drop_releases_reservation() {
        let tls = host_tls();
        {
            let _engine = Engine::init(tls.clone(), DupOptions::default(), Fixed { cases: vec![], fail_on: None }).unwrap();
        }
        assert!(Engine::init(tls, DupOptions::default(), Fixed { cases: vec![], fail_on: None }).is_ok());
    }

    #[test]
    fn test_failure_still_tears_down() {
        let tls = host_tls();
        let client = Fixed { cases: vec![1, 2], fail_on: Some(1) };
        let mut engine = Engine::init(tls, DupOptions::default(), client).unwrap();

        let err = engine.instrument_block(0x1000, block()).unwrap_err();
        assert_eq!(err.status(), DupStatus::Error);
        let stats = engine.stats();
        assert_eq!(stats.analyses_created, 4);
        assert_eq!(stats.analyses_destroyed, 4);
        assert_eq!(stats.blocks_failed, 1);
    }

    #[test]
    fn test_setup_error_keeps_registered_cases() {
        let tls = host_tls();
        let client = Fixed { cases: vec![1, 1, 2], fail_on: None };
        let mut engine = Engine::init(tls, DupOptions::default(), client).unwrap();
        let block = engine.instrument_block(0x1000, block()).unwrap();
        // Registration stopped at the duplicate, so case 2 never made it in.
        assert_eq!(block.cases(), &[1]);
        assert!(block.dispatched());
        assert_eq!(block.copies().len(), 2);

        let stats = engine.stats();
        assert_eq!(stats.registrations_rejected, 1);
        assert_eq!(stats.setup_errors, 1);
        assert_eq!(stats.blocks_failed, 0);
        assert_eq!(stats.blocks_duplicated, 1);
        assert_eq!(stats.analyses_created, 3);
        assert_eq!(stats.analyses_destroyed, 3);
    }

    #[test]
    fn test_registry_lives_in_session_arena() {
        let tls = host_tls();
        let client = Fixed { cases: vec![4, 5], fail_on: None };
        let mut engine = Engine::init(tls, DupOptions::default(), client).unwrap();
        assert_eq!(engine.session.arena_bytes(), 0);
        let block = engine.instrument_block(0x1000, block()).unwrap();
        assert_eq!(block.cases(), &[4, 5]);
        assert!(engine.session.arena_bytes() > 0);
    }

    #[test]
    fn test_block_pass_returns_list() {
        let tls = host_tls();
        let client = Fixed { cases: vec![7], fail_on: None };
        let mut engine = Engine::init(tls, DupOptions::default(), client).unwrap();
        let list = BlockPass::instrument_block(&mut engine, 0x1000, block()).unwrap();
        assert_eq!(list.app_ids().len(), 4);
        assert_eq!(engine.stats().blocks_duplicated, 1);
        assert_eq!(engine.stats().copies_emitted, 2);

        let empty = engine.instrument_block(0x2000, InstrList::new());
        assert_eq!(DupStatus::from(&empty), DupStatus::InvalidParameter);
    }
}
