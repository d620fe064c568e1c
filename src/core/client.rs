// This module defines the DupClient trait, the interface an instrumentation tool implements
// to drive the duplication engine. It replaces a table of callback function pointers: the
// three mandatory callbacks (block setup, encode insertion, per-instruction instrumentation)
// are required methods, while the analysis and destroy pairs are provided methods whose
// defaults create no analysis data. Analysis results are associated types owned by the
// client's own code; the engine only moves them between phases and hands them back for
// destruction. Any per-tool user data lives in the implementing type itself and is
// therefore available to every callback through `self`.

//! Client callbacks.
//!
//! For every new basic block the engine invokes the callbacks in this order:
//!
//! ```text
//! set_up_bb_dups            (register_case_encoding only valid here)
//! analyze_orig              once per block
//! analyze_case              once per copy, default included
//! insert_encode             once, builds the encode region of dispatch
//! instrument_instr          per copy, per app instruction
//! destroy_case_analysis     per copy with analysis data
//! destroy_orig_analysis     if analyze_orig produced data
//! ```

use super::context::DupContext;
use super::dispatch::EncodeRegion;
use super::error::DupResult;
use super::instr::{InstrId, InstrList};
use super::instrument::InstrumentCursor;
use super::slot::CaseEncoding;

/// Callbacks through which a tool specialises basic-block copies.
pub trait DupClient {
    /// Result of the analysis shared by all copies of a block.
    type OrigAnalysis;
    /// Result of the analysis of one copy.
    type CaseAnalysis;

    /// Decide how `bb` is duplicated: pick the default encoding, enable or
    /// disable duplication and register the other cases on `ctx`.
    ///
    /// Returning an error ends registration; the block is still duplicated
    /// for the cases registered before it.
    fn set_up_bb_dups(&mut self, ctx: &mut DupContext<'_>, tag: u64, bb: &InstrList) -> DupResult<()>;

    /// Analyse the original block once for all copies.
    fn analyze_orig(&mut self, _tag: u64, _bb: &InstrList) -> Option<Self::OrigAnalysis> {
        None
    }

    /// Release data produced by [`DupClient::analyze_orig`].
    fn destroy_orig_analysis(&mut self, _analysis: Self::OrigAnalysis) {}

    /// Analyse the copy executed under `encoding`.
    fn analyze_case(
        &mut self,
        _tag: u64,
        _bb: &InstrList,
        _encoding: CaseEncoding,
        _orig: Option<&Self::OrigAnalysis>,
    ) -> Option<Self::CaseAnalysis> {
        None
    }

    /// Release data produced by [`DupClient::analyze_case`].
    fn destroy_case_analysis(
        &mut self,
        _encoding: CaseEncoding,
        _analysis: Self::CaseAnalysis,
        _orig: Option<&Self::OrigAnalysis>,
    ) {
    }

    /// Emit code computing the runtime encoding into the encoding slot.
    ///
    /// The region runs before dispatch saves any application state, so code
    /// placed here must preserve application registers and flags itself.
    /// Clean calls satisfy that.
    fn insert_encode(
        &mut self,
        region: &mut EncodeRegion<'_>,
        tag: u64,
        orig: Option<&Self::OrigAnalysis>,
    ) -> DupResult<()>;

    /// Instrument app instruction `instr` of the copy behind `cursor`.
    fn instrument_instr(
        &mut self,
        cursor: &mut InstrumentCursor<'_>,
        instr: InstrId,
        orig: Option<&Self::OrigAnalysis>,
        case: Option<&Self::CaseAnalysis>,
    ) -> DupResult<()>;
}
