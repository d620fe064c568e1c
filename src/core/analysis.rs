// This module implements the analysis orchestrator. AnalysisSet owns every analysis result
// produced for one block: the shared result of analyze_orig and one possibly-absent result
// per copy from analyze_case. Holding them in one place lets the engine guarantee the
// destruction protocol mechanically: every present case result is destroyed exactly once,
// in copy order, before the shared result; absent results are never passed to a destroy
// callback. Teardown consumes the set, so no result outlives it, and it also runs when
// instrumentation of the block failed part-way.

//! Shared and per-case analysis results of one block.

use super::client::DupClient;
use super::instr::InstrList;
use super::slot::CaseEncoding;

/// Counters reported by an [`AnalysisSet`] teardown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisCounts {
    pub orig_created: usize,
    pub case_created: usize,
    pub destroyed: usize,
}

struct CaseSlot<T> {
    encoding: CaseEncoding,
    data: Option<T>,
}

/// Analysis results of one block, shared and per copy.
pub(crate) struct AnalysisSet<K: DupClient> {
    orig: Option<K::OrigAnalysis>,
    cases: Vec<CaseSlot<K::CaseAnalysis>>,
}

impl<K: DupClient> AnalysisSet<K> {
    /// Run the shared analysis of `bb`.
    pub fn analyze_orig(client: &mut K, tag: u64, bb: &InstrList) -> Self {
        let orig = client.analyze_orig(tag, bb);
        Self { orig, cases: Vec::new() }
    }

    /// Run the analysis of the copy executed under `encoding`; copies are
    /// analysed in layout order, so the returned index is the copy index.
    pub fn analyze_case(&mut self, client: &mut K, tag: u64, bb: &InstrList, encoding: CaseEncoding) -> usize {
        let data = client.analyze_case(tag, bb, encoding, self.orig.as_ref());
        self.cases.push(CaseSlot { encoding, data });
        self.cases.len() - 1
    }

    pub fn orig(&self) -> Option<&K::OrigAnalysis> {
        self.orig.as_ref()
    }

    pub fn case(&self, copy: usize) -> Option<&K::CaseAnalysis> {
        self.cases.get(copy).and_then(|c| c.data.as_ref())
    }

    /// Destroy all present results: per-case first, then shared.
    pub fn teardown(self, client: &mut K) -> AnalysisCounts {
        let mut counts = AnalysisCounts {
            orig_created: usize::from(self.orig.is_some()),
            case_created: self.cases.iter().filter(|c| c.data.is_some()).count(),
            destroyed: 0,
        };

        let orig = self.orig;
        for case in self.cases {
            if let Some(data) = case.data {
                client.destroy_case_analysis(case.encoding, data, orig.as_ref());
                counts.destroyed += 1;
            }
        }
        if let Some(data) = orig {
            client.destroy_orig_analysis(data);
            counts.destroyed += 1;
        }
        counts
    }
}
