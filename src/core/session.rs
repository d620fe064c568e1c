// This module provides arena-based session management for the duplication engine using the
// bumpalo crate. DupSession is owned by the engine and lives as long as it does. It owns
// the arena per-block registries are allocated in. The engine takes the arena out for the
// duration of one block, so the registry can be borrowed by every pipeline stage, and hands
// it back afterwards; taking it resets it, so a long-running host never holds more than one
// block's registry. The session also gathers DupStats: how many blocks were seen, duplicated
// or left single, how many copies and cases were produced, how often dispatch needed a wide
// compare, how many registrations were rejected, how many setup callbacks stopped with an
// error, and how many analysis results were created and destroyed. The case-count
// histogram is kept in a hashbrown map and printed largest bucket first.

//! Arena and statistics for the duplication engine.

use std::fmt;

use bumpalo::Bump;
use hashbrown::HashMap;

use super::analysis::AnalysisCounts;

/// Engine-lifetime session state.
#[derive(Default)]
pub struct DupSession {
    /// Arena for per-block registries.
    arena: Bump,

    /// Session statistics.
    stats: DupStats,
}

impl DupSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the arena for a new block, dropping what the previous block left in it.
    pub fn take_arena(&mut self) -> Bump {
        let mut arena = std::mem::take(&mut self.arena);
        arena.reset();
        arena
    }

    /// Hand the arena back once a block is finished.
    pub fn restore_arena(&mut self, arena: Bump) {
        self.arena = arena;
    }

    /// Bytes currently held by the arena.
    pub fn arena_bytes(&self) -> usize {
        self.arena.allocated_bytes()
    }

    pub fn stats(&self) -> &DupStats {
        &self.stats
    }

    pub fn record_block_seen(&mut self) {
        self.stats.blocks_seen += 1;
    }

    pub fn record_rejected(&mut self, count: u32) {
        self.stats.registrations_rejected += count as usize;
    }

    pub fn record_setup_error(&mut self) {
        self.stats.setup_errors += 1;
    }

    /// Record the shape of a finished block.
    pub fn record_block(&mut self, cases: usize, copies: usize, dispatched: bool, wide: bool) {
        let stats = &mut self.stats;
        if dispatched {
            stats.blocks_duplicated += 1;
            *stats.case_counts.entry(cases).or_insert(0) += 1;
        } else {
            stats.blocks_single += 1;
        }
        if wide {
            stats.wide_dispatches += 1;
        }
        stats.copies_emitted += copies;
        stats.cases_registered += cases;
        stats.largest_case_count = stats.largest_case_count.max(cases);
    }

    pub fn record_instrumented(&mut self, instrs: usize) {
        self.stats.instrs_instrumented += instrs;
    }

    pub fn record_analyses(&mut self, counts: AnalysisCounts) {
        self.stats.analyses_created += counts.orig_created + counts.case_created;
        self.stats.analyses_destroyed += counts.destroyed;
    }

    pub fn record_failure(&mut self) {
        self.stats.blocks_failed += 1;
    }
}

/// Duplication statistics.
#[derive(Debug, Default, Clone)]
pub struct DupStats {
    /// Blocks handed to the engine.
    pub blocks_seen: usize,

    /// Blocks emitted with dispatch.
    pub blocks_duplicated: usize,

    /// Blocks emitted as a single copy.
    pub blocks_single: usize,

    /// Blocks whose instrumentation returned an error.
    pub blocks_failed: usize,

    /// Copies emitted, default copies included.
    pub copies_emitted: usize,

    /// Non-default cases registered.
    pub cases_registered: usize,

    /// Registrations rejected by the registry.
    pub registrations_rejected: usize,

    /// Setup callbacks that returned an error; their blocks kept the cases registered before it.
    pub setup_errors: usize,

    /// Dispatch sequences that compared a 64-bit value.
    pub wide_dispatches: usize,

    /// App instructions passed to instrumentation.
    pub instrs_instrumented: usize,

    /// Analysis results created.
    pub analyses_created: usize,

    /// Analysis results destroyed.
    pub analyses_destroyed: usize,

    /// Largest number of cases on one block.
    pub largest_case_count: usize,

    /// Duplicated blocks per case count.
    pub case_counts: HashMap<usize, usize>,
}

impl fmt::Display for DupStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Duplication Statistics:")?;
        writeln!(f, "  Blocks seen: {}", self.blocks_seen)?;
        writeln!(f, "  Blocks duplicated: {}", self.blocks_duplicated)?;
        writeln!(f, "  Blocks single: {}", self.blocks_single)?;
        if self.blocks_failed > 0 {
            writeln!(f, "  Blocks failed: {}", self.blocks_failed)?;
        }
        writeln!(f, "  Copies emitted: {}", self.copies_emitted)?;
        writeln!(f, "  Cases registered: {}", self.cases_registered)?;
        writeln!(f, "  Registrations rejected: {}", self.registrations_rejected)?;
        if self.setup_errors > 0 {
            writeln!(f, "  Setup errors: {}", self.setup_errors)?;
        }
        writeln!(f, "  Wide dispatches: {}", self.wide_dispatches)?;
        writeln!(f, "  Instructions instrumented: {}", self.instrs_instrumented)?;
        writeln!(
            f,
            "  Analyses: {} created, {} destroyed",
            self.analyses_created, self.analyses_destroyed
        )?;

        if !self.case_counts.is_empty() {
            writeln!(f, "  Cases per block:")?;
            let mut sorted: Vec<_> = self.case_counts.iter().collect();
            sorted.sort_by_key(|(cases, count)| (std::cmp::Reverse(**count), **cases));

            for (cases, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", cases, count)?;
            }
        }

        Ok(())
    }
}
