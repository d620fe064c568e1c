// This module serves as the central hub for the engine's core, the part of bbdup that is
// independent of how instrumented code is finally encoded. It organises the subsystems
// leaves first: host services (TLS allocator and pass hook), the instruction list and block
// decoder, the per-thread encoding slot, the per-block case registry, the client trait,
// dispatch emission, copy construction and linkage, analysis orchestration, the
// instrumentation driver, session statistics, and the engine that runs the per-block
// pipeline. The dispatch tracer lives here as well because it executes core data
// structures rather than machine code.

//! Core duplication engine.
//!
//! # Key Components
//!
//! ## Host services (`host`, `instr`)
//! - `TlsAllocator` reservations addressed through a segment register
//! - `InstrList` of app and meta nodes, `decode_block`
//!
//! ## Registry (`context`, `slot`)
//! - Per-block `DupContext` in a bumpalo arena
//! - `EncodingSlot` descriptor and `RuntimeCtx` for helpers
//!
//! ## Duplication (`dispatch`, `duplicate`, `instrument`, `analysis`)
//! - Encode region, state save and compare chain
//! - Independent copies with restore and exit linkage
//! - Per-copy instrumentation with positional queries
//! - Shared and per-case analyses with ordered teardown
//!
//! ## Driver (`engine`, `session`, `trace`)
//! - `Engine` lifecycle and `BlockPass` hook
//! - `DupStats`
//! - Reference execution of dispatch

pub mod analysis;
pub mod client;
pub mod context;
pub mod dispatch;
pub mod duplicate;
pub mod engine;
pub mod error;
pub mod host;
pub mod instr;
pub mod instrument;
pub mod session;
pub mod slot;
pub mod test_utils;
pub mod trace;

// Re-export core components
pub use analysis::AnalysisCounts;
pub use client::DupClient;
pub use context::{DupContext, DEFAULT_ENCODING};
pub use dispatch::EncodeRegion;
pub use duplicate::{BlockCopy, CopyLayout, InstrumentedBlock};
pub use engine::{DupOptions, Engine, PASS_NAME, PASS_PRIORITY};
pub use error::{DupError, DupResult, DupStatus};
pub use host::{BlockPass, HostError, ThreadLocalTls, TlsAllocator, TlsBlock};
pub use instr::{decode_block, CleanCall, Instr, InstrId, InstrKind, InstrList, JumpCondition, LabelId};
pub use instrument::InstrumentCursor;
pub use session::{DupSession, DupStats};
pub use slot::{CaseEncoding, EncodingSlot, RuntimeCtx, SlotIndex, DUP_TLS_SLOTS};
pub use trace::{trace_dispatch, DispatchTrace, MachineState, TraceError};
