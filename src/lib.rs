//! bbdup - Basic-block multi-versioning for dynamic binary instrumentation.
//!
//! bbdup turns one basic block into several instrumented copies and a
//! dispatch sequence that picks the copy matching a per-thread runtime value,
//! the case encoding. Tools decide which encodings exist for a block and how
//! each copy is instrumented; the engine clones, links and dispatches.
//!
//! # Primary Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use bbdup::core::{decode_block, DupOptions, Engine, ThreadLocalTls};
//!
//! let tls = Arc::new(ThreadLocalTls::new());
//! let mut engine = Engine::init(tls, DupOptions::default(), MyClient::default())?;
//! let bb = decode_block(&bytes, pc)?;
//! let block = engine.instrument_block(pc, bb)?;
//! let code = bbdup::x64::assemble(&block, pc, |_| None)?;
//! engine.exit()?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Registry, duplication, dispatch, analyses and the engine
//! - [`x64`] - x86-64 meta instructions, assembly and object output

pub mod core;
pub mod x64;

// Re-export common types from organized modules
pub use crate::core::{
    // Engine
    DupOptions, Engine, BlockPass,
    // Client interface
    DupClient, DupContext, EncodeRegion, InstrumentCursor, RuntimeCtx,
    // Results
    DupError, DupResult, DupStatus, InstrumentedBlock,
    // Host services
    CaseEncoding, EncodingSlot, TlsAllocator, ThreadLocalTls,
};
