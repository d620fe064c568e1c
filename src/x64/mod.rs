//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Builders for the meta instructions dispatch is made of
//! - Lowering of instrumented blocks using iced-x86
//! - ELF object output with one symbol per copy and relocations for outside targets

pub mod encoder;
pub mod meta;
pub mod object;

pub use encoder::{assemble, AssembledBlock, AssembledCopy, EncodedCode, EncodingError, X64Encoder};
pub use self::object::{block_symbol, copy_symbol, external_refs, external_symbol, write_object, ExternalRef};
