//! Test utilities for block-level testing.
//!
//! Blocks under test are written with iced's code assembler and decoded back
//! at a fixed application address, the way a host would present them.
