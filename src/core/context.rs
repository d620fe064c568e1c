// This module implements the case registry: the per-block DupContext handed to the user's
// setup callback. It records the default encoding, whether duplication is enabled for the
// block, and the ordered list of registered non-default encodings, allocated in the
// engine's per-block bumpalo arena. The registry outlives the callback: the engine keeps
// the arena slice for the whole block and resets the arena when the next block starts. Registration
// enforces the invariants the dispatcher relies on: no encoding is registered twice, the
// default is never also a registered case, and the number of cases never exceeds the
// configured limit. A rejected call leaves the registry exactly as it was. Registration
// order is preserved because it fixes both the compare order and the copy layout.

//! Per-block case registry.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use super::error::{DupError, DupResult};
use super::slot::CaseEncoding;

/// Default encoding a block starts with until the setup callback changes it.
pub const DEFAULT_ENCODING: CaseEncoding = 0;

/// Duplication context for one basic block.
///
/// Only the setup callback ever sees a `DupContext`, so registration outside
/// setup cannot be expressed.
pub struct DupContext<'a> {
    default: CaseEncoding,
    enable_dups: bool,
    cases: BumpVec<'a, CaseEncoding>,
    limit: u16,
    rejected: u32,
}

impl<'a> DupContext<'a> {
    pub(crate) fn new(arena: &'a Bump, limit: u16) -> Self {
        Self {
            default: DEFAULT_ENCODING,
            enable_dups: true,
            cases: BumpVec::with_capacity_in(limit as usize, arena),
            limit,
            rejected: 0,
        }
    }

    /// Register a non-default case encoding for this block.
    pub fn register_case_encoding(&mut self, encoding: CaseEncoding) -> DupResult<()> {
        let result = self.check_registration(encoding);
        match &result {
            Ok(()) => {
                self.cases.push(encoding);
                log::trace!("registered case {:#x} ({}/{})", encoding, self.cases.len(), self.limit);
            }
            Err(e) => {
                self.rejected += 1;
                log::warn!("case {:#x} rejected: {}", encoding, e);
            }
        }
        result
    }

    fn check_registration(&self, encoding: CaseEncoding) -> DupResult<()> {
        if !self.enable_dups {
            return Err(DupError::invalid("duplication is disabled for this block"));
        }
        if encoding == self.default || self.cases.contains(&encoding) {
            return Err(DupError::CaseAlreadyRegistered { encoding });
        }
        if self.cases.len() >= self.limit as usize {
            return Err(DupError::CaseLimitReached { limit: self.limit });
        }
        Ok(())
    }

    /// Choose the default encoding. It must not be a registered case.
    pub fn set_default_encoding(&mut self, encoding: CaseEncoding) -> DupResult<()> {
        if self.cases.contains(&encoding) {
            return Err(DupError::CaseAlreadyRegistered { encoding });
        }
        self.default = encoding;
        Ok(())
    }

    /// Enable or disable duplication for this block.
    ///
    /// Disabling drops any cases registered so far.
    pub fn set_enable_dups(&mut self, enable: bool) {
        if !enable {
            self.cases.clear();
        }
        self.enable_dups = enable;
    }

    pub fn default_encoding(&self) -> CaseEncoding {
        self.default
    }

    pub fn enable_dups(&self) -> bool {
        self.enable_dups
    }

    /// Registered cases in registration order.
    pub fn cases(&self) -> &[CaseEncoding] {
        &self.cases
    }

    pub fn limit(&self) -> u16 {
        self.limit
    }

    pub(crate) fn rejected(&self) -> u32 {
        self.rejected
    }

    /// Close the registry, leaving the cases in the arena.
    pub(crate) fn into_cases(self) -> &'a [CaseEncoding] {
        self.cases.into_bump_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::DupStatus;

    #[test]
    fn test_registration_scenario() {
        let arena = Bump::new();
        let mut ctx = DupContext::new(&arena, 2);

        assert!(ctx.register_case_encoding(1).is_ok());
        assert!(ctx.register_case_encoding(2).is_ok());
        assert_eq!(
            ctx.register_case_encoding(2),
            Err(DupError::CaseAlreadyRegistered { encoding: 2 })
        );
        assert_eq!(
            ctx.register_case_encoding(3),
            Err(DupError::CaseLimitReached { limit: 2 })
        );
        assert_eq!(ctx.cases(), &[1, 2]);
        assert_eq!(ctx.rejected(), 2);
    }

    #[test]
    fn test_default_cannot_be_registered() {
        let arena = Bump::new();
        let mut ctx = DupContext::new(&arena, 4);
        ctx.set_default_encoding(7).unwrap();
        let status = DupStatus::from(&ctx.register_case_encoding(7));
        assert_eq!(status, DupStatus::CaseAlreadyRegistered);
        assert!(ctx.cases().is_empty());
    }

    #[test]
    fn test_default_cannot_collide_with_case() {
        let arena = Bump::new();
        let mut ctx = DupContext::new(&arena, 4);
        ctx.register_case_encoding(5).unwrap();
        assert_eq!(
            ctx.set_default_encoding(5),
            Err(DupError::CaseAlreadyRegistered { encoding: 5 })
        );
        assert_eq!(ctx.default_encoding(), DEFAULT_ENCODING);
    }

    #[test]
    fn test_disabled_block_rejects_registration() {
        let arena = Bump::new();
        let mut ctx = DupContext::new(&arena, 4);
        ctx.register_case_encoding(1).unwrap();
        ctx.set_enable_dups(false);
        assert!(ctx.cases().is_empty());

        let status = DupStatus::from(&ctx.register_case_encoding(2));
        assert_eq!(status, DupStatus::InvalidParameter);
        assert!(ctx.cases().is_empty());
    }

    #[test]
    fn test_registration_order_is_kept() {
        let arena = Bump::new();
        let mut ctx = DupContext::new(&arena, 8);
        for enc in [9, 3, 0x1_0000_0000, 4] {
            ctx.register_case_encoding(enc).unwrap();
        }
        assert_eq!(ctx.cases(), &[9, 3, 0x1_0000_0000, 4]);
    }

    #[test]
    fn test_cases_stay_in_arena() {
        let arena = Bump::new();
        let mut ctx = DupContext::new(&arena, 4);
        ctx.register_case_encoding(2).unwrap();
        ctx.register_case_encoding(6).unwrap();
        let used = arena.allocated_bytes();
        let cases = ctx.into_cases();
        assert_eq!(cases, &[2, 6]);
        assert_eq!(arena.allocated_bytes(), used);
    }
}
