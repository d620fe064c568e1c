// This module defines the error types for the bbdup engine using the thiserror crate.
// DupError is the single error enum returned by every engine operation: parameter
// validation failures, duplicate case registrations, exceeding the per-block case limit,
// double initialisation, and a generic Error variant carrying context for host, encoder
// and decoder failures. DupStatus is the flat status code view of a DupResult, for hosts
// that report results as plain codes rather than Rust errors. Conversions from
// iced_x86::IcedError and the host's HostError keep `?` usable across the engine.

//! Error types for the duplication engine.
//!
//! Using thiserror for idiomatic error handling.

use thiserror::Error;

use super::host::HostError;

/// Main error type for duplication operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DupError {
    #[error("Invalid parameter: {reason}")]
    InvalidParameter { reason: String },

    #[error("Case encoding {encoding:#x} is already registered")]
    CaseAlreadyRegistered { encoding: usize },

    #[error("Case limit of {limit} reached")]
    CaseLimitReached { limit: u16 },

    #[error("Duplication engine is already initialised")]
    AlreadyInitialised,

    #[error("Duplication failed: {reason}")]
    Error { reason: String },
}

impl DupError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        DupError::InvalidParameter { reason: reason.into() }
    }

    pub(crate) fn failed(reason: impl Into<String>) -> Self {
        DupError::Error { reason: reason.into() }
    }

    /// Flat status code for this error.
    pub fn status(&self) -> DupStatus {
        match self {
            DupError::InvalidParameter { .. } => DupStatus::InvalidParameter,
            DupError::CaseAlreadyRegistered { .. } => DupStatus::CaseAlreadyRegistered,
            DupError::CaseLimitReached { .. } => DupStatus::CaseLimitReached,
            DupError::AlreadyInitialised => DupStatus::AlreadyInitialised,
            DupError::Error { .. } => DupStatus::Error,
        }
    }
}

impl From<iced_x86::IcedError> for DupError {
    fn from(e: iced_x86::IcedError) -> Self {
        DupError::failed(format!("encoder: {e}"))
    }
}

impl From<HostError> for DupError {
    fn from(e: HostError) -> Self {
        match e {
            HostError::AlreadyReserved { .. } => DupError::AlreadyInitialised,
            other => DupError::failed(other.to_string()),
        }
    }
}

/// Result type alias for duplication operations.
pub type DupResult<T> = Result<T, DupError>;

/// Uniform status code reported by every engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DupStatus {
    Success,
    InvalidParameter,
    CaseAlreadyRegistered,
    CaseLimitReached,
    AlreadyInitialised,
    Error,
}

impl<T> From<&DupResult<T>> for DupStatus {
    fn from(result: &DupResult<T>) -> Self {
        match result {
            Ok(_) => DupStatus::Success,
            Err(e) => e.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let ok: DupResult<()> = Ok(());
        assert_eq!(DupStatus::from(&ok), DupStatus::Success);

        let dup: DupResult<()> = Err(DupError::CaseAlreadyRegistered { encoding: 2 });
        assert_eq!(DupStatus::from(&dup), DupStatus::CaseAlreadyRegistered);

        let limit: DupResult<()> = Err(DupError::CaseLimitReached { limit: 2 });
        assert_eq!(DupStatus::from(&limit), DupStatus::CaseLimitReached);

        assert_eq!(DupError::invalid("x").status(), DupStatus::InvalidParameter);
        assert_eq!(DupError::failed("x").status(), DupStatus::Error);
    }

    #[test]
    fn test_host_reservation_maps_to_already_initialised() {
        let err: DupError = HostError::AlreadyReserved { owner: "bbdup" }.into();
        assert_eq!(err, DupError::AlreadyInitialised);

        let err: DupError = HostError::NotReserved { owner: "bbdup" }.into();
        assert_eq!(err.status(), DupStatus::Error);
    }

    #[test]
    fn test_error_messages() {
        let err = DupError::CaseAlreadyRegistered { encoding: 0x2a };
        assert_eq!(err.to_string(), "Case encoding 0x2a is already registered");
        assert_eq!(
            DupError::CaseLimitReached { limit: 4 }.to_string(),
            "Case limit of 4 reached"
        );
    }
}
