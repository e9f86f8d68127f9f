use crate::{EvictionError, NumaError, ScrubError};
use gpu_memory_addresses::PageSizeError;

/// Failure of an allocator operation.
///
/// Every failing call has already undone its bitmap changes when it returns
/// one of these.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmaError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("out of memory")]
    NoMemory,
    #[error("memory is being evicted")]
    InUse,
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("scrubber failed; scrub-on-free is disabled until a scrubber is registered again")]
    ScrubberFailed,
}

/// Coarse classification of a [`PmaError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed request; nothing was changed.
    CallerError,
    /// Not enough memory right now; retrying later or with other flags may work.
    ResourceExhaustion,
    /// The target is busy (e.g. being evicted).
    TransientConflict,
    /// The scrubber failed; the allocator keeps working without scrub-on-free.
    FatalDegraded,
}

impl PmaError {
    #[must_use]
    pub const fn class(self) -> ErrorClass {
        match self {
            Self::InvalidArgument(_) | Self::InvalidState(_) => ErrorClass::CallerError,
            Self::NoMemory => ErrorClass::ResourceExhaustion,
            Self::InUse => ErrorClass::TransientConflict,
            Self::ScrubberFailed => ErrorClass::FatalDegraded,
        }
    }

    /// `true` if the same call may succeed when simply retried later.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self.class(),
            ErrorClass::ResourceExhaustion | ErrorClass::TransientConflict
        )
    }
}

impl From<PageSizeError> for PmaError {
    fn from(_: PageSizeError) -> Self {
        Self::InvalidArgument("unsupported page size")
    }
}

impl From<ScrubError> for PmaError {
    fn from(_: ScrubError) -> Self {
        Self::ScrubberFailed
    }
}

/// A failed eviction means the frames could not be reclaimed.
impl From<EvictionError> for PmaError {
    fn from(_: EvictionError) -> Self {
        Self::NoMemory
    }
}

impl From<NumaError> for PmaError {
    fn from(err: NumaError) -> Self {
        match err {
            NumaError::OutOfMemory => Self::NoMemory,
            NumaError::Offline => Self::InvalidState("NUMA node is offline"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        assert_eq!(PmaError::InvalidArgument("x").class(), ErrorClass::CallerError);
        assert_eq!(PmaError::NoMemory.class(), ErrorClass::ResourceExhaustion);
        assert_eq!(PmaError::InUse.class(), ErrorClass::TransientConflict);
        assert_eq!(PmaError::ScrubberFailed.class(), ErrorClass::FatalDegraded);
        assert!(PmaError::InUse.is_retryable());
        assert!(!PmaError::InvalidState("x").is_retryable());
    }

    #[test]
    fn conversions() {
        assert_eq!(
            PmaError::from(PageSizeError(0x1000)),
            PmaError::InvalidArgument("unsupported page size")
        );
        assert_eq!(PmaError::from(ScrubError::Engine), PmaError::ScrubberFailed);
        assert_eq!(PmaError::from(EvictionError::Failed), PmaError::NoMemory);
    }
}
