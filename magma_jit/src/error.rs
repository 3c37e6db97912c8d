//! Error types surfaced by the code manager.

use std::fmt;

/// Errors from code-heap and code-manager operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeManagerError {
    /// No virtual-memory gap of the required size exists within
    /// PC-relative reach of the helper anchor.
    OutOfAddressSpace { requested: usize },
    /// The current heap cannot satisfy the allocation. The driver
    /// recovers by spinning up a fresh manager instance.
    HeapFull,
    /// The OS unwinder rejected the frame. Treated as a runtime
    /// invariant violation by stack walkers.
    UnwindFailed { pc: usize },
}

impl fmt::Display for CodeManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeManagerError::OutOfAddressSpace { requested } => {
                write!(
                    f,
                    "no free address-space gap of {} bytes within helper reach",
                    requested
                )
            }
            CodeManagerError::HeapFull => write!(f, "code heap exhausted"),
            CodeManagerError::UnwindFailed { pc } => {
                write!(f, "OS unwinder rejected frame at pc {:#x}", pc)
            }
        }
    }
}

impl std::error::Error for CodeManagerError {}

/// Errors from generic-instantiation unification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnifyError {
    /// The bucket array cannot grow any further; the whole batch is
    /// rejected so the caller can report a load failure.
    TableLimitReached { entries: usize },
}

impl fmt::Display for UnifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnifyError::TableLimitReached { entries } => {
                write!(
                    f,
                    "generic unification table cannot grow beyond {} entries",
                    entries
                )
            }
        }
    }
}

impl std::error::Error for UnifyError {}
