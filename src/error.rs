//! Kernel error taxonomy
//!
//! `WouldBlock`, `TimedOut` and `Cancelled` are ordinary outcomes the caller
//! handles locally. `InvalidState` and `ContextViolation` are programming
//! errors; the kernel logs them and applies the configured
//! [`MisusePolicy`](crate::config::MisusePolicy) before they reach the caller.

use thiserror::Error;

/// Errors returned by kernel operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum KernelError {
    /// A non-blocking call could not complete immediately
    #[error("operation would block")]
    WouldBlock,

    /// A blocking call's deadline elapsed before it could complete
    #[error("timed out while waiting")]
    TimedOut,

    /// The object or thread is not in a state that permits the operation
    #[error("invalid state for this operation")]
    InvalidState,

    /// A blocking call was made from interrupt context or with interrupts masked
    #[error("blocking call from interrupt context")]
    ContextViolation,

    /// The thread table (or an object arena) is full
    #[error("kernel resources exhausted")]
    ResourceExhausted,

    /// The wait was cancelled by a reset, purge or cancel-wait on the object
    #[error("wait cancelled")]
    Cancelled,
}

impl KernelError {
    /// Programming errors, as opposed to expected runtime outcomes
    pub const fn is_misuse(self) -> bool {
        matches!(self, KernelError::InvalidState | KernelError::ContextViolation)
    }
}

/// Result alias used throughout the kernel
pub type KResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_misuse_classification() {
        assert!(KernelError::InvalidState.is_misuse());
        assert!(KernelError::ContextViolation.is_misuse());
        assert!(!KernelError::WouldBlock.is_misuse());
        assert!(!KernelError::TimedOut.is_misuse());
        assert!(!KernelError::Cancelled.is_misuse());
        assert!(!KernelError::ResourceExhausted.is_misuse());
    }

    #[test]
    fn test_display() {
        assert_eq!(KernelError::WouldBlock.to_string(), "operation would block");
        assert_eq!(KernelError::TimedOut.to_string(), "timed out while waiting");
    }
}
