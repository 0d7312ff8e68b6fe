//! # CONDUIT Error Handling
//!
//! Error types for the command submission stack.
//!
//! Errors fall into four kinds:
//! - transient exhaustion, retried by the caller's wait loop
//! - usage errors, returned to the caller and never escalated
//! - hardware completion errors, escalated to the manager-wide fatal state
//! - integrity errors, fatal on first sight

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// CONDUIT Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// CONDUIT unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Operation timed out
    Timeout,
    /// Resource is busy
    Busy,
    /// Access denied
    AccessDenied,
    /// Operation not supported on this device or channel
    NotSupported,
    /// Object is not in a state that allows the operation
    InvalidState,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Out of memory
    OutOfMemory,

    // =========================================================================
    // Command Submission Errors
    // =========================================================================
    /// Push larger than the maximum push size
    PushTooLarge,
    /// Push wrote past its reserved space
    PushBufferOverflow,
    /// GPFIFO ring overflow
    RingOverflow,

    // =========================================================================
    // Hardware Errors
    // =========================================================================
    /// Channel hit a robust-channel error
    ChannelError,
    /// Uncorrectable ECC error reported
    EccError,
    /// Device layer failure with a raw status code
    DeviceFailure(u32),

    // =========================================================================
    // Semaphore Errors
    // =========================================================================
    /// Tracking semaphore jumped further than the queue depth allows
    SemaphoreJump,
    /// GPU reported completion of work that was never queued
    CompletionOverrun,

    // =========================================================================
    // Secure Launch Errors
    // =========================================================================
    /// Authentication or decryption failed
    IntegrityFailure,
    /// Indirect launch could not be submitted
    IndirectLaunchFailed,
    /// Secure launch schedule has not been primed
    SecureLaunchNotReady,
    /// Key rotation failed
    KeyRotationFailed,
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// Resource exhaustion, retried locally
    Transient,
    /// Caller error, returned as-is
    Usage,
    /// Hardware completion error, escalated to fatal
    Hardware,
    /// Decryption or integrity failure, escalated to fatal
    Integrity,
}

impl Error {
    /// Classify the error
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::Busy | Self::OutOfMemory | Self::Timeout | Self::RingOverflow => {
                ErrorKind::Transient
            }
            Self::InvalidParameter
            | Self::NotFound
            | Self::AccessDenied
            | Self::NotSupported
            | Self::InvalidState
            | Self::PushTooLarge
            | Self::PushBufferOverflow
            | Self::SecureLaunchNotReady => ErrorKind::Usage,
            Self::ChannelError
            | Self::EccError
            | Self::DeviceFailure(_)
            | Self::SemaphoreJump
            | Self::CompletionOverrun => ErrorKind::Hardware,
            Self::IntegrityFailure | Self::IndirectLaunchFailed | Self::KeyRotationFailed => {
                ErrorKind::Integrity
            }
        }
    }

    /// Whether this error poisons the owning channel manager
    pub const fn is_fatal(self) -> bool {
        matches!(self.kind(), ErrorKind::Hardware | ErrorKind::Integrity)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Busy => write!(f, "resource busy"),
            Self::AccessDenied => write!(f, "access denied"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::InvalidState => write!(f, "invalid state"),

            // Memory
            Self::OutOfMemory => write!(f, "out of memory"),

            // Submission
            Self::PushTooLarge => write!(f, "push exceeds maximum push size"),
            Self::PushBufferOverflow => write!(f, "push buffer overflow"),
            Self::RingOverflow => write!(f, "GPFIFO ring overflow"),

            // Hardware
            Self::ChannelError => write!(f, "robust channel error"),
            Self::EccError => write!(f, "uncorrectable ECC error"),
            Self::DeviceFailure(code) => write!(f, "device failure: 0x{:08x}", code),

            // Semaphore
            Self::SemaphoreJump => write!(f, "tracking semaphore jumped too far"),
            Self::CompletionOverrun => write!(f, "completed value exceeds queued value"),

            // Secure
            Self::IntegrityFailure => write!(f, "integrity check failed"),
            Self::IndirectLaunchFailed => write!(f, "indirect launch failed"),
            Self::SecureLaunchNotReady => write!(f, "secure launch not ready"),
            Self::KeyRotationFailed => write!(f, "key rotation failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::string::ToString;

    #[test]
    fn test_kinds() {
        assert_eq!(Error::Busy.kind(), ErrorKind::Transient);
        assert_eq!(Error::PushTooLarge.kind(), ErrorKind::Usage);
        assert_eq!(Error::EccError.kind(), ErrorKind::Hardware);
        assert_eq!(Error::IntegrityFailure.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_fatal() {
        assert!(Error::ChannelError.is_fatal());
        assert!(Error::CompletionOverrun.is_fatal());
        assert!(Error::IndirectLaunchFailed.is_fatal());
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::NotSupported.is_fatal());
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::DeviceFailure(0x1f).to_string(), "device failure: 0x0000001f");
        assert_eq!(Error::RingOverflow.to_string(), "GPFIFO ring overflow");
    }
}
