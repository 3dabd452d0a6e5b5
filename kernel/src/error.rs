//! Error types for the virtual-memory subsystem
//!
//! Replaces the raw sentinel-integer error codes of the original C
//! implementation with a proper Rust error type.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// EFAULT-class: access to an address outside any region, or a
    /// region-permission violation.
    InvalidAddress { addr: usize },
    /// EFAULT-class: address space or fault context is missing.
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    /// EINVAL-class: bad argument to an operation (fault type, sbrk amount).
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    /// ENOMEM-class: frame table exhausted.
    OutOfMemory { requested: usize, available: usize },
    /// ENOMEM-class: a region or the heap cannot grow into occupied space.
    ResourceExhausted { resource: &'static str },
    /// Subsystem not initialized (called before `VmSystem::init`).
    NotInitialized { subsystem: &'static str },
    /// `VmSystem::init` called more than once.
    AlreadyExists { resource: &'static str },
    /// Lookup of a region, address space, or frame that does not exist.
    NotFound { resource: &'static str },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAddress { addr } => write!(f, "invalid address: 0x{:x}", addr),
            Self::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, got {}", expected, actual)
            }
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {}", name, value)
            }
            Self::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of memory: requested {} frame(s), {} available",
                requested, available
            ),
            Self::ResourceExhausted { resource } => write!(f, "resource exhausted: {}", resource),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::AlreadyExists { resource } => write!(f, "{} already exists", resource),
            Self::NotFound { resource } => write!(f, "{} not found", resource),
        }
    }
}

/// Helper macro for easy error creation
#[macro_export]
macro_rules! kernel_error {
    (InvalidAddress { addr: $addr:expr }) => {
        $crate::error::KernelError::InvalidAddress { addr: $addr }
    };
    (OutOfMemory { requested: $req:expr, available: $avail:expr }) => {
        $crate::error::KernelError::OutOfMemory {
            requested: $req,
            available: $avail,
        }
    };
    (InvalidArgument { $name:expr => $value:expr }) => {
        $crate::error::KernelError::InvalidArgument {
            name: $name,
            value: $value,
        }
    };
    ($variant:ident) => {
        $crate::error::KernelError::$variant
    };
}
