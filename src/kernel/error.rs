//! Unified Kernel Error Type
//!
//! Single error type for every operation that can fail across the syscall
//! boundary. Each variant's discriminant IS the negative errno value the
//! caller sees, so `to_errno()` is a plain cast. Recoverable errors are
//! returned and propagate with `?`; programming errors (releasing a lock the
//! caller does not own, waiting outside the running thread) are asserted and
//! halt the kernel.

/// Result type used throughout the kernel.
pub type KResult<T> = Result<T, KernelError>;

/// Kernel error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum KernelError {
    /// Bad argument, misalignment, zero-length string (EINVAL)
    InvalidArg = -1,
    /// Kernel allocation failed (ENOMEM)
    OutOfMemory = -2,
    /// Operation absent from the I/O object (ENOTSUP)
    NotSupported = -3,
    /// Name not found (ENOENT)
    NotFound = -4,
    /// File descriptor out of range or unused (EBADFD)
    BadFd = -5,
    /// File descriptor table full (EMFILE)
    OutOfFds = -6,
    /// Process table full (EMPROC)
    OutOfProcs = -7,
    /// Thread table full (EMTHR)
    OutOfThreads = -8,
    /// No child to wait for (ECHILD)
    NoChild = -9,
    /// Permission denial or out-of-range memory (EACCESS)
    AccessDenied = -10,
    /// Single-open device already open (EBUSY)
    Busy = -11,
    /// Device reported failure (EIO)
    Io = -12,
    /// Peer endpoint closed (EPIPE)
    PipeClosed = -13,
    /// Filesystem data-block bitmap exhausted (ENODATABLKS)
    NoDataBlocks = -14,
    /// Filesystem inode bitmap exhausted (ENOINODEBLKS)
    NoInodeBlocks = -15,
}

impl KernelError {
    /// Errno value returned to userspace. The discriminant already is the
    /// errno, so this is a zero-cost cast.
    pub fn to_errno(self) -> i64 {
        self as i64
    }

    /// Reconstruct an error from an errno value. Unknown values collapse to
    /// `InvalidArg`.
    pub fn from_errno(e: i64) -> Self {
        match e {
            -1 => KernelError::InvalidArg,
            -2 => KernelError::OutOfMemory,
            -3 => KernelError::NotSupported,
            -4 => KernelError::NotFound,
            -5 => KernelError::BadFd,
            -6 => KernelError::OutOfFds,
            -7 => KernelError::OutOfProcs,
            -8 => KernelError::OutOfThreads,
            -9 => KernelError::NoChild,
            -10 => KernelError::AccessDenied,
            -11 => KernelError::Busy,
            -12 => KernelError::Io,
            -13 => KernelError::PipeClosed,
            -14 => KernelError::NoDataBlocks,
            -15 => KernelError::NoInodeBlocks,
            _ => KernelError::InvalidArg,
        }
    }
}

/// Collapse a `KResult` into the single signed return slot of the syscall
/// ABI: payload on success, negative errno on failure.
pub fn errno_or<T: Into<i64>>(r: KResult<T>) -> i64 {
    match r {
        Ok(v) => v.into(),
        Err(e) => e.to_errno(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_errors_negative() {
        let errors = [
            KernelError::InvalidArg,
            KernelError::OutOfMemory,
            KernelError::NotSupported,
            KernelError::NotFound,
            KernelError::BadFd,
            KernelError::OutOfFds,
            KernelError::OutOfProcs,
            KernelError::OutOfThreads,
            KernelError::NoChild,
            KernelError::AccessDenied,
            KernelError::Busy,
            KernelError::Io,
            KernelError::PipeClosed,
            KernelError::NoDataBlocks,
            KernelError::NoInodeBlocks,
        ];
        for e in &errors {
            assert!(e.to_errno() < 0, "{:?} should be negative", e);
        }
    }

    #[test]
    fn test_errno_roundtrip() {
        for e in [
            KernelError::InvalidArg,
            KernelError::NotFound,
            KernelError::PipeClosed,
            KernelError::NoDataBlocks,
            KernelError::NoInodeBlocks,
        ] {
            assert_eq!(KernelError::from_errno(e.to_errno()), e);
        }
    }

    #[test]
    fn test_unknown_errno_collapses() {
        assert_eq!(KernelError::from_errno(-999), KernelError::InvalidArg);
    }

    #[test]
    fn test_errno_or() {
        assert_eq!(errno_or::<i64>(Ok(7)), 7);
        assert_eq!(errno_or::<i64>(Err(KernelError::BadFd)), -5);
    }
}
