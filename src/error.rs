//! Error types for the allocator.
//!
//! Mirrors the policy in the design: `InvalidArgument`, `OutOfMemory`, and
//! most `IoFailure`s are returned to the caller. `Corruption` and
//! `ContractViolation` have no safe next step for the in-memory state
//! machine and are turned into a process abort by [`fatal`], the same way
//! the original C implementation's `FATAL()`/`ASSERTeq()` macros call
//! `abort()`.

/// Errors produced by pool bootstrap, allocation and recovery.
#[derive(thiserror::Error, Debug)]
pub enum PmError {
    /// A caller-supplied argument is invalid, e.g. a pool size below
    /// [`crate::layout::MIN_POOL_SIZE`].
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An I/O operation (open, fallocate, mmap, msync, pwrite) failed.
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// The pool's on-media layout is inconsistent: bad signature, a clump
    /// walk that never reaches the terminator, an impossible state byte,
    /// or negative leftover space.
    #[error("pool corruption: {0}")]
    Corruption(String),

    /// No free clump large enough to satisfy a `reserve`.
    #[error("out of memory: no free clump of the requested size")]
    OutOfMemory,

    /// A caller violated the allocator's state-machine contract, e.g.
    /// calling `on_active` on a clump that is not `RESERVED`, or
    /// registering a fourth intention.
    #[error("contract violation: {0}")]
    ContractViolation(String),
}

pub type Result<T> = std::result::Result<T, PmError>;

/// Abort the process after logging `err` at `error!` level.
///
/// Takes a [`PmError`] rather than a bare string so that every fatal call
/// site states which variant it is — [`PmError::Corruption`] for an
/// impossible on-media state, [`PmError::ContractViolation`] for a caller
/// that broke the reserve/activate contract — instead of a formatted
/// string with no type behind it. This matches the original `FATAL()`
/// macro, which prints a diagnostic and calls `abort()`.
#[track_caller]
pub fn fatal(err: PmError) -> ! {
    log::error!("{}", err);
    panic!("{}", err);
}
