//! Persistence backends: the capability for mapping a pool file and
//! making byte ranges in it durable.
//!
//! Exactly one implementation is selected when a pool is opened and held
//! for the pool's lifetime. This replaces the original C implementation's
//! mode-indexed arrays of function pointers (`Map[]`, `Persist[]`,
//! `Flush[]`, `Drain_pm_stores[]`, selected by a module-level `Mode`
//! variable) with a trait object chosen once and passed by value, per the
//! design notes: no global mutable state.

use std::os::unix::io::RawFd;

use crate::error::Result;

pub mod cacheline;
pub mod fault_injection;
pub mod pagesync;

pub use cacheline::Cacheline;
pub use fault_injection::FaultInjection;
pub use pagesync::PageSync;

/// Which persistence backend a pool uses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PersistMode {
    /// `clflush`/`clflushopt` + `sfence`, drain is a no-op (assumes ADR).
    Cacheline,
    /// Synchronous `msync(MS_SYNC)` over the affected pages.
    PageSync,
    /// Private copy-on-write mapping with positioned `pwrite` persistence,
    /// used to simulate crashes without killing a process.
    FaultInjection,
}

impl PersistMode {
    /// Read `PMALLOC_BACKEND` (`cacheline` | `pagesync` | `fault_injection`),
    /// falling back to `default` if unset or unrecognized. The library
    /// itself never calls this implicitly; only the demo binaries and the
    /// stress harness do, at `main()`.
    pub fn from_env_or(default: PersistMode) -> PersistMode {
        match std::env::var("PMALLOC_BACKEND") {
            Ok(s) => match s.as_str() {
                "cacheline" => PersistMode::Cacheline,
                "pagesync" => PersistMode::PageSync,
                "fault_injection" => PersistMode::FaultInjection,
                other => {
                    log::warn!(
                        "unrecognized PMALLOC_BACKEND={:?}, falling back to {:?}",
                        other,
                        default
                    );
                    default
                }
            },
            Err(_) => default,
        }
    }

    pub(crate) fn build(self) -> Box<dyn PersistenceBackend> {
        match self {
            PersistMode::Cacheline => Box::new(Cacheline::new()),
            PersistMode::PageSync => Box::new(PageSync::new()),
            PersistMode::FaultInjection => Box::new(FaultInjection::new()),
        }
    }
}

/// A capability for mapping a pool file and making byte ranges in it
/// durable. The allocator only ever calls [`persist`](Self::persist)
/// through this trait object; `map` is called exactly once, at pool open.
pub trait PersistenceBackend: Send + Sync {
    /// Map `len` bytes of `fd` at file offset 0 for read/write access.
    ///
    /// # Safety
    /// `fd` must refer to a regular file at least `len` bytes long.
    unsafe fn map(&mut self, fd: RawFd, len: u64) -> Result<*mut u8>;

    /// Make the byte range `[addr, addr+len)` durable: flush or write back
    /// every aligned cacheline/page intersecting the range, fence, then
    /// drain hardware buffers.
    fn persist(&self, addr: *const u8, len: usize);

    /// Ensure previously issued durability operations are globally visible.
    fn drain(&self);

    /// Store barrier, exposed for callers that publish without flushing.
    fn fence(&self);
}

#[inline]
pub(crate) fn align_down(x: u64, align: u64) -> u64 {
    x & !(align - 1)
}

#[inline]
pub(crate) fn align_up(x: u64, align: u64) -> u64 {
    (x + align - 1) & !(align - 1)
}
