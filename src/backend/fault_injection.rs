//! Copy-on-write fault-injection backend, ported from `pmem_fit.c`.
//!
//! The mapping is **private**, so ordinary stores into it never reach the
//! backing file. `persist` writes the affected 64-byte chunks back to the
//! file with positioned writes. This means a simulated crash — dropping
//! the pool before the remaining `persist` calls of an operation run, or
//! killing a child process that holds the mapping — never observes dirty
//! unflushed pages, which is exactly what this crate's crash-recovery
//! tests rely on.

use std::os::unix::io::RawFd;

use super::PersistenceBackend;
use crate::error::{PmError, Result};
use crate::layout::CHUNK_SIZE;

pub struct FaultInjection {
    fd: RawFd,
    base: *mut u8,
}

// The raw pointer is only ever read to compute a file offset, never
// dereferenced from another thread without synchronization external to
// this struct (the pool above it provides that).
unsafe impl Send for FaultInjection {}
unsafe impl Sync for FaultInjection {}

impl FaultInjection {
    pub fn new() -> Self {
        FaultInjection {
            fd: -1,
            base: std::ptr::null_mut(),
        }
    }
}

impl Default for FaultInjection {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceBackend for FaultInjection {
    unsafe fn map(&mut self, fd: RawFd, len: u64) -> Result<*mut u8> {
        let base = libc::mmap(
            std::ptr::null_mut(),
            len as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE,
            fd,
            0,
        );
        if base == libc::MAP_FAILED {
            return Err(PmError::IoFailure(std::io::Error::last_os_error()));
        }
        let dup = libc::dup(fd);
        if dup < 0 {
            libc::munmap(base, len as usize);
            return Err(PmError::IoFailure(std::io::Error::last_os_error()));
        }
        self.fd = dup;
        self.base = base as *mut u8;
        Ok(self.base)
    }

    fn persist(&self, addr: *const u8, len: usize) {
        let mut uptr = (addr as u64) & !(CHUNK_SIZE - 1);
        let end = addr as u64 + len as u64;
        while uptr < end {
            let file_off = (uptr as i64) - (self.base as i64);
            let rc = unsafe {
                libc::pwrite(
                    self.fd,
                    uptr as *const libc::c_void,
                    CHUNK_SIZE as usize,
                    file_off,
                )
            };
            if rc < 0 {
                log::warn!(
                    "pwrite failed during fault-injection persist: {}",
                    std::io::Error::last_os_error()
                );
            }
            uptr += CHUNK_SIZE;
        }
        self.fence();
    }

    fn drain(&self) {}

    fn fence(&self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

impl Drop for FaultInjection {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
