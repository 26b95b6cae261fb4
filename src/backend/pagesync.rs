//! Page-level synchronous persistence backend, ported from `pmem_msync.c`.

use std::os::unix::io::RawFd;

use super::{align_down, align_up, PersistenceBackend};
use crate::error::{PmError, Result};
use crate::layout::PAGE_SIZE;

/// Shared `mmap`; `persist` rounds the affected range out to page
/// boundaries and calls `msync(MS_SYNC)`, which is already a full
/// barrier, so `drain` is a no-op here.
pub struct PageSync {
    fd: RawFd,
}

impl PageSync {
    pub fn new() -> Self {
        PageSync { fd: -1 }
    }
}

impl Default for PageSync {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceBackend for PageSync {
    unsafe fn map(&mut self, fd: RawFd, len: u64) -> Result<*mut u8> {
        let base = libc::mmap(
            std::ptr::null_mut(),
            len as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
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
        Ok(base as *mut u8)
    }

    fn persist(&self, addr: *const u8, len: usize) {
        let start = align_down(addr as u64, PAGE_SIZE);
        let end = align_up(addr as u64 + len as u64, PAGE_SIZE);
        let rc = unsafe {
            libc::msync(
                start as *mut libc::c_void,
                (end - start) as usize,
                libc::MS_SYNC,
            )
        };
        if rc != 0 {
            log::warn!("msync failed: {}", std::io::Error::last_os_error());
        }
    }

    fn drain(&self) {}

    fn fence(&self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

impl Drop for PageSync {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
