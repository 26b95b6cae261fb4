//! Fixed on-media layout constants and the pool header record.
//!
//! All offsets are bytes from the pool base. The pool is page-aligned at
//! 4096 and every clump is 64-byte aligned; see the module-level docs of
//! [`crate::clump`] for the clump record itself.

use std::convert::TryInto;

/// Offset of the NULL page. Intentionally unused so that offset 0 can mean
/// "null" without colliding with a real clump.
pub const NULL_OFFSET: u64 = 0;

/// Offset of the 4 KiB static area clients may use for root pointers.
pub const STATIC_OFFSET: u64 = 4096;

/// Offset of the reserved/unused red-zone page.
pub const RED_ZONE_OFFSET: u64 = 8192;

/// Offset of the pool header.
pub const HEADER_OFFSET: u64 = 12288;

/// Offset of the first clump in the clump region.
pub const CLUMP_OFFSET: u64 = 16384;

/// Size of each of the first four fixed sections (null page, static area,
/// red zone, header).
pub const PAGE_SIZE: u64 = 4096;

/// Alignment/granularity of every clump, and of the payload address
/// returned to callers.
pub const CHUNK_SIZE: u64 = 64;

/// Smallest pool size `Pool::init` accepts when creating a new file.
pub const MIN_POOL_SIZE: u64 = 1024 * 1024;

/// Pool header signature, written verbatim (NUL-padded to 16 bytes).
pub const SIGNATURE: &[u8; 16] = b"*PMEMALLOC_POOL\0";

/// Round `n` up to the next multiple of `CHUNK_SIZE`.
#[inline]
pub fn round_up_chunk(n: u64) -> u64 {
    (n + CHUNK_SIZE - 1) & !(CHUNK_SIZE - 1)
}

/// The pool header kept at [`HEADER_OFFSET`] in each memory-mapped file.
///
/// `#[repr(C)]` so its byte layout is stable across Rust versions; the
/// pool file is this crate's on-disk compatibility contract, not just an
/// in-process data structure.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PoolHeader {
    pub signature: [u8; 16],
    pub totalsize: u64,
}

impl PoolHeader {
    pub const ON_DISK_SIZE: usize = PAGE_SIZE as usize;

    pub fn new(totalsize: u64) -> Self {
        PoolHeader {
            signature: *SIGNATURE,
            totalsize,
        }
    }

    pub fn signature_valid(&self) -> bool {
        &self.signature == SIGNATURE
    }

    /// Serialize into a page-sized buffer (signature + total size,
    /// zero-padded to [`PAGE_SIZE`]), suitable for a single `pwrite`.
    pub fn to_page_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::ON_DISK_SIZE];
        buf[0..16].copy_from_slice(&self.signature);
        buf[16..24].copy_from_slice(&self.totalsize.to_ne_bytes());
        buf
    }

    /// Parse a page-sized buffer read from [`HEADER_OFFSET`].
    pub fn from_page_bytes(buf: &[u8]) -> Self {
        let mut signature = [0u8; 16];
        signature.copy_from_slice(&buf[0..16]);
        let totalsize = u64::from_ne_bytes(buf[16..24].try_into().unwrap());
        PoolHeader {
            signature,
            totalsize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_is_idempotent_on_multiples() {
        assert_eq!(round_up_chunk(0), 0);
        assert_eq!(round_up_chunk(64), 64);
        assert_eq!(round_up_chunk(65), 128);
        assert_eq!(round_up_chunk(100 + CHUNK_SIZE), 192);
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let hdr = PoolHeader::new(1_048_576);
        let bytes = hdr.to_page_bytes();
        assert_eq!(bytes.len(), PoolHeader::ON_DISK_SIZE);
        let back = PoolHeader::from_page_bytes(&bytes);
        assert!(back.signature_valid());
        assert_eq!(back.totalsize, 1_048_576);
    }

    #[test]
    fn bad_signature_is_detected() {
        let mut bytes = PoolHeader::new(MIN_POOL_SIZE).to_page_bytes();
        bytes[0] = b'X';
        let back = PoolHeader::from_page_bytes(&bytes);
        assert!(!back.signature_valid());
    }
}
