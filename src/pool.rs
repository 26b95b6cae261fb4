//! The allocator core: pool bootstrap and the reserve/on_active/activate/
//! on_free/free four-phase commit protocol.
//!
//! Ported from `pmemalloc_init`/`pmemalloc_reserve`/`pmemalloc_onactive`/
//! `pmemalloc_activate`/`pmemalloc_onfree`/`pmemalloc_free` in
//! `examples/original_source/libpmemalloc/pmemalloc.c`.

use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use crate::backend::{PersistMode, PersistenceBackend};
use crate::clump::{pack, span_of, state_of, ClumpHeader, Intention, Offset, State, NUM_INTENTIONS};
use crate::error::{fatal, PmError, Result};
use crate::layout::{self, PoolHeader};
use crate::recovery;

/// An open persistent-memory pool. Not `Clone`: the mapping and the
/// backend's durability state belong to exactly one `Pool` value, which
/// unmaps on drop.
pub struct Pool {
    base: *mut u8,
    len: u64,
    backend: Box<dyn PersistenceBackend>,
    terminator_offset: u64,
}

// `base` is a raw pointer into a memory mapping that is valid for the
// lifetime of the `Pool` and whose disjoint-clump accesses are safe to
// perform concurrently (see the module docs of `crate::harness` for the
// concurrency contract this relies on).
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Open (or create) a pool at `path`.
    ///
    /// If the file does not exist, it is created with `size` bytes
    /// (minimum [`layout::MIN_POOL_SIZE`]), formatted with a single
    /// covering free clump, and its header written. If it exists, its
    /// size is taken from the file and `size` is ignored. Either way, an
    /// idempotent recovery scan and a coalescing pass run before the pool
    /// is returned.
    pub fn init<P: AsRef<Path>>(path: P, size: u64, mode: PersistMode) -> Result<Pool> {
        let path = path.as_ref();
        log::debug!("init: path={:?} size=0x{:x} mode={:?}", path, size, mode);

        let (file, total_size, freshly_created) = match std::fs::metadata(path) {
            Ok(meta) => {
                let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
                (file, meta.len(), false)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if size < layout::MIN_POOL_SIZE {
                    return Err(PmError::InvalidArgument(format!(
                        "pool size {} is below the minimum of {} bytes",
                        size,
                        layout::MIN_POOL_SIZE
                    )));
                }
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .mode(0o666)
                    .open(path)?;
                create_pool_file(&file, size)?;
                (file, size, true)
            }
            Err(e) => return Err(PmError::IoFailure(e)),
        };

        let fd = file.as_raw_fd();
        let mut backend = mode.build();
        let base = unsafe { backend.map(fd, total_size)? };
        // The backend has duplicated the descriptor it needs; the
        // original may now be closed, which happens when `file` drops.
        drop(file);

        let terminator_offset = (total_size & !(layout::CHUNK_SIZE - 1)) - layout::CHUNK_SIZE;
        let pool = Pool {
            base,
            len: total_size,
            backend,
            terminator_offset,
        };

        if !freshly_created {
            let header = pool.read_header();
            if !header.signature_valid() {
                return Err(PmError::Corruption(format!(
                    "{:?}: bad pool signature",
                    path
                )));
            }
        }

        recovery::recover(&pool)?;
        recovery::coalesce(&pool);

        log::info!("init: pool {:?} ready, {} allocatable bytes", path, total_size);
        Ok(pool)
    }

    /// A pointer to the 4 KiB static area reserved for client root
    /// pointers. The allocator never interprets its contents; callers
    /// must call [`Self::persist`] after writing to it.
    pub fn static_area(&self) -> *mut u8 {
        unsafe { self.base.add(layout::STATIC_OFFSET as usize) }
    }

    /// The pool's base address, for translating an [`Offset`] to an
    /// absolute pointer.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Translate an offset to an absolute pointer.
    #[inline]
    pub fn at(&self, off: Offset) -> *mut u8 {
        unsafe { self.base.add(off.0 as usize) }
    }

    /// Make the byte range starting at `off` durable. Exposed for callers
    /// writing to the static area or to already-activated payloads.
    pub fn persist(&self, off: Offset, len: usize) {
        self.backend.persist(self.at(off), len);
    }

    /// Allocate `size` payload bytes, volatile until [`Self::activate`].
    ///
    /// Returns the payload offset, or [`PmError::OutOfMemory`] if no free
    /// clump is large enough. `size == 0` is legal: it returns a bare
    /// 64-byte clump with a zero-length but dereferenceable payload.
    pub fn reserve(&self, size: u64) -> Result<Offset> {
        let nsize = layout::round_up_chunk(size + layout::CHUNK_SIZE);
        let mut clp_off = layout::CLUMP_OFFSET;

        loop {
            let word = self.read_size_word(clp_off);
            if word == 0 {
                if clp_off == layout::CLUMP_OFFSET {
                    fatal(PmError::Corruption(
                        "reserve: no clumps found, pool is corrupt".to_string(),
                    ));
                }
                log::debug!("reserve: no fit for {} bytes", nsize);
                return Err(PmError::OutOfMemory);
            }

            let sz = span_of(word);
            let state = match state_of(word) {
                Some(s) => s,
                None => fatal(PmError::Corruption(format!(
                    "reserve: impossible clump state at offset {:#x}",
                    clp_off
                ))),
            };

            if state == State::Free && nsize <= sz {
                return Ok(self.take_clump(clp_off, sz, nsize));
            }

            clp_off += sz;
        }
    }

    /// Register a publication to run when the reservation at
    /// `payload_off` is activated: at commit time, `value` is stored at
    /// `base + parent_off`.
    ///
    /// Fatal (a [`PmError::ContractViolation`]) if `payload_off` is not a
    /// `RESERVED` clump, or if all three intention slots are already in
    /// use.
    pub fn on_active(&self, payload_off: Offset, parent_off: Offset, value: Offset) {
        self.register_intention(payload_off, parent_off, value, State::Reserved, "on_active");
    }

    /// Register a publication to run when the active allocation at
    /// `payload_off` is freed. Identical contract to [`Self::on_active`]
    /// but requires state `ACTIVE`.
    pub fn on_free(&self, payload_off: Offset, parent_off: Offset, value: Offset) {
        self.register_intention(payload_off, parent_off, value, State::Active, "on_free");
    }

    /// Atomically persist the payload, mark the clump in-use, and run its
    /// registered intentions. Must be called on a `RESERVED` clump
    /// (fatal otherwise).
    pub fn activate(&self, payload_off: Offset) {
        let clp_off = payload_off.0 - layout::CHUNK_SIZE;
        let (sz, state) = unsafe {
            let clp = self.clump_ref(clp_off);
            (clp.span(), clp.state())
        };
        if state != Some(State::Reserved) {
            fatal(PmError::ContractViolation(format!(
                "activate: clump {:#x} is not RESERVED (found {:?})",
                clp_off, state
            )));
        }

        // 1. persist the payload
        let payload_len = (sz - layout::CHUNK_SIZE) as usize;
        self.backend.persist(self.at(payload_off), payload_len);
        // 2. commit point: ACTIVATING
        self.set_state(clp_off, sz, State::Activating);
        // 3. run intentions forward
        self.run_intentions(clp_off);
        // 4. clear intentions in reverse, one persist
        self.clear_intentions(clp_off);
        // 5. ACTIVE
        self.set_state(clp_off, sz, State::Active);
    }

    /// Free the allocation at `payload_off`. Must be `RESERVED` or
    /// `ACTIVE` (fatal otherwise). If `ACTIVE`, runs any registered
    /// `on_free` intentions first. Coalesces adjacent free clumps before
    /// returning.
    pub fn free(&self, payload_off: Offset) {
        let clp_off = payload_off.0 - layout::CHUNK_SIZE;
        let (sz, state) = unsafe {
            let clp = self.clump_ref(clp_off);
            (clp.span(), clp.state())
        };

        match state {
            Some(State::Reserved) => {}
            Some(State::Active) => {
                // commit point: FREEING
                self.set_state(clp_off, sz, State::Freeing);
                self.run_intentions(clp_off);
                self.clear_intentions(clp_off);
            }
            other => fatal(PmError::ContractViolation(format!(
                "free: clump {:#x} is in a bad state for freeing: {:?}",
                clp_off, other
            ))),
        }

        self.set_state(clp_off, sz, State::Free);
        recovery::coalesce(self);
    }

    // ---- internal helpers shared with `recovery` ----

    pub(crate) fn terminator_offset(&self) -> u64 {
        self.terminator_offset
    }

    pub(crate) fn read_size_word(&self, clp_off: u64) -> u64 {
        unsafe { self.clump_ref(clp_off).size_and_state }
    }

    pub(crate) fn set_state(&self, clp_off: u64, span: u64, state: State) {
        unsafe {
            self.clump_mut(clp_off).size_and_state = pack(span, state);
        }
        self.persist_clump(clp_off);
    }

    /// Run the registered intentions for the clump at `clp_off`, in
    /// order, stopping at the first empty slot. Each store is persisted
    /// individually.
    pub(crate) fn run_intentions(&self, clp_off: u64) {
        for i in 0..NUM_INTENTIONS {
            let (off, value) = unsafe {
                let clp = self.clump_ref(clp_off);
                (clp.on[i].offset, clp.on[i].value)
            };
            if off == 0 {
                break;
            }
            unsafe {
                let dest = self.base.add(off as usize) as *mut u64;
                *dest = value;
            }
            self.backend.persist(unsafe { self.base.add(off as usize) }, 8);
        }
    }

    /// Clear all three intention slots in reverse order, persisting once.
    pub(crate) fn clear_intentions(&self, clp_off: u64) {
        unsafe {
            let clp = self.clump_mut(clp_off);
            for i in (0..NUM_INTENTIONS).rev() {
                clp.on[i] = Intention::default();
            }
        }
        self.persist_clump(clp_off);
    }

    /// After a clump at `this_off` grows or shrinks to `this_span`, fix
    /// up the `prev_size` of whatever clump immediately follows it (the
    /// Open Question resolution in the design notes: `prev_size` is kept
    /// populated for a future back-merge optimization, even though this
    /// release still coalesces with a full scan).
    pub(crate) fn fix_next_prev_size(&self, this_off: u64, this_span: u64) {
        let next_off = this_off + this_span;
        if next_off < self.terminator_offset {
            unsafe {
                self.clump_mut(next_off).prev_size = this_span;
            }
            self.persist_clump(next_off);
        }
    }

    fn take_clump(&self, clp_off: u64, sz: u64, nsize: u64) -> Offset {
        let leftover = sz - nsize;
        if leftover >= layout::CHUNK_SIZE * 2 {
            let new_off = clp_off + nsize;
            log::trace!(
                "reserve: splitting [{:#x}] -> reserved {} + free [{:#x}] {}",
                clp_off,
                nsize,
                new_off,
                leftover
            );
            unsafe {
                *self.clump_mut(new_off) = ClumpHeader {
                    size_and_state: pack(leftover, State::Free),
                    prev_size: nsize,
                    on: Default::default(),
                };
            }
            self.persist_clump(new_off);
            self.fix_next_prev_size(new_off, leftover);

            unsafe {
                self.clump_mut(clp_off).on = Default::default();
            }
            self.persist_clump(clp_off);
            self.set_state(clp_off, nsize, State::Reserved);
        } else {
            log::trace!("reserve: [{:#x}] taken whole, no split", clp_off);
            unsafe {
                self.clump_mut(clp_off).on = Default::default();
            }
            self.persist_clump(clp_off);
            self.set_state(clp_off, sz, State::Reserved);
        }
        Offset(clp_off + layout::CHUNK_SIZE)
    }

    fn register_intention(
        &self,
        payload_off: Offset,
        parent_off: Offset,
        value: Offset,
        required: State,
        label: &str,
    ) {
        let clp_off = payload_off.0 - layout::CHUNK_SIZE;
        let state = unsafe { self.clump_ref(clp_off).state() };
        if state != Some(required) {
            fatal(PmError::ContractViolation(format!(
                "{}: clump {:#x} is not {:?} (found {:?})",
                label, clp_off, required, state
            )));
        }

        for i in 0..NUM_INTENTIONS {
            let empty = unsafe { self.clump_ref(clp_off).on[i].is_empty() };
            if empty {
                // order matters: set value, persist, then set offset,
                // persist. a crash after the first persist leaves a slot
                // with an offset of zero (still "empty") and a stray
                // value nobody reads.
                unsafe {
                    self.clump_mut(clp_off).on[i].value = value.0;
                }
                self.persist_clump(clp_off);
                unsafe {
                    self.clump_mut(clp_off).on[i].offset = parent_off.0;
                }
                self.persist_clump(clp_off);
                return;
            }
        }

        fatal(PmError::ContractViolation(format!(
            "{}: exceeded intention-list limit ({}) on clump {:#x}",
            label, NUM_INTENTIONS, clp_off
        )));
    }

    pub(crate) unsafe fn clump_ref(&self, off: u64) -> &ClumpHeader {
        &*(self.base.add(off as usize) as *const ClumpHeader)
    }

    pub(crate) unsafe fn clump_mut(&self, off: u64) -> &mut ClumpHeader {
        &mut *(self.base.add(off as usize) as *mut ClumpHeader)
    }

    pub(crate) fn persist_clump(&self, off: u64) {
        self.backend
            .persist(unsafe { self.base.add(off as usize) }, ClumpHeader::ON_DISK_SIZE);
    }

    fn read_header(&self) -> PoolHeader {
        let bytes = unsafe {
            std::slice::from_raw_parts(
                self.base.add(layout::HEADER_OFFSET as usize),
                PoolHeader::ON_DISK_SIZE,
            )
        };
        PoolHeader::from_page_bytes(bytes)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len as usize);
        }
    }
}

/// Lay out a brand-new pool file: reserve `size` bytes of real disk
/// space (not just a logical length extension), write the single
/// covering free clump, and write the pool header.
fn create_pool_file(file: &std::fs::File, size: u64) -> Result<()> {
    let fd = file.as_raw_fd();

    let rc = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
    if rc != 0 {
        log::warn!(
            "posix_fallocate failed (errno {}), falling back to ftruncate",
            rc
        );
        file.set_len(size)?;
    }

    let lastclumpoff = (size & !(layout::CHUNK_SIZE - 1)) - layout::CHUNK_SIZE;
    let clump = ClumpHeader {
        size_and_state: pack(lastclumpoff - layout::CLUMP_OFFSET, State::Free),
        prev_size: 0,
        on: Default::default(),
    };
    let clump_bytes = unsafe {
        std::slice::from_raw_parts(&clump as *const ClumpHeader as *const u8, ClumpHeader::ON_DISK_SIZE)
    };
    pwrite_all(fd, clump_bytes, layout::CLUMP_OFFSET as i64)?;
    log::debug!(
        "create_pool_file: [{:#x}] covering free clump, span 0x{:x}",
        layout::CLUMP_OFFSET,
        lastclumpoff - layout::CLUMP_OFFSET
    );

    let header = PoolHeader::new(size);
    pwrite_all(fd, &header.to_page_bytes(), layout::HEADER_OFFSET as i64)?;

    let rc = unsafe { libc::fsync(fd) };
    if rc != 0 {
        return Err(PmError::IoFailure(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn pwrite_all(fd: RawFd, buf: &[u8], mut offset: i64) -> Result<()> {
    let mut written = 0usize;
    while written < buf.len() {
        let n = unsafe {
            libc::pwrite(
                fd,
                buf[written..].as_ptr() as *const libc::c_void,
                buf.len() - written,
                offset,
            )
        };
        if n < 0 {
            return Err(PmError::IoFailure(std::io::Error::last_os_error()));
        }
        written += n as usize;
        offset += n as i64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PersistMode;

    fn temp_pool(size: u64) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pool");
        (dir, path)
    }

    #[test]
    fn fresh_pool_has_one_free_clump_covering_the_region() {
        let (_dir, path) = temp_pool(1 << 20);
        let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
        let word = pool.read_size_word(layout::CLUMP_OFFSET);
        assert_eq!(state_of(word), Some(State::Free));
        assert_eq!(span_of(word), pool.terminator_offset() - layout::CLUMP_OFFSET);
    }

    #[test]
    fn reserve_activate_free_returns_span_to_free_pool() {
        let (_dir, path) = temp_pool(1 << 20);
        let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
        let before = span_of(pool.read_size_word(layout::CLUMP_OFFSET));

        let payload = pool.reserve(100).unwrap();
        assert_eq!(payload, Offset(layout::CLUMP_OFFSET + layout::CHUNK_SIZE));
        pool.activate(payload);
        let clp_off = payload.0 - layout::CHUNK_SIZE;
        assert_eq!(
            state_of(pool.read_size_word(clp_off)),
            Some(State::Active)
        );

        pool.free(payload);
        let after = span_of(pool.read_size_word(layout::CLUMP_OFFSET));
        assert_eq!(after, before);
        assert_eq!(
            state_of(pool.read_size_word(layout::CLUMP_OFFSET)),
            Some(State::Free)
        );
    }

    #[test]
    fn reserve_zero_returns_bare_clump() {
        let (_dir, path) = temp_pool(1 << 20);
        let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
        let payload = pool.reserve(0).unwrap();
        let clp_off = payload.0 - layout::CHUNK_SIZE;
        assert_eq!(span_of(pool.read_size_word(clp_off)), layout::CHUNK_SIZE);
    }

    #[test]
    fn reserve_too_large_is_out_of_memory() {
        let (_dir, path) = temp_pool(1 << 20);
        let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
        let err = pool.reserve(10 * (1 << 20)).unwrap_err();
        assert!(matches!(err, PmError::OutOfMemory));
    }

    #[test]
    fn init_rejects_undersized_new_pool() {
        let (_dir, path) = temp_pool(0);
        let err = Pool::init(&path, 1024, PersistMode::FaultInjection).unwrap_err();
        assert!(matches!(err, PmError::InvalidArgument(_)));
    }

    #[test]
    fn init_rejects_bad_signature() {
        let (_dir, path) = temp_pool(0);
        {
            let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
            drop(pool);
        }
        // Corrupt the signature directly in the file.
        use std::io::{Seek, SeekFrom, Write};
        let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(layout::HEADER_OFFSET)).unwrap();
        f.write_all(b"GARBAGE!").unwrap();
        drop(f);

        let err = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap_err();
        assert!(matches!(err, PmError::Corruption(_)));
    }

    #[test]
    fn linked_list_head_insertion_via_static_area() {
        let (_dir, path) = temp_pool(1 << 20);
        let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
        let static_off = Offset(layout::STATIC_OFFSET);

        let mut head = Offset::NULL;
        for _ in 0..3 {
            let node = pool.reserve(16).unwrap();
            unsafe {
                *(pool.at(node) as *mut u64) = head.0;
            }
            pool.on_active(node, static_off, node);
            pool.activate(node);
            head = node;
        }

        let published = unsafe { *(pool.static_area() as *const u64) };
        assert_eq!(published, head.0);
    }
}
