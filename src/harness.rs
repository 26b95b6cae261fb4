//! Multi-threaded stress harness, ported from
//! `examples/original_source/libpmemalloc/mt_pmemalloc_test.c`.
//!
//! The static area holds a single relative pointer (`sa_ptr` in the
//! original): the offset of a `threads * mailboxes` mailbox array,
//! itself an ordinary reservation published into the static area with
//! one `on_active`/`activate`, exactly as the original's `main()` does
//! before spawning any worker. Each worker repeatedly picks a random
//! mailbox slot, frees whatever is parked there, reserves and activates
//! a fresh allocation of a random size, and parks the new allocation in
//! the slot instead. Running this under `SIGKILL` (or, in tests, letting
//! the [`crate::backend::FaultInjection`] backend drop mid-run) and then
//! reopening the pool exercises the same recovery path a real crash
//! would.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Barrier;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::clump::Offset;
use crate::error::Result;
use crate::layout::STATIC_OFFSET;
use crate::pool::Pool;

/// Parameters for one run of the harness.
pub struct HarnessConfig {
    pub threads: usize,
    pub mailboxes: usize,
    pub duration: Duration,
    pub max_alloc: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            threads: default_thread_count(),
            mailboxes: 64,
            duration: Duration::from_secs(5),
            max_alloc: 4096,
        }
    }
}

/// `num_cpus::get()`, capped at 128: beyond that the mailbox contention
/// dominates and more threads just means more time spent spinning on
/// `reserve`'s linear scan.
pub fn default_thread_count() -> usize {
    num_cpus::get().min(128)
}

/// Outcome of one [`run`].
#[derive(Debug, Default, Clone, Copy)]
pub struct HarnessStats {
    pub total_ops: u64,
}

fn read_u64(pool: &Pool, at: Offset) -> u64 {
    unsafe { *(pool.at(at) as *const u64) }
}

fn write_u64(pool: &Pool, at: Offset, value: u64) {
    unsafe {
        *(pool.at(at) as *mut u64) = value;
    }
}

/// Offset of mailbox slot `index` within the mailbox array rooted at
/// `mbx_array`.
fn mailbox_slot(mbx_array: Offset, index: usize) -> Offset {
    Offset(mbx_array.0 + (index as u64) * std::mem::size_of::<u64>() as u64)
}

/// The static area's single root slot: a relative pointer to the
/// mailbox array, or `Offset::NULL` before the array has ever been
/// created.
fn root_slot() -> Offset {
    Offset(STATIC_OFFSET)
}

/// Get the pool's mailbox array, reserving and publishing a fresh one
/// the first time this harness runs against this pool, or sweeping
/// leftovers from a previous, possibly crashed, run otherwise.
fn ensure_mailbox_array(pool: &Pool, config: &HarnessConfig) -> Result<Offset> {
    let slot = root_slot();
    let existing = read_u64(pool, slot);

    if existing == 0 {
        let total_slots = config.threads * config.mailboxes;
        let bytes = (total_slots * std::mem::size_of::<u64>()) as u64;
        let mbx_array = pool.reserve(bytes)?;
        unsafe {
            std::ptr::write_bytes(pool.at(mbx_array), 0, bytes as usize);
        }
        pool.on_active(mbx_array, slot, mbx_array);
        pool.activate(mbx_array);
        log::info!(
            "harness: created mailbox array, {} slots at {:#x}",
            total_slots,
            mbx_array.0
        );
        Ok(mbx_array)
    } else {
        let mbx_array = Offset(existing);
        sweep_leftover_mailboxes(pool, mbx_array, config.threads * config.mailboxes);
        Ok(mbx_array)
    }
}

/// Free whatever a previous, possibly crashed, run of this harness left
/// parked in the mailboxes.
fn sweep_leftover_mailboxes(pool: &Pool, mbx_array: Offset, total_slots: usize) {
    for i in 0..total_slots {
        let slot = mailbox_slot(mbx_array, i);
        let payload = read_u64(pool, slot);
        if payload != 0 {
            log::info!("harness: freeing leftover mailbox[{}] = {:#x}", i, payload);
            pool.on_free(Offset(payload), slot, Offset::NULL);
            pool.free(Offset(payload));
            write_u64(pool, slot, 0);
            pool.persist(slot, std::mem::size_of::<u64>());
        }
    }
}

/// Run the stress harness to completion, returning aggregate operation
/// counts across all worker threads.
pub fn run(pool: &Pool, config: &HarnessConfig) -> Result<HarnessStats> {
    let mbx_array = ensure_mailbox_array(pool, config)?;

    let barrier = Barrier::new(config.threads);
    let all_stop = AtomicBool::new(false);
    let total_ops = AtomicU64::new(0);
    let deadline = Instant::now() + config.duration;

    std::thread::scope(|scope| {
        for worker_id in 0..config.threads {
            let barrier = &barrier;
            let all_stop = &all_stop;
            let total_ops = &total_ops;
            let base = worker_id * config.mailboxes;
            scope.spawn(move || {
                barrier.wait();
                let mut rng = rand::thread_rng();
                let mut ops = 0u64;
                while !all_stop.load(Ordering::Relaxed) {
                    if Instant::now() >= deadline {
                        all_stop.store(true, Ordering::Relaxed);
                        break;
                    }
                    worker_step(pool, config, mbx_array, base, &mut rng);
                    ops += 1;
                }
                log::debug!("harness: worker {} performed {} ops", worker_id, ops);
                total_ops.fetch_add(ops, Ordering::Relaxed);
            });
        }
    });

    Ok(HarnessStats {
        total_ops: total_ops.load(Ordering::Relaxed),
    })
}

fn worker_step(pool: &Pool, config: &HarnessConfig, mbx_array: Offset, base: usize, rng: &mut impl Rng) {
    let slot_idx = base + rng.gen_range(0..config.mailboxes);
    let slot = mailbox_slot(mbx_array, slot_idx);

    let old = read_u64(pool, slot);
    if old != 0 {
        pool.on_free(Offset(old), slot, Offset::NULL);
        pool.free(Offset(old));
    }

    let size = rng.gen_range(1..=config.max_alloc);
    let new_off = match pool.reserve(size) {
        Ok(off) => off,
        Err(_) => {
            // Pool is momentarily full; clear the slot and try again
            // next iteration rather than blocking the worker.
            write_u64(pool, slot, 0);
            pool.persist(slot, std::mem::size_of::<u64>());
            return;
        }
    };

    unsafe {
        std::ptr::write_bytes(pool.at(new_off), 0xAB, size as usize);
    }
    pool.on_active(new_off, slot, new_off);
    pool.activate(new_off);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PersistMode;

    #[test]
    fn short_run_completes_and_leaves_pool_self_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.pool");
        let pool = Pool::init(&path, 4 << 20, PersistMode::FaultInjection).unwrap();

        let config = HarnessConfig {
            threads: 4,
            mailboxes: 8,
            duration: Duration::from_millis(200),
            max_alloc: 256,
        };
        let stats = run(&pool, &config).unwrap();
        assert!(stats.total_ops > 0);

        let report = crate::check::check(&path).unwrap();
        assert!(report
            .findings
            .iter()
            .all(|f| !matches!(f, crate::check::CheckFinding::ImpossibleState { .. })));
    }

    #[test]
    fn mailbox_array_is_its_own_reservation_not_inlined_in_static_area() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.pool");
        let pool = Pool::init(&path, 4 << 20, PersistMode::FaultInjection).unwrap();

        // A config whose mailbox grid would overflow the 4 KiB static
        // area if it were stored inline there.
        let config = HarnessConfig {
            threads: 16,
            mailboxes: 64,
            duration: Duration::from_millis(1),
            max_alloc: 64,
        };
        let mbx_array = ensure_mailbox_array(&pool, &config).unwrap();
        assert!(mbx_array.0 >= crate::layout::CLUMP_OFFSET);

        // The static area holds only the relative pointer to it.
        let published = read_u64(&pool, root_slot());
        assert_eq!(published, mbx_array.0);
    }

    #[test]
    fn restart_sweeps_leftover_mailboxes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart.pool");
        let config = HarnessConfig {
            threads: 1,
            mailboxes: 8,
            duration: Duration::from_millis(1),
            max_alloc: 64,
        };
        {
            let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
            let mbx_array = ensure_mailbox_array(&pool, &config).unwrap();
            let slot = mailbox_slot(mbx_array, 0);
            let off = pool.reserve(64).unwrap();
            pool.activate(off);
            write_u64(&pool, slot, off.0);
            pool.persist(slot, std::mem::size_of::<u64>());
        }

        let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
        let mbx_array = ensure_mailbox_array(&pool, &config).unwrap();
        let slot = mailbox_slot(mbx_array, 0);
        assert_eq!(read_u64(&pool, slot), 0);
    }
}
