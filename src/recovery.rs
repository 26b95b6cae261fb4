//! Crash recovery and free-clump coalescing.
//!
//! Ported from `pmemalloc_recover`/`pmemalloc_coalesce_free` in
//! `examples/original_source/libpmemalloc/pmemalloc.c`. Both scans walk
//! the clump region left to right by `span`; a clump whose span can't be
//! trusted (state byte out of range) aborts the scan rather than
//! guessing, since a wrong span would desynchronize every walk after it.

use crate::clump::{span_of, state_of, State};
use crate::error::{fatal, PmError, Result};
use crate::layout::CLUMP_OFFSET;
use crate::pool::Pool;

/// Idempotent crash-recovery scan, run once at every `Pool::init`.
///
/// For each clump, in offset order:
/// - `RESERVED`: discarded back to `FREE`. A reservation that never
///   reached `activate` carries no external references, so there is
///   nothing else to undo.
/// - `ACTIVATING`: the payload was already durable before this state was
///   written (that's the commit point), so recovery finishes the
///   transition forward — run the intentions, clear them, go `ACTIVE`.
/// - `FREEING`: symmetric — finish running and clearing the intentions,
///   then go `FREE`.
/// - `FREE`/`ACTIVE`: untouched.
///
/// Running this twice in a row is a no-op: every case it handles already
/// moves the clump to a terminal state before returning.
///
/// The `Result` here is reserved for future I/O-shaped failure modes;
/// every corruption case the scan can actually detect is routed through
/// [`fatal`] rather than returned, consistent with [`coalesce`]'s
/// identical checks below and with `reserve`'s handling of the same
/// impossible-state condition.
pub(crate) fn recover(pool: &Pool) -> Result<()> {
    let mut clp_off = CLUMP_OFFSET;
    let mut n_recovered = 0u64;

    loop {
        let word = pool.read_size_word(clp_off);
        if word == 0 {
            break;
        }
        let span = span_of(word);
        let state = match state_of(word) {
            Some(s) => s,
            None => fatal(PmError::Corruption(format!(
                "recover: impossible state byte at offset {:#x}",
                clp_off
            ))),
        };

        match state {
            State::Reserved => {
                log::debug!("recover: [{:#x}] RESERVED -> FREE (discarded)", clp_off);
                pool.clear_intentions(clp_off);
                pool.set_state(clp_off, span, State::Free);
                n_recovered += 1;
            }
            State::Activating => {
                log::debug!("recover: [{:#x}] ACTIVATING -> ACTIVE (replayed)", clp_off);
                pool.run_intentions(clp_off);
                pool.clear_intentions(clp_off);
                pool.set_state(clp_off, span, State::Active);
                n_recovered += 1;
            }
            State::Freeing => {
                log::debug!("recover: [{:#x}] FREEING -> FREE (replayed)", clp_off);
                pool.run_intentions(clp_off);
                pool.clear_intentions(clp_off);
                pool.set_state(clp_off, span, State::Free);
                n_recovered += 1;
            }
            State::Free | State::Active => {}
        }

        clp_off += span;
        if clp_off > pool.terminator_offset() {
            fatal(PmError::Corruption(format!(
                "recover: clump walk overran the terminator at offset {:#x}",
                clp_off
            )));
        }
    }

    if n_recovered > 0 {
        log::info!("recover: replayed {} in-flight clump(s)", n_recovered);
    } else {
        log::debug!("recover: nothing to do");
    }
    Ok(())
}

/// Merge runs of two or more adjacent `FREE` clumps into one. A lone
/// free clump with non-free neighbors on both sides is left untouched.
///
/// Called after every [`Pool::free`](crate::pool::Pool::free) and once
/// at the end of [`recover`]. The merged clump's `size_and_state` is
/// written and persisted exactly once per run (not once per merged
/// member), so a crash mid-coalesce just leaves some free clumps
/// unmerged — still correct, since coalescing is a pure space-reclamation
/// optimization, not part of the commit protocol.
pub(crate) fn coalesce(pool: &Pool) {
    let mut clp_off = CLUMP_OFFSET;
    let mut n_merges = 0u64;

    loop {
        let word = pool.read_size_word(clp_off);
        if word == 0 {
            break;
        }
        let span = span_of(word);
        let state = match state_of(word) {
            Some(s) => s,
            None => fatal(PmError::Corruption(format!(
                "coalesce: impossible state byte at offset {:#x}",
                clp_off
            ))),
        };

        if state != State::Free {
            clp_off += span;
            continue;
        }

        let mut run_span = span;
        let mut next_off = clp_off + span;
        let mut run_len = 1;
        loop {
            let next_word = pool.read_size_word(next_off);
            if next_word == 0 {
                break;
            }
            let next_span = span_of(next_word);
            match state_of(next_word) {
                Some(State::Free) => {
                    run_span += next_span;
                    next_off += next_span;
                    run_len += 1;
                }
                Some(_) => break,
                None => fatal(PmError::Corruption(format!(
                    "coalesce: impossible state byte at offset {:#x}",
                    next_off
                ))),
            }
        }

        if run_len > 1 {
            log::trace!(
                "coalesce: merging {} free clumps at [{:#x}] into span 0x{:x}",
                run_len,
                clp_off,
                run_span
            );
            pool.set_state(clp_off, run_span, State::Free);
            pool.fix_next_prev_size(clp_off, run_span);
            n_merges += 1;
        }

        clp_off += run_span;
    }

    if n_merges > 0 {
        log::debug!("coalesce: merged {} run(s) of free clumps", n_merges);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PersistMode;
    use crate::layout;
    use crate::pool::Pool;

    fn temp_path() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recover.pool");
        (dir, path)
    }

    #[test]
    fn recover_is_idempotent_on_a_clean_pool() {
        let (_dir, path) = temp_path();
        let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
        recover(&pool).unwrap();
        recover(&pool).unwrap();
        assert_eq!(
            state_of(pool.read_size_word(layout::CLUMP_OFFSET)),
            Some(State::Free)
        );
    }

    #[test]
    fn crash_mid_activate_completes_forward_on_reopen() {
        let (_dir, path) = temp_path();
        let payload_off;
        {
            let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
            let payload = pool.reserve(64).unwrap();
            payload_off = payload;
            let clp_off = payload.0 - layout::CHUNK_SIZE;
            let span = span_of(pool.read_size_word(clp_off));
            // Simulate a crash between the ACTIVATING commit point and
            // the final ACTIVE transition: leave the clump ACTIVATING
            // with no intentions, as `activate` would before its last
            // `set_state` call.
            pool.set_state(clp_off, span, State::Activating);
        }

        let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
        let clp_off = payload_off.0 - layout::CHUNK_SIZE;
        assert_eq!(
            state_of(pool.read_size_word(clp_off)),
            Some(State::Active)
        );
    }

    #[test]
    fn crash_mid_reserve_is_discarded_on_reopen() {
        let (_dir, path) = temp_path();
        let payload_off;
        {
            let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
            payload_off = pool.reserve(64).unwrap();
            // never activated: stays RESERVED on disk
        }

        let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
        let clp_off = payload_off.0 - layout::CHUNK_SIZE;
        assert_eq!(state_of(pool.read_size_word(clp_off)), Some(State::Free));
        // and it was coalesced back with everything after it
        assert_eq!(
            state_of(pool.read_size_word(layout::CLUMP_OFFSET)),
            Some(State::Free)
        );
    }

    #[test]
    fn three_adjacent_frees_coalesce_into_one() {
        let (_dir, path) = temp_path();
        let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
        let whole = span_of(pool.read_size_word(layout::CLUMP_OFFSET));

        let a = pool.reserve(64).unwrap();
        let b = pool.reserve(64).unwrap();
        let c = pool.reserve(64).unwrap();
        for off in [a, b, c] {
            pool.activate(off);
        }
        for off in [a, b, c] {
            pool.free(off);
        }

        let merged = span_of(pool.read_size_word(layout::CLUMP_OFFSET));
        assert_eq!(merged, whole);
    }
}
