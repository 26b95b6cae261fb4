//! Read-only consistency check and summary report, analogous to the
//! original command-line `pmemalloc -c`/`dump` diagnostic paths but
//! exposed here as a library function so demo binaries and tests can
//! both use it.
//!
//! Unlike [`crate::pool::Pool::init`], `check` never recovers or
//! coalesces: it maps the file read-only and reports what it finds,
//! including in-flight clumps a running recovery would have cleaned up.

use std::fmt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use term_painter::Color::{Green, Red, Yellow};
use term_painter::ToStyle;

use crate::clump::{span_of, state_of, State};
use crate::error::{PmError, Result};
use crate::layout::{self, PoolHeader};

/// Per-state clump counts, total bytes, and the smallest/largest clump
/// span seen, indexed by [`State`]. Mirrors the counters `pmemalloc.c`'s
/// stats dump keeps per state, plus the same fields summed into a grand
/// total row.
#[derive(Debug, Clone, Copy)]
pub struct StateStats {
    pub clumps: u64,
    pub bytes: u64,
    pub smallest: u64,
    pub largest: u64,
}

impl Default for StateStats {
    fn default() -> Self {
        StateStats {
            clumps: 0,
            bytes: 0,
            smallest: u64::MAX,
            largest: 0,
        }
    }
}

impl StateStats {
    fn observe(&mut self, span: u64) {
        self.clumps += 1;
        self.bytes += span;
        self.smallest = self.smallest.min(span);
        self.largest = self.largest.max(span);
    }

    fn merge(&self, other: &StateStats) -> StateStats {
        StateStats {
            clumps: self.clumps + other.clumps,
            bytes: self.bytes + other.bytes,
            smallest: self.smallest.min(other.smallest),
            largest: self.largest.max(other.largest),
        }
    }

    /// `smallest` as a `u64::MAX` sentinel is only meaningful once at
    /// least one clump has been observed.
    fn smallest_display(&self) -> u64 {
        if self.clumps == 0 {
            0
        } else {
            self.smallest
        }
    }
}

/// Something a careful reader of the pool would want flagged. `check`
/// keeps walking after recording one of these where it safely can, so a
/// single report can surface more than one problem.
#[derive(Debug, Clone)]
pub enum CheckFinding {
    BadSignature,
    ImpossibleState { offset: u64, word: u64 },
    WalkOverranTerminator { offset: u64 },
    WalkStoppedShortOfTerminator { offset: u64, terminator_offset: u64 },
    InFlight { offset: u64, state: State },
}

impl fmt::Display for CheckFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckFinding::BadSignature => write!(f, "pool header signature does not match"),
            CheckFinding::ImpossibleState { offset, word } => write!(
                f,
                "clump at {:#x} has an impossible state byte (word={:#x})",
                offset, word
            ),
            CheckFinding::WalkOverranTerminator { offset } => write!(
                f,
                "clump walk passed the terminator, stopped at {:#x}",
                offset
            ),
            CheckFinding::WalkStoppedShortOfTerminator {
                offset,
                terminator_offset,
            } => write!(
                f,
                "clump walk hit a zero size word at {:#x} before reaching the terminator at {:#x}",
                offset, terminator_offset
            ),
            CheckFinding::InFlight { offset, state } => write!(
                f,
                "clump at {:#x} is mid-commit ({}); a running recovery would finish it",
                offset,
                state.name()
            ),
        }
    }
}

/// A full accounting of one pool file.
pub struct CheckReport {
    pub total_size: u64,
    pub stats: [StateStats; 5],
    pub findings: Vec<CheckFinding>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pool: {} bytes total", self.total_size)?;
        writeln!(
            f,
            "  {:<10} {:>8} {:>12} {:>10} {:>10}",
            "state", "clumps", "bytes", "smallest", "largest"
        )?;
        let mut total = StateStats::default();
        for state in State::ALL {
            let s = self.stats[state as usize];
            writeln!(
                f,
                "  {:<10} {:>8} {:>12} {:>10} {:>10}",
                state.name(),
                s.clumps,
                s.bytes,
                s.smallest_display(),
                s.largest
            )?;
            total = total.merge(&s);
        }
        writeln!(
            f,
            "  {:<10} {:>8} {:>12} {:>10} {:>10}",
            "TOTAL",
            total.clumps,
            total.bytes,
            total.smallest_display(),
            total.largest
        )?;
        if self.findings.is_empty() {
            writeln!(f, "{}", Green.paint("clean"))?;
        } else {
            for finding in &self.findings {
                writeln!(f, "{}", Yellow.paint(finding))?;
            }
            writeln!(f, "{}", Red.paint(format!("{} finding(s)", self.findings.len())))?;
        }
        Ok(())
    }
}

/// Inspect the pool file at `path` without recovering or modifying it.
///
/// Fails with [`PmError::IoFailure`] if the file can't be opened, or
/// [`PmError::Corruption`] only for errors that make it impossible to
/// proceed at all (the file is shorter than the fixed header region);
/// everything else is downgraded to a [`CheckFinding`] so the report can
/// still be produced.
pub fn check<P: AsRef<Path>>(path: P) -> Result<CheckReport> {
    let path = path.as_ref();
    let file = std::fs::OpenOptions::new().read(true).open(path)?;
    let total_size = file.metadata()?.len();
    if total_size < layout::CLUMP_OFFSET {
        return Err(PmError::Corruption(format!(
            "{:?}: file is only {} bytes, smaller than the fixed header region",
            path, total_size
        )));
    }

    let fd = file.as_raw_fd();
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            total_size as usize,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            fd,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(PmError::IoFailure(std::io::Error::last_os_error()));
    }
    let base = base as *const u8;

    let result = (|| {
        let mut findings = Vec::new();
        let mut stats = [StateStats::default(); 5];

        let header_bytes =
            unsafe { std::slice::from_raw_parts(base.add(layout::HEADER_OFFSET as usize), PoolHeader::ON_DISK_SIZE) };
        let header = PoolHeader::from_page_bytes(header_bytes);
        if !header.signature_valid() {
            findings.push(CheckFinding::BadSignature);
        }

        let terminator_offset = (total_size & !(layout::CHUNK_SIZE - 1)) - layout::CHUNK_SIZE;
        let mut clp_off = layout::CLUMP_OFFSET;
        loop {
            let word = unsafe { *(base.add(clp_off as usize) as *const u64) };
            if word == 0 {
                if clp_off != terminator_offset {
                    findings.push(CheckFinding::WalkStoppedShortOfTerminator {
                        offset: clp_off,
                        terminator_offset,
                    });
                }
                break;
            }
            let span = span_of(word);
            match state_of(word) {
                Some(state) => {
                    stats[state as usize].observe(span);
                    if matches!(state, State::Activating | State::Freeing | State::Reserved) {
                        findings.push(CheckFinding::InFlight {
                            offset: clp_off,
                            state,
                        });
                    }
                }
                None => {
                    findings.push(CheckFinding::ImpossibleState { offset: clp_off, word });
                    break;
                }
            }

            clp_off += span;
            if clp_off > terminator_offset {
                findings.push(CheckFinding::WalkOverranTerminator { offset: clp_off });
                break;
            }
        }

        CheckReport {
            total_size,
            stats,
            findings,
        }
    })();

    unsafe {
        libc::munmap(base as *mut libc::c_void, total_size as usize);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PersistMode;
    use crate::pool::Pool;

    #[test]
    fn fresh_pool_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("check.pool");
        {
            let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
            drop(pool);
        }
        let report = check(&path).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.stats[State::Free as usize].clumps, 1);
    }

    #[test]
    fn reserved_but_not_activated_shows_as_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("check2.pool");
        let pool = Pool::init(&path, 1 << 20, PersistMode::FaultInjection).unwrap();
        pool.reserve(64).unwrap();
        // don't drop `pool`/run recover again: check reads this live mapping's
        // backing file directly, so the RESERVED clump is still on disk.
        drop(pool);

        let report = check(&path).unwrap();
        assert!(!report.is_clean());
        assert!(report
            .findings
            .iter()
            .any(|f| matches!(f, CheckFinding::InFlight { state: State::Reserved, .. })));
    }

    #[test]
    fn too_small_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.pool");
        std::fs::write(&path, [0u8; 16]).unwrap();
        let err = check(&path).unwrap_err();
        assert!(matches!(err, PmError::Corruption(_)));
    }
}
