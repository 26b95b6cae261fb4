//! A crash-consistent allocator for byte-addressable persistent-memory
//! pools.
//!
//! A pool is a single memory-mapped file, divided into a fixed-layout
//! header region (see [`layout`]) followed by a region of 64-byte
//! [`clump`]s. Allocation goes through a four-phase commit protocol —
//! [`pool::Pool::reserve`], [`pool::Pool::on_active`],
//! [`pool::Pool::activate`], and [`pool::Pool::free`] — so that a crash
//! at any point leaves the pool in one of exactly two observable states
//! for any given allocation: as if the operation never started, or as
//! if it fully completed. [`recovery::recover`] replays whichever one
//! is in flight the next time the pool is opened.
//!
//! Three [`backend::PersistenceBackend`]s are provided: a cacheline
//! flush for real persistent memory, an `msync`-based one for ordinary
//! memory-mapped files, and a copy-on-write fault-injection backend used
//! by this crate's own crash-recovery tests.

pub mod backend;
pub mod check;
pub mod clump;
pub mod error;
pub mod harness;
pub mod layout;
pub mod pool;
pub(crate) mod recovery;

pub use check::{check, CheckFinding, CheckReport};
pub use clump::{Offset, State};
pub use error::{PmError, Result};
pub use pool::Pool;
