//! Smallest possible, self-contained example: memory-map a file and
//! store a string to it. Ported from `original_source/trivial/trivial.c`
//! — it talks to `mmap`/`msync` directly rather than through
//! [`pmalloc::Pool`], since the point of this demo is showing the raw
//! primitives the rest of the crate builds on.
//!
//! ```text
//! dd if=/dev/zero of=testfile bs=4k count=1
//! trivial testfile
//! od -c testfile
//! ```

use std::os::unix::io::AsRawFd;

const MESSAGE: &[u8] = b"Hello, Persistent Memory!\0";

fn main() {
    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "trivial".to_string());
    let path = match args.next() {
        Some(p) => p,
        None => {
            eprintln!("Usage: {} filename", program);
            std::process::exit(1);
        }
    };

    let file = match std::fs::OpenOptions::new().read(true).write(true).open(&path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("{}: {}", path, e);
            std::process::exit(1);
        }
    };

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            4096,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if base == libc::MAP_FAILED {
        eprintln!("mmap: {}", std::io::Error::last_os_error());
        std::process::exit(1);
    }
    // the fd isn't needed once the mapping exists
    drop(file);

    unsafe {
        std::ptr::copy_nonoverlapping(MESSAGE.as_ptr(), base as *mut u8, MESSAGE.len());
    }

    let rc = unsafe { libc::msync(base, 4096, libc::MS_SYNC) };
    if rc < 0 {
        eprintln!("msync: {}", std::io::Error::last_os_error());
        std::process::exit(1);
    }

    unsafe {
        libc::munmap(base, 4096);
    }
    println!("Done.");
}
