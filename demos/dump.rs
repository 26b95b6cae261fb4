//! Load/store demo over a pool's static area, ported from
//! `original_source/basic/basic.c`. With string arguments, writes each
//! one (NUL-terminated) into the static area; with none, dumps whatever
//! printable runs it finds there, `strings(1)`-style.
//!
//! ```text
//! pmdump [-b backend] <path> [strings...]
//! ```

use pmalloc::backend::PersistMode;
use pmalloc::layout::STATIC_OFFSET;
use pmalloc::Pool;

const DEFAULT_SIZE: u64 = 1024 * 1024;
// The static area is a fixed 4 KiB; basic.c used a whole 8 KiB pool for
// everything because it had no separate clump region to speak of.
const STATIC_AREA_SIZE: usize = 4096;

fn main() {
    env_logger::init();
    let mut args = std::env::args().skip(1).peekable();

    let mut mode = PersistMode::from_env_or(PersistMode::PageSync);
    if args.peek().map(String::as_str) == Some("-b") {
        args.next();
        mode = match args.next().as_deref() {
            Some("cacheline") => PersistMode::Cacheline,
            Some("pagesync") => PersistMode::PageSync,
            Some("fault_injection") => PersistMode::FaultInjection,
            other => {
                eprintln!("unrecognized backend {:?}", other);
                std::process::exit(2);
            }
        };
    }

    let path = match args.next() {
        Some(p) => p,
        None => {
            eprintln!("Usage: pmdump [-b backend] <path> [strings...]");
            std::process::exit(1);
        }
    };
    let strings: Vec<String> = args.collect();

    let pool = match Pool::init(&path, DEFAULT_SIZE, mode) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}: {}", path, e);
            std::process::exit(1);
        }
    };

    if strings.is_empty() {
        dump(&pool);
    } else {
        store(&pool, &strings);
    }
}

fn store(pool: &Pool, strings: &[String]) {
    let mut offset = 0usize;
    for s in strings {
        let bytes = s.as_bytes();
        let len = bytes.len() + 1;
        if offset + len > STATIC_AREA_SIZE {
            eprintln!("no more room for {}-byte string", len);
            std::process::exit(1);
        }
        unsafe {
            let dst = pool.static_area().add(offset);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            *dst.add(bytes.len()) = 0;
        }
        pool.persist(pmalloc::Offset(STATIC_OFFSET + offset as u64), len);
        offset += len;
    }
}

fn dump(pool: &Pool) {
    let mut sep = "";
    let mut run = String::new();
    for i in 0..STATIC_AREA_SIZE {
        let byte = unsafe { *pool.static_area().add(i) };
        if byte.is_ascii_graphic() || byte == b' ' {
            run.push(byte as char);
        } else if byte == 0 {
            if !run.is_empty() {
                print!("{}{}", sep, run);
                sep = "\n";
                run.clear();
            }
        }
    }
    if !run.is_empty() {
        print!("{}{}", sep, run);
    }
    println!();
}
