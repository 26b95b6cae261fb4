//! Command-line driver for the concurrency stress harness, ported from
//! `mt_pmemalloc_test.c`'s `main()`. Hand-rolled flag parsing, matching
//! the original's `getopt` usage rather than pulling in an argument
//! parser the rest of this crate has no other use for.
//!
//! ```text
//! mt_stress [-t threads] [-r mailboxes] [-s max_alloc] [-d seconds] <pool-file> [pool-size]
//! ```

use std::time::Duration;

use pmalloc::backend::PersistMode;
use pmalloc::harness::{self, HarnessConfig};
use pmalloc::Pool;

struct Args {
    path: String,
    size: u64,
    config: HarnessConfig,
}

fn usage(program: &str) -> ! {
    eprintln!(
        "usage: {} [-t threads] [-r mailboxes] [-s max_alloc] [-d seconds] <pool-file> [pool-size]",
        program
    );
    std::process::exit(2);
}

fn parse_args() -> Args {
    let mut config = HarnessConfig::default();
    let mut positional = Vec::new();
    let mut argv = std::env::args();
    let program = argv.next().unwrap_or_else(|| "mt_stress".to_string());

    let mut iter = argv.peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-t" => config.threads = next_num(&mut iter, &program, "-t") as usize,
            "-r" => config.mailboxes = next_num(&mut iter, &program, "-r") as usize,
            "-s" => config.max_alloc = next_num(&mut iter, &program, "-s"),
            "-d" => config.duration = Duration::from_secs(next_num(&mut iter, &program, "-d")),
            "-h" | "--help" => usage(&program),
            other if other.starts_with('-') => {
                eprintln!("unrecognized flag {:?}", other);
                usage(&program);
            }
            other => positional.push(other.to_string()),
        }
    }

    if positional.is_empty() || positional.len() > 2 {
        usage(&program);
    }
    let path = positional[0].clone();
    let size = positional
        .get(1)
        .map(|s| s.parse::<u64>().unwrap_or_else(|_| usage(&program)))
        .unwrap_or(pmalloc::layout::MIN_POOL_SIZE * 16);

    Args { path, size, config }
}

fn next_num(iter: &mut std::iter::Peekable<std::env::Args>, program: &str, flag: &str) -> u64 {
    match iter.next().and_then(|s| s.parse::<u64>().ok()) {
        Some(n) => n,
        None => {
            eprintln!("{} requires a numeric argument", flag);
            usage(program)
        }
    }
}

fn main() {
    env_logger::init();
    let args = parse_args();

    let mode = PersistMode::from_env_or(PersistMode::PageSync);
    log::info!(
        "mt_stress: opening {:?} ({} bytes, backend={:?})",
        args.path,
        args.size,
        mode
    );
    let pool = match Pool::init(&args.path, args.size, mode) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("failed to open pool {:?}: {}", args.path, e);
            std::process::exit(1);
        }
    };

    log::info!(
        "mt_stress: running {} threads over {} mailboxes for {:?}",
        args.config.threads,
        args.config.mailboxes,
        args.config.duration
    );
    let stats = match harness::run(&pool, &args.config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("harness run failed: {}", e);
            std::process::exit(1);
        }
    };
    println!("completed {} operations", stats.total_ops);
}
