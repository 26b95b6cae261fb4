//! Word-frequency binary search tree stored entirely in a pool, ported
//! from `original_source/binarytree/tree.c` and `tree_wordfreq.c`.
//!
//! Each node is a small fixed header (left/right child offsets, a
//! count) followed by the NUL-terminated word itself, allocated as one
//! variably-sized clump. The tree root lives in the pool's static area.
//! The original's `tree_insert_subtree`/`tree_walk_subtree`/
//! `tree_free_subtree` recursed one stack frame per tree level; here
//! they are explicit-stack iterative walks instead, so a skewed tree
//! built from already-sorted input can't blow the stack.
//!
//! ```text
//! wordtree [-b backend] <path> <file>...
//! ```

use std::cmp::Ordering;

use pmalloc::backend::PersistMode;
use pmalloc::layout::STATIC_OFFSET;
use pmalloc::{Offset, Pool};

const DEFAULT_POOL_SIZE: u64 = 10 * 1024 * 1024;

const LEFT_FIELD: u64 = 0;
const RIGHT_FIELD: u64 = 8;
const COUNT_FIELD: u64 = 16;
const NODE_HEADER_SIZE: u64 = 24;

fn left_of(node: Offset) -> Offset {
    Offset(node.0 + LEFT_FIELD)
}

fn right_of(node: Offset) -> Offset {
    Offset(node.0 + RIGHT_FIELD)
}

fn count_of(node: Offset) -> Offset {
    Offset(node.0 + COUNT_FIELD)
}

fn read_u64(pool: &Pool, at: Offset) -> u64 {
    unsafe { *(pool.at(at) as *const u64) }
}

fn write_u64(pool: &Pool, at: Offset, value: u64) {
    unsafe {
        *(pool.at(at) as *mut u64) = value;
    }
}

fn read_cstr(pool: &Pool, node: Offset) -> &str {
    let ptr = unsafe { pool.at(node).add(NODE_HEADER_SIZE as usize) } as *const u8;
    let cstr = unsafe { std::ffi::CStr::from_ptr(ptr as *const i8) };
    cstr.to_str().unwrap_or("")
}

fn root_slot(_pool: &Pool) -> Offset {
    Offset(STATIC_OFFSET)
}

/// Insert `word`, or bump its count if already present.
fn tree_insert(pool: &Pool, word: &str) {
    let mut slot = root_slot(pool);
    loop {
        let node = Offset(read_u64(pool, slot));
        if node.is_null() {
            let total = NODE_HEADER_SIZE + word.len() as u64 + 1;
            let new_node = pool.reserve(total).unwrap_or_else(|e| {
                eprintln!("reserve: {}", e);
                std::process::exit(1);
            });
            write_u64(pool, left_of(new_node), 0);
            write_u64(pool, right_of(new_node), 0);
            write_u64(pool, count_of(new_node), 1);
            unsafe {
                let dst = pool.at(new_node).add(NODE_HEADER_SIZE as usize);
                std::ptr::copy_nonoverlapping(word.as_bytes().as_ptr(), dst, word.len());
                *dst.add(word.len()) = 0;
            }
            pool.on_active(new_node, slot, new_node);
            pool.activate(new_node);
            return;
        }

        match word.cmp(read_cstr(pool, node)) {
            Ordering::Equal => {
                let count = read_u64(pool, count_of(node)) + 1;
                write_u64(pool, count_of(node), count);
                pool.persist(count_of(node), std::mem::size_of::<u64>());
                return;
            }
            Ordering::Less => slot = left_of(node),
            Ordering::Greater => slot = right_of(node),
        }
    }
}

/// Print every word and its count, in sorted order.
fn tree_walk(pool: &Pool) {
    let mut stack = Vec::new();
    let mut current = Offset(read_u64(pool, root_slot(pool)));
    loop {
        while !current.is_null() {
            stack.push(current);
            current = Offset(read_u64(pool, left_of(current)));
        }
        match stack.pop() {
            Some(node) => {
                println!("{:5} {}", read_u64(pool, count_of(node)), read_cstr(pool, node));
                current = Offset(read_u64(pool, right_of(node)));
            }
            None => break,
        }
    }
}

/// Free every node in the tree. Unused by `main` today (the demo leaves
/// the tree in the pool so a second run accumulates counts), but kept
/// here since `tree_free` is one of the three operations this module
/// ports.
#[allow(dead_code)]
fn tree_free(pool: &Pool) {
    enum Frame {
        Visit(Offset, Offset),
        Free(Offset, Offset),
    }

    let mut stack = vec![Frame::Visit(Offset(read_u64(pool, root_slot(pool))), root_slot(pool))];
    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Visit(node, slot) => {
                if node.is_null() {
                    continue;
                }
                stack.push(Frame::Free(node, slot));
                stack.push(Frame::Visit(Offset(read_u64(pool, right_of(node))), right_of(node)));
                stack.push(Frame::Visit(Offset(read_u64(pool, left_of(node))), left_of(node)));
            }
            Frame::Free(node, slot) => {
                pool.on_free(node, slot, Offset::NULL);
                pool.free(node);
            }
        }
    }
}

fn insert_words_from_file(pool: &Pool, path: &str) {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("{}: {}", path, e);
            std::process::exit(1);
        }
    };
    for word in text.split(|c: char| !c.is_alphabetic()) {
        if !word.is_empty() {
            tree_insert(pool, word);
        }
    }
}

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
            eprintln!("Usage: wordtree [-b backend] <path> <file>...");
            std::process::exit(1);
        }
    };
    let files: Vec<String> = args.collect();
    if files.is_empty() {
        eprintln!("No files given");
        std::process::exit(1);
    }

    let pool = match Pool::init(&path, DEFAULT_POOL_SIZE, mode) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}: {}", path, e);
            std::process::exit(1);
        }
    };

    for file in &files {
        insert_words_from_file(&pool, file);
    }
    tree_walk(&pool);
}
