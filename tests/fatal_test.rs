//! Heap corruption must abort the process, so each case runs in a child copy
//! of this test binary, selected through `FATAL_CASE`.

use std::env;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::ptr::NonNull;

use arena_malloc::{Arena, ChunkSource, ToyHeap};

use errno::Errno;
use test_log::test;

const CASE_VAR: &str = "FATAL_CASE";

/// A source whose mappings can never be given back.
struct StuckHeap(ToyHeap);

impl ChunkSource for StuckHeap {
    fn page_size(&self) -> usize {
        self.0.page_size()
    }

    unsafe fn map(&mut self, byte_count: usize) -> Result<NonNull<u8>, Errno> {
        self.0.map(byte_count)
    }

    unsafe fn unmap(&mut self, _ptr: NonNull<u8>, _byte_count: usize) -> Result<(), Errno> {
        Err(Errno(libc::EINVAL))
    }
}

fn double_free() {
    let arena = Arena::new(1024);
    let ptr = arena.malloc_raw(100, 1).unwrap();
    let _keep = arena.malloc(100, 1).unwrap();
    unsafe {
        arena.free_raw(ptr);
        arena.free_raw(ptr);
    }
}

fn overlapping_free() {
    let arena = Arena::new(1024);
    let ptr = arena.malloc_raw(100, 1).unwrap();
    let _keep = arena.malloc(100, 1).unwrap();
    unsafe {
        arena.free_raw(ptr);
        // Forge a two-unit header inside the block that was just freed, and
        // free the region behind it.
        let forged = ptr.as_ptr().cast::<usize>();
        forged.add(1).write(2);
        arena.free_raw(NonNull::new_unchecked(ptr.as_ptr().add(arena_malloc::UNIT_SIZE)));
    }
}

fn stuck_unmap() {
    let buffer = Box::leak(vec![0u8; 64 * 1024].into_boxed_slice());
    let mut arena = Arena::with_source(StuckHeap(ToyHeap::new(buffer, 256)), 16);
    let _ = arena.malloc_raw(10, 1).unwrap();
    arena.destroy();
}

#[cfg(feature = "validate_free")]
fn foreign_free() {
    let arena = Arena::new(1024);
    let _keep = arena.malloc(10, 1).unwrap();
    let local = [0u128; 4];
    unsafe { arena.free_raw(NonNull::from(&local[1]).cast()) };
}

// Does nothing unless started by `expect_abort`.
#[test]
fn fatal_child() {
    let case = match env::var(CASE_VAR) {
        Ok(case) => case,
        Err(_) => return,
    };
    match case.as_str() {
        "double_free" => double_free(),
        "overlapping_free" => overlapping_free(),
        "stuck_unmap" => stuck_unmap(),
        #[cfg(feature = "validate_free")]
        "foreign_free" => foreign_free(),
        other => panic!("unknown case {}", other),
    }
    // Reaching here means the corruption went unnoticed.
    std::process::exit(3);
}

fn expect_abort(case: &str, message: &str) {
    let output = Command::new(env::current_exe().unwrap())
        .args(["fatal_child", "--exact", "--nocapture", "--test-threads=1"])
        .env(CASE_VAR, case)
        .output()
        .unwrap();

    let stderr = String::from_utf8_lossy(&output.stderr);
    log::info!("{}: {:?}\n{}", case, output.status, stderr);
    assert_eq!(output.status.signal(), Some(libc::SIGABRT), "{}", stderr);
    assert!(stderr.contains("arena_malloc: fatal: "), "{}", stderr);
    assert!(stderr.contains(message), "{}", stderr);
}

#[test]
fn test_double_free_aborts() {
    expect_abort("double_free", "freed region");
}

#[test]
fn test_overlapping_free_aborts() {
    expect_abort("overlapping_free", "freed region overlaps a free block");
}

#[test]
fn test_failed_unmap_aborts() {
    expect_abort("stuck_unmap", "failed to unmap an arena chunk");
}

#[cfg(feature = "validate_free")]
#[test]
fn test_foreign_free_aborts() {
    expect_abort("foreign_free", "freed pointer does not belong to this arena");
}
