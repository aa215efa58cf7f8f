#![cfg_attr(not(test), no_std)]

//! A thread-safe arena allocator.
//!
//! An [`Arena`] gets memory from the OS in large _chunks_ (anonymous
//! mappings), and hands out pieces of them. Free memory is kept in a circular
//! list ordered by address, searched next-fit from wherever the last search
//! stopped. Freed regions are merged with any free neighbours, and destroying
//! an arena unmaps every chunk it ever mapped.
//!
//! Each arena has its own spin lock. Threads that want to avoid contention
//! can use arenas of their own; there is also a process-wide default arena,
//! used by [`malloc`] and [`free`] when no arena is given, and by
//! [`ArenaAlloc`].
//!
//! ```
//! use arena_malloc::Arena;
//!
//! let arena = Arena::new(arena_malloc::default_minimum_chunk_units());
//! let mut greeting = arena.malloc(5, 1).unwrap();
//! greeting.fill(0)[..5].copy_from_slice(b"hello");
//! arena.free(greeting);
//! ```

use core::ptr::NonNull;

use spin::Once;

pub mod arena;
pub mod chunk;
mod dump;
pub mod error;
pub mod freelist;
pub mod global;
pub mod source;
pub mod units;

pub use arena::{Allocation, Arena, RawArena, SCRUB_BYTE};
pub use error::AllocError;
pub use freelist::{Stats, Validity};
pub use global::ArenaAlloc;
pub use source::{page_size, ChunkSource, MmapSource, ToyHeap};
pub use units::{units_for, UNIT_SIZE};

static DEFAULT_ARENA: Once<Arena> = Once::new();

/// A good minimum chunk size for most arenas: 512 pages worth of units.
pub fn default_minimum_chunk_units() -> usize {
    page_size() * 512 / UNIT_SIZE
}

/// The process-wide arena, created on first use. It is never destroyed.
pub fn default_arena() -> &'static Arena {
    DEFAULT_ARENA.call_once(Arena::default)
}

fn arena_or_default(arena: Option<&Arena>) -> &Arena {
    match arena {
        Some(arena) => arena,
        None => default_arena(),
    }
}

/// Allocate room for `count` elements of `size` bytes from `arena`, or from
/// the default arena if none is given.
pub fn malloc(arena: Option<&Arena>, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    arena_or_default(arena).malloc_raw(count, size)
}

/// Return a region from [`malloc`] to `arena`, or to the default arena if
/// none is given.
///
/// # Safety
///
/// `ptr` must have come from [`malloc`] with the same `arena`, and not have
/// been freed since.
pub unsafe fn free(arena: Option<&Arena>, ptr: NonNull<u8>) {
    arena_or_default(arena).free_raw(ptr)
}
