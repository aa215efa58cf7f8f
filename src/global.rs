use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{null_mut, NonNull};

use crate::default_arena;
use crate::units::{units_for, UNIT_SIZE};

/// A global allocator backed by the process default arena.
///
/// ```ignore
/// #[global_allocator]
/// static ALLOCATOR: arena_malloc::ArenaAlloc = arena_malloc::ArenaAlloc::new();
/// ```
///
/// Layouts aligned more strictly than [`UNIT_SIZE`] cannot be served, and
/// fail like an exhausted heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArenaAlloc;

impl ArenaAlloc {
    pub const fn new() -> Self {
        ArenaAlloc
    }
}

unsafe impl GlobalAlloc for ArenaAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > UNIT_SIZE {
            return null_mut();
        }
        let units = match units_for(layout.size(), 1) {
            Ok(units) => units,
            Err(_) => return null_mut(),
        };

        // No logging on this path: the logger may well allocate through us.
        match default_arena().malloc_units(units) {
            Ok((ptr, _)) => ptr.as_ptr(),
            Err(_) => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            default_arena().free_raw(ptr);
        }
    }
}
