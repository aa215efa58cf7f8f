//! Arenas and the allocations they hand out.
//!
//! ## Basic Types
//!
//! ### [`RawArena`](struct.RawArena.html)
//!
//! A `RawArena` is the unlocked state of an arena: its chunk source, the list
//! of chunks it has mapped, its free ring and its growth policy. It is only
//! ever reached through the lock of the [`Arena`] that owns it.
//!
//! ### [`Arena`](struct.Arena.html)
//!
//! An `Arena` wraps a `RawArena` with a spin lock to make it thread-safe. Each
//! arena is independent; giving threads their own arenas avoids contention.
//!
//! ### [`Allocation`](struct.Allocation.html)
//!
//! An `Allocation` owns one region handed out by an arena, and gives it back
//! when freed or dropped.

use core::fmt;
use core::mem::{self, MaybeUninit};
use core::ptr::NonNull;
use core::slice;

use spin::{Mutex, MutexGuard};

use crate::chunk::ChunkList;
use crate::error::{fatal, AllocError};
use crate::freelist::{FreeBlock, FreeList, Header, Stats, Validity};
use crate::source::{ChunkSource, MmapSource};
use crate::units::{round_up, units_for, UNIT_SIZE};

/// The byte written over freed payloads when the `scrub_on_free` feature is
/// enabled.
pub const SCRUB_BYTE: u8 = 0xA5;

/// The state of an arena, as seen with its lock held.
pub struct RawArena<S> {
    source: S,
    chunks: ChunkList,
    free: FreeList,
    minimum_chunk_units: usize,
}

impl<S: ChunkSource> RawArena<S> {
    fn new(source: S, minimum_chunk_units: usize) -> Self {
        // Never ask for less than a page at a time.
        let page_units = source.page_size() / UNIT_SIZE;
        RawArena {
            source,
            chunks: ChunkList::new(),
            free: FreeList::new(),
            minimum_chunk_units: minimum_chunk_units.max(page_units),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn chunks(&self) -> &ChunkList {
        &self.chunks
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free
    }

    /// The fewest units a new chunk will provide.
    pub fn minimum_chunk_units(&self) -> usize {
        self.minimum_chunk_units
    }

    /// Get statistics on this arena, and verify validity of the free ring.
    pub fn stats(&self) -> (Validity, Stats) {
        let (validity, mut stats) = self.free.stats();
        stats.chunks = self.chunks.len();
        stats.chunk_units = self.chunks.usable_units(self.source.page_size());
        (validity, stats)
    }

    /// Whether `ptr` lies where this arena could have handed out a region.
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.chunks.contains(ptr, self.source.page_size())
    }

    /// Remove a region of exactly `units` units from the free ring, mapping
    /// new chunks until one fits.
    fn malloc(&mut self, units: usize) -> Result<NonNull<Header>, AllocError> {
        loop {
            if let Some(header) = unsafe { self.free.take(units) } {
                return Ok(header);
            }
            // Every successful growth adds a free block of at least `units`,
            // so the next lap finds it.
            self.grow(units)?;
        }
    }

    /// Map a chunk with room for at least `units` units (and no fewer than
    /// the minimum), and fold its payload area into the free ring.
    fn grow(&mut self, units: usize) -> Result<(), AllocError> {
        let page_size = self.source.page_size();
        let units = units.max(self.minimum_chunk_units);
        let byte_count = units
            .checked_mul(UNIT_SIZE)
            .and_then(|bytes| bytes.checked_add(page_size))
            .and_then(|bytes| round_up(bytes, page_size))
            .ok_or(AllocError::InvalidArgument)?;

        let base = unsafe { self.source.map(byte_count) }.map_err(AllocError::OutOfMemory)?;

        unsafe {
            self.chunks.push(base, byte_count);

            // The first page holds the chunk record; the rest is one free
            // region.
            let region: NonNull<Header> =
                NonNull::new_unchecked(base.as_ptr().add(page_size)).cast();
            let block = FreeBlock::init(region, (byte_count - page_size) / UNIT_SIZE);
            self.free.insert(block.header());
        }

        Ok(())
    }

    /// Put the region at `ptr` back onto the free ring.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `malloc` on this arena, and not freed
    /// since.
    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        if cfg!(feature = "validate_free") && !self.owns(ptr) {
            fatal("freed pointer does not belong to this arena");
        }

        // The header is always immediately before the region we returned.
        let header = NonNull::new_unchecked(ptr.as_ptr().cast::<Header>().sub(1));

        if cfg!(feature = "scrub_on_free") {
            let bytes = (Header::unit_count(header) - 1) * UNIT_SIZE;
            ptr.as_ptr().write_bytes(SCRUB_BYTE, bytes);
        }

        self.free.insert(header);
    }

    /// Unmap every chunk and return to the empty state. Returns the number of
    /// chunks released.
    fn destroy(&mut self) -> usize {
        let mut released = 0;
        while let Some((base, byte_count)) = self.chunks.pop() {
            if unsafe { self.source.unmap(base, byte_count) }.is_err() {
                fatal("failed to unmap an arena chunk");
            }
            released += 1;
        }
        self.free.clear();
        released
    }
}

/// A thread-safe arena, using a spin lock around a RawArena.
///
/// Every operation that reads or changes the arena holds the lock for its
/// whole body, including any calls to the chunk source.
///
/// Dropping an arena unmaps all of its memory.
pub struct Arena<S: ChunkSource = MmapSource> {
    raw: Mutex<RawArena<S>>,
}

impl Arena<MmapSource> {
    /// Create an arena that maps chunks of at least `minimum_chunk_units`
    /// units from the OS. The minimum is raised to one page if it is smaller.
    ///
    /// Nothing is mapped until the first allocation.
    pub fn new(minimum_chunk_units: usize) -> Self {
        Arena::with_source(MmapSource::new(), minimum_chunk_units)
    }
}

impl Default for Arena<MmapSource> {
    fn default() -> Self {
        Arena::new(crate::default_minimum_chunk_units())
    }
}

impl<S: ChunkSource> Arena<S> {
    /// Create an arena that gets its chunks from `source`.
    pub fn with_source(source: S, minimum_chunk_units: usize) -> Self {
        Arena {
            raw: Mutex::new(RawArena::new(source, minimum_chunk_units)),
        }
    }

    /// Lock the arena and get a view of its state.
    ///
    /// Every other operation on this arena, from any thread, spins until the
    /// guard is dropped.
    pub fn lock(&self) -> MutexGuard<'_, RawArena<S>> {
        self.raw.lock()
    }

    pub fn minimum_chunk_units(&self) -> usize {
        self.lock().minimum_chunk_units()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.lock().stats()
    }

    /// Whether `ptr` lies where this arena could have handed out a region.
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.lock().owns(ptr)
    }

    /// Allocate room for `count` elements of `size` bytes each.
    ///
    /// The region is aligned to [`UNIT_SIZE`] and holds at least
    /// `count * size` bytes.
    pub fn malloc(&self, count: usize, size: usize) -> Result<Allocation<'_, S>, AllocError> {
        let ptr = self.malloc_raw(count, size)?;
        Ok(unsafe { Allocation::from_raw(self, ptr) })
    }

    /// Like [`malloc`](Arena::malloc), but hands back a bare pointer that must
    /// be passed to [`free_raw`](Arena::free_raw) later.
    pub fn malloc_raw(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let units = units_for(count, size)?;

        // Logging waits until the lock is released, in case the logger
        // allocates from this arena.
        match self.malloc_units(units) {
            Ok((ptr, 0)) => Ok(ptr),
            Ok((ptr, grown)) => {
                log::debug!(
                    "arena {:p}: mapped {} chunk(s) to allocate {} units",
                    self,
                    grown,
                    units
                );
                Ok(ptr)
            }
            Err(err) => {
                log::warn!("arena {:p}: cannot allocate {} units: {}", self, units, err);
                Err(err)
            }
        }
    }

    /// Allocate `units` units, header included. Returns the payload pointer
    /// and the number of chunks mapped to satisfy the request.
    pub(crate) fn malloc_units(&self, units: usize) -> Result<(NonNull<u8>, usize), AllocError> {
        let mut raw = self.lock();
        let chunks = raw.chunks.len();
        let header = raw.malloc(units)?;
        let grown = raw.chunks.len() - chunks;
        drop(raw);

        let ptr = unsafe { NonNull::new_unchecked(header.as_ptr().add(1)).cast() };
        Ok((ptr, grown))
    }

    /// Give an allocation back.
    ///
    /// An `Allocation` always returns to the arena that produced it, so this
    /// is the same as dropping it.
    pub fn free(&self, allocation: Allocation<'_, S>) {
        drop(allocation)
    }

    /// Put the region at `ptr` back onto the free list, merging it with any
    /// free neighbours.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`malloc_raw`](Arena::malloc_raw) on
    /// this arena (or by [`Allocation::into_raw`]), and not freed since. With
    /// the `validate_free` feature, a pointer outside this arena's chunks
    /// aborts the process instead.
    pub unsafe fn free_raw(&self, ptr: NonNull<u8>) {
        self.lock().free(ptr)
    }

    /// Return all of the arena's memory to its source, leaving the arena as
    /// if newly created.
    ///
    /// Every pointer from [`malloc_raw`](Arena::malloc_raw) is invalid
    /// afterwards. Outstanding [`Allocation`]s borrow the arena, so they
    /// cannot outlive this.
    ///
    /// Taking `&mut self` already excludes every other thread, so the lock is
    /// bypassed rather than acquired.
    pub fn destroy(&mut self) {
        let released = self.raw.get_mut().destroy();
        if released > 0 {
            log::debug!("arena {:p}: unmapped {} chunk(s)", self, released);
        }
    }
}

impl<S: ChunkSource> Drop for Arena<S> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// One region handed out by an [`Arena`].
///
/// The region is freed when this is dropped or passed to [`Arena::free`].
pub struct Allocation<'a, S: ChunkSource = MmapSource> {
    ptr: NonNull<u8>,
    capacity: usize,
    arena: &'a Arena<S>,
}

// An Allocation owns its bytes exclusively, like a Box<[u8]>, and the arena
// it frees into is shared through its lock.
unsafe impl<S: ChunkSource + Send> Send for Allocation<'_, S> {}
unsafe impl<S: ChunkSource + Send> Sync for Allocation<'_, S> {}

impl<'a, S: ChunkSource> Allocation<'a, S> {
    /// Take ownership of a region from [`Arena::malloc_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `arena.malloc_raw` (or `into_raw` on an
    /// allocation from `arena`), and must not be freed or owned elsewhere.
    pub unsafe fn from_raw(arena: &'a Arena<S>, ptr: NonNull<u8>) -> Self {
        let header = ptr.as_ptr().cast::<Header>().sub(1);
        let units = Header::unit_count(NonNull::new_unchecked(header));
        Allocation {
            ptr,
            capacity: (units - 1) * UNIT_SIZE,
            arena,
        }
    }

    /// Give up ownership, without freeing.
    #[must_use]
    pub fn into_raw(self) -> NonNull<u8> {
        let ptr = self.ptr;
        mem::forget(self);
        ptr
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Usable bytes: the request rounded up to whole units.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn arena(&self) -> &'a Arena<S> {
        self.arena
    }

    /// The region, with no promise about what it holds.
    pub fn as_uninit_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr().cast(), self.capacity) }
    }

    /// Set every byte of the region to `byte`, and return it.
    pub fn fill(&mut self, byte: u8) -> &mut [u8] {
        unsafe {
            self.ptr.as_ptr().write_bytes(byte, self.capacity);
            slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity)
        }
    }
}

impl<S: ChunkSource> Drop for Allocation<'_, S> {
    fn drop(&mut self) {
        unsafe { self.arena.free_raw(self.ptr) }
    }
}

impl<S: ChunkSource> fmt::Debug for Allocation<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("ptr", &self.ptr)
            .field("capacity", &self.capacity)
            .finish()
    }
}
