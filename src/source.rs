//! Where chunks come from.
//!
//! ### [`ChunkSource`](trait.ChunkSource.html)
//!
//! `ChunkSource` is a simple trait interface meant to abstract over the calls
//! to the OS to map and unmap memory.
//!
//! ### [`MmapSource`](struct.MmapSource.html)
//!
//! `MmapSource` uses anonymous private mappings, via `libc::mmap`.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` carves chunks out of a fixed buffer, and fails once that buffer
//! is used up. It is mainly useful for testing.

use core::mem::size_of;
use core::ptr::{null_mut, NonNull};

use errno::Errno;
use spin::Once;

use crate::chunk::Chunk;
use crate::units::{round_up, UNIT_SIZE};

static PAGE_SIZE: Once<usize> = Once::new();

/// The virtual memory page size of this machine, in bytes.
pub fn page_size() -> usize {
    *PAGE_SIZE.call_once(sysconf::page::pagesize)
}

/// Check that a page can hold a chunk record and is a whole number of units.
fn check_page_size(page_size: usize) {
    assert!(
        page_size >= size_of::<Chunk>() && page_size % UNIT_SIZE == 0,
        "page size {} cannot hold chunk metadata in whole units",
        page_size
    );
}

pub trait ChunkSource {
    /// The granularity of mappings, in bytes. Every chunk reserves its first
    /// page for metadata.
    fn page_size(&self) -> usize;

    /// Map at least `byte_count` bytes of fresh, writable memory, aligned to
    /// a page.
    ///
    /// # Safety
    ///
    /// `byte_count` must be a non-zero multiple of `page_size()`. The
    /// returned memory must be untracked by any other code, including the
    /// source itself, until it is passed to `unmap`.
    unsafe fn map(&mut self, byte_count: usize) -> Result<NonNull<u8>, Errno>;

    /// Return a mapping obtained from `map` to its origin.
    ///
    /// # Safety
    ///
    /// `ptr` and `byte_count` must be exactly as given to and returned by
    /// one earlier call to `map`, and nothing may use the memory afterwards.
    unsafe fn unmap(&mut self, ptr: NonNull<u8>, byte_count: usize) -> Result<(), Errno>;
}

/// MmapSource uses virtual memory to provide chunks upon request.
#[derive(Debug, Clone, Copy)]
pub struct MmapSource {
    page_size: usize,
}

impl Default for MmapSource {
    fn default() -> Self {
        MmapSource::new()
    }
}

impl MmapSource {
    pub fn new() -> Self {
        let page_size = page_size();
        check_page_size(page_size);
        MmapSource { page_size }
    }
}

impl ChunkSource for MmapSource {
    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn map(&mut self, byte_count: usize) -> Result<NonNull<u8>, Errno> {
        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            byte_count,
            // We want read/write access to this memory
            libc::PROT_READ | libc::PROT_WRITE,
            // MAP_ANONYMOUS: no file backs this memory.
            //
            // MAP_PRIVATE: We're not sharing this with any other process.
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }

        NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, byte_count: usize) -> Result<(), Errno> {
        if libc::munmap(ptr.as_ptr() as *mut libc::c_void, byte_count) != 0 {
            return Err(errno::errno());
        }
        Ok(())
    }
}

/// A fixed buffer that can pretend to be the OS.
///
/// Chunks are handed out front to back and never reused; unmapping only
/// counts the bytes returned.
pub struct ToyHeap {
    base: NonNull<u8>,
    capacity: usize,
    page_size: usize,
    /// Bytes handed out so far.
    pub size: usize,
    /// Bytes given back through `unmap`.
    pub released: usize,
}

// The buffer is owned exclusively by the ToyHeap for the rest of the program.
unsafe impl Send for ToyHeap {}

impl ToyHeap {
    /// Build a `ToyHeap` over `buffer`, with pages of `page_size` bytes.
    ///
    /// The usable capacity starts at the first page-aligned address in the
    /// buffer.
    pub fn new(buffer: &'static mut [u8], page_size: usize) -> Self {
        check_page_size(page_size);
        assert!(page_size.is_power_of_two(), "page size must be a power of two");

        let start = buffer.as_mut_ptr();
        let skip = start.align_offset(page_size).min(buffer.len());
        let capacity = (buffer.len() - skip) / page_size * page_size;
        let base = unsafe { NonNull::new_unchecked(start.add(skip)) };

        ToyHeap {
            base,
            capacity,
            page_size,
            size: 0,
            released: 0,
        }
    }

    /// Bytes still available to hand out.
    pub fn remaining(&self) -> usize {
        self.capacity - self.size
    }
}

impl ChunkSource for ToyHeap {
    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn map(&mut self, byte_count: usize) -> Result<NonNull<u8>, Errno> {
        let allocating = round_up(byte_count, self.page_size).ok_or(Errno(libc::EINVAL))?;
        if allocating > self.remaining() {
            return Err(Errno(libc::ENOMEM));
        }

        let ptr = NonNull::new_unchecked(self.base.as_ptr().add(self.size));
        self.size += allocating;
        Ok(ptr)
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, byte_count: usize) -> Result<(), Errno> {
        let start = self.base.as_ptr() as usize;
        let address = ptr.as_ptr() as usize;
        if address < start || address + byte_count > start + self.size {
            return Err(Errno(libc::EINVAL));
        }
        self.released += byte_count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn leak(len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }

    #[test]
    fn test_page_size() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert_eq!(page % UNIT_SIZE, 0);
        assert_eq!(MmapSource::new().page_size(), page);
    }

    #[test]
    fn test_mmap_round_trip() {
        let mut source = MmapSource::new();
        let bytes = source.page_size() * 2;
        unsafe {
            let ptr = source.map(bytes).unwrap();
            assert_eq!(ptr.as_ptr() as usize % source.page_size(), 0);
            // Fresh anonymous memory is zeroed, and writable.
            assert_eq!(*ptr.as_ptr(), 0);
            ptr.as_ptr().write_bytes(0x5A, bytes);
            assert_eq!(*ptr.as_ptr().add(bytes - 1), 0x5A);
            source.unmap(ptr, bytes).unwrap();
        }
    }

    #[test]
    fn test_toy_heap() {
        let mut heap = ToyHeap::new(leak(64 * 9), 64);
        assert!(heap.remaining() >= 64 * 8);
        let total = heap.remaining();

        unsafe {
            let first = heap.map(64).unwrap();
            assert_eq!(first.as_ptr() as usize % 64, 0);
            // Requests are rounded up to whole pages.
            let second = heap.map(65).unwrap();
            assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + 64);
            assert_eq!(heap.size, 192);

            assert_eq!(heap.map(total), Err(Errno(libc::ENOMEM)));
            assert_eq!(heap.size, 192);

            heap.unmap(second, 128).unwrap();
            assert_eq!(heap.released, 128);
        }
    }

    #[test]
    #[should_panic]
    fn test_toy_heap_rejects_odd_pages() {
        ToyHeap::new(leak(1024), 24);
    }
}
