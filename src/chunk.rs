use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::units::UNIT_SIZE;

/// A `Chunk` records one mapping obtained from a [`ChunkSource`], so that it
/// can be given back.
///
/// The record lives in the first page of the mapping it describes. The rest
/// of the mapping is handed to the free list.
///
/// [`ChunkSource`]: crate::source::ChunkSource
#[repr(C)]
pub struct Chunk {
    next: Option<NonNull<Chunk>>,
    byte_count: usize,
}

impl Chunk {
    /// The start of the mapping, which is also where this record lives.
    pub fn base(&self) -> NonNull<u8> {
        NonNull::from(self).cast()
    }

    /// The full length of the mapping, metadata page included.
    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    /// The address of the next chunk in the list, if any.
    pub fn next(&self) -> Option<NonNull<Chunk>> {
        self.next
    }

    /// Units available for allocation: everything after the metadata page.
    pub fn usable_units(&self, page_size: usize) -> usize {
        (self.byte_count - page_size) / UNIT_SIZE
    }

    /// Whether `ptr` could have been returned by an allocation from this
    /// chunk: past the metadata page and the first header, inside the
    /// mapping, and one unit past a unit boundary.
    pub fn contains(&self, ptr: NonNull<u8>, page_size: usize) -> bool {
        let base = self.base().as_ptr() as usize;
        let address = ptr.as_ptr() as usize;
        let first = base + page_size + UNIT_SIZE;
        let end = base + self.byte_count;

        address >= first && address < end && (address - first) % UNIT_SIZE == 0
    }
}

/// A singly-linked list of chunks, newest first.
pub struct ChunkList {
    head: Option<NonNull<Chunk>>,
    len: usize,
}

// A ChunkList is sendable - every record lives in memory its arena owns.
unsafe impl Send for ChunkList {}

impl Default for ChunkList {
    fn default() -> Self {
        ChunkList::new()
    }
}

pub struct ChunkIter<'list> {
    next: Option<NonNull<Chunk>>,
    _list: PhantomData<&'list ChunkList>,
}

impl<'list> Iterator for ChunkIter<'list> {
    type Item = &'list Chunk;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = unsafe { self.next?.as_ref() };
        self.next = chunk.next;
        Some(chunk)
    }
}

impl ChunkList {
    pub const fn new() -> Self {
        ChunkList { head: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn iter(&self) -> ChunkIter<'_> {
        ChunkIter {
            next: self.head,
            _list: PhantomData,
        }
    }

    /// Write a chunk record at the start of a fresh mapping, and push it onto
    /// the list.
    ///
    /// # Safety
    ///
    /// `base` must be a writable, page-aligned mapping of `byte_count` bytes,
    /// owned by this list from now on.
    pub unsafe fn push(&mut self, base: NonNull<u8>, byte_count: usize) -> NonNull<Chunk> {
        let chunk: NonNull<Chunk> = base.cast();
        chunk.as_ptr().write(Chunk {
            next: self.head,
            byte_count,
        });
        self.head = Some(chunk);
        self.len += 1;
        chunk
    }

    /// Remove the newest chunk, returning its mapping as `(base, byte_count)`.
    ///
    /// The record is read before returning, so the caller is free to unmap
    /// the memory right away.
    pub fn pop(&mut self) -> Option<(NonNull<u8>, usize)> {
        let chunk = unsafe { self.head?.as_ref() };
        let mapping = (chunk.base(), chunk.byte_count);
        self.head = chunk.next;
        self.len -= 1;
        Some(mapping)
    }

    /// Whether `ptr` lies in the payload area of any chunk in the list.
    pub fn contains(&self, ptr: NonNull<u8>, page_size: usize) -> bool {
        self.iter().any(|chunk| chunk.contains(ptr, page_size))
    }

    /// Total allocatable units across every chunk.
    pub fn usable_units(&self, page_size: usize) -> usize {
        self.iter().map(|chunk| chunk.usable_units(page_size)).sum()
    }
}
