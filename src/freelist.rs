use core::fmt;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use static_assertions::const_assert_eq;

use crate::error::fatal;
use crate::units::UNIT_SIZE;

/// The header for every region an arena manages.
///
/// While the region is free, `next` links it into the arena's free ring. While
/// it is allocated, only `unit_count` matters: it sits one unit before the
/// pointer handed to the caller, so the region can be put back later.
///
/// `unit_count` includes the header's own unit.
#[repr(C, align(16))]
pub struct Header {
    next: NonNull<Header>,
    unit_count: usize,
}

// The free ring does unit arithmetic over `*mut Header`, so a header must be
// exactly one unit.
const_assert_eq!(size_of::<Header>(), UNIT_SIZE);
const_assert_eq!(align_of::<Header>(), UNIT_SIZE);

impl Header {
    /// The number of units in the region this header starts, header included.
    ///
    /// # Safety
    ///
    /// `header` must point to a header written by this crate that has not
    /// been unmapped.
    pub unsafe fn unit_count(header: NonNull<Header>) -> usize {
        (*header.as_ptr()).unit_count
    }
}

/// An enum for easy comparison of blocks and their order
enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

/// A `FreeBlock` is a handle to a header in a [`FreeList`].
///
/// Blocks compare by address, which is the order the ring is kept in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct FreeBlock {
    header: NonNull<Header>,
}

impl FreeBlock {
    /// Write a new header of `unit_count` units at `at`, linked to itself.
    ///
    /// # Safety
    ///
    /// `at` must point to at least `unit_count` units of writable memory not
    /// in use by anything else.
    pub unsafe fn init(at: NonNull<Header>, unit_count: usize) -> FreeBlock {
        at.as_ptr().write(Header {
            next: at,
            unit_count,
        });
        FreeBlock { header: at }
    }

    pub fn header(self) -> NonNull<Header> {
        self.header
    }

    /// The size of the block, in units.
    pub fn units(self) -> usize {
        unsafe { Header::unit_count(self.header) }
    }

    pub fn next(self) -> FreeBlock {
        FreeBlock {
            header: unsafe { (*self.header.as_ptr()).next },
        }
    }

    fn start(self) -> *const Header {
        self.header.as_ptr()
    }

    /// The address of the unit just past this block.
    fn end(self) -> *const Header {
        self.header.as_ptr().wrapping_add(self.units())
    }

    // Modifying the size or link of a block can corrupt the ring, so these
    // are unsafe even though they only touch memory we already own.
    unsafe fn set_units(self, unit_count: usize) {
        (*self.header.as_ptr()).unit_count = unit_count;
    }

    unsafe fn set_next(self, next: FreeBlock) {
        (*self.header.as_ptr()).next = next.header;
    }

    /// Compare two blocks to see how they are ordered.
    fn relation(self, other: Self) -> Relation {
        if self.end() < other.start() {
            Relation::Before
        } else if self.end() == other.start() {
            Relation::AdjacentBefore
        } else if self.start() < other.end() {
            Relation::Overlapping
        } else if self.start() == other.end() {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }

    /// Shrink this block by `units`, and return the split-off tail as a new
    /// block of exactly `units` units. This block keeps its address.
    ///
    /// # Safety
    ///
    /// `units` must be strictly less than this block's size.
    unsafe fn split_tail(self, units: usize) -> FreeBlock {
        let remaining = self.units() - units;
        self.set_units(remaining);
        let tail = NonNull::new_unchecked(self.header.as_ptr().add(remaining));
        FreeBlock::init(tail, units)
    }
}

/// A `FreeList` is a circular ring of free blocks, ordered by address.
///
/// Walking `next` visits blocks in increasing address order, except for one
/// edge (the "wrap") from the highest block back to the lowest. No two blocks
/// in the ring are adjacent in memory; those are merged on insertion.
///
/// The cursor is where the last search or insertion left off, and is where
/// the next search resumes (next-fit). An empty ring has no cursor.
pub struct FreeList {
    cursor: Option<FreeBlock>,
}

// A FreeList is sendable - it only points into memory owned by its arena, and
// the arena only touches it under its lock.
unsafe impl Send for FreeList {}

impl Default for FreeList {
    fn default() -> Self {
        FreeList::new()
    }
}

/// Iterates over one lap of the ring, starting at the cursor.
pub(crate) struct Blocks<'list> {
    start: Option<FreeBlock>,
    next: Option<FreeBlock>,
    _list: PhantomData<&'list FreeList>,
}

impl<'list> Iterator for Blocks<'list> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<FreeBlock> {
        let block = self.next.take()?;
        let following = block.next();
        if Some(following) != self.start {
            self.next = Some(following);
        }
        Some(block)
    }
}

impl fmt::Display for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeList(")?;
        let mut start = true;
        for block in self.iter() {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "Header({:?}, {})", block.header, block.units())?;
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in a
/// FreeList.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    /// Number of blocks overlapping other blocks.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,

    /// Number of blocks that are directly adjacent to each other, and not
    /// merged.
    pub adjacents: usize,

    /// Number of descending edges in the ring beyond the single wrap edge.
    pub out_of_orders: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.adjacents == 0 && self.out_of_orders == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

/// Counts of free blocks and of the chunks backing them.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Number of blocks in the free ring.
    pub free_blocks: usize,
    /// Total units in the free ring.
    pub free_units: usize,
    /// Number of chunks mapped by the arena.
    pub chunks: usize,
    /// Units usable for allocation across all chunks, free or not.
    pub chunk_units: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        FreeList { cursor: None }
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.is_none()
    }

    /// The header the next search will start after.
    pub fn cursor(&self) -> Option<NonNull<Header>> {
        self.cursor.map(FreeBlock::header)
    }

    /// Forget every block. The memory itself is not touched.
    pub fn clear(&mut self) {
        self.cursor = None;
    }

    pub(crate) fn iter(&self) -> Blocks<'_> {
        Blocks {
            start: self.cursor,
            next: self.cursor,
            _list: PhantomData,
        }
    }

    /// Check current size of the ring, and whether its valid.
    ///
    /// The ring is walked from its lowest block, so every edge but the wrap
    /// should be ascending.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();

        let mut lowest = match self.cursor {
            None => return (validity, stats),
            Some(block) => block,
        };
        for block in self.iter() {
            stats.free_blocks += 1;
            stats.free_units += block.units();
            if block < lowest {
                lowest = block;
            }
        }

        let mut previous = lowest;
        for _ in 1..stats.free_blocks {
            let next = previous.next();
            match previous.relation(next) {
                Relation::Before => {
                    // This is valid, do nothing.
                }
                Relation::AdjacentBefore => {
                    // Right order, but these should be merged.
                    validity.adjacents += 1;
                }
                Relation::Overlapping => {
                    // This is really bad.
                    validity.overlaps += 1;
                }
                Relation::AdjacentAfter => {
                    // Wrong order, and these should be merged.
                    validity.out_of_orders += 1;
                    validity.adjacents += 1;
                }
                Relation::After => {
                    // Wrong order.
                    validity.out_of_orders += 1;
                }
            }
            previous = next;
        }

        (validity, stats)
    }

    /// Find a block of at least `units` units, starting just past the cursor,
    /// and remove exactly `units` units from the ring.
    ///
    /// An exact fit is unlinked whole. A larger block gives up its
    /// high-address tail and stays in the ring, smaller, at its own address.
    /// Either way the cursor moves to the block before the one used.
    ///
    /// Returns the header of the removed region, whose `unit_count` is
    /// `units`, or `None` after a full lap without a fit.
    ///
    /// # Safety
    ///
    /// Every block in the ring must be valid, writable memory owned by the
    /// ring.
    pub unsafe fn take(&mut self, units: usize) -> Option<NonNull<Header>> {
        let start = self.cursor?;
        let mut previous = start;

        loop {
            let block = previous.next();
            let size = block.units();

            if size == units {
                if block == previous {
                    // The only block in the ring is exactly right.
                    self.cursor = None;
                } else {
                    previous.set_next(block.next());
                    self.cursor = Some(previous);
                }
                return Some(block.header);
            }

            if size > units {
                let tail = block.split_tail(units);
                self.cursor = Some(previous);
                return Some(tail.header);
            }

            if block == start {
                // Back where we started, and nothing fits.
                return None;
            }
            previous = block;
        }
    }

    /// Add the region starting at `header` to the ring, merging it with its
    /// neighbours in memory where they are also free.
    ///
    /// The cursor moves to the block just before the insertion point (or to
    /// the merged block, if that block was absorbed).
    ///
    /// # Safety
    ///
    /// `header` must start a region of `Header::unit_count(header)` units of
    /// writable memory, owned by nothing else, and ownership of that memory
    /// passes to the ring.
    pub unsafe fn insert(&mut self, header: NonNull<Header>) {
        let block = FreeBlock { header };

        let start = match self.cursor {
            None => {
                block.set_next(block);
                self.cursor = Some(block);
                return;
            }
            Some(start) => start,
        };

        let current = Self::locate(start, block);
        let next = current.next();

        // Both of these hold their own invariants, but if either fails the
        // caller freed memory the ring already owns.
        let overlaps_left = current < block && current.end() > block.start();
        let overlaps_right = block < next && block.end() > next.start();
        if overlaps_left || overlaps_right {
            fatal("freed region overlaps a free block");
        }

        let merge_left = current < block && current.end() == block.start();
        let merge_right = block < next && block.end() == next.start();

        if next == current {
            // A ring of one block. The block can touch it on one side at most.
            if merge_left {
                current.set_units(current.units() + block.units());
            } else if merge_right {
                block.set_units(block.units() + current.units());
                block.set_next(block);
                self.cursor = Some(block);
                return;
            } else {
                block.set_next(current);
                current.set_next(block);
            }
            self.cursor = Some(current);
            return;
        }

        match (merge_left, merge_right) {
            (true, true) => {
                // The freed region bridges the gap between two free blocks,
                // so all three become one.
                current.set_units(current.units() + block.units() + next.units());
                current.set_next(next.next());
            }
            (true, false) => {
                current.set_units(current.units() + block.units());
            }
            (false, true) => {
                block.set_units(block.units() + next.units());
                block.set_next(next.next());
                current.set_next(block);
            }
            (false, false) => {
                block.set_next(next);
                current.set_next(block);
            }
        }

        self.cursor = Some(current);
    }

    /// Find the block after which `block` belongs: either `current < block <
    /// current.next`, or, at the wrap edge, `block` is above the highest
    /// block or below the lowest.
    unsafe fn locate(start: FreeBlock, block: FreeBlock) -> FreeBlock {
        let mut current = start;
        loop {
            let next = current.next();
            if current < block && block < next {
                return current;
            }
            if current >= next && (block > current || block < next) {
                return current;
            }

            current = next;
            if current == start {
                // Only a block already in the ring has no place in it.
                fatal("freed region is already on the free list");
            }
        }
    }
}
