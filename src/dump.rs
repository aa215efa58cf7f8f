use core::fmt::{self, Write};
use core::ptr::null;

use crate::arena::Arena;
use crate::chunk::Chunk;
use crate::source::ChunkSource;

// Counts what passes through, so the dump can report its length.
struct Counting<'w, W> {
    inner: &'w mut W,
    written: usize,
}

impl<W: Write> Write for Counting<'_, W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.inner.write_str(s)?;
        self.written += s.chars().count();
        Ok(())
    }
}

impl<S: ChunkSource> Arena<S> {
    /// Write the arena's chunk list and free list to `out`, one line per
    /// entry, for debugging.
    ///
    /// Returns the number of characters written. The arena stays locked while
    /// writing, so `out` must not allocate from this arena.
    pub fn dump<W: Write>(&self, out: &mut W) -> Result<usize, fmt::Error> {
        let raw = self.lock();
        let mut out = Counting {
            inner: out,
            written: 0,
        };

        writeln!(
            out,
            "Arena {:p} (minimum chunk units {}):",
            self,
            raw.minimum_chunk_units()
        )?;

        for chunk in raw.chunks().iter() {
            let next = chunk.next().map_or(null(), |c| c.as_ptr() as *const Chunk);
            writeln!(
                out,
                "Chunk {:p}: next: {:p}, size: {}",
                chunk,
                next,
                chunk.byte_count()
            )?;
        }

        for block in raw.free_list().iter() {
            writeln!(
                out,
                "Header {:p}: next: {:p}, unit_count: {}",
                block.header(),
                block.next().header(),
                block.units()
            )?;
        }

        Ok(out.written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    struct Broken;

    impl Write for Broken {
        fn write_str(&mut self, _: &str) -> fmt::Result {
            Err(fmt::Error)
        }
    }

    #[test]
    fn test_dump_empty() {
        let arena = Arena::new(1024);
        let mut out = String::new();
        let written = arena.dump(&mut out).unwrap();
        assert_eq!(written, out.len());
        assert_eq!(out.lines().count(), 1);
        assert!(out.starts_with("Arena 0x"));
        assert!(out.contains(&format!("minimum chunk units {}", arena.minimum_chunk_units())));
    }

    #[test]
    fn test_dump_lists_chunks_and_blocks() {
        let arena = Arena::new(1024);
        let a = arena.malloc(10, 1).unwrap();
        let b = arena.malloc(10, 1).unwrap();
        let c = arena.malloc(10, 1).unwrap();
        arena.free(b);

        let mut out = String::new();
        let written = arena.dump(&mut out).unwrap();
        log::info!("{}", out);
        assert_eq!(written, out.len());

        let (_, stats) = arena.stats();
        let chunks = out.lines().filter(|l| l.starts_with("Chunk ")).count();
        let headers = out.lines().filter(|l| l.starts_with("Header ")).count();
        assert_eq!(chunks, stats.chunks);
        assert_eq!(headers, stats.free_blocks);
        assert_eq!(headers, 2);
        assert!(out.contains("unit_count: 2"));
        assert!(out.contains("next: 0x0,"));

        drop(a);
        drop(c);
    }

    #[test]
    fn test_dump_reports_sink_errors() {
        let arena = Arena::new(1024);
        let _held = arena.malloc(1, 1).unwrap();
        assert_eq!(arena.dump(&mut Broken), Err(fmt::Error));
        // The lock was released on the way out.
        assert_eq!(arena.stats().1.chunks, 1);
    }
}
