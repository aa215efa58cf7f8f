use core::fmt;

use errno::Errno;

/// The ways an allocation request can fail.
///
/// Neither failure leaves the arena changed: a rejected request never touches
/// the free list, and a failed mapping records no chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The requested size was zero, or computing it overflowed.
    InvalidArgument,
    /// The operating system refused to map more memory.
    OutOfMemory(Errno),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidArgument => write!(f, "invalid allocation size"),
            AllocError::OutOfMemory(errno) => {
                write!(f, "out of memory (errno {})", errno.0)
            }
        }
    }
}

impl core::error::Error for AllocError {}

/// Report an unrecoverable allocator corruption and abort the process.
///
/// This never unwinds: by the time this is called, continuing would hand out
/// memory from a list we can no longer trust.
#[cold]
pub(crate) fn fatal(message: &str) -> ! {
    const PREFIX: &str = "arena_malloc: fatal: ";
    unsafe {
        libc::write(2, PREFIX.as_ptr() as *const libc::c_void, PREFIX.len());
        libc::write(2, message.as_ptr() as *const libc::c_void, message.len());
        libc::write(2, "\n".as_ptr() as *const libc::c_void, 1);
        libc::abort()
    }
}
