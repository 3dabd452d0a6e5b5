//! Stand-in for the bootstrap memory source
//!
//! The real `ram_stealmem`/`ram_getsize`/`ram_getfirstfree` trio belongs to
//! the platform's early boot allocator, out of scope here. [`BootMemorySource`]
//! is the seam the frame table calls through instead of reaching for those
//! globals directly; [`BumpBootSource`] is a reference implementation
//! (and the one used by every unit test in this crate).

use spin::Mutex;

use crate::mm::PhysicalAddress;

/// Collaborator the frame table bootstraps against.
pub trait BootMemorySource {
    /// Total installed RAM, in bytes.
    fn ram_size(&self) -> usize;

    /// Byte offset of the first byte not yet consumed by early boot
    /// allocations (kernel image, boot-time page/frame tables, ...).
    fn first_free(&self) -> usize;

    /// Hand out `pages` contiguous pages before the frame table exists.
    /// Returns `None` on exhaustion.
    fn steal_mem(&self, pages: usize) -> Option<PhysicalAddress>;
}

/// A simple bump-pointer boot source over a fixed-size region, starting the
/// bump cursor at `first_free`.
pub struct BumpBootSource {
    ram_size: usize,
    first_free: usize,
    cursor: Mutex<usize>,
}

impl BumpBootSource {
    pub fn new(ram_size: usize, first_free: usize) -> Self {
        Self {
            ram_size,
            first_free,
            cursor: Mutex::new(first_free),
        }
    }
}

impl BootMemorySource for BumpBootSource {
    fn ram_size(&self) -> usize {
        self.ram_size
    }

    fn first_free(&self) -> usize {
        self.first_free
    }

    fn steal_mem(&self, pages: usize) -> Option<PhysicalAddress> {
        let mut cursor = self.cursor.lock();
        let size = pages * crate::config::PAGE_SIZE;
        if *cursor + size > self.ram_size {
            return None;
        }
        let addr = *cursor;
        *cursor += size;
        Some(PhysicalAddress::new(addr as u32))
    }
}
