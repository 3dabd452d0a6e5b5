//! Physical frame table: free list, reference counting, kernel-page
//! allocation.
//!
//! A direct port of the original `frametable.c` free-list design onto a
//! safe Rust structure: the frame table is an array of
//! [`FrameTableEntry`] indexed by physical frame number, the free list is
//! threaded through `next_free`, and a single spinlock (`stealmem_lock` in
//! the original) guards all mutable state.

use alloc::vec::Vec;

use spin::Mutex;

use crate::config::PAGE_SIZE;
use crate::error::KernelError;
use crate::mm::bootstrap::BootMemorySource;
use crate::mm::{FrameNumber, VirtualAddress};

/// Sentinel meaning "no next entry" / "free list exhausted".
pub const INVALID: u32 = u32::MAX;

/// One entry per physical frame.
#[derive(Debug, Clone, Copy)]
struct FrameTableEntry {
    refcount: u32,
    used: bool,
    next_free: u32,
}

impl FrameTableEntry {
    const fn pinned() -> Self {
        Self {
            refcount: 1,
            used: true,
            next_free: INVALID,
        }
    }
}

/// Owns every physical frame on the machine after [`FrameTable::init`] runs.
///
/// Also owns the backing bytes for every frame, so that callers can zero or
/// copy frame contents without dereferencing raw kernel-direct-mapped
/// pointers (which, outside a booted kernel, point nowhere).
pub struct FrameTable {
    entries: Vec<FrameTableEntry>,
    cur_free: u32,
    backing: Vec<u8>,
}

impl FrameTable {
    /// `frametable_init`: compute frame count from the bootstrap memory
    /// source, pin every frame below `first_free` (already consumed by the
    /// bootstrap allocator), and thread the remainder onto the free list.
    fn init(boot: &dyn BootMemorySource) -> Result<Self, KernelError> {
        let ram_size = boot.ram_size();
        let n_frames = ram_size / PAGE_SIZE;
        if n_frames == 0 {
            return Err(KernelError::OutOfMemory {
                requested: 1,
                available: 0,
            });
        }

        let used_frames = boot.first_free() / PAGE_SIZE;
        let mut entries = Vec::with_capacity(n_frames);

        for _ in 0..used_frames.min(n_frames) {
            entries.push(FrameTableEntry::pinned());
        }
        for i in used_frames..n_frames {
            let next = if i + 1 == n_frames { INVALID } else { (i + 1) as u32 };
            entries.push(FrameTableEntry {
                refcount: 0,
                used: false,
                next_free: next,
            });
        }

        let cur_free = if used_frames >= n_frames {
            INVALID
        } else {
            used_frames as u32
        };

        Ok(Self {
            entries,
            cur_free,
            backing: alloc::vec![0u8; n_frames * PAGE_SIZE],
        })
    }

    fn n_frames(&self) -> usize {
        self.entries.len()
    }

    /// Pop the head of the free list. Caller holds the table lock.
    fn pop_frame(&mut self) -> Option<FrameNumber> {
        if self.cur_free == INVALID {
            return None;
        }
        let idx = self.cur_free as usize;
        let next = self.entries[idx].next_free;
        self.cur_free = next;

        let entry = &mut self.entries[idx];
        entry.used = true;
        entry.refcount = 1;
        entry.next_free = INVALID;

        let start = idx * PAGE_SIZE;
        self.backing[start..start + PAGE_SIZE].fill(0);

        Some(FrameNumber::new(idx as u32))
    }

    /// Prepend a now-free frame onto the free list, or decrement a shared
    /// frame's refcount. Caller holds the table lock.
    fn push_frame(&mut self, frame: FrameNumber) {
        let idx = frame.as_u32() as usize;
        match self.entries[idx].refcount {
            0 => panic!("frame {idx} reached 0 refcount"),
            1 => {
                let next = self.cur_free;
                let entry = &mut self.entries[idx];
                entry.used = false;
                entry.refcount = 0;
                entry.next_free = next;
                self.cur_free = idx as u32;
            }
            _ => self.entries[idx].refcount -= 1,
        }
    }

    fn refcount(&self, frame: FrameNumber) -> u32 {
        self.entries[frame.as_u32() as usize].refcount
    }

    fn bump_refcount(&mut self, frame: FrameNumber) {
        self.entries[frame.as_u32() as usize].refcount += 1;
    }

    fn frame_bytes(&self, frame: FrameNumber) -> &[u8] {
        let start = frame.as_u32() as usize * PAGE_SIZE;
        &self.backing[start..start + PAGE_SIZE]
    }

    fn frame_bytes_mut(&mut self, frame: FrameNumber) -> &mut [u8] {
        let start = frame.as_u32() as usize * PAGE_SIZE;
        &mut self.backing[start..start + PAGE_SIZE]
    }

    /// Number of frames currently on the free list (for property tests).
    fn free_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.cur_free;
        while cur != INVALID {
            count += 1;
            cur = self.entries[cur as usize].next_free;
        }
        count
    }
}

/// Global frame table, guarded by a single spinlock (`stealmem_lock`).
///
/// Before [`frametable_init`] has run, [`alloc_kpages`] falls back to the
/// bootstrap memory source directly, matching the original's "VM system not
/// alive yet" path.
pub struct FrameTableHandle {
    table: Mutex<Option<FrameTable>>,
}

impl FrameTableHandle {
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(None),
        }
    }

    pub fn init(&self, boot: &dyn BootMemorySource) -> Result<(), KernelError> {
        let mut guard = self.table.lock();
        if guard.is_some() {
            return Err(KernelError::AlreadyExists {
                resource: "frame table",
            });
        }
        *guard = Some(FrameTable::init(boot)?);
        Ok(())
    }

    /// `alloc_kpages`: only `n == 1` is supported once the table exists;
    /// before that, delegate to the bootstrap source under the same lock.
    pub fn alloc_kpages(&self, n: usize, boot: &dyn BootMemorySource) -> Option<VirtualAddress> {
        let mut guard = self.table.lock();
        match guard.as_mut() {
            None => boot.steal_mem(n).map(|p| p.to_kvaddr()),
            Some(_) if n != 1 => None,
            Some(table) => table.pop_frame().map(|f| f.to_kvaddr()),
        }
    }

    /// `free_kpages`: panics if the frame's refcount was already 0.
    pub fn free_kpages(&self, vaddr: VirtualAddress) {
        let mut guard = self.table.lock();
        let table = guard.as_mut().expect("frame table not initialized");
        table.push_frame(FrameNumber::from_kvaddr(vaddr));
    }

    pub fn refcount(&self, frame: FrameNumber) -> u32 {
        let guard = self.table.lock();
        guard.as_ref().expect("frame table not initialized").refcount(frame)
    }

    /// Increment a frame's refcount (used by HPT duplication for COW).
    pub fn bump_refcount(&self, frame: FrameNumber) {
        let mut guard = self.table.lock();
        guard
            .as_mut()
            .expect("frame table not initialized")
            .bump_refcount(frame);
    }

    /// Allocate a fresh frame and copy `src`'s contents into it, for the
    /// COW private-copy path. Returns the new frame.
    pub fn copy_on_write(&self, src: FrameNumber, boot: &dyn BootMemorySource) -> Option<FrameNumber> {
        let mut guard = self.table.lock();
        let table = guard.as_mut()?;
        let new_frame = match table.pop_frame() {
            Some(f) => f,
            None => return None,
        };
        let mut tmp = [0u8; PAGE_SIZE];
        tmp.copy_from_slice(table.frame_bytes(src));
        table.frame_bytes_mut(new_frame).copy_from_slice(&tmp);
        let _ = boot;
        Some(new_frame)
    }

    pub fn n_frames(&self) -> usize {
        self.table.lock().as_ref().map_or(0, FrameTable::n_frames)
    }

    pub fn free_count(&self) -> usize {
        self.table.lock().as_ref().map_or(0, FrameTable::free_count)
    }
}

impl Default for FrameTableHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::bootstrap::BumpBootSource;

    fn small_table() -> (FrameTableHandle, BumpBootSource) {
        let boot = BumpBootSource::new(8 * PAGE_SIZE, 2 * PAGE_SIZE);
        let handle = FrameTableHandle::new();
        handle.init(&boot).expect("init should succeed");
        (handle, boot)
    }

    #[test]
    fn init_pins_used_frames_and_frees_the_rest() {
        let (handle, _boot) = small_table();
        assert_eq!(handle.n_frames(), 8);
        assert_eq!(handle.free_count(), 6);
    }

    #[test]
    fn alloc_then_free_round_trips() {
        let (handle, boot) = small_table();
        let before = handle.free_count();
        let vaddr = handle.alloc_kpages(1, &boot).expect("alloc should succeed");
        assert_eq!(handle.free_count(), before - 1);
        handle.free_kpages(vaddr);
        assert_eq!(handle.free_count(), before);
    }

    #[test]
    fn alloc_zeroes_the_frame() {
        let (handle, boot) = small_table();
        let vaddr = handle.alloc_kpages(1, &boot).expect("alloc should succeed");
        let frame = FrameNumber::from_kvaddr(vaddr);
        let guard = handle.table.lock();
        assert!(guard.as_ref().unwrap().frame_bytes(frame).iter().all(|&b| b == 0));
    }

    #[test]
    fn multi_page_kernel_alloc_is_rejected_once_table_exists() {
        let (handle, boot) = small_table();
        assert!(handle.alloc_kpages(2, &boot).is_none());
    }

    #[test]
    #[should_panic(expected = "reached 0 refcount")]
    fn double_free_panics() {
        let (handle, boot) = small_table();
        let vaddr = handle.alloc_kpages(1, &boot).expect("alloc should succeed");
        handle.free_kpages(vaddr);
        handle.free_kpages(vaddr);
    }

    #[test]
    fn shared_frame_decrements_before_freeing() {
        let (handle, boot) = small_table();
        let vaddr = handle.alloc_kpages(1, &boot).expect("alloc should succeed");
        let frame = FrameNumber::from_kvaddr(vaddr);
        handle.bump_refcount(frame);
        assert_eq!(handle.refcount(frame), 2);
        handle.free_kpages(vaddr);
        assert_eq!(handle.refcount(frame), 1);
        handle.free_kpages(vaddr);
    }

    #[test]
    fn exhaustion_returns_none() {
        let (handle, boot) = small_table();
        let mut allocated = Vec::new();
        while let Some(v) = handle.alloc_kpages(1, &boot) {
            allocated.push(v);
        }
        assert_eq!(handle.free_count(), 0);
        assert!(handle.alloc_kpages(1, &boot).is_none());
    }
}
