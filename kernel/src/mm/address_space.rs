//! Address-space regions: segments, permissions, and lifecycle hooks
//!
//! A region list is a singly-linked list sorted by start address, exactly
//! one of which may be the stack (growing downward from its `start`) and
//! one the heap (growing upward). This mirrors `addrspace.c`'s
//! `append_region`/`region_type`/`region_perms`, generalized to carry a
//! full three-bit permission set per region instead of just a write bit,
//! and with `region_type` fully specified (the original's version does not
//! special-case the stack's downward span).

use alloc::boxed::Box;

use crate::error::KernelError;
use crate::mm::{Permissions, RegionType, VirtualAddress};
use crate::process_context::AddressSpaceId;

use crate::config::{page_align_down, page_align_up, PAGE_SIZE, USERSTACK, USERSTACK_SIZE};

/// One segment of an address space.
pub struct Region {
    pub start: u32,
    pub size: u32,
    pub cur_perms: Permissions,
    pub old_perms: Permissions,
    pub is_stack: bool,
    pub is_heap: bool,
    next: Option<Box<Region>>,
}

impl Region {
    fn end(&self) -> u32 {
        self.start + self.size
    }
}

/// A process's virtual memory configuration.
pub struct AddressSpace {
    pub id: AddressSpaceId,
    regions: Option<Box<Region>>,
}

impl AddressSpace {
    /// `as_create`.
    pub fn create() -> Self {
        Self {
            id: AddressSpaceId::alloc(),
            regions: None,
        }
    }

    /// `as_define_region`: page-align `vaddr` down and `size` up to cover
    /// the same bytes, then insert sorted by start address.
    pub fn define_region(&mut self, vaddr: u32, size: u32, perms: Permissions) -> Result<(), KernelError> {
        let start = page_align_down(vaddr);
        let aligned_size = page_align_up(vaddr + size) - start;

        let new_region = Box::new(Region {
            start,
            size: aligned_size,
            cur_perms: perms,
            old_perms: perms,
            is_stack: false,
            is_heap: false,
            next: None,
        });
        self.insert_sorted(new_region);
        Ok(())
    }

    /// `as_define_stack`: reserve `USERSTACK_SIZE` bytes below `USERSTACK`
    /// and report the initial stack pointer (the top of user VM).
    pub fn define_stack(&mut self) -> Result<VirtualAddress, KernelError> {
        let start = USERSTACK;
        let region = Box::new(Region {
            start,
            size: USERSTACK_SIZE,
            cur_perms: Permissions::RW,
            old_perms: Permissions::RW,
            is_stack: true,
            is_heap: false,
            next: None,
        });
        self.insert_sorted(region);
        Ok(VirtualAddress::new(USERSTACK))
    }

    fn insert_sorted(&mut self, new_region: Box<Region>) {
        let mut new_region = new_region;
        if self.regions.as_ref().is_none_or(|head| new_region.start < head.start) {
            new_region.next = self.regions.take();
            self.regions = Some(new_region);
            return;
        }
        let mut cur = self.regions.as_mut().unwrap();
        while cur
            .next
            .as_ref()
            .is_some_and(|next| next.start < new_region.start)
        {
            cur = cur.next.as_mut().unwrap();
        }
        new_region.next = cur.next.take();
        cur.next = Some(new_region);
    }

    fn iter(&self) -> impl Iterator<Item = &Region> {
        let mut cur = self.regions.as_deref();
        core::iter::from_fn(move || {
            let region = cur?;
            cur = region.next.as_deref();
            Some(region)
        })
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut Region> {
        let mut cur = self.regions.as_deref_mut();
        core::iter::from_fn(move || {
            let region = cur.take()?;
            cur = region.next.as_deref_mut();
            Some(region)
        })
    }

    fn heap(&self) -> Option<&Region> {
        self.iter().find(|r| r.is_heap)
    }

    fn stack(&self) -> Option<&Region> {
        self.iter().find(|r| r.is_stack)
    }

    /// Page-aligned end of the last non-stack, non-heap region: where a
    /// lazily created heap begins.
    fn heap_base(&self) -> u32 {
        self.iter()
            .filter(|r| !r.is_stack)
            .map(|r| r.end())
            .max()
            .map(page_align_up)
            .unwrap_or(0)
    }

    /// `region_type`: `Stack` if `addr` lies in the stack's downward span,
    /// else the containing non-stack region's role, else `Unused`.
    pub fn region_type(&self, addr: u32) -> RegionType {
        if let Some(stack) = self.stack() {
            if addr < stack.start && addr >= stack.start.saturating_sub(stack.size) {
                return RegionType::Stack;
            }
        }
        for region in self.iter() {
            if region.is_stack {
                continue;
            }
            if addr >= region.start && addr < region.end() {
                return if region.is_heap {
                    RegionType::Heap
                } else {
                    RegionType::Data
                };
            }
        }
        RegionType::Unused
    }

    /// `region_perms`: the containing region's current permission set, if
    /// any.
    pub fn region_perms(&self, addr: u32) -> Option<Permissions> {
        if let Some(stack) = self.stack() {
            if addr < stack.start && addr >= stack.start.saturating_sub(stack.size) {
                return Some(stack.cur_perms);
            }
        }
        self.iter()
            .filter(|r| !r.is_stack)
            .find(|r| addr >= r.start && addr < r.end())
            .map(|r| r.cur_perms)
    }

    /// `as_prepare_load`: elevate every region to RWX, saving the prior set.
    pub fn prepare_load(&mut self) {
        for region in self.iter_mut() {
            region.old_perms = region.cur_perms;
            region.cur_perms = Permissions::RWX;
        }
    }

    /// `as_complete_load`: restore the permissions `prepare_load` saved.
    /// Caller is responsible for flushing the TLB afterward.
    pub fn complete_load(&mut self) {
        for region in self.iter_mut() {
            region.cur_perms = region.old_perms;
        }
    }

    /// `sbrk`, minus the frame/TLB effects (purely region bookkeeping).
    /// Returns the previous break on success.
    pub fn sbrk(&mut self, amount: i32) -> Result<u32, KernelError> {
        let amount = if amount == 0 {
            0
        } else if amount > 0 {
            page_align_up(amount as u32) as i32
        } else {
            -(page_align_up((-amount) as u32) as i32)
        };

        if self.heap().is_none() {
            if amount < 0 {
                return Err(KernelError::InvalidArgument {
                    name: "amount",
                    value: "negative sbrk with no heap region",
                });
            }
            let base = self.heap_base();
            let top = base + amount as u32;
            if self.region_type(top) != RegionType::Unused {
                return Err(KernelError::ResourceExhausted { resource: "heap" });
            }
            let region = Box::new(Region {
                start: base,
                size: amount as u32,
                cur_perms: Permissions::RW,
                old_perms: Permissions::RW,
                is_stack: false,
                is_heap: true,
                next: None,
            });
            self.insert_sorted(region);
            return Ok(base);
        }

        let (heap_start, heap_size) = {
            let heap = self.heap().unwrap();
            (heap.start, heap.size)
        };
        let old_break = heap_start + heap_size;
        let new_end = (old_break as i64 + amount as i64) as u32;

        if amount > 0 && self.region_type(new_end) != RegionType::Unused {
            return Err(KernelError::ResourceExhausted { resource: "heap" });
        }
        if amount < 0 && (new_end as i64) < heap_start as i64 {
            return Err(KernelError::InvalidArgument {
                name: "amount",
                value: "shrink below heap start",
            });
        }

        let heap = self.iter_mut().find(|r| r.is_heap).unwrap();
        heap.size = (heap.size as i64 + amount as i64) as u32;
        Ok(old_break)
    }

    /// Shallow structural clone of the region list for `as_copy`; HPT
    /// duplication and the TLB flush are the caller's (`VmSystem`'s)
    /// responsibility.
    pub fn clone_regions(&self) -> Option<Box<Region>> {
        fn clone_chain(region: &Region) -> Box<Region> {
            Box::new(Region {
                start: region.start,
                size: region.size,
                cur_perms: region.cur_perms,
                old_perms: region.old_perms,
                is_stack: region.is_stack,
                is_heap: region.is_heap,
                next: region.next.as_deref().map(clone_chain),
            })
        }
        self.regions.as_deref().map(clone_chain)
    }

    pub fn set_regions(&mut self, regions: Option<Box<Region>>) {
        self.regions = regions;
    }
}

#[allow(dead_code)]
const fn _assert_page_size_is_4k() {
    assert!(PAGE_SIZE == 4096);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_stay_sorted_by_start() {
        let mut as_ = AddressSpace::create();
        as_.define_region(0x402000, 0x1000, Permissions::RW).unwrap();
        as_.define_region(0x400000, 0x1000, Permissions::RX).unwrap();
        as_.define_region(0x401000, 0x1000, Permissions::RW).unwrap();

        let starts: alloc::vec::Vec<u32> = as_.iter().map(|r| r.start).collect();
        assert_eq!(starts, alloc::vec![0x400000, 0x401000, 0x402000]);
    }

    #[test]
    fn region_type_distinguishes_stack_from_data() {
        let mut as_ = AddressSpace::create();
        as_.define_region(0x400000, 0x1000, Permissions::RX).unwrap();
        as_.define_stack().unwrap();

        assert_eq!(as_.region_type(0x400010), RegionType::Data);
        assert_eq!(as_.region_type(USERSTACK - 1), RegionType::Stack);
        assert_eq!(as_.region_type(USERSTACK), RegionType::Unused);
        assert_eq!(as_.region_type(0x500000), RegionType::Unused);
    }

    #[test]
    fn sbrk_creates_heap_lazily_then_grows_it() {
        let mut as_ = AddressSpace::create();
        as_.define_region(0x400000, 0x2000, Permissions::RW).unwrap();
        as_.define_stack().unwrap();

        let base = as_.sbrk(0x2000).expect("initial heap creation");
        assert_eq!(base, 0x402000);
        assert_eq!(as_.sbrk(0).unwrap(), 0x404000);
        assert_eq!(as_.sbrk(0x1000).unwrap(), 0x404000);
        assert_eq!(as_.sbrk(0).unwrap(), 0x405000);
    }

    #[test]
    fn sbrk_rejects_growth_into_the_stack() {
        let mut as_ = AddressSpace::create();
        as_.define_region(0x400000, 0x1000, Permissions::RW).unwrap();
        as_.define_stack().unwrap();
        as_.sbrk(0x1000).unwrap();

        let huge = (USERSTACK - USERSTACK_SIZE - as_.heap().unwrap().end()) as i32;
        assert!(as_.sbrk(huge).is_err());
    }

    #[test]
    fn prepare_and_complete_load_round_trip_permissions() {
        let mut as_ = AddressSpace::create();
        as_.define_region(0x400000, 0x1000, Permissions::RX).unwrap();
        as_.prepare_load();
        assert_eq!(as_.region_perms(0x400000), Some(Permissions::RWX));
        as_.complete_load();
        assert_eq!(as_.region_perms(0x400000), Some(Permissions::RX));
    }

    #[test]
    fn clone_regions_is_a_deep_structural_copy() {
        let mut as_ = AddressSpace::create();
        as_.define_region(0x400000, 0x1000, Permissions::RW).unwrap();
        let cloned = as_.clone_regions();
        let mut other = AddressSpace::create();
        other.set_regions(cloned);
        assert_eq!(other.iter().count(), 1);
        assert_eq!(other.iter().next().unwrap().start, 0x400000);
    }
}
