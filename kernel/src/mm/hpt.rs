//! Hashed inverted page table
//!
//! One global table, keyed on `(address-space identity, virtual page
//! number)`, sized proportional to physical frame count rather than virtual
//! address space. Collisions are resolved by separate chaining with
//! tail-append insertion order, mirroring `insert_hpt`/`search_hpt` in the
//! original `vm.c`.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use crate::mm::{FrameNumber, Permissions, VirtualAddress};
use crate::process_context::AddressSpaceId;

/// Permission/flag byte stored in each HPT entry (see `SPEC_FULL.md` §6):
/// bit 0 present, bits 1-3 protection (X,W,R from low to high), bit 4
/// modified, bit 5 referenced, bit 6 cache-disable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HptFlags(pub u8);

impl HptFlags {
    pub const PRESENT: u8 = 1 << 0;
    pub const MODIFIED: u8 = 1 << 4;
    pub const REFERENCED: u8 = 1 << 5;
    pub const CACHE_DISABLE: u8 = 1 << 6;

    pub fn new(perms: Permissions) -> Self {
        Self(Self::PRESENT | (perms.bits() << 1))
    }

    pub fn present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    pub fn perms(self) -> Permissions {
        Permissions::from_bits((self.0 >> 1) & 0b111)
    }

    pub fn writable(self) -> bool {
        self.perms().write
    }

    pub fn set_writable(&mut self) {
        let mut p = self.perms();
        p.write = true;
        self.0 = (self.0 & !(0b111 << 1)) | (p.bits() << 1) | Self::PRESENT;
    }

    pub fn clear_writable(&mut self) {
        let mut p = self.perms();
        p.write = false;
        self.0 = (self.0 & !(0b111 << 1)) | (p.bits() << 1) | Self::PRESENT;
    }
}

/// One mapping `(address space, vpn) -> frame`.
pub struct HptEntry {
    pub proc: AddressSpaceId,
    pub vpn: u32,
    pub ppn: FrameNumber,
    pub flags: HptFlags,
    next: Option<Box<HptEntry>>,
}

/// `hpt_hash`: combine address-space identity and faulting page number to
/// spread unrelated processes' similar address ranges across buckets.
fn hpt_hash(as_id: AddressSpaceId, vpn: u32, hpt_size: usize) -> usize {
    ((as_id.as_u32() ^ vpn) as usize) % hpt_size
}

/// The hashed inverted page table itself.
pub struct Hpt {
    buckets: Mutex<Vec<Option<Box<HptEntry>>>>,
}

impl Hpt {
    /// `hpt_size` should be `HPT_LOAD_FACTOR_NUM * n_frames /
    /// HPT_LOAD_FACTOR_DEN` per `config`.
    pub fn new(hpt_size: usize) -> Self {
        let mut buckets = Vec::with_capacity(hpt_size);
        buckets.resize_with(hpt_size, || None);
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    fn size(&self) -> usize {
        self.buckets.lock().len()
    }

    /// `search_hpt`: walk the bucket's chain for a matching `(proc, vpn)`.
    /// Callers are expected to already hold an interrupts-masked section.
    pub fn lookup(&self, as_id: AddressSpaceId, vaddr: VirtualAddress) -> Option<(FrameNumber, HptFlags)> {
        let vpn = vaddr.page_number();
        let idx = hpt_hash(as_id, vpn, self.size());
        let buckets = self.buckets.lock();
        let mut cur = buckets[idx].as_deref();
        while let Some(entry) = cur {
            if entry.proc == as_id && entry.vpn == vpn {
                return Some((entry.ppn, entry.flags));
            }
            cur = entry.next.as_deref();
        }
        None
    }

    /// `insert_hpt`: append a new entry to the tail of its bucket's chain.
    pub fn insert(&self, as_id: AddressSpaceId, vaddr: VirtualAddress, ppn: FrameNumber, perms: Permissions) {
        let vpn = vaddr.page_number();
        let idx = hpt_hash(as_id, vpn, self.size());
        let entry = Box::new(HptEntry {
            proc: as_id,
            vpn,
            ppn,
            flags: HptFlags::new(perms),
            next: None,
        });
        let mut buckets = self.buckets.lock();
        match buckets[idx].as_mut() {
            None => buckets[idx] = Some(entry),
            Some(head) => {
                let mut cur = head;
                while cur.next.is_some() {
                    cur = cur.next.as_mut().unwrap();
                }
                cur.next = Some(entry);
            }
        }
    }

    /// Mutate the flags of the unique entry for `(as_id, vaddr)`, if present.
    pub fn set_flags(&self, as_id: AddressSpaceId, vaddr: VirtualAddress, f: impl FnOnce(&mut HptFlags)) -> bool {
        let vpn = vaddr.page_number();
        let idx = hpt_hash(as_id, vpn, self.size());
        let mut buckets = self.buckets.lock();
        let mut cur = buckets[idx].as_deref_mut();
        while let Some(entry) = cur {
            if entry.proc == as_id && entry.vpn == vpn {
                f(&mut entry.flags);
                return true;
            }
            cur = entry.next.as_deref_mut();
        }
        false
    }

    /// Retarget the unique entry for `(as_id, vaddr)` at a new frame (the
    /// COW private-copy path).
    pub fn retarget(&self, as_id: AddressSpaceId, vaddr: VirtualAddress, new_ppn: FrameNumber) -> bool {
        let vpn = vaddr.page_number();
        let idx = hpt_hash(as_id, vpn, self.size());
        let mut buckets = self.buckets.lock();
        let mut cur = buckets[idx].as_deref_mut();
        while let Some(entry) = cur {
            if entry.proc == as_id && entry.vpn == vpn {
                entry.ppn = new_ppn;
                return true;
            }
            cur = entry.next.as_deref_mut();
        }
        false
    }

    /// `purge_hpt`: unlink and drop every entry owned by `as_id`, invoking
    /// `on_free` (expected to call the frame table's `free_kpages`-style
    /// release) for each backing frame.
    pub fn purge(&self, as_id: AddressSpaceId, mut on_free: impl FnMut(FrameNumber)) {
        let mut buckets = self.buckets.lock();
        for bucket in buckets.iter_mut() {
            let mut head = bucket.take();
            let mut retained = Vec::new();
            while let Some(mut entry) = head {
                head = entry.next.take();
                if entry.proc == as_id {
                    on_free(entry.ppn);
                } else {
                    retained.push(entry);
                }
            }
            // Rebuild the chain in original (tail-append) order.
            let mut rebuilt: Option<Box<HptEntry>> = None;
            while let Some(mut entry) = retained.pop() {
                entry.next = rebuilt.take();
                rebuilt = Some(entry);
            }
            *bucket = rebuilt;
        }
    }

    /// `duplicate_hpt`: for every entry owned by `old_as`, install a twin
    /// owned by `new_as` pointing at the same frame, clear the write bit on
    /// both, and let the caller bump the frame's refcount.
    pub fn duplicate(&self, new_as: AddressSpaceId, old_as: AddressSpaceId, mut on_share: impl FnMut(FrameNumber)) {
        // Collect first to avoid mutating bucket chains we're iterating.
        let mut to_duplicate: Vec<(u32, FrameNumber, HptFlags)> = Vec::new();
        {
            let buckets = self.buckets.lock();
            for bucket in buckets.iter() {
                let mut cur = bucket.as_deref();
                while let Some(entry) = cur {
                    if entry.proc == old_as {
                        to_duplicate.push((entry.vpn, entry.ppn, entry.flags));
                    }
                    cur = entry.next.as_deref();
                }
            }
        }

        for (vpn, ppn, mut flags) in to_duplicate {
            flags.clear_writable();
            self.set_flags(old_as, VirtualAddress::new(vpn << crate::config::PAGE_BITS), |f| f.clear_writable());

            let idx = hpt_hash(new_as, vpn, self.size());
            let twin = Box::new(HptEntry {
                proc: new_as,
                vpn,
                ppn,
                flags,
                next: None,
            });
            let mut buckets = self.buckets.lock();
            match buckets[idx].as_mut() {
                None => buckets[idx] = Some(twin),
                Some(head) => {
                    let mut cur = head;
                    while cur.next.is_some() {
                        cur = cur.next.as_mut().unwrap();
                    }
                    cur.next = Some(twin);
                }
            }
            drop(buckets);
            on_share(ppn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_id(n: u32) -> AddressSpaceId {
        AddressSpaceId::for_test(n)
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let hpt = Hpt::new(16);
        hpt.insert(as_id(1), VirtualAddress::new(0x1000), FrameNumber::new(5), Permissions::RW);
        let (ppn, flags) = hpt.lookup(as_id(1), VirtualAddress::new(0x1000)).expect("entry present");
        assert_eq!(ppn, FrameNumber::new(5));
        assert!(flags.present());
        assert!(flags.writable());
    }

    #[test]
    fn distinct_address_spaces_do_not_collide() {
        let hpt = Hpt::new(4); // force bucket collisions
        hpt.insert(as_id(1), VirtualAddress::new(0x1000), FrameNumber::new(1), Permissions::RW);
        hpt.insert(as_id(2), VirtualAddress::new(0x1000), FrameNumber::new(2), Permissions::RW);
        assert_eq!(hpt.lookup(as_id(1), VirtualAddress::new(0x1000)).unwrap().0, FrameNumber::new(1));
        assert_eq!(hpt.lookup(as_id(2), VirtualAddress::new(0x1000)).unwrap().0, FrameNumber::new(2));
    }

    #[test]
    fn purge_removes_only_the_named_address_space() {
        let hpt = Hpt::new(4);
        hpt.insert(as_id(1), VirtualAddress::new(0x1000), FrameNumber::new(1), Permissions::RW);
        hpt.insert(as_id(2), VirtualAddress::new(0x1000), FrameNumber::new(2), Permissions::RW);
        hpt.insert(as_id(1), VirtualAddress::new(0x2000), FrameNumber::new(3), Permissions::RW);

        let mut freed = Vec::new();
        hpt.purge(as_id(1), |f| freed.push(f));

        freed.sort_by_key(|f| f.as_u32());
        assert_eq!(freed, alloc::vec![FrameNumber::new(1), FrameNumber::new(3)]);
        assert!(hpt.lookup(as_id(1), VirtualAddress::new(0x1000)).is_none());
        assert!(hpt.lookup(as_id(2), VirtualAddress::new(0x1000)).is_some());
    }

    #[test]
    fn duplicate_shares_frame_and_clears_write_bit() {
        let hpt = Hpt::new(8);
        hpt.insert(as_id(1), VirtualAddress::new(0x3000), FrameNumber::new(7), Permissions::RW);

        let mut shared = Vec::new();
        hpt.duplicate(as_id(2), as_id(1), |f| shared.push(f));

        assert_eq!(shared, alloc::vec![FrameNumber::new(7)]);
        let (ppn_old, flags_old) = hpt.lookup(as_id(1), VirtualAddress::new(0x3000)).unwrap();
        let (ppn_new, flags_new) = hpt.lookup(as_id(2), VirtualAddress::new(0x3000)).unwrap();
        assert_eq!(ppn_old, ppn_new);
        assert!(!flags_old.writable());
        assert!(!flags_new.writable());
    }
}
