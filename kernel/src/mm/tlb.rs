//! Software-refilled TLB shim
//!
//! Models a 64-entry hardware TLB with a `random`-slot insert, a full
//! flush, and a probe-and-replace update, the three verbs `vm_fault` uses.
//! Every operation runs with interrupts masked (single-CPU assumption;
//! SMP TLB shootdown is a documented panic, not a supported path).

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::config::{NUM_TLB_ENTRIES, PAGE_BITS};
use crate::sync::InterruptGuard;

/// Bit set in a slot's low word when the entry is valid.
pub const TLBLO_VALID: u32 = 1 << 0;
/// Bit set when the mapped page is writable ("dirty" in MIPS terminology:
/// a clear dirty bit is what forces the `READONLY` fault path).
pub const TLBLO_DIRTY: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    vpn: u32,
    lo: u32,
}

/// The one true verb set a `vm_fault` implementation needs from hardware.
pub trait Tlb {
    /// Install `(vaddr, entry_lo)` into an implementation-chosen slot.
    fn insert(&self, vaddr: u32, entry_lo: u32);

    /// Invalidate every slot.
    fn flush(&self);

    /// Overwrite the slot already mapping `vaddr`. Panics if absent: the
    /// caller's contract is that the TLB must already hold an entry for an
    /// address that just raised a `READONLY` fault.
    fn replace(&self, vaddr: u32, entry_lo: u32);
}

/// Software model of the 64-slot hardware TLB.
pub struct SoftTlb {
    slots: Mutex<[Option<Slot>; NUM_TLB_ENTRIES]>,
    next_victim: AtomicU32,
}

impl SoftTlb {
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new([None; NUM_TLB_ENTRIES]),
            next_victim: AtomicU32::new(0),
        }
    }

    fn vpn_of(vaddr: u32) -> u32 {
        vaddr >> PAGE_BITS
    }

    /// Look up the slot index currently mapping `vaddr`, if any.
    pub fn probe(&self, vaddr: u32) -> Option<usize> {
        let vpn = Self::vpn_of(vaddr);
        self.slots
            .lock()
            .iter()
            .position(|s| s.is_some_and(|s| s.vpn == vpn))
    }

    /// Number of currently valid entries (test-observable).
    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SoftTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb for SoftTlb {
    fn insert(&self, vaddr: u32, entry_lo: u32) {
        let _guard = InterruptGuard::enter();
        let vpn = Self::vpn_of(vaddr);
        let mut slots = self.slots.lock();
        let victim = self.next_victim.fetch_add(1, Ordering::Relaxed) as usize % NUM_TLB_ENTRIES;
        slots[victim] = Some(Slot { vpn, lo: entry_lo });
    }

    fn flush(&self) {
        let _guard = InterruptGuard::enter();
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            *slot = None;
        }
    }

    fn replace(&self, vaddr: u32, entry_lo: u32) {
        let _guard = InterruptGuard::enter();
        let vpn = Self::vpn_of(vaddr);
        let mut slots = self.slots.lock();
        let idx = slots
            .iter()
            .position(|s| s.is_some_and(|s| s.vpn == vpn))
            .unwrap_or_else(|| panic!("tlb replace: no entry for vaddr 0x{vaddr:x}"));
        slots[idx] = Some(Slot { vpn, lo: entry_lo });
    }
}

/// SMP TLB shootdown is unimplemented by design: this kernel targets a
/// single processor.
pub fn tlb_shootdown() -> ! {
    panic!("vm tried to do tlb shootdown?!");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_probe_finds_the_slot() {
        let tlb = SoftTlb::new();
        tlb.insert(0x1000, TLBLO_VALID);
        assert!(tlb.probe(0x1000).is_some());
        assert_eq!(tlb.len(), 1);
    }

    #[test]
    fn flush_clears_every_slot() {
        let tlb = SoftTlb::new();
        for i in 0..4 {
            tlb.insert(i * 0x1000, TLBLO_VALID);
        }
        assert_eq!(tlb.len(), 4);
        tlb.flush();
        assert_eq!(tlb.len(), 0);
    }

    #[test]
    fn replace_overwrites_existing_entry() {
        let tlb = SoftTlb::new();
        tlb.insert(0x2000, TLBLO_VALID);
        tlb.replace(0x2000, TLBLO_VALID | TLBLO_DIRTY);
        let idx = tlb.probe(0x2000).expect("entry should still be present");
        assert_eq!(tlb.slots.lock()[idx].unwrap().lo, TLBLO_VALID | TLBLO_DIRTY);
    }

    #[test]
    #[should_panic(expected = "no entry for vaddr")]
    fn replace_of_absent_entry_panics() {
        let tlb = SoftTlb::new();
        tlb.replace(0x3000, TLBLO_VALID);
    }

    #[test]
    #[should_panic(expected = "tlb shootdown")]
    fn shootdown_panics() {
        tlb_shootdown();
    }
}
