//! Stand-in for the scheduler's notion of "current process"
//!
//! The trap dispatcher and scheduler are out of scope; `vm_fault`'s first
//! validation step ("current process, HPT, and current address space must
//! all exist") still needs something concrete to check against. This module
//! provides the minimal pieces: a stable per-address-space identity
//! (mirroring `process::alloc_pid`/`ProcessId`) and a single-CPU "current
//! address space" slot standing in for `proc_getas()`/`curproc`.

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

static NEXT_AS_ID: AtomicU32 = AtomicU32::new(1);

/// Stable identity for an address space, used as the `proc` field of every
/// HPT entry it owns. Unlike the original C (which reused the `addrspace`
/// struct's pointer as its own identity), this is a plain integer handle
/// that stays valid even if the descriptor itself moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpaceId(u32);

impl AddressSpaceId {
    /// `as_create`: allocate the next identity.
    pub fn alloc() -> Self {
        Self(NEXT_AS_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Construct an identity with a specific value, for tests that need
    /// deterministic ids rather than whatever `alloc` hands out next.
    #[cfg(test)]
    pub const fn for_test(n: u32) -> Self {
        Self(n)
    }
}

/// The single-CPU "current address space" slot, standing in for
/// `proc_getas()`/`curproc`.
pub struct CurrentContext {
    current: Mutex<Option<AddressSpaceId>>,
}

impl CurrentContext {
    pub const fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    pub fn set_current(&self, id: AddressSpaceId) {
        *self.current.lock() = Some(id);
    }

    pub fn current(&self) -> Option<AddressSpaceId> {
        *self.current.lock()
    }

    pub fn clear_current(&self) {
        *self.current.lock() = None;
    }
}

impl Default for CurrentContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_allocations_are_distinct() {
        let a = AddressSpaceId::alloc();
        let b = AddressSpaceId::alloc();
        assert_ne!(a, b);
    }

    #[test]
    fn current_context_round_trips() {
        let ctx = CurrentContext::new();
        assert!(ctx.current().is_none());
        let id = AddressSpaceId::alloc();
        ctx.set_current(id);
        assert_eq!(ctx.current(), Some(id));
        ctx.clear_current();
        assert!(ctx.current().is_none());
    }
}
