//! Page-fault dispatch: `vm_fault`
//!
//! Completes the COW/demand-paging logic that the original `vm.c` left as a
//! `do_cow:` label jumping into a shared `fill_tlb:` tail; here it is one
//! function with the same seven steps, operating against [`super::vm_system::VmSystem`].

use crate::error::KernelError;
use crate::mm::tlb::{Tlb, TLBLO_DIRTY, TLBLO_VALID};
use crate::mm::vm_system::VmSystem;
use crate::mm::{FaultType, RegionType, VirtualAddress};
use crate::process_context::AddressSpaceId;
use crate::sync::InterruptGuard;

/// `vm_fault(faulttype, faultaddress)`.
pub fn vm_fault(
    vm: &VmSystem,
    as_id: AddressSpaceId,
    fault_type: FaultType,
    fault_addr: VirtualAddress,
) -> Result<(), KernelError> {
    // Step 1: validate context. `as_id` must be the current process's
    // address space, and it must still be live.
    if vm.current_context().current() != Some(as_id) {
        return Err(KernelError::InvalidState {
            expected: "current address space",
            actual: "no current process, or a different address space is current",
        });
    }
    if !vm.address_space_exists(as_id) {
        return Err(KernelError::InvalidState {
            expected: "live address space",
            actual: "unknown address space id",
        });
    }

    // Step 2: validate region.
    let region_type = vm.with_address_space(as_id, |as_| as_.region_type(fault_addr.as_u32()));
    if region_type == RegionType::Unused {
        return Err(KernelError::InvalidAddress {
            addr: fault_addr.as_u32() as usize,
        });
    }

    // Step 3: HPT lookup, interrupts masked.
    let _guard = InterruptGuard::enter();
    let existing = vm.hpt().lookup(as_id, fault_addr);

    let (ppn, writable) = match fault_type {
        FaultType::Read | FaultType::Write => match existing {
            Some((ppn, flags)) => (ppn, flags.writable()),
            None => {
                let frame = vm.alloc_frame().ok_or(KernelError::OutOfMemory {
                    requested: 1,
                    available: 0,
                })?;
                let perms = vm
                    .with_address_space(as_id, |as_| as_.region_perms(fault_addr.as_u32()))
                    .ok_or(KernelError::InvalidAddress {
                        addr: fault_addr.as_u32() as usize,
                    })?;
                vm.hpt().insert(as_id, fault_addr, frame, perms);
                (frame, perms.write)
            }
        },
        FaultType::ReadOnly => {
            let (ppn, flags) = existing.expect("READONLY fault with no existing page entry");
            let region_perms = vm
                .with_address_space(as_id, |as_| as_.region_perms(fault_addr.as_u32()))
                .expect("region already validated non-unused above");

            if !region_perms.write {
                return Err(KernelError::InvalidAddress {
                    addr: fault_addr.as_u32() as usize,
                });
            }

            if flags.writable() {
                // Page is writable per the HPT but the TLB entry went stale
                // non-dirty (e.g. after a flush). Fast path: just refresh it.
                let entry_lo =
                    (ppn.as_u32() << crate::config::PAGE_BITS) | TLBLO_VALID | TLBLO_DIRTY;
                vm.tlb().replace(fault_addr.as_u32(), entry_lo);
                return Ok(());
            }

            // COW fault.
            let refcount = vm.frame_refcount(ppn);
            let target_ppn = if refcount > 1 {
                let new_frame = vm.copy_on_write_frame(ppn).ok_or(KernelError::OutOfMemory {
                    requested: 1,
                    available: 0,
                })?;
                vm.hpt().retarget(as_id, fault_addr, new_frame);
                new_frame
            } else {
                ppn
            };
            vm.hpt().set_flags(as_id, fault_addr, |f| f.set_writable());
            vm.tlb().flush();
            (target_ppn, true)
        }
    };

    // Step 6 (joined): fill the TLB.
    let entry_lo = (ppn.as_u32() << crate::config::PAGE_BITS)
        | TLBLO_VALID
        | if writable { TLBLO_DIRTY } else { 0 };
    vm.tlb().insert(fault_addr.as_u32(), entry_lo);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::bootstrap::BumpBootSource;
    use crate::mm::Permissions;

    fn test_vm() -> (VmSystem, BumpBootSource) {
        let boot = BumpBootSource::new(64 * crate::config::PAGE_SIZE, 4 * crate::config::PAGE_SIZE);
        let vm = VmSystem::new();
        vm.init(&boot).expect("init should succeed");
        (vm, boot)
    }

    #[test]
    fn fresh_page_in_installs_a_mapping() {
        let (vm, _boot) = test_vm();
        let as_id = vm.create_address_space();
        vm.with_address_space_mut(as_id, |as_| {
            as_.define_region(0x400000, 0x1000, Permissions::RW).unwrap();
        });
        vm.activate(as_id);

        vm_fault(&vm, as_id, FaultType::Read, VirtualAddress::new(0x400010))
            .expect("fault should succeed");
        assert!(vm
            .hpt()
            .lookup(as_id, VirtualAddress::new(0x400010))
            .is_some());
    }

    #[test]
    fn write_to_read_only_region_faults() {
        let (vm, _boot) = test_vm();
        let as_id = vm.create_address_space();
        vm.with_address_space_mut(as_id, |as_| {
            as_.define_region(0x400000, 0x1000, Permissions::RX).unwrap();
        });
        vm.activate(as_id);
        vm_fault(&vm, as_id, FaultType::Read, VirtualAddress::new(0x400000)).unwrap();

        let result = vm_fault(&vm, as_id, FaultType::ReadOnly, VirtualAddress::new(0x400000));
        assert!(result.is_err());
    }

    #[test]
    fn invalid_region_faults() {
        let (vm, _boot) = test_vm();
        let as_id = vm.create_address_space();
        vm.activate(as_id);
        let result = vm_fault(&vm, as_id, FaultType::Read, VirtualAddress::new(0x900000));
        assert!(result.is_err());
    }

    #[test]
    fn fault_on_a_live_but_not_current_address_space_is_rejected() {
        let (vm, _boot) = test_vm();
        let as_id = vm.create_address_space();
        vm.with_address_space_mut(as_id, |as_| {
            as_.define_region(0x400000, 0x1000, Permissions::RW).unwrap();
        });

        // Never activated: no current process, so step 1 must reject this
        // even though the address space itself is live.
        let result = vm_fault(&vm, as_id, FaultType::Read, VirtualAddress::new(0x400010));
        assert!(result.is_err());

        // Still rejected when a *different* address space is current.
        let other = vm.create_address_space();
        vm.activate(other);
        let result = vm_fault(&vm, as_id, FaultType::Read, VirtualAddress::new(0x400010));
        assert!(result.is_err());
    }

    #[test]
    fn cow_fault_gives_writer_a_private_frame() {
        let (vm, _boot) = test_vm();
        let parent = vm.create_address_space();
        vm.with_address_space_mut(parent, |as_| {
            as_.define_region(0x500000, 0x1000, Permissions::RW).unwrap();
        });
        vm.activate(parent);
        vm_fault(&vm, parent, FaultType::Write, VirtualAddress::new(0x500000)).unwrap();

        let child = vm.copy_address_space(parent).expect("copy should succeed");
        vm.activate(child);

        vm_fault(&vm, child, FaultType::ReadOnly, VirtualAddress::new(0x500000))
            .expect("cow fault should succeed");

        let (parent_ppn, _) = vm.hpt().lookup(parent, VirtualAddress::new(0x500000)).unwrap();
        let (child_ppn, child_flags) = vm.hpt().lookup(child, VirtualAddress::new(0x500000)).unwrap();
        assert_ne!(parent_ppn, child_ppn);
        assert!(child_flags.writable());
    }
}
