//! `sbrk`-style heap-break operation
//!
//! [`crate::mm::address_space::AddressSpace::sbrk`] implements the
//! region-bookkeeping algorithm directly (mirroring `sbrk()` in the
//! original `kern/syscall/sbrk.c`); this module adds the syscall-facing
//! adapter `sbrk_syscall`, matching `sys_sbrk`'s job of turning that into a
//! result a trap handler can hand back to userspace.

use crate::error::KernelError;
use crate::mm::vm_system::VmSystem;
use crate::mm::VirtualAddress;
use crate::process_context::AddressSpaceId;

/// `sys_sbrk`: page-align is handled inside `AddressSpace::sbrk`; this just
/// adapts the `Result<u32, KernelError>` it returns into a `VirtualAddress`.
pub fn sbrk_syscall(vm: &VmSystem, as_id: AddressSpaceId, amount: i32) -> Result<VirtualAddress, KernelError> {
    vm.with_address_space_mut(as_id, |as_| as_.sbrk(amount))
        .ok_or(KernelError::NotFound {
            resource: "address space",
        })?
        .map(VirtualAddress::new)
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
    fn sbrk_syscall_creates_and_grows_heap() {
        let (vm, _boot) = test_vm();
        let as_id = vm.create_address_space();
        vm.with_address_space_mut(as_id, |as_| {
            as_.define_region(0x400000, 0x1000, Permissions::RW).unwrap();
            as_.define_stack().unwrap();
        });

        let base = sbrk_syscall(&vm, as_id, 0x1000).expect("heap creation should succeed");
        assert_eq!(base.as_u32(), 0x401000);
        let brk = sbrk_syscall(&vm, as_id, 0).expect("query should succeed");
        assert_eq!(brk.as_u32(), 0x402000);
    }

    #[test]
    fn sbrk_syscall_rejects_shrink_with_no_heap() {
        let (vm, _boot) = test_vm();
        let as_id = vm.create_address_space();
        assert!(sbrk_syscall(&vm, as_id, -0x1000).is_err());
    }
}
