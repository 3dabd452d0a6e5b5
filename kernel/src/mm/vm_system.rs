//! `VmSystem`: the single value the rest of the kernel drives virtual
//! memory through
//!
//! Bundles the frame table, HPT, and TLB shim behind one handle, per the
//! re-architecture note in `SPEC_FULL.md` §9: "model as a single `VmSystem`
//! value initialized at boot... interior mutability... confined to its
//! methods." Also owns the table of live address spaces, since `vm_fault`
//! and the lifecycle operations all need to resolve an `AddressSpaceId` to
//! its `AddressSpace`.

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::config::{HPT_LOAD_FACTOR_DEN, HPT_LOAD_FACTOR_NUM, PAGE_SIZE};
use crate::error::KernelError;
use crate::mm::address_space::AddressSpace;
use crate::mm::bootstrap::BootMemorySource;
use crate::mm::frame_table::FrameTableHandle;
use crate::mm::hpt::Hpt;
use crate::mm::tlb::{SoftTlb, Tlb};
use crate::mm::FrameNumber;
use crate::process_context::{AddressSpaceId, CurrentContext};
use crate::sync::OnceLock;

/// The VM subsystem singleton. `VmSystem::init` is the Rust analogue of
/// `vm_bootstrap()`: it brings up the frame table, then the HPT sized off
/// the frame count it just learned.
pub struct VmSystem {
    frame_table: FrameTableHandle,
    hpt: OnceLock<Hpt>,
    tlb: SoftTlb,
    address_spaces: Mutex<BTreeMap<u32, AddressSpace>>,
    current: CurrentContext,
}

impl VmSystem {
    pub fn new() -> Self {
        Self {
            frame_table: FrameTableHandle::new(),
            hpt: OnceLock::new(),
            tlb: SoftTlb::new(),
            address_spaces: Mutex::new(BTreeMap::new()),
            current: CurrentContext::new(),
        }
    }

    /// `vm_bootstrap`: initialize the frame table, then zero-size the HPT
    /// buckets for the frame count it reports.
    pub fn init(&self, boot: &dyn BootMemorySource) -> Result<(), KernelError> {
        self.frame_table.init(boot)?;
        let n_frames = self.frame_table.n_frames();
        let hpt_size = (HPT_LOAD_FACTOR_NUM * n_frames / HPT_LOAD_FACTOR_DEN).max(1);

        self.hpt
            .set(Hpt::new(hpt_size))
            .map_err(|_| KernelError::AlreadyExists {
                resource: "vm system",
            })
    }

    pub fn hpt(&self) -> &Hpt {
        self.hpt.get().expect("VmSystem::init must run before use")
    }

    pub fn tlb(&self) -> &impl Tlb {
        &self.tlb
    }

    pub fn current_context(&self) -> &CurrentContext {
        &self.current
    }

    pub fn alloc_frame(&self) -> Option<FrameNumber> {
        let boot = NoStealBoot;
        self.frame_table
            .alloc_kpages(1, &boot)
            .map(FrameNumber::from_kvaddr)
    }

    pub fn frame_refcount(&self, frame: FrameNumber) -> u32 {
        self.frame_table.refcount(frame)
    }

    pub fn copy_on_write_frame(&self, src: FrameNumber) -> Option<FrameNumber> {
        let boot = NoStealBoot;
        self.frame_table.copy_on_write(src, &boot)
    }

    pub fn address_space_exists(&self, id: AddressSpaceId) -> bool {
        self.address_spaces.lock().contains_key(&id.as_u32())
    }

    pub fn with_address_space<R>(&self, id: AddressSpaceId, f: impl FnOnce(&AddressSpace) -> R) -> Option<R> {
        self.address_spaces.lock().get(&id.as_u32()).map(f)
    }

    pub fn with_address_space_mut<R>(&self, id: AddressSpaceId, f: impl FnOnce(&mut AddressSpace) -> R) -> Option<R> {
        self.address_spaces.lock().get_mut(&id.as_u32()).map(f)
    }

    /// `as_create`.
    pub fn create_address_space(&self) -> AddressSpaceId {
        let as_ = AddressSpace::create();
        let id = as_.id;
        self.address_spaces.lock().insert(id.as_u32(), as_);
        id
    }

    /// `as_copy`: clone the region list, duplicate the HPT entries as COW
    /// twins, and flush the TLB.
    pub fn copy_address_space(&self, old_id: AddressSpaceId) -> Option<AddressSpaceId> {
        let cloned_regions = self.with_address_space(old_id, AddressSpace::clone_regions)?;
        let new_id = self.create_address_space();
        self.with_address_space_mut(new_id, |as_| as_.set_regions(cloned_regions));

        self.hpt().duplicate(new_id, old_id, |frame| {
            self.frame_table.bump_refcount(frame);
        });
        self.tlb.flush();
        Some(new_id)
    }

    /// `as_destroy`: purge every HPT entry the address space owns, freeing
    /// their frames, then drop the region list.
    pub fn destroy_address_space(&self, id: AddressSpaceId) {
        self.hpt().purge(id, |frame| {
            self.frame_table.free_kpages(frame.to_kvaddr());
        });
        self.address_spaces.lock().remove(&id.as_u32());
    }

    /// `as_activate`/`as_deactivate`: no per-ASID TLB tagging, so a context
    /// switch always flushes.
    pub fn activate(&self, id: AddressSpaceId) {
        self.current.set_current(id);
        self.tlb.flush();
    }

    pub fn deactivate(&self) {
        self.current.clear_current();
        self.tlb.flush();
    }

    /// `as_prepare_load`/`as_complete_load` with the TLB flush folded in,
    /// since both are always followed by one in the original.
    pub fn prepare_load(&self, id: AddressSpaceId) {
        self.with_address_space_mut(id, AddressSpace::prepare_load);
        self.tlb.flush();
    }

    pub fn complete_load(&self, id: AddressSpaceId) {
        self.with_address_space_mut(id, AddressSpace::complete_load);
        self.tlb.flush();
    }
}

impl Default for VmSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// `alloc_frame`/`copy_on_write_frame` never hit the pre-init "steal
/// memory" path (the frame table always exists by the time they're called),
/// so this collaborator exists only to satisfy `FrameTableHandle`'s
/// signature; it always reports exhaustion.
struct NoStealBoot;

impl BootMemorySource for NoStealBoot {
    fn ram_size(&self) -> usize {
        0
    }
    fn first_free(&self) -> usize {
        0
    }
    fn steal_mem(&self, _pages: usize) -> Option<crate::mm::PhysicalAddress> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::bootstrap::BumpBootSource;
    use crate::mm::Permissions;

    fn test_vm() -> (VmSystem, BumpBootSource) {
        let boot = BumpBootSource::new(32 * PAGE_SIZE, 2 * PAGE_SIZE);
        let vm = VmSystem::new();
        vm.init(&boot).expect("init should succeed");
        (vm, boot)
    }

    #[test]
    fn init_is_rejected_a_second_time() {
        let (vm, boot) = test_vm();
        assert!(vm.init(&boot).is_err());
    }

    #[test]
    fn create_copy_destroy_round_trip() {
        let (vm, _boot) = test_vm();
        let parent = vm.create_address_space();
        vm.with_address_space_mut(parent, |as_| {
            as_.define_region(0x400000, 0x1000, Permissions::RW).unwrap();
        });
        let child = vm.copy_address_space(parent).expect("copy should succeed");
        assert!(vm.address_space_exists(child));

        vm.destroy_address_space(parent);
        assert!(!vm.address_space_exists(parent));
        assert!(vm.address_space_exists(child));
    }

    #[test]
    fn activate_and_deactivate_flush_the_tlb() {
        let (vm, _boot) = test_vm();
        let id = vm.create_address_space();
        vm.tlb.insert(0x1000, 1);
        assert_eq!(vm.tlb.len(), 1);
        vm.activate(id);
        assert_eq!(vm.tlb.len(), 0);
    }
}
