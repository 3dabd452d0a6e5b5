//! Page geometry, TLB sizing, and memory-layout constants
//!
//! Centralizes the compile-time numbers the rest of `mm` is built against,
//! the way the original kernel scattered them across `mm::mod` and
//! `process::memory::layout` but gathered in one place here since the whole
//! crate is this one subsystem.

/// Bytes per physical/virtual page.
pub const PAGE_SIZE: usize = 4096;

/// `log2(PAGE_SIZE)`; also the width of a page offset.
pub const PAGE_BITS: u32 = 12;

/// Mask that isolates the page-frame portion of an address.
pub const PAGE_FRAME_MASK: u32 = 0xFFFF_F000;

/// Top of user-mode virtual memory; also the initial stack pointer and the
/// upper bound the stack region grows down from.
pub const USERSTACK: u32 = 0x8000_0000;

/// Size reserved for the user stack region.
pub const USERSTACK_SIZE: u32 = 16 * PAGE_SIZE as u32;

/// Offset added to a physical address to obtain its kernel direct-mapped
/// virtual address.
pub const KSEG0_OFFSET: u32 = 0x8000_0000;

/// Number of entries in the hardware TLB.
pub const NUM_TLB_ENTRIES: usize = 64;

/// HPT bucket count is `HPT_LOAD_FACTOR_NUM * n_frames / HPT_LOAD_FACTOR_DEN`,
/// i.e. twice the number of physical frames, targeting a load factor of 0.5.
pub const HPT_LOAD_FACTOR_NUM: usize = 2;
pub const HPT_LOAD_FACTOR_DEN: usize = 1;

/// Round `addr` down to the nearest page boundary.
pub const fn page_align_down(addr: u32) -> u32 {
    addr & !(PAGE_SIZE as u32 - 1)
}

/// Round `addr` up to the nearest page boundary.
pub const fn page_align_up(addr: u32) -> u32 {
    page_align_down(addr + PAGE_SIZE as u32 - 1)
}
