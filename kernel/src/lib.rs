//! Virtual memory subsystem for a teaching kernel
//!
//! This library provides the frame table, software-refilled TLB shim,
//! hashed inverted page table, address-space/region descriptors, page-fault
//! handler, and heap-break operation described in `SPEC_FULL.md`. It also
//! exports the small ambient stack (error types, structured logging,
//! synchronization primitives) those modules are built on.

#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

// On a bare-metal target the kernel owns its own heap via a linked-list
// allocator seeded by the bootstrap memory source. On a host target (used
// for `cargo test`), delegate to the system allocator so ordinary
// `Vec`/`Box`-backed data structures work without a custom heap.
#[cfg(all(feature = "alloc", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(feature = "alloc", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(all(feature = "alloc", not(target_os = "none")))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the global heap allocator, for bare-metal boot code
/// that needs to seed it with the memory the bootstrap source reports.
#[cfg(all(feature = "alloc", target_os = "none"))]
pub fn get_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

pub mod config;
pub mod error;
pub mod log_service;
pub mod mm;
pub mod process_context;
pub mod raii;
pub mod sync;

pub use error::{KernelError, KernelResult};
pub use mm::vm_system::VmSystem;
