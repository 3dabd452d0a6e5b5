//! Synchronization Primitives
//!
//! Safe synchronization and global state management.

pub mod interrupt_guard;
pub mod once_lock;

pub use interrupt_guard::InterruptGuard;
pub use once_lock::{GlobalState, LazyLock, OnceLock};
