//! RAII stand-in for `splhigh()`/`splx()`
//!
//! The real kernel raises the interrupt priority level around HPT and TLB
//! operations so a timer interrupt can't reenter them mid-update. Masking
//! real interrupts is a platform concern out of scope here; this guard
//! tracks the same "critical section" discipline so callers can assert it
//! in tests instead of relying on silent convention.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

static MASKED: AtomicBool = AtomicBool::new(false);
static SECTIONS_ENTERED: AtomicUsize = AtomicUsize::new(0);

/// Enter an interrupts-masked critical section. Dropping the guard restores
/// the previous state (nesting is allowed, matching `splhigh`'s returned
/// previous level).
pub struct InterruptGuard {
    was_masked: bool,
}

impl InterruptGuard {
    pub fn enter() -> Self {
        let was_masked = MASKED.swap(true, Ordering::AcqRel);
        SECTIONS_ENTERED.fetch_add(1, Ordering::Relaxed);
        Self { was_masked }
    }

    /// Whether we are currently inside a masked section (for assertions in
    /// code that requires its caller to already hold one).
    pub fn is_masked() -> bool {
        MASKED.load(Ordering::Acquire)
    }

    /// Total number of times a section has been entered (test-observable).
    pub fn sections_entered() -> usize {
        SECTIONS_ENTERED.load(Ordering::Relaxed)
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if !self.was_masked {
            MASKED.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_restores_outer_state() {
        assert!(!InterruptGuard::is_masked());
        {
            let _outer = InterruptGuard::enter();
            assert!(InterruptGuard::is_masked());
            {
                let _inner = InterruptGuard::enter();
                assert!(InterruptGuard::is_masked());
            }
            assert!(InterruptGuard::is_masked());
        }
        assert!(!InterruptGuard::is_masked());
    }
}
