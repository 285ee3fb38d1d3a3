//! Interrupt masking for the kernel's critical sections
//!
//! Every access to scheduler state happens with interrupts masked. Sections
//! nest: only the outermost one touches the hardware, inner ones just count.
//! On hosted targets there is no interrupt flag to clear, so the same
//! nesting is tracked in software and interrupt handlers are simulated by
//! ordinary calls.
//!
//! A section belongs to the flow of control that entered it. The context
//! switch carries each task's [`Section`] across with [`current_section`]
//! and [`switch_section`], so a task may block at any depth.

#![no_std]

use core::{
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// Current nesting depth of masked sections
static DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Whether interrupts were enabled when the outermost section was entered
static WERE_ENABLED: AtomicBool = AtomicBool::new(false);

/// Masking state of one flow of control while it is switched out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    depth: usize,
    were_enabled: bool,
}

impl Section {
    /// A task that has never run: it inherits one level from its
    /// dispatcher and runs with interrupts enabled once it leaves it.
    pub const FRESH: Section = Section {
        depth: 1,
        were_enabled: true,
    };

    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// RAII token for a masked section. Dropping it leaves the section.
///
/// Not `Send`: the section belongs to the flow of control that entered it.
#[must_use = "interrupts are unmasked again as soon as the guard is dropped"]
pub struct IrqGuard {
    _not_send: PhantomData<*mut ()>,
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        // SAFETY: the guard was created by a matching `hold`.
        unsafe { release() }
    }
}

/// Masks interrupts until the returned guard is dropped
pub fn disable() -> IrqGuard {
    // SAFETY: balanced by the guard's drop.
    unsafe { hold() };
    IrqGuard {
        _not_send: PhantomData,
    }
}

/// Runs `f` with interrupts masked
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = disable();
    f()
}

/// Returns true while any masked section is active
pub fn are_masked() -> bool {
    DEPTH.load(Ordering::Acquire) != 0
}

/// Current nesting depth, mostly useful for diagnostics and tests
pub fn depth() -> usize {
    DEPTH.load(Ordering::Acquire)
}

/// Captures the calling flow's masking state before it is switched out
pub fn current_section() -> Section {
    Section {
        depth: DEPTH.load(Ordering::Acquire),
        were_enabled: WERE_ENABLED.load(Ordering::Acquire),
    }
}

/// Installs the masking state of the flow about to be switched in.
///
/// Interrupts stay masked throughout; the new flow unmasks them, if it
/// entered its outermost section with them enabled, when it leaves that
/// section.
///
/// # Safety
/// Must run inside a masked section, right before control moves to the
/// flow `section` belongs to. `section` must hold at least one level.
pub unsafe fn switch_section(section: Section) {
    debug_assert!(DEPTH.load(Ordering::Acquire) != 0, "switching with interrupts unmasked");
    debug_assert!(section.depth != 0, "switching into an unmasked flow");
    WERE_ENABLED.store(section.were_enabled, Ordering::Release);
    DEPTH.store(section.depth, Ordering::Release);
}

/// Parks the core until the next interrupt arrives.
///
/// Hosted builds have no interrupts to wait for and only hint a spin.
pub fn wait_for_interrupt() {
    backend::halt()
}

/// Enters one level of masking without a guard.
///
/// # Safety
/// Must be balanced by exactly one [`release`], possibly executed by another
/// flow of control (a task dispatched while the section was held).
pub unsafe fn hold() {
    if DEPTH.load(Ordering::Acquire) == 0 {
        WERE_ENABLED.store(backend::save_and_mask(), Ordering::Release);
    }
    DEPTH.fetch_add(1, Ordering::AcqRel);
}

/// Leaves one level of masking entered by [`hold`] or [`disable`].
///
/// A task that starts running for the first time inherits the section its
/// dispatcher was holding and calls this once to leave it.
///
/// # Safety
/// The caller must own one level of the current section.
pub unsafe fn release() {
    let previous = DEPTH.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(previous != 0, "interrupt mask released more often than held");
    if previous == 1 && WERE_ENABLED.load(Ordering::Acquire) {
        backend::unmask();
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod backend {
    use x86_64::instructions::interrupts;

    pub fn save_and_mask() -> bool {
        let enabled = interrupts::are_enabled();
        interrupts::disable();
        enabled
    }

    pub fn unmask() {
        interrupts::enable();
    }

    pub fn halt() {
        x86_64::instructions::hlt();
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod backend {
    pub fn save_and_mask() -> bool {
        false
    }

    pub fn unmask() {}

    pub fn halt() {
        core::hint::spin_loop();
    }
}
