//! Context switch engine
//!
//! Three primitives freeze and thaw a flow of control on its own stack:
//!
//! * [`create_context`] writes a fresh [`Frame`] at the top of a stack block
//!   so that restoring it enters `entry(arg)`.
//! * [`save_context!`](crate::save_context) records the caller's registers
//!   into a frame that lives in the caller's own stack frame. It returns
//!   twice: first [`Saved::Suspended`] with a handle to the frame, later
//!   [`Saved::Resumed`] when some other flow restores that handle.
//! * [`restore_context`] loads a frame and jumps into it. It never returns.
//!
//! Register layouts are private to the per-architecture ports; the rest of
//! the kernel only ever holds a [`ContextHandle`].

use core::{
    fmt,
    mem::{align_of, size_of},
    ptr::{self, NonNull},
};

#[cfg(target_arch = "x86_64")]
#[path = "context_switch/x86_64.rs"]
mod port;

#[cfg(target_arch = "aarch64")]
#[path = "context_switch/aarch64.rs"]
mod port;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("no context switch port for this architecture");

pub use port::Frame;

#[doc(hidden)]
pub use port::__eos_context_save as __context_save;

/// Seal of a frame that may be restored exactly once
const SEALED: u64 = 0x4554_4358_5f53_4f45;
/// Seal of a frame that has already been restored
const CONSUMED: u64 = 0x4455_4d55_534e_4f43;
/// Seal of a frame whose task was destroyed
const RETIRED: u64 = 0x4445_5249_5445_5221;

/// Entry routine of a fresh context. It must never return.
pub type ContextEntry = extern "C" fn(arg: usize) -> !;

/// Outcome of [`save_context!`](crate::save_context)
pub enum Saved {
    /// First return: the caller is suspended and should file the handle
    Suspended(ContextHandle),
    /// Second return: the frame was just restored by someone else
    Resumed,
}

/// Opaque reference to a frozen frame.
///
/// Handles are not `Copy`: restoring one consumes it, and the frame's seal
/// catches raw reuse at runtime.
pub struct ContextHandle {
    frame: NonNull<Frame>,
}

// SAFETY: a handle is only ever restored on the one core the kernel runs on.
unsafe impl Send for ContextHandle {}

impl ContextHandle {
    /// Seals `frame` and wraps it.
    ///
    /// # Safety
    /// `frame` must point to a fully written frame that stays in place until
    /// the handle is restored or retired.
    #[doc(hidden)]
    pub unsafe fn seal(frame: *mut Frame) -> ContextHandle {
        ptr::addr_of_mut!((*frame).seal).write_volatile(SEALED);
        ContextHandle {
            // SAFETY: callers pass a reference or a pointer derived from one.
            frame: NonNull::new_unchecked(frame),
        }
    }

    /// Address of the frozen frame, the classic "saved stack pointer"
    pub fn addr(&self) -> usize {
        self.frame.as_ptr() as usize
    }

    /// The frozen register image
    pub fn frame(&self) -> &Frame {
        // SAFETY: the frame outlives the handle by the contract of `seal`.
        unsafe { self.frame.as_ref() }
    }

    /// Marks the frame as dead without resuming it.
    pub fn retire(self) {
        // SAFETY: see `frame`.
        unsafe { ptr::addr_of_mut!((*self.frame.as_ptr()).seal).write_volatile(RETIRED) }
    }

    fn is_sealed(&self) -> bool {
        // SAFETY: see `frame`.
        unsafe { ptr::addr_of!((*self.frame.as_ptr()).seal).read_volatile() == SEALED }
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("frame", &self.frame)
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

/// The stack block is too small to hold a fresh context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackTooSmall {
    pub provided: usize,
    pub required: usize,
}

/// Smallest block [`create_context`] accepts: the frame, its alignment slack
/// and one return-address/argument slot pair below it.
pub const fn required_stack_size() -> usize {
    size_of::<Frame>() + align_of::<Frame>() + 2 * size_of::<usize>()
}

/// Builds a fresh frame at the top of `stack`.
///
/// Restoring the handle calls `entry(arg)` on the remaining stack with
/// zeroed callee-saved registers and a null frame pointer. Should `entry`
/// ever return, the port traps.
///
/// # Safety
/// `stack` must stay allocated and otherwise unused for as long as the
/// context may run.
pub unsafe fn create_context(
    stack: &mut [u8],
    entry: ContextEntry,
    arg: usize,
) -> Result<ContextHandle, StackTooSmall> {
    let required = required_stack_size();
    if stack.len() < required {
        return Err(StackTooSmall {
            provided: stack.len(),
            required,
        });
    }

    let top = stack.as_mut_ptr() as usize + stack.len();
    let frame_addr = (top - size_of::<Frame>()) & !(align_of::<Frame>() - 1);
    let frame = frame_addr as *mut Frame;

    // The stack grows down from just below the frame.
    frame.write(Frame::fresh(frame_addr, entry as usize, arg));
    Ok(ContextHandle::seal(frame))
}

/// Jumps into the frame named by `handle`.
///
/// For a saved frame execution continues as the [`Saved::Resumed`] return
/// of the matching `save_context!`; for a fresh one it enters the entry
/// routine. Restoring a retired or already consumed frame panics.
///
/// # Safety
/// The caller gives up its own flow of control: nothing after this call
/// runs, and no lock guard held on the current stack is ever released.
pub unsafe fn restore_context(handle: ContextHandle) -> ! {
    let frame = handle.frame.as_ptr();
    let seal = ptr::addr_of!((*frame).seal).read_volatile();
    if seal != SEALED {
        panic!(
            "restoring stale context at {:p} (seal {:#018x})",
            frame, seal
        );
    }
    ptr::addr_of_mut!((*frame).seal).write_volatile(CONSUMED);
    port::__eos_context_restore(frame)
}

/// Freezes the caller into `$frame` and evaluates to a [`Saved`].
///
/// `$frame` must be a local of the calling function, and that function must
/// not return between the `Suspended` return and the moment the handle is
/// restored or retired. This is a macro so that no intermediate function
/// frame sits between the frozen frame and its caller.
///
/// Must be used inside `unsafe`.
///
/// [`Saved`]: crate::context_switch::Saved
#[macro_export]
macro_rules! save_context {
    ($frame:expr) => {{
        let frame: *mut $crate::context_switch::Frame = &mut $frame;
        match $crate::context_switch::__context_save(frame) {
            0 => $crate::context_switch::Saved::Resumed,
            _ => $crate::context_switch::Saved::Suspended(
                $crate::context_switch::ContextHandle::seal(frame),
            ),
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    extern "C" fn never(_: usize) -> ! {
        unreachable!()
    }

    #[test]
    fn fresh_frame_sits_at_the_top_of_the_block() {
        let mut stack = vec![0u8; 4096];
        let range = stack.as_ptr_range();
        let handle = unsafe { create_context(&mut stack, never, 42) }.unwrap();

        let end = range.end as usize;
        assert!(handle.addr() >= range.start as usize);
        assert!(handle.addr() + size_of::<Frame>() <= end);
        assert_eq!(handle.addr() % 16, 0);
        assert_eq!(handle.frame().stack_pointer(), handle.addr());
        assert!(handle.is_sealed());

        handle.retire();
    }

    #[test]
    fn small_block_is_rejected() {
        let mut stack = vec![0u8; required_stack_size() - 1];
        let err = unsafe { create_context(&mut stack, never, 0) }.unwrap_err();
        assert_eq!(err.required, required_stack_size());
        assert_eq!(err.provided, required_stack_size() - 1);
    }

    #[test]
    fn retired_handle_is_no_longer_sealed() {
        let mut stack = vec![0u8; 4096];
        let handle = unsafe { create_context(&mut stack, never, 0) }.unwrap();
        let addr = handle.addr() as *mut Frame;
        handle.retire();
        let seal = unsafe { ptr::addr_of!((*addr).seal).read_volatile() };
        assert_eq!(seal, RETIRED);
    }

    #[test]
    fn frame_dump_names_the_program_counter() {
        let mut stack = vec![0u8; 4096];
        let handle = unsafe { create_context(&mut stack, never, 7) }.unwrap();
        let dump = alloc::format!("{}", handle.frame());
        assert!(dump.contains(port::PC_NAME));
        handle.retire();
    }
}
