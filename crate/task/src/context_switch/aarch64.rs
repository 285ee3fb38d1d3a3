//! AArch64 AAPCS64 port

use core::fmt;

/// Frozen register image: x19-x28, frame pointer, link register, stack
/// pointer, resume point, flags, FP control and the low halves of v8-v15.
#[derive(Clone)]
#[repr(C, align(16))]
pub struct Frame {
    x: [u64; 10],
    fp: u64,
    lr: u64,
    sp: u64,
    pc: u64,
    nzcv: u64,
    fpcr: u64,
    d: [u64; 8],
    pub(super) seal: u64,
}

pub(super) const PC_NAME: &str = "pc";

impl Frame {
    /// All-zero frame, the storage `save_context!` writes into
    pub const EMPTY: Frame = Frame {
        x: [0; 10],
        fp: 0,
        lr: 0,
        sp: 0,
        pc: 0,
        nzcv: 0,
        fpcr: 0,
        d: [0; 8],
        seal: 0,
    };

    /// Frame that enters the bootstrap stub, which calls `entry(arg)`.
    /// `x19` carries the entry point and `x20` the argument.
    pub(super) fn fresh(stack_pointer: usize, entry: usize, arg: usize) -> Frame {
        let mut frame = Frame {
            sp: stack_pointer as u64,
            pc: __eos_context_bootstrap as usize as u64,
            ..Frame::EMPTY
        };
        frame.x[0] = entry as u64;
        frame.x[1] = arg as u64;
        frame
    }

    /// Stack pointer the context resumes with
    pub fn stack_pointer(&self) -> usize {
        self.sp as usize
    }

    /// Instruction the context resumes at
    pub fn program_counter(&self) -> usize {
        self.pc as usize
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.x.iter().enumerate() {
            writeln!(f, "x{:<5} = {:#x}", 19 + i, value)?;
        }
        writeln!(f, "fp     = {:#x}", self.fp)?;
        writeln!(f, "lr     = {:#x}", self.lr)?;
        writeln!(f, "sp     = {:#x}", self.sp)?;
        writeln!(f, "nzcv   = {:#x}", self.nzcv)?;
        writeln!(f, "fpcr   = {:#x}", self.fpcr)?;
        write!(f, "pc     = {:#x}", self.pc)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sp", &format_args!("{:#x}", self.sp))
            .field("pc", &format_args!("{:#x}", self.pc))
            .finish_non_exhaustive()
    }
}

const _: () = {
    assert!(core::mem::offset_of!(Frame, fp) == 80);
    assert!(core::mem::offset_of!(Frame, sp) == 96);
    assert!(core::mem::offset_of!(Frame, nzcv) == 112);
    assert!(core::mem::offset_of!(Frame, d) == 128);
};

extern "C" {
    /// Returns the frame address, or 0 when resumed.
    pub fn __eos_context_save(frame: *mut Frame) -> usize;
    pub(super) fn __eos_context_restore(frame: *const Frame) -> !;
    fn __eos_context_bootstrap();
}

core::arch::global_asm!(
    ".text",
    ".p2align 4",
    ".globl __eos_context_save",
    "__eos_context_save:",
    "    stp x19, x20, [x0, #0]",
    "    stp x21, x22, [x0, #16]",
    "    stp x23, x24, [x0, #32]",
    "    stp x25, x26, [x0, #48]",
    "    stp x27, x28, [x0, #64]",
    "    stp x29, x30, [x0, #80]",
    "    mov x9, sp",
    // Resume at our own return address
    "    stp x9, x30, [x0, #96]",
    "    mrs x9, nzcv",
    "    mrs x10, fpcr",
    "    stp x9, x10, [x0, #112]",
    "    stp d8, d9, [x0, #128]",
    "    stp d10, d11, [x0, #144]",
    "    stp d12, d13, [x0, #160]",
    "    stp d14, d15, [x0, #176]",
    "    ret",
    "",
    ".p2align 4",
    ".globl __eos_context_restore",
    "__eos_context_restore:",
    "    ldp x19, x20, [x0, #0]",
    "    ldp x21, x22, [x0, #16]",
    "    ldp x23, x24, [x0, #32]",
    "    ldp x25, x26, [x0, #48]",
    "    ldp x27, x28, [x0, #64]",
    "    ldp x29, x30, [x0, #80]",
    "    ldp x9, x10, [x0, #96]",
    "    mov sp, x9",
    "    ldp x11, x12, [x0, #112]",
    "    msr nzcv, x11",
    "    msr fpcr, x12",
    "    ldp d8, d9, [x0, #128]",
    "    ldp d10, d11, [x0, #144]",
    "    ldp d12, d13, [x0, #160]",
    "    ldp d14, d15, [x0, #176]",
    // Second return of the matching save
    "    mov x0, #0",
    "    br x10",
    "",
    ".p2align 4",
    ".globl __eos_context_bootstrap",
    "__eos_context_bootstrap:",
    "    mov x0, x20",
    "    blr x19",
    "    brk #0x1",
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_frame_holds_the_initial_register_state() {
        let frame = Frame::fresh(0x8000, 0x1234, 99);
        assert_eq!(frame.x[..2], [0x1234, 99]);
        assert!(frame.x[2..].iter().all(|&x| x == 0));
        assert_eq!([frame.fp, frame.lr], [0, 0]);
        assert_eq!(frame.sp, 0x8000);
        assert_eq!(frame.pc, __eos_context_bootstrap as usize as u64);
        assert_eq!([frame.nzcv, frame.fpcr], [0, 0]);
        assert_eq!(frame.d, [0; 8]);
        assert_eq!(frame.seal, 0);
    }
}
