//! x86_64 System V port

use core::fmt;

/// Frozen register image: the callee-saved registers, the resume point and
/// the flag/control registers the ABI requires to survive a call.
#[derive(Clone)]
#[repr(C, align(16))]
pub struct Frame {
    rbx: u64,
    rbp: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rsp: u64,
    rip: u64,
    rflags: u64,
    mxcsr: u32,
    fpu_cw: u32,
    pub(super) seal: u64,
}

pub(super) const PC_NAME: &str = "rip";

/// Only the always-one reserved bit; interrupts start masked and are opened
/// by the dispatcher's critical section when it unwinds.
const INITIAL_RFLAGS: u64 = 0x2;
const INITIAL_MXCSR: u32 = 0x1f80;
const INITIAL_FPU_CW: u32 = 0x037f;

impl Frame {
    /// All-zero frame, the storage `save_context!` writes into
    pub const EMPTY: Frame = Frame {
        rbx: 0,
        rbp: 0,
        r12: 0,
        r13: 0,
        r14: 0,
        r15: 0,
        rsp: 0,
        rip: 0,
        rflags: 0,
        mxcsr: 0,
        fpu_cw: 0,
        seal: 0,
    };

    /// Frame that enters the bootstrap stub, which calls `entry(arg)`.
    /// `r12` carries the entry point and `r13` the argument.
    pub(super) fn fresh(stack_pointer: usize, entry: usize, arg: usize) -> Frame {
        Frame {
            r12: entry as u64,
            r13: arg as u64,
            rsp: stack_pointer as u64,
            rip: __eos_context_bootstrap as usize as u64,
            rflags: INITIAL_RFLAGS,
            mxcsr: INITIAL_MXCSR,
            fpu_cw: INITIAL_FPU_CW,
            ..Frame::EMPTY
        }
    }

    /// Stack pointer the context resumes with
    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }

    /// Instruction the context resumes at
    pub fn program_counter(&self) -> usize {
        self.rip as usize
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "rbx    = {:#x}", self.rbx)?;
        writeln!(f, "rbp    = {:#x}", self.rbp)?;
        writeln!(f, "r12    = {:#x}", self.r12)?;
        writeln!(f, "r13    = {:#x}", self.r13)?;
        writeln!(f, "r14    = {:#x}", self.r14)?;
        writeln!(f, "r15    = {:#x}", self.r15)?;
        writeln!(f, "rsp    = {:#x}", self.rsp)?;
        writeln!(f, "rflags = {:#x}", self.rflags)?;
        writeln!(f, "mxcsr  = {:#x}", self.mxcsr)?;
        writeln!(f, "fpu_cw = {:#x}", self.fpu_cw & 0xffff)?;
        write!(f, "rip    = {:#x}", self.rip)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("rsp", &format_args!("{:#x}", self.rsp))
            .field("rip", &format_args!("{:#x}", self.rip))
            .finish_non_exhaustive()
    }
}

// Offsets below are baked into the assembly.
const _: () = {
    assert!(core::mem::offset_of!(Frame, rsp) == 0x30);
    assert!(core::mem::offset_of!(Frame, rip) == 0x38);
    assert!(core::mem::offset_of!(Frame, rflags) == 0x40);
    assert!(core::mem::offset_of!(Frame, mxcsr) == 0x48);
    assert!(core::mem::offset_of!(Frame, fpu_cw) == 0x4c);
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
    "    mov [rdi + 0x00], rbx",
    "    mov [rdi + 0x08], rbp",
    "    mov [rdi + 0x10], r12",
    "    mov [rdi + 0x18], r13",
    "    mov [rdi + 0x20], r14",
    "    mov [rdi + 0x28], r15",
    // The caller's stack pointer once this call has returned
    "    lea rax, [rsp + 8]",
    "    mov [rdi + 0x30], rax",
    "    mov rax, [rsp]",
    "    mov [rdi + 0x38], rax",
    "    pushfq",
    "    pop rax",
    "    mov [rdi + 0x40], rax",
    "    stmxcsr dword ptr [rdi + 0x48]",
    "    fnstcw word ptr [rdi + 0x4c]",
    "    mov rax, rdi",
    "    ret",
    "",
    ".p2align 4",
    ".globl __eos_context_restore",
    "__eos_context_restore:",
    "    mov rbx, [rdi + 0x00]",
    "    mov rbp, [rdi + 0x08]",
    "    mov r12, [rdi + 0x10]",
    "    mov r13, [rdi + 0x18]",
    "    mov r14, [rdi + 0x20]",
    "    mov r15, [rdi + 0x28]",
    "    ldmxcsr dword ptr [rdi + 0x48]",
    "    fldcw word ptr [rdi + 0x4c]",
    "    mov rsp, [rdi + 0x30]",
    "    push qword ptr [rdi + 0x40]",
    "    popfq",
    // Second return of the matching save
    "    xor eax, eax",
    "    jmp qword ptr [rdi + 0x38]",
    "",
    ".p2align 4",
    ".globl __eos_context_bootstrap",
    "__eos_context_bootstrap:",
    "    mov rdi, r13",
    "    call r12",
    "    ud2",
);
