//! x86_64 context switching
//!
//! Inline naked assembly, stable since Rust 1.88.

use std::arch::naked_asm;

/// Callee-saved register file per the System V AMD64 ABI, plus the
/// stack pointer and resume address.
///
/// Field order is load-bearing: the assembly below addresses this
/// struct by fixed offsets.
#[repr(C)]
pub struct SavedRegs {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl SavedRegs {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prepare a fresh context so that switching into it enters
/// `entry_fn(entry_arg)` on the given stack.
///
/// # Safety
///
/// `regs` must point to valid `SavedRegs` storage and `stack_top` must
/// be the high end of a mapped stack region.
pub unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // 16-byte alignment at the trampoline keeps the callee entry at
    // rsp % 16 == 8 after its `call`, as the ABI requires.
    let sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    regs.rsp = sp as u64;
    regs.rip = entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// First code a fresh coroutine executes: calls `entry_fn` (r12) with
/// `entry_arg` (r13). The entry function must never return; if it does,
/// `ud2` faults rather than running off the top of the stack.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2",);
}

/// Voluntary context switch: save the callee-saved file into `save`,
/// restore from `load`, and continue at its resume address.
///
/// # Safety
///
/// Both pointers must reference valid `SavedRegs`; `load` must describe
/// either a context produced by `init_context` or one previously saved
/// by this function. The caller is responsible for the thread-local
/// bookkeeping around the switch.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut SavedRegs, _load: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved registers into `save` (RDI).
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Restore from `load` (RSI).
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved context.
        "2:",
        "ret",
    );
}
