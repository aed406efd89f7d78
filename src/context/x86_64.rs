//! x86_64 (System V) implementation of the context primitives
///
/// Copyright (c) 2020, Institute for Defense Analyses
/// 4850 Mark Center Drive, Alexandria, VA 22311-1882; 703-845-2500
///
/// All rights reserved.
///
/// This file is part of Portage, a PGAS tasking runtime for rust.  For
/// licence information see the LICENSE file in the top level dirctory
/// of the distribution.
use super::{JumpFn, TrampFn};
use std::arch::naked_asm;
use std::ffi::c_void;

/// A suspended continuation, laid out at the low end of its frame image.
///
/// Holds the callee-saved register state of the System V ABI plus the
/// resume PC and the link to the parent frame.  The image spans
/// `[cf, cf.parent)` on the callstack.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct ContextFrame {
    /// previous frame top; also the exclusive end of this frame's image
    pub(crate) parent: *mut ContextFrame, // 0x00
    pc: usize,                            // 0x08
    sp: usize,                            // 0x10
    rbp: usize,                           // 0x18
    rbx: usize,                           // 0x20
    r12: usize,                           // 0x28
    r13: usize,                           // 0x30
    r14: usize,                           // 0x38
    r15: usize,                           // 0x40
}

const _: () = assert!(std::mem::size_of::<ContextFrame>() == 72);

/// Carve a [`ContextFrame`] at the current stack position, then call
/// `f(cf, a0, a1)` on the same stack.  If `f` returns, the saved context
/// resumes in place and this function returns to its caller; `resume(cf)`
/// from anywhere has the same effect.
///
/// # Safety
/// `parent` must be the previous frame top (or a sentinel above the
/// current stack position); `f` must not unwind.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn save_context_with_call(
    _parent: *mut ContextFrame,
    _f: TrampFn,
    _a0: *mut c_void,
    _a1: *mut c_void,
) {
    // Entry: rsp % 16 == 8 (post-call), so rsp - 72 is 16-aligned and the
    // frame doubles as the alignment pad for the inner call.
    naked_asm!(
        "sub rsp, 72",
        "mov [rsp + 0x00], rdi", // parent link
        "lea rax, [rip + 2f]",
        "mov [rsp + 0x08], rax", // resume pc
        "lea rax, [rsp + 72]",
        "mov [rsp + 0x10], rax", // entry rsp, return address on top
        "mov [rsp + 0x18], rbp",
        "mov [rsp + 0x20], rbx",
        "mov [rsp + 0x28], r12",
        "mov [rsp + 0x30], r13",
        "mov [rsp + 0x38], r14",
        "mov [rsp + 0x40], r15",
        "mov rax, rsi", // f
        "mov rdi, rsp", // cf
        "mov rsi, rdx", // a0
        "mov rdx, rcx", // a1
        "call rax",
        // Resume point: reached by falling out of f (rsp already == cf)
        // or by resume(), which sets rsp = cf and jumps here.
        "2:",
        "mov r15, [rsp + 0x40]",
        "mov r14, [rsp + 0x38]",
        "mov r13, [rsp + 0x30]",
        "mov r12, [rsp + 0x28]",
        "mov rbx, [rsp + 0x20]",
        "mov rbp, [rsp + 0x18]",
        "mov rsp, [rsp + 0x10]",
        "ret",
    );
}

/// Re-enter a saved continuation.  Control continues as if the matching
/// `save_context_with_call` had returned.
///
/// # Safety
/// `cf` must be a frame image that is valid at its current address.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn resume(_cf: *mut ContextFrame) -> ! {
    naked_asm!(
        "mov rsp, rdi",
        "mov rax, [rdi + 0x08]",
        "jmp rax",
    );
}

/// Switch to a fresh stack ending at `sp` (rounded down to 16 bytes) and
/// call `f(a0, a1, a2)`.  `f` must never return.
///
/// # Safety
/// `sp` must have enough room below it for `f`'s execution; only the
/// three register arguments survive the switch.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn jump_to_stack(
    _sp: *mut u8,
    _f: JumpFn,
    _a0: *mut c_void,
    _a1: *mut c_void,
    _a2: *mut c_void,
) -> ! {
    naked_asm!(
        "and rdi, -16",
        "mov rsp, rdi",
        "mov rax, rsi",
        "mov rdi, rdx",
        "mov rsi, rcx",
        "mov rdx, r8",
        "call rax",
        "ud2",
    );
}
