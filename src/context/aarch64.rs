//! aarch64 (AAPCS64) implementation of the context primitives
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
/// Callee-saved state per AAPCS64: x19-x28, fp, lr, and the low halves of
/// v8-v15.  The image spans `[cf, cf.parent)` on the callstack.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct ContextFrame {
    /// previous frame top; also the exclusive end of this frame's image
    pub(crate) parent: *mut ContextFrame, // 0x00
    pc: usize,                            // 0x08
    sp: usize,                            // 0x10
    fp: usize,                            // 0x18
    lr: usize,                            // 0x20
    x19: usize,                           // 0x28
    x20: usize,                           // 0x30
    x21: usize,                           // 0x38
    x22: usize,                           // 0x40
    x23: usize,                           // 0x48
    x24: usize,                           // 0x50
    x25: usize,                           // 0x58
    x26: usize,                           // 0x60
    x27: usize,                           // 0x68
    x28: usize,                           // 0x70
    d8: u64,                              // 0x78
    d9: u64,                              // 0x80
    d10: u64,                             // 0x88
    d11: u64,                             // 0x90
    d12: u64,                             // 0x98
    d13: u64,                             // 0xa0
    d14: u64,                             // 0xa8
    d15: u64,                             // 0xb0
    _pad: u64,                            // keep the frame 16-aligned
}

const _: () = assert!(std::mem::size_of::<ContextFrame>() == 192);

/// See the x86_64 twin; identical contract.
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
    naked_asm!(
        "sub sp, sp, #192",
        "mov x9, sp",
        "str x0, [x9, #0x00]", // parent link
        "adr x10, 2f",
        "str x10, [x9, #0x08]", // resume pc
        "add x10, x9, #192",
        "str x10, [x9, #0x10]", // entry sp
        "stp x29, x30, [x9, #0x18]",
        "stp x19, x20, [x9, #0x28]",
        "stp x21, x22, [x9, #0x38]",
        "stp x23, x24, [x9, #0x48]",
        "stp x25, x26, [x9, #0x58]",
        "stp x27, x28, [x9, #0x68]",
        "stp d8, d9, [x9, #0x78]",
        "stp d10, d11, [x9, #0x88]",
        "stp d12, d13, [x9, #0x98]",
        "stp d14, d15, [x9, #0xa8]",
        "mov x10, x1", // f
        "mov x0, x9",  // cf
        "mov x1, x2",  // a0
        "mov x2, x3",  // a1
        "blr x10",
        // Resume point: reached by falling out of f (sp already == cf)
        // or by resume(), which sets sp = cf and branches here.
        "2:",
        "mov x9, sp",
        "ldp x29, x30, [x9, #0x18]",
        "ldp x19, x20, [x9, #0x28]",
        "ldp x21, x22, [x9, #0x38]",
        "ldp x23, x24, [x9, #0x48]",
        "ldp x25, x26, [x9, #0x58]",
        "ldp x27, x28, [x9, #0x68]",
        "ldp d8, d9, [x9, #0x78]",
        "ldp d10, d11, [x9, #0x88]",
        "ldp d12, d13, [x9, #0x98]",
        "ldp d14, d15, [x9, #0xa8]",
        "ldr x10, [x9, #0x10]",
        "mov sp, x10",
        "ret",
    );
}

/// Re-enter a saved continuation.
///
/// # Safety
/// `cf` must be a frame image that is valid at its current address.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn resume(_cf: *mut ContextFrame) -> ! {
    naked_asm!(
        "mov sp, x0",
        "ldr x9, [x0, #0x08]",
        "br x9",
    );
}

/// Switch to a fresh stack ending at `sp` and call `f(a0, a1, a2)`.
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
        "and x9, x0, #0xfffffffffffffff0",
        "mov sp, x9",
        "mov x9, x1",
        "mov x0, x2",
        "mov x1, x3",
        "mov x2, x4",
        "blr x9",
        "brk #0x1",
    );
}
