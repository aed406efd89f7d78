//! Low-level context primitives: carve a continuation frame on the
//! current stack and call into it, resume a saved frame, and switch
//! stacks outright.
//!
//! A saved frame is a plain byte range on the callstack whose first field
//! links to the parent frame, so `parent - cf` is the size of the image a
//! thief must copy.  Frames are position-dependent: the image holds
//! absolute pointers into itself, which is why steals either land at the
//! same virtual address or go through the relocation fixup in the
//! scheduler.
///
/// Copyright (c) 2020, Institute for Defense Analyses
/// 4850 Mark Center Drive, Alexandria, VA 22311-1882; 703-845-2500
///
/// All rights reserved.
///
/// This file is part of Portage, a PGAS tasking runtime for rust.  For
/// licence information see the LICENSE file in the top level dirctory
/// of the distribution.
use std::ffi::c_void;

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub(crate) use x86_64::{jump_to_stack, resume, save_context_with_call, ContextFrame};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub(crate) use aarch64::{jump_to_stack, resume, save_context_with_call, ContextFrame};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("portage supports x86_64 and aarch64 only");

/// Body run on the child side of a saved continuation.  Receives the new
/// frame and the two opaque words passed to `save_context_with_call`.
/// Returning normally resumes the saved continuation in place.
pub(crate) type TrampFn = unsafe extern "C" fn(*mut ContextFrame, *mut c_void, *mut c_void);

/// Body run after a raw stack switch; never returns.
pub(crate) type JumpFn = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void) -> !;

impl ContextFrame {
    /// Byte size of the frame image, up to the parent link
    pub(crate) fn image_size(cf: *const ContextFrame) -> usize {
        // SAFETY: caller guarantees cf points at a live frame
        let parent = unsafe { (*cf).parent } as usize;
        debug_assert!(parent > cf as usize);
        parent - cf as usize
    }
}

/// Enter a closure on a fresh stack whose usable range ends at `bottom`.
/// The closure pointer must stay valid until the closure has copied what
/// it needs; it never returns through here.
pub(crate) unsafe fn call_on_stack(bottom: usize, f: JumpFn, a0: *mut c_void) -> ! {
    unsafe { jump_to_stack(bottom as *mut u8, f, a0, std::ptr::null_mut(), std::ptr::null_mut()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::ptr;

    thread_local! {
        static ORDER: Cell<u32> = const { Cell::new(0) };
    }

    unsafe extern "C" fn fallthrough_body(
        cf: *mut ContextFrame,
        _a0: *mut c_void,
        _a1: *mut c_void,
    ) {
        assert!(ContextFrame::image_size(cf) > 0);
        ORDER.with(|c| {
            assert_eq!(c.get(), 1);
            c.set(2);
        });
        // returning resumes the saved context
    }

    #[test]
    fn save_then_fall_through_returns() {
        ORDER.with(|c| c.set(1));
        // use a dummy parent above the current stack position
        let mut dummy_parent = [0u8; 64];
        let parent = dummy_parent.as_mut_ptr() as *mut ContextFrame;
        unsafe {
            save_context_with_call(parent, fallthrough_body, ptr::null_mut(), ptr::null_mut());
        }
        ORDER.with(|c| assert_eq!(c.get(), 2));
    }

    unsafe extern "C" fn resume_body(cf: *mut ContextFrame, a0: *mut c_void, _a1: *mut c_void) {
        let cf_slot = a0 as *mut *mut ContextFrame;
        unsafe { *cf_slot = cf };
        ORDER.with(|c| {
            assert_eq!(c.get(), 1);
            c.set(2);
        });
        // explicitly resume instead of falling through
        unsafe { resume(cf) }
    }

    #[test]
    fn save_then_explicit_resume_returns() {
        ORDER.with(|c| c.set(1));
        let mut dummy_parent = [0u8; 64];
        let parent = dummy_parent.as_mut_ptr() as *mut ContextFrame;
        let mut cf: *mut ContextFrame = ptr::null_mut();
        unsafe {
            save_context_with_call(
                parent,
                resume_body,
                &mut cf as *mut _ as *mut c_void,
                ptr::null_mut(),
            );
        }
        assert!(!cf.is_null());
        ORDER.with(|c| assert_eq!(c.get(), 2));
    }
}
