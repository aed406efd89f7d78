//! OpenSHMEM transport: symmetric windows on the shmem heap, one-sided
//! get/put and AMOs through shmem-sys.
//!
//! Symmetric allocation means a window has the same virtual address on
//! every PE (with address randomization disabled), which is exactly the
//! positional landing requirement for stolen frames.
///
/// Copyright (c) 2020, Institute for Defense Analyses
/// 4850 Mark Center Drive, Alexandria, VA 22311-1882; 703-845-2500
///
/// All rights reserved.
///
/// This file is part of Portage, a PGAS tasking runtime for rust.  For
/// licence information see the LICENSE file in the top level dirctory
/// of the distribution.
use crate::err::Error::NewAfterDrop;
use crate::rma::{Transport, Window};
use lazy_static::lazy_static;
use std::cell::Cell;
use std::ffi::c_void;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

static SHMEM_CREATED: AtomicBool = AtomicBool::new(false);
// count of transports so we only finalize after the last teardown
lazy_static! {
    static ref SHMEM_COUNTER: Mutex<i32> = Mutex::new(0);
}

/// The OpenSHMEM-backed transport.  One instance per process; `new()`
/// may be called again only while a previous instance is still live
/// (shmem_init cannot be re-entered after shmem_finalize).
#[derive(Debug)]
pub(crate) struct ShmemTransport {
    my_pe: usize,
    n_pes: usize,
    // broadcast scratch, symmetric
    scratch: *mut u8,
    scratch_size: usize,
    next_win: Cell<usize>,
}

const SCRATCH_SIZE: usize = 4096;

impl ShmemTransport {
    pub(crate) fn new() -> crate::Result<ShmemTransport> {
        let mut num = SHMEM_COUNTER.lock().unwrap();
        let first =
            SHMEM_CREATED.compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed);
        if first.is_ok() {
            // SAFETY: call to shmem library with no arguments
            unsafe { shmem_sys::shmem_init() };
        } else if *num == 0 {
            return Err(NewAfterDrop);
        }
        *num += 1;
        // SAFETY: calls to shmem library with no arguments
        let (my_pe, n_pes) = unsafe {
            (
                shmem_sys::shmem_my_pe() as usize,
                shmem_sys::shmem_n_pes() as usize,
            )
        };
        // SAFETY: symmetric allocation of a fixed-size scratch buffer,
        // zeroed before first use, freed in teardown
        let scratch = unsafe {
            let p = shmem_sys::shmalloc(SCRATCH_SIZE as u64) as *mut u8;
            std::ptr::write_bytes(p, 0, SCRATCH_SIZE);
            shmem_sys::shmem_barrier_all();
            p
        };
        Ok(ShmemTransport {
            my_pe,
            n_pes,
            scratch,
            scratch_size: SCRATCH_SIZE,
            next_win: Cell::new(0),
        })
    }

    fn sym_addr(&self, win: &Window, off: usize) -> *mut u8 {
        debug_assert!(off < win.size);
        (win.base as usize + off) as *mut u8
    }
}

impl Transport for ShmemTransport {
    fn my_rank(&self) -> usize {
        self.my_pe
    }

    fn n_ranks(&self) -> usize {
        self.n_pes
    }

    fn shared_address_space(&self) -> bool {
        false
    }

    fn create_window(&self, size: usize) -> crate::Result<Window> {
        let id = self.next_win.get();
        self.next_win.set(id + 1);
        // SAFETY:
        //  - shmalloc is collective over all PEs and returns symmetric
        //    memory of the requested size
        //  - the memory is zeroed before the barrier releases any PE
        let ptr = unsafe {
            let p = shmem_sys::shmalloc(size.max(1) as u64) as *mut u8;
            std::ptr::write_bytes(p, 0, size);
            shmem_sys::shmem_barrier_all();
            p
        };
        if ptr.is_null() {
            return Err(crate::err::Error::BoundsExceeded);
        }
        Ok(Window {
            id,
            base: ptr,
            size,
        })
    }

    fn destroy_window(&self, win: &Window) {
        // SAFETY: collective free of a prior shmalloc
        unsafe {
            shmem_sys::shmem_barrier_all();
            shmem_sys::shfree(win.base as *mut c_void);
        }
    }

    fn get(&self, win: &Window, rank: usize, off: usize, dst: *mut u8, len: usize) {
        if len == 0 {
            return;
        }
        // SAFETY: call to shmem with a symmetric source and checked length
        unsafe {
            shmem_sys::shmem_getmem(
                dst as *mut c_void,
                self.sym_addr(win, off) as *const c_void,
                len as u64,
                rank as c_int,
            )
        };
    }

    fn get_nb(&self, win: &Window, rank: usize, off: usize, dst: *mut u8, len: usize) {
        if len == 0 {
            return;
        }
        // SAFETY: as get; completion requires flush
        unsafe {
            shmem_sys::shmem_getmem_nbi(
                dst as *mut c_void,
                self.sym_addr(win, off) as *const c_void,
                len as u64,
                rank as c_int,
            )
        };
    }

    fn put(&self, win: &Window, rank: usize, off: usize, src: *const u8, len: usize) {
        if len == 0 {
            return;
        }
        // SAFETY: call to shmem with a symmetric destination and checked
        // length; shmem_putmem returns after local completion, quiet
        // makes it remotely complete
        unsafe {
            shmem_sys::shmem_putmem(
                self.sym_addr(win, off) as *mut c_void,
                src as *const c_void,
                len as u64,
                rank as c_int,
            );
            shmem_sys::shmem_quiet();
        };
    }

    fn put_nb(&self, win: &Window, rank: usize, off: usize, src: *const u8, len: usize) {
        if len == 0 {
            return;
        }
        // SAFETY: as put; completion requires flush
        unsafe {
            shmem_sys::shmem_putmem_nbi(
                self.sym_addr(win, off) as *mut c_void,
                src as *const c_void,
                len as u64,
                rank as c_int,
            )
        };
    }

    fn flush(&self, _win: &Window, _rank: usize) {
        // SAFETY: call to shmem library with no arguments
        unsafe { shmem_sys::shmem_quiet() };
    }

    fn flush_all(&self, _win: &Window) {
        // SAFETY: call to shmem library with no arguments
        unsafe { shmem_sys::shmem_quiet() };
    }

    fn atomic_load_u32(&self, win: &Window, rank: usize, off: usize) -> u32 {
        // SAFETY: AMO on a symmetric 4-aligned address
        unsafe {
            shmem_sys::shmem_uint32_atomic_fetch(self.sym_addr(win, off) as *const u32, rank as c_int)
        }
    }

    fn atomic_store_u32(&self, win: &Window, rank: usize, off: usize, v: u32) {
        // SAFETY: AMO on a symmetric 4-aligned address
        unsafe {
            shmem_sys::shmem_uint32_atomic_set(self.sym_addr(win, off) as *mut u32, v, rank as c_int);
            shmem_sys::shmem_quiet();
        }
    }

    fn atomic_load_u64(&self, win: &Window, rank: usize, off: usize) -> u64 {
        // SAFETY: AMO on a symmetric 8-aligned address
        unsafe {
            shmem_sys::shmem_uint64_atomic_fetch(self.sym_addr(win, off) as *const u64, rank as c_int)
        }
    }

    fn atomic_store_u64(&self, win: &Window, rank: usize, off: usize, v: u64) {
        // SAFETY: AMO on a symmetric 8-aligned address
        unsafe {
            shmem_sys::shmem_uint64_atomic_set(self.sym_addr(win, off) as *mut u64, v, rank as c_int);
            shmem_sys::shmem_quiet();
        }
    }

    fn faa_u32(&self, win: &Window, rank: usize, off: usize, v: u32) -> u32 {
        // SAFETY: AMO on a symmetric 4-aligned address
        unsafe {
            shmem_sys::shmem_uint32_atomic_fetch_add(
                self.sym_addr(win, off) as *mut u32,
                v,
                rank as c_int,
            )
        }
    }

    fn faa_u64(&self, win: &Window, rank: usize, off: usize, v: u64) -> u64 {
        // SAFETY: AMO on a symmetric 8-aligned address
        unsafe {
            shmem_sys::shmem_uint64_atomic_fetch_add(
                self.sym_addr(win, off) as *mut u64,
                v,
                rank as c_int,
            )
        }
    }

    fn cas_u64(&self, win: &Window, rank: usize, off: usize, expected: u64, desired: u64) -> u64 {
        // SAFETY: AMO on a symmetric 8-aligned address
        unsafe {
            shmem_sys::shmem_uint64_atomic_compare_swap(
                self.sym_addr(win, off) as *mut u64,
                expected,
                desired,
                rank as c_int,
            )
        }
    }

    fn barrier(&self) {
        // SAFETY: call to shmem library with no arguments
        unsafe { shmem_sys::shmem_barrier_all() };
    }

    fn broadcast(&self, root: usize, buf: &mut [u8]) {
        assert!(buf.len() <= self.scratch_size, "broadcast exceeds scratch");
        // SAFETY: scratch is symmetric; the barriers order the root's
        // fill against everyone's read and the reads against reuse
        unsafe {
            if root == self.my_pe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), self.scratch, buf.len());
            }
            shmem_sys::shmem_barrier_all();
            if root != self.my_pe {
                shmem_sys::shmem_getmem(
                    buf.as_mut_ptr() as *mut c_void,
                    self.scratch as *const c_void,
                    buf.len() as u64,
                    root as c_int,
                );
            }
            shmem_sys::shmem_barrier_all();
        }
    }

    fn teardown(&self) {
        // SAFETY: collective free of the scratch, then conditional
        // finalize on the last instance
        unsafe {
            shmem_sys::shmem_barrier_all();
            shmem_sys::shfree(self.scratch as *mut c_void);
        }
        let mut num = SHMEM_COUNTER.lock().unwrap();
        *num -= 1;
        if *num == 0 {
            // SAFETY: call to shmem library with no arguments
            unsafe { shmem_sys::shmem_finalize() };
        }
    }
}
