//! Transport facade: one-sided RMA, atomics, and collectives over
//! registered windows.  All other components go through this module.
///
/// Copyright (c) 2020, Institute for Defense Analyses
/// 4850 Mark Center Drive, Alexandria, VA 22311-1882; 703-845-2500
///
/// All rights reserved.
///
/// This file is part of Portage, a PGAS tasking runtime for rust.  For
/// licence information see the LICENSE file in the top level dirctory
/// of the distribution.
use crate::gptr::Remotable;
use crate::runtime::Runtime;

pub mod local;
#[cfg(feature = "shmem")]
pub mod shmem;

/// A registered, byte-addressable region that exists with identical size
/// on every rank.  Created and destroyed collectively; zero-initialized.
#[derive(Debug)]
pub struct Window {
    pub(crate) id: usize,
    pub(crate) base: *mut u8,
    pub(crate) size: usize,
}

impl Window {
    /// Local base address of this rank's portion
    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    /// Window size (identical on every rank)
    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

/// The one-sided transport contract.  Backends: `local` (threads standing
/// in for ranks, the default) and `shmem` (OpenSHMEM, feature-gated).
///
/// Ordering contract: the atomic operations are sequentially consistent
/// with each other, and a `put` followed by `flush` on the same target is
/// visible to any atomic or `get` issued afterwards from any rank.
pub(crate) trait Transport {
    fn my_rank(&self) -> usize;
    fn n_ranks(&self) -> usize;
    /// true when all ranks share one address space (thread-backed)
    fn shared_address_space(&self) -> bool;

    /// Collective: create a zeroed window of `size` bytes on every rank
    fn create_window(&self, size: usize) -> crate::Result<Window>;
    /// Collective: release a window
    fn destroy_window(&self, win: &Window);

    fn get(&self, win: &Window, rank: usize, off: usize, dst: *mut u8, len: usize);
    fn get_nb(&self, win: &Window, rank: usize, off: usize, dst: *mut u8, len: usize);
    fn put(&self, win: &Window, rank: usize, off: usize, src: *const u8, len: usize);
    fn put_nb(&self, win: &Window, rank: usize, off: usize, src: *const u8, len: usize);
    /// Complete outstanding non-blocking operations against one target
    fn flush(&self, win: &Window, rank: usize);
    /// Complete outstanding non-blocking operations against all targets
    fn flush_all(&self, win: &Window);

    fn atomic_load_u32(&self, win: &Window, rank: usize, off: usize) -> u32;
    fn atomic_store_u32(&self, win: &Window, rank: usize, off: usize, v: u32);
    fn atomic_load_u64(&self, win: &Window, rank: usize, off: usize) -> u64;
    fn atomic_store_u64(&self, win: &Window, rank: usize, off: usize, v: u64);
    fn faa_u32(&self, win: &Window, rank: usize, off: usize, v: u32) -> u32;
    fn faa_u64(&self, win: &Window, rank: usize, off: usize, v: u64) -> u64;
    fn cas_u64(&self, win: &Window, rank: usize, off: usize, expected: u64, desired: u64) -> u64;

    /// Collective barrier over all ranks
    fn barrier(&self);
    /// Collective broadcast of a byte buffer from `root`
    fn broadcast(&self, root: usize, buf: &mut [u8]);

    /// Called by the last `fini()`; must not finalize a transport the
    /// runtime did not itself initialize
    fn teardown(&self);
}

// Typed helpers.  These are the only entry points the rest of the runtime
// uses for data movement, so the per-worker telemetry hangs here.

/// Blocking typed read of one value
pub(crate) fn get_value<T: Remotable>(rt: &Runtime, win: &Window, rank: usize, off: usize) -> T {
    let mut v = std::mem::MaybeUninit::<T>::uninit();
    rt.prof_rma_get(std::mem::size_of::<T>());
    // SAFETY: the transport fills all size_of::<T>() bytes before returning
    unsafe {
        rt.transport()
            .get(win, rank, off, v.as_mut_ptr() as *mut u8, std::mem::size_of::<T>());
        v.assume_init()
    }
}

/// Blocking typed write of one value (put + flush)
pub(crate) fn put_value<T: Remotable>(rt: &Runtime, win: &Window, rank: usize, off: usize, v: T) {
    rt.prof_rma_put(std::mem::size_of::<T>());
    // SAFETY: v lives across the blocking call
    rt.transport().put(
        win,
        rank,
        off,
        &v as *const T as *const u8,
        std::mem::size_of::<T>(),
    );
}

/// Fetch-and-add on a 32-bit counter, returning the previous value
pub(crate) fn faa_u32(rt: &Runtime, win: &Window, rank: usize, off: usize, v: u32) -> u32 {
    rt.prof_rma_faa();
    rt.transport().faa_u32(win, rank, off, v)
}

/// Fetch-and-add on a 64-bit counter, returning the previous value
pub(crate) fn faa_u64(rt: &Runtime, win: &Window, rank: usize, off: usize, v: u64) -> u64 {
    rt.prof_rma_faa();
    rt.transport().faa_u64(win, rank, off, v)
}

/// Compare-and-swap, returning the previous value
pub(crate) fn cas_u64(
    rt: &Runtime,
    win: &Window,
    rank: usize,
    off: usize,
    expected: u64,
    desired: u64,
) -> u64 {
    rt.prof_rma_cas();
    rt.transport().cas_u64(win, rank, off, expected, desired)
}

/// A non-blocking barrier handle, built over transport atomics: entering
/// bumps a rank-0 counter, the test polls it against `session * n_ranks`.
/// A worker that entered keeps running (and stealing) until every rank has
/// entered, which is how stragglers get drained.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IBarrier {
    session: u64,
}

impl IBarrier {
    /// Enter the barrier for collective session `session`
    pub(crate) fn enter(rt: &Runtime, session: u64) -> IBarrier {
        faa_u64(rt, rt.ctrl_win(), 0, rt.ctrl_off_ibarrier(), 1);
        IBarrier { session }
    }

    /// True once every rank of the session has entered
    pub(crate) fn test(&self, rt: &Runtime) -> bool {
        let count = rt
            .transport()
            .atomic_load_u64(rt.ctrl_win(), 0, rt.ctrl_off_ibarrier());
        count >= self.session * rt.n_ranks() as u64
    }
}
