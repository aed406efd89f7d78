//! Thread-backed transport: N worker threads in one process stand in for
//! N ranks.  Windows are aligned heap allocations registered in a shared
//! domain; get/put are raw copies, atomics are real atomics, flush is a
//! fence.  This backend is what the test suite runs on.
///
/// Copyright (c) 2020, Institute for Defense Analyses
/// 4850 Mark Center Drive, Alexandria, VA 22311-1882; 703-845-2500
///
/// All rights reserved.
///
/// This file is part of Portage, a PGAS tasking runtime for rust.  For
/// licence information see the LICENSE file in the top level dirctory
/// of the distribution.
use crate::err::fatal;
use crate::options::Options;
use crate::rma::{Transport, Window};
use lazy_static::lazy_static;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};

/// Window allocations are page-aligned so any element alignment within a
/// window is preserved by offset arithmetic.
const WINDOW_ALIGN: usize = 4096;

#[derive(Debug, Default)]
struct WinGroup {
    bases: Vec<usize>,
    size: usize,
    registered: usize,
}

/// Shared state for one set of thread-ranks.  Every rank thread holds the
/// same `Arc<LocalDomain>` and registers itself at init.
#[derive(Debug)]
pub struct LocalDomain {
    n: usize,
    barrier: Barrier,
    windows: Mutex<Vec<WinGroup>>,
    bcast: Mutex<Vec<u8>>,
}

impl LocalDomain {
    /// Create a domain for `n` ranks
    pub fn new(n: usize) -> LocalDomain {
        assert!(n >= 1, "a domain needs at least one rank");
        LocalDomain {
            n,
            barrier: Barrier::new(n),
            windows: Mutex::new(Vec::new()),
            bcast: Mutex::new(Vec::new()),
        }
    }

    /// Number of ranks in the domain
    pub fn n_ranks(&self) -> usize {
        self.n
    }
}

/// Per-rank view of a [`LocalDomain`]
#[derive(Debug)]
pub(crate) struct LocalTransport {
    domain: Arc<LocalDomain>,
    rank: usize,
    next_win: Cell<usize>,
    // buffers this rank owns, freed at destroy_window
    owned: RefCell<HashMap<usize, (usize, Layout)>>,
    // per-window remote base snapshot, taken after the creation barrier
    bases: RefCell<HashMap<usize, Vec<usize>>>,
}

impl LocalTransport {
    pub(crate) fn new(domain: Arc<LocalDomain>, rank: usize) -> crate::Result<LocalTransport> {
        if rank >= domain.n {
            return Err(crate::err::Error::InvalidRank);
        }
        Ok(LocalTransport {
            domain,
            rank,
            next_win: Cell::new(0),
            owned: RefCell::new(HashMap::new()),
            bases: RefCell::new(HashMap::new()),
        })
    }

    fn remote_addr(&self, win: &Window, rank: usize, off: usize) -> usize {
        debug_assert!(off < win.size);
        if rank == self.rank {
            return win.base as usize + off;
        }
        let bases = self.bases.borrow();
        let group = match bases.get(&win.id) {
            Some(g) => g,
            None => fatal!("window {} not registered on rank {}", win.id, self.rank),
        };
        group[rank] + off
    }

    fn atomic_u32(&self, win: &Window, rank: usize, off: usize) -> &AtomicU32 {
        let addr = self.remote_addr(win, rank, off);
        debug_assert_eq!(addr % 4, 0);
        // SAFETY: addr is inside a live registered window and 4-aligned;
        // all concurrent access to this word goes through atomics
        unsafe { &*(addr as *const AtomicU32) }
    }

    fn atomic_u64(&self, win: &Window, rank: usize, off: usize) -> &AtomicU64 {
        let addr = self.remote_addr(win, rank, off);
        debug_assert_eq!(addr % 8, 0);
        // SAFETY: as atomic_u32
        unsafe { &*(addr as *const AtomicU64) }
    }
}

impl Transport for LocalTransport {
    fn my_rank(&self) -> usize {
        self.rank
    }

    fn n_ranks(&self) -> usize {
        self.domain.n
    }

    fn shared_address_space(&self) -> bool {
        true
    }

    fn create_window(&self, size: usize) -> crate::Result<Window> {
        let id = self.next_win.get();
        self.next_win.set(id + 1);

        let layout = Layout::from_size_align(size.max(1), WINDOW_ALIGN)
            .map_err(|_| crate::err::Error::WindowAlignment)?;
        // SAFETY: layout has non-zero size; the buffer is freed with the
        // same layout in destroy_window
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            fatal!("out of memory allocating a {} byte window", size);
        }
        self.owned.borrow_mut().insert(id, (ptr as usize, layout));

        {
            let mut wins = self.domain.windows.lock().unwrap();
            if wins.len() <= id {
                wins.resize_with(id + 1, WinGroup::default);
            }
            let group = &mut wins[id];
            if group.registered == 0 {
                group.bases = vec![0; self.domain.n];
                group.size = size;
            } else if group.size != size {
                fatal!("collective window {} created with mismatched sizes", id);
            }
            group.bases[self.rank] = ptr as usize;
            group.registered += 1;
        }
        self.domain.barrier.wait();
        // snapshot remote bases now that every rank has registered
        let snapshot = self.domain.windows.lock().unwrap()[id].bases.clone();
        self.bases.borrow_mut().insert(id, snapshot);
        self.domain.barrier.wait();

        Ok(Window {
            id,
            base: ptr,
            size,
        })
    }

    fn destroy_window(&self, win: &Window) {
        // nobody may touch the window once any rank passes this barrier
        self.domain.barrier.wait();
        self.bases.borrow_mut().remove(&win.id);
        if let Some((ptr, layout)) = self.owned.borrow_mut().remove(&win.id) {
            // SAFETY: same pointer and layout as the create_window alloc
            unsafe { dealloc(ptr as *mut u8, layout) };
        }
        self.domain.barrier.wait();
    }

    fn get(&self, win: &Window, rank: usize, off: usize, dst: *mut u8, len: usize) {
        if len == 0 {
            return;
        }
        debug_assert!(off + len <= win.size);
        let src = self.remote_addr(win, rank, off);
        fence(Ordering::SeqCst);
        // SAFETY: src names len live bytes of the target rank's window;
        // exclusivity of the range is the caller's protocol obligation
        unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst, len) };
    }

    fn get_nb(&self, win: &Window, rank: usize, off: usize, dst: *mut u8, len: usize) {
        self.get(win, rank, off, dst, len);
    }

    fn put(&self, win: &Window, rank: usize, off: usize, src: *const u8, len: usize) {
        self.put_nb(win, rank, off, src, len);
        fence(Ordering::SeqCst);
    }

    fn put_nb(&self, win: &Window, rank: usize, off: usize, src: *const u8, len: usize) {
        if len == 0 {
            return;
        }
        debug_assert!(off + len <= win.size);
        let dst = self.remote_addr(win, rank, off);
        // SAFETY: as get
        unsafe { std::ptr::copy_nonoverlapping(src, dst as *mut u8, len) };
    }

    fn flush(&self, _win: &Window, _rank: usize) {
        fence(Ordering::SeqCst);
    }

    fn flush_all(&self, _win: &Window) {
        fence(Ordering::SeqCst);
    }

    fn atomic_load_u32(&self, win: &Window, rank: usize, off: usize) -> u32 {
        self.atomic_u32(win, rank, off).load(Ordering::SeqCst)
    }

    fn atomic_store_u32(&self, win: &Window, rank: usize, off: usize, v: u32) {
        self.atomic_u32(win, rank, off).store(v, Ordering::SeqCst)
    }

    fn atomic_load_u64(&self, win: &Window, rank: usize, off: usize) -> u64 {
        self.atomic_u64(win, rank, off).load(Ordering::SeqCst)
    }

    fn atomic_store_u64(&self, win: &Window, rank: usize, off: usize, v: u64) {
        self.atomic_u64(win, rank, off).store(v, Ordering::SeqCst)
    }

    fn faa_u32(&self, win: &Window, rank: usize, off: usize, v: u32) -> u32 {
        self.atomic_u32(win, rank, off).fetch_add(v, Ordering::SeqCst)
    }

    fn faa_u64(&self, win: &Window, rank: usize, off: usize, v: u64) -> u64 {
        self.atomic_u64(win, rank, off).fetch_add(v, Ordering::SeqCst)
    }

    fn cas_u64(&self, win: &Window, rank: usize, off: usize, expected: u64, desired: u64) -> u64 {
        match self.atomic_u64(win, rank, off).compare_exchange(
            expected,
            desired,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(prev) => prev,
            Err(prev) => prev,
        }
    }

    fn barrier(&self) {
        self.domain.barrier.wait();
    }

    fn broadcast(&self, root: usize, buf: &mut [u8]) {
        if root == self.rank {
            let mut slot = self.domain.bcast.lock().unwrap();
            slot.clear();
            slot.extend_from_slice(buf);
        }
        self.domain.barrier.wait();
        if root != self.rank {
            let slot = self.domain.bcast.lock().unwrap();
            buf.copy_from_slice(&slot);
        }
        self.domain.barrier.wait();
    }

    fn teardown(&self) {
        // the domain is reference-counted; the last Arc drop releases it
    }
}

lazy_static! {
    // Concurrently running SPMD tests would each spawn a full rank set;
    // one group at a time keeps memory and thread counts bounded.
    static ref RUN_LOCK: Mutex<()> = Mutex::new(());
}

/// Spawn `n` rank threads, run `f(rank)` on each between `init` and
/// `fini`, and return the per-rank results in rank order.
///
/// Concurrent callers (e.g. the test harness) are serialized through a
/// global lock.  A panicking rank is re-raised on the caller's thread.
pub fn run_spmd<T, F>(n: usize, opts: Options, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize) -> T + Send + Sync + 'static,
{
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let domain = Arc::new(LocalDomain::new(n));
    let f = Arc::new(f);
    let handles: Vec<_> = (0..n)
        .map(|rank| {
            let domain = Arc::clone(&domain);
            let f = Arc::clone(&f);
            let opts = opts.clone();
            std::thread::Builder::new()
                .name(format!("rank{}", rank))
                .stack_size(8 << 20)
                .spawn(move || {
                    crate::init_with_options(
                        crate::ProcessGroup::Local { domain, rank },
                        opts,
                    )
                    .expect("init failed");
                    let out = f(rank);
                    crate::fini();
                    out
                })
                .expect("failed to spawn rank thread")
        })
        .collect();
    handles
        .into_iter()
        .map(|h| match h.join() {
            Ok(v) => v,
            Err(e) => std::panic::resume_unwind(e),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_rma_and_atomics() {
        let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let domain = Arc::new(LocalDomain::new(2));
        let mk = |rank: usize, d: &Arc<LocalDomain>| LocalTransport::new(Arc::clone(d), rank);
        let d0 = Arc::clone(&domain);
        let d1 = Arc::clone(&domain);
        let t0 = std::thread::spawn(move || {
            let t = mk(0, &d0).unwrap();
            let w = t.create_window(4096).unwrap();
            // rank 1 adds to our counter at offset 0
            t.barrier();
            t.barrier();
            let v = t.atomic_load_u64(&w, 0, 0);
            t.destroy_window(&w);
            v
        });
        let t1 = std::thread::spawn(move || {
            let t = mk(1, &d1).unwrap();
            let w = t.create_window(4096).unwrap();
            t.barrier();
            let prev = t.faa_u64(&w, 0, 0, 41);
            assert_eq!(prev, 0);
            t.faa_u64(&w, 0, 0, 1);
            t.barrier();
            t.destroy_window(&w);
            0u64
        });
        assert_eq!(t0.join().unwrap(), 42);
        t1.join().unwrap();
    }

    #[test]
    fn broadcast_reaches_all_ranks() {
        let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let domain = Arc::new(LocalDomain::new(3));
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let d = Arc::clone(&domain);
                std::thread::spawn(move || {
                    let t = LocalTransport::new(d, rank).unwrap();
                    let mut buf = if rank == 1 { [7u8, 8, 9] } else { [0u8; 3] };
                    t.broadcast(1, &mut buf);
                    buf
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), [7, 8, 9]);
        }
    }
}
