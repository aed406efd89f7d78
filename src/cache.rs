//! The coherence cache: a per-process directory of fixed-size blocks over
//! the collective heap windows of every rank, with checkout/checkin as
//! the unit of access and release/acquire fences giving release
//! consistency.
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
use crate::gptr::{GlobalPtr, Remotable, WinKind};
use crate::runtime::{self, CtrlSegment, Runtime};
use log::trace;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::mem::offset_of;

const OFF_RELEASED_EPOCH: usize = offset_of!(CtrlSegment, released_epoch);
const OFF_RELEASE_REQ: usize = offset_of!(CtrlSegment, release_requested);

/// Access mode of a checkout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// read-only view; blocks are fetched if absent
    Read,
    /// write-only view; the caller promises to write the entire range
    Write,
    /// read-write view; blocks are fetched if absent
    ReadWrite,
    /// no local view; the checkout is a pass-through of the pointer
    NoAccess,
}

impl Mode {
    fn fetches(self) -> bool {
        matches!(self, Mode::Read | Mode::ReadWrite)
    }
    fn writes(self) -> bool {
        matches!(self, Mode::Write | Mode::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Invalid,
    Fetching,
    Clean,
    Dirty,
}

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone)]
struct Slot {
    rank: u32,
    block: u64,
    state: BlockState,
    refs: u32,
    dirty_lo: u32,
    dirty_hi: u32,
    prev: u32,
    next: u32,
    in_lru: bool,
}

/// An opaque epoch token from a lazy release.  Carried to whichever rank
/// resumes the continuation; acquiring it forces the issuing rank's
/// release before any read-side traffic.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReleaseHandle {
    pub(crate) rank: usize,
    pub(crate) epoch: u64,
}

/// The per-process block directory
#[derive(Debug)]
pub(crate) struct Cache {
    block_size: usize,
    buf: usize,
    buf_layout: Layout,
    slots: Vec<Slot>,
    map: HashMap<(u32, u64), u32>,
    lru_head: u32,
    lru_tail: u32,
    free_slots: Vec<u32>,
    release_count: u64,
    dirty_since_release: bool,
    pins: usize,
    live_spans: usize,
}

impl Cache {
    pub(crate) fn new(block_size: usize, cache_size: usize) -> Cache {
        debug_assert!(block_size.is_power_of_two());
        let nblocks = (cache_size / block_size).max(1);
        let layout = Layout::from_size_align(nblocks * block_size, block_size)
            .expect("cache geometry overflow");
        // SAFETY: non-zero layout, released in Drop with the same layout
        let buf = unsafe { alloc_zeroed(layout) };
        if buf.is_null() {
            fatal!("out of memory allocating a {} byte cache", nblocks * block_size);
        }
        Cache {
            block_size,
            buf: buf as usize,
            buf_layout: layout,
            slots: Vec::with_capacity(nblocks),
            map: HashMap::new(),
            lru_head: NIL,
            lru_tail: NIL,
            free_slots: (0..nblocks as u32).rev().collect(),
            release_count: 0,
            dirty_since_release: false,
            pins: 0,
            live_spans: 0,
        }
    }

    pub(crate) fn release_count(&self) -> u64 {
        self.release_count
    }

    fn slot_ptr(&self, idx: u32) -> *mut u8 {
        (self.buf + idx as usize * self.block_size) as *mut u8
    }

    fn lru_unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let s = &self.slots[idx as usize];
            debug_assert!(s.in_lru);
            (s.prev, s.next)
        };
        if prev == NIL {
            self.lru_head = next;
        } else {
            self.slots[prev as usize].next = next;
        }
        if next == NIL {
            self.lru_tail = prev;
        } else {
            self.slots[next as usize].prev = prev;
        }
        let s = &mut self.slots[idx as usize];
        s.prev = NIL;
        s.next = NIL;
        s.in_lru = false;
    }

    fn lru_push_mru(&mut self, idx: u32) {
        let tail = self.lru_tail;
        {
            let s = &mut self.slots[idx as usize];
            debug_assert!(!s.in_lru);
            s.prev = tail;
            s.next = NIL;
            s.in_lru = true;
        }
        if tail == NIL {
            self.lru_head = idx;
        } else {
            self.slots[tail as usize].next = idx;
        }
        self.lru_tail = idx;
    }

    fn writeback(&mut self, rt: &Runtime, idx: u32) {
        let (rank, base_off, lo, hi) = {
            let s = &self.slots[idx as usize];
            debug_assert_eq!(s.state, BlockState::Dirty);
            (
                s.rank as usize,
                s.block as usize * self.block_size,
                s.dirty_lo as usize,
                s.dirty_hi as usize,
            )
        };
        debug_assert!(lo < hi);
        rt.prof_cache_writeback();
        let src = (self.slot_ptr(idx) as usize + lo) as *const u8;
        rt.prof_rma_put(hi - lo);
        rt.transport()
            .put_nb(rt.heap_win(), rank, base_off + lo, src, hi - lo);
        let s = &mut self.slots[idx as usize];
        s.state = BlockState::Clean;
        s.dirty_lo = 0;
        s.dirty_hi = 0;
    }

    /// Find or install a slot for (rank, block).  The returned slot is
    /// not in the LRU list; callers re-link it when they are done.
    fn ensure(&mut self, rt: &Runtime, rank: u32, block: u64) -> u32 {
        if let Some(&idx) = self.map.get(&(rank, block)) {
            if self.slots[idx as usize].in_lru {
                self.lru_unlink(idx);
            }
            rt.prof_cache_hit();
            return idx;
        }
        rt.prof_cache_miss();
        let idx = match self.free_slots.pop() {
            Some(i) => i,
            None => {
                let victim = self.lru_head;
                if victim == NIL {
                    fatal!(
                        "coherence cache exhausted with every block pinned; \
                         raise PORTAGE_CACHE_SIZE or shrink checkouts"
                    );
                }
                self.lru_unlink(victim);
                if self.slots[victim as usize].state == BlockState::Dirty {
                    self.writeback(rt, victim);
                    let r = self.slots[victim as usize].rank as usize;
                    rt.transport().flush(rt.heap_win(), r);
                }
                let old = &self.slots[victim as usize];
                self.map.remove(&(old.rank, old.block));
                victim
            }
        };
        let slot = Slot {
            rank,
            block,
            state: BlockState::Invalid,
            refs: 0,
            dirty_lo: 0,
            dirty_hi: 0,
            prev: NIL,
            next: NIL,
            in_lru: false,
        };
        if idx as usize == self.slots.len() {
            self.slots.push(slot);
        } else {
            self.slots[idx as usize] = slot;
        }
        self.map.insert((rank, block), idx);
        idx
    }

    /// Fetch every `Invalid` slot in the list from its owner, with one
    /// flush covering all of them.  Concurrent demands for the same block
    /// within this process coalesce by construction: the block goes
    /// `Fetching` and everyone sees the fetched copy.
    fn fetch_batch(&mut self, rt: &Runtime, rank: usize, idxs: &[u32]) {
        let mut any = false;
        for &idx in idxs {
            if self.slots[idx as usize].state != BlockState::Invalid {
                continue;
            }
            self.slots[idx as usize].state = BlockState::Fetching;
            let block = self.slots[idx as usize].block;
            let off = block as usize * self.block_size;
            rt.prof_rma_get(self.block_size);
            rt.transport()
                .get_nb(rt.heap_win(), rank, off, self.slot_ptr(idx), self.block_size);
            any = true;
        }
        if any {
            rt.transport().flush(rt.heap_win(), rank);
        }
        for &idx in idxs {
            if self.slots[idx as usize].state == BlockState::Fetching {
                self.slots[idx as usize].state = BlockState::Clean;
            }
        }
    }

    fn mark_dirty(&mut self, idx: u32, lo: usize, hi: usize) {
        let s = &mut self.slots[idx as usize];
        if s.state == BlockState::Dirty {
            s.dirty_lo = s.dirty_lo.min(lo as u32);
            s.dirty_hi = s.dirty_hi.max(hi as u32);
        } else {
            s.state = BlockState::Dirty;
            s.dirty_lo = lo as u32;
            s.dirty_hi = hi as u32;
        }
        self.dirty_since_release = true;
    }

    /// Map `len` bytes at (rank, off) into local memory under `mode`
    fn checkout_bytes(
        &mut self,
        rt: &Runtime,
        rank: usize,
        off: usize,
        len: usize,
        mode: Mode,
    ) -> (*mut u8, Plan) {
        debug_assert!(len > 0);
        debug_assert!(off + len <= rt.heap_win().size());
        let bs = self.block_size;
        let first = (off / bs) as u64;
        let last = ((off + len - 1) / bs) as u64;
        self.live_spans += 1;
        if first == last {
            let idx = self.ensure(rt, rank as u32, first);
            if mode.fetches() {
                self.fetch_batch(rt, rank, &[idx]);
            } else if self.slots[idx as usize].state == BlockState::Invalid {
                // write-only over a block we never fetched: the bytes
                // outside the written range must at least be defined
                // SAFETY: the slot buffer spans block_size bytes
                unsafe { std::ptr::write_bytes(self.slot_ptr(idx), 0, bs) };
            }
            let in_off = off - first as usize * bs;
            if mode.writes() {
                self.mark_dirty(idx, in_off, in_off + len);
            }
            self.slots[idx as usize].refs += 1;
            self.pins += 1;
            let ptr = (self.slot_ptr(idx) as usize + in_off) as *mut u8;
            (ptr, Plan::Borrowed { slot: idx })
        } else {
            // a span over several blocks stages through a contiguous
            // buffer; see DESIGN.md on why there is no VM remapping here
            let layout = Layout::from_size_align(len, 16).expect("checkout size overflow");
            // SAFETY: non-zero layout, released at checkin
            let buf = unsafe { alloc_zeroed(layout) };
            if buf.is_null() {
                fatal!("out of memory staging a {} byte checkout", len);
            }
            let mut idxs = Vec::with_capacity((last - first + 1) as usize);
            for b in first..=last {
                let idx = self.ensure(rt, rank as u32, b);
                self.slots[idx as usize].refs += 1; // hold while we fill
                idxs.push(idx);
            }
            if mode.fetches() {
                self.fetch_batch(rt, rank, &idxs);
                for (i, b) in (first..=last).enumerate() {
                    let (lo, hi) = intersect(off, len, b as usize * bs, bs);
                    let idx = idxs[i];
                    // SAFETY: both ranges live and disjoint
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            (self.slot_ptr(idx) as usize + (lo - b as usize * bs)) as *const u8,
                            (buf as usize + (lo - off)) as *mut u8,
                            hi - lo,
                        );
                    }
                }
            }
            for &idx in &idxs {
                self.slots[idx as usize].refs -= 1;
                if self.slots[idx as usize].refs == 0 {
                    self.lru_push_mru(idx);
                }
            }
            (
                buf,
                Plan::Staged {
                    rank: rank as u32,
                    off,
                    len,
                    buf: buf as usize,
                    layout,
                },
            )
        }
    }

    fn checkin_plan(&mut self, rt: &Runtime, plan: &Plan, mode: Mode) {
        match *plan {
            Plan::Passthrough => return,
            Plan::Borrowed { slot } => {
                self.live_spans -= 1;
                self.pins -= 1;
                let s = &mut self.slots[slot as usize];
                debug_assert!(s.refs > 0);
                s.refs -= 1;
                if s.refs == 0 {
                    self.lru_push_mru(slot);
                }
            }
            Plan::Staged {
                rank,
                off,
                len,
                buf,
                layout,
            } => {
                self.live_spans -= 1;
                if mode.writes() {
                    let bs = self.block_size;
                    let first = (off / bs) as u64;
                    let last = ((off + len - 1) / bs) as u64;
                    for b in first..=last {
                        let idx = self.ensure(rt, rank, b);
                        if self.slots[idx as usize].state == BlockState::Invalid {
                            // SAFETY: the slot buffer spans block_size bytes
                            unsafe { std::ptr::write_bytes(self.slot_ptr(idx), 0, bs) };
                        }
                        let (lo, hi) = intersect(off, len, b as usize * bs, bs);
                        // SAFETY: both ranges live and disjoint
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                (buf + (lo - off)) as *const u8,
                                (self.slot_ptr(idx) as usize + (lo - b as usize * bs)) as *mut u8,
                                hi - lo,
                            );
                        }
                        self.mark_dirty(idx, lo - b as usize * bs, hi - b as usize * bs);
                        if self.slots[idx as usize].refs == 0 {
                            self.lru_push_mru(idx);
                        }
                    }
                }
                // SAFETY: allocated in checkout_bytes with this layout
                unsafe { dealloc(buf as *mut u8, layout) };
            }
        }
    }

    /// Write back every dirty block and publish the new release epoch
    fn release_impl(&mut self, rt: &Runtime) {
        debug_assert_eq!(self.pins, 0, "checkout held across a release fence");
        debug_assert_eq!(self.live_spans, 0, "checkout held across a release fence");
        let mut touched = vec![false; rt.n_ranks()];
        for idx in 0..self.slots.len() as u32 {
            // only resident slots can be dirty; recycled ones are Invalid
            if self.slots[idx as usize].state == BlockState::Dirty {
                touched[self.slots[idx as usize].rank as usize] = true;
                self.writeback(rt, idx);
            }
        }
        for (r, t) in touched.iter().enumerate() {
            if *t {
                rt.transport().flush(rt.heap_win(), r);
            }
        }
        if self.dirty_since_release {
            self.release_count += 1;
            self.dirty_since_release = false;
            rt.transport().atomic_store_u64(
                rt.ctrl_win(),
                rt.rank(),
                OFF_RELEASED_EPOCH,
                self.release_count,
            );
        }
        rt.prof_release();
        trace!("rank {}: release to epoch {}", rt.rank(), self.release_count);
    }

    /// Drop every clean unpinned block so later reads refetch
    fn acquire_impl(&mut self, rt: &Runtime) {
        debug_assert_eq!(self.pins, 0, "checkout held across an acquire fence");
        debug_assert_eq!(self.live_spans, 0, "checkout held across an acquire fence");
        for idx in 0..self.slots.len() as u32 {
            let (rank, block, state, refs) = {
                let s = &self.slots[idx as usize];
                (s.rank, s.block, s.state, s.refs)
            };
            if refs == 0
                && state == BlockState::Clean
                && self.map.get(&(rank, block)) == Some(&idx)
            {
                self.lru_unlink(idx);
                self.map.remove(&(rank, block));
                self.slots[idx as usize].state = BlockState::Invalid;
                self.free_slots.push(idx);
            }
        }
        rt.prof_acquire();
        trace!("rank {}: acquire", rt.rank());
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        // SAFETY: allocated in new with this layout
        unsafe { dealloc(self.buf as *mut u8, self.buf_layout) };
    }
}

fn intersect(off: usize, len: usize, block_off: usize, block_size: usize) -> (usize, usize) {
    (off.max(block_off), (off + len).min(block_off + block_size))
}

// Fence entry points used by the scheduler hooks and the public barrier.

/// Write back all dirty state; afterwards any rank that acquires sees it
pub(crate) fn release(rt: &Runtime) {
    rt.cache().borrow_mut().release_impl(rt);
}

/// Invalidate clean state so later reads observe remote writes
pub(crate) fn acquire(rt: &Runtime) {
    rt.cache().borrow_mut().acquire_impl(rt);
}

/// An epoch token for the release this rank has not performed yet
pub(crate) fn release_lazy(rt: &Runtime) -> ReleaseHandle {
    let c = rt.cache().borrow();
    ReleaseHandle {
        rank: rt.rank(),
        epoch: c.release_count + c.dirty_since_release as u64,
    }
}

/// Acquire against a handle: no-op when already satisfied locally,
/// otherwise ask the issuing rank for its release and wait for the epoch.
pub(crate) fn acquire_handle(rt: &Runtime, rh: ReleaseHandle) {
    if rh.rank == rt.rank() {
        if rh.epoch <= rt.cache().borrow().release_count {
            return;
        }
        acquire(rt);
        return;
    }
    loop {
        let re = rt
            .transport()
            .atomic_load_u64(rt.ctrl_win(), rh.rank, OFF_RELEASED_EPOCH);
        if re >= rh.epoch {
            break;
        }
        rt.transport()
            .atomic_store_u32(rt.ctrl_win(), rh.rank, OFF_RELEASE_REQ, 1);
        runtime::poll(rt);
        std::thread::yield_now();
    }
    acquire(rt);
}

/// Service a pending release request from another rank; called at poll
/// points
pub(crate) fn service_release_request(rt: &Runtime) {
    let t = rt.transport();
    if t.atomic_load_u32(rt.ctrl_win(), rt.rank(), OFF_RELEASE_REQ) != 0 {
        t.atomic_store_u32(rt.ctrl_win(), rt.rank(), OFF_RELEASE_REQ, 0);
        release(rt);
    }
}

// The user-facing checkout span.

#[derive(Debug)]
enum Plan {
    Borrowed {
        slot: u32,
    },
    Staged {
        rank: u32,
        off: usize,
        len: usize,
        buf: usize,
        layout: Layout,
    },
    Passthrough,
}

/// A bounded local view of global memory, checked out under a mode.
/// Dropping the span checks it back in.
///
/// The span lends plain slices; as in any PGAS setting, overlapping a
/// write span with another live span on the same bytes is a data race
/// the runtime does not detect.
#[derive(Debug)]
pub struct CheckoutSpan<T: Remotable> {
    ptr: *mut T,
    len: usize,
    mode: Mode,
    target: GlobalPtr<T>,
    plan: Plan,
}

impl<T: Remotable> CheckoutSpan<T> {
    /// The global pointer this span covers
    pub fn target(&self) -> GlobalPtr<T> {
        self.target
    }

    /// Number of elements in the view
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the view is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Explicit checkin; equivalent to drop
    pub fn checkin(self) {}
}

impl<T: Remotable> std::ops::Deref for CheckoutSpan<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        if self.len == 0 {
            return &[];
        }
        debug_assert!(self.mode != Mode::NoAccess, "no_access spans have no view");
        // SAFETY: ptr covers len elements for the life of the span
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<T: Remotable> std::ops::DerefMut for CheckoutSpan<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        if self.len == 0 {
            return &mut [];
        }
        debug_assert!(self.mode.writes(), "write through a read-only checkout");
        // SAFETY: as Deref; write modes have exclusive protocol ownership
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl<T: Remotable> Drop for CheckoutSpan<T> {
    fn drop(&mut self) {
        if matches!(self.plan, Plan::Passthrough) {
            return;
        }
        let plan = std::mem::replace(&mut self.plan, Plan::Passthrough);
        let mode = self.mode;
        runtime::with(|rt| rt.cache().borrow_mut().checkin_plan(rt, &plan, mode));
    }
}

/// Acquire cache blocks for `count` elements at `g` and return a local
/// view.  `no_access` performs no caching and yields an empty view that
/// only carries the pointer through.
pub fn make_checkout<T: Remotable>(g: GlobalPtr<T>, count: usize, mode: Mode) -> CheckoutSpan<T> {
    debug_assert!(
        g.offset() % std::mem::align_of::<T>() == 0,
        "misaligned checkout"
    );
    if count == 0 || mode == Mode::NoAccess {
        return CheckoutSpan {
            ptr: std::ptr::NonNull::dangling().as_ptr(),
            len: if mode == Mode::NoAccess { 0 } else { count },
            mode,
            target: g,
            plan: Plan::Passthrough,
        };
    }
    debug_assert!(g.win() == WinKind::Heap, "checkouts cover the global heap");
    runtime::with(|rt| {
        let bytes = count * std::mem::size_of::<T>();
        let (ptr, plan) =
            rt.cache()
                .borrow_mut()
                .checkout_bytes(rt, g.rank(), g.offset(), bytes, mode);
        CheckoutSpan {
            ptr: ptr as *mut T,
            len: count,
            mode,
            target: g,
            plan,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_access_checkout_passes_the_pointer_through() {
        // no runtime on this thread: a no_access checkout must neither
        // touch cache state on the way in nor on checkin
        let g: GlobalPtr<u64> = GlobalPtr::new(3, WinKind::Heap, 4096);
        let span = make_checkout(g, 5, Mode::NoAccess);
        assert_eq!(span.target(), g);
        assert_eq!(span.len(), 0);
        assert!(span.is_empty());
        assert!(matches!(span.plan, Plan::Passthrough));
        // the view is empty; the carried pointer is the whole payload
        assert!(span.iter().next().is_none());
        span.checkin();
    }

    #[test]
    fn no_access_keeps_arithmetic_on_the_pointer() {
        let g: GlobalPtr<u32> = GlobalPtr::new(1, WinKind::Heap, 256);
        let span = make_checkout(g.add(4), 2, Mode::NoAccess);
        assert_eq!(span.target(), g.add(4));
        assert_eq!(span.target().offset(), 256 + 4 * 4);
        assert_eq!(span.target().rank(), 1);
    }

    #[test]
    fn zero_length_checkouts_are_passthrough() {
        let g: GlobalPtr<u8> = GlobalPtr::new(0, WinKind::Heap, 0);
        let span = make_checkout(g, 0, Mode::Read);
        assert!(span.is_empty());
        assert!(matches!(span.plan, Plan::Passthrough));
    }
}
