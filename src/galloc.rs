//! Global memory allocators: the collective heap carved identically on
//! every rank, and the per-rank remotable slabs that hold runtime control
//! blocks observable over RMA.
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
use crate::rma;
use crate::runtime::{self, CtrlSegment, FreeMsg, Runtime, FREE_RING_CAP, NUM_SIZE_CLASSES};
use std::mem::{offset_of, size_of};

const OFF_HEAP_LOCK: usize = offset_of!(CtrlSegment, heap_lock);
const OFF_HEAP_BUMP: usize = offset_of!(CtrlSegment, heap_bump);
const OFF_HEAP_FREE: usize = offset_of!(CtrlSegment, heap_free);
const OFF_FREE_TAIL: usize = offset_of!(CtrlSegment, free_tail);
const OFF_FREE_HEAD: usize = offset_of!(CtrlSegment, free_head);
const OFF_FREE_RING: usize = offset_of!(CtrlSegment, free_ring);

/// Smallest slab block; keeps every offset 4-aligned for the atomic
/// fields of control blocks and bounds free-list fragmentation.
const MIN_BLOCK: usize = 32;

pub(crate) fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

fn class_of(bytes: usize) -> usize {
    bytes.max(MIN_BLOCK).next_power_of_two().trailing_zeros() as usize
}

/// A process-local bump allocator over a registered window, with
/// power-of-two free lists.  Single-writer: only the owning rank
/// allocates or frees; remote holders go through the free ring.
#[derive(Debug)]
pub(crate) struct Slab {
    kind: WinKind,
    size: usize,
    bump: usize,
    free: Vec<Vec<usize>>,
}

impl Slab {
    pub(crate) fn new(kind: WinKind, size: usize) -> Slab {
        Slab {
            kind,
            size,
            bump: 0,
            free: vec![Vec::new(); 64],
        }
    }

    /// Reserve a block of at least `bytes`; offsets are 64-aligned
    pub(crate) fn alloc(&mut self, bytes: usize) -> usize {
        let c = class_of(bytes);
        if let Some(off) = self.free[c].pop() {
            return off;
        }
        let sz = 1usize << c;
        let off = align_up(self.bump, 64);
        if off + sz > self.size {
            fatal!(
                "remotable {:?} slab exhausted at {} bytes; raise the allocator size option",
                self.kind,
                self.size
            );
        }
        self.bump = off + sz;
        off
    }

    /// Return a block allocated with the same `bytes`
    pub(crate) fn free_local(&mut self, off: usize, bytes: usize) {
        self.free[class_of(bytes)].push(off);
    }
}

fn slab_of(rt: &Runtime, kind: WinKind) -> &std::cell::RefCell<Slab> {
    match kind {
        WinKind::ThreadState => rt.ts_slab(),
        WinKind::Evac => rt.evac_slab(),
        WinKind::Heap => fatal!("the collective heap is not a slab"),
    }
}

/// Allocate from one of this rank's remotable slabs
pub(crate) fn slab_alloc(rt: &Runtime, kind: WinKind, bytes: usize) -> GlobalPtr<u8> {
    let off = slab_of(rt, kind).borrow_mut().alloc(bytes);
    GlobalPtr::new(rt.rank(), kind, off)
}

/// Return a slab block, possibly owned by another rank.  Remote returns
/// go through the owner's free ring so the block is never reused while
/// the wire still carries references to it.
pub(crate) fn slab_free(rt: &Runtime, g: GlobalPtr<u8>, bytes: usize) {
    if g.rank() == rt.rank() {
        slab_of(rt, g.win())
            .borrow_mut()
            .free_local(g.offset(), bytes);
        return;
    }
    let ctrl = rt.ctrl_win();
    let seq = rma::faa_u64(rt, ctrl, g.rank(), OFF_FREE_TAIL, 1);
    loop {
        let head = rt.transport().atomic_load_u64(ctrl, g.rank(), OFF_FREE_HEAD);
        if seq - head < FREE_RING_CAP as u64 {
            break;
        }
        runtime::poll(rt);
        std::thread::yield_now();
    }
    let slot = OFF_FREE_RING + (seq % FREE_RING_CAP as u64) as usize * size_of::<FreeMsg>();
    // body first, stamp last: the stamp store publishes the message
    rma::put_value(rt, ctrl, g.rank(), slot, g.offset() as u64);
    rma::put_value(rt, ctrl, g.rank(), slot + 8, bytes as u64);
    rma::put_value(
        rt,
        ctrl,
        g.rank(),
        slot + 16,
        match g.win() {
            WinKind::ThreadState => 0u64,
            WinKind::Evac => 1u64,
            WinKind::Heap => fatal!("heap pointers are not slab blocks"),
        },
    );
    rt.transport().flush(ctrl, g.rank());
    rt.transport()
        .atomic_store_u64(ctrl, g.rank(), slot + 24, seq + 1);
}

/// Owner side: apply queued remote frees.  Called at poll points.
pub(crate) fn drain_free_ring(rt: &Runtime) {
    let ctrl = rt.ctrl_win();
    let me = rt.rank();
    let t = rt.transport();
    let head0 = t.atomic_load_u64(ctrl, me, OFF_FREE_HEAD);
    let tail = t.atomic_load_u64(ctrl, me, OFF_FREE_TAIL);
    let mut head = head0;
    while head < tail {
        let slot = OFF_FREE_RING + (head % FREE_RING_CAP as u64) as usize * size_of::<FreeMsg>();
        if t.atomic_load_u64(ctrl, me, slot + 24) != head + 1 {
            break; // writer still filling this slot
        }
        let off = rma::get_value::<u64>(rt, ctrl, me, slot) as usize;
        let bytes = rma::get_value::<u64>(rt, ctrl, me, slot + 8) as usize;
        let kind = match rma::get_value::<u64>(rt, ctrl, me, slot + 16) {
            0 => WinKind::ThreadState,
            _ => WinKind::Evac,
        };
        slab_of(rt, kind).borrow_mut().free_local(off, bytes);
        t.atomic_store_u64(ctrl, me, slot + 24, 0);
        head += 1;
    }
    if head != head0 {
        t.atomic_store_u64(ctrl, me, OFF_FREE_HEAD, head);
    }
}

// The collective heap: every rank holds an equally sized window; one
// allocation reserves the same offset range on all of them.  The books
// (bump pointer + free lists) live on rank 0 behind a one-sided CAS
// lock, so allocation is legal from the SPMD region and from inside a
// root task alike.

fn heap_lock(rt: &Runtime) {
    loop {
        if rma::cas_u64(rt, rt.ctrl_win(), 0, OFF_HEAP_LOCK, 0, 1) == 0 {
            return;
        }
        runtime::poll(rt);
        std::hint::spin_loop();
    }
}

fn heap_unlock(rt: &Runtime) {
    rt.transport()
        .atomic_store_u64(rt.ctrl_win(), 0, OFF_HEAP_LOCK, 0);
}

/// Reserve `bytes` per rank on the collective heap; returns the common
/// byte offset
pub(crate) fn coll_alloc(rt: &Runtime, bytes: usize) -> usize {
    let c = class_of(bytes);
    if c >= NUM_SIZE_CLASSES {
        fatal!("collective allocation of {} bytes is beyond any size class", bytes);
    }
    let sz = 1usize << c;
    let head_off = OFF_HEAP_FREE + c * 8;
    heap_lock(rt);
    let head = rma::get_value::<u64>(rt, rt.ctrl_win(), 0, head_off);
    let off = if head != 0 {
        let off = (head - 1) as usize;
        // the freed block's first word chains to the next free block
        let next = rma::get_value::<u64>(rt, rt.heap_win(), 0, off);
        rma::put_value(rt, rt.ctrl_win(), 0, head_off, next);
        off
    } else {
        let bump = rma::get_value::<u64>(rt, rt.ctrl_win(), 0, OFF_HEAP_BUMP) as usize;
        let off = align_up(bump, sz.min(4096).max(16));
        if off + sz > rt.heap_win().size() {
            fatal!(
                "collective heap exhausted ({} bytes per rank); raise PORTAGE_HEAP_SIZE",
                rt.heap_win().size()
            );
        }
        rma::put_value(rt, rt.ctrl_win(), 0, OFF_HEAP_BUMP, (off + sz) as u64);
        off
    };
    heap_unlock(rt);
    off
}

/// Return a collective allocation of the same size
pub(crate) fn coll_free(rt: &Runtime, off: usize, bytes: usize) {
    let c = class_of(bytes);
    debug_assert!(c < NUM_SIZE_CLASSES);
    let head_off = OFF_HEAP_FREE + c * 8;
    heap_lock(rt);
    let head = rma::get_value::<u64>(rt, rt.ctrl_win(), 0, head_off);
    rma::put_value(rt, rt.heap_win(), 0, off, head);
    rma::put_value(rt, rt.ctrl_win(), 0, head_off, (off + 1) as u64);
    heap_unlock(rt);
}

/// Per-rank bytes needed to hold `count` elements of `T` spread evenly
pub(crate) fn per_rank_bytes<T>(count: usize, n_ranks: usize) -> usize {
    let per = count.div_ceil(n_ranks);
    per * size_of::<T>()
}

/// Allocate `count` elements of `T`, spread in equal chunks over all
/// ranks.  Collective when called from the SPMD region (every rank gets
/// the same pointer); inside a root task a single caller reserves for
/// everyone.  The returned pointer addresses rank 0's chunk;
/// `with_rank` reaches the others.
pub fn malloc_coll<T: Remotable>(count: usize) -> GlobalPtr<T> {
    runtime::with(|rt| {
        let bytes = per_rank_bytes::<T>(count, rt.n_ranks()).max(1);
        if rt.worker().spmd.get() {
            let mut buf = [0u8; 8];
            if rt.rank() == 0 {
                buf = (coll_alloc(rt, bytes) as u64).to_ne_bytes();
            }
            rt.transport().broadcast(0, &mut buf);
            GlobalPtr::new(0, WinKind::Heap, u64::from_ne_bytes(buf) as usize)
        } else {
            GlobalPtr::new(0, WinKind::Heap, coll_alloc(rt, bytes))
        }
    })
}

/// Release a `malloc_coll` allocation of the same `count`; collective
/// from the SPMD region, single-caller from inside a root task
pub fn free_coll<T: Remotable>(g: GlobalPtr<T>, count: usize) {
    runtime::with(|rt| {
        let bytes = per_rank_bytes::<T>(count, rt.n_ranks()).max(1);
        if rt.worker().spmd.get() {
            // nobody may reach the memory once any rank recycles it
            rt.transport().barrier();
            if rt.rank() == 0 {
                coll_free(rt, g.offset(), bytes);
            }
            rt.transport().barrier();
        } else {
            coll_free(rt, g.offset(), bytes);
        }
    })
}

/// Non-collective allocation of `count` elements from this rank's
/// remotable window
pub fn malloc<T: Remotable>(count: usize) -> GlobalPtr<T> {
    runtime::with(|rt| {
        slab_alloc(rt, WinKind::ThreadState, (count * size_of::<T>()).max(1)).cast::<T>()
    })
}

/// Release a `malloc` allocation of the same `count`; legal from any rank
pub fn free<T: Remotable>(g: GlobalPtr<T>, count: usize) {
    runtime::with(|rt| slab_free(rt, g.cast::<u8>(), (count * size_of::<T>()).max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_round_up_to_pow2() {
        assert_eq!(class_of(1), MIN_BLOCK.trailing_zeros() as usize);
        assert_eq!(class_of(32), 5);
        assert_eq!(class_of(33), 6);
        assert_eq!(class_of(4096), 12);
        assert_eq!(class_of(4097), 13);
    }

    #[test]
    fn slab_reuses_freed_blocks() {
        let mut s = Slab::new(WinKind::ThreadState, 1 << 16);
        let a = s.alloc(100);
        let b = s.alloc(100);
        assert_ne!(a, b);
        assert_eq!(a % 64, 0);
        s.free_local(a, 100);
        let c = s.alloc(120); // same class as 100
        assert_eq!(c, a);
    }

    #[test]
    fn per_rank_split_covers_all_elements() {
        assert_eq!(per_rank_bytes::<u64>(10, 4), 3 * 8);
        assert_eq!(per_rank_bytes::<u64>(8, 4), 2 * 8);
        assert_eq!(per_rank_bytes::<u8>(1, 8), 1);
    }
}
