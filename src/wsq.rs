//! The work-stealing deque: per-rank, fixed capacity, resident in the
//! owner's control window so thieves can reach it with one-sided RMA.
//!
//! LIFO for the owner (pop from the base end), FIFO for thieves (steal
//! from the top end).  Pushes are lock-free; thieves serialize against
//! each other through a coarse per-deque lock taken by remote CAS; the
//! owner races thieves only for the last entry, settled by a Chase-Lev
//! style claim on `top`.
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
use crate::gptr::Remotable;
use crate::rma::{Transport, Window};
use crate::runtime::CtrlSegment;
use std::mem::{offset_of, size_of};

/// One stealable continuation: a frame image on the owner's callstack
/// plus the release epoch captured when it was published.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WsqEntry {
    pub(crate) frame_base: u64,
    pub(crate) frame_size: u64,
    pub(crate) epoch: u64,
}

// raw bytes are meaningful on every rank: addresses are interpreted
// against the owner's stack base by the thief
unsafe impl Remotable for WsqEntry {}

const OFF_LOCK: usize = offset_of!(CtrlSegment, wsq_lock);
const OFF_TOP: usize = offset_of!(CtrlSegment, wsq_top);
const OFF_BASE: usize = offset_of!(CtrlSegment, wsq_base);

/// Deque geometry; the entry array sits behind the fixed control segment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Wsq {
    capacity: u64,
    entries_off: usize,
}

impl Wsq {
    pub(crate) fn new(capacity: usize, entries_off: usize) -> Wsq {
        Wsq {
            capacity: capacity as u64,
            entries_off,
        }
    }

    fn entry_off(&self, index: u64) -> usize {
        self.entries_off + (index % self.capacity) as usize * size_of::<WsqEntry>()
    }

    fn read_entry(&self, t: &dyn Transport, ctrl: &Window, rank: usize, index: u64) -> WsqEntry {
        let mut e = WsqEntry {
            frame_base: 0,
            frame_size: 0,
            epoch: 0,
        };
        t.get(
            ctrl,
            rank,
            self.entry_off(index),
            &mut e as *mut WsqEntry as *mut u8,
            size_of::<WsqEntry>(),
        );
        e
    }

    /// Owner-only: publish a continuation.  Overflow is a configuration
    /// error (raise the deque capacity), not a recoverable condition.
    pub(crate) fn push(&self, t: &dyn Transport, ctrl: &Window, me: usize, e: WsqEntry) {
        let base = t.atomic_load_u64(ctrl, me, OFF_BASE);
        let top = t.atomic_load_u64(ctrl, me, OFF_TOP);
        if base - top >= self.capacity {
            fatal!(
                "work-stealing deque overflow at {} entries; raise PORTAGE_WSQUEUE_CAPACITY",
                self.capacity
            );
        }
        // entry bytes first, then the publishing store of base
        t.put(
            ctrl,
            me,
            self.entry_off(base),
            &e as *const WsqEntry as *const u8,
            size_of::<WsqEntry>(),
        );
        t.atomic_store_u64(ctrl, me, OFF_BASE, base + 1);
    }

    /// Owner-only: take back the most recently pushed entry.  `None`
    /// means a thief got there first (or the deque is empty).
    pub(crate) fn pop(&self, t: &dyn Transport, ctrl: &Window, me: usize) -> Option<WsqEntry> {
        let base = t.atomic_load_u64(ctrl, me, OFF_BASE);
        let top = t.atomic_load_u64(ctrl, me, OFF_TOP);
        if base == top {
            return None;
        }
        let nb = base - 1;
        t.atomic_store_u64(ctrl, me, OFF_BASE, nb);
        let top = t.atomic_load_u64(ctrl, me, OFF_TOP);
        if top < nb {
            // at least one entry remains above top; nb is safely ours
            return Some(self.read_entry(t, ctrl, me, nb));
        }
        if top == nb {
            // last entry: claim it against any thief by advancing top
            let won = t.cas_u64(ctrl, me, OFF_TOP, nb, nb + 1) == nb;
            let e = if won {
                Some(self.read_entry(t, ctrl, me, nb))
            } else {
                None
            };
            t.atomic_store_u64(ctrl, me, OFF_BASE, nb + 1);
            return e;
        }
        // thieves drained everything while we were deciding
        t.atomic_store_u64(ctrl, me, OFF_BASE, top);
        None
    }

    /// Any rank: is `rank`'s deque observably empty right now?
    pub(crate) fn empty(&self, t: &dyn Transport, ctrl: &Window, rank: usize) -> bool {
        let top = t.atomic_load_u64(ctrl, rank, OFF_TOP);
        let base = t.atomic_load_u64(ctrl, rank, OFF_BASE);
        top >= base
    }

    /// Thief: try to take `rank`'s deque lock
    pub(crate) fn trylock(&self, t: &dyn Transport, ctrl: &Window, rank: usize) -> bool {
        t.cas_u64(ctrl, rank, OFF_LOCK, 0, 1) == 0
    }

    /// Thief: release `rank`'s deque lock
    pub(crate) fn unlock(&self, t: &dyn Transport, ctrl: &Window, rank: usize) {
        t.atomic_store_u64(ctrl, rank, OFF_LOCK, 0);
    }

    /// Thief, with the lock held: steal the oldest entry.  `None` when
    /// the deque is empty or the owner claimed the last entry first.
    pub(crate) fn steal_nolock(
        &self,
        t: &dyn Transport,
        ctrl: &Window,
        rank: usize,
    ) -> Option<WsqEntry> {
        let top = t.atomic_load_u64(ctrl, rank, OFF_TOP);
        let base = t.atomic_load_u64(ctrl, rank, OFF_BASE);
        if top >= base {
            return None;
        }
        let e = self.read_entry(t, ctrl, rank, top);
        if t.cas_u64(ctrl, rank, OFF_TOP, top, top + 1) == top {
            Some(e)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rma::local::{LocalDomain, LocalTransport};
    use crate::rma::Transport;
    use std::sync::Arc;

    fn entry(n: u64) -> WsqEntry {
        WsqEntry {
            frame_base: n,
            frame_size: 64,
            epoch: 0,
        }
    }

    #[test]
    fn push_pop_is_lifo() {
        let d = Arc::new(LocalDomain::new(1));
        let t = LocalTransport::new(d, 0).unwrap();
        let cap = 8;
        let ctrl = t
            .create_window(size_of::<CtrlSegment>() + cap * size_of::<WsqEntry>())
            .unwrap();
        let q = Wsq::new(cap, size_of::<CtrlSegment>());
        assert!(q.pop(&t, &ctrl, 0).is_none());
        q.push(&t, &ctrl, 0, entry(1));
        q.push(&t, &ctrl, 0, entry(2));
        q.push(&t, &ctrl, 0, entry(3));
        assert!(!q.empty(&t, &ctrl, 0));
        assert_eq!(q.pop(&t, &ctrl, 0), Some(entry(3)));
        assert_eq!(q.pop(&t, &ctrl, 0), Some(entry(2)));
        assert_eq!(q.pop(&t, &ctrl, 0), Some(entry(1)));
        assert!(q.pop(&t, &ctrl, 0).is_none());
        assert!(q.empty(&t, &ctrl, 0));
        t.destroy_window(&ctrl);
    }

    #[test]
    fn steal_takes_oldest() {
        let d = Arc::new(LocalDomain::new(1));
        let t = LocalTransport::new(d, 0).unwrap();
        let cap = 8;
        let ctrl = t
            .create_window(size_of::<CtrlSegment>() + cap * size_of::<WsqEntry>())
            .unwrap();
        let q = Wsq::new(cap, size_of::<CtrlSegment>());
        q.push(&t, &ctrl, 0, entry(1));
        q.push(&t, &ctrl, 0, entry(2));
        assert!(q.trylock(&t, &ctrl, 0));
        // the lock is held: a second taker must fail
        assert!(!q.trylock(&t, &ctrl, 0));
        assert_eq!(q.steal_nolock(&t, &ctrl, 0), Some(entry(1)));
        q.unlock(&t, &ctrl, 0);
        // owner keeps the newest
        assert_eq!(q.pop(&t, &ctrl, 0), Some(entry(2)));
        assert!(q.pop(&t, &ctrl, 0).is_none());
        t.destroy_window(&ctrl);
    }

    #[test]
    fn owner_wins_or_loses_last_entry_exactly_once() {
        let d = Arc::new(LocalDomain::new(1));
        let t = LocalTransport::new(d, 0).unwrap();
        let cap = 4;
        let ctrl = t
            .create_window(size_of::<CtrlSegment>() + cap * size_of::<WsqEntry>())
            .unwrap();
        let q = Wsq::new(cap, size_of::<CtrlSegment>());
        q.push(&t, &ctrl, 0, entry(9));
        assert!(q.trylock(&t, &ctrl, 0));
        let stolen = q.steal_nolock(&t, &ctrl, 0);
        q.unlock(&t, &ctrl, 0);
        let popped = q.pop(&t, &ctrl, 0);
        // the single entry goes to exactly one of the two sides
        assert_eq!(stolen.is_some() as u32 + popped.is_some() as u32, 1);
        t.destroy_window(&ctrl);
    }
}
