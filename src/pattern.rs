//! Data-parallel patterns: leaf users of fork/join and checkout.  All of
//! them recurse by halving an index range until a cutoff, then check out
//! per-rank pieces and run serially.
///
/// Copyright (c) 2020, Institute for Defense Analyses
/// 4850 Mark Center Drive, Alexandria, VA 22311-1882; 703-845-2500
///
/// All rights reserved.
///
/// This file is part of Portage, a PGAS tasking runtime for rust.  For
/// licence information see the LICENSE file in the top level dirctory
/// of the distribution.
use crate::cache::{make_checkout, Mode};
use crate::gptr::{GlobalPtr, Remotable};
use crate::gvec::{block_elems, GlobalSpan, GlobalVec};
use crate::rma;
use crate::runtime;
use crate::sched::{fork, join, poll};

// The scan's auxiliary carries are runtime-internal scratch; they move by
// direct (uncached) RMA so no coherence traffic is owed for them.

fn direct_read<T: Remotable>(g: GlobalPtr<T>) -> T {
    runtime::with(|rt| rma::get_value(rt, rt.window(g.win()), g.rank(), g.offset()))
}

fn direct_write<T: Remotable>(g: GlobalPtr<T>, v: T) {
    runtime::with(|rt| {
        let w = rt.window(g.win());
        rma::put_value(rt, w, g.rank(), g.offset(), v);
        rt.transport().flush(w, g.rank());
    })
}

/// Fork `f1` and `f2`, join in order, return both results
pub fn parallel_invoke<T1, T2, F1, F2>(f1: F1, f2: F2) -> (T1, T2)
where
    T1: Remotable,
    T2: Remotable,
    F1: FnOnce() -> T1 + Send,
    F2: FnOnce() -> T2 + Send,
{
    let h1 = fork(f1);
    let h2 = fork(f2);
    let r1 = join(h1);
    let r2 = join(h2);
    (r1, r2)
}

/// Three-way [`parallel_invoke`]
pub fn parallel_invoke3<T1, T2, T3, F1, F2, F3>(f1: F1, f2: F2, f3: F3) -> (T1, T2, T3)
where
    T1: Remotable,
    T2: Remotable,
    T3: Remotable,
    F1: FnOnce() -> T1 + Send,
    F2: FnOnce() -> T2 + Send,
    F3: FnOnce() -> T3 + Send,
{
    let h1 = fork(f1);
    let h2 = fork(f2);
    let h3 = fork(f3);
    let r1 = join(h1);
    let r2 = join(h2);
    let r3 = join(h3);
    (r1, r2, r3)
}

/// Four-way [`parallel_invoke`]
pub fn parallel_invoke4<T1, T2, T3, T4, F1, F2, F3, F4>(
    f1: F1,
    f2: F2,
    f3: F3,
    f4: F4,
) -> (T1, T2, T3, T4)
where
    T1: Remotable,
    T2: Remotable,
    T3: Remotable,
    T4: Remotable,
    F1: FnOnce() -> T1 + Send,
    F2: FnOnce() -> T2 + Send,
    F3: FnOnce() -> T3 + Send,
    F4: FnOnce() -> T4 + Send,
{
    let h1 = fork(f1);
    let h2 = fork(f2);
    let h3 = fork(f3);
    let h4 = fork(f4);
    (join(h1), join(h2), join(h3), join(h4))
}

fn serial_reduce<T, Op>(span: GlobalSpan<T>, identity: T, op: Op) -> T
where
    T: Remotable,
    Op: Fn(T, T) -> T,
{
    let mut acc = identity;
    for (g, n) in span.chunks() {
        let view = make_checkout(g, n, Mode::Read);
        for v in view.iter() {
            acc = op(acc, *v);
        }
    }
    acc
}

/// Reduce a span with an associative `op`; leaves of at most `cutoff`
/// elements run serially
pub fn reduce<T, Op>(span: GlobalSpan<T>, cutoff: usize, identity: T, op: Op) -> T
where
    T: Remotable,
    Op: Fn(T, T) -> T + Copy + Send + 'static,
{
    if span.is_empty() {
        return identity;
    }
    let cutoff = cutoff.max(1);
    if span.len() <= cutoff {
        poll();
        return serial_reduce(span, identity, op);
    }
    let (l, r) = span.split_at(span.aligned_mid(block_elems::<T>()));
    let (a, b) = parallel_invoke(
        move || reduce(l, cutoff, identity, op),
        move || reduce(r, cutoff, identity, op),
    );
    op(a, b)
}

/// Store `value` into every element of the span
pub fn fill<T>(span: GlobalSpan<T>, cutoff: usize, value: T)
where
    T: Remotable,
{
    for_each_mut(span, cutoff, move |v| *v = value);
}

/// Apply `f` to every element, read-only
pub fn for_each<T, F>(span: GlobalSpan<T>, cutoff: usize, f: F)
where
    T: Remotable,
    F: Fn(&T) + Copy + Send + 'static,
{
    if span.is_empty() {
        return;
    }
    let cutoff = cutoff.max(1);
    if span.len() <= cutoff {
        poll();
        for (g, n) in span.chunks() {
            let view = make_checkout(g, n, Mode::Read);
            for v in view.iter() {
                f(v);
            }
        }
        return;
    }
    let (l, r) = span.split_at(span.aligned_mid(block_elems::<T>()));
    parallel_invoke(
        move || for_each(l, cutoff, f),
        move || for_each(r, cutoff, f),
    );
}

/// Apply `f` to every element through a write view.  Leaves are held to
/// at least one coherence block and splits land on block boundaries, so
/// a block is only ever written from one rank even under stealing.
pub fn for_each_mut<T, F>(span: GlobalSpan<T>, cutoff: usize, f: F)
where
    T: Remotable,
    F: Fn(&mut T) + Copy + Send + 'static,
{
    if span.is_empty() {
        return;
    }
    let cutoff = cutoff.max(1).max(block_elems::<T>());
    if span.len() <= cutoff {
        poll();
        for (g, n) in span.chunks() {
            let mut view = make_checkout(g, n, Mode::Write);
            for v in view.iter_mut() {
                f(v);
            }
        }
        return;
    }
    let (l, r) = span.split_at(span.aligned_mid(block_elems::<T>()));
    parallel_invoke(
        move || for_each_mut(l, cutoff, f),
        move || for_each_mut(r, cutoff, f),
    );
}

fn serial_zip_fold<T, U, M, Op>(
    a: GlobalSpan<T>,
    b: GlobalSpan<T>,
    identity: U,
    map: M,
    op: Op,
) -> U
where
    T: Remotable,
    U: Remotable,
    M: Fn(T, T) -> U,
    Op: Fn(U, U) -> U,
{
    debug_assert_eq!(a.len(), b.len());
    let mut acc = identity;
    let mut i = 0;
    while i < a.len() {
        let (ga, na) = a.chunk_at(i);
        let (gb, nb) = b.chunk_at(i);
        let n = na.min(nb);
        let va = make_checkout(ga, n, Mode::Read);
        let vb = make_checkout(gb, n, Mode::Read);
        for k in 0..n {
            acc = op(acc, map(va[k], vb[k]));
        }
        i += n;
    }
    acc
}

/// Map element pairs of two equal-length spans and reduce the results
/// (the dot-product shape)
pub fn transform_reduce<T, U, M, Op>(
    a: GlobalSpan<T>,
    b: GlobalSpan<T>,
    cutoff: usize,
    identity: U,
    map: M,
    op: Op,
) -> U
where
    T: Remotable,
    U: Remotable,
    M: Fn(T, T) -> U + Copy + Send + 'static,
    Op: Fn(U, U) -> U + Copy + Send + 'static,
{
    debug_assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return identity;
    }
    let cutoff = cutoff.max(1);
    if a.len() <= cutoff {
        poll();
        return serial_zip_fold(a, b, identity, map, op);
    }
    let mid = a.aligned_mid(block_elems::<T>());
    let (al, ar) = a.split_at(mid);
    let (bl, br) = b.split_at(mid);
    let (x, y) = parallel_invoke(
        move || transform_reduce(al, bl, cutoff, identity, map, op),
        move || transform_reduce(ar, br, cutoff, identity, map, op),
    );
    op(x, y)
}

fn for_each_index<F>(lo: usize, hi: usize, f: F)
where
    F: Fn(usize) + Copy + Send + 'static,
{
    if lo >= hi {
        return;
    }
    if hi - lo == 1 {
        f(lo);
        return;
    }
    let mid = lo + (hi - lo) / 2;
    parallel_invoke(
        move || for_each_index(lo, mid, f),
        move || for_each_index(mid, hi, f),
    );
}

fn serial_scan_block<T, Op>(
    input: GlobalSpan<T>,
    output: GlobalSpan<T>,
    carry: T,
    op: Op,
) -> T
where
    T: Remotable,
    Op: Fn(T, T) -> T,
{
    debug_assert_eq!(input.len(), output.len());
    let mut acc = carry;
    let mut i = 0;
    while i < input.len() {
        let (gi, ni) = input.chunk_at(i);
        let (go, no) = output.chunk_at(i);
        let n = ni.min(no);
        let vi = make_checkout(gi, n, Mode::Read);
        let mut vo = make_checkout(go, n, Mode::Write);
        for k in 0..n {
            acc = op(acc, vi[k]);
            vo[k] = acc;
        }
        i += n;
    }
    acc
}

/// Inclusive prefix scan of `input` into `output`; returns the total.
/// Three phases: parallel per-block sums into an auxiliary vector, a
/// serial exclusive scan of the (small) auxiliary, then a parallel
/// re-walk of every block with its carry.
///
/// The cutoff is rounded up to whole coherence blocks so output blocks
/// have exactly one writer; the auxiliary carries travel by direct RMA
/// (they are scratch, not user data).
pub fn inclusive_scan<T, Op>(
    input: GlobalSpan<T>,
    output: GlobalSpan<T>,
    cutoff: usize,
    identity: T,
    op: Op,
) -> T
where
    T: Remotable,
    Op: Fn(T, T) -> T + Copy + Send + 'static,
{
    debug_assert_eq!(input.len(), output.len());
    let len = input.len();
    if len == 0 {
        return identity;
    }
    let cutoff = cutoff.max(1).next_multiple_of(block_elems::<T>());
    let nblocks = len.div_ceil(cutoff);
    let sums = GlobalVec::<T>::new(nblocks);
    let ss = sums.span();

    for_each_index(0, nblocks, move |i| {
        let blk = input.subspan(i * cutoff, ((i + 1) * cutoff).min(len));
        let s = serial_reduce(blk, identity, op);
        direct_write(ss.gptr_at(i), s);
    });

    // exclusive scan of the block sums, serially in the calling task
    let mut carry = identity;
    for i in 0..nblocks {
        let s = direct_read(ss.gptr_at(i));
        direct_write(ss.gptr_at(i), carry);
        carry = op(carry, s);
    }
    let total = carry;

    for_each_index(0, nblocks, move |i| {
        let from = i * cutoff;
        let to = ((i + 1) * cutoff).min(len);
        let c = direct_read(ss.gptr_at(i));
        serial_scan_block(input.subspan(from, to), output.subspan(from, to), c, op);
    });

    total
}
