//! The distributed task scheduler: fork/join over migratable stack
//! frames, randomized work stealing, and the resume-flag race that
//! settles every join without central coordination.
//!
//! Coherence is piped through one [`SchedulerHooks`] contract: a lazy
//! release is captured when a continuation becomes stealable, the thief
//! acquires it, a dying task releases, a completed join acquires.
///
/// Copyright (c) 2020, Institute for Defense Analyses
/// 4850 Mark Center Drive, Alexandria, VA 22311-1882; 703-845-2500
///
/// All rights reserved.
///
/// This file is part of Portage, a PGAS tasking runtime for rust.  For
/// licence information see the LICENSE file in the top level dirctory
/// of the distribution.
use crate::cache::{self, ReleaseHandle};
use crate::context::{self, ContextFrame};
use crate::err::fatal;
use crate::galloc;
use crate::gptr::{GlobalPtr, Remotable, WinKind};
use crate::options::SchedulerKind;
use crate::rma::{self, IBarrier};
use crate::runtime::{self, CtrlSegment, Runtime, CMD_ARG_MAX};
use crate::wsq::WsqEntry;
use log::{debug, trace};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::mem::{offset_of, size_of, ManuallyDrop, MaybeUninit};
use std::ptr;

const OFF_ROOT_DONE: usize = offset_of!(CtrlSegment, root_done);
const OFF_CMD_SEQ: usize = offset_of!(CtrlSegment, cmd_seq);
const OFF_CMD_ACK: usize = offset_of!(CtrlSegment, cmd_ack);
const OFF_CMD_FN: usize = offset_of!(CtrlSegment, cmd_fn);
const OFF_CMD_INITIATOR: usize = offset_of!(CtrlSegment, cmd_initiator);
const OFF_CMD_ARG: usize = offset_of!(CtrlSegment, cmd_arg);
const OFF_MIG_STATE: usize = offset_of!(CtrlSegment, mig_state);
const OFF_MIG_FIELDS: usize = offset_of!(CtrlSegment, mig_evac_rank);

/// Worker-local scheduler state
#[derive(Debug)]
pub(crate) struct Worker {
    pub(crate) cf_top: Cell<*mut ContextFrame>,
    pub(crate) sched_cf: Cell<*mut ContextFrame>,
    pub(crate) in_root: Cell<bool>,
    pub(crate) spmd: Cell<bool>,
    pub(crate) depth: Cell<usize>,
    pub(crate) session: Cell<u64>,
    pub(crate) last_cmd: Cell<u64>,
    pub(crate) rng: RefCell<SmallRng>,
}

impl Worker {
    pub(crate) fn new(rank: usize) -> Worker {
        Worker {
            cf_top: Cell::new(ptr::null_mut()),
            sched_cf: Cell::new(ptr::null_mut()),
            in_root: Cell::new(false),
            spmd: Cell::new(true),
            depth: Cell::new(0),
            session: Cell::new(0),
            last_cmd: Cell::new(0),
            rng: RefCell::new(SmallRng::seed_from_u64(
                0x9e37_79b9_7f4a_7c15u64.wrapping_mul(rank as u64 + 1),
            )),
        }
    }
}

/// The named contract coupling the scheduler to the coherence layer.
/// The pattern library and the scheduler both depend on this interface
/// rather than on the cache type itself.
pub(crate) trait SchedulerHooks: std::fmt::Debug {
    /// Capture an epoch token before a continuation becomes stealable
    fn release_lazy(&self, rt: &Runtime) -> ReleaseHandle;
    /// Make the victim's writes visible on the thief
    fn acquire_stolen(&self, rt: &Runtime, rh: ReleaseHandle);
    /// Publish a dying task's writes before the join race settles
    fn before_die(&self, rt: &Runtime);
    /// Observe a joined child's writes
    fn after_join(&self, rt: &Runtime);
    /// Service deferred coherence work; a scheduling point
    fn poll(&self, rt: &Runtime);
}

/// Production hooks: the coherence cache
#[derive(Debug)]
pub(crate) struct CacheHooks;

impl SchedulerHooks for CacheHooks {
    fn release_lazy(&self, rt: &Runtime) -> ReleaseHandle {
        cache::release_lazy(rt)
    }
    fn acquire_stolen(&self, rt: &Runtime, rh: ReleaseHandle) {
        cache::acquire_handle(rt, rh);
    }
    fn before_die(&self, rt: &Runtime) {
        cache::release(rt);
    }
    fn after_join(&self, rt: &Runtime) {
        cache::acquire(rt);
    }
    fn poll(&self, rt: &Runtime) {
        runtime::poll(rt);
    }
}

// Worker-state accessors.  Deliberately never inlined: a cached
// thread-local address must not survive a context switch, since the
// frame may resume on another worker's thread.

#[inline(never)]
fn cf_top_get() -> *mut ContextFrame {
    runtime::with(|rt| rt.worker().cf_top.get())
}

#[inline(never)]
fn cf_top_set(p: *mut ContextFrame) {
    runtime::with(|rt| rt.worker().cf_top.set(p))
}

#[inline(never)]
fn sched_cf_set(p: *mut ContextFrame) {
    runtime::with(|rt| rt.worker().sched_cf.set(p))
}

#[inline(never)]
fn in_root_get() -> bool {
    runtime::with(|rt| rt.worker().in_root.get())
}

#[inline(never)]
fn in_root_set(v: bool) {
    runtime::with(|rt| rt.worker().in_root.set(v))
}

#[inline(never)]
fn depth_get() -> usize {
    runtime::with(|rt| rt.worker().depth.get())
}

#[inline(never)]
fn depth_set(d: usize) {
    runtime::with(|rt| rt.worker().depth.set(d))
}

#[inline(never)]
fn spmd_set(v: bool) {
    runtime::with(|rt| rt.worker().spmd.set(v))
}

/// True while the current execution context is the SPMD region
pub fn is_spmd() -> bool {
    runtime::with(|rt| rt.worker().spmd.get())
}

/// True while the current thread of execution is the root task lineage
pub fn is_root() -> bool {
    runtime::with(|rt| rt.worker().in_root.get())
}

/// A scheduling point inside long-running leaves: services deferred
/// coherence work without yielding the task.
#[inline(never)]
pub fn poll() {
    runtime::with(|rt| rt.hooks().poll(rt));
}

#[inline(never)]
fn release_fence() {
    runtime::with(|rt| rt.hooks().before_die(rt));
}

#[inline(never)]
fn acquire_fence() {
    runtime::with(|rt| rt.hooks().after_join(rt));
}

// Thread-state plumbing.  A TS is a heap record in the remotable slab of
// the forking rank; both sides of the join race reach it over RMA.

/// The evacuated image of a suspended joiner
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct SuspendedState {
    evac_rank: u64,
    evac_off: u64,
    frame_base: u64,
    frame_size: u64,
}

unsafe impl Remotable for SuspendedState {}

/// The record coordinating one fork/join race.  Lives in the remotable
/// slab and is only ever accessed through RMA at field offsets, never
/// constructed as a Rust value.
#[repr(C)]
#[allow(dead_code)]
pub(crate) struct ThreadState<T> {
    resume_flag: u32,
    _pad: u32,
    suspended: SuspendedState,
    retval: MaybeUninit<T>,
}

const OFF_TS_RESUME: usize = 0;
const OFF_TS_SUSPENDED: usize = 8;

fn ts_retval_off<T>() -> usize {
    offset_of!(ThreadState<T>, retval)
}

#[inline(never)]
fn ts_alloc<T>() -> GlobalPtr<u8> {
    runtime::with(|rt| {
        let g = galloc::slab_alloc(rt, WinKind::ThreadState, size_of::<ThreadState<T>>());
        // the slab recycles blocks; reset the race state
        let zero = [0u8; OFF_TS_SUSPENDED + size_of::<SuspendedState>()];
        rt.transport().put(
            rt.ts_win(),
            rt.rank(),
            g.offset(),
            zero.as_ptr(),
            zero.len(),
        );
        g
    })
}

#[inline(never)]
fn ts_free<T>(ts: GlobalPtr<u8>) {
    runtime::with(|rt| galloc::slab_free(rt, ts, size_of::<ThreadState<T>>()));
}

#[inline(never)]
fn ts_put_retval<T: Remotable>(ts: GlobalPtr<u8>, v: T) {
    runtime::with(|rt| {
        let w = rt.window(ts.win());
        rma::put_value(rt, w, ts.rank(), ts.offset() + ts_retval_off::<T>(), v);
        rt.transport().flush(w, ts.rank());
    })
}

#[inline(never)]
fn ts_get_retval<T: Remotable>(ts: GlobalPtr<u8>) -> T {
    runtime::with(|rt| rma::get_value(rt, rt.window(ts.win()), ts.rank(), ts.offset() + ts_retval_off::<T>()))
}

#[inline(never)]
fn ts_load_resume(ts: GlobalPtr<u8>) -> u32 {
    runtime::with(|rt| {
        rt.transport()
            .atomic_load_u32(rt.window(ts.win()), ts.rank(), ts.offset() + OFF_TS_RESUME)
    })
}

#[inline(never)]
fn ts_faa_resume(ts: GlobalPtr<u8>) -> u32 {
    runtime::with(|rt| {
        rma::faa_u32(
            rt,
            rt.window(ts.win()),
            ts.rank(),
            ts.offset() + OFF_TS_RESUME,
            1,
        )
    })
}

#[inline(never)]
fn ts_put_suspended(ts: GlobalPtr<u8>, ss: SuspendedState) {
    runtime::with(|rt| {
        let w = rt.window(ts.win());
        rma::put_value(rt, w, ts.rank(), ts.offset() + OFF_TS_SUSPENDED, ss);
        rt.transport().flush(w, ts.rank());
    })
}

#[inline(never)]
fn ts_get_suspended(ts: GlobalPtr<u8>) -> SuspendedState {
    runtime::with(|rt| rma::get_value(rt, rt.window(ts.win()), ts.rank(), ts.offset() + OFF_TS_SUSPENDED))
}

/// A forked child as seen by its parent: either already serialized into
/// an inline value (no steal happened), or pending in a thread state.
#[must_use = "a forked task must be joined"]
#[derive(Debug)]
pub struct ThreadHandle<T: Remotable> {
    state: GlobalPtr<u8>,
    serialized: bool,
    retval: MaybeUninit<T>,
}

// The scheduler's suspend: carve a frame for the continuation and run a
// closure on its child side.  Falling out of the closure, or resuming
// the frame from anywhere, returns control here.

fn suspend<F: FnOnce(*mut ContextFrame)>(f: F) {
    unsafe extern "C" fn tramp<F: FnOnce(*mut ContextFrame)>(
        cf: *mut ContextFrame,
        a0: *mut c_void,
        _a1: *mut c_void,
    ) {
        // move the closure into the child frame before running it
        let f = unsafe { ptr::read(a0 as *const F) };
        cf_top_set(cf);
        f(cf);
    }
    let prev_top = cf_top_get();
    let mut slot = ManuallyDrop::new(f);
    // SAFETY: prev_top is the frame boundary established by the previous
    // scheduling point; tramp consumes the closure exactly once
    unsafe {
        context::save_context_with_call(
            prev_top,
            tramp::<F>,
            &mut slot as *mut _ as *mut c_void,
            ptr::null_mut(),
        );
    }
    cf_top_set(prev_top);
}

#[inline(never)]
fn wsq_publish(e: WsqEntry) {
    runtime::with(|rt| {
        debug_assert!(
            rt.callstack().contains(e.frame_base as usize),
            "continuations must live on the callstack"
        );
        trace!(
            "rank {}: publish frame [{:#x}, {:#x}) epoch {}",
            rt.rank(),
            e.frame_base,
            e.frame_base + e.frame_size,
            e.epoch
        );
        rt.prof_fork();
        rt.wsq().push(rt.transport(), rt.ctrl_win(), rt.rank(), e);
    })
}

#[inline(never)]
fn wsq_try_pop() -> bool {
    runtime::with(|rt| rt.wsq().pop(rt.transport(), rt.ctrl_win(), rt.rank()).is_some())
}

/// Fork `f` as a child task.  The child runs immediately on this worker;
/// the parent's continuation is published for stealing.  On the fast
/// path (no steal) the handle comes back already serialized.
///
/// The closure and its captures cross ranks by raw byte copy when the
/// continuation is stolen, so captures must be self-contained plain data
/// (the `Remotable` discipline); references into frames outside the
/// current fork region must not be held across this call.
pub fn fork<T, F>(f: F) -> ThreadHandle<T>
where
    T: Remotable,
    F: FnOnce() -> T + Send,
{
    debug_assert!(!is_spmd(), "fork is only legal inside a parallel region");
    poll();
    let depth = depth_get();
    let serialize = runtime::with(|rt| {
        let o = rt.opts();
        o.scheduler == SchedulerKind::Adws && depth >= o.adws_max_depth
    });
    if serialize {
        // depth cutoff: run the child in place, nothing to steal
        return ThreadHandle {
            state: GlobalPtr::new(0, WinKind::ThreadState, 0),
            serialized: true,
            retval: MaybeUninit::new(f()),
        };
    }

    let ts = ts_alloc::<T>();
    let rh = runtime::with(|rt| rt.hooks().release_lazy(rt));
    let saved_root = in_root_get();
    let mut th = ThreadHandle::<T> {
        state: ts,
        serialized: false,
        retval: MaybeUninit::uninit(),
    };
    let th_ptr: *mut ThreadHandle<T> = &mut th;

    suspend(move |cf| {
        let size = ContextFrame::image_size(cf);
        wsq_publish(WsqEntry {
            frame_base: cf as u64,
            frame_size: size as u64,
            epoch: rh.epoch,
        });
        in_root_set(false);
        depth_set(depth + 1);
        let ret = f();
        if die::<T>(ts, ret) {
            // fast path: the continuation was still ours, so the parent
            // resumes by plain return; hand the value over inline
            ts_free::<T>(ts);
            // SAFETY: th lives in the parent frame of this same image
            unsafe {
                (*th_ptr).state = GlobalPtr::new(0, WinKind::ThreadState, 0);
                (*th_ptr).serialized = true;
                (*th_ptr).retval.write(ret);
            }
        }
    });

    // the continuation: possibly running on a different rank by now
    in_root_set(saved_root);
    depth_set(depth);
    th
}

/// Terminate the current child.  Returns true on the fast path (the
/// parent continuation was not stolen and the caller unwinds by plain
/// return); on the slow path control leaves for the scheduler or the
/// suspended joiner and never comes back.
fn die<T: Remotable>(ts: GlobalPtr<u8>, ret: T) -> bool {
    if wsq_try_pop() {
        return true;
    }
    // the continuation was stolen: settle the race through the TS
    release_fence();
    ts_put_retval::<T>(ts, ret);
    if ts_faa_resume(ts) == 0 {
        debug!("die: won the join race, yielding to the scheduler");
        resume_sched()
    } else {
        debug!("die: joiner already suspended, resuming its evacuation");
        let ss = ts_get_suspended(ts);
        resume_evacuated(ss)
    }
}

/// Join a forked child, returning its value.  Suspends and yields to the
/// scheduler when the child has not finished; the dying child then
/// resumes the evacuated continuation wherever it runs.
pub fn join<T: Remotable>(th: ThreadHandle<T>) -> T {
    if th.serialized {
        // SAFETY: serialized handles always carry a written value
        return unsafe { th.retval.assume_init() };
    }
    let ts = th.state;
    poll();
    if ts_load_resume(ts) >= 1 {
        trace!("join: child already completed");
        let ret = ts_get_retval::<T>(ts);
        acquire_fence();
        ts_free::<T>(ts);
        return ret;
    }

    // these travel with the frame; the worker resuming it may differ
    let saved_root = in_root_get();
    let saved_depth = depth_get();
    suspend(move |cf| {
        let size = ContextFrame::image_size(cf);
        let ss = evacuate(cf, size);
        ts_put_suspended(ts, ss);
        if ts_faa_resume(ts) == 0 {
            debug!("join: suspended first, yielding to the scheduler");
            resume_sched()
        } else {
            // the child finished while we evacuated; take our own frame
            // back in place
            evac_free_local(ss);
            // SAFETY: cf is this worker's live frame
            unsafe { context::resume(cf) }
        }
    });

    // resumed: by the dying child (possibly after a migration of this
    // frame to its rank) or by ourselves on the lost race
    in_root_set(saved_root);
    depth_set(saved_depth);
    let ret = ts_get_retval::<T>(ts);
    acquire_fence();
    ts_free::<T>(ts);
    ret
}

#[inline(never)]
fn evacuate(cf: *mut ContextFrame, size: usize) -> SuspendedState {
    runtime::with(|rt| {
        let g = galloc::slab_alloc(rt, WinKind::Evac, size);
        let dst = rt.evac_win().base() as usize + g.offset();
        // SAFETY: the evacuation block was just reserved for `size` bytes
        unsafe { ptr::copy_nonoverlapping(cf as *const u8, dst as *mut u8, size) };
        rt.transport().flush(rt.evac_win(), rt.rank());
        trace!(
            "rank {}: evacuated frame [{:#x}, {:#x}) to slab offset {:#x}",
            rt.rank(),
            cf as usize,
            cf as usize + size,
            g.offset()
        );
        SuspendedState {
            evac_rank: rt.rank() as u64,
            evac_off: g.offset() as u64,
            frame_base: cf as u64,
            frame_size: size as u64,
        }
    })
}

#[inline(never)]
fn evac_free_local(ss: SuspendedState) {
    runtime::with(|rt| {
        debug_assert_eq!(ss.evac_rank as usize, rt.rank());
        rt.evac_slab()
            .borrow_mut()
            .free_local(ss.evac_off as usize, ss.frame_size as usize);
    })
}

#[inline(never)]
fn resume_sched() -> ! {
    let sc = runtime::with(|rt| {
        rt.worker().cf_top.set(ptr::null_mut());
        rt.worker().sched_cf.get()
    });
    debug_assert!(!sc.is_null());
    // SAFETY: sched_cf always holds the live scheduler continuation of
    // this worker
    unsafe { context::resume(sc) }
}

// Resuming an evacuation: the frame image lands at the same offset
// within this worker's callstack; with equal stack bases that is the
// original address (the positional mode), otherwise the image is
// relocated by the documented fixup rule.  Only register-passed values
// survive the stack switch, so the descriptor goes through a pinned
// thread-local staging slot.

#[derive(Debug, Default)]
struct ResumeStaging {
    evac_rank: Cell<u64>,
    evac_off: Cell<u64>,
    size: Cell<u64>,
    orig_base: Cell<u64>,
    target: Cell<u64>,
}

thread_local! {
    static STAGING: ResumeStaging = ResumeStaging::default();
}

#[inline(never)]
fn staging_store(ss: SuspendedState, target: usize) {
    STAGING.with(|s| {
        s.evac_rank.set(ss.evac_rank);
        s.evac_off.set(ss.evac_off);
        s.size.set(ss.frame_size);
        s.orig_base.set(ss.frame_base);
        s.target.set(target as u64);
    });
}

#[inline(never)]
fn staging_load() -> (usize, usize, usize, usize, usize) {
    STAGING.with(|s| {
        (
            s.evac_rank.get() as usize,
            s.evac_off.get() as usize,
            s.size.get() as usize,
            s.orig_base.get() as usize,
            s.target.get() as usize,
        )
    })
}

fn resume_evacuated(ss: SuspendedState) -> ! {
    let (target, feasible) = runtime::with(|rt| {
        let home = rt.stack_base_of(ss.evac_rank as usize);
        let mine = rt.stack_base_of(rt.rank());
        let target = mine + (ss.frame_base as usize - home);
        (target, home == mine || rt.transport().shared_address_space())
    });
    if !feasible {
        fatal!(
            "cannot resume a continuation whose home callstack base differs; \
             run with matching stack bases (disable address randomization)"
        );
    }
    staging_store(ss, target);
    // SAFETY: target is within this worker's callstack; the landing pad
    // rebuilds the frame above its own stack position
    unsafe { context::call_on_stack(target, evac_landing, ptr::null_mut()) }
}

unsafe extern "C" fn evac_landing(_a0: *mut c_void, _a1: *mut c_void, _a2: *mut c_void) -> ! {
    let (rank, off, size, orig, target) = staging_load();
    fetch_evacuation(rank, off, size, target);
    let delta = target.wrapping_sub(orig);
    if delta != 0 {
        // SAFETY: the image was just written at target
        unsafe { relocate_frame(target, size, orig, delta) };
    }
    // SAFETY: the image is a valid frame at its landing address
    unsafe { context::resume(target as *mut ContextFrame) }
}

#[inline(never)]
fn fetch_evacuation(rank: usize, off: usize, size: usize, target: usize) {
    runtime::with(|rt| {
        rt.prof_rma_get(size);
        rt.transport()
            .get(rt.evac_win(), rank, off, target as *mut u8, size);
        galloc::slab_free(rt, GlobalPtr::new(rank, WinKind::Evac, off), size);
    })
}

/// The relocation fixup: every naturally aligned word whose value lies
/// within the original image is rebased by the stack delta.  The end
/// boundary is included because the parent link and the restored frame
/// top point one past the image.  Words pointing elsewhere are left
/// alone; they stay valid in a shared address space, which is the only
/// configuration where a nonzero delta is accepted.
unsafe fn relocate_frame(base: usize, size: usize, orig: usize, delta: usize) {
    let words = size / size_of::<usize>();
    for i in 0..words {
        let p = (base + i * size_of::<usize>()) as *mut usize;
        // SAFETY: in-bounds of the landed image
        let v = unsafe { *p };
        if v >= orig && v <= orig + size {
            unsafe { *p = v.wrapping_add(delta) };
        }
    }
}

// The scheduling loop and stealing.

fn draw_victim(rt: &Runtime) -> usize {
    let n = rt.n_ranks();
    debug_assert!(n > 1);
    let mut rng = rt.worker().rng.borrow_mut();
    let mut rank = Uniform::from(0..n - 1).sample(&mut *rng);
    if rank >= rt.rank() {
        rank += 1;
    }
    rank
}

fn try_steal(rt: &Runtime) {
    let victim = draw_victim(rt);
    if rt.stack_base_of(victim) != rt.stack_base_of(rt.rank())
        && !rt.transport().shared_address_space()
    {
        // positional frames cannot land here; reject this victim
        return;
    }
    let t0 = rt.prof_clock_ns();
    let wsq = rt.wsq();
    let t = rt.transport();
    let ctrl = rt.ctrl_win();
    if wsq.empty(t, ctrl, victim) {
        return;
    }
    if !wsq.trylock(t, ctrl, victim) {
        rt.prof_steal(false, t0);
        return;
    }
    let entry = wsq.steal_nolock(t, ctrl, victim);
    let Some(e) = entry else {
        wsq.unlock(t, ctrl, victim);
        rt.prof_steal(false, t0);
        return;
    };
    let home = rt.stack_base_of(victim);
    let off = e.frame_base as usize - home;
    let size = e.frame_size as usize;
    let target = rt.stack_base_of(rt.rank()) + off;
    rt.prof_rma_get(size);
    t.get(rt.stack_win(), victim, off, target as *mut u8, size);
    wsq.unlock(t, ctrl, victim);
    debug!(
        "rank {}: stole frame [{:#x}, {:#x}) from rank {}",
        rt.rank(),
        e.frame_base,
        e.frame_base + e.frame_size,
        victim
    );
    let delta = target.wrapping_sub(e.frame_base as usize);
    if delta != 0 {
        // SAFETY: the image was just copied to target
        unsafe { relocate_frame(target, size, e.frame_base as usize, delta) };
    }
    rt.prof_steal_success_bytes(size as u64);
    rt.prof_steal(true, t0);
    rt.hooks().acquire_stolen(
        rt,
        ReleaseHandle {
            rank: victim,
            epoch: e.epoch,
        },
    );
    suspend(move |cf| {
        sched_cf_set(cf);
        // SAFETY: the stolen image is a valid frame at target
        unsafe { context::resume(target as *mut ContextFrame) }
    });
    // the stolen task (or its whole lineage) completed or yielded; back
    // to the scheduling loop
}

fn maybe_run_migration() {
    let pending = runtime::with(|rt| {
        let t = rt.transport();
        if t.atomic_load_u64(rt.ctrl_win(), rt.rank(), OFF_MIG_STATE) != 2 {
            return None;
        }
        let ss: SuspendedState = rma::get_value(rt, rt.ctrl_win(), rt.rank(), OFF_MIG_FIELDS);
        t.atomic_store_u64(rt.ctrl_win(), rt.rank(), OFF_MIG_STATE, 0);
        Some(ss)
    });
    if let Some(ss) = pending {
        debug!("accepting a migrated continuation");
        suspend(move |cf| {
            sched_cf_set(cf);
            resume_evacuated(ss)
        });
    }
}

fn maybe_run_command() {
    let pending = runtime::with(|rt| {
        let t = rt.transport();
        let seq = t.atomic_load_u64(rt.ctrl_win(), rt.rank(), OFF_CMD_SEQ);
        if seq <= rt.worker().last_cmd.get() {
            return None;
        }
        rt.worker().last_cmd.set(seq);
        let fnp: u64 = rma::get_value(rt, rt.ctrl_win(), rt.rank(), OFF_CMD_FN);
        let initiator: u64 = rma::get_value(rt, rt.ctrl_win(), rt.rank(), OFF_CMD_INITIATOR);
        let mut arg = [0u8; CMD_ARG_MAX];
        rt.prof_rma_get(CMD_ARG_MAX);
        t.get(
            rt.ctrl_win(),
            rt.rank(),
            OFF_CMD_ARG,
            arg.as_mut_ptr(),
            CMD_ARG_MAX,
        );
        Some((fnp, initiator as usize, arg))
    });
    if let Some((fnp, initiator, arg)) = pending {
        acquire_fence();
        // SAFETY: the initiator wrote the monomorphized trampoline for
        // the closure bytes in arg; code addresses agree across ranks
        // (one shared binary, shared or equal address layout)
        let tramp: unsafe extern "C" fn(*const u8) = unsafe { std::mem::transmute(fnp as usize) };
        unsafe { tramp(arg.as_ptr()) };
        release_fence();
        runtime::with(|rt| {
            rma::faa_u64(rt, rt.ctrl_win(), initiator, OFF_CMD_ACK, 1);
        });
    }
}

#[inline(never)]
fn root_done() -> bool {
    runtime::with(|rt| {
        rt.transport()
            .atomic_load_u32(rt.ctrl_win(), rt.rank(), OFF_ROOT_DONE)
            != 0
    })
}

fn steal_allowed(rt: &Runtime) -> bool {
    if rt.n_ranks() < 2 {
        return false;
    }
    match rt.opts().scheduler {
        SchedulerKind::RandWs => true,
        SchedulerKind::Adws => rt.opts().adws_enable_steal,
    }
}

/// Drive this worker until the root task has completed everywhere: poll,
/// accept migrations and collective commands, and keep stealing — even
/// after entering the termination barrier, which is how stragglers get
/// drained.
pub(crate) fn sched_loop() {
    let session = runtime::with(|rt| {
        let s = rt.worker().session.get() + 1;
        rt.worker().session.set(s);
        s
    });
    debug!("entering the scheduling loop, session {}", session);
    let mut exit_req: Option<IBarrier> = None;
    loop {
        poll();
        maybe_run_migration();
        maybe_run_command();
        if exit_req.is_none() && root_done() {
            exit_req = Some(runtime::with(|rt| IBarrier::enter(rt, session)));
        }
        if let Some(b) = exit_req {
            if runtime::with(|rt| b.test(rt)) {
                break;
            }
        }
        let stealing = runtime::with(steal_allowed);
        if stealing {
            runtime::with(try_steal);
        }
        std::thread::yield_now();
    }
    debug!("leaving the scheduling loop, session {}", session);
}

// The root driver.

fn on_root_die<T: Remotable>(ts: GlobalPtr<u8>, ret: T) -> ! {
    release_fence();
    ts_put_retval::<T>(ts, ret);
    ts_faa_resume(ts);
    runtime::with(|rt| {
        for r in 0..rt.n_ranks() {
            rt.transport()
                .atomic_store_u32(rt.ctrl_win(), r, OFF_ROOT_DONE, 1);
        }
    });
    resume_sched()
}

unsafe extern "C" fn root_entry<T, F>(a0: *mut c_void, _a1: *mut c_void, _a2: *mut c_void) -> !
where
    T: Remotable,
    F: FnOnce() -> T + Send,
{
    // move the payload off the system stack before the scheduler reuses it
    let (f, ts) = unsafe { ptr::read(a0 as *const (F, GlobalPtr<u8>)) };
    in_root_set(true);
    debug!("root task starting");
    let ret = f();
    debug!("root task completed");
    in_root_set(false);
    on_root_die::<T>(ts, ret)
}

/// Collective parallel-region entry: rank 0 runs `f` as the root task on
/// its callstack, every rank drives the scheduling loop until global
/// termination, and the root's value is fanned out so all ranks return
/// it.
pub fn root_exec<T, F>(f: F) -> T
where
    T: Remotable,
    F: FnOnce() -> T + Send,
{
    debug_assert!(is_spmd(), "root_exec is a collective SPMD call");
    release_fence();
    spmd_set(false);
    let me = runtime::with(|rt| rt.rank());
    let mut ts_opt: Option<GlobalPtr<u8>> = None;
    if me == 0 {
        let ts = ts_alloc::<T>();
        ts_opt = Some(ts);
        let bottom = runtime::with(|rt| rt.callstack().bottom());
        let mut slot = ManuallyDrop::new((f, ts));
        let slot_ptr = &mut slot as *mut _ as *mut c_void;
        suspend(move |cf| {
            sched_cf_set(cf);
            cf_top_set(bottom as *mut ContextFrame);
            // SAFETY: the callstack bottom has the whole buffer below it;
            // root_entry consumes the payload exactly once
            unsafe { context::call_on_stack(bottom, root_entry::<T, F>, slot_ptr) }
        });
        // the root task yielded for the first time, or already finished
    }
    sched_loop();

    let mut ret = MaybeUninit::<T>::uninit();
    if me == 0 {
        let ts = ts_opt.unwrap();
        ret.write(ts_get_retval::<T>(ts));
        ts_free::<T>(ts);
    }
    runtime::with(|rt| {
        rt.transport()
            .atomic_store_u32(rt.ctrl_win(), rt.rank(), OFF_ROOT_DONE, 0);
        rt.transport().barrier();
        if size_of::<T>() > 0 {
            // SAFETY: rank 0 initialized ret; other ranks receive it here
            let bytes = unsafe {
                std::slice::from_raw_parts_mut(ret.as_mut_ptr() as *mut u8, size_of::<T>())
            };
            rt.transport().broadcast(0, bytes);
        }
    });
    acquire_fence();
    spmd_set(true);
    // SAFETY: written on rank 0, broadcast everywhere else
    unsafe { ret.assume_init() }
}

/// Move the current task to `target_rank`: evacuate the continuation,
/// deposit it in the target's mailbox, and yield.  Bracketed by a
/// release/acquire pair so the task's view of global memory moves with
/// it.
///
/// Root task only: a forked child's deque pairing stays on the worker
/// that forked it, so only the root lineage may change workers this way.
pub fn migrate_to(target_rank: usize) {
    debug_assert!(!is_spmd(), "migrate_to is only legal inside a parallel region");
    debug_assert!(is_root(), "only the root task may migrate explicitly");
    let (me, n) = runtime::with(|rt| (rt.rank(), rt.n_ranks()));
    if target_rank == me {
        return;
    }
    if target_rank >= n {
        fatal!("migrate_to({}) with {} ranks", target_rank, n);
    }
    release_fence();
    let saved_root = in_root_get();
    let saved_depth = depth_get();
    suspend(move |cf| {
        let size = ContextFrame::image_size(cf);
        let ss = evacuate(cf, size);
        mailbox_deposit(target_rank, ss);
        resume_sched()
    });
    in_root_set(saved_root);
    depth_set(saved_depth);
    acquire_fence();
}

/// Move the current task to the master rank (rank 0)
pub fn migrate_to_master() {
    migrate_to(0);
}

#[inline(never)]
fn mailbox_deposit(target: usize, ss: SuspendedState) {
    runtime::with(|rt| {
        let t = rt.transport();
        let ctrl = rt.ctrl_win();
        // claim the single mailbox slot: 0 empty, 1 filling, 2 ready
        loop {
            if rma::cas_u64(rt, ctrl, target, OFF_MIG_STATE, 0, 1) == 0 {
                break;
            }
            runtime::poll(rt);
            std::thread::yield_now();
        }
        rma::put_value(rt, ctrl, target, OFF_MIG_FIELDS, ss);
        t.flush(ctrl, target);
        t.atomic_store_u64(ctrl, target, OFF_MIG_STATE, 2);
        debug!("deposited continuation in rank {}'s mailbox", target);
    })
}

/// Run `f` simultaneously on every rank from within the root task.  The
/// closure is shipped by byte copy (at most [`CMD_ARG_MAX`] bytes) with
/// its monomorphized trampoline; each rank acquires before running it
/// and releases afterwards.
pub fn coll_exec<F>(f: F)
where
    F: Fn() + Copy + Send + 'static,
{
    debug_assert!(!is_spmd(), "coll_exec is called from within a root task");
    if size_of::<F>() > CMD_ARG_MAX {
        fatal!(
            "coll_exec closure captures {} bytes, limit {}",
            size_of::<F>(),
            CMD_ARG_MAX
        );
    }
    unsafe extern "C" fn cmd_tramp<F: Fn() + Copy>(arg: *const u8) {
        // copy, not move: every rank gets its own closure instance
        let f = unsafe { ptr::read(arg as *const F) };
        f();
    }
    release_fence();
    let (me, n) = runtime::with(|rt| (rt.rank(), rt.n_ranks()));
    runtime::with(|rt| {
        let t = rt.transport();
        let ctrl = rt.ctrl_win();
        for r in 0..n {
            if r == me {
                continue;
            }
            let mut arg = [0u8; CMD_ARG_MAX];
            // SAFETY: F is Copy and fits the slot
            unsafe {
                ptr::copy_nonoverlapping(&f as *const F as *const u8, arg.as_mut_ptr(), size_of::<F>())
            };
            rt.prof_rma_put(CMD_ARG_MAX);
            t.put(ctrl, r, OFF_CMD_ARG, arg.as_ptr(), CMD_ARG_MAX);
            let tramp: unsafe extern "C" fn(*const u8) = cmd_tramp::<F>;
            rma::put_value(rt, ctrl, r, OFF_CMD_FN, tramp as usize as u64);
            rma::put_value(rt, ctrl, r, OFF_CMD_INITIATOR, me as u64);
            t.flush(ctrl, r);
            rma::faa_u64(rt, ctrl, r, OFF_CMD_SEQ, 1);
        }
    });
    f();
    // publish this rank's execution like every other participant's
    release_fence();
    // wait for every other rank to run its copy
    loop {
        let acks = runtime::with(|rt| {
            rt.transport()
                .atomic_load_u64(rt.ctrl_win(), rt.rank(), OFF_CMD_ACK)
        });
        if acks as usize == n - 1 {
            break;
        }
        poll();
        std::thread::yield_now();
    }
    runtime::with(|rt| {
        rt.transport()
            .atomic_store_u64(rt.ctrl_win(), rt.rank(), OFF_CMD_ACK, 0)
    });
    acquire_fence();
}
