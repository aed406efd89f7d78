//! Runtime wiring: the per-rank control segment, collective init/fini,
//! topology queries, and the thread-local handle every component reaches
//! the runtime through.
///
/// Copyright (c) 2020, Institute for Defense Analyses
/// 4850 Mark Center Drive, Alexandria, VA 22311-1882; 703-845-2500
///
/// All rights reserved.
///
/// This file is part of Portage, a PGAS tasking runtime for rust.  For
/// licence information see the LICENSE file in the top level dirctory
/// of the distribution.
use crate::cache::{self, Cache};
use crate::err::fatal;
use crate::galloc::{self, Slab};
use crate::gptr::WinKind;
use crate::options::Options;
use crate::profiler::Counters;
use crate::rma::{local::LocalDomain, local::LocalTransport, Transport, Window};
use crate::sched::{CacheHooks, SchedulerHooks, Worker};
use crate::stack::Callstack;
use crate::wallclock::Wallclock;
use crate::wsq::{Wsq, WsqEntry};
use log::info;
use std::cell::{Cell, RefCell};
use std::mem::{offset_of, size_of};
use std::rc::Rc;
use std::sync::Arc;

/// Heap size classes tracked by the collective allocator
pub(crate) const NUM_SIZE_CLASSES: usize = 48;
/// Capacity of the remote-free ring in each control segment
pub(crate) const FREE_RING_CAP: usize = 256;
/// Largest closure the collective-execution command slot carries
pub(crate) const CMD_ARG_MAX: usize = 256;

/// One queued remote free: (offset, length, slab kind), stamped when
/// complete.  Like the control segment, a layout mirror reached through
/// RMA offsets only.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
pub(crate) struct FreeMsg {
    pub(crate) off: u64,
    pub(crate) len: u64,
    pub(crate) kind: u64,
    pub(crate) stamp: u64,
}

/// The fixed head of every rank's control window.  All cross-rank
/// coordination state lives here at known offsets: the work-stealing
/// deque indices, the termination counter, release epochs, the
/// collective-exec command slot, the migration mailbox, the collective
/// heap books (rank 0), and the remote-free ring.  The deque entry array
/// and the profiler gather slots follow the segment.
#[repr(C)]
#[derive(Debug)]
#[allow(dead_code)]
pub(crate) struct CtrlSegment {
    pub(crate) wsq_lock: u64,
    pub(crate) wsq_top: u64,
    pub(crate) wsq_base: u64,
    pub(crate) ibarrier_count: u64,
    pub(crate) released_epoch: u64,
    pub(crate) cmd_seq: u64,
    pub(crate) cmd_ack: u64,
    pub(crate) cmd_fn: u64,
    pub(crate) cmd_initiator: u64,
    pub(crate) heap_lock: u64,
    pub(crate) heap_bump: u64,
    pub(crate) mig_state: u64,
    pub(crate) mig_evac_rank: u64,
    pub(crate) mig_evac_off: u64,
    pub(crate) mig_frame_base: u64,
    pub(crate) mig_frame_size: u64,
    pub(crate) free_tail: u64,
    pub(crate) free_head: u64,
    pub(crate) release_requested: u32,
    pub(crate) root_done: u32,
    pub(crate) heap_free: [u64; NUM_SIZE_CLASSES],
    pub(crate) cmd_arg: [u8; CMD_ARG_MAX],
    pub(crate) free_ring: [FreeMsg; FREE_RING_CAP],
}

/// How the runtime joins its process group
#[derive(Debug)]
pub enum ProcessGroup {
    /// thread-backed ranks sharing one address space
    Local {
        /// the shared domain all rank threads register with
        domain: Arc<LocalDomain>,
        /// this thread's rank within the domain
        rank: usize,
    },
    /// OpenSHMEM processes (requires the `shmem` feature)
    #[cfg(feature = "shmem")]
    Shmem,
}

/// Everything one worker owns.  Reached through [`with`]; never captured
/// inside task frames, which migrate between workers.
pub(crate) struct Runtime {
    transport: Box<dyn Transport>,
    opts: Options,
    rank: usize,
    n_ranks: usize,
    ctrl: Window,
    heap: Window,
    ts_window: Window,
    evac_window: Window,
    stack_window: Window,
    callstack: Callstack,
    stack_bases: Vec<usize>,
    wsq: Wsq,
    cache: RefCell<Cache>,
    ts_slab: RefCell<Slab>,
    evac_slab: RefCell<Slab>,
    worker: Worker,
    hooks: Box<dyn SchedulerHooks>,
    prof: RefCell<Counters>,
    prof_enabled: Cell<bool>,
    clock: Wallclock,
    prof_off: usize,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("rank", &self.rank)
            .field("n_ranks", &self.n_ranks)
            .finish()
    }
}

impl Runtime {
    pub(crate) fn transport(&self) -> &dyn Transport {
        &*self.transport
    }
    pub(crate) fn opts(&self) -> &Options {
        &self.opts
    }
    pub(crate) fn rank(&self) -> usize {
        self.rank
    }
    pub(crate) fn n_ranks(&self) -> usize {
        self.n_ranks
    }
    pub(crate) fn ctrl_win(&self) -> &Window {
        &self.ctrl
    }
    pub(crate) fn heap_win(&self) -> &Window {
        &self.heap
    }
    pub(crate) fn ts_win(&self) -> &Window {
        &self.ts_window
    }
    pub(crate) fn evac_win(&self) -> &Window {
        &self.evac_window
    }
    pub(crate) fn stack_win(&self) -> &Window {
        &self.stack_window
    }
    pub(crate) fn window(&self, kind: WinKind) -> &Window {
        match kind {
            WinKind::Heap => &self.heap,
            WinKind::ThreadState => &self.ts_window,
            WinKind::Evac => &self.evac_window,
        }
    }
    pub(crate) fn callstack(&self) -> Callstack {
        self.callstack
    }
    pub(crate) fn stack_base_of(&self, rank: usize) -> usize {
        self.stack_bases[rank]
    }
    pub(crate) fn wsq(&self) -> &Wsq {
        &self.wsq
    }
    pub(crate) fn cache(&self) -> &RefCell<Cache> {
        &self.cache
    }
    pub(crate) fn ts_slab(&self) -> &RefCell<Slab> {
        &self.ts_slab
    }
    pub(crate) fn evac_slab(&self) -> &RefCell<Slab> {
        &self.evac_slab
    }
    pub(crate) fn worker(&self) -> &Worker {
        &self.worker
    }
    pub(crate) fn hooks(&self) -> &dyn SchedulerHooks {
        &*self.hooks
    }
    pub(crate) fn clock_ns(&self) -> u64 {
        self.clock.now_ns()
    }
    pub(crate) fn ctrl_off_ibarrier(&self) -> usize {
        offset_of!(CtrlSegment, ibarrier_count)
    }
    pub(crate) fn prof_slot_off(&self, rank: usize) -> usize {
        self.prof_off + rank * size_of::<Counters>()
    }
    pub(crate) fn prof_counters(&self) -> &RefCell<Counters> {
        &self.prof
    }
    pub(crate) fn set_prof_enabled(&self, v: bool) {
        self.prof_enabled.set(v);
    }

    pub(crate) fn prof_rma_get(&self, bytes: usize) {
        if self.prof_enabled.get() {
            let mut c = self.prof.borrow_mut();
            c.rma_get_calls += 1;
            c.rma_get_bytes += bytes as u64;
        }
    }
    pub(crate) fn prof_rma_put(&self, bytes: usize) {
        if self.prof_enabled.get() {
            let mut c = self.prof.borrow_mut();
            c.rma_put_calls += 1;
            c.rma_put_bytes += bytes as u64;
        }
    }
    pub(crate) fn prof_rma_cas(&self) {
        if self.prof_enabled.get() {
            self.prof.borrow_mut().rma_cas_calls += 1;
        }
    }
    pub(crate) fn prof_rma_faa(&self) {
        if self.prof_enabled.get() {
            self.prof.borrow_mut().rma_faa_calls += 1;
        }
    }
    pub(crate) fn prof_cache_hit(&self) {
        if self.prof_enabled.get() {
            self.prof.borrow_mut().cache_hits += 1;
        }
    }
    pub(crate) fn prof_cache_miss(&self) {
        if self.prof_enabled.get() {
            self.prof.borrow_mut().cache_misses += 1;
        }
    }
    pub(crate) fn prof_cache_writeback(&self) {
        if self.prof_enabled.get() {
            self.prof.borrow_mut().cache_writebacks += 1;
        }
    }
    pub(crate) fn prof_release(&self) {
        if self.prof_enabled.get() {
            self.prof.borrow_mut().releases += 1;
        }
    }
    pub(crate) fn prof_acquire(&self) {
        if self.prof_enabled.get() {
            self.prof.borrow_mut().acquires += 1;
        }
    }
    pub(crate) fn prof_fork(&self) {
        if self.prof_enabled.get() {
            self.prof.borrow_mut().tasks_forked += 1;
        }
    }
    pub(crate) fn prof_steal_success_bytes(&self, bytes: u64) {
        if self.prof_enabled.get() {
            self.prof.borrow_mut().frames_stolen_bytes += bytes;
        }
    }
    pub(crate) fn prof_clock_ns(&self) -> u64 {
        if self.prof_enabled.get() {
            self.clock.now_ns()
        } else {
            0
        }
    }
    pub(crate) fn prof_steal(&self, success: bool, t0: u64) {
        if self.prof_enabled.get() {
            let dt = self.clock.now_ns().saturating_sub(t0);
            let mut c = self.prof.borrow_mut();
            if success {
                c.steal_success += 1;
                c.steal_success_ns += dt;
            } else {
                c.steal_fail += 1;
                c.steal_fail_ns += dt;
            }
        }
    }

}

thread_local! {
    static RT: RefCell<Option<Rc<Runtime>>> = const { RefCell::new(None) };
    static INIT_COUNT: Cell<u32> = const { Cell::new(0) };
}

/// Run `f` against this worker's runtime.
///
/// Never inlined: task frames migrate between worker threads, so the
/// thread-local lookup must re-execute after every scheduling point.
#[inline(never)]
pub(crate) fn with<R>(f: impl FnOnce(&Runtime) -> R) -> R {
    let rt = RT.with(|c| c.borrow().clone());
    match rt {
        Some(rt) => f(&rt),
        None => fatal!("the runtime is not initialized on this thread"),
    }
}

/// Collectively initialize the runtime with options from the
/// environment.  Must be the first call on every rank; idempotent while
/// balanced with [`fini`].
pub fn init(group: ProcessGroup) -> crate::Result<()> {
    init_with_options(group, Options::from_env()?)
}

/// Collectively initialize the runtime with explicit options
pub fn init_with_options(group: ProcessGroup, opts: Options) -> crate::Result<()> {
    opts.validate()?;
    if INIT_COUNT.with(|c| c.get()) > 0 {
        INIT_COUNT.with(|c| c.set(c.get() + 1));
        return Ok(());
    }
    let transport: Box<dyn Transport> = match group {
        ProcessGroup::Local { domain, rank } => Box::new(LocalTransport::new(domain, rank)?),
        #[cfg(feature = "shmem")]
        ProcessGroup::Shmem => Box::new(crate::rma::shmem::ShmemTransport::new()?),
    };
    let rank = transport.my_rank();
    let n_ranks = transport.n_ranks();
    let cap = opts.active_wsqueue_capacity();
    let entries_off = size_of::<CtrlSegment>();
    let prof_off = entries_off + cap * size_of::<WsqEntry>();
    let ctrl_size = prof_off + n_ranks * size_of::<Counters>();

    let ctrl = transport.create_window(ctrl_size)?;
    let heap = transport.create_window(opts.heap_size)?;
    let ts_window = transport.create_window(opts.thread_state_allocator_size)?;
    let evac_window = transport.create_window(opts.suspended_thread_allocator_size)?;
    let stack_window = transport.create_window(opts.stack_size)?;

    // every rank learns every callstack base; steals check them for the
    // positional landing requirement
    let mut stack_bases = Vec::with_capacity(n_ranks);
    for r in 0..n_ranks {
        let mut buf = if r == rank {
            (stack_window.base() as u64).to_ne_bytes()
        } else {
            [0u8; 8]
        };
        transport.broadcast(r, &mut buf);
        stack_bases.push(u64::from_ne_bytes(buf) as usize);
    }
    transport.barrier();
    let clock = Wallclock::anchor();

    let callstack = Callstack::new(&stack_window);
    let rt = Rc::new(Runtime {
        rank,
        n_ranks,
        callstack,
        stack_bases,
        wsq: Wsq::new(cap, entries_off),
        cache: RefCell::new(Cache::new(opts.cache_block_size, opts.cache_size)),
        ts_slab: RefCell::new(Slab::new(
            WinKind::ThreadState,
            opts.thread_state_allocator_size,
        )),
        evac_slab: RefCell::new(Slab::new(WinKind::Evac, opts.suspended_thread_allocator_size)),
        worker: Worker::new(rank),
        hooks: Box::new(CacheHooks),
        prof: RefCell::new(Counters::default()),
        prof_enabled: Cell::new(false),
        clock,
        prof_off,
        ctrl,
        heap,
        ts_window,
        evac_window,
        stack_window,
        transport,
        opts,
    });
    info!(
        "portage initialized: rank {} of {}, {} byte callstack",
        rank,
        n_ranks,
        rt.opts.stack_size
    );
    RT.with(|c| *c.borrow_mut() = Some(rt));
    INIT_COUNT.with(|c| c.set(1));
    Ok(())
}

/// Collectively tear the runtime down, in reverse creation order.  Only
/// the call balancing the first `init` finalizes anything; a transport
/// initialized outside the runtime is left alone.
pub fn fini() {
    let count = INIT_COUNT.with(|c| c.get());
    if count == 0 {
        return;
    }
    INIT_COUNT.with(|c| c.set(count - 1));
    if count > 1 {
        return;
    }
    let rt = RT.with(|c| c.borrow_mut().take());
    let Some(rt) = rt else { return };
    rt.transport.barrier();
    rt.transport.destroy_window(&rt.stack_window);
    rt.transport.destroy_window(&rt.evac_window);
    rt.transport.destroy_window(&rt.ts_window);
    rt.transport.destroy_window(&rt.heap);
    rt.transport.destroy_window(&rt.ctrl);
    rt.transport.teardown();
    info!("portage finalized on rank {}", rt.rank);
}

/// Service deferred work: remote release requests and queued remote
/// frees.  Called at every scheduling point.
pub(crate) fn poll(rt: &Runtime) {
    cache::service_release_request(rt);
    galloc::drain_free_ring(rt);
}

/// The rank of the process running the current worker
pub fn my_rank() -> usize {
    with(|rt| rt.rank())
}

/// Total number of ranks in the process group
pub fn n_ranks() -> usize {
    with(|rt| rt.n_ranks())
}

/// True on rank 0
pub fn is_master() -> bool {
    my_rank() == 0
}

/// Process-group barrier bracketed by a release/acquire pair, so writes
/// from before the barrier are visible to reads after it on every rank
pub fn barrier() {
    with(|rt| {
        debug_assert!(rt.worker().spmd.get(), "barrier is a collective SPMD call");
        cache::release(rt);
        rt.transport().barrier();
        cache::acquire(rt);
    })
}

/// Monotonic wall-clock nanoseconds, calibrated across ranks at init
pub fn gettime_ns() -> u64 {
    with(|rt| rt.clock_ns())
}
