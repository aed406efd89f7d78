#![warn(
    missing_docs,
    future_incompatible,
    missing_debug_implementations,
    rust_2018_idioms
)]

//! Portage: distributed fine-grained task parallelism over partitioned
//! global address space memory.
//!
//! A program is a divide-and-conquer tree of tasks entered through
//! [`root_exec`]; the runtime spreads the tasks over a group of workers
//! by randomized work stealing of live stack frames, and serves reads
//! and writes of the one logical address space through a software
//! coherence cache whose unit of access is a [`make_checkout`].
//!
//! Two transports are built in: a thread-backed group in one process
//! (the default, used by the test suite; see [`run_spmd`]) and an
//! OpenSHMEM process group behind the `shmem` cargo feature.  Stolen
//! frames land at the virtual address they were suspended at, which
//! distributed deployments satisfy by symmetric allocation with address
//! randomization disabled; the thread-backed group instead relocates
//! images within its shared address space.
//!
//! Tasks yield only at scheduling points (fork, join, poll, migrate),
//! and everything a task captures or returns crosses ranks as raw
//! bytes, bounded by the [`Remotable`] contract.
///
/// Copyright (c) 2020, Institute for Defense Analyses
/// 4850 Mark Center Drive, Alexandria, VA 22311-1882; 703-845-2500
///
/// All rights reserved.
///
/// This file is part of Portage, a PGAS tasking runtime for rust.  For
/// licence information see the LICENSE file in the top level dirctory
/// of the distribution.

/// Generic result type for this library
pub type Result<T> = std::result::Result<T, err::Error>;

pub mod err;

mod cache;
mod context;
mod galloc;
mod gptr;
mod gvec;
mod options;
mod pattern;
mod profiler;
pub mod rma;
mod runtime;
mod sched;
mod stack;
mod wallclock;
mod wsq;

pub use cache::{make_checkout, CheckoutSpan, Mode};
pub use err::Error;
pub use galloc::{free, free_coll, malloc, malloc_coll};
pub use gptr::{GlobalPtr, Remotable, WinKind};
pub use gvec::{GlobalSpan, GlobalVec};
pub use options::{Options, SchedulerKind};
pub use pattern::{
    fill, for_each, for_each_mut, inclusive_scan, parallel_invoke, parallel_invoke3,
    parallel_invoke4, reduce, transform_reduce,
};
pub use profiler::{profiler_begin, profiler_end, profiler_flush};
pub use rma::local::{run_spmd, LocalDomain};
pub use runtime::{
    barrier, fini, gettime_ns, init, init_with_options, is_master, my_rank, n_ranks, ProcessGroup,
};
pub use sched::{
    coll_exec, fork, is_root, is_spmd, join, migrate_to, migrate_to_master, poll, root_exec,
    ThreadHandle,
};
