//! Per-worker telemetry, aggregated collectively at flush time.
//!
//! Counters live in one plain struct per worker; nothing is shared
//! between workers until `profiler_flush` gathers every rank's struct to
//! rank 0 over RMA and prints a single aggregated report.
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
use crate::rma;
use crate::runtime::{self, Runtime};

/// One worker's event counters
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Counters {
    pub steal_success: u64,
    pub steal_fail: u64,
    pub steal_success_ns: u64,
    pub steal_fail_ns: u64,
    pub tasks_forked: u64,
    pub frames_stolen_bytes: u64,
    pub rma_get_bytes: u64,
    pub rma_get_calls: u64,
    pub rma_put_bytes: u64,
    pub rma_put_calls: u64,
    pub rma_cas_calls: u64,
    pub rma_faa_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_writebacks: u64,
    pub releases: u64,
    pub acquires: u64,
}

// plain counters, byte-copied to rank 0 at flush
unsafe impl Remotable for Counters {}

impl Counters {
    fn add(&mut self, o: &Counters) {
        self.steal_success += o.steal_success;
        self.steal_fail += o.steal_fail;
        self.steal_success_ns += o.steal_success_ns;
        self.steal_fail_ns += o.steal_fail_ns;
        self.tasks_forked += o.tasks_forked;
        self.frames_stolen_bytes += o.frames_stolen_bytes;
        self.rma_get_bytes += o.rma_get_bytes;
        self.rma_get_calls += o.rma_get_calls;
        self.rma_put_bytes += o.rma_put_bytes;
        self.rma_put_calls += o.rma_put_calls;
        self.rma_cas_calls += o.rma_cas_calls;
        self.rma_faa_calls += o.rma_faa_calls;
        self.cache_hits += o.cache_hits;
        self.cache_misses += o.cache_misses;
        self.cache_writebacks += o.cache_writebacks;
        self.releases += o.releases;
        self.acquires += o.acquires;
    }
}

/// Start collecting events (collective)
pub fn profiler_begin() {
    runtime::with(|rt| {
        rt.transport().barrier();
        *rt.prof_counters().borrow_mut() = Counters::default();
        rt.set_prof_enabled(true);
    });
}

/// Stop collecting events (collective)
pub fn profiler_end() {
    runtime::with(|rt| {
        rt.set_prof_enabled(false);
        rt.transport().barrier();
    });
}

/// Gather every worker's counters to rank 0 and print one report
/// (collective)
pub fn profiler_flush() {
    runtime::with(|rt| flush_impl(rt));
}

fn flush_impl(rt: &Runtime) {
    let mine = *rt.prof_counters().borrow();
    rt.transport().barrier();
    rma::put_value(rt, rt.ctrl_win(), 0, rt.prof_slot_off(rt.rank()), mine);
    rt.transport().flush(rt.ctrl_win(), 0);
    rt.transport().barrier();
    if rt.rank() == 0 {
        let mut total = Counters::default();
        for r in 0..rt.n_ranks() {
            let c: Counters = rma::get_value(rt, rt.ctrl_win(), 0, rt.prof_slot_off(r));
            total.add(&c);
        }
        report(&total, rt.n_ranks());
    }
    rt.transport().barrier();
}

fn report(c: &Counters, n_ranks: usize) {
    println!("portage profile over {} ranks", n_ranks);
    println!(
        "  steals     : {} ok ({} ns), {} failed ({} ns), {} frame bytes moved",
        c.steal_success, c.steal_success_ns, c.steal_fail, c.steal_fail_ns, c.frames_stolen_bytes
    );
    println!("  tasks      : {} forked", c.tasks_forked);
    println!(
        "  rma        : get {} calls / {} bytes, put {} calls / {} bytes, cas {}, faa {}",
        c.rma_get_calls, c.rma_get_bytes, c.rma_put_calls, c.rma_put_bytes, c.rma_cas_calls,
        c.rma_faa_calls
    );
    println!(
        "  cache      : {} hits, {} misses, {} writebacks, {} releases, {} acquires",
        c.cache_hits, c.cache_misses, c.cache_writebacks, c.releases, c.acquires
    );
}
