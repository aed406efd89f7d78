//! Multi-rank runtime tests on the thread-backed transport: fork/join
//! equivalence, the join race, coherence fences, migration, collective
//! execution, and init/fini discipline.
///
/// Copyright (c) 2020, Institute for Defense Analyses
/// 4850 Mark Center Drive, Alexandria, VA 22311-1882; 703-845-2500
///
/// All rights reserved.
///
/// This file is part of Portage, a PGAS tasking runtime for rust.  For
/// licence information see the LICENSE file in the top level dirctory
/// of the distribution.
use portage::{
    barrier, coll_exec, fini, free, init_with_options, make_checkout, malloc, malloc_coll,
    migrate_to, migrate_to_master, my_rank, n_ranks, parallel_invoke, root_exec, run_spmd,
    GlobalVec, LocalDomain, Mode, Options, ProcessGroup,
};
use std::sync::Arc;

fn test_opts() -> Options {
    Options {
        stack_size: 1 << 20,
        heap_size: 8 << 20,
        cache_size: 2 << 20,
        ..Options::default()
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fib(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let (a, b) = parallel_invoke(move || fib(n - 1), move || fib(n - 2));
    a + b
}

#[test]
fn fib_is_identical_on_every_rank_count() {
    init_logging();
    for ranks in [1usize, 2, 4, 8] {
        let results = run_spmd(ranks, test_opts(), |_| root_exec(|| fib(20)));
        assert_eq!(results.len(), ranks);
        for r in results {
            assert_eq!(r, 6765, "fib(20) diverged at {} ranks", ranks);
        }
    }
}

#[test]
fn parallel_invoke_equals_serial_evaluation() {
    init_logging();
    fn f(x: i64) -> i64 {
        x * x - 3
    }
    fn g(y: i64) -> i64 {
        7 * y + 1
    }
    for ranks in [1usize, 2, 4] {
        let results = run_spmd(ranks, test_opts(), |_| {
            root_exec(|| parallel_invoke(|| f(21), || g(-4)))
        });
        for r in results {
            assert_eq!(r, (f(21), g(-4)));
        }
    }
}

#[test]
fn deep_fork_chains_terminate() {
    init_logging();
    // a lopsided tree: every level forks a trivial child, so the
    // continuation chain is long and steals hit it constantly
    fn chain(depth: u64) -> u64 {
        if depth == 0 {
            return 0;
        }
        let (a, b) = parallel_invoke(move || chain(depth - 1), || 1u64);
        a + b
    }
    let results = run_spmd(4, test_opts(), |_| root_exec(|| chain(300)));
    for r in results {
        assert_eq!(r, 300);
    }
}

#[test]
fn cache_read_your_writes_on_one_rank() {
    init_logging();
    let results = run_spmd(1, test_opts(), |_| {
        let g = malloc_coll::<u64>(64);
        {
            let mut w = make_checkout(g, 64, Mode::Write);
            for (i, v) in w.iter_mut().enumerate() {
                *v = i as u64 * 3;
            }
        }
        let r = make_checkout(g, 64, Mode::Read);
        let snapshot: Vec<u64> = r.iter().copied().collect();
        drop(r);
        portage::free_coll(g, 64);
        snapshot
    });
    assert_eq!(results[0], (0..64).map(|i| i * 3).collect::<Vec<u64>>());
}

#[test]
fn release_acquire_publishes_across_ranks() {
    init_logging();
    let results = run_spmd(2, test_opts(), |rank| {
        // collective: both ranks receive the same pointer
        let g = malloc_coll::<u64>(1);
        if rank == 0 {
            let mut w = make_checkout(g, 1, Mode::Write);
            w[0] = 1;
        }
        // release on the writer, acquire on the reader
        barrier();
        let v = {
            let r = make_checkout(g, 1, Mode::Read);
            r[0]
        };
        portage::free_coll(g, 1);
        v
    });
    assert_eq!(results, vec![1, 1]);
}

#[test]
fn coll_exec_runs_on_every_rank() {
    init_logging();
    let ranks = 4usize;
    let results = run_spmd(ranks, test_opts(), |_| {
        root_exec(|| {
            let v = GlobalVec::<u64>::new(portage::n_ranks());
            let span = v.span();
            coll_exec(move || {
                let me = my_rank() as u64;
                let mut w = make_checkout(span.gptr_at(me as usize), 1, Mode::Write);
                w[0] = me + 1;
            });
            portage::reduce(span, 1, 0u64, |a, b| a + b)
        })
    });
    let expect: u64 = (1..=ranks as u64).sum();
    for r in results {
        assert_eq!(r, expect);
    }
}

#[test]
fn migration_carries_the_task_between_ranks() {
    init_logging();
    let results = run_spmd(2, test_opts(), |_| {
        root_exec(|| {
            let r0 = my_rank();
            migrate_to(1);
            let r1 = my_rank();
            migrate_to_master();
            (r0 as u64, r1 as u64, my_rank() as u64)
        })
    });
    for r in results {
        assert_eq!(r, (0, 1, 0));
    }
}

#[test]
fn remote_free_returns_blocks_through_the_ring() {
    init_logging();
    let results = run_spmd(2, test_opts(), |_| {
        root_exec(|| {
            // allocate on rank 0's remotable window, free it from rank 1
            let g = malloc::<u64>(8);
            let owner = g.rank();
            migrate_to(1);
            free(g, 8);
            migrate_to_master();
            owner as u64
        })
    });
    for r in results {
        assert_eq!(r, 0);
    }
}

#[test]
fn init_fini_cycles_are_idempotent() {
    init_logging();
    // two full cycles of the whole group
    for _ in 0..2 {
        let results = run_spmd(2, test_opts(), |_| root_exec(|| fib(8)));
        for r in results {
            assert_eq!(r, 21);
        }
    }
    // nested init/fini balance inside a live runtime
    let results = run_spmd(2, test_opts(), |_| {
        // the nested init is a counted no-op; its group is never used
        init_with_options(
            ProcessGroup::Local {
                domain: Arc::new(LocalDomain::new(1)),
                rank: 0,
            },
            test_opts(),
        )
        .expect("nested init should be a counted no-op");
        let v = root_exec(|| fib(6));
        fini(); // balances the nested init; the runtime stays up
        assert_eq!(n_ranks(), 2);
        v
    });
    for r in results {
        assert_eq!(r, 8);
    }
}

#[test]
fn gettime_is_monotonic_and_barrier_works_in_spmd() {
    init_logging();
    let results = run_spmd(4, test_opts(), |_| {
        let a = portage::gettime_ns();
        barrier();
        let b = portage::gettime_ns();
        assert!(b >= a);
        portage::is_master() as u64
    });
    assert_eq!(results.iter().sum::<u64>(), 1);
}

#[test]
fn profiler_round_trip_aggregates() {
    init_logging();
    let results = run_spmd(2, test_opts(), |_| {
        portage::profiler_begin();
        let v = root_exec(|| fib(12));
        portage::profiler_end();
        portage::profiler_flush();
        v
    });
    for r in results {
        assert_eq!(r, 144);
    }
}

#[test]
fn root_result_reaches_every_rank() {
    init_logging();
    let results = run_spmd(4, test_opts(), |_| root_exec(|| 0xdead_beefu64));
    assert_eq!(results, vec![0xdead_beefu64; 4]);
}
