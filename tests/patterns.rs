//! End-to-end pattern scenarios: reduce, scan, fill, and dot product
//! over global vectors, at several rank counts and cutoffs, with
//! stealing enabled and disabled.
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
    fill, inclusive_scan, make_checkout, reduce, root_exec, run_spmd, transform_reduce, GlobalSpan,
    GlobalVec, Mode, Options, SchedulerKind,
};

fn test_opts() -> Options {
    Options {
        stack_size: 1 << 20,
        heap_size: 16 << 20,
        cache_size: 4 << 20,
        ..Options::default()
    }
}

fn no_steal_opts() -> Options {
    Options {
        scheduler: SchedulerKind::Adws,
        adws_enable_steal: false,
        ..test_opts()
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Serially write `start, start+1, ...` over the span
fn iota(span: GlobalSpan<i64>, start: i64) {
    let mut next = start;
    let mut i = 0;
    while i < span.len() {
        let (g, n) = span.chunk_at(i);
        let mut w = make_checkout(g, n, Mode::Write);
        for v in w.iter_mut() {
            *v = next;
            next += 1;
        }
        i += n;
    }
}

#[test]
fn reduce_of_iota_matches_formula_at_every_cutoff() {
    init_logging();
    let n = 10_000usize;
    for cutoff in [1usize, 10, 100, 10_000] {
        let results = run_spmd(4, test_opts(), move |_| {
            root_exec(move || {
                let v = GlobalVec::<i64>::new(n);
                iota(v.span(), 0);
                reduce(v.span(), cutoff, 0i64, |a, b| a + b)
            })
        });
        for r in results {
            assert_eq!(r, 49_995_000, "reduce diverged at cutoff {}", cutoff);
        }
    }
}

#[test]
fn inclusive_scan_of_ones_counts_up() {
    init_logging();
    let n = 100_000usize;
    let results = run_spmd(4, test_opts(), move |_| {
        root_exec(move || {
            let input = GlobalVec::<i64>::new(n);
            let output = GlobalVec::<i64>::new(n);
            fill(input.span(), 1024, 1i64);
            let total = inclusive_scan(input.span(), output.span(), 1024, 0i64, |a, b| a + b);
            // verify serially: element i must equal i + 1
            let mut mismatches = 0u64;
            let mut expect = 1i64;
            let mut i = 0;
            while i < n {
                let (g, m) = output.span().chunk_at(i);
                let r = make_checkout(g, m, Mode::Read);
                for v in r.iter() {
                    if *v != expect {
                        mismatches += 1;
                    }
                    expect += 1;
                }
                i += m;
            }
            let last = {
                let r = make_checkout(output.span().gptr_at(n - 1), 1, Mode::Read);
                r[0]
            };
            (total, mismatches, last)
        })
    });
    for (total, mismatches, last) in results {
        assert_eq!(total, 100_000);
        assert_eq!(mismatches, 0);
        assert_eq!(last, 100_000);
    }
}

#[test]
fn fill_then_reduce_multiplies_out() {
    init_logging();
    let n = 100_000usize;
    let results = run_spmd(4, test_opts(), move |_| {
        root_exec(move || {
            let v = GlobalVec::<i64>::new(n);
            fill(v.span(), 512, 33i64);
            reduce(v.span(), 512, 0i64, |a, b| a + b)
        })
    });
    for r in results {
        assert_eq!(r, 3_300_000);
    }
}

#[test]
fn dot_product_matches_closed_form() {
    init_logging();
    let n = 10_000usize;
    let expect: i64 = (n as i64 - 1) * (n as i64) * (2 * n as i64 - 1) / 6;
    let results = run_spmd(4, test_opts(), move |_| {
        root_exec(move || {
            let a = GlobalVec::<i64>::new(n);
            let b = GlobalVec::<i64>::new(n);
            iota(a.span(), 0);
            iota(b.span(), 0);
            transform_reduce(a.span(), b.span(), 256, 0i64, |x, y| x * y, |p, q| p + q)
        })
    });
    for r in results {
        assert_eq!(r, expect);
    }
}

#[test]
fn steal_disabled_gives_bit_identical_answers() {
    init_logging();
    fn fib(n: u64) -> u64 {
        if n < 2 {
            return n;
        }
        let (a, b) = portage::parallel_invoke(move || fib(n - 1), move || fib(n - 2));
        a + b
    }
    let scenario = move |_rank: usize| {
        root_exec(move || {
            let n = 5_000usize;
            let v = GlobalVec::<i64>::new(n);
            iota(v.span(), 0);
            let sum = reduce(v.span(), 64, 0i64, |a, b| a + b);
            let f = fib(16);
            (sum, f)
        })
    };
    let with_steal = run_spmd(4, test_opts(), scenario);
    let without_steal = run_spmd(4, no_steal_opts(), scenario);
    assert_eq!(with_steal, without_steal);
    for (sum, f) in with_steal {
        assert_eq!(sum, (5_000i64 - 1) * 5_000 / 2);
        assert_eq!(f, 987);
    }
}

#[test]
fn patterns_work_on_a_single_rank() {
    init_logging();
    let results = run_spmd(1, test_opts(), |_| {
        root_exec(|| {
            let v = GlobalVec::<i64>::new(1000);
            fill(v.span(), 16, 2i64);
            let doubled = reduce(v.span(), 16, 0i64, |a, b| a + b);
            let out = GlobalVec::<i64>::new(1000);
            let total = inclusive_scan(v.span(), out.span(), 64, 0i64, |a, b| a + b);
            (doubled, total)
        })
    });
    assert_eq!(results[0], (2000, 2000));
}
