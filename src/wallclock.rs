//! A routine to give access to a monotonic wall clock in nanoseconds.
//!  The origin is anchored right after a collective barrier at init, which
//!  calibrates ranks against each other in a simple way; clocks may still
//!  skew, so measure durations within one rank where accuracy matters.
///
/// Copyright (c) 2020, Institute for Defense Analyses
/// 4850 Mark Center Drive, Alexandria, VA 22311-1882; 703-845-2500
///
/// All rights reserved.
///
/// This file is part of Portage, a PGAS tasking runtime for rust.  For
/// licence information see the LICENSE file in the top level dirctory
/// of the distribution.
use std::time::Instant;

/// Per-rank clock state
#[derive(Debug, Clone, Copy)]
pub(crate) struct Wallclock {
    origin: Instant,
}

impl Wallclock {
    /// Anchor the origin; call immediately after a collective barrier
    pub(crate) fn anchor() -> Wallclock {
        Wallclock {
            origin: Instant::now(),
        }
    }

    /// Nanoseconds since the collective origin
    pub(crate) fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let c = Wallclock::anchor();
        let a = c.now_ns();
        let b = c.now_ns();
        assert!(b >= a);
    }
}
