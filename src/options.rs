//! Runtime options read from `PORTAGE_`-prefixed environment variables
///
/// Copyright (c) 2020, Institute for Defense Analyses
/// 4850 Mark Center Drive, Alexandria, VA 22311-1882; 703-845-2500
///
/// All rights reserved.
///
/// This file is part of Portage, a PGAS tasking runtime for rust.  For
/// licence information see the LICENSE file in the top level dirctory
/// of the distribution.
use crate::err::Error;
use std::env;
use std::str::FromStr;

/// Which scheduling variant drives the workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// randomized work stealing, the default
    RandWs,
    /// depth-aware variant: forks beyond a depth cutoff run serially
    Adws,
}

/// All runtime tunables, resolved once at init
///
/// Tests construct this directly rather than mutating the process
/// environment, which is racy across concurrently running tests.
#[derive(Debug, Clone)]
pub struct Options {
    /// callstack bytes per worker
    pub stack_size: usize,
    /// work-stealing deque entries
    pub wsqueue_capacity: usize,
    /// remotable slab bytes for thread states
    pub thread_state_allocator_size: usize,
    /// remotable slab bytes for evacuated continuations
    pub suspended_thread_allocator_size: usize,
    /// scheduling variant
    pub scheduler: SchedulerKind,
    /// whether the depth-aware variant steals at all
    pub adws_enable_steal: bool,
    /// deque entries in the depth-aware variant
    pub adws_wsqueue_capacity: usize,
    /// fork depth beyond which the depth-aware variant serializes
    pub adws_max_depth: usize,
    /// collective heap bytes contributed by each rank
    pub heap_size: usize,
    /// coherence cache bytes per process
    pub cache_size: usize,
    /// coherence block bytes, must be a power of two
    pub cache_block_size: usize,
    /// let the transport library allocate windows where it supports that
    pub rma_use_win_allocate: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            stack_size: 2 << 20,
            wsqueue_capacity: 1024,
            thread_state_allocator_size: 2 << 20,
            suspended_thread_allocator_size: 2 << 20,
            scheduler: SchedulerKind::RandWs,
            adws_enable_steal: true,
            adws_wsqueue_capacity: 256,
            adws_max_depth: 20,
            heap_size: 64 << 20,
            cache_size: 16 << 20,
            cache_block_size: 4096,
            rma_use_win_allocate: true,
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> crate::Result<T> {
    match env::var(name) {
        Ok(v) => v.parse().map_err(|_| Error::InvalidOption {
            name: name.to_string(),
            value: v,
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> crate::Result<bool> {
    match env::var(name) {
        Ok(v) => match v.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(Error::InvalidOption {
                name: name.to_string(),
                value: v,
            }),
        },
        Err(_) => Ok(default),
    }
}

impl Options {
    /// Resolve all options from the environment, falling back to defaults
    pub fn from_env() -> crate::Result<Options> {
        let d = Options::default();
        let scheduler = match env::var("PORTAGE_SCHEDULER") {
            Ok(v) => match v.as_str() {
                "randws" => SchedulerKind::RandWs,
                "adws" => SchedulerKind::Adws,
                _ => {
                    return Err(Error::InvalidOption {
                        name: "PORTAGE_SCHEDULER".to_string(),
                        value: v,
                    })
                }
            },
            Err(_) => d.scheduler,
        };
        let opts = Options {
            stack_size: env_parse("PORTAGE_STACK_SIZE", d.stack_size)?,
            wsqueue_capacity: env_parse("PORTAGE_WSQUEUE_CAPACITY", d.wsqueue_capacity)?,
            thread_state_allocator_size: env_parse(
                "PORTAGE_THREAD_STATE_ALLOCATOR_SIZE",
                d.thread_state_allocator_size,
            )?,
            suspended_thread_allocator_size: env_parse(
                "PORTAGE_SUSPENDED_THREAD_ALLOCATOR_SIZE",
                d.suspended_thread_allocator_size,
            )?,
            scheduler,
            adws_enable_steal: env_bool("PORTAGE_ADWS_ENABLE_STEAL", d.adws_enable_steal)?,
            adws_wsqueue_capacity: env_parse(
                "PORTAGE_ADWS_WSQUEUE_CAPACITY",
                d.adws_wsqueue_capacity,
            )?,
            adws_max_depth: env_parse("PORTAGE_ADWS_MAX_DEPTH", d.adws_max_depth)?,
            heap_size: env_parse("PORTAGE_HEAP_SIZE", d.heap_size)?,
            cache_size: env_parse("PORTAGE_CACHE_SIZE", d.cache_size)?,
            cache_block_size: env_parse("PORTAGE_CACHE_BLOCK_SIZE", d.cache_block_size)?,
            rma_use_win_allocate: env_bool("PORTAGE_RMA_USE_WIN_ALLOCATE", d.rma_use_win_allocate)?,
        };
        opts.validate()?;
        Ok(opts)
    }

    /// Sanity-check cross-field requirements
    pub fn validate(&self) -> crate::Result<()> {
        if !self.cache_block_size.is_power_of_two() {
            return Err(Error::InvalidOption {
                name: "PORTAGE_CACHE_BLOCK_SIZE".to_string(),
                value: self.cache_block_size.to_string(),
            });
        }
        if self.cache_size < self.cache_block_size {
            return Err(Error::InvalidOption {
                name: "PORTAGE_CACHE_SIZE".to_string(),
                value: self.cache_size.to_string(),
            });
        }
        if self.wsqueue_capacity == 0 || self.adws_wsqueue_capacity == 0 {
            return Err(Error::InvalidOption {
                name: "PORTAGE_WSQUEUE_CAPACITY".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Deque capacity for the variant actually selected
    pub(crate) fn active_wsqueue_capacity(&self) -> usize {
        match self.scheduler {
            SchedulerKind::RandWs => self.wsqueue_capacity,
            SchedulerKind::Adws => self.adws_wsqueue_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let o = Options::default();
        assert_eq!(o.stack_size, 2 * 1024 * 1024);
        assert_eq!(o.wsqueue_capacity, 1024);
        assert_eq!(o.adws_wsqueue_capacity, 256);
        assert_eq!(o.adws_max_depth, 20);
        assert!(o.validate().is_ok());
    }

    #[test]
    fn block_size_must_be_pow2() {
        let o = Options {
            cache_block_size: 3000,
            ..Options::default()
        };
        assert!(o.validate().is_err());
    }
}
