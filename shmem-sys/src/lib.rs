//! Raw OpenSHMEM bindings, generated at build time from the system
//! headers.  Everything here is plain C ABI; the safe wrapper is the
//! `shmem` transport inside the portage crate, which is the only
//! intended consumer.
//
// Copyright (c) 2020, Institute for Defense Analyses
// 4850 Mark Center Drive, Alexandria, VA 22311-1882; 703-845-2500
//
// All rights reserved.
//
// This file is part of Portage, a PGAS tasking runtime for rust.  For
// licence information see the LICENSE file in the top level dirctory
// of the distribution.

// the C naming conventions come through bindgen as-is
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]

include!(concat!(env!("OUT_DIR"), "/shmem_bindings.rs"));
