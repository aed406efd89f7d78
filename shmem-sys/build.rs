//! Build script: generate raw bindings for the system OpenSHMEM
//! installation and emit its link lines.
///
/// Copyright (c) 2020, Institute for Defense Analyses
/// 4850 Mark Center Drive, Alexandria, VA 22311-1882; 703-845-2500
///
/// All rights reserved.
///
/// This file is part of Portage, a PGAS tasking runtime for rust.  For
/// licence information see the LICENSE file in the top level dirctory
/// of the distribution.
use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src/wrapper.h");
    println!("cargo:rerun-if-env-changed=PORTAGE_SHMEM_DIR");
    println!("cargo:rerun-if-env-changed=CRAY_SHMEM_DIR");

    // On Cray systems the compiler environment exports its own prefix
    // and the launcher support comes with the machine; everywhere else
    // libsma is linked together with the simple PMI shim from a prefix
    // given by PORTAGE_SHMEM_DIR (default /usr/local).
    let cray = env::var("CRAY_SHMEM_DIR");
    let prefix = match &cray {
        Ok(dir) => dir.clone(),
        Err(_) => env::var("PORTAGE_SHMEM_DIR").unwrap_or_else(|_| "/usr/local".to_string()),
    };
    println!("cargo:rustc-link-lib=sma");
    if cray.is_err() {
        println!("cargo:rustc-link-lib=pmi_simple");
        println!("cargo:rustc-link-search={}/lib", prefix);
    }

    let bindings = bindgen::Builder::default()
        .header("src/wrapper.h")
        .clang_arg(format!("-I{}/include", prefix))
        // the transport only moves bytes and 32/64-bit AMOs; the wide
        // floating-point reduction families have no stable Rust ABI and
        // are left out of the bindings altogether
        .blocklist_function(".*(longdouble|float128|ld80).*")
        .generate()
        .expect("bindgen could not process shmem.h; is PORTAGE_SHMEM_DIR set?");

    let out = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings
        .write_to_file(out.join("shmem_bindings.rs"))
        .expect("could not write the generated shmem bindings");
}
