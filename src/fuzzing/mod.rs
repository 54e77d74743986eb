/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Test-case generators and oracles for the fuzz targets.

pub use libfuzzer_sys::{arbitrary, fuzz_target};

pub mod moves;
pub mod trace;
