//! Raw FFI bindings to SPDK's environment, logging and NVMe driver.
//!
//! Generated by `bindgen` from `wrapper.h` at build time. See `build.rs`.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]
#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));
