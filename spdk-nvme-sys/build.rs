//! Build script for spdk-nvme-sys
//!
//! Locates SPDK with pkg-config, links the NVMe driver stack statically and
//! generates Rust bindings for `wrapper.h` with bindgen.
//!
//! Environment variables:
//! - `PKG_CONFIG_PATH`: Must include SPDK's pkg-config directory (e.g., /opt/spdk/lib/pkgconfig)

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

/// Libraries SPDK's pkg-config files name that must stay dynamic.
const SYSTEM_LIBS: &[&str] = &[
    "crypto", "ssl", "numa", "uuid", "aio", "dl", "m", "rt", "pthread", "uring", "keyutils",
    "isal", "isal_crypto",
];

/// The direct NVMe path only needs env, log, sock, vmd and the nvme driver itself.
const SPDK_LIBS: &[&str] = &[
    "spdk_env_dpdk",
    "spdk_nvme",
    "spdk_log",
    "spdk_sock",
    "spdk_sock_posix",
    "spdk_thread",
    "spdk_vmd",
    "spdk_util",
    "libdpdk",
];

fn is_system_lib(name: &str) -> bool {
    SYSTEM_LIBS.contains(&name)
}

/// `:librte_foo.a` style entries duplicate the plain library names.
fn is_archive_name(name: &str) -> bool {
    name.starts_with(':') || name.ends_with(".a")
}

fn main() {
    println!("cargo:rerun-if-changed=wrapper.h");
    println!("cargo:rerun-if-env-changed=PKG_CONFIG_PATH");

    let mut include_paths: Vec<PathBuf> = Vec::new();
    let mut link_paths = HashSet::new();
    let mut static_libs = HashSet::new();
    let mut system_libs = HashSet::new();

    for lib in SPDK_LIBS {
        let library = pkg_config::Config::new()
            .statik(true)
            .env_metadata(true)
            .probe(lib)
            .unwrap_or_else(|e| {
                panic!(
                    "Failed to find {lib}: {e}. Set PKG_CONFIG_PATH to include SPDK's pkg-config directory."
                )
            });

        for path in library.include_paths {
            if !include_paths.contains(&path) {
                include_paths.push(path);
            }
        }
        link_paths.extend(library.link_paths);
        for name in library.libs {
            if is_archive_name(&name) {
                continue;
            }
            if is_system_lib(&name) {
                system_libs.insert(name);
            } else {
                static_libs.insert(name);
            }
        }
    }

    // libuuid is not always listed in SPDK's Libs.private.
    if pkg_config::Config::new().statik(true).probe("uuid").is_err() {
        system_libs.insert("uuid".to_string());
    }

    for path in &link_paths {
        println!("cargo:rustc-link-search=native={}", path.display());
    }

    // Transport and sock implementations register through constructors, so the
    // archives must be linked whole or the registrations are dropped.
    println!("cargo:rustc-link-arg=-Wl,--whole-archive");
    for lib in &static_libs {
        println!("cargo:rustc-link-lib=static={lib}");
    }
    println!("cargo:rustc-link-arg=-Wl,--no-whole-archive");

    for lib in &system_libs {
        println!("cargo:rustc-link-lib={lib}");
    }

    let clang_args: Vec<String> = include_paths
        .iter()
        .map(|p| format!("-I{}", p.display()))
        .collect();

    let bindings = bindgen::Builder::default()
        .header("wrapper.h")
        .clang_args(&clang_args)
        .allowlist_function("spdk_(env|dma|log|nvme|pci)_.*")
        .allowlist_function("spdk_zmalloc|spdk_malloc|spdk_free")
        .allowlist_type("spdk_(env|log|nvme|pci)_.*")
        .allowlist_var("SPDK_(ENV|LOG|NVME|PCI)_.*")
        .derive_default(true)
        .derive_debug(true)
        .derive_copy(true)
        .wrap_unsafe_ops(true)
        // Driver-internal structs, only ever handled by pointer.
        .opaque_type("spdk_nvme_ctrlr")
        .opaque_type("spdk_nvme_ns")
        .opaque_type("spdk_nvme_qpair")
        .opaque_type("spdk_nvme_probe_ctx")
        // Packed structs with aligned members (E0588).
        .opaque_type("spdk_nvme_ctrlr_data")
        .opaque_type("spdk_nvme_tcp_cmd")
        .opaque_type("spdk_nvme_tcp_rsp")
        .layout_tests(false)
        .generate()
        .expect("Failed to generate SPDK bindings");

    let out_path = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set by cargo"));
    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("Failed to write bindings");
}
