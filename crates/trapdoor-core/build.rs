//! Build script for trapdoor-core
//!
//! This script checks system requirements before compilation:
//! - Minimum Rust version (naked functions need Rust 1.88.0+)
//! - Target architecture (only 32-bit x86 and x86-64 have an implementation)
//!
//! ## Requirements
//!
//! - **Rust**: 1.88.0 or newer (`#[unsafe(naked)]` + `naked_asm!`)
//! - **Target**: `x86` or `x86_64`; the kernel target usually has `target_os = "none"`

use std::env;

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    // The context save/restore primitive is written as naked functions
    if let Ok(rustc_version) = rustc_version::version() {
        let min_rust_version = rustc_version::Version::new(1, 88, 0);

        if rustc_version < min_rust_version {
            panic!(
                "trapdoor-core requires Rust {} or newer (naked functions), found {}",
                min_rust_version, rustc_version
            );
        }
    } else {
        // If we can't get version (e.g., in some build environments), just warn
        println!("cargo:warning=could not verify Rust version");
    }

    check_target_architecture();
}

fn check_target_architecture()
{
    // Cargo exports the target (not the host) configuration to build scripts
    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();

    match arch.as_str() {
        "x86" | "x86_64" => {}
        "" => println!("cargo:warning=could not detect target architecture"),
        other => panic!("trapdoor-core only supports x86 and x86_64 targets, found {}", other),
    }
}
