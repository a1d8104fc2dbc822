//! # trapdoor-core
//!
//! Architecture control core of an in-kernel x86 debugger.
//!
//! This crate sits underneath the debugger's command layer and provides:
//! - A privileged write gate for patching read-only kernel memory
//! - Trap vector (IDT) hooking and inline function hooking
//! - Per-CPU hardware breakpoint management (DR0-DR7)
//! - Symbolic register access against a trap frame
//! - An emergency-unwind save/restore primitive
//! - Single-step and interrupt-state control
//! - Multi-processor halt coordination
//!
//! ## Word widths
//!
//! 32-bit x86 and x86-64 each get a concrete [`arch::Architecture`]
//! implementation. Both layouts are always compiled; [`arch::Native`] picks the
//! one matching the build target.
//!
//! ## Why unsafe code is needed
//!
//! This crate executes privileged instructions (`mov cr0`, `mov drN`, `sidt`,
//! `cli`/`sti`) and rewrites live kernel code. These operations cannot be
//! expressed in safe Rust. The unsafe surface is kept to the
//! [`platform::x86`] backend, the patching primitives in [`patch`] and the
//! context switch in [`context`]; everything built on top is safe.
//!
//! ## Host kernel
//!
//! Anything the kernel owns (IPIs, page remapping, task layout) is reached
//! through the traits in [`platform`]. [`platform::sim::SimMachine`] implements
//! all of them over plain memory so the whole core can run on a development
//! host.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)] // Required for privileged instructions and code patching

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
compile_error!("trapdoor-core only supports x86 and x86_64 targets");

pub mod arch;
pub mod breakpoints;
pub mod config;
pub mod context;
pub mod error;
pub mod halt;
pub mod interrupts;
pub mod patch;
pub mod platform;
pub mod prelude;
pub mod registers;
pub mod session;
pub mod types;

pub use arch::{Architecture, Native};
pub use error::{TrapdoorError, TrapdoorResult};
pub use session::Session;
pub use types::{Address, CpuId, CpuSet};
