//! Value types shared by every module of the debugger core

mod address;
mod cpu;

pub use address::{Address, PAGE_SIZE};
pub use cpu::{CpuId, CpuSet, MAX_CPUS};
