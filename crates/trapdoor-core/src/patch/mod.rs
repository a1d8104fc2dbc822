//! # Code and Table Patching
//!
//! Everything that rewrites memory the kernel keeps read-only:
//!
//! - [`gate`]: the privileged write gate (CR0.WP) for single writes
//! - [`vector`]: redirecting trap vector table entries
//! - [`inline`]: five-byte `jmp` hooks on kernel functions
//!
//! [`ExceptionHooks`] bundles the two inline hooks the debugger installs
//! when it loads: the kernel's debug exception and breakpoint exception
//! handlers are redirected to the debugger's entry points.

pub mod gate;
pub mod inline;
pub mod vector;

use tracing::{info, warn};

pub use inline::{HookRecord, InlineHook, HOOK_LENGTH, JMP_REL32};
pub use vector::VectorTable;

use crate::error::TrapdoorResult;
use crate::platform::PageMapper;
use crate::types::Address;

/// A kernel function and the debugger function that replaces it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookTarget
{
    /// Kernel handler to patch
    pub target: Address,
    /// Debugger entry point to jump to
    pub replacement: Address,
}

/// The inline hooks on the kernel's `#DB` and `int3` handlers
#[derive(Debug, Default)]
pub struct ExceptionHooks
{
    pub debug: HookRecord,
    pub breakpoint: HookRecord,
}

impl ExceptionHooks
{
    pub const fn new() -> Self
    {
        Self {
            debug: HookRecord::new(),
            breakpoint: HookRecord::new(),
        }
    }

    /// Hook both handlers; if the second hook fails the first is undone
    ///
    /// # Safety
    ///
    /// See [`InlineHook::install`].
    pub unsafe fn install<M: PageMapper>(&mut self, mapper: &M, debug: HookTarget, breakpoint: HookTarget) -> TrapdoorResult<()>
    {
        let hooks = InlineHook::new(mapper);
        // SAFETY: forwarded to the caller
        unsafe {
            hooks.install(&mut self.debug, debug.target, debug.replacement)?;
            if let Err(error) = hooks.install(&mut self.breakpoint, breakpoint.target, breakpoint.replacement) {
                if let Err(rollback) = hooks.remove(&mut self.debug) {
                    warn!(%rollback, "debug exception hook left in place after a failed install");
                }
                return Err(error);
            }
        }
        info!("debug and breakpoint exception handlers hooked");
        Ok(())
    }

    /// Restore both handlers
    ///
    /// # Safety
    ///
    /// See [`InlineHook::remove`].
    pub unsafe fn remove<M: PageMapper>(&mut self, mapper: &M) -> TrapdoorResult<()>
    {
        let hooks = InlineHook::new(mapper);
        // SAFETY: forwarded to the caller
        unsafe {
            hooks.remove(&mut self.breakpoint)?;
            hooks.remove(&mut self.debug)?;
        }
        info!("debug and breakpoint exception handlers restored");
        Ok(())
    }
}
