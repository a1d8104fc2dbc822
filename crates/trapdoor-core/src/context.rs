//! # Emergency Unwind
//!
//! A save/restore pair in the style of `setjmp`/`longjmp`, restricted to one
//! use: getting out of the debugger when something goes wrong while it is
//! already handling a trap. Faulting again at that point would be a double
//! fault, so instead control jumps straight back to the recovery point set
//! up when the session started.
//!
//! The raw primitives are [`context_enter`] (save) and [`context_leave`]
//! (restore). They are wrapped by [`Recovery::run`], which runs a closure
//! and hands it an [`AbortHandle`]; calling [`AbortHandle::abort`] anywhere
//! below the closure makes `run` return `Err(reason)`.
//!
//! ```rust
//! use core::num::NonZeroUsize;
//! use trapdoor_core::context::Recovery;
//!
//! let mut recovery = Recovery::new();
//! let outcome = recovery.run(|handle| {
//!     if let Some(reason) = NonZeroUsize::new(7) {
//!         handle.abort(reason);
//!     }
//!     0u32
//! });
//! assert_eq!(outcome.map_err(|reason| reason.get()), Err(7));
//! ```
//!
//! ## Skipped frames
//!
//! Aborting does not unwind: the frames between the closure and the abort
//! are abandoned and their destructors never run. Anything they own is
//! leaked and any lock they hold stays held. Code that may abort should
//! hold no guards across the call. The closure must not panic either,
//! since a panic cannot cross the `extern "C"` trampoline.

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::fmt;
use core::marker::PhantomData;
use core::num::NonZeroUsize;

use tracing::error;

use crate::arch::{Architecture, Native};

/// Saved callee-saved registers, stack pointer and return address
pub type JumpBuffer = <Native as Architecture>::JumpBuffer;

/// Callback run by [`context_enter`]
pub type ContextBody = unsafe extern "C" fn(data: *mut c_void);

/// Save the caller's context in `buffer`, then call `body(data)`
///
/// Returns 0 once `body` returns. If anything below `body` calls
/// [`context_leave`] on the same buffer, this returns that call's `reason`
/// instead, without running any more of `body`.
///
/// # Safety
///
/// `buffer` must be valid for writes for as long as `body` runs.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn context_enter(buffer: *mut JumpBuffer, body: ContextBody, data: *mut c_void) -> usize
{
    core::arch::naked_asm!(
        "mov [rdi + 0x00], rbx",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], r12",
        "mov [rdi + 0x18], r13",
        "mov [rdi + 0x20], r14",
        "mov [rdi + 0x28], r15",
        // stack pointer as seen by the caller after we return
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x30], rax",
        "mov rax, [rsp]",
        "mov [rdi + 0x38], rax",
        // realign to 16 bytes for the call
        "sub rsp, 8",
        "mov rdi, rdx",
        "call rsi",
        "add rsp, 8",
        "xor eax, eax",
        "ret",
    )
}

/// Resume the context saved in `buffer`, making its [`context_enter`]
/// return `reason`
///
/// # Safety
///
/// The [`context_enter`] call that filled `buffer` must still be running
/// (this is called from somewhere below its `body`). Frames in between are
/// abandoned without running destructors.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn context_leave(buffer: *const JumpBuffer, reason: usize) -> !
{
    core::arch::naked_asm!(
        "mov rbx, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov r12, [rdi + 0x10]",
        "mov r13, [rdi + 0x18]",
        "mov r14, [rdi + 0x20]",
        "mov r15, [rdi + 0x28]",
        "mov rsp, [rdi + 0x30]",
        "mov rax, rsi",
        "jmp qword ptr [rdi + 0x38]",
    )
}

/// Save the caller's context in `buffer`, then call `body(data)`
///
/// # Safety
///
/// See the x86-64 version.
#[cfg(target_arch = "x86")]
#[unsafe(naked)]
pub unsafe extern "C" fn context_enter(buffer: *mut JumpBuffer, body: ContextBody, data: *mut c_void) -> usize
{
    core::arch::naked_asm!(
        "mov eax, [esp + 4]",
        "mov [eax + 0x00], ebx",
        "mov [eax + 0x04], esi",
        "mov [eax + 0x08], edi",
        "mov [eax + 0x0c], ebp",
        "lea ecx, [esp + 4]",
        "mov [eax + 0x10], ecx",
        "mov ecx, [esp]",
        "mov [eax + 0x14], ecx",
        "mov ecx, [esp + 8]",
        "mov edx, [esp + 12]",
        "sub esp, 8",
        "push edx",
        "call ecx",
        "add esp, 12",
        "xor eax, eax",
        "ret",
    )
}

/// Resume the context saved in `buffer`
///
/// # Safety
///
/// See the x86-64 version.
#[cfg(target_arch = "x86")]
#[unsafe(naked)]
pub unsafe extern "C" fn context_leave(buffer: *const JumpBuffer, reason: usize) -> !
{
    core::arch::naked_asm!(
        "mov ecx, [esp + 4]",
        "mov eax, [esp + 8]",
        "mov ebx, [ecx + 0x00]",
        "mov esi, [ecx + 0x04]",
        "mov edi, [ecx + 0x08]",
        "mov ebp, [ecx + 0x0c]",
        "mov esp, [ecx + 0x10]",
        "jmp dword ptr [ecx + 0x14]",
    )
}

/// Why a session was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortReason(NonZeroUsize);

impl AbortReason
{
    /// The body finished without producing a result
    pub const INCOMPLETE: AbortReason = AbortReason(NonZeroUsize::MAX);

    pub const fn new(reason: NonZeroUsize) -> Self
    {
        Self(reason)
    }

    pub const fn get(self) -> usize
    {
        self.0.get()
    }
}

impl fmt::Display for AbortReason
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "aborted with reason {}", self.0)
    }
}

/// Permission to abandon the current [`Recovery::run`]
///
/// Only exists inside the closure passed to `run`, so a stale buffer can
/// never be resumed.
pub struct AbortHandle<'r>
{
    buffer: *const JumpBuffer,
    _recovery: PhantomData<&'r Recovery>,
}

impl AbortHandle<'_>
{
    /// Jump back to the recovery point; `run` returns `Err(reason)`
    ///
    /// Frames between the closure and this call are abandoned, see the
    /// module documentation.
    pub fn abort(&self, reason: NonZeroUsize) -> !
    {
        error!(reason = reason.get(), "abandoning debugger session");
        // SAFETY: the handle only lives inside `run`, so the matching
        // `context_enter` is still on the stack
        unsafe { context_leave(self.buffer, reason.get()) }
    }
}

/// The single recovery point of a debugger session
pub struct Recovery
{
    buffer: UnsafeCell<JumpBuffer>,
}

struct Payload<'r, F, R>
{
    body: Option<F>,
    result: Option<R>,
    handle: AbortHandle<'r>,
}

unsafe extern "C" fn trampoline<F, R>(data: *mut c_void)
where
    F: FnOnce(&AbortHandle<'_>) -> R,
{
    // SAFETY: `run` passes a pointer to its live payload
    let payload = unsafe { &mut *data.cast::<Payload<'_, F, R>>() };
    if let Some(body) = payload.body.take() {
        payload.result = Some(body(&payload.handle));
    }
}

impl Recovery
{
    pub fn new() -> Self
    {
        Self {
            buffer: UnsafeCell::new(JumpBuffer::default()),
        }
    }

    /// Run `body` with this recovery point armed
    ///
    /// Returns `Ok` with the closure's result, or `Err` with the reason
    /// passed to [`AbortHandle::abort`].
    pub fn run<R, F>(&mut self, body: F) -> Result<R, AbortReason>
    where
        F: FnOnce(&AbortHandle<'_>) -> R,
    {
        let buffer = self.buffer.get();
        let mut payload = Payload {
            body: Some(body),
            result: None,
            handle: AbortHandle {
                buffer,
                _recovery: PhantomData,
            },
        };

        // SAFETY: buffer and payload outlive the call; the handle cannot
        // escape the closure
        let code = unsafe { context_enter(buffer, trampoline::<F, R>, (&raw mut payload).cast()) };

        if let Some(reason) = NonZeroUsize::new(code) {
            return Err(AbortReason(reason));
        }
        payload.result.take().ok_or(AbortReason::INCOMPLETE)
    }
}

impl Default for Recovery
{
    fn default() -> Self
    {
        Self::new()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_run_returns_body_result()
    {
        let mut recovery = Recovery::new();
        assert_eq!(recovery.run(|_| 42u64), Ok(42));
    }

    #[test]
    fn test_abort_from_nested_call()
    {
        fn deep(handle: &AbortHandle<'_>, depth: u32) -> u32
        {
            if depth == 0 {
                if let Some(reason) = NonZeroUsize::new(3) {
                    handle.abort(reason);
                }
                return 0;
            }
            deep(handle, depth - 1) + 1
        }

        let mut recovery = Recovery::new();
        let outcome = recovery.run(|handle| deep(handle, 16));
        assert_eq!(outcome.map_err(AbortReason::get), Err(3));
    }

    #[test]
    fn test_recovery_is_reusable()
    {
        let mut recovery = Recovery::new();
        for round in 1..=3usize {
            let outcome = recovery.run(|handle| {
                if let Some(reason) = NonZeroUsize::new(round) {
                    handle.abort(reason);
                }
            });
            assert_eq!(outcome.map_err(AbortReason::get), Err(round));
        }
        assert_eq!(recovery.run(|_| "done"), Ok("done"));
    }
}
