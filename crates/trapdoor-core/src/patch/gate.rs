//! # Privileged Write Gate
//!
//! Kernel text and the trap vector table are mapped read-only, and with
//! CR0.WP set not even ring 0 may write them. A [`WriteGate`] lifts that
//! protection for exactly one write:
//!
//! 1. Interrupts are disabled on this processor
//! 2. The process-wide gate lock is taken
//! 3. CR0.WP is cleared
//! 4. One write of at most a machine word happens ([`WriteGate::write`])
//! 5. On drop: CR0.WP is restored, the lock is released, interrupts are
//!    restored, in that order
//!
//! WP is a per-processor bit, but the lock keeps a second processor from
//! opening its own gate at the same time, so there is never more than one
//! unprotected write in flight on the whole machine.

use core::ptr;

use spin::{Mutex, MutexGuard};

use crate::arch::WRITE_PROTECT;
use crate::platform::{ControlRegister, Processor};

static GATE_LOCK: Mutex<()> = Mutex::new(());

/// Scoped permission to write one value to write-protected memory
///
/// ## Example
///
/// ```rust
/// use trapdoor_core::patch::gate::WriteGate;
/// use trapdoor_core::platform::sim::SimMachine;
///
/// let machine = SimMachine::new(1);
/// let mut word: u16 = 0;
/// // SAFETY: `word` is a live local
/// unsafe { WriteGate::open(&machine).write(&raw mut word, 0xbeef) };
/// assert_eq!(word, 0xbeef);
/// ```
pub struct WriteGate<'p, P: Processor>
{
    processor: &'p P,
    saved_flags: u64,
    saved_cr0: u64,
    lock: Option<MutexGuard<'static, ()>>,
}

impl<'p, P: Processor> WriteGate<'p, P>
{
    /// Disable interrupts, take the gate lock and clear CR0.WP
    pub fn open(processor: &'p P) -> Self
    {
        let saved_flags = processor.save_and_disable_interrupts();
        let lock = GATE_LOCK.lock();
        let saved_cr0 = processor.read_control(ControlRegister::Cr0);
        // SAFETY: only WP changes, and Drop puts the old value back
        unsafe { processor.write_cr0(saved_cr0 & !WRITE_PROTECT) };

        Self {
            processor,
            saved_flags,
            saved_cr0,
            lock: Some(lock),
        }
    }

    /// Perform the single write this gate was opened for, then close it
    ///
    /// # Safety
    ///
    /// `dst` must be valid for a write of `T` and properly aligned, and
    /// `T` should not be wider than a machine word so the write is atomic
    /// with respect to the processor executing the target.
    pub unsafe fn write<T: Copy>(self, dst: *mut T, value: T)
    {
        // SAFETY: forwarded to the caller
        unsafe { ptr::write_volatile(dst, value) };
    }
}

impl<P: Processor> Drop for WriteGate<'_, P>
{
    fn drop(&mut self)
    {
        // SAFETY: restores the value read in `open`
        unsafe { self.processor.write_cr0(self.saved_cr0) };
        // Unlock before interrupts come back on
        drop(self.lock.take());
        self.processor.restore_interrupts(self.saved_flags);
    }
}

/// Write `value` to write-protected `dst` through its own gate
///
/// # Safety
///
/// Same contract as [`WriteGate::write`].
pub unsafe fn write_protected<P: Processor, T: Copy>(processor: &P, dst: *mut T, value: T)
{
    // SAFETY: forwarded to the caller
    unsafe { WriteGate::open(processor).write(dst, value) };
}
