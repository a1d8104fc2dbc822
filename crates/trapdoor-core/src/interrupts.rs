//! # Interrupt State and Single-Step
//!
//! Two small pieces of processor state the debugger flips while it runs:
//!
//! - the interrupt-enable flag of the current processor, saved and restored
//!   around critical sections ([`InterruptGuard`])
//! - the trap flag of the interrupted context, set to single-step one
//!   instruction ([`SingleStep`])
//!
//! While single-stepping, interrupts in the stepped context are masked so
//! the step lands on the next instruction and not in an interrupt handler.
//! The previous interrupt-enable state is remembered and put back when
//! stepping ends.

use crate::arch::{Architecture, INTERRUPT_FLAG, TRAP_FLAG};
use crate::platform::Processor;

/// Saved interrupt-enable state of the current processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct InterruptState(u64);

impl InterruptState
{
    /// Whether interrupts were enabled when the state was saved
    pub fn were_enabled(self) -> bool
    {
        self.0 & INTERRUPT_FLAG != 0
    }
}

/// Disable interrupts and return what to restore
pub fn disable_interrupts<P: Processor>(processor: &P) -> InterruptState
{
    InterruptState(processor.save_and_disable_interrupts())
}

/// Re-enable interrupts if they were enabled in `state`
pub fn restore_interrupts<P: Processor>(processor: &P, state: InterruptState)
{
    processor.restore_interrupts(state.0);
}

/// Interrupts disabled for the lifetime of the guard
pub struct InterruptGuard<'p, P: Processor>
{
    processor: &'p P,
    state: InterruptState,
    active: bool,
}

impl<'p, P: Processor> InterruptGuard<'p, P>
{
    pub fn new(processor: &'p P) -> Self
    {
        Self {
            processor,
            state: disable_interrupts(processor),
            active: true,
        }
    }

    /// State saved on entry
    pub fn saved(&self) -> InterruptState
    {
        self.state
    }

    /// Restore interrupts before the guard goes out of scope
    pub fn restore(mut self)
    {
        self.release();
    }

    fn release(&mut self)
    {
        if self.active {
            restore_interrupts(self.processor, self.state);
            self.active = false;
        }
    }
}

impl<P: Processor> Drop for InterruptGuard<'_, P>
{
    fn drop(&mut self)
    {
        self.release();
    }
}

/// Single-step state of one debugger session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SingleStep
{
    resume_interrupts: bool,
    active: bool,
}

impl SingleStep
{
    pub const fn new() -> Self
    {
        Self {
            resume_interrupts: false,
            active: false,
        }
    }

    /// Whether a step is armed
    pub const fn is_active(&self) -> bool
    {
        self.active
    }

    /// Arm a single step in `frame`: remember IF, set TF, clear IF
    ///
    /// Arming again while a step is pending keeps the IF state remembered
    /// the first time. No-op without a frame.
    pub fn set<A: Architecture>(&mut self, frame: Option<&mut A::TrapFrame>)
    {
        let Some(frame) = frame else {
            return;
        };
        let flags = A::read(frame, A::FLAGS);
        if !self.active {
            self.resume_interrupts = flags & INTERRUPT_FLAG != 0;
            self.active = true;
        }
        A::write(frame, A::FLAGS, (flags | TRAP_FLAG) & !INTERRUPT_FLAG);
    }

    /// Undo [`SingleStep::set`]: clear TF, put IF back as it was
    ///
    /// IF is only touched when a step was armed. No-op without a frame.
    pub fn clear<A: Architecture>(&mut self, frame: Option<&mut A::TrapFrame>)
    {
        let Some(frame) = frame else {
            return;
        };
        let mut flags = A::read(frame, A::FLAGS) & !TRAP_FLAG;
        if self.active && self.resume_interrupts {
            flags |= INTERRUPT_FLAG;
        }
        A::write(frame, A::FLAGS, flags);
        *self = Self::new();
    }
}
