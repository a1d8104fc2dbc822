//! # Debugger Sessions
//!
//! [`Session`] is the glue between the patched trap handlers and the
//! debugger's command layer. One call to [`Session::enter`] (or to one of
//! the two exception entry points) is one debugger session on the calling
//! processor:
//!
//! 1. Interrupts are disabled on this processor
//! 2. The other processors are parked ([`crate::halt`]), unless `no_ipi`
//! 3. The [`ReasonDispatcher`] runs under the emergency-unwind recovery
//!    point ([`crate::context`]); it sees the event through a
//!    [`DebugEvent`]
//! 4. Parked processors are released
//! 5. Interrupts are restored
//! 6. If the dispatcher declined the event and chaining is configured,
//!    the previously installed handler is called
//!
//! The dispatcher decides everything else (why the debugger was entered,
//! which commands to run); this module only guarantees that the machine is
//! quiesced around it and that an abort lands somewhere safe.

use core::fmt;
use core::marker::PhantomData;
use core::num::NonZeroUsize;

use tracing::{debug, info};

use crate::arch::Architecture;
use crate::breakpoints::BreakpointManager;
use crate::config::SessionConfig;
use crate::context::{AbortHandle, AbortReason, Recovery};
use crate::error::TrapdoorResult;
use crate::halt::{HaltCoordinator, HaltReport, HaltSequence};
use crate::interrupts::{InterruptGuard, SingleStep};
use crate::platform::Machine;
use crate::registers::RegisterAccess;
use crate::types::CpuId;

/// Why the debugger was entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryReason
{
    /// Explicit request (keyboard, command)
    Enter,
    /// Kernel oops
    Oops,
    /// Debug exception: hardware breakpoint or single step
    Debug,
    /// Breakpoint exception (`int3`)
    Break,
}

impl fmt::Display for EntryReason
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(match self {
            Self::Enter => "enter",
            Self::Oops => "oops",
            Self::Debug => "debug",
            Self::Break => "break",
        })
    }
}

/// What the dispatcher made of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition
{
    /// The debugger consumed the event
    Handled,
    /// The event was not the debugger's (e.g. a breakpoint someone else set)
    Declined,
}

/// The external dispatcher that decides what to do with an event
pub trait ReasonDispatcher<A: Architecture, M: Machine>
{
    fn dispatch(&mut self, event: &mut DebugEvent<'_, A, M>) -> Disposition;
}

/// Handler displaced by the debugger, called for declined events
pub type ChainHandler<A> = fn(Option<&mut <A as Architecture>::TrapFrame>, EntryReason, i64);

/// One debugger event as the dispatcher sees it
pub struct DebugEvent<'e, A: Architecture, M: Machine>
{
    reason: EntryReason,
    error_code: i64,
    frame: Option<&'e mut A::TrapFrame>,
    machine: &'e M,
    halt: &'e HaltReport,
    abort: &'e AbortHandle<'e>,
    single_step: &'e mut SingleStep,
    registers: &'e RegisterAccess<'e, A, M>,
}

impl<'e, A: Architecture, M: Machine> DebugEvent<'e, A, M>
{
    pub fn reason(&self) -> EntryReason
    {
        self.reason
    }

    /// Hardware error code pushed with the trap
    pub fn error_code(&self) -> i64
    {
        self.error_code
    }

    /// Processor the session runs on
    pub fn cpu(&self) -> CpuId
    {
        self.machine.cpu_id()
    }

    pub fn frame(&self) -> Option<&A::TrapFrame>
    {
        self.frame.as_deref()
    }

    pub fn frame_mut(&mut self) -> Option<&mut A::TrapFrame>
    {
        self.frame.as_deref_mut()
    }

    /// Which processors were parked for this session
    pub fn halt(&self) -> &HaltReport
    {
        self.halt
    }

    pub fn registers(&self) -> &RegisterAccess<'e, A, M>
    {
        self.registers
    }

    pub fn breakpoints(&self) -> BreakpointManager<'e, M>
    {
        BreakpointManager::new(self.machine)
    }

    /// Read a register of this event's frame
    pub fn get(&self, name: &str) -> TrapdoorResult<u64>
    {
        self.registers.get(name, self.frame.as_deref())
    }

    /// Write a register of this event's frame
    pub fn set(&mut self, name: &str, value: u64) -> TrapdoorResult<()>
    {
        self.registers.set(name, self.frame.as_deref_mut(), value)
    }

    /// Arm a single step for when the interrupted context resumes
    pub fn set_single_step(&mut self)
    {
        self.single_step.set::<A>(self.frame.as_deref_mut());
    }

    /// End single-stepping
    pub fn clear_single_step(&mut self)
    {
        self.single_step.clear::<A>(self.frame.as_deref_mut());
    }

    pub fn is_single_stepping(&self) -> bool
    {
        self.single_step.is_active()
    }

    /// Abandon the session and unwind to its recovery point
    pub fn abort(&self, reason: NonZeroUsize) -> !
    {
        self.abort.abort(reason)
    }
}

/// Result of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome
{
    pub disposition: Disposition,
    pub halt: HaltReport,
    /// Set when the dispatcher aborted
    pub aborted: Option<AbortReason>,
    /// Whether the displaced handler was called
    pub chained: bool,
}

/// Debugger sessions on one machine
pub struct Session<'m, A, M, D>
where
    A: Architecture,
    M: Machine,
    D: ReasonDispatcher<A, M>,
{
    machine: &'m M,
    coordinator: HaltCoordinator<'m>,
    config: SessionConfig,
    dispatcher: D,
    chain: Option<ChainHandler<A>>,
    single_step: SingleStep,
    recovery: Recovery,
    _arch: PhantomData<A>,
}

impl<'m, A, M, D> Session<'m, A, M, D>
where
    A: Architecture,
    M: Machine,
    D: ReasonDispatcher<A, M>,
{
    pub fn new(machine: &'m M, sequence: &'m HaltSequence, config: SessionConfig, dispatcher: D) -> Self
    {
        Self {
            machine,
            coordinator: HaltCoordinator::new(sequence, &config),
            config,
            dispatcher,
            chain: None,
            single_step: SingleStep::new(),
            recovery: Recovery::new(),
            _arch: PhantomData,
        }
    }

    /// Handler to call for declined events when `chain_declined` is set
    #[must_use]
    pub fn with_chain(mut self, chain: ChainHandler<A>) -> Self
    {
        self.chain = Some(chain);
        self
    }

    pub fn config(&self) -> &SessionConfig
    {
        &self.config
    }

    pub fn dispatcher(&self) -> &D
    {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut D
    {
        &mut self.dispatcher
    }

    /// Whether a single step armed by an earlier session is pending
    pub fn is_single_stepping(&self) -> bool
    {
        self.single_step.is_active()
    }

    /// Entry point of the hooked debug exception handler
    pub fn debug_exception(&mut self, frame: Option<&mut A::TrapFrame>, error_code: i64) -> Outcome
    {
        self.enter(EntryReason::Debug, frame, error_code)
    }

    /// Entry point of the hooked breakpoint exception handler
    pub fn breakpoint_exception(&mut self, frame: Option<&mut A::TrapFrame>, error_code: i64) -> Outcome
    {
        self.enter(EntryReason::Break, frame, error_code)
    }

    /// Run one session on the calling processor
    pub fn enter(&mut self, reason: EntryReason, mut frame: Option<&mut A::TrapFrame>, error_code: i64) -> Outcome
    {
        let machine = self.machine;
        let interrupts = InterruptGuard::new(machine);
        debug!(cpu = machine.cpu_id().0, %reason, error_code, "debugger entered");

        let halt = self.coordinator.halt_others(machine);
        let registers = RegisterAccess::<A, M>::new(machine);
        let dispatcher = &mut self.dispatcher;
        let single_step = &mut self.single_step;

        let result = self.recovery.run(|abort| {
            let mut event = DebugEvent {
                reason,
                error_code,
                frame: frame.as_deref_mut(),
                machine,
                halt: &halt,
                abort,
                single_step,
                registers: &registers,
            };
            dispatcher.dispatch(&mut event)
        });

        self.coordinator.release(&halt);
        interrupts.restore();

        let (disposition, aborted) = match result {
            Ok(disposition) => (disposition, None),
            Err(abandoned) => (Disposition::Handled, Some(abandoned)),
        };

        let mut chained = false;
        if disposition == Disposition::Declined && self.config.chain_declined {
            if let Some(chain) = self.chain {
                chain(frame, reason, error_code);
                chained = true;
            }
        }

        info!(cpu = machine.cpu_id().0, %reason, handled = (disposition == Disposition::Handled), chained, "debugger left");
        Outcome {
            disposition,
            halt,
            aborted,
            chained,
        }
    }
}
