//! # Simulated Machine
//!
//! A multi-processor x86 machine modelled over plain memory. It implements
//! every host trait of the core, which is how the core is tested and how
//! `trapdoor-sim` drives it.
//!
//! ## What is modelled
//!
//! - Per-processor control registers, debug registers and flags, with the
//!   reset values of real hardware (`dr6 = 0xffff0ff0`, `dr7 = 0x400`)
//! - Which processor is "current"; [`Processor`] methods act on it
//! - How each other processor reacts to a halt request ([`Responder`]).
//!   Acknowledgements are delivered while the owner polls, through
//!   [`Processor::relax`]
//! - Identity page aliases, so patches land in the memory they target
//! - Counters for IPIs, NMIs, page aliases and write-protect toggles
//!
//! Interior mutability (`Cell`) is used throughout because every host trait
//! takes `&self`, like the hardware it stands in for.

use core::cell::Cell;
use core::ptr::NonNull;

use super::{ControlRegister, DebugRegister, DescriptorTable, Interconnect, PageMapper, Processor, TaskContext};
use crate::arch::{INTERRUPT_FLAG, WRITE_PROTECT};
use crate::halt::HaltSequence;
use crate::types::{Address, CpuId, CpuSet, MAX_CPUS};

/// Power-on value of DR6
pub const DR6_RESET: u64 = 0xffff_0ff0;
/// Power-on value of DR7
pub const DR7_RESET: u64 = 0x400;
/// CR0 of a running protected-mode kernel with paging and WP set
pub const CR0_DEFAULT: u64 = 0x8005_0033;
/// Flags with interrupts enabled
pub const FLAGS_DEFAULT: u64 = 0x202;

/// How a simulated processor reacts to the debugger's halt request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Responder
{
    /// Parks `after` polls after the halt IPI arrives
    Ipi { after: u32 },
    /// Ignores the IPI (interrupts masked) and parks `after` polls after an NMI
    Nmi { after: u32 },
    /// Never parks
    Never,
}

/// Parks as soon as the IPI arrives
impl Default for Responder
{
    fn default() -> Self
    {
        Responder::Ipi { after: 0 }
    }
}

struct SimCpu
{
    control: [Cell<u64>; 5],
    debug: [Cell<u64>; 8],
    flags: Cell<u64>,
    responder: Cell<Responder>,
    pending_ack: Cell<Option<u32>>,
}

impl SimCpu
{
    fn new() -> Self
    {
        let control = core::array::from_fn(|n| Cell::new(if n == 0 { CR0_DEFAULT } else { 0 }));
        let debug = core::array::from_fn(|n| {
            Cell::new(match n {
                6 => DR6_RESET,
                7 => DR7_RESET,
                _ => 0,
            })
        });
        Self {
            control,
            debug,
            flags: Cell::new(FLAGS_DEFAULT),
            responder: Cell::new(Responder::default()),
            pending_ack: Cell::new(None),
        }
    }
}

/// Counters of host interactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimCounters
{
    /// Halt IPIs sent
    pub ipis: u32,
    /// NMIs sent
    pub nmis: u32,
    /// Writable aliases created
    pub maps: u32,
    /// Writable aliases dropped
    pub unmaps: u32,
    /// Times CR0.WP went from set to clear
    pub write_protect_cleared: u32,
}

/// A simulated multi-processor machine
pub struct SimMachine<'s>
{
    cpus: [SimCpu; MAX_CPUS],
    online: CpuSet,
    current: Cell<CpuId>,
    sequence: Option<&'s HaltSequence>,
    idt: Cell<DescriptorTable>,
    stack_pointer: Cell<u64>,
    stack_segment: Cell<u16>,
    kernel_stack_top: Cell<Option<Address>>,
    fail_mapping: Cell<bool>,
    counters: Cell<SimCounters>,
}

impl<'s> SimMachine<'s>
{
    /// A machine with processors `0..cpus` online; processor 0 is current
    pub fn new(cpus: u32) -> Self
    {
        Self {
            cpus: core::array::from_fn(|_| SimCpu::new()),
            online: CpuSet::first(cpus),
            current: Cell::new(CpuId(0)),
            sequence: None,
            idt: Cell::new(DescriptorTable::default()),
            stack_pointer: Cell::new(0xffff_c900_0000_3f00),
            stack_segment: Cell::new(0x18),
            kernel_stack_top: Cell::new(None),
            fail_mapping: Cell::new(false),
            counters: Cell::new(SimCounters::default()),
        }
    }

    /// Deliver halt acknowledgements through `sequence`
    #[must_use]
    pub fn with_sequence(mut self, sequence: &'s HaltSequence) -> Self
    {
        self.sequence = Some(sequence);
        self
    }

    /// Make `cpu` the processor the core runs on
    pub fn set_current(&self, cpu: CpuId)
    {
        self.current.set(cpu);
    }

    /// Choose how `cpu` reacts to halt requests
    pub fn set_responder(&self, cpu: CpuId, responder: Responder)
    {
        if let Some(state) = self.cpus.get(cpu.index()) {
            state.responder.set(responder);
        }
    }

    /// Point the trap vector table register at `base`
    pub fn set_interrupt_table(&self, table: DescriptorTable)
    {
        self.idt.set(table);
    }

    /// Set the kernel stack top of the selected task
    pub fn set_kernel_stack_top(&self, top: Option<Address>)
    {
        self.kernel_stack_top.set(top);
    }

    /// Set the live stack pointer and stack segment
    pub fn set_stack(&self, pointer: u64, segment: u16)
    {
        self.stack_pointer.set(pointer);
        self.stack_segment.set(segment);
    }

    /// Set the live flags of the current processor
    pub fn set_flags(&self, flags: u64)
    {
        self.cpu().flags.set(flags);
    }

    /// Set a control register of the current processor
    pub fn set_control(&self, register: ControlRegister, value: u64)
    {
        self.cpu().control[usize::from(register.number())].set(value);
    }

    /// Make every following `map_writable` fail
    pub fn fail_mapping(&self, fail: bool)
    {
        self.fail_mapping.set(fail);
    }

    /// Debug register of any processor, for inspection
    pub fn debug_register_of(&self, cpu: CpuId, register: DebugRegister) -> u64
    {
        self.cpus
            .get(cpu.index())
            .map_or(0, |state| state.debug[usize::from(register.number())].get())
    }

    /// Interaction counters so far
    pub fn counters(&self) -> SimCounters
    {
        self.counters.get()
    }

    fn cpu(&self) -> &SimCpu
    {
        // CpuId of the current processor always indexes the array, see set_current
        &self.cpus[self.current.get().index() % MAX_CPUS]
    }

    fn count(&self, update: impl FnOnce(&mut SimCounters))
    {
        let mut counters = self.counters.get();
        update(&mut counters);
        self.counters.set(counters);
    }

    fn schedule_ack(state: &SimCpu, after: u32)
    {
        if state.pending_ack.get().is_none() {
            state.pending_ack.set(Some(after));
        }
    }
}

impl Processor for SimMachine<'_>
{
    fn cpu_id(&self) -> CpuId
    {
        self.current.get()
    }

    fn read_control(&self, register: ControlRegister) -> u64
    {
        self.cpu().control[usize::from(register.number())].get()
    }

    unsafe fn write_cr0(&self, value: u64)
    {
        let cr0 = &self.cpu().control[0];
        if cr0.get() & WRITE_PROTECT != 0 && value & WRITE_PROTECT == 0 {
            self.count(|c| c.write_protect_cleared += 1);
        }
        cr0.set(value);
    }

    fn read_debug(&self, register: DebugRegister) -> u64
    {
        self.cpu().debug[usize::from(register.number())].get()
    }

    unsafe fn write_debug(&self, register: DebugRegister, value: u64)
    {
        self.cpu().debug[usize::from(register.number())].set(value);
    }

    fn flags(&self) -> u64
    {
        self.cpu().flags.get()
    }

    fn save_and_disable_interrupts(&self) -> u64
    {
        let flags = &self.cpu().flags;
        let saved = flags.get();
        flags.set(saved & !INTERRUPT_FLAG);
        saved
    }

    fn restore_interrupts(&self, saved: u64)
    {
        if saved & INTERRUPT_FLAG != 0 {
            let flags = &self.cpu().flags;
            flags.set(flags.get() | INTERRUPT_FLAG);
        }
    }

    fn stack_pointer(&self) -> u64
    {
        self.stack_pointer.get()
    }

    fn stack_segment(&self) -> u16
    {
        self.stack_segment.get()
    }

    fn interrupt_table(&self) -> DescriptorTable
    {
        self.idt.get()
    }

    /// One poll iteration: processors with a pending acknowledgement move
    /// one step closer to parking
    fn relax(&self)
    {
        for cpu in self.online.iter() {
            let state = &self.cpus[cpu.index()];
            match state.pending_ack.get() {
                Some(0) => {
                    state.pending_ack.set(None);
                    if let Some(sequence) = self.sequence {
                        sequence.acknowledge(cpu);
                    }
                }
                Some(left) => state.pending_ack.set(Some(left - 1)),
                None => {}
            }
        }
    }
}

impl Interconnect for SimMachine<'_>
{
    fn online_cpus(&self) -> CpuSet
    {
        self.online
    }

    fn send_halt_ipi(&self, cpu: CpuId)
    {
        self.count(|c| c.ipis += 1);
        if let Some(state) = self.cpus.get(cpu.index()) {
            if let Responder::Ipi { after } = state.responder.get() {
                Self::schedule_ack(state, after);
            }
        }
    }

    fn send_nmi(&self, cpu: CpuId)
    {
        self.count(|c| c.nmis += 1);
        if let Some(state) = self.cpus.get(cpu.index()) {
            match state.responder.get() {
                Responder::Ipi { after } | Responder::Nmi { after } => Self::schedule_ack(state, after),
                Responder::Never => {}
            }
        }
    }
}

impl PageMapper for SimMachine<'_>
{
    unsafe fn map_writable(&self, address: Address) -> Option<NonNull<u8>>
    {
        if self.fail_mapping.get() {
            return None;
        }
        let alias = NonNull::new(address.as_ptr::<u8>())?;
        self.count(|c| c.maps += 1);
        Some(alias)
    }

    unsafe fn unmap(&self, _alias: NonNull<u8>)
    {
        self.count(|c| c.unmaps += 1);
    }
}

// SAFETY: tests point the stack top just past a frame they own
unsafe impl TaskContext for SimMachine<'_>
{
    fn kernel_stack_top(&self) -> Option<Address>
    {
        self.kernel_stack_top.get()
    }
}
