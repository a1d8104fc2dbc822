//! # Host Interfaces
//!
//! The debugger core never talks to the kernel directly. Everything it needs
//! from the host is expressed as one of four traits:
//!
//! - [`Processor`]: privileged state of the processor the code runs on
//! - [`Interconnect`]: the online processor set and inter-processor interrupts
//! - [`PageMapper`]: writable aliases of read-only kernel text
//! - [`TaskContext`]: where the selected task entered the kernel
//!
//! Two implementations ship with the crate:
//!
//! - [`x86::BareMetal`](self::x86::BareMetal) executes the real instructions and is what a kernel
//!   embeds (together with its own `Interconnect`, `PageMapper` and
//!   `TaskContext`).
//! - [`sim::SimMachine`] models a multi-processor machine over plain memory
//!   and implements all four traits, so every operation of the core runs on a
//!   development host.

use core::ptr::NonNull;

use crate::types::{Address, CpuId, CpuSet};

pub mod sim;
pub mod x86;

/// Control register selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlRegister
{
    Cr0,
    Cr2,
    Cr3,
    Cr4,
}

impl ControlRegister
{
    /// All readable control registers, in dump order
    pub const ALL: [ControlRegister; 4] = [Self::Cr0, Self::Cr2, Self::Cr3, Self::Cr4];

    /// Register number (`N` in `crN`)
    pub const fn number(self) -> u8
    {
        match self {
            Self::Cr0 => 0,
            Self::Cr2 => 2,
            Self::Cr3 => 3,
            Self::Cr4 => 4,
        }
    }
}

/// Debug register selector
///
/// `dr4` and `dr5` are reserved aliases of `dr6`/`dr7` and cannot be named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugRegister
{
    Dr0,
    Dr1,
    Dr2,
    Dr3,
    Dr6,
    Dr7,
}

impl DebugRegister
{
    /// Register number (`N` in `drN`)
    pub const fn number(self) -> u8
    {
        match self {
            Self::Dr0 => 0,
            Self::Dr1 => 1,
            Self::Dr2 => 2,
            Self::Dr3 => 3,
            Self::Dr6 => 6,
            Self::Dr7 => 7,
        }
    }

    /// Address register of a breakpoint slot (0-3)
    pub const fn address_register(slot: u8) -> Option<Self>
    {
        match slot {
            0 => Some(Self::Dr0),
            1 => Some(Self::Dr1),
            2 => Some(Self::Dr2),
            3 => Some(Self::Dr3),
            _ => None,
        }
    }
}

/// Contents of a descriptor table register (`sidt`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorTable
{
    /// Size of the table in bytes, minus one
    pub limit: u16,
    /// Linear address of the first descriptor
    pub base: u64,
}

impl DescriptorTable
{
    /// Whether `entry_size * (vector + 1)` bytes fit below the limit
    pub const fn holds(self, vector: u8, entry_size: usize) -> bool
    {
        let end = (vector as usize + 1) * entry_size;
        end <= self.limit as usize + 1
    }
}

/// Privileged state of the current processor
///
/// Every method acts on the processor executing the call. Nothing here can
/// reach another processor; that is what [`Interconnect`] is for.
pub trait Processor
{
    /// Logical number of this processor
    fn cpu_id(&self) -> CpuId;

    /// Read a control register
    fn read_control(&self, register: ControlRegister) -> u64;

    /// Load CR0
    ///
    /// # Safety
    ///
    /// Changing CR0 changes how every memory access behaves. Callers only
    /// ever toggle the write-protect bit and restore the previous value.
    unsafe fn write_cr0(&self, value: u64);

    /// Read a debug register
    fn read_debug(&self, register: DebugRegister) -> u64;

    /// Load a debug register
    ///
    /// # Safety
    ///
    /// Arming a breakpoint makes the processor raise debug exceptions; the
    /// debug exception handler has to be in place first.
    unsafe fn write_debug(&self, register: DebugRegister, value: u64);

    /// Current (E/R)FLAGS
    fn flags(&self) -> u64;

    /// Disable maskable interrupts and return the flags to restore later
    fn save_and_disable_interrupts(&self) -> u64;

    /// Re-enable interrupts if they were enabled in `saved`
    fn restore_interrupts(&self, saved: u64);

    /// Current stack pointer
    fn stack_pointer(&self) -> u64;

    /// Current stack segment selector
    fn stack_segment(&self) -> u16;

    /// Location of the live trap vector table
    fn interrupt_table(&self) -> DescriptorTable;

    /// Spin-loop hint
    fn relax(&self);
}

/// Inter-processor signalling
pub trait Interconnect
{
    /// Processors currently online, including the caller
    fn online_cpus(&self) -> CpuSet;

    /// Send the debugger's halt IPI to `cpu`
    fn send_halt_ipi(&self, cpu: CpuId);

    /// Send an NMI to `cpu`
    fn send_nmi(&self, cpu: CpuId);
}

/// Writable aliases of read-only kernel memory
pub trait PageMapper
{
    /// Map the page backing `address` writable
    ///
    /// The returned pointer aliases `address` itself; it stays valid up to
    /// the end of that page until [`PageMapper::unmap`] is called.
    ///
    /// # Safety
    ///
    /// `address` must be mapped kernel memory.
    unsafe fn map_writable(&self, address: Address) -> Option<NonNull<u8>>;

    /// Drop an alias returned by [`PageMapper::map_writable`]
    ///
    /// # Safety
    ///
    /// `alias` must come from `map_writable` on the same mapper and must not
    /// be used afterwards.
    unsafe fn unmap(&self, alias: NonNull<u8>);
}

/// The task the debugger currently has selected
///
/// # Safety
///
/// When `kernel_stack_top` returns an address, the trap frame saved on the
/// last entry from user mode must lie directly below it and be valid for
/// reads and writes while the debugger runs.
pub unsafe trait TaskContext
{
    /// Top of the kernel stack (`sp0`), if the task has one
    fn kernel_stack_top(&self) -> Option<Address>;
}

/// Everything a debugger session needs from the host, in one object
pub trait Machine: Processor + Interconnect + TaskContext {}

impl<T: Processor + Interconnect + TaskContext> Machine for T {}
