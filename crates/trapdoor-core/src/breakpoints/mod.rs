//! # Hardware Breakpoints
//!
//! Each processor has four breakpoint slots: an address register
//! (`dr0`-`dr3`) plus a mode and a length field and two enable bits in
//! `dr7`. Status of the last debug exception is in `dr6`.
//!
//! The slots are per processor and [`BreakpointManager`] only ever touches
//! the processor it runs on. Asking it for another processor's slots is an
//! error ([`TrapdoorError::RemoteProcessor`]), never a remote access.
//!
//! ## Example
//!
//! ```rust
//! use trapdoor_core::breakpoints::{BreakpointLength, BreakpointManager, BreakpointMode};
//! use trapdoor_core::platform::sim::SimMachine;
//! use trapdoor_core::{Address, CpuId};
//!
//! let machine = SimMachine::new(1);
//! let manager = BreakpointManager::new(&machine);
//! manager.install(CpuId(0), 1, Address::new(0xabcd_0000), BreakpointMode::Write, BreakpointLength::Four)?;
//!
//! let status = manager.read_status(CpuId(0))?;
//! assert_eq!(status.slot(1)?.mode, BreakpointMode::Write);
//! # Ok::<(), trapdoor_core::TrapdoorError>(())
//! ```

pub mod control;

use core::fmt::{self, Write as _};

use tracing::debug;

pub use control::{DebugControl, DebugStatus};

use crate::error::{RegisterName, TrapdoorError, TrapdoorResult};
use crate::platform::{DebugRegister, Processor};
use crate::types::{Address, CpuId};

/// Number of hardware breakpoint slots per processor
pub const SLOT_COUNT: u8 = 4;

/// What access triggers a breakpoint (R/W field of DR7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointMode
{
    /// Instruction fetch
    Execute,
    /// Data write
    Write,
    /// I/O port access, only with CR4.DE; never installed by this crate
    Io,
    /// Data read or write
    ReadWrite,
}

impl BreakpointMode
{
    /// Encoding in DR7
    pub const fn bits(self) -> u64
    {
        match self {
            Self::Execute => 0b00,
            Self::Write => 0b01,
            Self::Io => 0b10,
            Self::ReadWrite => 0b11,
        }
    }

    /// Decode a DR7 field
    pub const fn from_bits(bits: u64) -> Self
    {
        match bits & control::FIELD_MASK {
            0b00 => Self::Execute,
            0b01 => Self::Write,
            0b10 => Self::Io,
            _ => Self::ReadWrite,
        }
    }
}

impl fmt::Display for BreakpointMode
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(match self {
            Self::Execute => "execute",
            Self::Write => "write",
            Self::Io => "io",
            Self::ReadWrite => "read-write",
        })
    }
}

/// Width of the watched range (LEN field of DR7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointLength
{
    One,
    Two,
    Four,
    Eight,
}

impl BreakpointLength
{
    /// Encoding in DR7
    pub const fn bits(self) -> u64
    {
        match self {
            Self::One => 0b00,
            Self::Two => 0b01,
            Self::Eight => 0b10,
            Self::Four => 0b11,
        }
    }

    /// Decode a DR7 field
    pub const fn from_bits(bits: u64) -> Self
    {
        match bits & control::FIELD_MASK {
            0b00 => Self::One,
            0b01 => Self::Two,
            0b10 => Self::Eight,
            _ => Self::Four,
        }
    }

    /// Width in bytes
    pub const fn bytes(self) -> u64
    {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
            Self::Eight => 8,
        }
    }

    /// Length for a width in bytes
    pub const fn from_bytes(bytes: u64) -> Option<Self>
    {
        match bytes {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            4 => Some(Self::Four),
            8 => Some(Self::Eight),
            _ => None,
        }
    }
}

/// A validated slot number (0-3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(u8);

impl Slot
{
    /// Validate a slot number
    ///
    /// ## Errors
    ///
    /// - `BadRegister("drN")` for anything outside 0-3
    pub fn new(slot: u8) -> TrapdoorResult<Self>
    {
        if slot < SLOT_COUNT {
            Ok(Self(slot))
        } else {
            let mut name = RegisterName::empty();
            let _ = write!(name, "dr{slot}");
            Err(TrapdoorError::BadRegister(name))
        }
    }

    pub const fn index(self) -> u8
    {
        self.0
    }

    fn address_register(self) -> DebugRegister
    {
        match self.0 {
            0 => DebugRegister::Dr0,
            1 => DebugRegister::Dr1,
            2 => DebugRegister::Dr2,
            _ => DebugRegister::Dr3,
        }
    }
}

/// Decoded DR7 state of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotControl
{
    pub mode: BreakpointMode,
    pub length: BreakpointLength,
    pub global: bool,
    pub local: bool,
}

impl SlotControl
{
    /// Whether the slot is disarmed with both fields zero
    pub fn is_clear(&self) -> bool
    {
        !self.global
            && !self.local
            && self.mode == BreakpointMode::Execute
            && self.length == BreakpointLength::One
    }
}

/// Snapshot of DR6 and DR7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointStatus
{
    pub status: DebugStatus,
    pub control: DebugControl,
}

impl BreakpointStatus
{
    /// Decoded control fields of a slot
    pub fn slot(&self, slot: u8) -> TrapdoorResult<SlotControl>
    {
        let n = Slot::new(slot)?.index();
        Ok(SlotControl {
            mode: BreakpointMode::from_bits(self.control.mode_bits(n)),
            length: BreakpointLength::from_bits(self.control.length_bits(n)),
            global: self.control.contains(DebugControl::global(n)),
            local: self.control.contains(DebugControl::local(n)),
        })
    }

    /// Slots whose condition was met by the last debug exception
    pub fn triggered(&self) -> impl Iterator<Item = u8> + '_
    {
        (0..SLOT_COUNT).filter(|n| self.status.contains(DebugStatus::hit(*n)))
    }

    /// Whether the last debug exception was a single step
    pub fn single_step(&self) -> bool
    {
        self.status.contains(DebugStatus::BS)
    }
}

/// Installs and removes hardware breakpoints on the current processor
pub struct BreakpointManager<'p, P: Processor>
{
    processor: &'p P,
}

impl<'p, P: Processor> BreakpointManager<'p, P>
{
    pub fn new(processor: &'p P) -> Self
    {
        Self { processor }
    }

    fn ensure_local(&self, cpu: CpuId) -> TrapdoorResult<()>
    {
        let current = self.processor.cpu_id();
        if cpu == current {
            Ok(())
        } else {
            Err(TrapdoorError::RemoteProcessor {
                requested: cpu,
                current,
            })
        }
    }

    fn control(&self) -> DebugControl
    {
        DebugControl::from_bits_retain(self.processor.read_debug(DebugRegister::Dr7))
    }

    fn set_control(&self, control: DebugControl)
    {
        // SAFETY: the debugger's #DB handler is hooked before any session
        unsafe { self.processor.write_debug(DebugRegister::Dr7, control.bits()) };
    }

    /// Arm `slot` on `cpu`
    ///
    /// Sets the slot's address register, its mode and length fields, both
    /// of its enable bits and `GE`.
    ///
    /// ## Errors
    ///
    /// - `RemoteProcessor`: `cpu` is not the current processor
    /// - `BadRegister`: `slot` is not 0-3
    /// - `InvalidBreakpoint`: I/O mode, an execute breakpoint wider than one
    ///   byte, or a data address not aligned to `length`
    /// - `SlotInUse`: the slot is armed; remove it first
    pub fn install(&self, cpu: CpuId, slot: u8, address: Address, mode: BreakpointMode, length: BreakpointLength) -> TrapdoorResult<()>
    {
        self.ensure_local(cpu)?;
        let slot = Slot::new(slot)?;
        match mode {
            BreakpointMode::Io => {
                return Err(TrapdoorError::InvalidBreakpoint("I/O breakpoints are not supported"));
            }
            BreakpointMode::Execute if length != BreakpointLength::One => {
                return Err(TrapdoorError::InvalidBreakpoint("execute breakpoints must be one byte long"));
            }
            BreakpointMode::Write | BreakpointMode::ReadWrite if !address.is_aligned(length.bytes()) => {
                return Err(TrapdoorError::InvalidBreakpoint("address is not aligned to the breakpoint length"));
            }
            _ => {}
        }

        let n = slot.index();
        let control = self.control();
        if control.is_armed(n) {
            return Err(TrapdoorError::SlotInUse { cpu, slot: n });
        }

        // SAFETY: the slot is disarmed, loading its address has no effect yet
        unsafe { self.processor.write_debug(slot.address_register(), address.value()) };
        let armed = control.with_fields(n, mode.bits(), length.bits())
            | DebugControl::GE
            | DebugControl::global(n)
            | DebugControl::local(n);
        self.set_control(armed);

        debug!(cpu = cpu.0, slot = n, address = address.value(), mode = mode.bits(), length = length.bytes(), "hardware breakpoint installed");
        Ok(())
    }

    /// Disarm `slot` on `cpu`
    ///
    /// Zeroes the address register and the slot's enable bits and fields.
    /// Other slots and `GE` are left alone. Removing a free slot is allowed.
    pub fn remove(&self, cpu: CpuId, slot: u8) -> TrapdoorResult<()>
    {
        self.ensure_local(cpu)?;
        let n = Slot::new(slot)?;

        let disarmed = self
            .control()
            .difference(DebugControl::global(n.index()) | DebugControl::local(n.index()))
            .with_fields(n.index(), 0, 0);
        self.set_control(disarmed);
        // SAFETY: the slot is disarmed
        unsafe { self.processor.write_debug(n.address_register(), 0) };

        debug!(cpu = cpu.0, slot = n.index(), "hardware breakpoint removed");
        Ok(())
    }

    /// Current DR6 and DR7 of `cpu`
    pub fn read_status(&self, cpu: CpuId) -> TrapdoorResult<BreakpointStatus>
    {
        self.ensure_local(cpu)?;
        Ok(BreakpointStatus {
            status: DebugStatus::from_bits_retain(self.processor.read_debug(DebugRegister::Dr6)),
            control: self.control(),
        })
    }

    /// Address programmed into `slot` of `cpu`
    pub fn address(&self, cpu: CpuId, slot: u8) -> TrapdoorResult<Address>
    {
        self.ensure_local(cpu)?;
        let slot = Slot::new(slot)?;
        Ok(Address::new(self.processor.read_debug(slot.address_register())))
    }

    /// Zero DR6 once a debug exception has been handled
    pub fn clear_status(&self, cpu: CpuId) -> TrapdoorResult<()>
    {
        self.ensure_local(cpu)?;
        // SAFETY: DR6 only reports, writing it arms nothing
        unsafe { self.processor.write_debug(DebugRegister::Dr6, 0) };
        Ok(())
    }
}
