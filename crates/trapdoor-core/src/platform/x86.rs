//! Processor backend that executes the real privileged instructions
//!
//! Only usable at CPL 0. On a development host every method except
//! [`Processor::flags`], [`Processor::stack_pointer`],
//! [`Processor::stack_segment`] and [`Processor::relax`] faults.

use core::arch::asm;
use core::ptr;

#[cfg(target_arch = "x86")]
use ::x86::bits32::eflags::read as read_flags;
#[cfg(target_arch = "x86_64")]
use ::x86::bits64::rflags::read as read_flags;
use ::x86::controlregs::{cr0, cr0_write, cr2, cr3, cr4, Cr0};
use ::x86::dtables::{sidt, DescriptorTablePointer};
use ::x86::irq;
use ::x86::segmentation;

use super::{ControlRegister, DebugRegister, DescriptorTable, Processor};
use crate::arch::INTERRUPT_FLAG;
use crate::types::CpuId;

/// The processor the code is running on
///
/// The kernel knows which logical processor it is on (its per-CPU area);
/// it passes that number in when it builds the handle on debugger entry.
#[derive(Debug, Clone, Copy)]
pub struct BareMetal
{
    cpu: CpuId,
}

impl BareMetal
{
    /// Handle for the current processor
    ///
    /// # Safety
    ///
    /// The caller must run at CPL 0 on processor `cpu`, with preemption
    /// disabled for as long as the handle is used.
    pub const unsafe fn new(cpu: CpuId) -> Self
    {
        Self { cpu }
    }
}

impl Processor for BareMetal
{
    fn cpu_id(&self) -> CpuId
    {
        self.cpu
    }

    fn read_control(&self, register: ControlRegister) -> u64
    {
        // SAFETY: constructing a BareMetal asserts CPL 0
        unsafe {
            match register {
                ControlRegister::Cr0 => cr0().bits() as u64,
                ControlRegister::Cr2 => cr2() as u64,
                ControlRegister::Cr3 => cr3(),
                ControlRegister::Cr4 => cr4().bits() as u64,
            }
        }
    }

    unsafe fn write_cr0(&self, value: u64)
    {
        // SAFETY: forwarded to the caller
        unsafe { cr0_write(Cr0::from_bits_truncate(value as usize)) };
    }

    fn read_debug(&self, register: DebugRegister) -> u64
    {
        let value: usize;
        // SAFETY: constructing a BareMetal asserts CPL 0
        unsafe {
            match register {
                DebugRegister::Dr0 => asm!("mov {}, dr0", out(reg) value, options(nomem, nostack, preserves_flags)),
                DebugRegister::Dr1 => asm!("mov {}, dr1", out(reg) value, options(nomem, nostack, preserves_flags)),
                DebugRegister::Dr2 => asm!("mov {}, dr2", out(reg) value, options(nomem, nostack, preserves_flags)),
                DebugRegister::Dr3 => asm!("mov {}, dr3", out(reg) value, options(nomem, nostack, preserves_flags)),
                DebugRegister::Dr6 => asm!("mov {}, dr6", out(reg) value, options(nomem, nostack, preserves_flags)),
                DebugRegister::Dr7 => asm!("mov {}, dr7", out(reg) value, options(nomem, nostack, preserves_flags)),
            }
        }
        value as u64
    }

    unsafe fn write_debug(&self, register: DebugRegister, value: u64)
    {
        let value = value as usize;
        // SAFETY: forwarded to the caller
        unsafe {
            match register {
                DebugRegister::Dr0 => asm!("mov dr0, {}", in(reg) value, options(nomem, nostack, preserves_flags)),
                DebugRegister::Dr1 => asm!("mov dr1, {}", in(reg) value, options(nomem, nostack, preserves_flags)),
                DebugRegister::Dr2 => asm!("mov dr2, {}", in(reg) value, options(nomem, nostack, preserves_flags)),
                DebugRegister::Dr3 => asm!("mov dr3, {}", in(reg) value, options(nomem, nostack, preserves_flags)),
                DebugRegister::Dr6 => asm!("mov dr6, {}", in(reg) value, options(nomem, nostack, preserves_flags)),
                DebugRegister::Dr7 => asm!("mov dr7, {}", in(reg) value, options(nomem, nostack, preserves_flags)),
            }
        }
    }

    fn flags(&self) -> u64
    {
        // SAFETY: reading the flags has no side effects
        #[allow(unused_unsafe)]
        let flags = unsafe { read_flags() };
        flags.bits() as u64
    }

    fn save_and_disable_interrupts(&self) -> u64
    {
        let saved = self.flags();
        // SAFETY: constructing a BareMetal asserts CPL 0
        unsafe { irq::disable() };
        saved
    }

    fn restore_interrupts(&self, saved: u64)
    {
        if saved & INTERRUPT_FLAG != 0 {
            // SAFETY: interrupts were enabled when `saved` was taken
            unsafe { irq::enable() };
        }
    }

    fn stack_pointer(&self) -> u64
    {
        let sp: usize;
        // SAFETY: plain register copy
        unsafe {
            #[cfg(target_arch = "x86_64")]
            asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
            #[cfg(target_arch = "x86")]
            asm!("mov {}, esp", out(reg) sp, options(nomem, nostack, preserves_flags));
        }
        sp as u64
    }

    fn stack_segment(&self) -> u16
    {
        // SAFETY: plain register copy
        #[allow(unused_unsafe)]
        let ss = unsafe { segmentation::ss() };
        ss.bits()
    }

    fn interrupt_table(&self) -> DescriptorTable
    {
        let mut table = DescriptorTablePointer::<u8> {
            limit: 0,
            base: ptr::null(),
        };
        // SAFETY: `sidt` stores into the operand and nothing else
        unsafe { sidt(&mut table) };
        let (limit, base) = (table.limit, table.base);
        DescriptorTable {
            limit,
            base: base as u64,
        }
    }

    fn relax(&self)
    {
        core::hint::spin_loop();
    }
}
