//! # Architecture Layouts
//!
//! Per-width description of everything the debugger core touches in memory:
//! the trap frame the entry stub saves, the trap gate descriptor, the jump
//! buffer of the emergency-unwind primitive and the register name tables.
//!
//! Two implementations exist, [`X86`] for 32-bit kernels and [`X86_64`] for
//! 64-bit kernels. Both are always compiled so either layout can be exercised
//! on a development host. [`Native`] selects the one that matches the build
//! target; nothing dispatches on the width at runtime.
//!
//! ## Register names
//!
//! Names are matched case-insensitively. An exact match always wins;
//! otherwise a name that is a strict prefix of exactly one table entry
//! resolves to that entry (`fl` → `flags`). Ambiguous prefixes resolve to
//! nothing.

use core::fmt;

pub use ::x86::controlregs::Cr0;

use crate::platform::{DebugRegister, Processor};

pub mod x86;
pub mod x86_64;

pub use self::x86::X86;
pub use self::x86_64::X86_64;

/// Architecture of the build target
#[cfg(target_arch = "x86_64")]
pub type Native = X86_64;

/// Architecture of the build target
#[cfg(target_arch = "x86")]
pub type Native = X86;

/// Layout and register naming of one word width
///
/// Implementations are zero-sized markers. All methods are associated
/// functions so the width is fixed at compile time.
pub trait Architecture: Sized + 'static
{
    /// Human readable name (`"i386"`, `"x86_64"`)
    const NAME: &'static str;

    /// Bytes per machine word
    const WORD_BYTES: u64;

    /// Code selector of the kernel
    ///
    /// A trap frame whose `cs` equals this value was taken without a
    /// privilege change, so the CPU did not push `sp` and `ss`.
    const KERNEL_CS: u64;

    /// Name of the pseudo-register holding the debugger's own stack pointer
    const LIVE_STACK_POINTER: &'static str;

    /// Name of the pseudo-register holding the stack pointer at fault time
    const FAULT_STACK_POINTER: &'static str;

    /// Registers printed per line by the general register dump
    const REGISTERS_PER_LINE: usize;

    /// General register identifier
    type Register: Copy + Eq + fmt::Debug + 'static;

    /// Register snapshot pushed by the trap entry stub
    type TrapFrame: Clone + Default + fmt::Debug;

    /// One entry of the trap vector table
    type GateDescriptor: Copy + fmt::Debug;

    /// Storage for the callee-saved state of the unwind primitive
    type JumpBuffer: Default;

    /// General register names, in display order
    const REGISTERS: &'static [RegisterSlot<Self::Register>];

    /// Stack pointer entry of [`Self::REGISTERS`]
    const STACK_POINTER: Self::Register;

    /// Stack segment entry of [`Self::REGISTERS`]
    const STACK_SEGMENT: Self::Register;

    /// Code segment entry of [`Self::REGISTERS`]
    const CODE_SEGMENT: Self::Register;

    /// Flags entry of [`Self::REGISTERS`]
    const FLAGS: Self::Register;

    /// Instruction pointer entry of [`Self::REGISTERS`]
    const INSTRUCTION_POINTER: Self::Register;

    /// Read a register from a frame, zero-extended to 64 bits
    fn read(frame: &Self::TrapFrame, register: Self::Register) -> u64;

    /// Write a register in a frame, truncated to the register width
    fn write(frame: &mut Self::TrapFrame, register: Self::Register, value: u64);

    /// Reassemble the handler address from the split offset fields
    fn gate_handler(gate: &Self::GateDescriptor) -> u64;

    /// Store a new handler address into the split offset fields
    ///
    /// Each field is written separately through the privileged write gate,
    /// narrowest field first.
    ///
    /// # Safety
    ///
    /// `gate` must point to a live, mapped descriptor and no other processor
    /// may take the vector while its fields are inconsistent.
    unsafe fn store_gate_handler<P: Processor>(gate: *mut Self::GateDescriptor, handler: u64, processor: &P);

    /// Whether the frame was taken without a privilege change
    fn is_kernel_frame(frame: &Self::TrapFrame) -> bool
    {
        Self::read(frame, Self::CODE_SEGMENT) & 0xffff == Self::KERNEL_CS
    }
}

/// One entry of a register name table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSlot<R>
{
    /// Name as typed by the user
    pub name: &'static str,
    /// Register it names
    pub register: R,
}

impl<R> RegisterSlot<R>
{
    /// Create a table entry
    pub const fn new(name: &'static str, register: R) -> Self
    {
        Self { name, register }
    }
}

/// Hardware debug register names
pub const DEBUG_REGISTERS: &[RegisterSlot<DebugRegister>] = &[
    RegisterSlot::new("dr0", DebugRegister::Dr0),
    RegisterSlot::new("dr1", DebugRegister::Dr1),
    RegisterSlot::new("dr2", DebugRegister::Dr2),
    RegisterSlot::new("dr3", DebugRegister::Dr3),
    RegisterSlot::new("dr6", DebugRegister::Dr6),
    RegisterSlot::new("dr7", DebugRegister::Dr7),
];

/// Look a name up in a register table
///
/// Returns the entry with exactly this name (ignoring case), or else the
/// only entry that `name` is a strict prefix of. Empty and ambiguous names
/// resolve to `None`.
pub fn resolve<'t, R>(table: &'t [RegisterSlot<R>], name: &str) -> Option<&'t RegisterSlot<R>>
{
    if name.is_empty() {
        return None;
    }

    if let Some(exact) = table.iter().find(|slot| slot.name.eq_ignore_ascii_case(name)) {
        return Some(exact);
    }

    let mut candidates = table.iter().filter(|slot| has_prefix_ignore_case(slot.name, name));
    let first = candidates.next()?;
    match candidates.next() {
        Some(_) => None,
        None => Some(first),
    }
}

fn has_prefix_ignore_case(full: &str, prefix: &str) -> bool
{
    full.len() > prefix.len()
        && full.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// (E/R)FLAGS of the build target
#[cfg(target_arch = "x86_64")]
pub use ::x86::bits64::rflags::RFlags as CpuFlags;
/// (E/R)FLAGS of the build target
#[cfg(target_arch = "x86")]
pub use ::x86::bits32::eflags::EFlags as CpuFlags;

/// Trap flag: single-step after the next instruction
#[allow(clippy::unnecessary_cast)]
pub const TRAP_FLAG: u64 = CpuFlags::FLAGS_TF.bits() as u64;

/// Maskable interrupts enabled
#[allow(clippy::unnecessary_cast)]
pub const INTERRUPT_FLAG: u64 = CpuFlags::FLAGS_IF.bits() as u64;

/// CR0.WP: supervisor writes honour read-only pages
pub const WRITE_PROTECT: u64 = Cr0::CR0_WRITE_PROTECT.bits() as u64;

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_register_masks_match_hardware()
    {
        assert_eq!(TRAP_FLAG, 1 << 8);
        assert_eq!(INTERRUPT_FLAG, 1 << 9);
        assert_eq!(WRITE_PROTECT, 1 << 16);
    }

    #[test]
    fn test_resolve_exact_match_ignores_case()
    {
        let slot = resolve(DEBUG_REGISTERS, "DR7").map(|s| s.register);
        assert_eq!(slot, Some(DebugRegister::Dr7));
    }

    #[test]
    fn test_resolve_unique_prefix()
    {
        let slot = resolve(X86::REGISTERS, "fl").map(|s| s.name);
        assert_eq!(slot, Some("flags"));
    }

    #[test]
    fn test_resolve_rejects_ambiguous_prefix()
    {
        // si, sp and ss
        assert!(resolve(X86::REGISTERS, "s").is_none());
        // r15 .. r10
        assert!(resolve(X86_64::REGISTERS, "r1").is_none());
        assert!(resolve(DEBUG_REGISTERS, "dr").is_none());
    }

    #[test]
    fn test_resolve_prefers_exact_over_prefix()
    {
        // "cs" is complete even though nothing else starts with it
        assert_eq!(resolve(X86_64::REGISTERS, "cs").map(|s| s.name), Some("cs"));
        assert!(resolve(X86_64::REGISTERS, "").is_none());
        assert!(resolve(X86_64::REGISTERS, "zz").is_none());
    }

    #[test]
    fn test_name_tables_have_unique_entries()
    {
        fn check<R>(table: &[RegisterSlot<R>])
        {
            for (i, a) in table.iter().enumerate() {
                for b in &table[i + 1..] {
                    assert_ne!(a.name, b.name);
                }
            }
        }
        check(X86::REGISTERS);
        check(X86_64::REGISTERS);
        check(DEBUG_REGISTERS);
    }
}
