//! 32-bit x86 (i386) layout

use super::{Architecture, RegisterSlot};
use crate::patch::gate::write_protected;
use crate::platform::Processor;

/// Marker for 32-bit kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct X86;

/// Registers saved by the i386 trap entry stub
///
/// `sp` and `ss` are only pushed by the CPU on a privilege change. For a
/// trap taken in kernel mode those two words lie beyond the real frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrapFrame
{
    pub bx: u32,
    pub cx: u32,
    pub dx: u32,
    pub si: u32,
    pub di: u32,
    pub bp: u32,
    pub ax: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub orig_ax: u32,
    pub ip: u32,
    pub cs: u32,
    pub flags: u32,
    pub sp: u32,
    pub ss: u32,
}

/// 8-byte interrupt/trap gate
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateDescriptor
{
    pub offset_low: u16,
    pub selector: u16,
    /// Reserved byte followed by type, DPL and present
    pub attributes: u16,
    pub offset_high: u16,
}

/// `ebx esi edi ebp esp eip`
#[repr(C)]
#[derive(Debug, Default)]
pub struct JumpBuffer
{
    pub slots: [u32; 6],
}

/// i386 general register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum X86Register
{
    Ax,
    Bx,
    Cx,
    Dx,
    Si,
    Di,
    Sp,
    Ip,
    Bp,
    Ss,
    Cs,
    Flags,
    Ds,
    Es,
    OrigAx,
}

impl Architecture for X86
{
    const NAME: &'static str = "i386";
    const WORD_BYTES: u64 = 4;
    const KERNEL_CS: u64 = 0x60;
    const LIVE_STACK_POINTER: &'static str = "cesp";
    const FAULT_STACK_POINTER: &'static str = "kesp";
    const REGISTERS_PER_LINE: usize = 4;

    type Register = X86Register;
    type TrapFrame = TrapFrame;
    type GateDescriptor = GateDescriptor;
    type JumpBuffer = JumpBuffer;

    const REGISTERS: &'static [RegisterSlot<X86Register>] = &[
        RegisterSlot::new("ax", X86Register::Ax),
        RegisterSlot::new("bx", X86Register::Bx),
        RegisterSlot::new("cx", X86Register::Cx),
        RegisterSlot::new("dx", X86Register::Dx),
        RegisterSlot::new("si", X86Register::Si),
        RegisterSlot::new("di", X86Register::Di),
        RegisterSlot::new("sp", X86Register::Sp),
        RegisterSlot::new("ip", X86Register::Ip),
        RegisterSlot::new("bp", X86Register::Bp),
        RegisterSlot::new("ss", X86Register::Ss),
        RegisterSlot::new("cs", X86Register::Cs),
        RegisterSlot::new("flags", X86Register::Flags),
        RegisterSlot::new("ds", X86Register::Ds),
        RegisterSlot::new("es", X86Register::Es),
        RegisterSlot::new("origax", X86Register::OrigAx),
    ];

    const STACK_POINTER: X86Register = X86Register::Sp;
    const STACK_SEGMENT: X86Register = X86Register::Ss;
    const CODE_SEGMENT: X86Register = X86Register::Cs;
    const FLAGS: X86Register = X86Register::Flags;
    const INSTRUCTION_POINTER: X86Register = X86Register::Ip;

    fn read(frame: &TrapFrame, register: X86Register) -> u64
    {
        u64::from(*field(frame, register))
    }

    fn write(frame: &mut TrapFrame, register: X86Register, value: u64)
    {
        *field_mut(frame, register) = value as u32;
    }

    fn gate_handler(gate: &GateDescriptor) -> u64
    {
        u64::from(gate.offset_low) | (u64::from(gate.offset_high) << 16)
    }

    unsafe fn store_gate_handler<P: Processor>(gate: *mut GateDescriptor, handler: u64, processor: &P)
    {
        // SAFETY: caller guarantees `gate` is a live descriptor
        unsafe {
            write_protected(processor, &raw mut (*gate).offset_low, handler as u16);
            write_protected(processor, &raw mut (*gate).offset_high, (handler >> 16) as u16);
        }
    }
}

fn field(frame: &TrapFrame, register: X86Register) -> &u32
{
    match register {
        X86Register::Ax => &frame.ax,
        X86Register::Bx => &frame.bx,
        X86Register::Cx => &frame.cx,
        X86Register::Dx => &frame.dx,
        X86Register::Si => &frame.si,
        X86Register::Di => &frame.di,
        X86Register::Sp => &frame.sp,
        X86Register::Ip => &frame.ip,
        X86Register::Bp => &frame.bp,
        X86Register::Ss => &frame.ss,
        X86Register::Cs => &frame.cs,
        X86Register::Flags => &frame.flags,
        X86Register::Ds => &frame.ds,
        X86Register::Es => &frame.es,
        X86Register::OrigAx => &frame.orig_ax,
    }
}

fn field_mut(frame: &mut TrapFrame, register: X86Register) -> &mut u32
{
    match register {
        X86Register::Ax => &mut frame.ax,
        X86Register::Bx => &mut frame.bx,
        X86Register::Cx => &mut frame.cx,
        X86Register::Dx => &mut frame.dx,
        X86Register::Si => &mut frame.si,
        X86Register::Di => &mut frame.di,
        X86Register::Sp => &mut frame.sp,
        X86Register::Ip => &mut frame.ip,
        X86Register::Bp => &mut frame.bp,
        X86Register::Ss => &mut frame.ss,
        X86Register::Cs => &mut frame.cs,
        X86Register::Flags => &mut frame.flags,
        X86Register::Ds => &mut frame.ds,
        X86Register::Es => &mut frame.es,
        X86Register::OrigAx => &mut frame.orig_ax,
    }
}
