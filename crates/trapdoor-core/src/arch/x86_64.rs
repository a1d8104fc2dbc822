//! x86-64 layout

use super::{Architecture, RegisterSlot};
use crate::patch::gate::write_protected;
use crate::platform::Processor;

/// Marker for 64-bit kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct X86_64;

/// Registers saved by the x86-64 trap entry stub
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrapFrame
{
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub bp: u64,
    pub bx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub ax: u64,
    pub cx: u64,
    pub dx: u64,
    pub si: u64,
    pub di: u64,
    pub orig_ax: u64,
    pub ip: u64,
    pub cs: u64,
    pub flags: u64,
    pub sp: u64,
    pub ss: u64,
}

/// 16-byte interrupt/trap gate
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateDescriptor
{
    pub offset_low: u16,
    pub selector: u16,
    /// IST index, type, DPL and present
    pub attributes: u16,
    pub offset_mid: u16,
    pub offset_high: u32,
    pub reserved: u32,
}

/// `rbx rbp r12 r13 r14 r15 rsp rip`
#[repr(C)]
#[derive(Debug, Default)]
pub struct JumpBuffer
{
    pub slots: [u64; 8],
}

/// x86-64 general register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum X86_64Register
{
    R15,
    R14,
    R13,
    R12,
    Bp,
    Bx,
    R11,
    R10,
    R9,
    R8,
    Ax,
    Cx,
    Dx,
    Si,
    Di,
    OrigAx,
    Ip,
    Cs,
    Flags,
    Sp,
    Ss,
}

impl Architecture for X86_64
{
    const NAME: &'static str = "x86_64";
    const WORD_BYTES: u64 = 8;
    const KERNEL_CS: u64 = 0x10;
    const LIVE_STACK_POINTER: &'static str = "crsp";
    const FAULT_STACK_POINTER: &'static str = "krsp";
    const REGISTERS_PER_LINE: usize = 2;

    type Register = X86_64Register;
    type TrapFrame = TrapFrame;
    type GateDescriptor = GateDescriptor;
    type JumpBuffer = JumpBuffer;

    const REGISTERS: &'static [RegisterSlot<X86_64Register>] = &[
        RegisterSlot::new("r15", X86_64Register::R15),
        RegisterSlot::new("r14", X86_64Register::R14),
        RegisterSlot::new("r13", X86_64Register::R13),
        RegisterSlot::new("r12", X86_64Register::R12),
        RegisterSlot::new("bp", X86_64Register::Bp),
        RegisterSlot::new("bx", X86_64Register::Bx),
        RegisterSlot::new("r11", X86_64Register::R11),
        RegisterSlot::new("r10", X86_64Register::R10),
        RegisterSlot::new("r9", X86_64Register::R9),
        RegisterSlot::new("r8", X86_64Register::R8),
        RegisterSlot::new("ax", X86_64Register::Ax),
        RegisterSlot::new("cx", X86_64Register::Cx),
        RegisterSlot::new("dx", X86_64Register::Dx),
        RegisterSlot::new("si", X86_64Register::Si),
        RegisterSlot::new("di", X86_64Register::Di),
        RegisterSlot::new("orig_ax", X86_64Register::OrigAx),
        RegisterSlot::new("ip", X86_64Register::Ip),
        RegisterSlot::new("cs", X86_64Register::Cs),
        RegisterSlot::new("flags", X86_64Register::Flags),
        RegisterSlot::new("sp", X86_64Register::Sp),
        RegisterSlot::new("ss", X86_64Register::Ss),
    ];

    const STACK_POINTER: X86_64Register = X86_64Register::Sp;
    const STACK_SEGMENT: X86_64Register = X86_64Register::Ss;
    const CODE_SEGMENT: X86_64Register = X86_64Register::Cs;
    const FLAGS: X86_64Register = X86_64Register::Flags;
    const INSTRUCTION_POINTER: X86_64Register = X86_64Register::Ip;

    fn read(frame: &TrapFrame, register: X86_64Register) -> u64
    {
        *field(frame, register)
    }

    fn write(frame: &mut TrapFrame, register: X86_64Register, value: u64)
    {
        *field_mut(frame, register) = value;
    }

    fn gate_handler(gate: &GateDescriptor) -> u64
    {
        u64::from(gate.offset_low) | (u64::from(gate.offset_mid) << 16) | (u64::from(gate.offset_high) << 32)
    }

    unsafe fn store_gate_handler<P: Processor>(gate: *mut GateDescriptor, handler: u64, processor: &P)
    {
        // SAFETY: caller guarantees `gate` is a live descriptor
        unsafe {
            write_protected(processor, &raw mut (*gate).offset_low, handler as u16);
            write_protected(processor, &raw mut (*gate).offset_mid, (handler >> 16) as u16);
            write_protected(processor, &raw mut (*gate).offset_high, (handler >> 32) as u32);
        }
    }
}

fn field(frame: &TrapFrame, register: X86_64Register) -> &u64
{
    match register {
        X86_64Register::R15 => &frame.r15,
        X86_64Register::R14 => &frame.r14,
        X86_64Register::R13 => &frame.r13,
        X86_64Register::R12 => &frame.r12,
        X86_64Register::Bp => &frame.bp,
        X86_64Register::Bx => &frame.bx,
        X86_64Register::R11 => &frame.r11,
        X86_64Register::R10 => &frame.r10,
        X86_64Register::R9 => &frame.r9,
        X86_64Register::R8 => &frame.r8,
        X86_64Register::Ax => &frame.ax,
        X86_64Register::Cx => &frame.cx,
        X86_64Register::Dx => &frame.dx,
        X86_64Register::Si => &frame.si,
        X86_64Register::Di => &frame.di,
        X86_64Register::OrigAx => &frame.orig_ax,
        X86_64Register::Ip => &frame.ip,
        X86_64Register::Cs => &frame.cs,
        X86_64Register::Flags => &frame.flags,
        X86_64Register::Sp => &frame.sp,
        X86_64Register::Ss => &frame.ss,
    }
}

fn field_mut(frame: &mut TrapFrame, register: X86_64Register) -> &mut u64
{
    match register {
        X86_64Register::R15 => &mut frame.r15,
        X86_64Register::R14 => &mut frame.r14,
        X86_64Register::R13 => &mut frame.r13,
        X86_64Register::R12 => &mut frame.r12,
        X86_64Register::Bp => &mut frame.bp,
        X86_64Register::Bx => &mut frame.bx,
        X86_64Register::R11 => &mut frame.r11,
        X86_64Register::R10 => &mut frame.r10,
        X86_64Register::R9 => &mut frame.r9,
        X86_64Register::R8 => &mut frame.r8,
        X86_64Register::Ax => &mut frame.ax,
        X86_64Register::Cx => &mut frame.cx,
        X86_64Register::Dx => &mut frame.dx,
        X86_64Register::Si => &mut frame.si,
        X86_64Register::Di => &mut frame.di,
        X86_64Register::OrigAx => &mut frame.orig_ax,
        X86_64Register::Ip => &mut frame.ip,
        X86_64Register::Cs => &mut frame.cs,
        X86_64Register::Flags => &mut frame.flags,
        X86_64Register::Sp => &mut frame.sp,
        X86_64Register::Ss => &mut frame.ss,
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_layout_sizes()
    {
        assert_eq!(core::mem::size_of::<TrapFrame>(), 21 * 8);
        assert_eq!(core::mem::size_of::<GateDescriptor>(), 16);
    }

    #[test]
    fn test_gate_handler_reassembly()
    {
        let gate = GateDescriptor {
            offset_low: 0x5678,
            selector: 0x10,
            attributes: 0x8e00,
            offset_mid: 0x1234,
            offset_high: 0xffff_ffff,
            reserved: 0,
        };
        assert_eq!(X86_64::gate_handler(&gate), 0xffff_ffff_1234_5678);
    }

    #[test]
    fn test_kernel_frame_detection()
    {
        let mut frame = TrapFrame {
            cs: 0x10,
            ..TrapFrame::default()
        };
        assert!(X86_64::is_kernel_frame(&frame));
        frame.cs = 0x33;
        assert!(!X86_64::is_kernel_frame(&frame));
    }
}
