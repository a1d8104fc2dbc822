//! Register access facade against the simulated machine

use std::mem::size_of;

use trapdoor_core::arch::{x86, x86_64, Architecture, X86, X86_64};
use trapdoor_core::platform::sim::{SimMachine, DR7_RESET};
use trapdoor_core::platform::{ControlRegister, DebugRegister, Processor};
use trapdoor_core::registers::RegisterAccess;
use trapdoor_core::{Address, TrapdoorError};

fn user_frame_x86_64() -> x86_64::TrapFrame
{
    x86_64::TrapFrame {
        r15: 15,
        r14: 14,
        r13: 13,
        r12: 12,
        bp: 0x7ffc_0000_1000,
        bx: 0xb,
        r11: 11,
        r10: 10,
        r9: 9,
        r8: 8,
        ax: 0xa,
        cx: 0xc,
        dx: 0xd,
        si: 0x51,
        di: 0xd1,
        orig_ax: 0x3c,
        ip: 0x4010_00,
        cs: 0x33,
        flags: 0x246,
        sp: 0x7ffc_0000_0ff8,
        ss: 0x2b,
    }
}

fn kernel_frame_x86() -> x86::TrapFrame
{
    x86::TrapFrame {
        ax: 1,
        bx: 2,
        cx: 3,
        dx: 4,
        cs: 0x60,
        flags: 0x202,
        ip: 0xc010_0000,
        sp: 0xdead,
        ss: 0xbeef,
        ..x86::TrapFrame::default()
    }
}

fn address_of<T>(value: &T) -> u64
{
    Address::from_ptr(value).value()
}

/// Read every register and write the value back; kernel-frame `sp`/`ss`
/// must be refused and leave the frame alone
fn assert_round_trip<A: Architecture>(frame: &mut A::TrapFrame)
where
    A::TrapFrame: PartialEq,
{
    let machine = SimMachine::new(1);
    let registers = RegisterAccess::<A, _>::new(&machine);
    let pristine = frame.clone();
    let kernel = A::is_kernel_frame(frame);

    for slot in A::REGISTERS {
        let value = registers.get(slot.name, Some(&*frame)).unwrap();
        let result = registers.set(slot.name, Some(&mut *frame), value);
        let stack = slot.register == A::STACK_POINTER || slot.register == A::STACK_SEGMENT;
        if kernel && stack {
            assert_eq!(result, Err(TrapdoorError::bad_register(slot.name)));
        } else {
            assert_eq!(result, Ok(()), "register {}", slot.name);
        }
        assert!(*frame == pristine, "register {}", slot.name);
    }
}

#[test]
fn test_get_then_set_is_a_noop_for_every_register()
{
    assert_round_trip::<X86_64>(&mut user_frame_x86_64());
}

#[test]
fn test_get_then_set_is_a_noop_on_kernel_frames()
{
    let mut frame = x86_64::TrapFrame {
        cs: 0x10,
        ..user_frame_x86_64()
    };
    assert_round_trip::<X86_64>(&mut frame);
    assert_round_trip::<X86>(&mut kernel_frame_x86());
}

#[test]
fn test_get_then_set_is_a_noop_on_user_frames_x86()
{
    let mut frame = x86::TrapFrame {
        cs: 0x73,
        ss: 0x7b,
        ..kernel_frame_x86()
    };
    assert_round_trip::<X86>(&mut frame);
}

#[test]
fn test_kernel_frame_stack_slots_are_read_only()
{
    let machine = SimMachine::new(1);
    let registers = RegisterAccess::<X86, _>::new(&machine);
    let mut frame = kernel_frame_x86();

    assert_eq!(registers.set("sp", Some(&mut frame), 0x1111), Err(TrapdoorError::bad_register("sp")));
    assert_eq!(registers.set("ss", Some(&mut frame), 0x2222), Err(TrapdoorError::bad_register("ss")));
    assert_eq!((frame.sp, frame.ss), (0xdead, 0xbeef));

    registers.set("ax", Some(&mut frame), 0x1111).unwrap();
    assert_eq!(frame.ax, 0x1111);
}

#[test]
fn test_set_touches_only_the_named_register()
{
    let machine = SimMachine::new(1);
    let registers = RegisterAccess::<X86_64, _>::new(&machine);
    let mut frame = user_frame_x86_64();

    registers.set("r9", Some(&mut frame), 0x99).unwrap();
    let expected = x86_64::TrapFrame {
        r9: 0x99,
        ..user_frame_x86_64()
    };
    assert_eq!(frame, expected);
}

#[test]
fn test_unknown_name_is_bad_register()
{
    let machine = SimMachine::new(1);
    let registers = RegisterAccess::<X86_64, _>::new(&machine);
    let frame = user_frame_x86_64();

    assert_eq!(registers.get("zz", Some(&frame)), Err(TrapdoorError::bad_register("zz")));
    // ambiguous: r15, r14, ... r10
    assert!(matches!(registers.get("r1", Some(&frame)), Err(TrapdoorError::BadRegister(_))));
    // orig_ax only exists on x86-64, origax only on i386
    assert!(registers.get("origax", Some(&frame)).is_err());
}

#[test]
fn test_names_ignore_case_and_accept_unique_prefixes()
{
    let machine = SimMachine::new(1);
    let registers = RegisterAccess::<X86_64, _>::new(&machine);
    let frame = user_frame_x86_64();

    assert_eq!(registers.get("AX", Some(&frame)), Ok(0xa));
    assert_eq!(registers.get("fl", Some(&frame)), Ok(0x246));
    assert_eq!(registers.get("orig", Some(&frame)), Ok(0x3c));
}

#[test]
fn test_missing_frame_is_reported_distinctly()
{
    let machine = SimMachine::new(1);
    let registers = RegisterAccess::<X86_64, _>::new(&machine);

    assert_eq!(registers.get("ax", None), Err(TrapdoorError::MissingFrame));
    assert_eq!(registers.get("&regs", None), Err(TrapdoorError::MissingFrame));
    assert_eq!(registers.set("ax", None, 1), Err(TrapdoorError::MissingFrame));

    // no frame needed for these
    assert_eq!(registers.get("dr7", None), Ok(DR7_RESET));
    assert_eq!(registers.get("crsp", None), Ok(machine.stack_pointer()));
    assert_eq!(registers.get("ceflags", None), Ok(machine.flags()));
}

#[test]
fn test_kernel_frame_stack_correction_x86_64()
{
    let machine = SimMachine::new(1);
    machine.set_stack(0xffff_c900_0000_2000, 0x18);
    let registers = RegisterAccess::<X86_64, _>::new(&machine);
    let frame = x86_64::TrapFrame {
        cs: 0x10,
        sp: 0x1111,
        ss: 0x2222,
        ..x86_64::TrapFrame::default()
    };

    let naive = address_of(&frame) + size_of::<x86_64::TrapFrame>() as u64;
    assert_eq!(registers.get("sp", Some(&frame)), Ok(naive - 16));
    assert_eq!(registers.get("krsp", Some(&frame)), Ok(naive - 16));
    assert_eq!(registers.get("ss", Some(&frame)), Ok(0x18));
}

#[test]
fn test_kernel_frame_stack_correction_x86()
{
    let machine = SimMachine::new(1);
    machine.set_stack(0xc0ff_e000, 0x68);
    let registers = RegisterAccess::<X86, _>::new(&machine);
    let frame = kernel_frame_x86();

    let naive = address_of(&frame) + size_of::<x86::TrapFrame>() as u64;
    assert_eq!(registers.get("sp", Some(&frame)), Ok(naive - 8));
    assert_eq!(registers.get("kesp", Some(&frame)), Ok(naive - 8));
    assert_eq!(registers.get("ss", Some(&frame)), Ok(0x68));
    assert_eq!(registers.get("cesp", None), Ok(0xc0ff_e000));
}

#[test]
fn test_user_frame_reads_saved_stack()
{
    let machine = SimMachine::new(1);
    let registers = RegisterAccess::<X86_64, _>::new(&machine);
    let frame = user_frame_x86_64();

    assert_eq!(registers.get("sp", Some(&frame)), Ok(frame.sp));
    assert_eq!(registers.get("ss", Some(&frame)), Ok(frame.ss));
    let end = address_of(&frame) + size_of::<x86_64::TrapFrame>() as u64;
    assert_eq!(registers.get("krsp", Some(&frame)), Ok(end));
    assert_eq!(registers.get("&regs", Some(&frame)), Ok(address_of(&frame)));
}

#[test]
fn test_pseudo_registers_are_read_only()
{
    let machine = SimMachine::new(1);
    let registers = RegisterAccess::<X86_64, _>::new(&machine);
    let mut frame = user_frame_x86_64();

    for name in ["crsp", "ceflags", "&regs", "krsp"] {
        assert!(
            matches!(registers.set(name, Some(&mut frame), 0), Err(TrapdoorError::BadRegister(_))),
            "{name}"
        );
    }
    assert_eq!(frame, user_frame_x86_64());
}

#[test]
fn test_debug_registers_by_name()
{
    let machine = SimMachine::new(1);
    let registers = RegisterAccess::<X86_64, _>::new(&machine);

    registers.set("DR2", None, 0xffff_8000_0000_1000).unwrap();
    assert_eq!(machine.read_debug(DebugRegister::Dr2), 0xffff_8000_0000_1000);
    assert_eq!(registers.get("dr2", None), Ok(0xffff_8000_0000_1000));
    // dr4 and dr5 are not addressable
    assert!(matches!(registers.get("dr4", None), Err(TrapdoorError::MissingFrame)));
}

#[test]
fn test_user_entry_frame_with_marker()
{
    let machine = SimMachine::new(1);
    let registers = RegisterAccess::<X86_64, _>::new(&machine);
    let saved = Box::into_raw(Box::new(user_frame_x86_64()));
    let top = Address::from_ptr(saved) + size_of::<x86_64::TrapFrame>() as u64;
    machine.set_kernel_stack_top(Some(top));

    assert_eq!(registers.get("%ax", None), Ok(0xa));
    assert_eq!(registers.get("%&regs", None), Ok(Address::from_ptr(saved).value()));
    registers.set("%bx", None, 0x77).unwrap();

    // SAFETY: leaked above, nothing else holds it
    let saved = unsafe { Box::from_raw(saved) };
    assert_eq!(saved.bx, 0x77);
    assert_eq!(saved.ax, 0xa);
}

#[test]
fn test_marker_without_kernel_stack_is_missing_frame()
{
    let machine = SimMachine::new(1);
    let registers = RegisterAccess::<X86_64, _>::new(&machine);
    let frame = user_frame_x86_64();
    assert_eq!(registers.get("%ax", Some(&frame)), Err(TrapdoorError::MissingFrame));
}

#[test]
fn test_instruction_pointer()
{
    let machine = SimMachine::new(1);
    let registers = RegisterAccess::<X86, _>::new(&machine);
    let mut frame = kernel_frame_x86();

    assert_eq!(registers.instruction_pointer(None), 0);
    assert_eq!(registers.instruction_pointer(Some(&frame)), 0xc010_0000);
    assert!(!registers.ip_adjusted());

    assert_eq!(registers.set_instruction_pointer(None, 1), Err(TrapdoorError::MissingFrame));
    registers.set_instruction_pointer(Some(&mut frame), 0xc010_0001).unwrap();
    assert_eq!(frame.ip, 0xc010_0001);
    assert!(registers.ip_adjusted());
}

#[test]
fn test_general_dump_x86_64()
{
    let machine = SimMachine::new(1);
    let registers = RegisterAccess::<X86_64, _>::new(&machine);
    let frame = user_frame_x86_64();

    let dump = registers.dump(None, Some(&frame)).unwrap();
    assert_eq!(dump.entries().len(), X86_64::REGISTERS.len());
    assert_eq!(dump.value("flags"), Some(0x246));
    assert_eq!(dump.frame_address(), Some(address_of(&frame)));

    let text = dump.to_string();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "     r15 = 0x000000000000000f      r14 = 0x000000000000000e");
    assert!(lines.last().unwrap().starts_with("&regs = 0x"));
    // 21 registers two per line, then &regs
    assert_eq!(lines.len(), 12);
}

#[test]
fn test_general_dump_x86()
{
    let machine = SimMachine::new(1);
    machine.set_stack(0xc0ff_e000, 0x68);
    let registers = RegisterAccess::<X86, _>::new(&machine);
    let frame = kernel_frame_x86();

    let text = registers.dump(Some(""), Some(&frame)).unwrap().to_string();
    let first = text.lines().next().unwrap();
    assert_eq!(first, "ax = 0x00000001 bx = 0x00000002 cx = 0x00000003 dx = 0x00000004");
    assert!(text.contains("ss = 0x00000068"));
}

#[test]
fn test_debug_and_control_dumps()
{
    let machine = SimMachine::new(1);
    machine.set_control(ControlRegister::Cr3, 0x1a2b_3000);
    let registers = RegisterAccess::<X86_64, _>::new(&machine);

    let debug = registers.dump(Some("d"), None).unwrap();
    assert_eq!(debug.value("dr7"), Some(DR7_RESET));
    assert_eq!(
        debug.to_string(),
        "dr0 = 0x00000000  dr1 = 0x00000000  dr2 = 0x00000000  dr3 = 0x00000000\ndr6 = 0xffff0ff0  dr7 = 0x00000400\n"
    );

    let control = registers.dump(Some("c"), None).unwrap();
    assert_eq!(control.value("cr3"), Some(0x1a2b_3000));
    assert_eq!(control.entries().len(), 4);
}

#[test]
fn test_dump_rejects_unknown_kind()
{
    let machine = SimMachine::new(1);
    let registers = RegisterAccess::<X86_64, _>::new(&machine);
    assert!(matches!(registers.dump(Some("r"), None), Err(TrapdoorError::BadRegister(_))));
    assert_eq!(registers.dump(None, None).err(), Some(TrapdoorError::MissingFrame));
}

#[test]
fn test_user_dump_uses_task_frame()
{
    let machine = SimMachine::new(1);
    let registers = RegisterAccess::<X86_64, _>::new(&machine);
    let saved = Box::new(user_frame_x86_64());
    let top = Address::from_ptr(&*saved) + size_of::<x86_64::TrapFrame>() as u64;
    machine.set_kernel_stack_top(Some(top));

    let dump = registers.dump(Some("u"), None).unwrap();
    assert_eq!(dump.value("ip"), Some(0x4010_00));
    assert_eq!(dump.frame_address(), Some(address_of(&*saved)));
}
