//! Hardware breakpoint manager against the simulated machine

use trapdoor_core::breakpoints::{BreakpointLength, BreakpointManager, BreakpointMode, DebugControl};
use trapdoor_core::platform::sim::{SimMachine, DR7_RESET};
use trapdoor_core::platform::{DebugRegister, Processor};
use trapdoor_core::{Address, CpuId, TrapdoorError};

#[test]
fn test_write_breakpoint_scenario()
{
    let machine = SimMachine::new(1);
    let manager = BreakpointManager::new(&machine);
    let cpu = CpuId(0);

    manager
        .install(cpu, 1, Address::new(0xABCD_0000), BreakpointMode::Write, BreakpointLength::Four)
        .unwrap();

    let status = manager.read_status(cpu).unwrap();
    let slot = status.slot(1).unwrap();
    assert_eq!(slot.mode, BreakpointMode::Write);
    assert_eq!(slot.length, BreakpointLength::Four);
    assert!(slot.global);
    assert!(slot.local);
    assert!(status.control.contains(DebugControl::GE));
    assert_eq!(machine.read_debug(DebugRegister::Dr1), 0xABCD_0000);

    manager.remove(cpu, 1).unwrap();
    let status = manager.read_status(cpu).unwrap();
    assert!(status.slot(1).unwrap().is_clear());
    for other in [0, 2, 3] {
        assert!(status.slot(other).unwrap().is_clear());
    }
    assert_eq!(machine.read_debug(DebugRegister::Dr1), 0);
}

#[test]
fn test_every_slot_is_independent()
{
    let machine = SimMachine::new(1);
    let manager = BreakpointManager::new(&machine);
    let cpu = CpuId(0);

    let modes = [
        (BreakpointMode::Execute, BreakpointLength::One),
        (BreakpointMode::Write, BreakpointLength::Two),
        (BreakpointMode::ReadWrite, BreakpointLength::Four),
        (BreakpointMode::Write, BreakpointLength::Eight),
    ];
    for (slot, (mode, length)) in modes.iter().enumerate() {
        let address = Address::new(0x1000 * (slot as u64 + 1));
        manager.install(cpu, slot as u8, address, *mode, *length).unwrap();
    }

    let before = manager.read_status(cpu).unwrap();
    manager.remove(cpu, 2).unwrap();
    let after = manager.read_status(cpu).unwrap();

    for slot in [0u8, 1, 3] {
        assert_eq!(before.slot(slot).unwrap(), after.slot(slot).unwrap());
    }
    assert!(after.slot(2).unwrap().is_clear());

    let slot3 = after.slot(3).unwrap();
    assert_eq!(slot3.mode, BreakpointMode::Write);
    assert_eq!(slot3.length, BreakpointLength::Eight);
}

#[test]
fn test_reserved_dr7_bit_survives()
{
    let machine = SimMachine::new(1);
    let manager = BreakpointManager::new(&machine);
    manager
        .install(CpuId(0), 0, Address::new(0x4000), BreakpointMode::Execute, BreakpointLength::One)
        .unwrap();
    manager.remove(CpuId(0), 0).unwrap();
    assert_eq!(machine.read_debug(DebugRegister::Dr7) & DR7_RESET, DR7_RESET);
}

#[test]
fn test_bad_slot_is_bad_register()
{
    let machine = SimMachine::new(1);
    let manager = BreakpointManager::new(&machine);
    let result = manager.install(CpuId(0), 4, Address::new(0x1000), BreakpointMode::Write, BreakpointLength::Four);
    assert!(matches!(result, Err(TrapdoorError::BadRegister(_))));
    assert!(matches!(manager.remove(CpuId(0), 7), Err(TrapdoorError::BadRegister(_))));
}

#[test]
fn test_slot_in_use()
{
    let machine = SimMachine::new(1);
    let manager = BreakpointManager::new(&machine);
    let cpu = CpuId(0);
    manager
        .install(cpu, 0, Address::new(0x1000), BreakpointMode::Write, BreakpointLength::Four)
        .unwrap();
    let second = manager.install(cpu, 0, Address::new(0x2000), BreakpointMode::Write, BreakpointLength::Four);
    assert_eq!(second, Err(TrapdoorError::SlotInUse { cpu, slot: 0 }));
    assert_eq!(manager.address(cpu, 0).unwrap(), Address::new(0x1000));
}

#[test]
fn test_invalid_combinations()
{
    let machine = SimMachine::new(1);
    let manager = BreakpointManager::new(&machine);
    let cpu = CpuId(0);

    let execute_wide = manager.install(cpu, 0, Address::new(0x1000), BreakpointMode::Execute, BreakpointLength::Four);
    assert!(matches!(execute_wide, Err(TrapdoorError::InvalidBreakpoint(_))));

    let unaligned = manager.install(cpu, 0, Address::new(0x1002), BreakpointMode::ReadWrite, BreakpointLength::Four);
    assert!(matches!(unaligned, Err(TrapdoorError::InvalidBreakpoint(_))));

    let io = manager.install(cpu, 0, Address::new(0x60), BreakpointMode::Io, BreakpointLength::One);
    assert!(matches!(io, Err(TrapdoorError::InvalidBreakpoint(_))));

    // nothing was armed
    assert!(manager.read_status(cpu).unwrap().slot(0).unwrap().is_clear());
}

#[test]
fn test_remote_processor_is_rejected()
{
    let machine = SimMachine::new(2);
    let manager = BreakpointManager::new(&machine);
    let result = manager.install(CpuId(1), 0, Address::new(0x1000), BreakpointMode::Write, BreakpointLength::Four);
    assert_eq!(
        result,
        Err(TrapdoorError::RemoteProcessor {
            requested: CpuId(1),
            current: CpuId(0)
        })
    );
    assert_eq!(machine.debug_register_of(CpuId(1), DebugRegister::Dr0), 0);
}

#[test]
fn test_breakpoints_stay_on_their_processor()
{
    let machine = SimMachine::new(2);
    let manager = BreakpointManager::new(&machine);
    machine.set_current(CpuId(1));
    manager
        .install(CpuId(1), 3, Address::new(0x8000), BreakpointMode::Write, BreakpointLength::Eight)
        .unwrap();

    assert_eq!(machine.debug_register_of(CpuId(1), DebugRegister::Dr3), 0x8000);
    assert_eq!(machine.debug_register_of(CpuId(0), DebugRegister::Dr3), 0);
    assert_eq!(machine.debug_register_of(CpuId(0), DebugRegister::Dr7), DR7_RESET);
}

#[test]
fn test_status_decoding_and_clear()
{
    let machine = SimMachine::new(1);
    let manager = BreakpointManager::new(&machine);
    let cpu = CpuId(0);

    // B1 and BS fired
    unsafe { machine.write_debug(DebugRegister::Dr6, 0xffff_4ff2) };
    let status = manager.read_status(cpu).unwrap();
    assert_eq!(status.triggered().collect::<Vec<_>>(), vec![1]);
    assert!(status.single_step());

    manager.clear_status(cpu).unwrap();
    let status = manager.read_status(cpu).unwrap();
    assert_eq!(status.triggered().count(), 0);
    assert!(!status.single_step());
}
