//! Trap vector and inline hook patching against the simulated machine

use std::cell::{Cell, UnsafeCell};
use std::mem::size_of;
use std::ptr::{self, NonNull};

use trapdoor_core::arch::{x86, x86_64, Architecture, X86, X86_64};
use trapdoor_core::patch::inline::jump_bytes;
use trapdoor_core::patch::vector::{BREAKPOINT_VECTOR, DEBUG_VECTOR};
use trapdoor_core::patch::{ExceptionHooks, HookRecord, HookTarget, InlineHook, VectorTable, HOOK_LENGTH, JMP_REL32};
use trapdoor_core::platform::sim::SimMachine;
use trapdoor_core::platform::{ControlRegister, DescriptorTable, PageMapper, Processor};
use trapdoor_core::{Address, TrapdoorError};

fn table_of<T>(gates: &mut [T]) -> DescriptorTable
{
    DescriptorTable {
        limit: (size_of::<T>() * gates.len() - 1) as u16,
        base: Address::from_ptr(gates.as_mut_ptr()).value(),
    }
}

fn x86_64_gates() -> Vec<x86_64::GateDescriptor>
{
    (0..32u64)
        .map(|vector| {
            let handler = 0xffff_ffff_8100_0000 + vector * 0x40;
            x86_64::GateDescriptor {
                offset_low: handler as u16,
                selector: 0x10,
                attributes: 0x8e00,
                offset_mid: (handler >> 16) as u16,
                offset_high: (handler >> 32) as u32,
                reserved: 0,
            }
        })
        .collect()
}

#[test]
fn test_vector_hook_then_unhook_restores_entry_x86_64()
{
    let machine = SimMachine::new(1);
    let mut gates = x86_64_gates();
    let pristine = gates.clone();
    machine.set_interrupt_table(table_of(&mut gates));

    let table = unsafe { VectorTable::<X86_64, _>::new(&machine) };
    for vector in [0u8, DEBUG_VECTOR, BREAKPOINT_VECTOR, 31] {
        let replacement = Address::new(0xffff_ffff_c000_1230 + u64::from(vector));
        let previous = unsafe { table.hook(vector, replacement) }.unwrap();
        assert_eq!(previous.value(), X86_64::gate_handler(&pristine[usize::from(vector)]));
        assert_eq!(table.handler(vector).unwrap(), replacement);

        unsafe { table.unhook(vector, previous) }.unwrap();
        assert_eq!(table.handler(vector).unwrap(), previous);
    }
    assert_eq!(gates, pristine);
}

#[test]
fn test_vector_hook_keeps_selector_and_attributes()
{
    let machine = SimMachine::new(1);
    let mut gates = x86_64_gates();
    machine.set_interrupt_table(table_of(&mut gates));

    let table = unsafe { VectorTable::<X86_64, _>::new(&machine) };
    unsafe { table.hook(DEBUG_VECTOR, Address::new(0x1234_5678_9abc_def0)) }.unwrap();

    let gate = gates[usize::from(DEBUG_VECTOR)];
    assert_eq!(gate.selector, 0x10);
    assert_eq!(gate.attributes, 0x8e00);
    assert_eq!(gate.offset_low, 0xdef0);
    assert_eq!(gate.offset_mid, 0x9abc);
    assert_eq!(gate.offset_high, 0x1234_5678);
}

#[test]
fn test_vector_hook_then_unhook_restores_entry_x86()
{
    let machine = SimMachine::new(1);
    let mut gates: Vec<x86::GateDescriptor> = (0..32u16)
        .map(|vector| x86::GateDescriptor {
            offset_low: 0x1000 + vector,
            selector: 0x60,
            attributes: 0x8e00,
            offset_high: 0xc100,
        })
        .collect();
    let pristine = gates.clone();
    machine.set_interrupt_table(table_of(&mut gates));

    let table = unsafe { VectorTable::<X86, _>::new(&machine) };
    let previous = unsafe { table.hook(BREAKPOINT_VECTOR, Address::new(0xc8ab_cdef)) }.unwrap();
    assert_eq!(previous, Address::new(0xc100_1003));
    assert_eq!(table.handler(BREAKPOINT_VECTOR).unwrap(), Address::new(0xc8ab_cdef));

    unsafe { table.unhook(BREAKPOINT_VECTOR, previous) }.unwrap();
    assert_eq!(gates, pristine);
}

#[test]
fn test_vector_hook_splits_handler_x86()
{
    let machine = SimMachine::new(1);
    let mut gates = vec![x86::GateDescriptor::default(); 8];
    machine.set_interrupt_table(table_of(&mut gates));

    let table = unsafe { VectorTable::<X86, _>::new(&machine) };
    unsafe { table.hook(DEBUG_VECTOR, Address::new(0xc8ab_cdef)) }.unwrap();

    assert_eq!(gates[1].offset_low, 0xcdef);
    assert_eq!(gates[1].offset_high, 0xc8ab);
    assert_eq!(gates[0], x86::GateDescriptor::default());
}

#[test]
fn test_vector_edits_restore_write_protect()
{
    let machine = SimMachine::new(1);
    let mut gates = x86_64_gates();
    machine.set_interrupt_table(table_of(&mut gates));
    let cr0 = machine.read_control(ControlRegister::Cr0);

    let table = unsafe { VectorTable::<X86_64, _>::new(&machine) };
    unsafe { table.hook(DEBUG_VECTOR, Address::new(0xffff_ffff_a000_0000)) }.unwrap();

    assert_eq!(machine.read_control(ControlRegister::Cr0), cr0);
    // one gate per field: low, mid, high
    assert_eq!(machine.counters().write_protect_cleared, 3);
}

#[test]
fn test_vector_beyond_limit_is_rejected()
{
    let machine = SimMachine::new(1);
    let mut gates = x86_64_gates();
    machine.set_interrupt_table(table_of(&mut gates));

    let table = unsafe { VectorTable::<X86_64, _>::new(&machine) };
    assert_eq!(
        table.handler(32),
        Err(TrapdoorError::VectorOutOfRange {
            vector: 32,
            limit: (32 * 16 - 1) as u16
        })
    );
    assert!(unsafe { table.hook(255, Address::new(0)) }.is_err());
}

/// Page-aligned scratch memory standing in for kernel text
#[repr(C, align(4096))]
struct Text(UnsafeCell<[u8; TEXT_SIZE]>);

const TEXT_SIZE: usize = 8192;

impl Text
{
    fn new() -> Box<Self>
    {
        let mut bytes = [0u8; TEXT_SIZE];
        for (index, byte) in bytes.iter_mut().enumerate() {
            *byte = (index % 251) as u8;
        }
        Box::new(Text(UnsafeCell::new(bytes)))
    }

    fn address(&self, offset: usize) -> Address
    {
        Address::from_ptr(self.0.get().cast::<u8>()) + offset as u64
    }

    fn bytes<const N: usize>(&self, offset: usize) -> [u8; N]
    {
        let mut out = [0u8; N];
        for (index, byte) in out.iter_mut().enumerate() {
            // SAFETY: offsets used by the tests stay inside the buffer
            *byte = unsafe { ptr::read_volatile(self.0.get().cast::<u8>().add(offset + index)) };
        }
        out
    }

    fn snapshot(&self) -> [u8; TEXT_SIZE]
    {
        self.bytes::<TEXT_SIZE>(0)
    }
}

#[test]
fn test_inline_install_and_remove_restores_bytes()
{
    let machine = SimMachine::new(1);
    let text = Text::new();
    let target = text.address(0x100);
    let replacement = text.address(0x1800);
    let original = text.bytes::<HOOK_LENGTH>(0x100);

    let hooks = InlineHook::new(&machine);
    let mut record = HookRecord::new();
    unsafe { hooks.install(&mut record, target, replacement) }.unwrap();

    assert!(record.is_installed());
    assert_eq!(record.saved_bytes(), &original);
    assert_eq!(text.bytes::<1>(0x100), [JMP_REL32]);
    assert_eq!(text.bytes::<HOOK_LENGTH>(0x100), jump_bytes(target, replacement).unwrap());

    unsafe { hooks.remove(&mut record) }.unwrap();
    assert!(!record.is_installed());
    assert_eq!(text.bytes::<HOOK_LENGTH>(0x100), original);

    let counters = machine.counters();
    assert_eq!(counters.maps, 2);
    assert_eq!(counters.maps, counters.unmaps);
}

#[test]
fn test_inline_hook_across_page_boundary()
{
    let machine = SimMachine::new(1);
    let text = Text::new();
    let target = text.address(4094);
    let original = text.bytes::<HOOK_LENGTH>(4094);

    let hooks = InlineHook::new(&machine);
    let mut record = HookRecord::new();
    unsafe { hooks.install(&mut record, target, text.address(0)) }.unwrap();
    assert_eq!(machine.counters().maps, 2);
    assert_eq!(text.bytes::<1>(4094), [JMP_REL32]);

    unsafe { hooks.remove(&mut record) }.unwrap();
    assert_eq!(text.bytes::<HOOK_LENGTH>(4094), original);
    assert_eq!(machine.counters().unmaps, 4);
}

#[test]
fn test_inline_hook_twice_is_rejected()
{
    let machine = SimMachine::new(1);
    let text = Text::new();
    let target = text.address(0x40);

    let hooks = InlineHook::new(&machine);
    let mut record = HookRecord::new();
    unsafe { hooks.install(&mut record, target, text.address(0x400)) }.unwrap();
    let again = unsafe { hooks.install(&mut record, target, text.address(0x800)) };
    assert_eq!(again, Err(TrapdoorError::AlreadyHooked(target)));

    // the first jump is still the one in place
    assert_eq!(text.bytes::<HOOK_LENGTH>(0x40), jump_bytes(target, text.address(0x400)).unwrap());
}

#[test]
fn test_inline_remove_without_install_is_noop()
{
    let machine = SimMachine::new(1);
    let hooks = InlineHook::new(&machine);
    let mut record = HookRecord::new();
    unsafe { hooks.remove(&mut record) }.unwrap();
    assert_eq!(machine.counters().maps, 0);
}

#[test]
fn test_inline_map_failure_leaves_text_alone()
{
    let machine = SimMachine::new(1);
    let text = Text::new();
    let before = text.snapshot();
    machine.fail_mapping(true);

    let hooks = InlineHook::new(&machine);
    let mut record = HookRecord::new();
    let target = text.address(0x10);
    let result = unsafe { hooks.install(&mut record, target, text.address(0x20)) };
    assert_eq!(result, Err(TrapdoorError::MapFailed(target)));
    assert!(!record.is_installed());
    assert!(text.snapshot() == before);
}

#[test]
fn test_exception_hooks_round_trip()
{
    let machine = SimMachine::new(1);
    let text = Text::new();
    let before = text.snapshot();

    let debug = HookTarget {
        target: text.address(0x200),
        replacement: text.address(0x1200),
    };
    let breakpoint = HookTarget {
        target: text.address(0x300),
        replacement: text.address(0x1300),
    };

    let mut hooks = ExceptionHooks::new();
    unsafe { hooks.install(&machine, debug, breakpoint) }.unwrap();
    assert!(hooks.debug.is_installed());
    assert!(hooks.breakpoint.is_installed());
    assert_eq!(text.bytes::<1>(0x200), [JMP_REL32]);
    assert_eq!(text.bytes::<1>(0x300), [JMP_REL32]);

    unsafe { hooks.remove(&machine) }.unwrap();
    assert!(text.snapshot() == before);
}

/// Page mapper that gives out a fixed number of aliases, then fails
struct RationedMapper
{
    machine: SimMachine<'static>,
    left: Cell<u32>,
}

impl PageMapper for RationedMapper
{
    unsafe fn map_writable(&self, address: Address) -> Option<NonNull<u8>>
    {
        let left = self.left.get().checked_sub(1)?;
        self.left.set(left);
        unsafe { self.machine.map_writable(address) }
    }

    unsafe fn unmap(&self, alias: NonNull<u8>)
    {
        unsafe { self.machine.unmap(alias) }
    }
}

fn exception_targets(text: &Text) -> (HookTarget, HookTarget)
{
    let debug = HookTarget {
        target: text.address(0x200),
        replacement: text.address(0x1200),
    };
    let breakpoint = HookTarget {
        target: text.address(0x300),
        replacement: text.address(0x1300),
    };
    (debug, breakpoint)
}

#[test]
fn test_exception_hooks_roll_back_the_first_hook()
{
    let machine = SimMachine::new(1);
    let text = Text::new();
    let before = text.snapshot();
    let (debug, mut breakpoint) = exception_targets(&text);
    breakpoint.replacement = Address::new(breakpoint.target.value().wrapping_add(1 << 40));

    let mut hooks = ExceptionHooks::new();
    let result = unsafe { hooks.install(&machine, debug, breakpoint) };
    assert!(matches!(result, Err(TrapdoorError::DisplacementOutOfRange { .. })));
    assert!(!hooks.debug.is_installed());
    assert!(!hooks.breakpoint.is_installed());
    assert!(text.snapshot() == before);
}

#[test]
fn test_exception_hooks_keep_the_install_error_when_rollback_fails()
{
    let mapper = RationedMapper {
        machine: SimMachine::new(1),
        left: Cell::new(1),
    };
    let text = Text::new();
    let (debug, breakpoint) = exception_targets(&text);

    let mut hooks = ExceptionHooks::new();
    let result = unsafe { hooks.install(&mapper, debug, breakpoint) };
    assert_eq!(result, Err(TrapdoorError::MapFailed(breakpoint.target)));

    // the rollback could not map the page either
    assert!(hooks.debug.is_installed());
    assert_eq!(text.bytes::<1>(0x200), [JMP_REL32]);
    assert_eq!(mapper.machine.counters().maps, 1);
}
