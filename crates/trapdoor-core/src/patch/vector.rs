//! # Trap Vector Table Editor
//!
//! Redirects entries of the live trap vector table (IDT). The table is found
//! with `sidt`; the handler address of a gate is split over two (32-bit) or
//! three (64-bit) fields, each rewritten separately through the
//! [`write gate`](super::gate).

use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr;

use tracing::debug;

use crate::arch::Architecture;
use crate::error::{TrapdoorError, TrapdoorResult};
use crate::platform::Processor;
use crate::types::Address;

/// Debug exception (`#DB`)
pub const DEBUG_VECTOR: u8 = 1;
/// Non-maskable interrupt
pub const NMI_VECTOR: u8 = 2;
/// Breakpoint exception (`int3`)
pub const BREAKPOINT_VECTOR: u8 = 3;

/// The live trap vector table of one processor
pub struct VectorTable<'p, A: Architecture, P: Processor>
{
    processor: &'p P,
    _arch: PhantomData<A>,
}

impl<'p, A: Architecture, P: Processor> VectorTable<'p, A, P>
{
    /// Editor for the table `processor` reports
    ///
    /// # Safety
    ///
    /// `processor.interrupt_table()` must describe mapped memory laid out as
    /// `A::GateDescriptor` entries.
    pub unsafe fn new(processor: &'p P) -> Self
    {
        Self {
            processor,
            _arch: PhantomData,
        }
    }

    fn gate(&self, vector: u8) -> TrapdoorResult<*mut A::GateDescriptor>
    {
        let table = self.processor.interrupt_table();
        if !table.holds(vector, size_of::<A::GateDescriptor>()) {
            return Err(TrapdoorError::VectorOutOfRange {
                vector,
                limit: table.limit,
            });
        }
        let base = Address::new(table.base).as_ptr::<A::GateDescriptor>();
        Ok(base.wrapping_add(usize::from(vector)))
    }

    /// Handler currently installed for `vector`
    pub fn handler(&self, vector: u8) -> TrapdoorResult<Address>
    {
        let gate = self.gate(vector)?;
        // SAFETY: bounds checked against the limit, memory vouched for in `new`
        let descriptor = unsafe { ptr::read_volatile(gate) };
        Ok(Address::new(A::gate_handler(&descriptor)))
    }

    /// Point `vector` at `handler` and return the handler it replaced
    ///
    /// # Safety
    ///
    /// `handler` must be a valid entry stub for this vector, and no other
    /// processor may take the vector while the gate is being rewritten
    /// (park them first, see [`crate::halt`]).
    pub unsafe fn hook(&self, vector: u8, handler: Address) -> TrapdoorResult<Address>
    {
        let previous = self.handler(vector)?;
        let gate = self.gate(vector)?;
        // SAFETY: forwarded to the caller
        unsafe { A::store_gate_handler(gate, handler.value(), self.processor) };
        debug!(vector, from = previous.value(), to = handler.value(), "vector hooked");
        Ok(previous)
    }

    /// Put back the handler returned by [`VectorTable::hook`]
    ///
    /// # Safety
    ///
    /// Same as [`VectorTable::hook`].
    pub unsafe fn unhook(&self, vector: u8, previous: Address) -> TrapdoorResult<()>
    {
        let gate = self.gate(vector)?;
        // SAFETY: forwarded to the caller
        unsafe { A::store_gate_handler(gate, previous.value(), self.processor) };
        debug!(vector, to = previous.value(), "vector restored");
        Ok(())
    }
}
