//! # Register Access
//!
//! Reads and writes registers by the names a user types at the debugger
//! prompt. A name is resolved in this order, first match wins:
//!
//! 1. Live pseudo-registers of the debugger itself: the current stack
//!    pointer (`cesp` / `crsp`) and the current flags (`ceflags`)
//! 2. A leading `%` switches to the frame saved when the selected task last
//!    entered the kernel from user mode, then resolution continues with the
//!    rest of the name
//! 3. Hardware debug registers (`dr0`-`dr3`, `dr6`, `dr7`)
//! 4. `&regs`, the address of the trap frame, and the stack pointer at
//!    fault time (`kesp` / `krsp`)
//! 5. The general register table of the architecture
//!
//! Steps 4 and 5 need a trap frame; without one the result is
//! [`TrapdoorError::MissingFrame`], not [`TrapdoorError::BadRegister`].
//!
//! ## Frames taken in kernel mode
//!
//! When a trap arrives without a privilege change the CPU does not push
//! `sp` and `ss`, so the last two words of the frame are not part of it.
//! For such frames `sp` reads as the address just past the real frame
//! (frame end minus two words) and `ss` reads the live stack segment.
//! Their slots belong to the interrupted stack, so writing `sp` or `ss` of
//! such a frame is refused.

mod dump;

use core::cell::Cell;
use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::NonNull;

use tracing::debug;

pub use dump::{DumpKind, RegisterDump};

use crate::arch::{resolve, Architecture, DEBUG_REGISTERS};
use crate::error::{TrapdoorError, TrapdoorResult};
use crate::platform::{Processor, TaskContext};
use crate::types::Address;

/// Marker selecting the user-entry frame of the selected task
pub const USER_FRAME_MARKER: char = '%';

/// Pseudo-register holding the address of the trap frame
pub const FRAME_ADDRESS: &str = "&regs";

/// Pseudo-register holding the debugger's own flags
pub const LIVE_FLAGS: &str = "ceflags";

/// Named register access for one debugger session
pub struct RegisterAccess<'m, A, M>
where
    A: Architecture,
    M: Processor + TaskContext,
{
    machine: &'m M,
    ip_adjusted: Cell<bool>,
    _arch: PhantomData<A>,
}

impl<'m, A, M> RegisterAccess<'m, A, M>
where
    A: Architecture,
    M: Processor + TaskContext,
{
    pub fn new(machine: &'m M) -> Self
    {
        Self {
            machine,
            ip_adjusted: Cell::new(false),
            _arch: PhantomData,
        }
    }

    /// Read the register called `name`
    ///
    /// ## Errors
    ///
    /// - `BadRegister`: no table has the name, or the prefix is ambiguous
    /// - `MissingFrame`: the name needs a frame and there is none (no
    ///   `frame`, or `%` with a task that has no kernel stack)
    pub fn get(&self, name: &str, frame: Option<&A::TrapFrame>) -> TrapdoorResult<u64>
    {
        if name.eq_ignore_ascii_case(A::LIVE_STACK_POINTER) {
            return Ok(self.machine.stack_pointer());
        }
        if name.eq_ignore_ascii_case(LIVE_FLAGS) {
            return Ok(self.machine.flags());
        }

        match name.strip_prefix(USER_FRAME_MARKER) {
            Some(rest) => {
                let user = self.user_frame()?;
                // SAFETY: guaranteed by the TaskContext implementation
                let frame = unsafe { user.as_ref() };
                self.read_frame(name, rest, Some(frame))
            }
            None => self.read_frame(name, name, frame),
        }
    }

    /// Write `value` to the register called `name`
    ///
    /// Pseudo-registers are read-only, and so are `sp` and `ss` of a frame
    /// taken in kernel mode. Other general registers are written to the
    /// frame as is.
    pub fn set(&self, name: &str, frame: Option<&mut A::TrapFrame>, value: u64) -> TrapdoorResult<()>
    {
        if name.eq_ignore_ascii_case(A::LIVE_STACK_POINTER) || name.eq_ignore_ascii_case(LIVE_FLAGS) {
            return Err(TrapdoorError::bad_register(name));
        }

        match name.strip_prefix(USER_FRAME_MARKER) {
            Some(rest) => {
                let mut user = self.user_frame()?;
                // SAFETY: guaranteed by the TaskContext implementation
                let frame = unsafe { user.as_mut() };
                self.write_frame(name, rest, Some(frame), value)
            }
            None => self.write_frame(name, name, frame, value),
        }
    }

    /// Instruction pointer of `frame`, 0 without a frame
    pub fn instruction_pointer(&self, frame: Option<&A::TrapFrame>) -> u64
    {
        frame.map_or(0, |frame| A::read(frame, A::INSTRUCTION_POINTER))
    }

    /// Move the instruction pointer of `frame` and remember that it moved
    pub fn set_instruction_pointer(&self, frame: Option<&mut A::TrapFrame>, value: u64) -> TrapdoorResult<()>
    {
        let frame = frame.ok_or(TrapdoorError::MissingFrame)?;
        A::write(frame, A::INSTRUCTION_POINTER, value);
        self.ip_adjusted.set(true);
        debug!(ip = value, "instruction pointer adjusted");
        Ok(())
    }

    /// Whether [`RegisterAccess::set_instruction_pointer`] ran this session
    pub fn ip_adjusted(&self) -> bool
    {
        self.ip_adjusted.get()
    }

    /// Build a register dump
    ///
    /// `kind` is parsed with [`DumpKind::parse`].
    pub fn dump(&self, kind: Option<&str>, frame: Option<&A::TrapFrame>) -> TrapdoorResult<RegisterDump>
    {
        match DumpKind::parse(kind)? {
            DumpKind::General => {
                let frame = frame.ok_or(TrapdoorError::MissingFrame)?;
                self.general_dump(frame)
            }
            DumpKind::User => {
                let user = self.user_frame()?;
                // SAFETY: guaranteed by the TaskContext implementation
                self.general_dump(unsafe { user.as_ref() })
            }
            DumpKind::Debug => Ok(RegisterDump::debug(self.machine)),
            DumpKind::Control => Ok(RegisterDump::control(self.machine)),
        }
    }

    fn general_dump(&self, frame: &A::TrapFrame) -> TrapdoorResult<RegisterDump>
    {
        let mut dump = RegisterDump::general::<A>(frame_address(frame));
        for slot in A::REGISTERS {
            dump.push(slot.name, self.read_frame(slot.name, slot.name, Some(frame))?);
        }
        Ok(dump)
    }

    fn read_frame(&self, full: &str, name: &str, frame: Option<&A::TrapFrame>) -> TrapdoorResult<u64>
    {
        if let Some(slot) = resolve(DEBUG_REGISTERS, name) {
            return Ok(self.machine.read_debug(slot.register));
        }

        let frame = frame.ok_or(TrapdoorError::MissingFrame)?;
        if name.eq_ignore_ascii_case(FRAME_ADDRESS) {
            return Ok(frame_address(frame));
        }
        if name.eq_ignore_ascii_case(A::FAULT_STACK_POINTER) {
            return Ok(fault_stack_pointer::<A>(frame));
        }

        let slot = resolve(A::REGISTERS, name).ok_or_else(|| TrapdoorError::bad_register(full))?;
        if A::is_kernel_frame(frame) {
            if slot.register == A::STACK_POINTER {
                return Ok(fault_stack_pointer::<A>(frame));
            }
            if slot.register == A::STACK_SEGMENT {
                return Ok(u64::from(self.machine.stack_segment()));
            }
        }
        Ok(A::read(frame, slot.register))
    }

    fn write_frame(&self, full: &str, name: &str, frame: Option<&mut A::TrapFrame>, value: u64) -> TrapdoorResult<()>
    {
        if let Some(slot) = resolve(DEBUG_REGISTERS, name) {
            // SAFETY: the user asked for it; the #DB handler is hooked
            unsafe { self.machine.write_debug(slot.register, value) };
            debug!(register = slot.name, value, "debug register written");
            return Ok(());
        }

        let frame = frame.ok_or(TrapdoorError::MissingFrame)?;
        if name.eq_ignore_ascii_case(FRAME_ADDRESS) || name.eq_ignore_ascii_case(A::FAULT_STACK_POINTER) {
            return Err(TrapdoorError::bad_register(full));
        }

        let slot = resolve(A::REGISTERS, name).ok_or_else(|| TrapdoorError::bad_register(full))?;
        let stack = slot.register == A::STACK_POINTER || slot.register == A::STACK_SEGMENT;
        if stack && A::is_kernel_frame(frame) {
            return Err(TrapdoorError::bad_register(full));
        }
        A::write(frame, slot.register, value);
        debug!(register = slot.name, value, "register written");
        Ok(())
    }

    /// Frame saved on the selected task's last entry from user mode
    fn user_frame(&self) -> TrapdoorResult<NonNull<A::TrapFrame>>
    {
        let top = self.machine.kernel_stack_top().ok_or(TrapdoorError::MissingFrame)?;
        let base = top
            .value()
            .checked_sub(size_of::<A::TrapFrame>() as u64)
            .ok_or(TrapdoorError::MissingFrame)?;
        NonNull::new(Address::new(base).as_ptr()).ok_or(TrapdoorError::MissingFrame)
    }
}

fn frame_address<F>(frame: &F) -> u64
{
    Address::from_ptr(frame).value()
}

/// Stack pointer at fault time
///
/// Just past the frame; two words less when the CPU did not push `sp`/`ss`.
fn fault_stack_pointer<A: Architecture>(frame: &A::TrapFrame) -> u64
{
    let end = frame_address(frame) + size_of::<A::TrapFrame>() as u64;
    if A::is_kernel_frame(frame) {
        end - 2 * A::WORD_BYTES
    } else {
        end
    }
}
