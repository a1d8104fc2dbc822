//! Register dumps

use core::fmt;

use crate::arch::{Architecture, DEBUG_REGISTERS};
use crate::error::{TrapdoorError, TrapdoorResult};
use crate::platform::{ControlRegister, Processor};

/// Most entries any dump holds (x86-64 general registers)
const MAX_ENTRIES: usize = 21;

/// Which register set to dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind
{
    /// General registers of the trap frame
    General,
    /// General registers of the selected task's user-entry frame (`u`)
    User,
    /// Debug registers (`d`)
    Debug,
    /// Control registers (`c`)
    Control,
}

impl DumpKind
{
    /// Parse the optional argument of the register dump command
    ///
    /// Only the first character counts. No argument means
    /// [`DumpKind::General`]; anything unknown is `BadRegister`.
    pub fn parse(kind: Option<&str>) -> TrapdoorResult<Self>
    {
        let Some(kind) = kind.filter(|kind| !kind.is_empty()) else {
            return Ok(Self::General);
        };
        match kind.as_bytes()[0] {
            b'u' => Ok(Self::User),
            b'd' => Ok(Self::Debug),
            b'c' => Ok(Self::Control),
            _ => Err(TrapdoorError::bad_register(kind)),
        }
    }
}

/// A formatted snapshot of one register set
#[derive(Debug, Clone)]
pub struct RegisterDump
{
    entries: [(&'static str, u64); MAX_ENTRIES],
    len: usize,
    per_line: usize,
    separator: &'static str,
    name_width: usize,
    value_width: usize,
    frame: Option<u64>,
}

impl RegisterDump
{
    fn empty(per_line: usize, separator: &'static str, name_width: usize, value_width: usize) -> Self
    {
        Self {
            entries: [("", 0); MAX_ENTRIES],
            len: 0,
            per_line,
            separator,
            name_width,
            value_width,
            frame: None,
        }
    }

    /// Layout for the general registers of `A`, followed by `&regs`
    pub(super) fn general<A: Architecture>(frame: u64) -> Self
    {
        let value_width = 2 * A::WORD_BYTES as usize;
        let name_width = if A::WORD_BYTES == 8 { 8 } else { 0 };
        let mut dump = Self::empty(A::REGISTERS_PER_LINE, " ", name_width, value_width);
        dump.frame = Some(frame);
        dump
    }

    pub(super) fn debug<P: Processor>(processor: &P) -> Self
    {
        let mut dump = Self::empty(4, "  ", 0, 8);
        for slot in DEBUG_REGISTERS {
            dump.push(slot.name, processor.read_debug(slot.register));
        }
        dump
    }

    pub(super) fn control<P: Processor>(processor: &P) -> Self
    {
        const NAMES: [&str; 4] = ["cr0", "cr2", "cr3", "cr4"];
        let mut dump = Self::empty(4, "  ", 0, 8);
        for (name, register) in NAMES.into_iter().zip(ControlRegister::ALL) {
            dump.push(name, processor.read_control(register));
        }
        dump
    }

    pub(super) fn push(&mut self, name: &'static str, value: u64)
    {
        if let Some(entry) = self.entries.get_mut(self.len) {
            *entry = (name, value);
            self.len += 1;
        }
    }

    /// `(name, value)` pairs in display order
    pub fn entries(&self) -> &[(&'static str, u64)]
    {
        &self.entries[..self.len]
    }

    /// Value of one entry
    pub fn value(&self, name: &str) -> Option<u64>
    {
        self.entries().iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }

    /// Address of the dumped frame (general dumps only)
    pub fn frame_address(&self) -> Option<u64>
    {
        self.frame
    }
}

impl fmt::Display for RegisterDump
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        for (index, (name, value)) in self.entries().iter().enumerate() {
            let column = index % self.per_line;
            if column != 0 {
                f.write_str(self.separator)?;
            }
            write!(
                f,
                "{name:>nw$} = 0x{value:0vw$x}",
                nw = self.name_width,
                vw = self.value_width
            )?;
            if column + 1 == self.per_line {
                f.write_str("\n")?;
            }
        }
        if self.len % self.per_line != 0 {
            f.write_str("\n")?;
        }
        if let Some(frame) = self.frame {
            writeln!(f, "&regs = 0x{frame:0vw$x}", vw = self.value_width)?;
        }
        Ok(())
    }
}
