//! # Error Types
//!
//! General error handling for the debugger core.
//!
//! We use `thiserror` to generate the `Error` trait implementations and the
//! messages. The crate is `no_std` and runs inside fault handlers, so no
//! variant owns heap memory: register names are copied into a small inline
//! buffer ([`RegisterName`]).

use core::fmt;

use thiserror::Error;

use crate::types::{Address, CpuId};

/// Main error type for debugger core operations
///
/// ## Error Categories
///
/// 1. **Register errors**: BadRegister, MissingFrame
/// 2. **Breakpoint errors**: SlotInUse, InvalidBreakpoint, RemoteProcessor
/// 3. **Patching errors**: VectorOutOfRange, DisplacementOutOfRange, AlreadyHooked, MapFailed
/// 4. **Processor errors**: UnresponsiveProcessor
///
/// Violating the single-active-CPU precondition of a patch cannot be detected
/// here; the patching functions are `unsafe` and document it instead.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapdoorError
{
    /// The register name (or breakpoint slot) does not resolve to anything
    ///
    /// Returned for names missing from every register table, for ambiguous
    /// prefixes, for writes to read-only pseudo-registers and for breakpoint
    /// slots outside 0-3.
    #[error("Bad register: {0}")]
    BadRegister(RegisterName),

    /// The operation needs a trap frame and none was supplied
    ///
    /// Some entry reasons carry no frame. Debug registers and the live
    /// pseudo-registers remain readable without one.
    #[error("Trap frame not available, select a task that has one")]
    MissingFrame,

    /// A processor did not acknowledge the halt request
    ///
    /// Never returned as a hard failure: the halt coordinator reports these
    /// and the session continues with the processors that did park.
    #[error("Processor {0} did not respond to the halt request")]
    UnresponsiveProcessor(CpuId),

    /// The hardware breakpoint slot is already armed
    ///
    /// A slot has to be removed before it can be reused.
    #[error("Breakpoint slot {slot} on cpu {cpu} is already in use")]
    SlotInUse
    {
        /// Processor whose slot was requested
        cpu: CpuId,
        /// Slot number (0-3)
        slot: u8,
    },

    /// The requested mode/length/address combination cannot be programmed
    #[error("Invalid breakpoint: {0}")]
    InvalidBreakpoint(&'static str),

    /// Debug registers are strictly per-processor
    ///
    /// Breakpoint operations must run on the processor they target; they are
    /// never forwarded.
    #[error("Debug registers of cpu {requested} accessed from cpu {current}")]
    RemoteProcessor
    {
        /// Processor the caller asked for
        requested: CpuId,
        /// Processor the code is running on
        current: CpuId,
    },

    /// The vector lies beyond the limit of the live trap vector table
    #[error("Vector {vector} is outside the trap table (limit 0x{limit:x})")]
    VectorOutOfRange
    {
        /// Requested vector
        vector: u8,
        /// Limit field of the table register
        limit: u16,
    },

    /// The replacement is too far away for a 32-bit relative jump
    #[error("Cannot reach {replacement} from {target} with a rel32 jump")]
    DisplacementOutOfRange
    {
        /// Function being hooked
        target: Address,
        /// Function the jump should land in
        replacement: Address,
    },

    /// The hook record already holds a live patch
    #[error("Function at {0} is already hooked by this record")]
    AlreadyHooked(Address),

    /// The host could not provide a writable alias for the page
    #[error("Failed to map {0} writable")]
    MapFailed(Address),
}

/// Convenience type alias for `Result<T, TrapdoorError>`
///
/// ```rust
/// use trapdoor_core::error::TrapdoorResult;
/// fn foo() -> TrapdoorResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type TrapdoorResult<T> = core::result::Result<T, TrapdoorError>;

/// Capacity of [`RegisterName`]; longer names are truncated.
pub const REGISTER_NAME_CAPACITY: usize = 16;

/// Register name captured for an error message
///
/// Holds up to [`REGISTER_NAME_CAPACITY`] bytes inline. Anything longer is
/// cut at a character boundary, which is enough to tell the user what they
/// typed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RegisterName
{
    bytes: [u8; REGISTER_NAME_CAPACITY],
    len: u8,
}

impl RegisterName
{
    /// An empty name
    pub const fn empty() -> Self
    {
        Self {
            bytes: [0; REGISTER_NAME_CAPACITY],
            len: 0,
        }
    }

    /// The captured (possibly truncated) name
    pub fn as_str(&self) -> &str
    {
        // Only whole characters are ever copied in, see `write_str`
        core::str::from_utf8(&self.bytes[..usize::from(self.len)]).unwrap_or("")
    }
}

impl From<&str> for RegisterName
{
    fn from(name: &str) -> Self
    {
        let mut captured = Self::empty();
        let _ = fmt::Write::write_str(&mut captured, name);
        captured
    }
}

impl fmt::Write for RegisterName
{
    fn write_str(&mut self, s: &str) -> fmt::Result
    {
        for ch in s.chars() {
            let mut buf = [0u8; 4];
            let encoded = ch.encode_utf8(&mut buf).as_bytes();
            let start = usize::from(self.len);
            let end = start + encoded.len();
            if end > REGISTER_NAME_CAPACITY {
                break;
            }
            self.bytes[start..end].copy_from_slice(encoded);
            self.len = end as u8;
        }
        Ok(())
    }
}

impl fmt::Display for RegisterName
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for RegisterName
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{:?}", self.as_str())
    }
}

impl TrapdoorError
{
    /// Shorthand for [`TrapdoorError::BadRegister`] from a string
    pub fn bad_register(name: &str) -> Self
    {
        TrapdoorError::BadRegister(RegisterName::from(name))
    }
}
