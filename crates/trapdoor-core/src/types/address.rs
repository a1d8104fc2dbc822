//! Memory address newtype

use core::fmt;
use core::ops::{Add, Sub};

/// Size of a page as seen by the patching code
pub const PAGE_SIZE: u64 = 4096;

/// A virtual address in the debugged kernel
///
/// Addresses are always held as 64 bits, even on 32-bit targets, so the
/// same value types work for both register layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// Create an address from a raw value
    pub const fn new(value: u64) -> Self
    {
        Self(value)
    }

    /// Address of a pointer
    pub fn from_ptr<T>(ptr: *const T) -> Self
    {
        Self(ptr as usize as u64)
    }

    /// Raw value
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// `self + offset`, `None` on overflow
    pub const fn checked_add(self, offset: u64) -> Option<Self>
    {
        match self.0.checked_add(offset) {
            Some(value) => Some(Self(value)),
            None => None,
        }
    }

    /// Start of the page containing this address
    pub const fn page_base(self) -> Self
    {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Offset of this address inside its page
    pub const fn page_offset(self) -> u64
    {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Whether the address is a multiple of `align`
    pub const fn is_aligned(self, align: u64) -> bool
    {
        align != 0 && self.0 % align == 0
    }

    /// Reinterpret as a raw pointer
    ///
    /// Values above `usize::MAX` are truncated on 32-bit targets.
    pub const fn as_ptr<T>(self) -> *mut T
    {
        self.0 as usize as *mut T
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Address
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<Address> for Address
{
    type Output = i64;

    /// Signed distance between two addresses
    fn sub(self, rhs: Address) -> i64
    {
        self.0.wrapping_sub(rhs.0) as i64
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
