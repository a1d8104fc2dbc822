//! # Inline Function Hooks
//!
//! Replaces the first five bytes of a kernel function with `jmp rel32` to a
//! replacement. The original bytes are kept in a [`HookRecord`] owned by the
//! caller, and [`InlineHook::remove`] writes them back.
//!
//! Kernel text is read-only, so the bytes are written through a writable
//! alias of the page obtained from the host's [`PageMapper`]. When the five
//! bytes straddle a page boundary both pages are mapped before anything is
//! written, so a failed mapping never leaves half a jump behind.

use core::ptr::{self, NonNull};

use tracing::debug;

use crate::error::{TrapdoorError, TrapdoorResult};
use crate::platform::PageMapper;
use crate::types::{Address, PAGE_SIZE};

/// Opcode of `jmp rel32`
pub const JMP_REL32: u8 = 0xe9;

/// Bytes overwritten by a hook
pub const HOOK_LENGTH: usize = 5;

/// Saved state of one inline hook
///
/// The saved bytes are the only record of what the function looked like,
/// so a record must outlive the hook it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HookRecord
{
    target: Option<Address>,
    saved: [u8; HOOK_LENGTH],
    installed: bool,
}

impl HookRecord
{
    /// An empty record
    pub const fn new() -> Self
    {
        Self {
            target: None,
            saved: [0; HOOK_LENGTH],
            installed: false,
        }
    }

    /// Whether the patch is currently in place
    pub const fn is_installed(&self) -> bool
    {
        self.installed
    }

    /// Function the record was last used for
    pub const fn target(&self) -> Option<Address>
    {
        self.target
    }

    /// Original prologue bytes
    pub const fn saved_bytes(&self) -> &[u8; HOOK_LENGTH]
    {
        &self.saved
    }
}

/// `jmp rel32` from `target` to `replacement`
pub fn jump_bytes(target: Address, replacement: Address) -> TrapdoorResult<[u8; HOOK_LENGTH]>
{
    let next = target + HOOK_LENGTH as u64;
    let displacement = i32::try_from(replacement - next)
        .map_err(|_| TrapdoorError::DisplacementOutOfRange { target, replacement })?;

    let mut bytes = [0; HOOK_LENGTH];
    bytes[0] = JMP_REL32;
    bytes[1..].copy_from_slice(&displacement.to_le_bytes());
    Ok(bytes)
}

/// Writable alias of one page, unmapped on drop
struct WritableAlias<'m, M: PageMapper>
{
    mapper: &'m M,
    alias: NonNull<u8>,
}

impl<'m, M: PageMapper> WritableAlias<'m, M>
{
    /// # Safety
    ///
    /// `address` must be mapped kernel memory.
    unsafe fn map(mapper: &'m M, address: Address) -> TrapdoorResult<Self>
    {
        // SAFETY: forwarded to the caller
        let alias = unsafe { mapper.map_writable(address) }.ok_or(TrapdoorError::MapFailed(address))?;
        Ok(Self { mapper, alias })
    }

    /// # Safety
    ///
    /// `bytes` must not run past the end of the aliased page.
    unsafe fn write(&self, bytes: &[u8])
    {
        for (offset, byte) in bytes.iter().enumerate() {
            // SAFETY: forwarded to the caller
            unsafe { ptr::write_volatile(self.alias.as_ptr().add(offset), *byte) };
        }
    }
}

impl<M: PageMapper> Drop for WritableAlias<'_, M>
{
    fn drop(&mut self)
    {
        // SAFETY: the alias came from this mapper and is not used again
        unsafe { self.mapper.unmap(self.alias) };
    }
}

/// Installs and removes inline hooks through a host page mapper
pub struct InlineHook<'m, M: PageMapper>
{
    mapper: &'m M,
}

impl<'m, M: PageMapper> InlineHook<'m, M>
{
    pub fn new(mapper: &'m M) -> Self
    {
        Self { mapper }
    }

    /// Redirect `target` to `replacement`, saving the original bytes in `record`
    ///
    /// ## Errors
    ///
    /// - `AlreadyHooked`: `record` still holds a live patch
    /// - `DisplacementOutOfRange`: `replacement` is more than ±2 GiB away
    /// - `MapFailed`: the host could not alias the page(s)
    ///
    /// # Safety
    ///
    /// `target` must be the start of a function at least five bytes long,
    /// and no processor may execute its first five bytes during the patch.
    /// On a multi-processor machine that means the others are parked.
    pub unsafe fn install(&self, record: &mut HookRecord, target: Address, replacement: Address) -> TrapdoorResult<()>
    {
        if record.installed {
            return Err(TrapdoorError::AlreadyHooked(record.target.unwrap_or(target)));
        }
        let jump = jump_bytes(target, replacement)?;

        let mut saved = [0; HOOK_LENGTH];
        let source = target.as_ptr::<u8>();
        for (offset, byte) in saved.iter_mut().enumerate() {
            // SAFETY: the function is readable, see the contract above
            *byte = unsafe { ptr::read_volatile(source.add(offset)) };
        }

        // SAFETY: forwarded to the caller
        unsafe { self.write_bytes(target, &jump)? };

        *record = HookRecord {
            target: Some(target),
            saved,
            installed: true,
        };
        debug!(target = target.value(), replacement = replacement.value(), "inline hook installed");
        Ok(())
    }

    /// Write the saved bytes back; no-op for a record that is not installed
    ///
    /// # Safety
    ///
    /// Same as [`InlineHook::install`].
    pub unsafe fn remove(&self, record: &mut HookRecord) -> TrapdoorResult<()>
    {
        let Some(target) = record.target.filter(|_| record.installed) else {
            return Ok(());
        };

        // SAFETY: forwarded to the caller
        unsafe { self.write_bytes(target, &record.saved)? };

        record.installed = false;
        debug!(target = target.value(), "inline hook removed");
        Ok(())
    }

    /// Write `bytes` at `at` through aliases of every page they touch
    unsafe fn write_bytes(&self, at: Address, bytes: &[u8]) -> TrapdoorResult<()>
    {
        let room = (PAGE_SIZE - at.page_offset()) as usize;
        let split = bytes.len().min(room);
        let (head, tail) = bytes.split_at(split);

        // SAFETY: the caller vouches for the target range
        unsafe {
            let head_alias = WritableAlias::map(self.mapper, at)?;
            let tail_alias = if tail.is_empty() {
                None
            } else {
                Some(WritableAlias::map(self.mapper, at + split as u64)?)
            };

            head_alias.write(head);
            if let Some(alias) = &tail_alias {
                alias.write(tail);
            }
        }
        Ok(())
    }
}
