//! # Patch
//!
//! Patchers overwrite a location in memory and hand back a guard that restores the original bytes
//! when dropped. Installing a hook writes its redirect through a patcher, so the guard is what
//! makes unhooking exact.

use crate::error::PatchError;

pub mod byte;
pub mod mem;

pub use byte::{BytePatchGuard, BytePatcher};
pub use mem::{PermissionWrapper, PermissionWrapperGuard};

/// All patchers save state from where they patched and are able to revert on-command
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that the implementation of `patch`
/// works correctly and is properly documented for avoiding undefined behavior
pub unsafe trait Patcher {
    /// Guard type for the patcher. When this guard is dropped, the location should be restored.
    type Guard: PatchGuard;

    /// Overwrites `target` with `patch`
    ///
    /// # Safety
    ///
    /// `target` must be valid for reads and writes of `patch.len()` bytes as far as the patcher
    /// requires, and nothing may be executing the bytes while they change
    unsafe fn patch(&self, target: *mut u8, patch: &[u8]) -> Result<Self::Guard, PatchError>;
}

/// Guard for a patch
///
/// # Safety
///
/// Guard must fully unpatch the location when dropped, even if `restore` is not called
pub unsafe trait PatchGuard: Sized {
    /// Bytes that were at the location before the patch
    fn original(&self) -> &[u8];

    /// Restores the original value of a patch
    fn restore(self) {
        // implementations restore in their `Drop::drop`
    }
}
