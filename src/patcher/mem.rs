//! Patcher wrapper that adjusts memory permissions to patch read-only memory such as code

use region::Protection;

use crate::error::PatchError;

use super::{PatchGuard, Patcher};

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It changes the memory permissions of the target memory, triggers the patch, and then reverts
/// the permissions.
///
/// # Safety
///
/// `PermissionWrapper` relies on the size of the patch value to determine how many pages to change
/// write permissions, pairing `PermissionWrapper` with a patcher that writes more memory than the
/// size of the patch is undefined behavior.
///
/// The `*mut u8` passed to [`Patcher::patch`] **MUST** be memory not tracked by Rust, such as the
/// code of a function.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

unsafe impl<P: Patcher> Patcher for PermissionWrapper<P> {
    type Guard = PermissionWrapperGuard<P::Guard>;

    unsafe fn patch(&self, target: *mut u8, patch: &[u8]) -> Result<Self::Guard, PatchError> {
        let _protection = region::protect_with_handle(target, patch.len(), Protection::all())?;
        let guard = self.patcher.patch(target, patch)?;
        Ok(PermissionWrapperGuard {
            guard: Some(guard),
            location: target,
            len: patch.len(),
        })
    }
}

/// Permission guard for the underlying patch guard
#[derive(Debug)]
pub struct PermissionWrapperGuard<G: PatchGuard> {
    /// Underlying patch guard. `Option` so that it can be dropped inside our [`Drop::drop`]
    guard: Option<G>,
    /// Location of the patch
    location: *const u8,
    /// Length of the patch
    len: usize,
}

// Safety: see `BytePatchGuard`, the location is only written when the guard drops
unsafe impl<G: PatchGuard + Send> Send for PermissionWrapperGuard<G> {}
unsafe impl<G: PatchGuard + Sync> Sync for PermissionWrapperGuard<G> {}

unsafe impl<G: PatchGuard> PatchGuard for PermissionWrapperGuard<G> {
    fn original(&self) -> &[u8] {
        self.guard.as_ref().map(PatchGuard::original).unwrap_or_default()
    }
}

impl<G: PatchGuard> Drop for PermissionWrapperGuard<G> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        // Safety: the range was made writable once already when the patch was applied
        match unsafe { region::protect_with_handle(self.location, self.len, Protection::all()) } {
            Ok(_protection) => guard.restore(),
            Err(error) => {
                // restoring into read-only memory would fault, leave the patch in place instead
                tracing::error!(
                    location = format_args!("{:#x}", self.location as usize),
                    %error,
                    "failed to make patched memory writable, patch left in place"
                );
                std::mem::forget(guard);
            }
        }
    }
}
