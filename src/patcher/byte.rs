//! Byte patcher for memory that is already writable

use std::ptr;

use crate::error::PatchError;

use super::{PatchGuard, Patcher};

/// Patcher for patching memory locations with byte arrays.
/// This patcher never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytePatcher;
impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self
    }
}
unsafe impl Patcher for BytePatcher {
    type Guard = BytePatchGuard;

    unsafe fn patch(&self, target: *mut u8, patch: &[u8]) -> Result<Self::Guard, PatchError> {
        Ok(BytePatchGuard::patch(target, patch))
    }
}

/// Guard for byte-patches
///
/// See [`BytePatcher`].
#[derive(Debug)]
pub struct BytePatchGuard {
    /// Original data from `location`
    original: Vec<u8>,
    /// Location of the patch
    location: *mut u8,
}

// Safety: the guard only touches `location` when dropped, which the patcher's caller made valid
// for the guard's whole lifetime
unsafe impl Send for BytePatchGuard {}
unsafe impl Sync for BytePatchGuard {}

impl BytePatchGuard {
    /// Patches a location, returning a guard for unpatching
    ///
    /// # Safety
    ///
    /// `location` must be valid for reads and writes of `patch.len()` bytes
    unsafe fn patch(location: *mut u8, patch: &[u8]) -> Self {
        let original = std::slice::from_raw_parts(location, patch.len()).to_vec();
        ptr::copy(patch.as_ptr(), location, patch.len());
        Self { original, location }
    }
}
unsafe impl PatchGuard for BytePatchGuard {
    fn original(&self) -> &[u8] {
        &self.original
    }
}
impl Drop for BytePatchGuard {
    fn drop(&mut self) {
        // Safety: the creator keeps `location` valid and writable for the length of the patch
        unsafe {
            ptr::copy(self.original.as_ptr(), self.location, self.original.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::slice;

    use crate::patcher::byte::BytePatcher;
    use crate::patcher::{PatchGuard, Patcher};

    #[test]
    /// Test patch and revert functionality
    fn test_patch() {
        let data = Box::into_raw(Box::new([1u8, 2, 3, 4]));
        let ptr = data.cast::<u8>();

        let patcher = BytePatcher::new();
        let patch = unsafe { patcher.patch(ptr, &[4, 3, 2, 1]).unwrap() };

        assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, [4, 3, 2, 1]);
        assert_eq!(patch.original(), [1, 2, 3, 4]);

        patch.restore();
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, [1, 2, 3, 4]);

        drop(unsafe { Box::from_raw(data) });
    }

    #[test]
    /// Tests a partial patch of a block to ensure we're not overwriting outside the patch area
    fn test_partial_patch() {
        let data = Box::into_raw(Box::new([1u8, 2, 3, 4]));
        let ptr = data.cast::<u8>();

        let patcher = BytePatcher::new();
        let patch = unsafe { patcher.patch(ptr.add(1), &[5, 5]).unwrap() };

        assert_eq!(
            hex::encode(unsafe { slice::from_raw_parts(ptr, 4) }),
            "01050504"
        );

        // dropping the guard restores just as `restore` does
        drop(patch);
        assert_eq!(
            hex::encode(unsafe { slice::from_raw_parts(ptr, 4) }),
            "01020304"
        );

        drop(unsafe { Box::from_raw(data) });
    }
}
