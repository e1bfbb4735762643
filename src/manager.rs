//! # Manager
//!
//! Keeps at most one hook per function, so that code hooking the same function from several
//! places shares one hook and one set of callbacks.

use std::collections::HashMap;
use std::sync::Arc;

use crate::convention::{self, CallingConvention};
use crate::error::InstallError;
use crate::hook::Hook;

/// Registry of installed hooks, keyed by target address
///
/// Dropping the manager unhooks everything it installed.
#[derive(Debug, Default)]
pub struct HookManager {
    /// Installed hooks
    hooks: HashMap<usize, Arc<Hook>>,
}

impl HookManager {
    /// Creates an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks `target`, or returns the existing hook if it is already hooked
    ///
    /// An existing hook is only returned when `convention` describes the same layout it was
    /// installed with.
    ///
    /// # Safety
    ///
    /// See [`Hook::new`].
    pub unsafe fn hook(
        &mut self,
        target: usize,
        convention: Box<dyn CallingConvention>,
    ) -> Result<Arc<Hook>, InstallError> {
        if let Some(hook) = self.hooks.get(&target) {
            if !convention::same_layout(hook.convention(), convention.as_ref()) {
                return Err(InstallError::ConventionMismatch(target));
            }
            return Ok(Arc::clone(hook));
        }

        let hook = Hook::new(target, convention)?;
        self.hooks.insert(target, Arc::clone(&hook));
        Ok(hook)
    }

    /// Unhooks `target`, returning whether it was hooked
    ///
    /// The function is restored even if other references to the hook are still alive.
    pub fn unhook(&mut self, target: usize) -> bool {
        match self.hooks.remove(&target) {
            Some(hook) => {
                hook.unhook();
                true
            }
            None => false,
        }
    }

    /// Unhooks every function
    pub fn unhook_all(&mut self) {
        for (_, hook) in self.hooks.drain() {
            hook.unhook();
        }
    }

    /// Hook installed on `target`
    pub fn find_hook(&self, target: usize) -> Option<Arc<Hook>> {
        self.hooks.get(&target).cloned()
    }

    /// Number of hooked functions
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no function is hooked
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl Drop for HookManager {
    fn drop(&mut self) {
        self.unhook_all();
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use std::hint::black_box;
    use std::sync::Arc;

    use super::HookManager;
    use crate::error::InstallError;
    use crate::hook::{Hook, HookPhase};
    use crate::test_support::{host_convention, lock_hooks};

    /// Multiplies two integers and adds one
    #[inline(never)]
    extern "C" fn scale(a: i32, b: i32) -> i32 {
        black_box(a).wrapping_mul(black_box(b)).wrapping_add(1)
    }

    /// Shifts `a` left by `b`
    #[inline(never)]
    extern "C" fn shift(a: i32, b: i32) -> i32 {
        black_box(a).wrapping_shl(black_box(b) as u32)
    }

    /// Replaces the return value with 0
    fn zero(_: HookPhase, hook: &Hook) -> bool {
        unsafe { hook.set_return_value::<i32>(0) };
        false
    }

    /// Calls a target through an opaque pointer
    fn call(target: extern "C" fn(i32, i32) -> i32, a: i32, b: i32) -> i32 {
        black_box(target)(black_box(a), black_box(b))
    }

    #[test]
    /// Hooking the same target twice hands out the same hook
    fn test_idempotent() {
        let _lock = lock_hooks();
        let mut manager = HookManager::new();
        let target = scale as *const () as usize;

        let a = unsafe { manager.hook(target, host_convention("ii)i")).unwrap() };
        let b = unsafe { manager.hook(target, host_convention("ii)i")).unwrap() };
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.len(), 1);
        assert!(Arc::ptr_eq(&manager.find_hook(target).unwrap(), &a));

        let error = unsafe { manager.hook(target, host_convention("i)i")).unwrap_err() };
        assert!(matches!(error, InstallError::ConventionMismatch(t) if t == target));
    }

    #[test]
    /// Unhooking through the manager restores the function even with hooks still referenced
    fn test_unhook() {
        let _lock = lock_hooks();
        let mut manager = HookManager::new();
        let target = shift as *const () as usize;
        let hook = unsafe { manager.hook(target, host_convention("ii)i")).unwrap() };
        hook.add_callback(HookPhase::Post, zero);
        assert_eq!(call(shift, 1, 4), 0);

        assert!(manager.unhook(target));
        assert!(!manager.unhook(target));
        assert!(manager.is_empty());
        assert!(!hook.is_installed());
        assert_eq!(call(shift, 1, 4), 16);
    }

    #[test]
    /// Dropping the manager unhooks everything
    fn test_drop() {
        let _lock = lock_hooks();
        let mut manager = HookManager::new();
        let scale_target = scale as *const () as usize;
        let shift_target = shift as *const () as usize;
        let a = unsafe { manager.hook(scale_target, host_convention("ii)i")).unwrap() };
        let b = unsafe { manager.hook(shift_target, host_convention("ii)i")).unwrap() };
        a.add_callback(HookPhase::Post, zero);
        assert_eq!(call(scale, 2, 3), 0);

        drop(manager);
        assert!(!a.is_installed());
        assert!(!b.is_installed());
        assert_eq!(call(scale, 2, 3), 7);
    }
}
