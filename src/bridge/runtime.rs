//! Rust side of the bridge, called from generated code with the host's C calling convention

use std::panic::{self, AssertUnwindSafe};

use crate::hook::{Hook, HookPhase};

/// Records the return address the stack pointer points at, keyed by the stack pointer
///
/// # Safety
///
/// `hook` must point to a live hook and `stack_pointer` to the return address of a call in flight
pub(crate) unsafe extern "C" fn push_return_address(hook: *const Hook, stack_pointer: usize) {
    let hook = &*hook;
    let address = *(stack_pointer as *const usize);
    hook.return_addresses().push(stack_pointer, address);
}

/// Hands back the return address recorded for the stack pointer
///
/// # Safety
///
/// `hook` must point to a live hook
pub(crate) unsafe extern "C" fn pop_return_address(hook: *const Hook, stack_pointer: usize) -> usize {
    (*hook).return_addresses().pop(stack_pointer)
}

/// Runs the callbacks of a phase, returning whether any of them asked to skip the original
///
/// Unwinding into generated code is undefined, so a panicking callback is logged and counts as
/// not overriding.
///
/// # Safety
///
/// `hook` must point to a live hook
pub(crate) unsafe extern "C" fn dispatch(hook: *const Hook, phase: u32) -> bool {
    let hook = &*hook;
    let phase = if phase == HookPhase::Pre as u32 {
        HookPhase::Pre
    } else {
        HookPhase::Post
    };
    match panic::catch_unwind(AssertUnwindSafe(|| hook.dispatch(phase))) {
        Ok(skip) => skip,
        Err(_) => {
            tracing::error!(
                function = format_args!("{:#x}", hook.target()),
                ?phase,
                "hook callback panicked"
            );
            false
        }
    }
}
