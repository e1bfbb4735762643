#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
//! # dynhook
//!
//! Inline hooks for native x86 and x86-64 functions whose calling convention is only known at
//! runtime. A hook overwrites the start of a function with a jump into generated code that
//! snapshots the registers, runs pre callbacks, calls the relocated original (unless a callback
//! overrides it), runs post callbacks and returns to the caller. Callbacks read and rewrite the
//! arguments and the return value through a [`CallingConvention`] built from a type string such
//! as `"ii)i"`.
//!
//! ```no_run
//! use dynhook::{Hook, HookManager, HookPhase, SysV64};
//!
//! #[inline(never)]
//! extern "C" fn add(a: i32, b: i32) -> i32 {
//!     a + b
//! }
//!
//! fn double(_: HookPhase, hook: &Hook) -> bool {
//!     unsafe {
//!         let value = hook.get_return_value::<i32>();
//!         hook.set_return_value(value * 2);
//!     }
//!     false
//! }
//!
//! let mut manager = HookManager::new();
//! let convention = Box::new(SysV64::new("ii)i".parse().unwrap()));
//! let hook = unsafe { manager.hook(add as *const () as usize, convention) }.unwrap();
//! hook.add_callback(HookPhase::Post, double);
//! ```

pub mod alloc;
pub(crate) mod bridge;
pub mod code;
pub mod convention;
pub mod data_type;
pub mod error;
pub mod hook;
pub mod manager;
pub mod patcher;
pub mod register;
pub mod return_address;
pub mod trampoline;

#[cfg(test)]
mod test_support;

pub use convention::{
    CallingConvention, GccCdecl, GccThiscall, MsCdecl, MsFastcall, MsStdcall, MsThiscall, MsX64,
    SysV64,
};
pub use data_type::{Bitness, DataType, Signature};
pub use error::{
    AllocError, GenerateError, InstallError, PatchError, RelocationError, SignatureError,
};
pub use hook::{Callback, Hook, HookPhase};
pub use manager::HookManager;
pub use register::{Register, RegisterCell, RegisterContext};
