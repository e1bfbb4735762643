//! # Hook
//!
//! A hook redirects a function to generated bridge code that runs callbacks before and after the
//! original body. Callbacks see the registers of the call through [`RegisterContext`] snapshots and
//! read or rewrite arguments and the return value through the hook's calling convention.
//!
//! Hooks live in an [`Arc`] since generated code holds a raw pointer to them. Dropping the last
//! reference unhooks the function.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::alloc::{self, ExecutableMemory};
use crate::bridge::{Addresses, Bridge};
use crate::code;
use crate::convention::CallingConvention;
use crate::data_type::Bitness;
use crate::error::{GenerateError, InstallError};
use crate::patcher::{
    BytePatchGuard, BytePatcher, PatchGuard, Patcher, PermissionWrapper, PermissionWrapperGuard,
};
use crate::register::RegisterContext;
use crate::return_address::ReturnAddressMap;
use crate::trampoline::Trampoline;

/// Callback run before or after the hooked function
///
/// Returning `true` from a pre callback skips the original function. The return value of post
/// callbacks is ignored.
pub type Callback = fn(HookPhase, &Hook) -> bool;

/// Point of a call a callback runs at
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    /// Before the original function runs
    Pre = 0,
    /// After the original function returned
    Post = 1,
}

impl HookPhase {
    /// Converts the value stored in [`Hook::phase`]'s atomic
    fn from_u8(value: u8) -> Self {
        if value == Self::Post as u8 {
            Self::Post
        } else {
            Self::Pre
        }
    }
}

/// Everything that exists only while the hook is installed
///
/// Fields drop in declaration order: the original bytes are back before any code they jumped to
/// is released.
struct Installation {
    /// Redirect written over the start of the target
    patch: PermissionWrapperGuard<BytePatchGuard>,
    /// Code the redirect jumps to
    entry: ExecutableMemory,
    /// Code the target returns to
    continuation: ExecutableMemory,
    /// Relocated start of the target
    trampoline: Trampoline,
}

/// Installed inline hook on a single function
pub struct Hook {
    /// Address of the hooked function
    target: usize,
    /// Layout of the hooked function's arguments and return value
    convention: Box<dyn CallingConvention>,
    /// Registers at entry, saved by the entry bridge
    pre_context: RegisterContext,
    /// Registers at return, saved by the continuation
    post_context: RegisterContext,
    /// Return addresses displaced by the entry bridge
    return_addresses: ReturnAddressMap,
    /// Callbacks run at entry
    pre_callbacks: Mutex<Vec<Callback>>,
    /// Callbacks run at return
    post_callbacks: Mutex<Vec<Callback>>,
    /// Phase of the callbacks currently running
    phase: AtomicU8,
    /// Generated code and the patch, `None` once unhooked
    installation: Mutex<Option<Installation>>,
}

/// Puts back the phase a nested dispatch replaced, even if a callback panics
struct PhaseGuard<'a> {
    /// Phase cell of the hook
    phase: &'a AtomicU8,
    /// Value to restore
    previous: u8,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.phase.store(self.previous, Ordering::Release);
    }
}

impl Hook {
    /// Hooks the function at `target`, described by `convention`
    ///
    /// Nothing about the target changes unless this succeeds.
    ///
    /// # Safety
    ///
    /// `target` must be the entry point of a function following `convention`, and no thread may be
    /// executing the first bytes of the function while the redirect is written.
    pub unsafe fn new(
        target: usize,
        convention: Box<dyn CallingConvention>,
    ) -> Result<Arc<Self>, InstallError> {
        if target == 0 {
            return Err(InstallError::NullTarget);
        }
        let host = Bitness::host();
        if convention.bitness() != host {
            return Err(InstallError::BitnessMismatch {
                convention: convention.name(),
                expected: convention.bitness(),
                host,
            });
        }

        let hook = Arc::new(Self {
            target,
            convention,
            pre_context: RegisterContext::new(),
            post_context: RegisterContext::new(),
            return_addresses: ReturnAddressMap::new(),
            pre_callbacks: Mutex::new(Vec::new()),
            post_callbacks: Mutex::new(Vec::new()),
            phase: AtomicU8::new(HookPhase::Pre as u8),
            installation: Mutex::new(None),
        });

        let installation = hook.install()?;
        *hook.lock_installation() = Some(installation);
        Ok(hook)
    }

    /// Generates the bridges and trampoline, then writes the redirect
    unsafe fn install(&self) -> Result<Installation, InstallError> {
        let bitness = self.convention.bitness();
        let bridge = Bridge::new(self.convention.as_ref());

        let unset = Addresses::default();
        let entry_len = bridge.entry(&unset, 0)?.len();
        let continuation_len = bridge.continuation(&unset, 0)?.len();

        // the entry bridge's distance decides how long the redirect is
        let mut entry = alloc::allocate_executable(self.target, entry_len)?;
        let mut continuation = alloc::allocate_executable(self.target, continuation_len)?;
        let redirect_len = code::redirect_len(self.target, entry.address());
        let trampoline = Trampoline::build(self.target, redirect_len, bitness)?;

        let addresses = Addresses {
            hook: self as *const Self as usize,
            pre_context: self.pre_context.base(),
            post_context: self.post_context.base(),
            continuation: continuation.address(),
            trampoline: trampoline.address(),
            ..Addresses::runtime()
        };
        let code = bridge.continuation(&addresses, continuation.address())?;
        write_code(&mut continuation, &code)?;
        let code = bridge.entry(&addresses, entry.address())?;
        write_code(&mut entry, &code)?;

        let redirect = code::redirect(self.target, entry.address(), bitness)
            .ok_or(GenerateError::AddressOutOfRange(entry.address()))?;
        let redirect = code::pad(redirect, trampoline.window_len());
        let patch =
            PermissionWrapper::new(BytePatcher::new()).patch(self.target as *mut u8, &redirect)?;

        tracing::debug!(
            function = format_args!("{:#x}", self.target),
            convention = self.convention.name(),
            signature = %self.convention.signature(),
            entry = format_args!("{:#x}", entry.address()),
            continuation = format_args!("{:#x}", continuation.address()),
            trampoline = format_args!("{:#x}", trampoline.address()),
            redirect = redirect.len(),
            preserved = bridge.registers().len(),
            "installed hook"
        );

        Ok(Installation {
            patch,
            entry,
            continuation,
            trampoline,
        })
    }

    /// Locks the installation, recovering from poisoning
    fn lock_installation(&self) -> MutexGuard<'_, Option<Installation>> {
        self.installation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Restores the original bytes and releases the generated code
    ///
    /// Calling this more than once does nothing. Calls already inside the bridges when the hook
    /// is removed must have returned before this is called.
    pub fn unhook(&self) {
        let Some(installation) = self.lock_installation().take() else {
            return;
        };
        let restored = installation.patch.original().len();
        drop(installation);
        tracing::debug!(
            function = format_args!("{:#x}", self.target),
            restored,
            "removed hook"
        );
    }

    /// Whether the redirect is still in place
    pub fn is_installed(&self) -> bool {
        self.lock_installation().is_some()
    }

    /// Address of the hooked function
    pub fn target(&self) -> usize {
        self.target
    }

    /// Address of the trampoline, which behaves like the function before it was hooked
    ///
    /// `None` once unhooked.
    pub fn original(&self) -> Option<usize> {
        self.lock_installation()
            .as_ref()
            .map(|installation| installation.trampoline.address())
    }

    /// Calling convention the hook was installed with
    pub fn convention(&self) -> &dyn CallingConvention {
        self.convention.as_ref()
    }

    /// Phase of the callbacks currently running
    pub fn phase(&self) -> HookPhase {
        HookPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Number of arguments in the hooked function's signature
    pub fn argument_count(&self) -> usize {
        self.convention.signature().arguments.len()
    }

    /// Callback list of a phase
    fn callbacks(&self, phase: HookPhase) -> &Mutex<Vec<Callback>> {
        match phase {
            HookPhase::Pre => &self.pre_callbacks,
            HookPhase::Post => &self.post_callbacks,
        }
    }

    /// Registers a callback, returning `false` if it was already registered for the phase
    pub fn add_callback(&self, phase: HookPhase, callback: Callback) -> bool {
        let mut callbacks = self
            .callbacks(phase)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if callbacks.iter().any(|&c| c as usize == callback as usize) {
            return false;
        }
        callbacks.push(callback);
        true
    }

    /// Unregisters a callback, returning whether it was registered for the phase
    pub fn remove_callback(&self, phase: HookPhase, callback: Callback) -> bool {
        let mut callbacks = self
            .callbacks(phase)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = callbacks.len();
        callbacks.retain(|&c| c as usize != callback as usize);
        callbacks.len() != before
    }

    /// Whether `callback` is registered for the phase
    pub fn is_callback_registered(&self, phase: HookPhase, callback: Callback) -> bool {
        self.callbacks(phase)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|&c| c as usize == callback as usize)
    }

    /// Number of callbacks registered for the phase
    pub fn callback_count(&self, phase: HookPhase) -> usize {
        self.callbacks(phase)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Runs every callback of the phase, returning whether any asked to skip the original
    ///
    /// Works on a copy of the list, so callbacks may add and remove callbacks.
    pub(crate) fn dispatch(&self, phase: HookPhase) -> bool {
        let callbacks = self
            .callbacks(phase)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let _guard = PhaseGuard {
            phase: &self.phase,
            previous: self.phase.swap(phase as u8, Ordering::AcqRel),
        };
        callbacks
            .iter()
            .fold(false, |skip, callback| callback(phase, self) | skip)
    }

    /// Return addresses displaced by calls in flight
    pub(crate) fn return_addresses(&self) -> &ReturnAddressMap {
        &self.return_addresses
    }

    /// Registers saved at entry
    pub fn pre_registers(&self) -> &RegisterContext {
        &self.pre_context
    }

    /// Registers saved at return
    pub fn post_registers(&self) -> &RegisterContext {
        &self.post_context
    }

    /// Registers of the phase currently running
    ///
    /// Writes to a cell are loaded into the register when the callbacks finish.
    pub fn registers(&self) -> &RegisterContext {
        match self.phase() {
            HookPhase::Pre => &self.pre_context,
            HookPhase::Post => &self.post_context,
        }
    }

    /// Reads argument `index`
    ///
    /// # Safety
    ///
    /// Must be called from a callback, with `T` matching the argument's type. After the function
    /// returned, register arguments hold whatever the function left in them.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`Hook::argument_count`].
    pub unsafe fn get_argument<T: Copy>(&self, index: usize) -> T {
        let location = self.convention.argument_location(index, self.registers());
        ptr::read_unaligned(location as *const T)
    }

    /// Replaces argument `index`, as seen by the original function when set from a pre callback
    ///
    /// # Safety
    ///
    /// See [`Hook::get_argument`].
    pub unsafe fn set_argument<T: Copy>(&self, index: usize, value: T) {
        let location = self.convention.argument_location(index, self.registers());
        ptr::write_unaligned(location as *mut T, value)
    }

    /// Reads the return value
    ///
    /// # Safety
    ///
    /// Must be called from a post callback, or a pre callback that set a return value, with `T`
    /// matching the return type.
    pub unsafe fn get_return_value<T: Copy>(&self) -> T {
        let location = self.convention.return_location(self.registers());
        ptr::read_unaligned(location as *const T)
    }

    /// Replaces the return value seen by the caller
    ///
    /// # Safety
    ///
    /// See [`Hook::get_return_value`]. Values returned through a hidden pointer are written to the
    /// caller's buffer.
    pub unsafe fn set_return_value<T: Copy>(&self, value: T) {
        let context = self.registers();
        let location = self.convention.return_location(context);
        ptr::write_unaligned(location as *mut T, value);
        self.convention
            .on_return_location_changed(context, location as *const u8);
    }
}

/// Copies generated code into its buffer
fn write_code(memory: &mut ExecutableMemory, code: &[u8]) -> Result<(), GenerateError> {
    if memory.write(code) {
        Ok(())
    } else {
        Err(GenerateError::BufferOverflow {
            needed: code.len(),
            capacity: memory.len(),
        })
    }
}

impl Drop for Hook {
    fn drop(&mut self) {
        // the bridges point into the contexts, take them out of the call path first
        self.unhook();
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("target", &format_args!("{:#x}", self.target))
            .field("convention", &self.convention.name())
            .field("signature", &format_args!("{}", self.convention.signature()))
            .field("installed", &self.is_installed())
            .field("pre_callbacks", &self.callback_count(HookPhase::Pre))
            .field("post_callbacks", &self.callback_count(HookPhase::Post))
            .finish()
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use std::hint::black_box;
    use std::slice;
    use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{Hook, HookPhase};
    #[cfg(not(windows))]
    use crate::alloc;
    use crate::convention::MsCdecl;
    use crate::data_type::{DataType, Signature};
    use crate::error::InstallError;
    use crate::test_support::{host_convention, host_convention_for, lock_hooks};

    /// Signature of the two-argument targets
    type Binary = extern "C" fn(i32, i32) -> i32;

    /// Signature of the recursive target
    type Unary = extern "C" fn(i32) -> i32;

    /// Hooks `target` with the host convention for `signature`
    fn hook(target: usize, signature: &str) -> Arc<Hook> {
        unsafe { Hook::new(target, host_convention(signature)).unwrap() }
    }

    /// Calls a target through an opaque pointer so the call can't be inlined
    fn call(target: Binary, a: i32, b: i32) -> i32 {
        black_box(target)(black_box(a), black_box(b))
    }

    /// Calls counted by [`add`]
    static ADD_CALLS: AtomicUsize = AtomicUsize::new(0);
    /// Return value seen by [`observe_add`]
    static ADD_SEEN: AtomicI32 = AtomicI32::new(0);
    /// Arguments seen by [`observe_add_arguments`]
    static ADD_ARGUMENTS: AtomicI32 = AtomicI32::new(0);

    /// Adds two integers
    #[inline(never)]
    extern "C" fn add(a: i32, b: i32) -> i32 {
        ADD_CALLS.fetch_add(1, Ordering::SeqCst);
        black_box(a).wrapping_add(black_box(b))
    }

    /// Records the return value of [`add`]
    fn observe_add(phase: HookPhase, hook: &Hook) -> bool {
        assert_eq!(phase, HookPhase::Post);
        assert_eq!(hook.phase(), HookPhase::Post);
        ADD_SEEN.store(unsafe { hook.get_return_value::<i32>() }, Ordering::SeqCst);
        false
    }

    /// Records the arguments of [`add`]
    fn observe_add_arguments(phase: HookPhase, hook: &Hook) -> bool {
        assert_eq!(phase, HookPhase::Pre);
        let (a, b) = unsafe { (hook.get_argument::<i32>(0), hook.get_argument::<i32>(1)) };
        ADD_ARGUMENTS.store(a * 100 + b, Ordering::SeqCst);
        false
    }

    #[test]
    /// Callbacks see the arguments and the return value, and the caller's result is unchanged
    fn test_observe() {
        let _lock = lock_hooks();
        let hook = hook(add as *const () as usize, "ii)i");
        assert!(hook.add_callback(HookPhase::Pre, observe_add_arguments));
        assert!(hook.add_callback(HookPhase::Post, observe_add));

        let calls = ADD_CALLS.load(Ordering::SeqCst);
        assert_eq!(call(add, 3, 10), 13);
        assert_eq!(ADD_CALLS.load(Ordering::SeqCst), calls + 1);
        assert_eq!(ADD_ARGUMENTS.load(Ordering::SeqCst), 310);
        assert_eq!(ADD_SEEN.load(Ordering::SeqCst), 13);
        assert!(hook.return_addresses().is_empty());
        assert_eq!(hook.return_addresses().violations(), 0);

        // the trampoline behaves like the unhooked function
        let original: Binary = unsafe { std::mem::transmute(hook.original().unwrap()) };
        ADD_SEEN.store(0, Ordering::SeqCst);
        assert_eq!(call(original, 2, 3), 5);
        assert_eq!(ADD_SEEN.load(Ordering::SeqCst), 0);
    }

    /// Multiplies two integers
    #[inline(never)]
    extern "C" fn multiply(a: i32, b: i32) -> i32 {
        black_box(a).wrapping_mul(black_box(b))
    }

    /// Replaces the return value with 1337
    fn replace_result(_: HookPhase, hook: &Hook) -> bool {
        unsafe { hook.set_return_value::<i32>(1337) };
        false
    }

    #[test]
    /// A post callback replaces the value the caller receives
    fn test_replace_return_value() {
        let _lock = lock_hooks();
        let hook = hook(multiply as *const () as usize, "ii)i");
        hook.add_callback(HookPhase::Post, replace_result);
        assert_eq!(call(multiply, 6, 7), 1337);

        hook.remove_callback(HookPhase::Post, replace_result);
        assert_eq!(call(multiply, 6, 7), 42);
    }

    /// Calls counted by [`subtract`]
    static SUBTRACT_CALLS: AtomicUsize = AtomicUsize::new(0);
    /// Post callbacks counted for [`subtract`]
    static SUBTRACT_POST: AtomicUsize = AtomicUsize::new(0);

    /// Subtracts two integers
    #[inline(never)]
    extern "C" fn subtract(a: i32, b: i32) -> i32 {
        SUBTRACT_CALLS.fetch_add(1, Ordering::SeqCst);
        black_box(a).wrapping_sub(black_box(b))
    }

    /// Skips the original and returns -1
    fn skip_subtract(_: HookPhase, hook: &Hook) -> bool {
        unsafe { hook.set_return_value::<i32>(-1) };
        true
    }

    /// Counts post callbacks of [`subtract`]
    fn count_subtract(_: HookPhase, _: &Hook) -> bool {
        SUBTRACT_POST.fetch_add(1, Ordering::SeqCst);
        false
    }

    #[test]
    /// Overriding skips the original but still runs post callbacks once
    fn test_override() {
        let _lock = lock_hooks();
        let hook = hook(subtract as *const () as usize, "ii)i");
        hook.add_callback(HookPhase::Pre, skip_subtract);
        hook.add_callback(HookPhase::Post, count_subtract);

        let calls = SUBTRACT_CALLS.load(Ordering::SeqCst);
        assert_eq!(call(subtract, 10, 4), -1);
        assert_eq!(SUBTRACT_CALLS.load(Ordering::SeqCst), calls);
        assert_eq!(SUBTRACT_POST.load(Ordering::SeqCst), 1);
        assert_eq!(hook.return_addresses().violations(), 0);
    }

    /// Calls counted by [`recurse`]
    static RECURSE_CALLS: AtomicUsize = AtomicUsize::new(0);
    /// Pre callbacks counted for [`recurse`]
    static RECURSE_PRE: AtomicUsize = AtomicUsize::new(0);
    /// Post callbacks counted for [`recurse`]
    static RECURSE_POST: AtomicUsize = AtomicUsize::new(0);
    /// Post callbacks that saw the innermost result
    static RECURSE_SEEN: AtomicUsize = AtomicUsize::new(0);

    /// Calls itself until `depth` reaches 3
    #[inline(never)]
    extern "C" fn recurse(depth: i32) -> i32 {
        RECURSE_CALLS.fetch_add(1, Ordering::SeqCst);
        if black_box(depth) < 3 {
            black_box(recurse as Unary)(depth + 1)
        } else {
            depth
        }
    }

    /// Counts pre callbacks of [`recurse`]
    fn count_recurse_pre(_: HookPhase, _: &Hook) -> bool {
        RECURSE_PRE.fetch_add(1, Ordering::SeqCst);
        false
    }

    /// Counts post callbacks of [`recurse`] and the results they see
    fn count_recurse_post(_: HookPhase, hook: &Hook) -> bool {
        RECURSE_POST.fetch_add(1, Ordering::SeqCst);
        if unsafe { hook.get_return_value::<i32>() } == 3 {
            RECURSE_SEEN.fetch_add(1, Ordering::SeqCst);
        }
        false
    }

    #[test]
    /// Every level of a recursive call returns to its own caller
    fn test_recursion() {
        let _lock = lock_hooks();
        let hook = hook(recurse as *const () as usize, "i)i");
        hook.add_callback(HookPhase::Pre, count_recurse_pre);
        hook.add_callback(HookPhase::Post, count_recurse_post);

        assert_eq!(black_box(recurse as Unary)(0), 3);
        assert_eq!(RECURSE_CALLS.load(Ordering::SeqCst), 4);
        assert_eq!(RECURSE_PRE.load(Ordering::SeqCst), 4);
        assert_eq!(RECURSE_POST.load(Ordering::SeqCst), 4);
        assert_eq!(RECURSE_SEEN.load(Ordering::SeqCst), 4);
        assert!(hook.return_addresses().is_empty());
        assert_eq!(hook.return_addresses().violations(), 0);
    }

    /// Divides two integers
    #[inline(never)]
    extern "C" fn divide(a: i32, b: i32) -> i32 {
        black_box(a).wrapping_div(black_box(b).max(1))
    }

    /// Doubles the second argument
    fn double_divisor(_: HookPhase, hook: &Hook) -> bool {
        unsafe {
            let b = hook.get_argument::<i32>(1);
            hook.set_argument::<i32>(1, b * 2);
        }
        false
    }

    #[test]
    /// Arguments rewritten before the call reach the original function
    fn test_set_argument() {
        let _lock = lock_hooks();
        let hook = hook(divide as *const () as usize, "ii)i");
        assert_eq!(hook.argument_count(), 2);
        hook.add_callback(HookPhase::Pre, double_divisor);
        assert_eq!(call(divide, 100, 5), 10);
    }

    /// Length of the hypotenuse of a right triangle
    #[inline(never)]
    extern "C" fn hypotenuse(a: f64, b: f64) -> f64 {
        (black_box(a) * a + black_box(b) * b).sqrt()
    }

    /// Bits of the return value seen by [`replace_hypotenuse`]
    static HYPOTENUSE_SEEN: AtomicU64 = AtomicU64::new(0);

    /// Records the result of [`hypotenuse`] and replaces it with 42.5
    fn replace_hypotenuse(_: HookPhase, hook: &Hook) -> bool {
        unsafe {
            HYPOTENUSE_SEEN.store(hook.get_return_value::<f64>().to_bits(), Ordering::SeqCst);
            hook.set_return_value::<f64>(42.5);
        }
        false
    }

    #[test]
    /// Floating-point results returned in `xmm0` can be read and replaced
    fn test_float_return() {
        let _lock = lock_hooks();
        let hook = hook(hypotenuse as *const () as usize, "dd)d");
        hook.add_callback(HookPhase::Post, replace_hypotenuse);

        let target = black_box(hypotenuse as extern "C" fn(f64, f64) -> f64);
        assert_eq!(target(black_box(3.0), black_box(4.0)), 42.5);
        assert_eq!(f64::from_bits(HYPOTENUSE_SEEN.load(Ordering::SeqCst)), 5.0);
    }

    /// Aggregate returned in two registers, or through memory on Windows
    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Pair {
        /// Low half
        a: i64,
        /// High half
        b: i64,
    }

    /// Sum and difference of two integers
    #[inline(never)]
    extern "C" fn sum_and_difference(a: i64, b: i64) -> Pair {
        Pair {
            a: black_box(a).wrapping_add(b),
            b: black_box(a).wrapping_sub(b),
        }
    }

    /// Halves seen by [`swap_pair`]
    static PAIR_SEEN: Mutex<Option<Pair>> = Mutex::new(None);

    /// Records the result of [`sum_and_difference`] and swaps its halves
    fn swap_pair(_: HookPhase, hook: &Hook) -> bool {
        let pair = unsafe { hook.get_return_value::<Pair>() };
        *PAIR_SEEN.lock().unwrap() = Some(pair);
        unsafe {
            hook.set_return_value(Pair {
                a: pair.b,
                b: pair.a,
            })
        };
        false
    }

    #[test]
    /// A 16-byte aggregate result can be read and replaced as a whole
    fn test_pair_return() {
        let _lock = lock_hooks();
        let signature = Signature::new(
            vec![DataType::LongLong, DataType::LongLong],
            DataType::Custom(16),
        );
        let target = sum_and_difference as *const () as usize;
        let hook = unsafe { Hook::new(target, host_convention_for(signature)).unwrap() };
        hook.add_callback(HookPhase::Post, swap_pair);

        let target = black_box(sum_and_difference as extern "C" fn(i64, i64) -> Pair);
        assert_eq!(target(black_box(10), black_box(5)), Pair { a: 5, b: 15 });
        assert_eq!(*PAIR_SEEN.lock().unwrap(), Some(Pair { a: 15, b: 5 }));
    }

    /// Weighted sum of seven integers, the last of which is passed on the stack
    #[inline(never)]
    extern "C" fn weigh(a: i32, b: i32, c: i32, d: i32, e: i32, f: i32, g: i32) -> i32 {
        black_box(a) + b + c + d + e + f + black_box(g) * 10
    }

    /// Last argument seen by [`bump_last`]
    static WEIGH_LAST: AtomicI32 = AtomicI32::new(0);

    /// Records the seventh argument and increments it
    fn bump_last(_: HookPhase, hook: &Hook) -> bool {
        unsafe {
            let g = hook.get_argument::<i32>(6);
            WEIGH_LAST.store(g, Ordering::SeqCst);
            hook.set_argument::<i32>(6, g + 1);
        }
        false
    }

    #[test]
    /// Arguments passed on the stack can be read and rewritten before the call
    fn test_stack_argument() {
        let _lock = lock_hooks();
        let hook = hook(weigh as *const () as usize, "iiiiiii)i");
        assert_eq!(hook.argument_count(), 7);
        hook.add_callback(HookPhase::Pre, bump_last);

        let target = black_box(weigh as extern "C" fn(i32, i32, i32, i32, i32, i32, i32) -> i32);
        assert_eq!(target(1, 2, 3, 4, 5, 6, black_box(7)), 101);
        assert_eq!(WEIGH_LAST.load(Ordering::SeqCst), 7);
    }

    /// Bitwise and of two integers
    #[inline(never)]
    extern "C" fn bit_and(a: i32, b: i32) -> i32 {
        black_box(a) & black_box(b)
    }

    /// Bitwise or of two integers
    #[inline(never)]
    extern "C" fn bit_or(a: i32, b: i32) -> i32 {
        black_box(a) | black_box(b)
    }

    #[test]
    /// Code released by an unhook is not handed to two parts of the next hook
    fn test_rehook() {
        let _lock = lock_hooks();
        let first = hook(bit_and as *const () as usize, "ii)i");
        first.add_callback(HookPhase::Post, replace_result);
        assert_eq!(call(bit_and, 12, 10), 1337);
        drop(first);
        assert_eq!(call(bit_and, 12, 10), 8);

        let second = hook(bit_or as *const () as usize, "ii)i");
        second.add_callback(HookPhase::Post, replace_result);
        assert_eq!(call(bit_or, 12, 10), 1337);
        second.remove_callback(HookPhase::Post, replace_result);
        assert_eq!(call(bit_or, 12, 10), 14);

        let again = hook(bit_and as *const () as usize, "ii)i");
        assert_eq!(call(bit_and, 12, 10), 8);
        assert_eq!(call(bit_or, 12, 10), 14);
        assert_eq!(again.return_addresses().violations(), 0);
        assert_eq!(second.return_addresses().violations(), 0);
    }

    #[cfg(not(windows))]
    /// `long double` 1.0 in x87 extended precision
    const EXTENDED_ONE: [u8; 10] = [0, 0, 0, 0, 0, 0, 0, 0x80, 0xff, 0x3f];
    #[cfg(not(windows))]
    /// `long double` 2.0 in x87 extended precision
    const EXTENDED_TWO: [u8; 10] = [0, 0, 0, 0, 0, 0, 0, 0x80, 0x00, 0x40];

    #[cfg(not(windows))]
    /// Last `long double` result seen by [`observe_extended`]
    static EXTENDED_SEEN: Mutex<[u8; 10]> = Mutex::new([0; 10]);

    #[cfg(not(windows))]
    /// Skips the original and returns 2.0
    fn override_extended(_: HookPhase, hook: &Hook) -> bool {
        unsafe { hook.set_return_value(EXTENDED_TWO) };
        true
    }

    #[cfg(not(windows))]
    /// Records the `long double` result
    fn observe_extended(_: HookPhase, hook: &Hook) -> bool {
        *EXTENDED_SEEN.lock().unwrap() = unsafe { hook.get_return_value::<[u8; 10]>() };
        false
    }

    #[test]
    #[cfg(not(windows))]
    /// A `long double` set by a pre callback that skips the original reaches the caller
    fn test_override_long_double() {
        let _lock = lock_hooks();
        let anchor = test_override_long_double as *const () as usize;

        // fld1; nop x16; ret
        let mut body = vec![0xd9, 0xe8];
        body.extend([0x90; 16]);
        body.push(0xc3);
        let mut target = alloc::allocate_executable(anchor, body.len()).unwrap();
        assert!(target.write(&body));

        // mov rax, target; call rax; fstp tword [rdi]; ret
        let mut stub = vec![0x48, 0xb8];
        stub.extend((target.address() as u64).to_le_bytes());
        stub.extend([0xff, 0xd0, 0xdb, 0x3f, 0xc3]);
        let mut caller = alloc::allocate_executable(anchor, stub.len()).unwrap();
        assert!(caller.write(&stub));

        let call_extended: extern "C" fn(*mut [u8; 16]) =
            unsafe { std::mem::transmute(caller.address()) };
        let result = || {
            let mut out = [0u8; 16];
            black_box(call_extended)(&mut out);
            hex::encode(&out[..10])
        };
        assert_eq!(result(), hex::encode(EXTENDED_ONE));

        let hook = hook(target.address(), ")D");
        hook.add_callback(HookPhase::Post, observe_extended);
        assert_eq!(result(), hex::encode(EXTENDED_ONE));
        assert_eq!(*EXTENDED_SEEN.lock().unwrap(), EXTENDED_ONE);

        hook.add_callback(HookPhase::Pre, override_extended);
        assert_eq!(result(), hex::encode(EXTENDED_TWO));
        assert_eq!(*EXTENDED_SEEN.lock().unwrap(), EXTENDED_TWO);
        drop(hook);
    }

    /// Remainder of two integers
    #[inline(never)]
    extern "C" fn remainder(a: i32, b: i32) -> i32 {
        black_box(a).wrapping_rem(black_box(b).max(1))
    }

    #[test]
    /// Unhooking puts back the original bytes exactly, and a second unhook does nothing
    fn test_unhook() {
        let _lock = lock_hooks();
        let target = remainder as *const () as usize;
        let original = unsafe { slice::from_raw_parts(target as *const u8, 16) }.to_vec();

        let hook = hook(target, "ii)i");
        assert!(hook.is_installed());
        assert_ne!(
            unsafe { slice::from_raw_parts(target as *const u8, 16) },
            &original[..]
        );
        hook.add_callback(HookPhase::Post, replace_result);
        assert_eq!(call(remainder, 17, 5), 1337);

        hook.unhook();
        assert!(!hook.is_installed());
        assert!(hook.original().is_none());
        assert_eq!(
            hex::encode(unsafe { slice::from_raw_parts(target as *const u8, 16) }),
            hex::encode(&original)
        );
        assert_eq!(call(remainder, 17, 5), 2);

        hook.unhook();
        assert!(!hook.is_installed());
    }

    /// Does nothing
    fn first(_: HookPhase, _: &Hook) -> bool {
        false
    }

    /// Asks to skip the original
    fn second(_: HookPhase, _: &Hook) -> bool {
        true
    }

    /// Larger of two integers
    #[inline(never)]
    extern "C" fn maximum(a: i32, b: i32) -> i32 {
        black_box(a).max(black_box(b))
    }

    #[test]
    /// Callbacks register once per phase
    fn test_callback_dedup() {
        let _lock = lock_hooks();
        let hook = hook(maximum as *const () as usize, "ii)i");

        assert!(hook.add_callback(HookPhase::Pre, first));
        assert!(!hook.add_callback(HookPhase::Pre, first));
        assert!(hook.add_callback(HookPhase::Pre, second));
        assert!(hook.add_callback(HookPhase::Post, first));
        assert_eq!(hook.callback_count(HookPhase::Pre), 2);
        assert_eq!(hook.callback_count(HookPhase::Post), 1);
        assert!(hook.is_callback_registered(HookPhase::Post, first));
        assert!(!hook.is_callback_registered(HookPhase::Post, second));

        assert!(hook.remove_callback(HookPhase::Pre, first));
        assert!(!hook.remove_callback(HookPhase::Pre, first));
        assert_eq!(hook.callback_count(HookPhase::Pre), 1);
    }

    /// Smaller of two integers
    #[inline(never)]
    extern "C" fn minimum(a: i32, b: i32) -> i32 {
        black_box(a).min(black_box(b))
    }

    /// Always panics
    fn panics(_: HookPhase, _: &Hook) -> bool {
        panic!("callback failure");
    }

    #[test]
    /// A panicking callback doesn't unwind into generated code
    fn test_panicking_callback() {
        let _lock = lock_hooks();
        let hook = hook(minimum as *const () as usize, "ii)i");
        hook.add_callback(HookPhase::Pre, panics);
        assert_eq!(call(minimum, 4, 9), 4);
        assert_eq!(hook.phase(), HookPhase::Pre);
    }

    #[test]
    /// Invalid targets and conventions are rejected before anything is written
    fn test_rejected() {
        let error = unsafe { Hook::new(0, host_convention("ii)i")).unwrap_err() };
        assert!(matches!(error, InstallError::NullTarget));

        let convention = Box::new(MsCdecl::new("ii)i".parse().unwrap()));
        let error = unsafe { Hook::new(add as *const () as usize, convention).unwrap_err() };
        assert!(matches!(error, InstallError::BitnessMismatch { .. }));
    }
}
