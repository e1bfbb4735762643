//! Helpers shared by tests that patch live code

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::convention::{CallingConvention, MsX64, SysV64};
use crate::data_type::Signature;

/// Serializes tests that change page protections, since toggles on a shared page race
static HOOKS: Mutex<()> = Mutex::new(());

/// Takes the patching lock and routes logs to the test output
pub(crate) fn lock_hooks() -> MutexGuard<'static, ()> {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
    HOOKS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 64-bit convention of the host for a signature string
pub(crate) fn host_convention(signature: &str) -> Box<dyn CallingConvention> {
    host_convention_for(signature.parse().unwrap())
}

/// 64-bit convention of the host for a signature that has no string form
pub(crate) fn host_convention_for(signature: Signature) -> Box<dyn CallingConvention> {
    if cfg!(windows) {
        Box::new(MsX64::new(signature))
    } else {
        Box::new(SysV64::new(signature))
    }
}
