//! # Executable memory
//!
//! Allocates code buffers near a given address, so that generated code and the function it hooks can
//! reach each other with 32-bit relative operands
//!
//! Based on the allocator in detour-rs: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

use lazy_static::lazy_static;

use crate::error::AllocError;

use self::proximity::{Allocation, ProximityAllocator};

pub mod proximity;
pub mod search;

/// Maximum distance between a target and memory allocated for it, the reach of a `rel32` operand
pub const DETOUR_RANGE: usize = 0x8000_0000;

lazy_static! {
    /// Pools shared by every hook in the process
    static ref POOL: Mutex<ProximityAllocator> = Mutex::new(ProximityAllocator::new(DETOUR_RANGE));
}

/// Readable, writable and executable memory close to the address it was requested for
///
/// The memory goes back to its pool when dropped.
pub struct ExecutableMemory {
    /// Slice of a pool
    data: Allocation,
}

// Safety: the slice is owned exclusively until it is handed back to the pool under its lock
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

impl ExecutableMemory {
    /// Address of the first byte
    pub fn address(&self) -> usize {
        self.as_ptr() as usize
    }

    /// Copies `code` to the start of the buffer
    ///
    /// Returns `false` without writing anything if `code` doesn't fit.
    pub fn write(&mut self, code: &[u8]) -> bool {
        match self.get_mut(..code.len()) {
            Some(dest) => {
                dest.copy_from_slice(code);
                true
            }
            None => false,
        }
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        POOL.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(&self.data);
    }
}

impl Deref for ExecutableMemory {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for ExecutableMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for ExecutableMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableMemory")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.len())
            .finish()
    }
}

/// Allocates `size` bytes of executable memory within [`DETOUR_RANGE`] of `origin`
pub fn allocate_executable(origin: usize, size: usize) -> Result<ExecutableMemory, AllocError> {
    let data = POOL
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .allocate(origin, size)?;
    tracing::trace!(
        origin = format_args!("{origin:#x}"),
        address = format_args!("{:#x}", data.as_ptr() as usize),
        size,
        "allocated executable memory"
    );
    Ok(ExecutableMemory { data })
}
