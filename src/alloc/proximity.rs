//! # Proximity allocator
//!
//! Keeps a list of executable pools and carves allocations out of the first one close enough to the
//! requested origin, mapping a new pool next to the origin when none is
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

use std::ops::Range;
use std::slice;

use slice_pool::sync::{SliceBox, SlicePool};

use crate::error::AllocError;

use super::search::{self, Direction};

/// Slice of executable memory handed out by a pool
pub type Allocation = SliceBox<u8>;

/// Set of executable pools, each placed close to the address it was first requested for
pub struct ProximityAllocator {
    /// Max distance between an origin and memory allocated for it
    max_distance: usize,
    /// Mapped pools with their live allocation counts, searched in creation order
    pools: Vec<(SlicePool<u8>, usize)>,
}

impl ProximityAllocator {
    /// Creates an allocator without any pools
    pub fn new(max_distance: usize) -> Self {
        Self {
            max_distance,
            pools: Vec::new(),
        }
    }

    /// Range of addresses acceptable for an allocation near `origin`
    fn range(&self, origin: usize) -> Range<usize> {
        origin.saturating_sub(self.max_distance)..origin.saturating_add(self.max_distance)
    }

    /// Allocates `size` bytes within range of `origin`, mapping a new pool if none has room
    pub fn allocate(&mut self, origin: usize, size: usize) -> Result<Allocation, AllocError> {
        let range = self.range(origin);

        if let Some(allocation) = self
            .pools
            .iter_mut()
            .filter(|(pool, _)| pool_within(pool, &range))
            .find_map(|(pool, live)| {
                let allocation = pool.alloc(size)?;
                *live += 1;
                Some(allocation)
            })
        {
            return Ok(allocation);
        }

        let pool = self.map_pool(&range, origin, size)?;
        let allocation = pool.alloc(size).ok_or(AllocError::OutOfMemory)?;
        self.pools.push((pool, 1));
        Ok(allocation)
    }

    /// Releases the pool an allocation came from if it was its last user
    pub fn release(&mut self, allocation: &Allocation) {
        let address = allocation.as_ptr() as usize;
        let Some(index) = self
            .pools
            .iter()
            .position(|(pool, _)| pool_span(pool).contains(&address))
        else {
            tracing::error!(
                address = format_args!("{address:#x}"),
                "released memory that belongs to no pool"
            );
            return;
        };

        let live = &mut self.pools[index].1;
        *live = live.saturating_sub(1);
        if *live == 0 {
            self.pools.remove(index);
        }
    }

    /// Maps a new pool of at least `size` bytes, as close to `origin` as possible
    fn map_pool(
        &self,
        range: &Range<usize>,
        origin: usize,
        size: usize,
    ) -> Result<SlicePool<u8>, AllocError> {
        let page_size = region::page::size();
        let size = (size.max(1) + page_size - 1) / page_size * page_size;

        // macOS refuses to map below the image, so look upwards first
        let after = search::free_regions(origin, range.clone(), Direction::After);
        let before = search::free_regions(origin, range.clone(), Direction::Before);

        for candidate in after.chain(before) {
            let address = candidate?;
            if address.saturating_add(size) > range.end || !search::is_free(address, size)? {
                continue;
            }
            match map_fixed(address, size) {
                Ok(pool) => return Ok(pool),
                Err(AllocError::OutOfMemory) => continue,
                Err(error) => return Err(error),
            }
        }
        Err(AllocError::OutOfMemory)
    }
}

/// Addresses covered by a pool
fn pool_span(pool: &SlicePool<u8>) -> Range<usize> {
    let start = pool.as_ptr() as usize;
    start..start + pool.len()
}

/// Whether all of a pool lies inside `range`
fn pool_within(pool: &SlicePool<u8>, range: &Range<usize>) -> bool {
    let span = pool_span(pool);
    range.contains(&span.start) && range.contains(&(span.end - 1))
}

/// Maps `size` bytes of read, write and execute memory at exactly `address`
fn map_fixed(address: usize, size: usize) -> Result<SlicePool<u8>, AllocError> {
    let map = mmap::MemoryMap::new(
        size,
        &[
            mmap::MapOption::MapReadable,
            mmap::MapOption::MapWritable,
            mmap::MapOption::MapExecutable,
            mmap::MapOption::MapAddr(address as *const u8),
        ],
    )
    .map_err(|error| match error {
        mmap::MapError::ErrNoMem => AllocError::OutOfMemory,
        error => AllocError::Mmap(error.to_string()),
    })?;

    Ok(SlicePool::new(Mapping(map)))
}

/// Memory map viewed as a byte slice, as [`SlicePool`] expects
struct Mapping(mmap::MemoryMap);

impl AsRef<[u8]> for Mapping {
    fn as_ref(&self) -> &[u8] {
        // Safety: the map owns `len` bytes starting at `data` for as long as it lives
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }
}

impl AsMut<[u8]> for Mapping {
    fn as_mut(&mut self) -> &mut [u8] {
        // Safety: see `as_ref`
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

// Safety: the map is plain memory with no thread affinity
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

#[cfg(test)]
mod tests {
    use super::{pool_within, ProximityAllocator};
    use crate::alloc::DETOUR_RANGE;
    use crate::error::AllocError;

    /// Function whose address anchors the allocations
    fn anchor() {}

    /// Whether two allocations share any byte
    fn overlap(a: &super::Allocation, b: &super::Allocation) -> bool {
        let a = a.as_ptr() as usize..a.as_ptr() as usize + a.len();
        let b = b.as_ptr() as usize..b.as_ptr() as usize + b.len();
        a.start < b.end && b.start < a.end
    }

    #[test]
    /// Small allocations near the same origin share a pool
    fn test_shared_pool() {
        let origin = anchor as *const () as usize;
        let mut allocator = ProximityAllocator::new(DETOUR_RANGE);
        let a = allocator.allocate(origin, 32).unwrap();
        let b = allocator.allocate(origin, 32).unwrap();
        assert_eq!(allocator.pools.len(), 1);
        assert_eq!(allocator.pools[0].1, 2);
        assert!((a.as_ptr() as usize).abs_diff(b.as_ptr() as usize) < region::page::size());

        allocator.release(&a);
        assert_eq!(allocator.pools.len(), 1);
        allocator.release(&b);
        assert!(allocator.pools.is_empty());
    }

    #[test]
    /// Memory allocated after a pool was emptied never overlaps other live allocations
    fn test_reuse_after_release() {
        let origin = anchor as *const () as usize;
        let mut allocator = ProximityAllocator::new(DETOUR_RANGE);

        let first: Vec<_> = [199, 175, 96]
            .into_iter()
            .map(|size| allocator.allocate(origin, size).unwrap())
            .collect();
        for allocation in &first {
            allocator.release(allocation);
        }
        assert!(allocator.pools.is_empty());
        drop(first);

        let second: Vec<_> = [199, 175, 96]
            .into_iter()
            .map(|size| allocator.allocate(origin, size).unwrap())
            .collect();
        for (i, a) in second.iter().enumerate() {
            for b in &second[i + 1..] {
                assert!(!overlap(a, b), "{:p} overlaps {:p}", a.as_ptr(), b.as_ptr());
            }
        }

        for allocation in &second {
            allocator.release(allocation);
        }
    }

    #[test]
    /// Pools are only reused when they lie within range of the new origin
    fn test_out_of_range_pool() {
        let origin = anchor as *const () as usize;
        let distance = region::page::size() * 64;
        let mut allocator = ProximityAllocator::new(distance);

        // the pages next to the test binary may all be taken
        match allocator.allocate(origin, 16) {
            Ok(near) => {
                assert!((near.as_ptr() as usize).abs_diff(origin) < distance);
                let far = allocator.range(origin.wrapping_add(DETOUR_RANGE));
                assert!(!allocator.pools.iter().any(|(pool, _)| pool_within(pool, &far)));
                allocator.release(&near);
            }
            Err(error) => assert!(matches!(error, AllocError::OutOfMemory)),
        }
        assert!(allocator.pools.is_empty());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    /// The acceptable range is clamped at both ends of the address space
    fn test_range_clamped() {
        let allocator = ProximityAllocator::new(DETOUR_RANGE);
        assert_eq!(allocator.range(0x1000).start, 0);
        assert_eq!(allocator.range(usize::MAX - 0x1000).end, usize::MAX);

        let range = allocator.range(0x1_0000_0000);
        assert_eq!(range.end - range.start, DETOUR_RANGE * 2);
    }
}
