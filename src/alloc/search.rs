//! # Free region search
//!
//! Walks the address space away from an origin looking for unmapped pages
//!
//! Based on the region search in detour-rs: https://github.com/darfink/detour-rs

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

/// Which way to walk from the origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards lower addresses
    Before,
    /// Towards higher addresses
    After,
}

/// Iterates over unmapped pages within `range`, nearest to `origin` first
pub fn free_regions(
    origin: usize,
    range: Range<usize>,
    direction: Direction,
) -> impl Iterator<Item = Result<usize, region::Error>> {
    FreeRegions {
        range,
        direction,
        current: origin,
    }
}

/// Whether every page in `address..address + size` is unmapped
pub fn is_free(address: usize, size: usize) -> Result<bool, region::Error> {
    let page_size = region::page::size();
    let mut page = address;
    while page < address.saturating_add(size) {
        match region::query(page as *const u8) {
            Ok(_) => return Ok(false),
            Err(region::Error::UnmappedRegion) => page += page_size,
            Err(error) => return Err(error),
        }
    }
    Ok(true)
}

/// Iterator returned by [`free_regions`]
struct FreeRegions {
    /// Bounds of the search
    range: Range<usize>,
    /// Direction of the search
    direction: Direction,
    /// Next address to query
    current: usize,
}

impl FreeRegions {
    /// Moves `current` by one step from `from`
    fn step(&mut self, from: usize, page_size: usize) {
        self.current = match self.direction {
            Direction::Before => from.saturating_sub(page_size),
            Direction::After => from.saturating_add(page_size),
        };
    }
}

impl Iterator for FreeRegions {
    type Item = Result<usize, region::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let page_size = region::page::size();

        while self.current > 0 && self.range.contains(&self.current) {
            match region::query(self.current as *const u8) {
                // skip over the whole mapped region in one go
                Ok(mapped) => {
                    let span = mapped.as_range();
                    match self.direction {
                        Direction::Before => self.step(span.start, page_size),
                        Direction::After => self.current = span.end,
                    }
                }
                Err(region::Error::UnmappedRegion) => {
                    let found = region::page::floor(self.current as *const u8) as usize;
                    self.step(self.current, page_size);
                    return Some(Ok(found));
                }
                Err(error) => {
                    self.step(self.current, page_size);
                    return Some(Err(error));
                }
            }
        }

        None
    }
}
