//! # Return addresses
//!
//! When a hooked function is entered, the bridge replaces the caller's return address with the
//! address of the post-call continuation. The real address is parked here, keyed by the stack
//! pointer of the activation, until the continuation asks for it back.
//!
//! Each key holds a stack instead of a single slot: a function that re-enters itself through the
//! same stack slot (tail calls, or a callback calling the hooked function) pushes again before the
//! first activation has returned, and only LIFO order matches how those activations unwind.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

/// Per-hook store of displaced return addresses
#[derive(Debug, Default)]
pub struct ReturnAddressMap {
    /// Pending return addresses for each stack pointer, most recent last
    stacks: DashMap<usize, Vec<usize>>,
    /// Most recently pushed or popped address
    last_known: AtomicUsize,
    /// Number of pops that found nothing to return
    violations: AtomicUsize,
}

impl ReturnAddressMap {
    /// Creates an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `address` as the return address of the activation at `stack_pointer`
    pub fn push(&self, stack_pointer: usize, address: usize) {
        self.stacks.entry(stack_pointer).or_default().push(address);
        self.last_known.store(address, Ordering::Relaxed);
    }

    /// Takes back the most recent return address recorded for `stack_pointer`
    ///
    /// A missing entry means the continuation was reached without passing through the entry
    /// bridge. There is no correct answer at that point, so the last address seen by this map is
    /// returned instead (or `0` if there never was one).
    pub fn pop(&self, stack_pointer: usize) -> usize {
        let popped = match self.stacks.get_mut(&stack_pointer) {
            Some(mut stack) => stack.pop(),
            None => None,
        };
        // drop emptied keys so reused stack addresses start fresh
        self.stacks
            .remove_if(&stack_pointer, |_, stack| stack.is_empty());

        match popped {
            Some(address) => {
                self.last_known.store(address, Ordering::Relaxed);
                address
            }
            None => {
                self.violations.fetch_add(1, Ordering::Relaxed);
                let fallback = self.last_known.load(Ordering::Relaxed);
                tracing::error!(
                    stack_pointer = format_args!("{stack_pointer:#x}"),
                    fallback = format_args!("{fallback:#x}"),
                    "no return address recorded for stack pointer"
                );
                fallback
            }
        }
    }

    /// Number of pending return addresses for `stack_pointer`
    pub fn depth(&self, stack_pointer: usize) -> usize {
        self.stacks
            .get(&stack_pointer)
            .map_or(0, |stack| stack.len())
    }

    /// Number of stack pointers with pending return addresses
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    /// Whether no return address is pending
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Number of pops that had no matching push
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::Relaxed)
    }
}
