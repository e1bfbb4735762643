//! # Bridge
//!
//! Generated code between a hooked function and its callbacks. The entry bridge runs when the
//! function is called: it snapshots the registers, remembers the caller's return address and
//! replaces it with the continuation, runs the pre callbacks, and then either jumps to the
//! trampoline or returns straight into the continuation. The continuation runs when the function
//! (or the override) returns: it snapshots the registers again, runs the post callbacks and returns
//! to the real caller.
//!
//! Neither bridge depends on its own address, so both can be measured before memory is allocated.

use crate::convention::CallingConvention;
use crate::data_type::Bitness;
use crate::error::GenerateError;
use crate::hook::HookPhase;
use crate::register::Register;

mod emit;
pub(crate) mod runtime;

use emit::{Argument, Emitter};

/// Addresses baked into the generated code
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Addresses {
    /// Hook passed to every helper
    pub hook: usize,
    /// Context the entry bridge saves to
    pub pre_context: usize,
    /// Context the continuation saves to
    pub post_context: usize,
    /// Code the hooked function returns to
    pub continuation: usize,
    /// Relocated start of the original function
    pub trampoline: usize,
    /// [`runtime::push_return_address`]
    pub push_return_address: usize,
    /// [`runtime::pop_return_address`]
    pub pop_return_address: usize,
    /// [`runtime::dispatch`]
    pub dispatch: usize,
}

impl Addresses {
    /// Addresses of the Rust helpers, everything else unset
    pub(crate) fn runtime() -> Self {
        Self {
            push_return_address: runtime::push_return_address as *const () as usize,
            pop_return_address: runtime::pop_return_address as *const () as usize,
            dispatch: runtime::dispatch as *const () as usize,
            ..Self::default()
        }
    }
}

/// What the bridges need to know about a calling convention
#[derive(Debug, Clone)]
pub(crate) struct Bridge {
    /// Registers to save and restore
    registers: Vec<Register>,
    /// Bytes the callee pops on return
    cleanup: usize,
    /// Bytes of `st0` spilled after the function returns
    st0_width: usize,
    /// Width of the generated code
    bitness: Bitness,
}

impl Bridge {
    /// Describes the bridges for a convention
    pub(crate) fn new(convention: &dyn CallingConvention) -> Self {
        let bitness = convention.bitness();
        let mut registers = convention.registers_to_preserve();
        let accumulator = Register::accumulator(bitness);
        if !registers.contains(&accumulator) {
            registers.push(accumulator);
        }

        let signature = convention.signature();
        let st0_width = if signature.return_type.is_floating() {
            signature
                .return_type
                .size_for(bitness, signature.alignment_for(bitness))
        } else {
            10
        };

        Self {
            registers,
            cleanup: convention.stack_cleanup_bytes(),
            st0_width,
            bitness,
        }
    }

    /// Registers the bridges save and restore
    pub(crate) fn registers(&self) -> &[Register] {
        &self.registers
    }

    /// Whether the function hands its result back on the x87 stack
    fn returns_in_st0(&self) -> bool {
        self.registers.contains(&Register::ST0) && Register::ST0.is_available(self.bitness)
    }

    /// Assembles the entry bridge for execution at `ip`
    pub(crate) fn entry(&self, addresses: &Addresses, ip: usize) -> Result<Vec<u8>, GenerateError> {
        let mut e = Emitter::new(self.bitness, self.st0_width)?;
        let mut skip = e.label();

        e.save(addresses.pre_context, &self.registers, false)?;
        e.call_helper(
            addresses.push_return_address,
            addresses.hook,
            Argument::StackPointer,
        )?;
        e.load_accumulator(addresses.continuation)?;
        e.store_accumulator_at_stack()?;
        e.call_helper(
            addresses.dispatch,
            addresses.hook,
            Argument::Value(HookPhase::Pre as u32),
        )?;
        e.test_result()?;
        e.restore(addresses.pre_context, &self.registers, false)?;
        e.jump_if_set(skip)?;
        e.jump_absolute(addresses.trampoline)?;

        // returning here lands in the continuation, as if the function had returned
        e.bind(&mut skip)?;
        if self.returns_in_st0() {
            // the continuation pops st0, so push the value the callbacks left
            e.reload_st0(addresses.pre_context)?;
        }
        e.ret(self.cleanup)?;

        e.assemble(ip)
    }

    /// Assembles the continuation for execution at `ip`
    pub(crate) fn continuation(
        &self,
        addresses: &Addresses,
        ip: usize,
    ) -> Result<Vec<u8>, GenerateError> {
        let mut e = Emitter::new(self.bitness, self.st0_width)?;

        // back to the stack pointer seen at entry, pointing at the replaced return address
        e.reserve_stack(self.cleanup + self.bitness.word_size())?;
        e.save(addresses.post_context, &self.registers, true)?;
        e.call_helper(
            addresses.dispatch,
            addresses.hook,
            Argument::Value(HookPhase::Post as u32),
        )?;
        e.call_helper(
            addresses.pop_return_address,
            addresses.hook,
            Argument::StackPointer,
        )?;
        e.store_accumulator_at_stack()?;
        e.restore(addresses.post_context, &self.registers, true)?;
        e.ret(self.cleanup)?;

        e.assemble(ip)
    }
}
