//! # Convention
//!
//! Calling conventions describe where a function finds its arguments and leaves its return value.
//! The bridge only ever asks a convention questions (which registers to save, how many bytes to
//! pop on return, where argument `n` lives), so adding an ABI means adding an implementation of
//! [`CallingConvention`], never touching code generation.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;

use crate::data_type::{Bitness, Signature};
use crate::register::{Register, RegisterContext};

pub mod x64;
pub mod x86;

pub use x64::{MsX64, SysV64};
pub use x86::{GccCdecl, GccThiscall, MsCdecl, MsFastcall, MsStdcall, MsThiscall};

/// Layout of arguments and return value for one ABI
///
/// Implementations are pure descriptions: every location is derived from a [`RegisterContext`]
/// snapshot, and stack offsets are computed once when the convention is constructed.
pub trait CallingConvention: Send + Sync + fmt::Debug {
    /// Short name of the convention
    fn name(&self) -> &'static str;

    /// Instruction set width the convention applies to
    fn bitness(&self) -> Bitness;

    /// Argument and return types the layout was computed from
    fn signature(&self) -> &Signature;

    /// Registers the bridge must save before running callbacks and restore afterwards
    fn registers_to_preserve(&self) -> Vec<Register>;

    /// Bytes of arguments the callee pops when it returns (the `imm16` of `ret imm16`)
    fn stack_cleanup_bytes(&self) -> usize;

    /// Address of argument `index` as seen at function entry
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below the number of arguments in the signature.
    fn argument_location(&self, index: usize, context: &RegisterContext) -> *mut u8;

    /// Address callbacks read the return value from and write a replacement to
    fn return_location(&self, context: &RegisterContext) -> *mut u8;

    /// Called after a new return value was written to [`CallingConvention::return_location`]
    ///
    /// Conventions that assemble the return value in a scratch buffer copy it back into the
    /// register cells here.
    fn on_return_location_changed(&self, context: &RegisterContext, new_value: *const u8) {
        let _ = (context, new_value);
    }
}

/// Where an argument lives at function entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentSlot {
    /// Passed in a register
    Register(Register),
    /// Passed on the stack, at this offset from the entry stack pointer
    Stack(usize),
}

/// Where the return value lives once the function returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnSlot {
    /// Held in a single register
    Register(Register),
    /// Split across two registers, low half first
    Split {
        /// Register holding the low half
        low: Register,
        /// Register holding the high half
        high: Register,
    },
    /// Written to memory whose address the register holds
    Indirect(Register),
}

/// Scratch buffer a split return value is assembled in
#[derive(Default)]
pub(crate) struct ReturnBuffer(UnsafeCell<[u8; 16]>);

// Safety: like register contexts, the buffer is scratch space owned by the call currently passing
// through the hook
unsafe impl Sync for ReturnBuffer {}

impl ReturnBuffer {
    /// Start of the buffer
    fn as_ptr(&self) -> *mut u8 {
        self.0.get().cast()
    }
}

/// Precomputed locations shared by every convention implementation
pub(crate) struct Layout {
    /// Instruction set width
    bitness: Bitness,
    /// Types the layout was computed from
    signature: Signature,
    /// Location of each argument
    arguments: Vec<ArgumentSlot>,
    /// Location of the return value
    ret: ReturnSlot,
    /// Registers to save and restore
    registers: Vec<Register>,
    /// Bytes popped by the callee
    cleanup: usize,
    /// Scratch space for split return values
    buffer: ReturnBuffer,
}

impl Layout {
    /// Starts a layout with the stack pointer preserved
    fn new(bitness: Bitness, signature: Signature) -> Self {
        Self {
            bitness,
            signature,
            arguments: Vec::new(),
            ret: ReturnSlot::Register(Register::accumulator(bitness)),
            registers: vec![Register::stack_pointer(bitness)],
            cleanup: 0,
            buffer: ReturnBuffer::default(),
        }
    }

    /// Adds a register to the preserved set
    fn preserve(&mut self, register: Register) {
        if !self.registers.contains(&register) {
            self.registers.push(register);
        }
    }

    /// Adds an argument slot, preserving its register
    fn argument(&mut self, slot: ArgumentSlot) {
        if let ArgumentSlot::Register(register) = slot {
            self.preserve(register);
        }
        self.arguments.push(slot);
    }

    /// Sets the return slot, preserving its registers
    fn returns(&mut self, slot: ReturnSlot) {
        match slot {
            ReturnSlot::Register(register) | ReturnSlot::Indirect(register) => {
                self.preserve(register)
            }
            ReturnSlot::Split { low, high } => {
                self.preserve(low);
                self.preserve(high);
            }
        }
        self.ret = slot;
    }

    /// Reads a saved register as a word of the layout's bitness
    fn word(&self, context: &RegisterContext, register: Register) -> usize {
        let cell = context.cell(register);
        // Safety: cells are initialized and wider than any word
        unsafe {
            match self.bitness {
                Bitness::X86 => cell.get::<u32>() as usize,
                Bitness::X64 => cell.get::<u64>() as usize,
            }
        }
    }

    /// See [`CallingConvention::argument_location`]
    fn argument_location(&self, index: usize, context: &RegisterContext) -> *mut u8 {
        let Some(slot) = self.arguments.get(index) else {
            panic!(
                "argument {index} out of range for a function with {} arguments",
                self.arguments.len()
            );
        };
        match *slot {
            ArgumentSlot::Register(register) => context.address_of(register),
            ArgumentSlot::Stack(offset) => {
                let sp = self.word(context, Register::stack_pointer(self.bitness));
                sp.wrapping_add(offset) as *mut u8
            }
        }
    }

    /// See [`CallingConvention::return_location`]
    fn return_location(&self, context: &RegisterContext) -> *mut u8 {
        match self.ret {
            ReturnSlot::Register(register) => context.address_of(register),
            ReturnSlot::Indirect(register) => self.word(context, register) as *mut u8,
            ReturnSlot::Split { low, high } => {
                let half = self.bitness.word_size();
                let buffer = self.buffer.as_ptr();
                // Safety: both cells and the buffer hold at least two words
                unsafe {
                    ptr::copy_nonoverlapping(context.address_of(low), buffer, half);
                    ptr::copy_nonoverlapping(context.address_of(high), buffer.add(half), half);
                }
                buffer
            }
        }
    }

    /// See [`CallingConvention::on_return_location_changed`]
    fn on_return_location_changed(&self, context: &RegisterContext, new_value: *const u8) {
        if let ReturnSlot::Split { low, high } = self.ret {
            let half = self.bitness.word_size();
            // Safety: the caller passes the two-word value it just stored
            unsafe {
                ptr::copy(new_value, context.address_of(low), half);
                ptr::copy(new_value.add(half), context.address_of(high), half);
            }
        }
    }
}

impl fmt::Debug for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layout")
            .field("signature", &self.signature.to_string())
            .field("arguments", &self.arguments)
            .field("ret", &self.ret)
            .field("registers", &self.registers)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

/// Defines a convention type whose behaviour is fully described by a [`Layout`]
macro_rules! layout_convention {
    ($(#[$doc:meta])* $name:ident, $label:literal, $bitness:expr) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name {
            /// Precomputed locations
            layout: $crate::convention::Layout,
        }

        impl $name {
            /// Argument slots, in declaration order
            pub fn arguments(&self) -> &[$crate::convention::ArgumentSlot] {
                &self.layout.arguments
            }

            /// Return value slot
            pub fn return_slot(&self) -> $crate::convention::ReturnSlot {
                self.layout.ret
            }
        }

        impl $crate::convention::CallingConvention for $name {
            fn name(&self) -> &'static str {
                $label
            }

            fn bitness(&self) -> $crate::data_type::Bitness {
                $bitness
            }

            fn signature(&self) -> &$crate::data_type::Signature {
                &self.layout.signature
            }

            fn registers_to_preserve(&self) -> Vec<$crate::register::Register> {
                self.layout.registers.clone()
            }

            fn stack_cleanup_bytes(&self) -> usize {
                self.layout.cleanup
            }

            fn argument_location(
                &self,
                index: usize,
                context: &$crate::register::RegisterContext,
            ) -> *mut u8 {
                self.layout.argument_location(index, context)
            }

            fn return_location(&self, context: &$crate::register::RegisterContext) -> *mut u8 {
                self.layout.return_location(context)
            }

            fn on_return_location_changed(
                &self,
                context: &$crate::register::RegisterContext,
                new_value: *const u8,
            ) {
                self.layout.on_return_location_changed(context, new_value)
            }
        }
    };
}
pub(crate) use layout_convention;

/// Whether two conventions describe the same layout
pub(crate) fn same_layout(a: &dyn CallingConvention, b: &dyn CallingConvention) -> bool {
    a.name() == b.name() && a.bitness() == b.bitness() && a.signature() == b.signature()
}
