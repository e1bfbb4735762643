//! # x86-64 conventions
//!
//! - System V: integers in `rdi, rsi, rdx, rcx, r8, r9`, floating point values in `xmm0-7`,
//!   everything else in 8-byte stack slots starting at `[rsp + 8]`
//! - Microsoft x64: the first four arguments in `rcx, rdx, r8, r9` or `xmm0-3` by position, the
//!   rest above the 32-byte shadow space at `[rsp + 40]`
//!
//! Neither convention has the callee pop anything. Aggregates that don't fit in registers are
//! returned through a hidden pointer passed as the first integer argument, which the callee also
//! hands back in `rax`.

use crate::data_type::{Bitness, DataType, Signature};
use crate::register::Register;

use super::{layout_convention, ArgumentSlot, Layout, ReturnSlot};

/// Size of the return address pushed by `call`
const RETURN_ADDRESS_SIZE: usize = 8;

/// Size of the Microsoft x64 home area for register arguments
const SHADOW_SPACE: usize = 32;

/// System V integer argument registers
const SYSV_INTEGER: [Register; 6] = [
    Register::RDI,
    Register::RSI,
    Register::RDX,
    Register::RCX,
    Register::R8,
    Register::R9,
];

/// System V floating point argument registers
const SYSV_FLOAT: [Register; 8] = [
    Register::XMM0,
    Register::XMM1,
    Register::XMM2,
    Register::XMM3,
    Register::XMM4,
    Register::XMM5,
    Register::XMM6,
    Register::XMM7,
];

/// Microsoft x64 integer argument registers
const MS_INTEGER: [Register; 4] = [Register::RCX, Register::RDX, Register::R8, Register::R9];

/// Microsoft x64 floating point argument registers
const MS_FLOAT: [Register; 4] = [Register::XMM0, Register::XMM1, Register::XMM2, Register::XMM3];

/// Rounds `size` up to whole 8-byte stack slots
fn slot_size(size: usize, alignment: usize) -> usize {
    let alignment = alignment.max(RETURN_ADDRESS_SIZE);
    (size.max(1) + alignment - 1) / alignment * alignment
}

layout_convention!(
    /// System V AMD64 ABI, used by Linux, macOS and the BSDs
    SysV64,
    "sysv64",
    Bitness::X64
);
impl SysV64 {
    /// Creates the convention for a function with the given signature
    ///
    /// Aggregates up to 8 bytes are passed in one integer register, wider ones are treated as
    /// memory class.
    pub fn new(signature: Signature) -> Self {
        let alignment = signature.alignment_for(Bitness::X64);
        let return_type = signature.return_type;
        let arguments = signature.arguments.clone();
        let mut layout = Layout::new(Bitness::X64, signature);
        layout.preserve(Register::RAX);

        let indirect = matches!(return_type, DataType::Custom(size) if size > 16);
        let mut integer = SYSV_INTEGER.iter();
        let mut float = SYSV_FLOAT.iter();
        if indirect {
            integer.next();
            layout.preserve(Register::RDI);
        }

        let mut offset = RETURN_ADDRESS_SIZE;
        for ty in arguments {
            let register = match ty {
                DataType::Float | DataType::Double => float.next(),
                DataType::LongDouble => None,
                DataType::Custom(size) if size > 8 => None,
                _ => integer.next(),
            };
            match register {
                Some(register) => layout.argument(ArgumentSlot::Register(*register)),
                None => {
                    layout.argument(ArgumentSlot::Stack(offset));
                    offset += slot_size(ty.size_for(Bitness::X64, 0), alignment);
                }
            }
        }

        layout.returns(match return_type {
            _ if indirect => ReturnSlot::Indirect(Register::RAX),
            DataType::Float | DataType::Double => ReturnSlot::Register(Register::XMM0),
            DataType::LongDouble => ReturnSlot::Register(Register::ST0),
            DataType::Custom(size) if size > 8 => ReturnSlot::Split {
                low: Register::RAX,
                high: Register::RDX,
            },
            _ => ReturnSlot::Register(Register::RAX),
        });

        Self { layout }
    }
}

layout_convention!(
    /// Microsoft x64 calling convention
    MsX64,
    "ms_x64",
    Bitness::X64
);
impl MsX64 {
    /// Creates the convention for a function with the given signature
    ///
    /// Aggregates whose size isn't 1, 2, 4 or 8 bytes are passed by reference: their argument
    /// location holds the pointer to the value.
    pub fn new(signature: Signature) -> Self {
        let return_type = signature.return_type;
        let arguments = signature.arguments.clone();
        let mut layout = Layout::new(Bitness::X64, signature);
        layout.preserve(Register::RAX);

        let indirect = matches!(return_type, DataType::Custom(size) if !matches!(size, 1 | 2 | 4 | 8));
        let first = usize::from(indirect);
        if indirect {
            layout.preserve(Register::RCX);
        }

        for (i, ty) in arguments.into_iter().enumerate() {
            let position = i + first;
            let slot = if position < MS_INTEGER.len() {
                let register = if ty.is_floating() {
                    MS_FLOAT[position]
                } else {
                    MS_INTEGER[position]
                };
                ArgumentSlot::Register(register)
            } else {
                ArgumentSlot::Stack(
                    RETURN_ADDRESS_SIZE + SHADOW_SPACE + (position - MS_INTEGER.len()) * 8,
                )
            };
            layout.argument(slot);
        }

        layout.returns(if indirect {
            ReturnSlot::Indirect(Register::RAX)
        } else if return_type.is_floating() {
            ReturnSlot::Register(Register::XMM0)
        } else {
            ReturnSlot::Register(Register::RAX)
        });

        Self { layout }
    }
}
