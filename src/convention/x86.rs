//! # x86 conventions
//!
//! 32-bit calling conventions. Arguments are pushed right to left, so argument `n` sits above
//! argument `n - 1`, and the first stack argument starts right after the return address at
//! `[esp + 4]`.
//!
//! - `cdecl`: everything on the stack, the caller cleans up
//! - `stdcall`: like `cdecl`, but the callee pops its arguments
//! - `thiscall` (MSVC): the receiver in `ecx`, the callee pops the rest
//! - `fastcall` (MSVC): the first two word-sized arguments in `ecx` and `edx`, the callee pops the rest
//! - GCC `cdecl`/`thiscall`: everything on the stack, aggregates are returned through a hidden
//!   pointer the callee pops
//!
//! Integers come back in `eax` (`edx:eax` for 8-byte values), floating point values in `st(0)`.

use crate::data_type::{Bitness, DataType, Signature};
use crate::register::Register;

use super::{layout_convention, ArgumentSlot, Layout, ReturnSlot};

/// Size of the return address pushed by `call`
const RETURN_ADDRESS_SIZE: usize = 4;

/// Rules that tell the 32-bit conventions apart
struct Rules {
    /// Registers handed out to word-sized arguments, left to right
    registers: &'static [Register],
    /// Whether the callee pops its stack arguments
    callee_pops: bool,
    /// Whether every aggregate is returned through a hidden pointer the callee pops (GCC)
    gcc_aggregates: bool,
}

/// Whether a return value of `ty` goes through a hidden result pointer
fn returns_indirectly(ty: DataType, rules: &Rules) -> bool {
    match ty {
        DataType::Custom(size) => rules.gcc_aggregates || !matches!(size, 1 | 2 | 4 | 8),
        _ => false,
    }
}

/// Computes the layout of a 32-bit convention
fn layout(signature: Signature, rules: Rules) -> Layout {
    let alignment = signature.alignment_for(Bitness::X86);
    let return_type = signature.return_type;
    let arguments = signature.arguments.clone();
    let mut layout = Layout::new(Bitness::X86, signature);

    let indirect = returns_indirectly(return_type, &rules);
    let mut offset = RETURN_ADDRESS_SIZE;
    if indirect {
        // hidden result pointer comes first
        offset += 4;
    }

    let mut registers = rules.registers.iter();
    for ty in arguments {
        let in_register = ty.size_for(Bitness::X86, 0) <= 4 && !ty.is_floating();
        match registers.clone().next() {
            Some(register) if in_register => {
                registers.next();
                layout.argument(ArgumentSlot::Register(*register));
            }
            _ => {
                layout.argument(ArgumentSlot::Stack(offset));
                offset += ty.size_for(Bitness::X86, alignment);
            }
        }
    }

    let stack_bytes = offset - RETURN_ADDRESS_SIZE;
    layout.cleanup = if rules.callee_pops {
        stack_bytes
    } else if indirect && rules.gcc_aggregates {
        4
    } else {
        0
    };

    layout.returns(if indirect {
        ReturnSlot::Indirect(Register::EAX)
    } else if return_type.is_floating() {
        ReturnSlot::Register(Register::ST0)
    } else if return_type.size_for(Bitness::X86, 0) > 4 {
        ReturnSlot::Split {
            low: Register::EAX,
            high: Register::EDX,
        }
    } else {
        ReturnSlot::Register(Register::EAX)
    });

    layout
}

layout_convention!(
    /// Microsoft `__cdecl`
    MsCdecl,
    "ms_cdecl",
    Bitness::X86
);
impl MsCdecl {
    /// Creates the convention for a function with the given signature
    pub fn new(signature: Signature) -> Self {
        let rules = Rules {
            registers: &[],
            callee_pops: false,
            gcc_aggregates: false,
        };
        Self {
            layout: layout(signature, rules),
        }
    }
}

layout_convention!(
    /// Microsoft `__stdcall`
    MsStdcall,
    "ms_stdcall",
    Bitness::X86
);
impl MsStdcall {
    /// Creates the convention for a function with the given signature
    pub fn new(signature: Signature) -> Self {
        let rules = Rules {
            registers: &[],
            callee_pops: true,
            gcc_aggregates: false,
        };
        Self {
            layout: layout(signature, rules),
        }
    }
}

layout_convention!(
    /// Microsoft `__thiscall`, argument 0 is the receiver passed in `ecx`
    MsThiscall,
    "ms_thiscall",
    Bitness::X86
);
impl MsThiscall {
    /// Creates the convention for a member function with the given signature
    ///
    /// The receiver must be listed as argument 0.
    pub fn new(signature: Signature) -> Self {
        let rules = Rules {
            registers: &[Register::ECX],
            callee_pops: true,
            gcc_aggregates: false,
        };
        Self {
            layout: layout(signature, rules),
        }
    }
}

layout_convention!(
    /// Microsoft `__fastcall`
    MsFastcall,
    "ms_fastcall",
    Bitness::X86
);
impl MsFastcall {
    /// Creates the convention for a function with the given signature
    pub fn new(signature: Signature) -> Self {
        let rules = Rules {
            registers: &[Register::ECX, Register::EDX],
            callee_pops: true,
            gcc_aggregates: false,
        };
        Self {
            layout: layout(signature, rules),
        }
    }
}

layout_convention!(
    /// GCC `cdecl`
    GccCdecl,
    "gcc_cdecl",
    Bitness::X86
);
impl GccCdecl {
    /// Creates the convention for a function with the given signature
    pub fn new(signature: Signature) -> Self {
        let rules = Rules {
            registers: &[],
            callee_pops: false,
            gcc_aggregates: true,
        };
        Self {
            layout: layout(signature, rules),
        }
    }
}

layout_convention!(
    /// GCC member functions, argument 0 is the receiver passed as the first stack argument
    GccThiscall,
    "gcc_thiscall",
    Bitness::X86
);
impl GccThiscall {
    /// Creates the convention for a member function with the given signature
    ///
    /// The receiver must be listed as argument 0.
    pub fn new(signature: Signature) -> Self {
        let rules = Rules {
            registers: &[],
            callee_pops: false,
            gcc_aggregates: true,
        };
        Self {
            layout: layout(signature, rules),
        }
    }
}
