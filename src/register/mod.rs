//! # Registers
//!
//! The x86-64 register file as seen by generated bridge code, and the snapshot containers callbacks
//! read and modify

use iced_x86::code_asm::{
    registers, AsmRegister16, AsmRegister32, AsmRegister64, AsmRegister8, AsmRegisterMm,
    AsmRegisterSegment, AsmRegisterSt, AsmRegisterXmm,
};

use crate::data_type::Bitness;

pub mod context;

pub use context::{RegisterCell, RegisterContext};

/// Typed assembler operand for a [`Register`]
#[derive(Debug, Clone, Copy)]
pub(crate) enum AsmRegister {
    /// 8-bit general purpose register
    Gpr8(AsmRegister8),
    /// 16-bit general purpose register
    Gpr16(AsmRegister16),
    /// 32-bit general purpose register
    Gpr32(AsmRegister32),
    /// 64-bit general purpose register
    Gpr64(AsmRegister64),
    /// MMX register
    Mm(AsmRegisterMm),
    /// SSE register
    Xmm(AsmRegisterXmm),
    /// Segment register
    Segment(AsmRegisterSegment),
    /// x87 stack register
    St(AsmRegisterSt),
}

/// Generates [`Register`] together with its assembler operand and 32-bit availability
macro_rules! registers {
    ($($name:ident => $kind:ident($asm:ident), $x86:literal;)*) => {
        /// Architecture register
        #[allow(clippy::upper_case_acronyms, missing_docs)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Register {
            $($name,)*
        }

        impl Register {
            /// Every register, in cell order
            pub const ALL: &'static [Register] = &[$(Register::$name,)*];

            /// Assembler operand for the register
            pub(crate) fn operand(self) -> AsmRegister {
                match self {
                    $(Register::$name => AsmRegister::$kind(registers::$asm),)*
                }
            }

            /// Whether the register can be encoded by code of the given bitness
            pub const fn is_available(self, bitness: Bitness) -> bool {
                match bitness {
                    Bitness::X64 => true,
                    Bitness::X86 => match self {
                        $(Register::$name => $x86,)*
                    },
                }
            }
        }
    };
}

registers! {
    AL => Gpr8(al), true;
    CL => Gpr8(cl), true;
    DL => Gpr8(dl), true;
    BL => Gpr8(bl), true;
    SPL => Gpr8(spl), false;
    BPL => Gpr8(bpl), false;
    SIL => Gpr8(sil), false;
    DIL => Gpr8(dil), false;
    R8B => Gpr8(r8b), false;
    R9B => Gpr8(r9b), false;
    R10B => Gpr8(r10b), false;
    R11B => Gpr8(r11b), false;
    R12B => Gpr8(r12b), false;
    R13B => Gpr8(r13b), false;
    R14B => Gpr8(r14b), false;
    R15B => Gpr8(r15b), false;
    AH => Gpr8(ah), true;
    CH => Gpr8(ch), true;
    DH => Gpr8(dh), true;
    BH => Gpr8(bh), true;
    AX => Gpr16(ax), true;
    CX => Gpr16(cx), true;
    DX => Gpr16(dx), true;
    BX => Gpr16(bx), true;
    SP => Gpr16(sp), true;
    BP => Gpr16(bp), true;
    SI => Gpr16(si), true;
    DI => Gpr16(di), true;
    R8W => Gpr16(r8w), false;
    R9W => Gpr16(r9w), false;
    R10W => Gpr16(r10w), false;
    R11W => Gpr16(r11w), false;
    R12W => Gpr16(r12w), false;
    R13W => Gpr16(r13w), false;
    R14W => Gpr16(r14w), false;
    R15W => Gpr16(r15w), false;
    EAX => Gpr32(eax), true;
    ECX => Gpr32(ecx), true;
    EDX => Gpr32(edx), true;
    EBX => Gpr32(ebx), true;
    ESP => Gpr32(esp), true;
    EBP => Gpr32(ebp), true;
    ESI => Gpr32(esi), true;
    EDI => Gpr32(edi), true;
    R8D => Gpr32(r8d), false;
    R9D => Gpr32(r9d), false;
    R10D => Gpr32(r10d), false;
    R11D => Gpr32(r11d), false;
    R12D => Gpr32(r12d), false;
    R13D => Gpr32(r13d), false;
    R14D => Gpr32(r14d), false;
    R15D => Gpr32(r15d), false;
    RAX => Gpr64(rax), false;
    RCX => Gpr64(rcx), false;
    RDX => Gpr64(rdx), false;
    RBX => Gpr64(rbx), false;
    RSP => Gpr64(rsp), false;
    RBP => Gpr64(rbp), false;
    RSI => Gpr64(rsi), false;
    RDI => Gpr64(rdi), false;
    R8 => Gpr64(r8), false;
    R9 => Gpr64(r9), false;
    R10 => Gpr64(r10), false;
    R11 => Gpr64(r11), false;
    R12 => Gpr64(r12), false;
    R13 => Gpr64(r13), false;
    R14 => Gpr64(r14), false;
    R15 => Gpr64(r15), false;
    MM0 => Mm(mm0), true;
    MM1 => Mm(mm1), true;
    MM2 => Mm(mm2), true;
    MM3 => Mm(mm3), true;
    MM4 => Mm(mm4), true;
    MM5 => Mm(mm5), true;
    MM6 => Mm(mm6), true;
    MM7 => Mm(mm7), true;
    XMM0 => Xmm(xmm0), true;
    XMM1 => Xmm(xmm1), true;
    XMM2 => Xmm(xmm2), true;
    XMM3 => Xmm(xmm3), true;
    XMM4 => Xmm(xmm4), true;
    XMM5 => Xmm(xmm5), true;
    XMM6 => Xmm(xmm6), true;
    XMM7 => Xmm(xmm7), true;
    XMM8 => Xmm(xmm8), false;
    XMM9 => Xmm(xmm9), false;
    XMM10 => Xmm(xmm10), false;
    XMM11 => Xmm(xmm11), false;
    XMM12 => Xmm(xmm12), false;
    XMM13 => Xmm(xmm13), false;
    XMM14 => Xmm(xmm14), false;
    XMM15 => Xmm(xmm15), false;
    CS => Segment(cs), true;
    SS => Segment(ss), true;
    DS => Segment(ds), true;
    ES => Segment(es), true;
    FS => Segment(fs), true;
    GS => Segment(gs), true;
    ST0 => St(st0), true;
    ST1 => St(st1), true;
    ST2 => St(st2), true;
    ST3 => St(st3), true;
    ST4 => St(st4), true;
    ST5 => St(st5), true;
    ST6 => St(st6), true;
    ST7 => St(st7), true;
}

/// General purpose register families the bridge treats specially
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Family {
    /// `rax` and its parts, used as the context base while saving and restoring
    Accumulator,
    /// `rcx` and its parts, used as a scratch register while saving
    Counter,
    /// `rsp` and its parts
    StackPointer,
    /// Everything else
    Other,
}

impl Register {
    /// Width of the register in bytes
    pub fn size(self) -> usize {
        match self.operand() {
            AsmRegister::Gpr8(_) => 1,
            AsmRegister::Gpr16(_) | AsmRegister::Segment(_) => 2,
            AsmRegister::Gpr32(_) => 4,
            AsmRegister::Gpr64(_) | AsmRegister::Mm(_) => 8,
            AsmRegister::St(_) => 10,
            AsmRegister::Xmm(_) => 16,
        }
    }

    /// Index of the register's cell in a [`RegisterContext`]
    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    /// Full-width stack pointer for the bitness
    pub const fn stack_pointer(bitness: Bitness) -> Self {
        match bitness {
            Bitness::X86 => Self::ESP,
            Bitness::X64 => Self::RSP,
        }
    }

    /// Full-width accumulator for the bitness
    pub const fn accumulator(bitness: Bitness) -> Self {
        match bitness {
            Bitness::X86 => Self::EAX,
            Bitness::X64 => Self::RAX,
        }
    }

    /// Family of general purpose registers this register belongs to
    pub(crate) const fn family(self) -> Family {
        match self {
            Self::AL | Self::AH | Self::AX | Self::EAX | Self::RAX => Family::Accumulator,
            Self::CL | Self::CH | Self::CX | Self::ECX | Self::RCX => Family::Counter,
            Self::SPL | Self::SP | Self::ESP | Self::RSP => Family::StackPointer,
            _ => Family::Other,
        }
    }

    /// Part of `rcx` covering the same bits of its own register
    pub(crate) const fn counter_alias(self) -> Option<Self> {
        Some(match self {
            Self::AL | Self::CL | Self::SPL => Self::CL,
            Self::AH | Self::CH => Self::CH,
            Self::AX | Self::CX | Self::SP => Self::CX,
            Self::EAX | Self::ECX | Self::ESP => Self::ECX,
            Self::RAX | Self::RCX | Self::RSP => Self::RCX,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Family, Register};
    use crate::data_type::Bitness;

    #[test]
    /// Register widths follow their class
    fn test_sizes() {
        assert_eq!(Register::AL.size(), 1);
        assert_eq!(Register::AH.size(), 1);
        assert_eq!(Register::R15W.size(), 2);
        assert_eq!(Register::EAX.size(), 4);
        assert_eq!(Register::RSP.size(), 8);
        assert_eq!(Register::MM3.size(), 8);
        assert_eq!(Register::ST0.size(), 10);
        assert_eq!(Register::XMM15.size(), 16);
        assert_eq!(Register::FS.size(), 2);
    }

    #[test]
    /// Cell indices are unique and dense
    fn test_indices() {
        for (i, register) in Register::ALL.iter().enumerate() {
            assert_eq!(register.index(), i);
        }
    }

    #[test]
    /// REX-only registers are unavailable to 32-bit code
    fn test_availability() {
        assert!(Register::EAX.is_available(Bitness::X86));
        assert!(Register::XMM7.is_available(Bitness::X86));
        assert!(Register::ST0.is_available(Bitness::X86));
        assert!(!Register::RAX.is_available(Bitness::X86));
        assert!(!Register::R8D.is_available(Bitness::X86));
        assert!(!Register::XMM8.is_available(Bitness::X86));
        assert!(!Register::SIL.is_available(Bitness::X86));
        assert!(Register::ALL.iter().all(|r| r.is_available(Bitness::X64)));
    }

    #[test]
    /// Accumulator, counter and stack pointer parts map onto `rcx` parts of the same width
    fn test_families() {
        assert_eq!(Register::EAX.family(), Family::Accumulator);
        assert_eq!(Register::CH.family(), Family::Counter);
        assert_eq!(Register::RSP.family(), Family::StackPointer);
        assert_eq!(Register::RDI.family(), Family::Other);
        assert_eq!(Register::RAX.counter_alias(), Some(Register::RCX));
        assert_eq!(Register::AH.counter_alias(), Some(Register::CH));
        assert_eq!(Register::ESP.counter_alias(), Some(Register::ECX));
        assert_eq!(Register::RDX.counter_alias(), None);
    }
}
