//! # Data types
//!
//! Describes the machine-level types a calling convention lays out, and the compact type strings
//! (`"ii)i"`) used to describe a function signature

use std::fmt;
use std::str::FromStr;

use crate::error::SignatureError;

/// Instruction set width of a piece of code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bitness {
    /// 32-bit x86
    X86,
    /// 64-bit x86-64
    X64,
}
impl Bitness {
    /// Bitness of the running process
    pub const fn host() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::X64
        } else {
            Self::X86
        }
    }

    /// Size of a general purpose register (and a pointer) in bytes
    pub const fn word_size(self) -> usize {
        match self {
            Self::X86 => 4,
            Self::X64 => 8,
        }
    }

    /// Number of bits, as expected by the decoder and assembler
    pub const fn bits(self) -> u32 {
        match self {
            Self::X86 => 32,
            Self::X64 => 64,
        }
    }
}

/// Type of an argument or return value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// No value
    Void,
    /// `bool`
    Bool,
    /// `char`
    Char,
    /// `unsigned char`
    UChar,
    /// `short`
    Short,
    /// `unsigned short`
    UShort,
    /// `int`
    Int,
    /// `unsigned int`
    UInt,
    /// `long`, whose width depends on the platform
    Long,
    /// `unsigned long`, whose width depends on the platform
    ULong,
    /// `long long`
    LongLong,
    /// `unsigned long long`
    ULongLong,
    /// `float`
    Float,
    /// `double`
    Double,
    /// x87 80-bit extended precision
    LongDouble,
    /// Any pointer
    Pointer,
    /// Pointer to a C string
    String,
    /// Value of a fixed number of bytes, passed the way the platform passes aggregates
    Custom(usize),
}

impl DataType {
    /// Size of the type when used by code of the given bitness, padded to `alignment`
    ///
    /// An alignment of `0` leaves the natural size untouched.
    pub const fn size_for(self, bitness: Bitness, alignment: usize) -> usize {
        let size = match self {
            Self::Void => 0,
            Self::Bool | Self::Char | Self::UChar => 1,
            Self::Short | Self::UShort => 2,
            Self::Int | Self::UInt | Self::Float => 4,
            Self::LongLong | Self::ULongLong | Self::Double => 8,
            Self::LongDouble => 10,
            Self::Long | Self::ULong => match bitness {
                Bitness::X64 if !cfg!(windows) => 8,
                _ => 4,
            },
            Self::Pointer | Self::String => bitness.word_size(),
            Self::Custom(size) => size,
        };

        if alignment == 0 {
            size
        } else {
            (size + alignment - 1) / alignment * alignment
        }
    }

    /// Size of the type for the running process, padded to `alignment`
    pub const fn size(self, alignment: usize) -> usize {
        self.size_for(Bitness::host(), alignment)
    }

    /// Whether the value lives in floating point registers
    pub const fn is_floating(self) -> bool {
        matches!(self, Self::Float | Self::Double | Self::LongDouble)
    }

    /// Parses a single type character
    fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'v' => Self::Void,
            'b' => Self::Bool,
            'c' => Self::Char,
            'C' => Self::UChar,
            's' => Self::Short,
            'S' => Self::UShort,
            'i' => Self::Int,
            'I' => Self::UInt,
            'l' => Self::Long,
            'L' => Self::ULong,
            'q' => Self::LongLong,
            'Q' => Self::ULongLong,
            'f' => Self::Float,
            'd' => Self::Double,
            'D' => Self::LongDouble,
            'p' => Self::Pointer,
            't' => Self::String,
            _ => return None,
        })
    }

    /// Type character of the type, `None` for [`DataType::Custom`]
    fn as_char(self) -> Option<char> {
        Some(match self {
            Self::Void => 'v',
            Self::Bool => 'b',
            Self::Char => 'c',
            Self::UChar => 'C',
            Self::Short => 's',
            Self::UShort => 'S',
            Self::Int => 'i',
            Self::UInt => 'I',
            Self::Long => 'l',
            Self::ULong => 'L',
            Self::LongLong => 'q',
            Self::ULongLong => 'Q',
            Self::Float => 'f',
            Self::Double => 'd',
            Self::LongDouble => 'D',
            Self::Pointer => 'p',
            Self::String => 't',
            Self::Custom(_) => return None,
        })
    }
}

/// Argument and return types of a function, plus the stack alignment used to lay them out
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    /// Argument types in declaration order
    pub arguments: Vec<DataType>,
    /// Return type
    pub return_type: DataType,
    /// Stack slot alignment, `None` for the natural slot size of the calling convention
    pub alignment: Option<usize>,
}
impl Signature {
    /// Creates a signature that uses the calling convention's natural stack slot size
    pub fn new(arguments: Vec<DataType>, return_type: DataType) -> Self {
        Self {
            arguments,
            return_type,
            alignment: None,
        }
    }

    /// Overrides the stack slot alignment
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = Some(alignment);
        self
    }

    /// Stack slot alignment, falling back to the word size of `bitness`
    pub fn alignment_for(&self, bitness: Bitness) -> usize {
        self.alignment.unwrap_or_else(|| bitness.word_size())
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    /// Parses `"<arguments>)<return>"`, e.g. `"ii)i"` for `int f(int, int)`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (args, ret) = s.split_once(')').ok_or(SignatureError::MissingSeparator)?;

        let arguments = args
            .char_indices()
            .map(|(position, character)| match DataType::from_char(character) {
                Some(DataType::Void) => Err(SignatureError::VoidArgument(position)),
                Some(ty) => Ok(ty),
                None => Err(SignatureError::UnknownType {
                    character,
                    position,
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut chars = ret.chars();
        let return_type = match (chars.next(), chars.next()) {
            (Some(character), None) => {
                DataType::from_char(character).ok_or(SignatureError::UnknownType {
                    character,
                    position: args.len() + 1,
                })?
            }
            _ => return Err(SignatureError::InvalidReturn),
        };

        Ok(Self::new(arguments, return_type))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write = |f: &mut fmt::Formatter<'_>, ty: DataType| match ty.as_char() {
            Some(c) => write!(f, "{c}"),
            None => write!(f, "{ty:?}"),
        };
        for ty in &self.arguments {
            write(f, *ty)?;
        }
        write!(f, ")")?;
        write(f, self.return_type)
    }
}
