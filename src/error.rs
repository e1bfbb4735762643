//! # Errors
//!
//! Error types for every fallible stage of installing a hook

use iced_x86::IcedError;
use thiserror::Error;

use crate::data_type::Bitness;

/// Errors while allocating executable memory close to a target
#[derive(Debug, Error)]
pub enum AllocError {
    /// Ran out of memory within an acceptable proximity to the allocation location
    #[error("ran out of memory within an acceptable proximity to the allocation location")]
    OutOfMemory,
    /// Error while memmapping a region
    #[error("failed to map memory: {0}")]
    Mmap(String),
    /// Error while querying a memory region
    #[error("failed to query memory region: {0}")]
    Region(#[from] region::Error),
}

/// Errors while writing over a protected code location
#[derive(Debug, Error)]
pub enum PatchError {
    /// Error when setting memory protections
    #[error("error setting memory protections: {0}")]
    Protection(#[from] region::Error),
}

/// Errors while copying a function prologue into a trampoline
#[derive(Debug, Error)]
pub enum RelocationError {
    /// The decoder hit bytes that don't form a valid instruction
    #[error("invalid instruction at {0:#x}")]
    InvalidInstruction(usize),
    /// Control flow leaves the function before enough bytes are covered for the redirect
    #[error("function at {address:#x} ends after {available} bytes, {needed} bytes are needed")]
    TooShort {
        /// Entry address of the function
        address: usize,
        /// Bytes needed for the redirect
        needed: usize,
        /// Bytes available before control flow leaves the function
        available: usize,
    },
    /// A relative branch lands in the middle of a relocated instruction
    #[error("branch at {branch:#x} targets {target:#x}, inside the relocated window")]
    BranchIntoWindow {
        /// Address of the branch instruction
        branch: usize,
        /// Address the branch jumps to
        target: usize,
    },
    /// The relocated trampoline does not fit in its buffer
    #[error("relocated code needs {needed} bytes, {capacity} are available")]
    Overflow {
        /// Size of the encoded trampoline
        needed: usize,
        /// Size of the allocated buffer
        capacity: usize,
    },
    /// Re-encoding the instructions at their new location failed
    #[error("failed to encode relocated instructions: {0}")]
    Encode(#[from] IcedError),
}

/// Errors while generating bridge code
#[derive(Debug, Error)]
pub enum GenerateError {
    /// The assembler rejected an instruction
    #[error("assembler error: {0}")]
    Assembler(#[from] IcedError),
    /// An absolute address can't be encoded at the current bitness
    #[error("address {0:#x} is not encodable in 32-bit code")]
    AddressOutOfRange(usize),
    /// The assembled code grew after it was measured
    #[error("generated code needs {needed} bytes, {capacity} are available")]
    BufferOverflow {
        /// Size of the assembled code
        needed: usize,
        /// Size of the allocated buffer
        capacity: usize,
    },
}

/// Errors while parsing a signature type string such as `"ii)i"`
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// Unknown type character
    #[error("unknown type character {character:?} at position {position}")]
    UnknownType {
        /// The offending character
        character: char,
        /// Byte offset of the character
        position: usize,
    },
    /// `void` used as an argument type
    #[error("void is not a valid argument type (position {0})")]
    VoidArgument(usize),
    /// Missing `)` separating arguments and return type
    #[error("missing ')' before the return type")]
    MissingSeparator,
    /// Anything other than exactly one return type after `)`
    #[error("expected exactly one return type after ')'")]
    InvalidReturn,
}

/// Errors while installing a hook
///
/// Installation is all-or-nothing: when any of these is returned the target function is unmodified.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Null target address
    #[error("cannot hook a null address")]
    NullTarget,
    /// The calling convention describes code for a different instruction set width
    #[error("{convention} describes {expected:?} code but the process is {host:?}")]
    BitnessMismatch {
        /// Name of the calling convention
        convention: &'static str,
        /// Bitness of the calling convention
        expected: Bitness,
        /// Bitness of the running process
        host: Bitness,
    },
    /// The target is already hooked with another calling convention
    #[error("target {0:#x} is already hooked with a different calling convention")]
    ConventionMismatch(usize),
    /// Executable memory couldn't be allocated near the target
    #[error(transparent)]
    Alloc(#[from] AllocError),
    /// The target's prologue couldn't be relocated
    #[error(transparent)]
    Relocation(#[from] RelocationError),
    /// Bridge code couldn't be generated
    #[error(transparent)]
    Generate(#[from] GenerateError),
    /// The redirect couldn't be written
    #[error(transparent)]
    Patch(#[from] PatchError),
}
