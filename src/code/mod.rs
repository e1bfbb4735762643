//! # Code
//!
//! Fixed machine code sequences written over the entry of a hooked function. Everything else is
//! generated with the assembler; these are the only encodings whose length has to be known before
//! anything is allocated.

use crate::data_type::Bitness;

pub mod x64;

/// Length of `jmp rel32`
pub const NEAR_JMP_LEN: usize = 5;

/// Length of `jmp [rip+0]` followed by the 64-bit target
pub const FAR_JMP_LEN: usize = 14;

/// Length of `push imm32; ret`
pub const PUSH_RET_LEN: usize = 6;

/// Single byte `nop`
pub const NOP: u8 = 0x90;

/// Displacement from the end of an instruction at `end` to `target`, if it fits in 32 bits
pub fn rel32(end: usize, target: usize) -> Option<i32> {
    i32::try_from(target.wrapping_sub(end) as isize).ok()
}

/// Generates `jmp rel32` located at `from` that lands on `target`
pub fn jmp_rel32(from: usize, target: usize) -> Option<[u8; NEAR_JMP_LEN]> {
    let displacement = rel32(from.wrapping_add(NEAR_JMP_LEN), target)?;
    let mut code = [0xe9, 0, 0, 0, 0];
    code[1..].copy_from_slice(&displacement.to_le_bytes());
    Some(code)
}

/// Generates `push imm32; ret`, an absolute jump in 32-bit code that leaves the flags alone
pub fn push_ret(target: u32) -> [u8; PUSH_RET_LEN] {
    let mut code = [0x68, 0, 0, 0, 0, 0xc3];
    code[1..5].copy_from_slice(&target.to_le_bytes());
    code
}

/// Generates the shortest jump at `from` that reaches `target`
///
/// Returns `None` when `target` is out of `rel32` range of 32-bit code, which can't happen for
/// addresses inside a 32-bit process.
pub fn redirect(from: usize, target: usize, bitness: Bitness) -> Option<Vec<u8>> {
    match jmp_rel32(from, target) {
        Some(near) => Some(near.to_vec()),
        None if bitness == Bitness::X64 => Some(x64::jmp_abs(target as u64).to_vec()),
        None => None,
    }
}

/// Length of the jump [`redirect`] generates for the same arguments
pub fn redirect_len(from: usize, target: usize) -> usize {
    if rel32(from.wrapping_add(NEAR_JMP_LEN), target).is_some() {
        NEAR_JMP_LEN
    } else {
        FAR_JMP_LEN
    }
}

/// Pads `code` with `nop`s up to `len` bytes
pub fn pad(mut code: Vec<u8>, len: usize) -> Vec<u8> {
    if code.len() < len {
        code.resize(len, NOP);
    }
    code
}
