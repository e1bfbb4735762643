//! # Trampoline
//!
//! Copies the instructions a redirect overwrites into executable memory, re-encoded for their new
//! address, followed by a jump back to the first instruction left intact. Calling the trampoline
//! behaves like calling the unhooked function.

use std::slice;

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock, OpKind,
};

use crate::alloc::{self, ExecutableMemory};
use crate::data_type::Bitness;
use crate::error::{GenerateError, InstallError, RelocationError};

/// Longest possible x86 instruction
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Bytes reserved per relocated instruction, enough for a branch rewritten to an absolute jump
const RELOCATED_INSTRUCTION_LEN: usize = 32;

/// Whole instructions covering the start of a function
#[derive(Debug)]
pub struct Window {
    /// Decoded instructions, at their original addresses
    pub instructions: Vec<Instruction>,
    /// Total length of the instructions
    pub len: usize,
}

/// Decodes whole instructions at `target` until at least `needed` bytes are covered
///
/// # Safety
///
/// `target` must be readable for `needed + MAX_INSTRUCTION_LEN - 1` bytes
pub unsafe fn decode_window(
    target: usize,
    needed: usize,
    bitness: Bitness,
) -> Result<Window, RelocationError> {
    let data = slice::from_raw_parts(target as *const u8, needed + MAX_INSTRUCTION_LEN - 1);
    let mut decoder = Decoder::with_ip(bitness.bits(), data, target as u64, DecoderOptions::NONE);

    let mut instructions = Vec::new();
    let mut len = 0;
    while len < needed {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(RelocationError::InvalidInstruction(instruction.ip() as usize));
        }
        len += instruction.len();
        instructions.push(instruction);

        if len < needed && leaves_function(&instruction) {
            return Err(RelocationError::TooShort {
                address: target,
                needed,
                available: len,
            });
        }
    }

    check_branches(&instructions, target, len)?;
    Ok(Window { instructions, len })
}

/// Whether execution can't fall through to the next instruction
fn leaves_function(instruction: &Instruction) -> bool {
    matches!(
        instruction.flow_control(),
        FlowControl::Return
            | FlowControl::UnconditionalBranch
            | FlowControl::IndirectBranch
            | FlowControl::Interrupt
            | FlowControl::Exception
    )
}

/// Rejects relative branches that land in the middle of an instruction inside the window
fn check_branches(
    instructions: &[Instruction],
    start: usize,
    len: usize,
) -> Result<(), RelocationError> {
    let window = start..start + len;
    for instruction in instructions {
        let relative = matches!(
            instruction.op0_kind(),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
        );
        if !relative {
            continue;
        }
        let destination = instruction.near_branch_target() as usize;
        let lands_on_boundary = instructions.iter().any(|i| i.ip() as usize == destination);
        if window.contains(&destination) && !lands_on_boundary {
            return Err(RelocationError::BranchIntoWindow {
                branch: instruction.ip() as usize,
                target: destination,
            });
        }
    }
    Ok(())
}

/// Re-encodes `window` at `address`, followed by a jump back to the rest of the function
fn relocate(window: &Window, address: usize, bitness: Bitness) -> Result<Vec<u8>, RelocationError> {
    let resume = window
        .instructions
        .first()
        .map_or(0, |first| first.ip())
        .wrapping_add(window.len as u64);
    let jmp = match bitness {
        Bitness::X86 => Code::Jmp_rel32_32,
        Bitness::X64 => Code::Jmp_rel32_64,
    };

    let mut instructions = window.instructions.clone();
    instructions.push(Instruction::with_branch(jmp, resume)?);

    let block = InstructionBlock::new(&instructions, address as u64);
    let encoded = BlockEncoder::encode(bitness.bits(), block, BlockEncoderOptions::NONE)?;
    Ok(encoded.code_buffer)
}

/// Relocated copy of the start of a function
#[derive(Debug)]
pub struct Trampoline {
    /// Memory holding the relocated code
    memory: ExecutableMemory,
    /// Address of the function the instructions were taken from
    target: usize,
    /// Number of original bytes that were relocated
    window_len: usize,
    /// Original bytes of the window
    original: Vec<u8>,
    /// Length of the relocated code
    code_len: usize,
}

impl Trampoline {
    /// Builds a trampoline for a function whose first `redirect_len` bytes will be overwritten
    ///
    /// # Safety
    ///
    /// `target` must point to the code of a function of the given bitness, readable for
    /// `redirect_len + MAX_INSTRUCTION_LEN - 1` bytes
    pub unsafe fn build(
        target: usize,
        redirect_len: usize,
        bitness: Bitness,
    ) -> Result<Self, InstallError> {
        let window = decode_window(target, redirect_len, bitness)?;
        let capacity = (window.instructions.len() + 1) * RELOCATED_INSTRUCTION_LEN;
        let mut memory = alloc::allocate_executable(target, capacity)?;

        if bitness == Bitness::X86 && u32::try_from(memory.address()).is_err() {
            return Err(GenerateError::AddressOutOfRange(memory.address()).into());
        }

        let code = relocate(&window, memory.address(), bitness)?;
        if !memory.write(&code) {
            return Err(RelocationError::Overflow {
                needed: code.len(),
                capacity,
            }
            .into());
        }

        tracing::trace!(
            function = format_args!("{target:#x}"),
            trampoline = format_args!("{:#x}", memory.address()),
            window = window.len,
            instructions = window.instructions.len(),
            relocated = code.len(),
            "built trampoline"
        );

        Ok(Self {
            memory,
            target,
            window_len: window.len,
            original: slice::from_raw_parts(target as *const u8, window.len).to_vec(),
            code_len: code.len(),
        })
    }

    /// Address of the relocated code, callable like the original function
    pub fn address(&self) -> usize {
        self.memory.address()
    }

    /// Address of the function the trampoline was built for
    pub fn target(&self) -> usize {
        self.target
    }

    /// Number of original bytes relocated, and so the number of bytes a redirect may overwrite
    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// Original bytes of the relocated window
    pub fn original_bytes(&self) -> &[u8] {
        &self.original
    }

    /// Relocated code, including the jump back
    pub fn code(&self) -> &[u8] {
        &self.memory[..self.code_len]
    }
}
