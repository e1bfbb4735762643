//! # Emitter
//!
//! Building blocks of the bridge code: register context save and restore, and calls into Rust
//! helpers. The accumulator (`eax`/`rax`) holds the context base while saving and restoring, and
//! the counter (`ecx`/`rcx`) is scratch for registers that can't be stored directly.

use iced_x86::code_asm::registers::{
    al, eax, ebp, ecx, edx, esi, esp, rax, rbp, rcx, rdi, rdx, rsi, rsp,
};
use iced_x86::code_asm::{
    byte_ptr, dword_ptr, qword_ptr, tword_ptr, word_ptr, xmmword_ptr, AsmMemoryOperand,
    CodeAssembler, CodeLabel,
};

use crate::code;
use crate::data_type::Bitness;
use crate::error::GenerateError;
use crate::register::{AsmRegister, Family, Register, RegisterContext};

/// Second argument passed to a helper
#[derive(Debug, Clone, Copy)]
pub(crate) enum Argument {
    /// The stack pointer at the time of the call
    StackPointer,
    /// A constant
    Value(u32),
}

/// Assembler wrapper that knows the bitness it emits for
pub(crate) struct Emitter {
    /// Underlying assembler
    asm: CodeAssembler,
    /// Width of the emitted code
    bitness: Bitness,
    /// Bytes of `st0` to spill, picked from the return type
    st0_width: usize,
}

impl Emitter {
    /// Creates an emitter for code of the given bitness
    pub(crate) fn new(bitness: Bitness, st0_width: usize) -> Result<Self, GenerateError> {
        Ok(Self {
            asm: CodeAssembler::new(bitness.bits())?,
            bitness,
            st0_width,
        })
    }

    /// Size of a stack slot
    fn word(&self) -> i32 {
        self.bitness.word_size() as i32
    }

    /// Memory at `offset` bytes past the accumulator
    fn cell(&self, offset: usize) -> AsmMemoryOperand {
        match self.bitness {
            Bitness::X86 => eax + offset as i32,
            Bitness::X64 => rax + offset as i32,
        }
    }

    /// Memory at `offset` bytes past the stack pointer
    fn stack(&self, offset: i32) -> AsmMemoryOperand {
        match self.bitness {
            Bitness::X86 => esp + offset,
            Bitness::X64 => rsp + offset,
        }
    }

    /// Converts an address to a 32-bit immediate
    fn imm32(value: usize) -> Result<u32, GenerateError> {
        u32::try_from(value).map_err(|_| GenerateError::AddressOutOfRange(value))
    }

    /// `mov acc, value`, always with a full-width immediate
    pub(crate) fn load_accumulator(&mut self, value: usize) -> Result<(), GenerateError> {
        match self.bitness {
            Bitness::X86 => self.asm.mov(eax, Self::imm32(value)?)?,
            Bitness::X64 => self.asm.mov(rax, value as u64)?,
        }
        Ok(())
    }

    /// `mov [sp], acc`
    pub(crate) fn store_accumulator_at_stack(&mut self) -> Result<(), GenerateError> {
        let top = self.stack(0);
        match self.bitness {
            Bitness::X86 => self.asm.mov(dword_ptr(top), eax)?,
            Bitness::X64 => self.asm.mov(qword_ptr(top), rax)?,
        }
        Ok(())
    }

    /// `sub sp, bytes`
    pub(crate) fn reserve_stack(&mut self, bytes: usize) -> Result<(), GenerateError> {
        let bytes = bytes as i32;
        match self.bitness {
            Bitness::X86 => self.asm.sub(esp, bytes)?,
            Bitness::X64 => self.asm.sub(rsp, bytes)?,
        }
        Ok(())
    }

    /// `test al, al`
    pub(crate) fn test_result(&mut self) -> Result<(), GenerateError> {
        self.asm.test(al, al)?;
        Ok(())
    }

    /// Creates a label to be bound later
    pub(crate) fn label(&mut self) -> CodeLabel {
        self.asm.create_label()
    }

    /// Binds `label` to the next instruction or data
    pub(crate) fn bind(&mut self, label: &mut CodeLabel) -> Result<(), GenerateError> {
        self.asm.set_label(label)?;
        Ok(())
    }

    /// `jne label`
    pub(crate) fn jump_if_set(&mut self, label: CodeLabel) -> Result<(), GenerateError> {
        self.asm.jne(label)?;
        Ok(())
    }

    /// Jumps to an absolute address without touching any register or the flags
    pub(crate) fn jump_absolute(&mut self, target: usize) -> Result<(), GenerateError> {
        match self.bitness {
            Bitness::X86 => self.asm.db(&code::push_ret(Self::imm32(target)?))?,
            Bitness::X64 => self.asm.db(&code::x64::jmp_abs(target as u64))?,
        }
        Ok(())
    }

    /// `ret` or `ret pop`
    pub(crate) fn ret(&mut self, pop: usize) -> Result<(), GenerateError> {
        if pop > 0 {
            self.asm.ret_1(pop as i32)?;
        } else {
            self.asm.ret()?;
        }
        Ok(())
    }

    /// Calls `extern "C" fn(hook, argument)` following the host ABI, with the stack realigned
    ///
    /// Clobbers every caller-saved register.
    pub(crate) fn call_helper(
        &mut self,
        function: usize,
        hook: usize,
        argument: Argument,
    ) -> Result<(), GenerateError> {
        match self.bitness {
            Bitness::X86 => {
                match argument {
                    Argument::StackPointer => self.asm.mov(ecx, esp)?,
                    Argument::Value(value) => self.asm.mov(ecx, value)?,
                }
                self.asm.push(ebp)?;
                self.asm.mov(ebp, esp)?;
                self.asm.and(esp, -16)?;
                // two pushed arguments complete the 16 bytes
                self.asm.sub(esp, 8)?;
                self.asm.push(ecx)?;
                self.asm.mov(eax, Self::imm32(hook)?)?;
                self.asm.push(eax)?;
                self.asm.mov(eax, Self::imm32(function)?)?;
                self.asm.call(eax)?;
                self.asm.mov(esp, ebp)?;
                self.asm.pop(ebp)?;
            }
            Bitness::X64 => {
                let (first, second, second_low) = if cfg!(windows) {
                    (rcx, rdx, edx)
                } else {
                    (rdi, rsi, esi)
                };
                self.asm.mov(first, hook as u64)?;
                match argument {
                    Argument::StackPointer => self.asm.mov(second, rsp)?,
                    Argument::Value(value) => self.asm.mov(second_low, value)?,
                }
                self.asm.push(rbp)?;
                self.asm.mov(rbp, rsp)?;
                self.asm.and(rsp, -16)?;
                if cfg!(windows) {
                    // home space for the four register arguments
                    self.asm.sub(rsp, 32)?;
                }
                self.asm.mov(rax, function as u64)?;
                self.asm.call(rax)?;
                self.asm.mov(rsp, rbp)?;
                self.asm.pop(rbp)?;
            }
        }
        Ok(())
    }

    /// Stores `source` into the cell at `offset` past the accumulator
    fn store(&mut self, source: Register, offset: usize) -> Result<(), GenerateError> {
        let cell = self.cell(offset);
        match source.operand() {
            AsmRegister::Gpr8(r) => self.asm.mov(byte_ptr(cell), r)?,
            AsmRegister::Gpr16(r) => self.asm.mov(word_ptr(cell), r)?,
            AsmRegister::Gpr32(r) => self.asm.mov(dword_ptr(cell), r)?,
            AsmRegister::Gpr64(r) => self.asm.mov(qword_ptr(cell), r)?,
            AsmRegister::Mm(r) => self.asm.movq(qword_ptr(cell), r)?,
            AsmRegister::Xmm(r) => self.asm.movups(xmmword_ptr(cell), r)?,
            AsmRegister::Segment(r) => self.asm.mov(word_ptr(cell), r)?,
            AsmRegister::St(_) => match self.st0_width {
                4 => self.asm.fstp(dword_ptr(cell))?,
                8 => self.asm.fstp(qword_ptr(cell))?,
                _ => self.asm.fstp(tword_ptr(cell))?,
            },
        }
        Ok(())
    }

    /// Loads `target` from the cell at `offset` past the accumulator
    ///
    /// Only emits `mov`, `movq`, `movups` and `fld`, none of which touch the flags.
    fn load(&mut self, target: Register, offset: usize) -> Result<(), GenerateError> {
        let cell = self.cell(offset);
        match target.operand() {
            AsmRegister::Gpr8(r) => self.asm.mov(r, byte_ptr(cell))?,
            AsmRegister::Gpr16(r) => self.asm.mov(r, word_ptr(cell))?,
            AsmRegister::Gpr32(r) => self.asm.mov(r, dword_ptr(cell))?,
            AsmRegister::Gpr64(r) => self.asm.mov(r, qword_ptr(cell))?,
            AsmRegister::Mm(r) => self.asm.movq(r, qword_ptr(cell))?,
            AsmRegister::Xmm(r) => self.asm.movups(r, xmmword_ptr(cell))?,
            AsmRegister::Segment(_) => {}
            AsmRegister::St(_) => match self.st0_width {
                4 => self.asm.fld(dword_ptr(cell))?,
                8 => self.asm.fld(qword_ptr(cell))?,
                _ => self.asm.fld(tword_ptr(cell))?,
            },
        }
        Ok(())
    }

    /// Whether `register` can be saved at all, logging why not
    fn supported(&self, register: Register, with_st0: bool) -> bool {
        if !register.is_available(self.bitness) {
            tracing::warn!(?register, bitness = ?self.bitness, "register unavailable, skipped");
            return false;
        }
        match register {
            Register::ST0 => with_st0,
            Register::ST1
            | Register::ST2
            | Register::ST3
            | Register::ST4
            | Register::ST5
            | Register::ST6
            | Register::ST7 => {
                tracing::warn!(?register, "only st0 can be preserved, skipped");
                false
            }
            _ => true,
        }
    }

    /// Saves `registers` into the context at `base`, leaving every register unchanged
    ///
    /// `st0` is only spilled when `with_st0` is set, since it is popped off the x87 stack.
    pub(crate) fn save(
        &mut self,
        base: usize,
        registers: &[Register],
        with_st0: bool,
    ) -> Result<(), GenerateError> {
        let word = self.word();
        match self.bitness {
            Bitness::X86 => {
                self.asm.push(eax)?;
                self.asm.push(ecx)?;
            }
            Bitness::X64 => {
                self.asm.push(rax)?;
                self.asm.push(rcx)?;
            }
        }
        self.load_accumulator(base)?;

        for &register in registers {
            if !self.supported(register, with_st0) {
                continue;
            }
            let offset = RegisterContext::offset_of(register);
            match (register.family(), register.counter_alias()) {
                // the live values sit on the stack or have moved, go through the counter
                (Family::StackPointer, Some(alias)) => {
                    let entry = self.stack(2 * word);
                    match self.bitness {
                        Bitness::X86 => self.asm.lea(ecx, entry)?,
                        Bitness::X64 => self.asm.lea(rcx, entry)?,
                    }
                    self.store(alias, offset)?;
                }
                (Family::Accumulator, Some(alias)) => {
                    let saved = self.stack(word);
                    match self.bitness {
                        Bitness::X86 => self.asm.mov(ecx, dword_ptr(saved))?,
                        Bitness::X64 => self.asm.mov(rcx, qword_ptr(saved))?,
                    }
                    self.store(alias, offset)?;
                }
                (Family::Counter, _) => {
                    let saved = self.stack(0);
                    match self.bitness {
                        Bitness::X86 => self.asm.mov(ecx, dword_ptr(saved))?,
                        Bitness::X64 => self.asm.mov(rcx, qword_ptr(saved))?,
                    }
                    self.store(register, offset)?;
                }
                _ => self.store(register, offset)?,
            }
        }

        match self.bitness {
            Bitness::X86 => {
                self.asm.pop(ecx)?;
                self.asm.pop(eax)?;
            }
            Bitness::X64 => {
                self.asm.pop(rcx)?;
                self.asm.pop(rax)?;
            }
        }
        Ok(())
    }

    /// Loads `registers` back from the context at `base`
    ///
    /// Segment registers and the partial accumulator registers are only saved.
    /// The stack pointer and then the accumulator are loaded last, since the accumulator holds the
    /// context base until the very end.
    pub(crate) fn restore(
        &mut self,
        base: usize,
        registers: &[Register],
        with_st0: bool,
    ) -> Result<(), GenerateError> {
        self.load_accumulator(base)?;

        let stack_pointer = Register::stack_pointer(self.bitness);
        let accumulator = Register::accumulator(self.bitness);
        let mut restore_stack_pointer = false;
        let mut restore_accumulator = false;

        for &register in registers {
            if !register.is_available(self.bitness) {
                continue;
            }
            match register {
                _ if register == accumulator => restore_accumulator = true,
                _ if register == stack_pointer => restore_stack_pointer = true,
                _ if register.family() == Family::Accumulator => tracing::warn!(
                    ?register,
                    "partial accumulator registers are saved but not restored"
                ),
                Register::ST0 if !with_st0 => {}
                Register::ST1
                | Register::ST2
                | Register::ST3
                | Register::ST4
                | Register::ST5
                | Register::ST6
                | Register::ST7 => {}
                _ if register.family() == Family::StackPointer => tracing::warn!(
                    ?register,
                    "only the full stack pointer is restored"
                ),
                _ => self.load(register, RegisterContext::offset_of(register))?,
            }
        }

        if restore_stack_pointer {
            self.load(stack_pointer, RegisterContext::offset_of(stack_pointer))?;
        }
        if restore_accumulator {
            self.load(accumulator, RegisterContext::offset_of(accumulator))?;
        }
        Ok(())
    }

    /// Pushes the `st0` cell of the context at `base` onto the x87 stack
    ///
    /// Every other register keeps its value.
    pub(crate) fn reload_st0(&mut self, base: usize) -> Result<(), GenerateError> {
        match self.bitness {
            Bitness::X86 => self.asm.push(eax)?,
            Bitness::X64 => self.asm.push(rax)?,
        }
        self.load_accumulator(base)?;
        self.load(Register::ST0, RegisterContext::offset_of(Register::ST0))?;
        match self.bitness {
            Bitness::X86 => self.asm.pop(eax)?,
            Bitness::X64 => self.asm.pop(rax)?,
        }
        Ok(())
    }

    /// Assembles everything emitted so far for execution at `ip`
    pub(crate) fn assemble(mut self, ip: usize) -> Result<Vec<u8>, GenerateError> {
        Ok(self.asm.assemble(ip as u64)?)
    }
}
