//! x86-64 instruction encoding for thunk synthesis.
//!
//! This module provides the handful of x86-64 instructions a thunk is made
//! of, encoded as machine code bytes. Uses System V AMD64 ABI conventions.
//! Encoders never check the buffer against the region they will be copied
//! into; the plan's estimate sizes that region up front.

use super::codebuf::CodeBuffer;
use std::fmt;

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    // Caller-saved (scratch) registers
    Rax = 0,  // Return value
    Rcx = 1,  // 4th argument
    Rdx = 2,  // 3rd argument
    Rbx = 3,  // Callee-saved
    Rsp = 4,  // Stack pointer
    Rbp = 5,  // Frame pointer (callee-saved)
    Rsi = 6,  // 2nd argument
    Rdi = 7,  // 1st argument
    R8 = 8,   // 5th argument
    R9 = 9,   // 6th argument
    R10 = 10, // Caller-saved
    R11 = 11, // Caller-saved
    R12 = 12, // Callee-saved
    R13 = 13, // Callee-saved
    R14 = 14, // Callee-saved
    R15 = 15, // Callee-saved
}

impl Reg {
    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Check if this is one of R8-R15, which need a REX extension bit.
    pub fn is_extended(self) -> bool {
        (self as u8) >= 8
    }

    /// Get the REX.B bit for this register (when used as base/rm).
    pub fn rex_b(self) -> u8 {
        if self.is_extended() { 0x01 } else { 0x00 }
    }

    /// Get the REX.R bit for this register (when used as reg).
    pub fn rex_r(self) -> u8 {
        if self.is_extended() { 0x04 } else { 0x00 }
    }

    pub fn name(self) -> &'static str {
        match self {
            Reg::Rax => "rax",
            Reg::Rcx => "rcx",
            Reg::Rdx => "rdx",
            Reg::Rbx => "rbx",
            Reg::Rsp => "rsp",
            Reg::Rbp => "rbp",
            Reg::Rsi => "rsi",
            Reg::Rdi => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Byte lengths of every instruction form the assembler can produce.
///
/// The plan estimates thunk sizes from these numbers, so any new encoding
/// added below must be reflected here.
pub mod cost {
    pub const ENDBR64: usize = 4;
    pub const ENTER: usize = 4;
    pub const LEAVE: usize = 1;
    /// `sub rsp, 8` / `add rsp, 8`
    pub const RSP_PAD: usize = 4;
    pub const MOV_RR: usize = 3;
    pub const STORE_RSP_ZERO: usize = 4;
    pub const STORE_RSP_DISP8: usize = 5;
    pub const STORE_RSP_DISP32: usize = 8;
    pub const LOAD_FRAME_DISP8: usize = 4;
    pub const LOAD_FRAME_DISP32: usize = 7;
    pub const MOV_RI_U32: usize = 5;
    pub const MOV_RI_I32: usize = 7;
    pub const MOV_RI_I64: usize = 10;
    /// one more byte for R8-R15
    pub const PUSH: usize = 1;
    pub const PUSH_EXT: usize = 2;
    /// call/jmp through a register; one more byte for R8-R15
    pub const BRANCH_REG: usize = 2;
    pub const BRANCH_REG_EXT: usize = 3;
}

/// Encoding class chosen for an immediate load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmClass {
    /// `mov r32, imm32`, zero-extends into the full register
    U32,
    /// `mov r/m64, imm32`, sign-extends into the full register
    I32,
    /// `movabs r64, imm64`
    I64,
}

impl ImmClass {
    /// Pick the shortest encoding that delivers `imm` bit-exactly into `dst`.
    pub fn of(dst: Reg, imm: u64) -> Self {
        if !dst.is_extended() && fits_u32(imm) {
            ImmClass::U32
        } else if fits_i32(imm) {
            ImmClass::I32
        } else {
            ImmClass::I64
        }
    }

    pub fn len(self) -> usize {
        match self {
            ImmClass::U32 => cost::MOV_RI_U32,
            ImmClass::I32 => cost::MOV_RI_I32,
            ImmClass::I64 => cost::MOV_RI_I64,
        }
    }
}

fn fits_u32(x: u64) -> bool {
    x & 0xFFFF_FFFF_0000_0000 == 0
}

/// The top 33 bits are all zero or all one.
fn fits_i32(x: u64) -> bool {
    let top = x & 0xFFFF_FFFF_8000_0000;
    top == 0 || top == 0xFFFF_FFFF_8000_0000
}

/// x86-64 assembler.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// Number of bytes emitted so far.
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    // ==================== REX prefix helpers ====================

    /// Emit REX.W prefix for 64-bit operations.
    fn emit_rex_w(&mut self, reg: Reg, rm: Reg) {
        let rex = 0x48 | reg.rex_r() | rm.rex_b();
        self.buf.emit_u8(rex);
    }

    /// Emit REX.W prefix for single register operations.
    fn emit_rex_w_single(&mut self, rm: Reg) {
        let rex = 0x48 | rm.rex_b();
        self.buf.emit_u8(rex);
    }

    /// Emit a bare REX.B prefix when an extended register is the operand.
    fn emit_rex_b_if_needed(&mut self, rm: Reg) {
        if rm.is_extended() {
            self.buf.emit_u8(0x41);
        }
    }

    // ==================== ModR/M helpers ====================

    /// Encode ModR/M byte.
    /// mod: 2 bits, reg: 3 bits, rm: 3 bits
    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    // ==================== Control-flow integrity ====================

    /// ENDBR64 (indirect branch landing pad)
    pub fn endbr64(&mut self) {
        self.buf.emit_bytes(&[0xF3, 0x0F, 0x1E, 0xFA]);
    }

    // ==================== Stack frame ====================

    /// ENTER imm16, 0 (push rbp; mov rbp, rsp; sub rsp, imm16)
    pub fn enter(&mut self, bytes: u16) {
        self.buf.emit_u8(0xC8);
        self.buf.emit_u16(bytes);
        self.buf.emit_u8(0x00); // nesting level
    }

    /// LEAVE (mov rsp, rbp; pop rbp)
    pub fn leave(&mut self) {
        self.buf.emit_u8(0xC9);
    }

    /// SUB RSP, 8
    pub fn sub_rsp8(&mut self) {
        self.emit_rex_w_single(Reg::Rsp);
        self.buf.emit_u8(0x83); // SUB r/m64, imm8
        self.buf.emit_u8(Self::modrm(0b11, 5, Reg::Rsp.code()));
        self.buf.emit_u8(0x08);
    }

    /// ADD RSP, 8
    pub fn add_rsp8(&mut self) {
        self.emit_rex_w_single(Reg::Rsp);
        self.buf.emit_u8(0x83); // ADD r/m64, imm8
        self.buf.emit_u8(Self::modrm(0b11, 0, Reg::Rsp.code()));
        self.buf.emit_u8(0x08);
    }

    // ==================== Data Movement ====================

    /// MOV r64, r64 (register to register)
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x89); // MOV r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV [RSP + 8*slot], r64 (store into an outgoing stack argument)
    pub fn mov_store_rsp(&mut self, slot: usize, src: Reg) {
        let disp = 8 * slot;
        self.emit_rex_w(src, Reg::Rsp);
        self.buf.emit_u8(0x89); // MOV r/m64, r64

        // RSP as base always needs a SIB byte
        if disp == 0 {
            self.buf.emit_u8(Self::modrm(0b00, src.code(), 0b100));
            self.buf.emit_u8(0x24); // SIB: scale=0, index=none, base=RSP
        } else if disp < 0x80 {
            self.buf.emit_u8(Self::modrm(0b01, src.code(), 0b100));
            self.buf.emit_u8(0x24);
            self.buf.emit_u8(disp as u8);
        } else {
            self.buf.emit_u8(Self::modrm(0b10, src.code(), 0b100));
            self.buf.emit_u8(0x24);
            self.buf.emit_u32(disp as u32);
        }
    }

    /// MOV r64, [RBP + 16 + 8*slot] (load an incoming stack argument)
    ///
    /// The 16 skips the saved frame pointer and the return address, so the
    /// displacement is never zero.
    pub fn mov_load_frame(&mut self, dst: Reg, slot: usize) {
        let disp = 16 + 8 * slot;
        self.emit_rex_w(dst, Reg::Rbp);
        self.buf.emit_u8(0x8B); // MOV r64, r/m64

        if disp < 0x80 {
            self.buf.emit_u8(Self::modrm(0b01, dst.code(), Reg::Rbp.code()));
            self.buf.emit_u8(disp as u8);
        } else {
            self.buf.emit_u8(Self::modrm(0b10, dst.code(), Reg::Rbp.code()));
            self.buf.emit_u32(disp as u32);
        }
    }

    /// MOV r64, imm using the shortest exact encoding (see [`ImmClass`]).
    pub fn mov_ri(&mut self, dst: Reg, imm: u64) {
        match ImmClass::of(dst, imm) {
            ImmClass::U32 => {
                self.buf.emit_u8(0xB8 + dst.code()); // MOV r32, imm32
                self.buf.emit_u32(imm as u32);
            }
            ImmClass::I32 => {
                self.emit_rex_w_single(dst);
                self.buf.emit_u8(0xC7); // MOV r/m64, imm32
                self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
                self.buf.emit_u32(imm as u32);
            }
            ImmClass::I64 => {
                self.emit_rex_w_single(dst);
                self.buf.emit_u8(0xB8 + dst.code()); // MOV r64, imm64
                self.buf.emit_u64(imm);
            }
        }
    }

    // ==================== Stack Operations ====================

    /// PUSH r64
    pub fn push(&mut self, reg: Reg) {
        self.emit_rex_b_if_needed(reg);
        self.buf.emit_u8(0x50 + reg.code());
    }

    // ==================== Control Flow ====================

    /// CALL r64 (indirect call through register)
    pub fn call_r(&mut self, reg: Reg) {
        self.emit_rex_b_if_needed(reg);
        self.buf.emit_u8(0xFF); // CALL r/m64
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// JMP r64 (indirect jump through register)
    pub fn jmp_r(&mut self, reg: Reg) {
        self.emit_rex_b_if_needed(reg);
        self.buf.emit_u8(0xFF); // JMP r/m64
        self.buf.emit_u8(Self::modrm(0b11, 4, reg.code()));
    }
}
