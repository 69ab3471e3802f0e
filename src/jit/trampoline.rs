//! Return trampoline shared by every thunk.
//!
//! A thunk cannot return through itself: its last act is to jump into
//! `munmap` on its own region. Before that jump it pushes the callee's
//! result and then this trampoline's address, so `munmap` "returns" here.
//! The trampoline pops the saved result into RAX and returns to the
//! thunk's original caller, whose return address is next on the stack.
//!
//! It lives in the binary's text section, so it is never mapped by the
//! memory manager and never freed.

use std::arch::global_asm;

global_asm!(
    ".pushsection .text.curry_jit_return_trampoline,\"ax\",@progbits",
    ".p2align 4",
    ".globl curry_jit_return_trampoline",
    ".hidden curry_jit_return_trampoline",
    ".type curry_jit_return_trampoline,@function",
    "curry_jit_return_trampoline:",
    "    pop rax",
    "    ret",
    ".size curry_jit_return_trampoline, . - curry_jit_return_trampoline",
    ".popsection",
);

unsafe extern "C" {
    // Not callable as a function: it expects a saved result on the stack.
    fn curry_jit_return_trampoline();
}

/// Address baked into each thunk's epilogue.
pub fn address() -> u64 {
    curry_jit_return_trampoline as *const () as usize as u64
}
