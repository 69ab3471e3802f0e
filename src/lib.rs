//! curry-jit - partial application of native functions
//!
//! This library curries `extern "C"` functions over 64-bit integer words by
//! generating a small x86-64 thunk per call. The thunk prepends the
//! captured arguments, calls the target, and unmaps itself on the way out.
//! For C embedding, use the FFI module functions.

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("curry-jit emits x86-64 System V code and only supports x86-64 Linux");

pub mod config;
mod curry;
pub mod ffi;
pub mod jit;

pub use curry::{CurryError, curry, vcurry};
pub use jit::{Curried, MAX_ARGS, MemoryError};

// Re-export FFI functions for C bindings
pub use ffi::*;
