//! Runtime code generation for curried thunks.
//!
//! This module provides everything a thunk is built from:
//! - x86-64 instruction encoding
//! - Argument placement and code size estimation
//! - Thunk synthesis and the single-use handle that owns it
//! - Executable memory allocation
//! - The return trampoline thunks exit through

pub mod codebuf;
pub mod memory;
pub mod plan;
pub mod thunk;
pub mod trampoline;
pub mod x86_64;

pub use memory::{ExecutableMemory, MemoryError};
pub use plan::{MAX_ARGS, Plan};
pub use thunk::Curried;
