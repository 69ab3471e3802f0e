//! C FFI for curry-jit
//!
//! This module provides the C-compatible API. All public functions use the
//! `extern "C"` ABI and report every failure as NULL.
//!
//! # Safety
//!
//! Functions passed to `curry_jit_curry` must take only `uint64_t`
//! arguments (exactly `nargs_now + nargs_later` of them) and return
//! `uint64_t`. The returned pointer may be called at most once.

use crate::curry::curry;
use crate::jit::MAX_ARGS;
use std::ffi::{c_char, c_void};
use std::ptr;

/// Version information
pub const CURRY_JIT_VERSION_MAJOR: u32 = 0;
pub const CURRY_JIT_VERSION_MINOR: u32 = 1;
pub const CURRY_JIT_VERSION_PATCH: u32 = 0;

/// Curry a function.
///
/// Reads `nargs_now` words from `args_now` (which may be NULL when
/// `nargs_now` is 0) and returns a function taking the remaining
/// `nargs_later` words. With no now-args, `fn_ptr` itself is returned.
///
/// Returns NULL if either count exceeds `curry_jit_max_args()`, or if the
/// code could not be mapped or made executable.
///
/// # Example (C)
/// ```c
/// uint64_t now[] = {1, 2};
/// uint64_t (*add3)(uint64_t) = curry_jit_curry(add, 2, 1, now);
/// if (add3 != NULL) {
///     printf("%lu\n", add3(3));
/// }
/// ```
#[unsafe(no_mangle)]
pub unsafe extern "C" fn curry_jit_curry(
    fn_ptr: *const c_void,
    nargs_now: usize,
    nargs_later: usize,
    args_now: *const u64,
) -> *const c_void {
    if nargs_now > MAX_ARGS {
        return ptr::null();
    }
    let now: &[u64] = if nargs_now == 0 {
        &[]
    } else if args_now.is_null() {
        return ptr::null();
    } else {
        unsafe { std::slice::from_raw_parts(args_now, nargs_now) }
    };

    match unsafe { curry(fn_ptr as *const (), nargs_later, now) } {
        Ok(curried) => curried.into_raw() as *const c_void,
        Err(e) => {
            tracing::debug!(nargs_now, nargs_later, error = %e, "curry_jit_curry failed");
            ptr::null()
        }
    }
}

/// Maximum number of now-args, and separately of later-args.
#[unsafe(no_mangle)]
pub extern "C" fn curry_jit_max_args() -> usize {
    MAX_ARGS
}

/// Get the version string
#[unsafe(no_mangle)]
pub extern "C" fn curry_jit_version() -> *const c_char {
    static VERSION: &[u8] = b"0.1.0\0";
    VERSION.as_ptr() as *const c_char
}

/// Get the major version number
#[unsafe(no_mangle)]
pub extern "C" fn curry_jit_version_major() -> u32 {
    CURRY_JIT_VERSION_MAJOR
}

/// Get the minor version number
#[unsafe(no_mangle)]
pub extern "C" fn curry_jit_version_minor() -> u32 {
    CURRY_JIT_VERSION_MINOR
}

/// Get the patch version number
#[unsafe(no_mangle)]
pub extern "C" fn curry_jit_version_patch() -> u32 {
    CURRY_JIT_VERSION_PATCH
}
