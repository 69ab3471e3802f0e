//! Currying entry points.
//!
//! Both entry points validate argument counts before touching memory, then
//! either hand back the target itself (nothing to capture) or build a
//! thunk.

use crate::jit::{Curried, MAX_ARGS, MemoryError, thunk};

/// Error type for currying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurryError {
    /// More than [`MAX_ARGS`] now-args or later-args were requested.
    TooManyArgs { now: usize, later: usize },
    /// The argument cursor ran dry before `expected` now-args were read.
    MissingArgs { expected: usize, got: usize },
    /// The thunk region could not be mapped or made executable.
    Memory(MemoryError),
}

impl std::fmt::Display for CurryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CurryError::TooManyArgs { now, later } => write!(
                f,
                "too many arguments: {now} now, {later} later (limit {MAX_ARGS} each)"
            ),
            CurryError::MissingArgs { expected, got } => {
                write!(f, "expected {expected} now-args, got {got}")
            }
            CurryError::Memory(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CurryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CurryError::Memory(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MemoryError> for CurryError {
    fn from(e: MemoryError) -> Self {
        CurryError::Memory(e)
    }
}

fn check_counts(nargs_now: usize, nargs_later: usize) -> Result<(), CurryError> {
    if nargs_now > MAX_ARGS || nargs_later > MAX_ARGS {
        return Err(CurryError::TooManyArgs {
            now: nargs_now,
            later: nargs_later,
        });
    }
    Ok(())
}

/// Curry `target` with the words in `now_args`.
///
/// The result expects `nargs_later` more words and calls `target` with
/// `now_args` followed by them.
///
/// # Safety
/// `target` must be an `extern "C"` function taking exactly
/// `now_args.len() + nargs_later` `u64` arguments and returning `u64`
/// (another curried entry point qualifies).
pub unsafe fn curry(
    target: *const (),
    nargs_later: usize,
    now_args: &[u64],
) -> Result<Curried, CurryError> {
    let mut args = now_args.iter().copied();
    unsafe { vcurry(target, now_args.len(), nargs_later, &mut args) }
}

/// Curry `target` with `nargs_now` words drawn from `args`.
///
/// Exactly `nargs_now` items are consumed; the cursor stays usable by the
/// caller afterwards.
///
/// # Safety
/// Same contract as [`curry`], with `nargs_now` in place of
/// `now_args.len()`.
pub unsafe fn vcurry<I>(
    target: *const (),
    nargs_now: usize,
    nargs_later: usize,
    args: &mut I,
) -> Result<Curried, CurryError>
where
    I: Iterator<Item = u64>,
{
    check_counts(nargs_now, nargs_later)?;

    if nargs_now == 0 {
        return Ok(Curried::identity(target, nargs_later));
    }

    let mut now = [0u64; MAX_ARGS];
    for (got, slot) in now[..nargs_now].iter_mut().enumerate() {
        *slot = args.next().ok_or(CurryError::MissingArgs {
            expected: nargs_now,
            got,
        })?;
    }

    Ok(thunk::build(target, nargs_later, &now[..nargs_now])?)
}

/// Variadic-style sugar over [`curry`](fn@crate::curry).
///
/// ```ignore
/// let add3 = unsafe { curry!(add, later = 1; 1, 2) }?;
/// assert_eq!(add3.call(&[3]), 6);
/// ```
#[macro_export]
macro_rules! curry {
    ($target:expr, later = $later:expr $(; $($arg:expr),* $(,)?)?) => {
        $crate::curry($target as *const (), $later, &[$($($arg as u64),*)?])
    };
}
