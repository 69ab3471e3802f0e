//! Thunk synthesis and the handle that owns a thunk until it runs.

use super::codebuf::CodeBuffer;
use super::memory::{ExecutableMemory, MemoryError};
use super::plan::{Imm, Plan, ThunkOp};
use super::trampoline;
use super::x86_64::X86_64Assembler;
use std::ptr::NonNull;

/// Concrete values for the symbolic immediates of a [`Plan`].
#[derive(Debug, Clone, Copy)]
pub struct Bindings<'a> {
    pub now_args: &'a [u64],
    pub target: u64,
    pub trampoline: u64,
    pub region_base: u64,
    pub region_size: u64,
    pub unmap: u64,
}

impl Bindings<'_> {
    pub fn resolve(&self, imm: Imm) -> u64 {
        match imm {
            Imm::NowArg(i) => self.now_args[i],
            Imm::Target => self.target,
            Imm::Trampoline => self.trampoline,
            Imm::RegionBase => self.region_base,
            Imm::RegionSize => self.region_size,
            Imm::Unmap => self.unmap,
        }
    }
}

/// Encode `plan` with its immediates resolved through `bindings`.
///
/// Panics if the code outgrows `plan.estimate()`: the region was sized from
/// it, so that would be a buffer overrun.
pub fn synthesize(plan: &Plan, bindings: &Bindings<'_>) -> CodeBuffer {
    assert_eq!(
        bindings.now_args.len(),
        plan.nargs_now(),
        "bindings do not match the plan"
    );
    let estimate = plan.estimate();
    let mut buf = CodeBuffer::with_capacity(estimate);
    let mut asm = X86_64Assembler::new(&mut buf);

    for op in plan.ops() {
        let start = asm.offset();
        emit_op(&mut asm, op, bindings);
        debug_assert!(
            asm.offset() - start <= op.max_len(),
            "`{op}` encoded longer than its cost entry"
        );
    }

    let written = asm.offset();
    assert!(
        written <= estimate,
        "thunk code ({written} bytes) overran its estimate ({estimate} bytes)"
    );
    tracing::trace!(written, estimate, "synthesized thunk");
    buf
}

fn emit_op(asm: &mut X86_64Assembler<'_>, op: &ThunkOp, bindings: &Bindings<'_>) {
    match *op {
        ThunkOp::LandingPad => asm.endbr64(),
        ThunkOp::EnterFrame { bytes } => asm.enter(bytes),
        ThunkOp::PadStack => asm.sub_rsp8(),
        ThunkOp::MoveReg { dst, src } => asm.mov_rr(dst, src),
        ThunkOp::StoreStack { slot, src } => asm.mov_store_rsp(slot, src),
        ThunkOp::LoadIncoming { dst, slot } => asm.mov_load_frame(dst, slot),
        ThunkOp::LoadImm { dst, imm } => asm.mov_ri(dst, bindings.resolve(imm)),
        ThunkOp::Call(reg) => asm.call_r(reg),
        ThunkOp::LeaveFrame => asm.leave(),
        ThunkOp::UnpadStack => asm.add_rsp8(),
        ThunkOp::Push(reg) => asm.push(reg),
        ThunkOp::Jump(reg) => asm.jmp_r(reg),
    }
}

/// Address of the unmap primitive each thunk tail-jumps into.
pub fn unmap_address() -> u64 {
    libc::munmap as *const () as usize as u64
}

/// Map, write and seal a thunk calling `target` with `now_args` prepended
/// to `nargs_later` incoming arguments.
pub(crate) fn build(
    target: *const (),
    nargs_later: usize,
    now_args: &[u64],
) -> Result<Curried, MemoryError> {
    let plan = Plan::new(now_args.len(), nargs_later);
    let estimate = plan.estimate();

    // Any early return below drops `memory`, which unmaps it.
    let mut memory = ExecutableMemory::new(estimate)?;
    let bindings = Bindings {
        now_args,
        target: target as u64,
        trampoline: trampoline::address(),
        region_base: memory.as_ptr() as u64,
        region_size: memory.size() as u64,
        unmap: unmap_address(),
    };
    let code = synthesize(&plan, &bindings);
    memory.write(0, code.code())?;
    memory.make_executable()?;

    tracing::debug!(
        nargs_now = plan.nargs_now(),
        nargs_later,
        code_len = code.len(),
        estimate,
        region = memory.size(),
        "curried thunk ready"
    );
    Ok(Curried::owned(memory, nargs_later))
}

/// A curried function awaiting its later-args.
///
/// A thunk frees its own code while it runs, so it can be called once.
/// [`call`](Self::call) therefore consumes the handle. A handle that is
/// dropped without being called unmaps its thunk. When nothing was
/// captured the handle just wraps the original target and owns nothing.
#[derive(Debug)]
pub struct Curried {
    entry: *const (),
    /// Mapped length, when the handle owns a thunk.
    region: Option<usize>,
    arity: usize,
}

// The thunk is plain code and immediates; any thread may run it once.
unsafe impl Send for Curried {}

impl Curried {
    fn owned(memory: ExecutableMemory, arity: usize) -> Self {
        let (ptr, size) = memory.into_raw();
        Self {
            entry: ptr.as_ptr() as *const (),
            region: Some(size),
            arity,
        }
    }

    pub(crate) fn identity(target: *const (), arity: usize) -> Self {
        Self {
            entry: target,
            region: None,
            arity,
        }
    }

    /// Number of later-args the function expects.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Whether this handle owns generated code (false for the identity case).
    pub fn is_thunk(&self) -> bool {
        self.region.is_some()
    }

    /// Entry address, without giving up ownership.
    pub fn as_ptr(&self) -> *const () {
        self.entry
    }

    /// Release the entry point as a raw function pointer.
    ///
    /// The thunk is then unmapped by its own first (and only permitted)
    /// invocation, or leaked if it is never invoked.
    pub fn into_raw(self) -> *const () {
        let entry = self.entry;
        std::mem::forget(self);
        entry
    }

    /// Invoke with exactly [`arity`](Self::arity) later-args and return the
    /// target's result.
    pub fn call(self, later: &[u64]) -> u64 {
        assert_eq!(
            later.len(),
            self.arity,
            "curried function takes {} later-args",
            self.arity
        );
        let entry = self.into_raw();
        // SAFETY: `curry` was promised a target taking exactly
        // nargs_now + arity words, and the thunk supplies the first
        // nargs_now of them.
        unsafe { invoke(entry, later) }
    }
}

impl Drop for Curried {
    fn drop(&mut self) {
        if let (Some(size), Some(ptr)) = (self.region, NonNull::new(self.entry as *mut u8)) {
            // SAFETY: the region came from `ExecutableMemory::into_raw` and
            // was never run, or `call`/`into_raw` would have forgotten us.
            drop(unsafe { ExecutableMemory::from_raw(ptr, size) });
        }
    }
}

macro_rules! word {
    ($i:tt) => {
        u64
    };
}

macro_rules! dispatch {
    ($entry:expr, $args:expr; $($n:literal => ($($i:tt)*)),* $(,)?) => {
        match $args.len() {
            $($n => {
                let f: extern "C" fn($(word!($i)),*) -> u64 =
                    unsafe { std::mem::transmute::<*const (), _>($entry) };
                f($($args[$i]),*)
            })*
            n => panic!("cannot call with {n} arguments"),
        }
    };
}

/// Call `entry` as `extern "C" fn(u64, ...) -> u64` with `args.len()` words.
///
/// # Safety
/// `entry` must be a function taking exactly `args.len()` 64-bit integer
/// arguments under the System V ABI and returning one.
pub unsafe fn invoke(entry: *const (), args: &[u64]) -> u64 {
    dispatch!(entry, args;
        0 => (),
        1 => (0),
        2 => (0 1),
        3 => (0 1 2),
        4 => (0 1 2 3),
        5 => (0 1 2 3 4),
        6 => (0 1 2 3 4 5),
        7 => (0 1 2 3 4 5 6),
        8 => (0 1 2 3 4 5 6 7),
        9 => (0 1 2 3 4 5 6 7 8),
        10 => (0 1 2 3 4 5 6 7 8 9),
        11 => (0 1 2 3 4 5 6 7 8 9 10),
        12 => (0 1 2 3 4 5 6 7 8 9 10 11),
        13 => (0 1 2 3 4 5 6 7 8 9 10 11 12),
        14 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13),
        15 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14),
        16 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15),
        17 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16),
        18 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17),
        19 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18),
        20 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19),
        21 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20),
        22 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21),
        23 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22),
        24 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23),
        25 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24),
        26 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25),
        27 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25 26),
        28 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25 26 27),
        29 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25 26 27 28),
        30 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25 26 27 28 29),
        31 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25 26 27 28 29 30),
        32 => (0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25 26 27 28 29 30 31),
    )
}
