//! Argument placement and the instruction plan of a thunk.
//!
//! A thunk for `(nargs_now, nargs_later)` is fully determined by those two
//! counts up to the values of a few immediates (the captured arguments, the
//! target, the region it lives in). [`Plan::new`] lays out the instruction
//! sequence with those immediates left symbolic; the synthesizer resolves
//! and encodes it. Sizing the region walks the same op list through the
//! assembler's cost table, so the estimate cannot drift from what is
//! actually emitted.

use super::x86_64::{Reg, cost};
use std::fmt;

/// Maximum number of now-args and of later-args accepted per thunk.
pub const MAX_ARGS: usize = 32;

/// Integer argument registers, in System V order.
pub const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Scratch register: never an argument, holds the result after the call.
pub const SCRATCH: Reg = Reg::Rax;

/// Where the argument at a given index lives at a call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Reg(Reg),
    /// Index of the 8-byte stack word, counted from the stack pointer.
    Stack(usize),
}

impl Slot {
    pub fn for_index(index: usize) -> Self {
        match ARG_REGS.get(index) {
            Some(&reg) => Slot::Reg(reg),
            None => Slot::Stack(index - ARG_REGS.len()),
        }
    }
}

/// An immediate whose value is only known when the thunk is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Imm {
    /// The i-th captured now-arg.
    NowArg(usize),
    /// The function being curried.
    Target,
    /// The shared return trampoline.
    Trampoline,
    /// Base address of the thunk's own mapping.
    RegionBase,
    /// Length of the thunk's own mapping.
    RegionSize,
    /// Address of `munmap`.
    Unmap,
}

impl fmt::Display for Imm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Imm::NowArg(i) => write!(f, "now[{i}]"),
            Imm::Target => f.write_str("target"),
            Imm::Trampoline => f.write_str("trampoline"),
            Imm::RegionBase => f.write_str("region.base"),
            Imm::RegionSize => f.write_str("region.size"),
            Imm::Unmap => f.write_str("munmap"),
        }
    }
}

/// One planned instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThunkOp {
    /// `endbr64`
    LandingPad,
    /// `enter bytes, 0`: frame base in RBP, outgoing stack args below RSP.
    EnterFrame { bytes: u16 },
    /// `sub rsp, 8`: realigns the stack when no frame is needed.
    PadStack,
    MoveReg { dst: Reg, src: Reg },
    /// `mov [rsp + 8*slot], src`
    StoreStack { slot: usize, src: Reg },
    /// `mov dst, [rbp + 16 + 8*slot]`: reads an incoming stack argument.
    LoadIncoming { dst: Reg, slot: usize },
    LoadImm { dst: Reg, imm: Imm },
    Call(Reg),
    LeaveFrame,
    UnpadStack,
    Push(Reg),
    Jump(Reg),
}

impl ThunkOp {
    /// Upper bound on the encoded length of this op.
    pub fn max_len(&self) -> usize {
        match self {
            ThunkOp::LandingPad => cost::ENDBR64,
            ThunkOp::EnterFrame { .. } => cost::ENTER,
            ThunkOp::PadStack | ThunkOp::UnpadStack => cost::RSP_PAD,
            ThunkOp::MoveReg { .. } => cost::MOV_RR,
            ThunkOp::StoreStack { .. } => cost::STORE_RSP_DISP32,
            ThunkOp::LoadIncoming { .. } => cost::LOAD_FRAME_DISP32,
            ThunkOp::LoadImm { .. } => cost::MOV_RI_I64,
            ThunkOp::Call(reg) | ThunkOp::Jump(reg) => {
                if reg.is_extended() {
                    cost::BRANCH_REG_EXT
                } else {
                    cost::BRANCH_REG
                }
            }
            ThunkOp::LeaveFrame => cost::LEAVE,
            ThunkOp::Push(reg) => {
                if reg.is_extended() {
                    cost::PUSH_EXT
                } else {
                    cost::PUSH
                }
            }
        }
    }
}

impl fmt::Display for ThunkOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThunkOp::LandingPad => f.write_str("endbr64"),
            ThunkOp::EnterFrame { bytes } => write!(f, "enter {bytes:#x}, 0"),
            ThunkOp::PadStack => f.write_str("sub rsp, 8"),
            ThunkOp::MoveReg { dst, src } => write!(f, "mov {dst}, {src}"),
            ThunkOp::StoreStack { slot: 0, src } => write!(f, "mov [rsp], {src}"),
            ThunkOp::StoreStack { slot, src } => write!(f, "mov [rsp + {:#x}], {src}", 8 * slot),
            ThunkOp::LoadIncoming { dst, slot } => {
                write!(f, "mov {dst}, [rbp + {:#x}]", 16 + 8 * slot)
            }
            ThunkOp::LoadImm { dst, imm } => write!(f, "mov {dst}, {imm}"),
            ThunkOp::Call(reg) => write!(f, "call {reg}"),
            ThunkOp::LeaveFrame => f.write_str("leave"),
            ThunkOp::UnpadStack => f.write_str("add rsp, 8"),
            ThunkOp::Push(reg) => write!(f, "push {reg}"),
            ThunkOp::Jump(reg) => write!(f, "jmp {reg}"),
        }
    }
}

/// How the thunk keeps the stack 16-byte aligned at its call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
    /// At most six arguments: an 8-byte pad, no frame base.
    Aligned,
    /// Overflow arguments: an RBP frame with `slots` outgoing stack words
    /// (an even count, `bytes == 8 * slots`).
    Overflow { slots: usize, bytes: u16 },
}

/// The complete instruction sequence of one thunk.
#[derive(Debug, Clone)]
pub struct Plan {
    nargs_now: usize,
    nargs_later: usize,
    frame: FrameLayout,
    ops: Vec<ThunkOp>,
}

impl Plan {
    /// Lay out a thunk that prepends `nargs_now` captured words to
    /// `nargs_later` incoming ones.
    ///
    /// Both counts must be at most [`MAX_ARGS`]; callers validate this.
    pub fn new(nargs_now: usize, nargs_later: usize) -> Self {
        assert!(
            nargs_now <= MAX_ARGS && nargs_later <= MAX_ARGS,
            "argument counts ({nargs_now}, {nargs_later}) exceed {MAX_ARGS}"
        );
        let nargs_total = nargs_now + nargs_later;
        let nregs = ARG_REGS.len();
        let mut ops = Vec::with_capacity(16 + 2 * nargs_total);

        ops.push(ThunkOp::LandingPad);

        // Entry leaves RSP at 8 mod 16. ENTER pushes RBP and reserves an
        // even number of slots; the pad alone does the same job otherwise.
        let frame = if nargs_total > nregs {
            let overflow = nargs_total - nregs;
            let slots = overflow + overflow % 2;
            FrameLayout::Overflow {
                slots,
                bytes: (8 * slots) as u16,
            }
        } else {
            FrameLayout::Aligned
        };
        ops.push(match frame {
            FrameLayout::Overflow { bytes, .. } => ThunkOp::EnterFrame { bytes },
            FrameLayout::Aligned => ThunkOp::PadStack,
        });

        // Later-args in registers shift up by nargs_now. Highest first, so a
        // source is always read before anything lands on it.
        for isrc in (0..nargs_later.min(nregs)).rev() {
            let src = ARG_REGS[isrc];
            ops.push(match Slot::for_index(nargs_now + isrc) {
                Slot::Reg(dst) => ThunkOp::MoveReg { dst, src },
                Slot::Stack(slot) => ThunkOp::StoreStack { slot, src },
            });
        }

        // Later-args already on the caller's stack move to their new slots.
        for isrc in nregs..nargs_later {
            ops.push(ThunkOp::LoadIncoming {
                dst: SCRATCH,
                slot: isrc - nregs,
            });
            ops.push(ThunkOp::StoreStack {
                slot: nargs_now + isrc - nregs,
                src: SCRATCH,
            });
        }

        for idst in 0..nargs_now {
            let imm = Imm::NowArg(idst);
            match Slot::for_index(idst) {
                Slot::Reg(dst) => ops.push(ThunkOp::LoadImm { dst, imm }),
                Slot::Stack(slot) => {
                    ops.push(ThunkOp::LoadImm { dst: SCRATCH, imm });
                    ops.push(ThunkOp::StoreStack { slot, src: SCRATCH });
                }
            }
        }

        ops.push(ThunkOp::LoadImm {
            dst: SCRATCH,
            imm: Imm::Target,
        });
        ops.push(ThunkOp::Call(SCRATCH));

        ops.push(match frame {
            FrameLayout::Overflow { .. } => ThunkOp::LeaveFrame,
            FrameLayout::Aligned => ThunkOp::UnpadStack,
        });

        // Tail-jump into munmap(region.base, region.size). It returns to the
        // trampoline, which pops the saved result and returns to our caller.
        ops.push(ThunkOp::Push(SCRATCH));
        ops.push(ThunkOp::LoadImm {
            dst: SCRATCH,
            imm: Imm::Trampoline,
        });
        ops.push(ThunkOp::Push(SCRATCH));
        ops.push(ThunkOp::LoadImm {
            dst: ARG_REGS[0],
            imm: Imm::RegionBase,
        });
        ops.push(ThunkOp::LoadImm {
            dst: ARG_REGS[1],
            imm: Imm::RegionSize,
        });
        ops.push(ThunkOp::LoadImm {
            dst: SCRATCH,
            imm: Imm::Unmap,
        });
        ops.push(ThunkOp::Jump(SCRATCH));

        Self {
            nargs_now,
            nargs_later,
            frame,
            ops,
        }
    }

    pub fn nargs_now(&self) -> usize {
        self.nargs_now
    }

    pub fn nargs_later(&self) -> usize {
        self.nargs_later
    }

    /// Number of arguments the target receives.
    pub fn nargs_total(&self) -> usize {
        self.nargs_now + self.nargs_later
    }

    pub fn frame(&self) -> FrameLayout {
        self.frame
    }

    pub fn ops(&self) -> &[ThunkOp] {
        &self.ops
    }

    /// Upper bound, in bytes, on the code this plan emits.
    pub fn estimate(&self) -> usize {
        self.ops.iter().map(ThunkOp::max_len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relocations(plan: &Plan) -> Vec<ThunkOp> {
        plan.ops()
            .iter()
            .copied()
            .filter(|op| {
                matches!(op, ThunkOp::MoveReg { .. })
                    || matches!(op, ThunkOp::StoreStack { src, .. } if ARG_REGS.contains(src))
            })
            .collect()
    }

    #[test]
    fn test_slot_for_index() {
        assert_eq!(Slot::for_index(0), Slot::Reg(Reg::Rdi));
        assert_eq!(Slot::for_index(3), Slot::Reg(Reg::Rcx));
        assert_eq!(Slot::for_index(5), Slot::Reg(Reg::R9));
        assert_eq!(Slot::for_index(6), Slot::Stack(0));
        assert_eq!(Slot::for_index(63), Slot::Stack(57));
    }

    #[test]
    fn test_plan_one_one() {
        let plan = Plan::new(1, 1);
        assert_eq!(plan.frame(), FrameLayout::Aligned);
        assert_eq!(
            plan.ops(),
            &[
                ThunkOp::LandingPad,
                ThunkOp::PadStack,
                ThunkOp::MoveReg { dst: Reg::Rsi, src: Reg::Rdi },
                ThunkOp::LoadImm { dst: Reg::Rdi, imm: Imm::NowArg(0) },
                ThunkOp::LoadImm { dst: Reg::Rax, imm: Imm::Target },
                ThunkOp::Call(Reg::Rax),
                ThunkOp::UnpadStack,
                ThunkOp::Push(Reg::Rax),
                ThunkOp::LoadImm { dst: Reg::Rax, imm: Imm::Trampoline },
                ThunkOp::Push(Reg::Rax),
                ThunkOp::LoadImm { dst: Reg::Rdi, imm: Imm::RegionBase },
                ThunkOp::LoadImm { dst: Reg::Rsi, imm: Imm::RegionSize },
                ThunkOp::LoadImm { dst: Reg::Rax, imm: Imm::Unmap },
                ThunkOp::Jump(Reg::Rax),
            ]
        );
    }

    #[test]
    fn test_relocation_runs_highest_source_first() {
        let plan = Plan::new(2, 4);
        assert_eq!(
            relocations(&plan),
            vec![
                ThunkOp::MoveReg { dst: Reg::R9, src: Reg::Rcx },
                ThunkOp::MoveReg { dst: Reg::R8, src: Reg::Rdx },
                ThunkOp::MoveReg { dst: Reg::Rcx, src: Reg::Rsi },
                ThunkOp::MoveReg { dst: Reg::Rdx, src: Reg::Rdi },
            ]
        );
    }

    #[test]
    fn test_later_args_spill_past_registers() {
        let plan = Plan::new(4, 4);
        assert_eq!(plan.frame(), FrameLayout::Overflow { slots: 2, bytes: 16 });
        assert_eq!(
            relocations(&plan),
            vec![
                ThunkOp::StoreStack { slot: 1, src: Reg::Rcx },
                ThunkOp::StoreStack { slot: 0, src: Reg::Rdx },
                ThunkOp::MoveReg { dst: Reg::R9, src: Reg::Rsi },
                ThunkOp::MoveReg { dst: Reg::R8, src: Reg::Rdi },
            ]
        );
    }

    #[test]
    fn test_incoming_stack_args_are_copied() {
        let plan = Plan::new(1, 7);
        let ops = plan.ops();
        let load = ops
            .iter()
            .position(|op| matches!(op, ThunkOp::LoadIncoming { .. }))
            .unwrap();
        assert_eq!(ops[load], ThunkOp::LoadIncoming { dst: Reg::Rax, slot: 0 });
        assert_eq!(ops[load + 1], ThunkOp::StoreStack { slot: 1, src: Reg::Rax });
        // The only incoming stack arg follows all register relocations
        assert_eq!(
            ops[load - 1],
            ThunkOp::MoveReg { dst: Reg::Rsi, src: Reg::Rdi }
        );
    }

    #[test]
    fn test_now_overflow_args_go_through_scratch() {
        let plan = Plan::new(7, 1);
        let tail: Vec<_> = plan
            .ops()
            .iter()
            .copied()
            .skip_while(|op| *op != ThunkOp::LoadImm { dst: Reg::R9, imm: Imm::NowArg(5) })
            .take(3)
            .collect();
        assert_eq!(
            tail,
            vec![
                ThunkOp::LoadImm { dst: Reg::R9, imm: Imm::NowArg(5) },
                ThunkOp::LoadImm { dst: Reg::Rax, imm: Imm::NowArg(6) },
                ThunkOp::StoreStack { slot: 0, src: Reg::Rax },
            ]
        );
    }

    #[test]
    fn test_frame_padding_keeps_even_slots() {
        assert_eq!(Plan::new(6, 0).frame(), FrameLayout::Aligned);
        assert_eq!(
            Plan::new(7, 0).frame(),
            FrameLayout::Overflow { slots: 2, bytes: 16 }
        );
        assert_eq!(
            Plan::new(8, 0).frame(),
            FrameLayout::Overflow { slots: 2, bytes: 16 }
        );
        assert_eq!(
            Plan::new(4, 5).frame(),
            FrameLayout::Overflow { slots: 4, bytes: 32 }
        );
        assert_eq!(
            Plan::new(MAX_ARGS, MAX_ARGS).frame(),
            FrameLayout::Overflow { slots: 58, bytes: 464 }
        );
    }

    #[test]
    fn test_frame_teardown_matches_setup() {
        for (now, later) in [(1, 0), (3, 3), (6, 1), (32, 32)] {
            let plan = Plan::new(now, later);
            let setup = plan.ops()[1];
            let teardown = plan
                .ops()
                .iter()
                .copied()
                .find(|op| matches!(op, ThunkOp::LeaveFrame | ThunkOp::UnpadStack))
                .unwrap();
            match setup {
                ThunkOp::EnterFrame { .. } => assert_eq!(teardown, ThunkOp::LeaveFrame),
                ThunkOp::PadStack => assert_eq!(teardown, ThunkOp::UnpadStack),
                other => panic!("unexpected frame setup {other:?}"),
            }
        }
    }

    #[test]
    fn test_estimate_grows_with_arguments() {
        let small = Plan::new(1, 0).estimate();
        assert!(Plan::new(2, 0).estimate() > small);
        assert!(Plan::new(1, 1).estimate() > small);
        assert!(Plan::new(MAX_ARGS, MAX_ARGS).estimate() < 4096);
    }

    #[test]
    #[should_panic]
    fn test_plan_rejects_oversized_counts() {
        Plan::new(MAX_ARGS + 1, 0);
    }

    #[test]
    fn test_display() {
        let text: Vec<String> = Plan::new(7, 7).ops().iter().map(ToString::to_string).collect();
        assert_eq!(text[0], "endbr64");
        assert_eq!(text[1], "enter 0x40, 0");
        assert!(text.contains(&"mov rax, [rbp + 0x10]".to_string()));
        assert!(text.contains(&"mov [rsp + 0x30], r9".to_string()));
        assert!(text.contains(&"mov [rsp + 0x8], rdi".to_string()));
        assert!(text.contains(&"mov [rsp + 0x38], rax".to_string()));
        assert!(text.contains(&"mov [rsp], rax".to_string()));
        assert!(text.contains(&"mov rax, now[6]".to_string()));
        assert_eq!(text.last().map(String::as_str), Some("jmp rax"));
    }
}
