//! Instruction walker seam
//!
//! The decoder does not read target memory itself. Whenever it needs to know
//! what the program does between two packets, it asks a [`WalkInsn`]
//! implementor to advance over instructions until the next branch, a target
//! IP, or an instruction budget. The walker also answers the address-filter
//! question for TIP.PGD resolution.

use thiserror::Error;

/// Coarse opcode class of a walked instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsnOp {
    /// Anything the decoder has no special handling for
    #[default]
    Other,
    /// Near CALL
    Call,
    /// Near RET
    Ret,
    /// Conditional jump
    Jcc,
    /// Near JMP, direct or indirect
    Jmp,
    /// LOOP/LOOPcc
    Loop,
    /// IRET
    Iret,
    /// Software interrupt
    Int,
    /// SYSCALL/SYSENTER
    Syscall,
    /// SYSRET/SYSEXIT
    Sysret,
}

/// Branch behavior of a walked instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsnBranch {
    /// Falls through
    #[default]
    NoBranch,
    /// Branches to a target not encoded in the instruction
    Indirect,
    /// May or may not take an encoded relative target
    Conditional,
    /// Always takes an encoded relative target
    Unconditional,
}

/// What the walker reports about the instruction it stopped at
#[derive(Debug, Clone, Copy, Default)]
pub struct PtInsn {
    /// Opcode class
    pub op: InsnOp,
    /// Branch behavior
    pub branch: InsnBranch,
    /// Encoded length in bytes
    pub length: u8,
    /// Relative displacement for direct branches
    pub rel: i32,
}

/// Error for an instruction walk
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum WalkError {
    /// No instruction bytes are available at the requested IP
    #[error("No instruction text at IP")]
    MissingText,
    /// The walk failed for any other reason
    #[error("Instruction walk failed")]
    Failed,
}

/// Instruction walker used by [`Decoder`][crate::Decoder]
pub trait WalkInsn {
    /// Walk instructions starting at `*ip`.
    ///
    /// The walker decodes the instruction at `*ip` and keeps advancing while
    /// the instruction falls through, incrementing `*insn_cnt` once per
    /// instruction. It must stop, leaving `*ip` at the instruction it stopped
    /// on and `insn` describing it, when any of these hits first:
    ///
    /// - `to_ip` is nonzero and `*ip == to_ip`, checked before decoding —
    ///   including immediately at entry, in which case `insn` may be left
    ///   untouched;
    /// - the instruction is a branch of any kind;
    /// - `max_insn_cnt` is nonzero and `*insn_cnt` reached it.
    fn walk_insn(
        &mut self,
        insn: &mut PtInsn,
        insn_cnt: &mut u64,
        ip: &mut u64,
        to_ip: u64,
        max_insn_cnt: u64,
    ) -> Result<(), WalkError>;

    /// Whether `ip` lies outside the active address filter.
    ///
    /// The default (no filter) never excludes anything, which makes the
    /// decoder treat every TIP.PGD as an ordinary tracing stop.
    fn is_outside_filter(&mut self, _ip: u64) -> bool {
        false
    }
}
