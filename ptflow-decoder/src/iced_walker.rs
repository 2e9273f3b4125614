//! Reference instruction walker backed by iced-x86
//!
//! [`ImageWalker`] serves walk requests from a flat in-memory image of the
//! traced program's code, the common case for post-mortem decoding of a
//! single binary. Only near control transfers are classified precisely; far
//! transfers are reported as indirect so the decoder resynchronizes rather
//! than guesses.

use iced_x86::{Code, Decoder as IcedDecoder, DecoderOptions, FlowControl, Instruction};

use crate::insn::{InsnBranch, InsnOp, PtInsn, WalkError, WalkInsn};

/// [`WalkInsn`] implementor over one contiguous code image
#[derive(Debug, Clone)]
pub struct ImageWalker<'m> {
    image: &'m [u8],
    base: u64,
    bitness: u32,
}

impl<'m> ImageWalker<'m> {
    /// Walker over `image` loaded at virtual address `base`, decoding 64-bit
    /// code
    #[must_use]
    pub fn new(image: &'m [u8], base: u64) -> Self {
        Self {
            image,
            base,
            bitness: 64,
        }
    }

    /// Override the decode bitness (16, 32 or 64)
    #[must_use]
    pub fn bitness(mut self, bitness: u32) -> Self {
        self.bitness = bitness;
        self
    }
}

fn classify(instruction: &Instruction) -> (InsnOp, InsnBranch, i32) {
    let rel = || {
        let next_ip = instruction.next_ip();
        instruction.near_branch_target().wrapping_sub(next_ip) as i64 as i32
    };

    if instruction.is_jcc_short_or_near() {
        (InsnOp::Jcc, InsnBranch::Conditional, rel())
    } else if instruction.is_loop() || instruction.is_loopcc() {
        (InsnOp::Loop, InsnBranch::Conditional, rel())
    } else if instruction.is_jmp_short_or_near() {
        (InsnOp::Jmp, InsnBranch::Unconditional, rel())
    } else if instruction.is_jmp_near_indirect() {
        (InsnOp::Jmp, InsnBranch::Indirect, 0)
    } else if instruction.is_call_near() {
        (InsnOp::Call, InsnBranch::Unconditional, rel())
    } else if instruction.is_call_near_indirect() {
        (InsnOp::Call, InsnBranch::Indirect, 0)
    } else if matches!(
        instruction.code(),
        Code::Retnw | Code::Retnw_imm16 | Code::Retnd | Code::Retnd_imm16 | Code::Retnq | Code::Retnq_imm16
    ) {
        (InsnOp::Ret, InsnBranch::Indirect, 0)
    } else if matches!(instruction.code(), Code::Syscall | Code::Sysenter) {
        (InsnOp::Syscall, InsnBranch::Indirect, 0)
    } else {
        match instruction.flow_control() {
            FlowControl::Next => (InsnOp::Other, InsnBranch::NoBranch, 0),
            FlowControl::Interrupt => (InsnOp::Int, InsnBranch::Indirect, 0),
            // Far returns, IRET, SYSRET and the like
            FlowControl::Return => (InsnOp::Iret, InsnBranch::Indirect, 0),
            // Far transfers and exceptions: make the decoder resync
            _ => (InsnOp::Other, InsnBranch::Indirect, 0),
        }
    }
}

impl WalkInsn for ImageWalker<'_> {
    fn walk_insn(
        &mut self,
        insn: &mut PtInsn,
        insn_cnt: &mut u64,
        ip: &mut u64,
        to_ip: u64,
        max_insn_cnt: u64,
    ) -> Result<(), WalkError> {
        let offset = ip
            .checked_sub(self.base)
            .map(|offset| offset as usize)
            .filter(|offset| *offset < self.image.len())
            .ok_or(WalkError::MissingText)?;

        let mut decoder = IcedDecoder::with_ip(
            self.bitness,
            &self.image[offset..],
            *ip,
            DecoderOptions::NONE,
        );
        let mut instruction = Instruction::default();

        loop {
            if to_ip != 0 && *ip == to_ip {
                return Ok(());
            }
            if !decoder.can_decode() {
                return Err(WalkError::MissingText);
            }
            decoder.decode_out(&mut instruction);
            if instruction.is_invalid() {
                return Err(WalkError::MissingText);
            }

            let (op, branch, rel) = classify(&instruction);
            *insn = PtInsn {
                op,
                branch,
                length: instruction.len() as u8,
                rel,
            };
            *insn_cnt += 1;

            if branch != InsnBranch::NoBranch {
                return Ok(());
            }
            if max_insn_cnt != 0 && *insn_cnt >= max_insn_cnt {
                return Ok(());
            }

            *ip = instruction.next_ip();
        }
    }
}
