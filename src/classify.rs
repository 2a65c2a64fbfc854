//! Candidate instruction classification.
//!
//! Decides whether a 4-byte word scanned out of an executable mapping is a floating-point
//! instruction the engine emulates. Words are matched against the fixed bits of the A32
//! encodings; a word read at a misaligned address simply fails the match, so the scanner is free
//! to over-search at a 2-byte stride.

use crate::condition::Condition;
use crate::registers::SRegisterIndex;

/// Descriptor of a classified instruction.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum FpInstruction {
    /// Not a floating-point instruction this engine handles.
    Unknown,
    /// VADD.F32 Sd, Sn, Sm.
    VaddF32 {
        sd: SRegisterIndex,
        sn: SRegisterIndex,
        sm: SRegisterIndex,
        cond: Condition,
    },
}

/// Fixed bits of VADD (floating-point, single precision), A32 encoding:
/// `cond 11100 D 11 Vn Vd 101 0 N 0 M 0 Vm`.
/// S register numbers are `Sd = Vd:D`, `Sn = Vn:N`, `Sm = Vm:M`.
const VADD_F32_MASK: u32 = 0x0fb0_0f50;
const VADD_F32_BITS: u32 = 0x0e30_0a00;

/// Tries to decode `word` as a floating-point instruction, without any acceptance policy.
pub fn decode(word: u32) -> FpInstruction {
    if word & VADD_F32_MASK != VADD_F32_BITS {
        return FpInstruction::Unknown;
    }
    let Ok(cond) = Condition::try_from((word >> 28) as u8) else {
        // Condition field 15 selects the unconditional space, where this bit pattern is not a
        // VFP instruction.
        return FpInstruction::Unknown;
    };
    FpInstruction::VaddF32 {
        sd: SRegisterIndex::new((word >> 12 & 0xf) << 1 | word >> 22 & 1),
        sn: SRegisterIndex::new((word >> 16 & 0xf) << 1 | word >> 7 & 1),
        sm: SRegisterIndex::new((word & 0xf) << 1 | word >> 5 & 1),
        cond,
    }
}

/// Decodes `word` and applies the engine's acceptance policy.
///
/// Conditional encodings are refused, and only the `(s0, s0, s1)` operand shape is accepted
/// while vadd_f32 is the single wired emulation routine.
pub fn classify(word: u32) -> FpInstruction {
    match decode(word) {
        FpInstruction::VaddF32 { cond, .. } if cond != Condition::Always => {
            log::trace!("refusing conditional encoding vadd{cond}.f32");
            FpInstruction::Unknown
        }
        FpInstruction::VaddF32 { sd, sn, sm, .. }
            if !(sd == SRegisterIndex::S0 && sn == SRegisterIndex::S0 && sm == SRegisterIndex::S1) =>
        {
            FpInstruction::Unknown
        }
        ins => ins,
    }
}
