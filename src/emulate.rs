//! Software emulation routines and their dispatch.
//!
//! A trampoline loads at most four 16-bit immediates into r0..r3 and calls a routine through
//! `blx`, so every routine here is an `extern "C"` function of four word arguments. No Rust code
//! calls these functions; the machine code generated at run time does.

use crate::classify::FpInstruction;
use crate::registers::{self, SRegisterIndex};

/// Calling convention between trampolines and emulation routines.
pub type Routine = extern "C" fn(u32, u32, u32, u32);

/// Binds one instruction shape to its emulation routine and argument layout.
pub struct Handler {
    /// Routine whose absolute address the trampoline materialises and calls.
    pub routine: Routine,
    /// Immediate arguments loaded into r0..r3 before the call.
    pub args: [u16; 4],
}

/// Returns the emulation handler for a classified instruction.
///
/// New instructions are wired by adding a match arm here; the trampoline factory has no
/// knowledge of individual routines.
pub fn handler_for(ins: &FpInstruction) -> Option<Handler> {
    match ins {
        FpInstruction::Unknown => None,
        FpInstruction::VaddF32 { sd, sn, sm, .. } => Some(Handler {
            routine: vadd_f32,
            args: [
                sd.index() as u16,
                sn.index() as u16,
                sm.index() as u16,
                0,
            ],
        }),
    }
}

/// Emulation routine for VADD.F32: bank[sd] = bank[sn] + bank[sm] as single-precision floats.
pub extern "C" fn vadd_f32(sd: u32, sn: u32, sm: u32, _pad: u32) {
    let sd = SRegisterIndex::new(sd);
    let sn = SRegisterIndex::new(sn);
    let sm = SRegisterIndex::new(sm);
    let a = f32::from_bits(registers::get_sreg(sn));
    let b = f32::from_bits(registers::get_sreg(sm));
    let c = a + b;
    registers::set_sreg(sd, c.to_bits());
    log::trace!("vadd.f32 {sd}, {sn}, {sm}: {a} + {b} = {c}");
}
