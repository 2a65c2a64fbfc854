//! Trampoline skeleton and per-site generation.
//!
//! Every probed instruction gets its own 48-byte trampoline: a copy of a fixed twelve-word
//! skeleton, patched with the emulation routine's address and the operand arguments. Once a live
//! probe branches into a trampoline it is never freed; everything generated here survives for
//! the remainder of the process lifetime.

use crate::align::Align;
use crate::emit::{self, EmitError, INT24_MAX, INT24_MIN};
use crate::emulate::Handler;
use crate::mem;

/// Number of bytes in a trampoline.
pub const SKELETON_SIZE: usize = 48;

/// Byte offset of the `movw` loading the upper half of the routine address.
pub const MOVW_UPPER_OFFSET: usize = 4;
/// Byte offset of the `movw` loading the lower half of the routine address.
pub const MOVW_LOWER_OFFSET: usize = 12;
/// Byte offsets of the `movw`s loading the r0..r3 arguments.
pub const MOVW_ARG_OFFSETS: [usize; 4] = [20, 24, 28, 32];
/// Byte offset of the return branch slot, written by the probe installer.
pub const RETURN_OFFSET: usize = 44;

/// Register called through `blx`, holding the assembled routine address.
const REG_CALL: u8 = 5;
/// Scratch register holding the lower half before the `orr` merge.
const REG_SCRATCH: u8 = 6;

/// The twelve A32 words every trampoline starts from.
///
/// r5/r6 and r0..r3 are free to clobber between the push and the pop. The address halves and
/// argument immediates carry recognisable placeholder values; all six slots are rewritten by
/// [populate] before the trampoline can be reached.
pub const SKELETON: [u32; 12] = [
    0xe92d5fff, // push {r0-r12, r14}
    0xe30d5ead, // movw r5, #0xdead (upper half of the routine address)
    0xe1a05805, // lsl r5, r5, #16
    0xe30b6eef, // movw r6, #0xbeef (lower half of the routine address)
    0xe1855006, // orr r5, r5, r6
    0xe3a00000, // mov r0, #0 (arg0)
    0xe3a01000, // mov r1, #0 (arg1)
    0xe3a02000, // mov r2, #0 (arg2)
    0xe3a03000, // mov r3, #0 (arg3)
    0xe12fff35, // blx r5
    0xe8bd5fff, // pop {r0-r12, r14}
    0xeafffffe, // b . (return branch, written by the probe installer)
];

#[derive(Debug)]
pub enum TrampolineError {
    /// No free page exists within branch reach of the probe site.
    NoSpace { site: usize },
    Emit(EmitError),
}

impl From<EmitError> for TrampolineError {
    fn from(e: EmitError) -> Self {
        TrampolineError::Emit(e)
    }
}

impl std::fmt::Display for TrampolineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrampolineError::NoSpace { site } => {
                write!(f, "no space for a trampoline near instruction {site:#x}")
            }
            TrampolineError::Emit(e) => write!(f, "cannot encode trampoline patch: {e:?}"),
        }
    }
}

/// Finds and reserves a page of memory near `site`.
///
/// The search window is `[site + INT24_MIN, site + INT24_MAX]` clamped to the address space,
/// with the low bound rounded up and the high bound rounded down to page boundaries. Pages are
/// requested one at a time from low to high until the kernel accepts one at exactly the
/// requested address.
fn place_near(site: usize) -> Result<usize, TrampolineError> {
    let page = mem::page_size();
    let range_low = site.saturating_sub(INT24_MIN.unsigned_abs() as usize);
    let range_high = site.saturating_add(INT24_MAX as usize);
    let search_from = range_low.align_up(page);
    let search_to = range_high.align(page);
    log::trace!(
        "trampoline search for {site:#x}: pages {search_from:#x}-{search_to:#x}"
    );
    let mut page_start = search_from;
    while page_start < search_to {
        if let Some(mapped) = mem::map_fixed_noreplace(page_start, SKELETON_SIZE) {
            return Ok(mapped);
        }
        page_start += page;
    }
    Err(TrampolineError::NoSpace { site })
}

/// Patches a skeleton copy with the emulation routine address and the four argument loads.
///
/// The address is materialised through two `movw`s merged by the skeleton's shift-and-or
/// because the emitter's vocabulary has no `movt`. The return slot is left untouched.
pub fn populate(words: &mut [u32; 12], routine: usize, args: [u16; 4]) -> Result<(), EmitError> {
    let upper = (routine >> 16) as u16;
    let lower = routine as u16;
    words[MOVW_UPPER_OFFSET / 4] = emit::movw(REG_CALL, upper)?;
    words[MOVW_LOWER_OFFSET / 4] = emit::movw(REG_SCRATCH, lower)?;
    for (i, arg) in args.iter().enumerate() {
        words[MOVW_ARG_OFFSETS[i] / 4] = emit::movw(i as u8, *arg)?;
    }
    Ok(())
}

/// Generates a trampoline for the instruction at `site`, bound to `handler`.
///
/// Returns the trampoline base address. The return branch slot still holds the skeleton
/// placeholder; only the probe installer knows the final site-to-trampoline pairing.
///
/// # Safety
///
/// Single-threaded constructor phase: the fresh page is written without synchronisation.
pub unsafe fn generate(site: usize, handler: &Handler) -> Result<usize, TrampolineError> {
    let tramp = place_near(site)?;
    let mut words = SKELETON;
    populate(&mut words, handler.routine as usize, handler.args)?;
    for (i, word) in words.iter().enumerate() {
        ((tramp + i * 4) as *mut u32).write(*word);
    }
    Ok(tramp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skeleton_bytes() {
        // The skeleton as raw little-endian bytes.
        let bytes: Vec<u8> = SKELETON.iter().flat_map(|w| w.to_le_bytes()).collect();
        let expected = hex::decode(concat!(
            "ff5f2de9", // push {r0-r12, r14}
            "ad5e0de3", // movw r5, #0xdead
            "0558a0e1", // lsl r5, r5, #16
            "ef6e0be3", // movw r6, #0xbeef
            "065085e1", // orr r5, r5, r6
            "0000a0e3", // mov r0, #0
            "0010a0e3", // mov r1, #0
            "0020a0e3", // mov r2, #0
            "0030a0e3", // mov r3, #0
            "35ff2fe1", // blx r5
            "ff5fbde8", // pop {r0-r12, r14}
            "feffffea", // b .
        ))
        .unwrap();
        assert_eq!(bytes.len(), SKELETON_SIZE);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_populate() {
        let mut words = SKELETON;
        populate(&mut words, 0x0001_2345, [0, 0, 1, 0]).unwrap();
        assert_eq!(words[MOVW_UPPER_OFFSET / 4], emit::movw(5, 0x0001).unwrap());
        assert_eq!(words[MOVW_LOWER_OFFSET / 4], emit::movw(6, 0x2345).unwrap());
        assert_eq!(words[MOVW_ARG_OFFSETS[0] / 4], emit::movw(0, 0).unwrap());
        assert_eq!(words[MOVW_ARG_OFFSETS[1] / 4], emit::movw(1, 0).unwrap());
        assert_eq!(words[MOVW_ARG_OFFSETS[2] / 4], emit::movw(2, 1).unwrap());
        assert_eq!(words[MOVW_ARG_OFFSETS[3] / 4], emit::movw(3, 0).unwrap());
        // Everything else is untouched, in particular the return slot.
        for i in [0, 2, 4, 9, 10, 11] {
            assert_eq!(words[i], SKELETON[i]);
        }
    }

    #[test]
    fn test_populated_movws_roundtrip() {
        let mut words = SKELETON;
        populate(&mut words, 0xdead_beef, [7, 8, 9, 0]).unwrap();
        assert_eq!(emit::movw_operands(words[1]), (5, 0xdead));
        assert_eq!(emit::movw_operands(words[3]), (6, 0xbeef));
        assert_eq!(emit::movw_operands(words[5]), (0, 7));
    }
}
