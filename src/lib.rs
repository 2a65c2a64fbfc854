//! Vfpemu is a load-time binary instrumentation library which emulates ARM VFP floating-point
//! instructions in software, for processors which lack VFP hardware. The library is injected
//! into a target program by the dynamic loader (`LD_PRELOAD`) and runs before the program entry
//! point: it scans every executable mapping of the process, finds each floating-point
//! instruction it knows how to emulate and replaces it in place with a branch to a freshly
//! generated trampoline. The trampoline saves the integer register bank, calls a software
//! emulation routine with the operand registers as arguments, restores the bank and branches
//! back to the instruction following the replaced one.
//!
//! Check [engine::Engine] for the instrumentation driver, and [scan] to see how executable
//! mappings are filtered, narrowed to their executable sections and walked.

mod align;
pub mod classify;
pub mod condition;
pub mod emit;
pub mod emulate;
pub mod engine;
pub mod maps;
pub mod mem;
pub mod meta;
pub mod probe;
pub mod registers;
pub mod scan;
pub mod trampoline;
