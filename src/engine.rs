//! Engine wiring and the load-time entry point.

use crate::maps::{self, MapsError};
use crate::meta::MetadataStore;
use crate::registers;
use crate::scan::{ScanError, ScanStats, Scanner};
use log::debug;
use std::fmt::{self, Display};
use std::fs::File;
use std::io::{BufRead, BufReader};

/// Fatal conditions that abort instrumentation, and with it the hosted process.
#[derive(Debug)]
pub enum EngineError {
    Maps(MapsError),
    Scan(ScanError),
}

impl From<MapsError> for EngineError {
    fn from(e: MapsError) -> Self {
        EngineError::Maps(e)
    }
}

impl From<ScanError> for EngineError {
    fn from(e: ScanError) -> Self {
        EngineError::Scan(e)
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Maps(e) => write!(f, "{e}"),
            EngineError::Scan(e) => write!(f, "{e}"),
        }
    }
}

/// Owns one instrumentation pass over a process image.
///
/// Creating the engine resets the emulated register bank; running it enumerates the mappings,
/// builds the file metadata and installs probes. There is deliberately no detach: once a probe
/// branches into a trampoline, both stay live for the rest of the process lifetime.
pub struct Engine;

impl Engine {
    pub fn new() -> Self {
        registers::reset_bank();
        Self
    }

    /// Runs a full pass over maps-format lines read from `reader`.
    ///
    /// # Safety
    ///
    /// The entries must describe live mappings of this process, and no other thread may be
    /// executing while text is rewritten.
    pub unsafe fn run<R: BufRead>(&mut self, reader: R) -> Result<ScanStats, EngineError> {
        let entries = maps::read_entries(reader)?;
        let store = MetadataStore::from_entries(&entries);
        let mut scanner = Scanner::new(&store);
        for entry in &entries {
            scanner.handle_entry(entry)?;
        }
        debug!("instrumentation pass done: {:?}", scanner.stats);
        Ok(scanner.stats)
    }

    /// Opens `/proc/self/maps` and instruments the running process.
    ///
    /// # Safety
    ///
    /// Same as [Engine::run]; additionally the process must still be single-threaded, which
    /// holds in the intended call context, before the hosted program's entry point.
    pub unsafe fn attach(&mut self) -> Result<ScanStats, EngineError> {
        let file = File::open("/proc/self/maps")
            .map_err(|e| EngineError::Maps(MapsError::Read(e)))?;
        self.run(BufReader::new(file))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Called by the dynamic loader before the hosted program's entry point.
#[cfg(all(target_os = "linux", target_arch = "arm"))]
extern "C" fn entrypoint() {
    let mut engine = Engine::new();
    match unsafe { engine.attach() } {
        Ok(stats) => debug!(
            "instrumented {} sites across {} mappings",
            stats.probes_installed, stats.mappings_scanned
        ),
        Err(e) => {
            log::error!("instrumentation failed: {e}");
            std::process::exit(1);
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "arm"))]
#[link_section = ".init_array"]
#[used]
static ENTRYPOINT: extern "C" fn() = entrypoint;
