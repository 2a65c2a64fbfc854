//! Page-level memory operations used while patching the process image.

use crate::align::Align;
use std::io;

#[derive(Debug)]
pub enum MemError {
    /// mprotect refused to raise permissions on the range.
    Protect {
        from: usize,
        len: usize,
        source: io::Error,
    },
}

impl std::fmt::Display for MemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemError::Protect { from, len, source } => {
                write!(f, "mprotect({from:#x}, {len}, rwx) failed: {source}")
            }
        }
    }
}

/// Returns the system page size in bytes.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Sets the write flag for `[from, to)`, rounding `from` down to a page boundary.
///
/// Permissions are raised to read+write+execute. The original permissions are not recorded and
/// are never restored.
pub fn make_writable(from: usize, to: usize) -> Result<(), MemError> {
    let from = from.align(page_size());
    let len = to - from;
    log::trace!("mprotect({from:#x}, {len}, rwx)");
    let prot = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
    let ret = unsafe { libc::mprotect(from as *mut libc::c_void, len, prot) };
    if ret != 0 {
        return Err(MemError::Protect {
            from,
            len,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Attempts to map `len` bytes of anonymous read+write+execute memory at exactly `addr`.
///
/// Returns the mapped address only when the kernel honoured the request exactly; `None` means
/// the range was busy and another page must be tried. Kernels without `MAP_FIXED_NOREPLACE`
/// degrade the flag to a hint, hence the equality check on the returned address.
pub fn map_fixed_noreplace(addr: usize, len: usize) -> Option<usize> {
    let prot = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
    let flags = libc::MAP_FIXED_NOREPLACE | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    let mapped = unsafe { libc::mmap(addr as *mut libc::c_void, len, prot, flags, -1, 0) };
    if mapped == libc::MAP_FAILED {
        return None;
    }
    if mapped as usize != addr {
        unsafe { libc::munmap(mapped, len) };
        return None;
    }
    Some(addr)
}
