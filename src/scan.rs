//! Top-level region scanner.
//!
//! Drives one instrumentation pass: filters the enumerated mappings, narrows each executable
//! mapping to the range covered by executable-flagged sections, then walks that range looking
//! for instructions to displace.

use crate::classify;
use crate::emulate;
use crate::maps::MapsEntry;
use crate::mem::{self, MemError};
use crate::meta::{self, Direction, MetadataStore};
use crate::probe;
use crate::trampoline::{self, TrampolineError};
use log::{debug, trace};
use std::slice;

/// Path substrings whose mappings are never classified, never patched and never reprotected.
///
/// The leading `[` is a catch-all for bracketed pseudo-mappings, kept over the specific entries
/// for stability. `libm` must stay untouched so the emulation routines themselves keep working,
/// and patching this library's own image would recurse into the emulator. The Capstone and
/// Keystone sonames date from when classification and assembly were external engines.
pub const SKIP_SUBSTRINGS: [&str; 10] = [
    "[",
    "[stack]",
    "[vvar]",
    "[sigpage]",
    "[vdso]",
    "[vectors]",
    "libm-2.31.so",
    "libkeystone.so.0",
    "libcapstone.so.4",
    "libvfpemu.so",
];

#[derive(Debug)]
pub enum ScanError {
    Protect(MemError),
    Trampoline(TrampolineError),
}

impl From<MemError> for ScanError {
    fn from(e: MemError) -> Self {
        ScanError::Protect(e)
    }
}

impl From<TrampolineError> for ScanError {
    fn from(e: TrampolineError) -> Self {
        ScanError::Trampoline(e)
    }
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Protect(e) => write!(f, "{e}"),
            ScanError::Trampoline(e) => write!(f, "{e}"),
        }
    }
}

/// Counters accumulated over one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub mappings_skipped: usize,
    pub mappings_scanned: usize,
    pub probes_installed: usize,
    /// Mappings whose permissions were raised to rwx for patching.
    pub permission_raises: usize,
}

/// Walks mappings and installs probes. Holds the metadata for the pass and the counters.
pub struct Scanner<'a> {
    store: &'a MetadataStore,
    pub stats: ScanStats,
}

impl<'a> Scanner<'a> {
    pub fn new(store: &'a MetadataStore) -> Self {
        Self {
            store,
            stats: ScanStats::default(),
        }
    }

    /// Applies the mapping filters and instruments whatever survives them.
    ///
    /// # Safety
    ///
    /// `entry` must describe a live mapping of this process, and no other thread may be
    /// executing while its text is rewritten.
    pub unsafe fn handle_entry(&mut self, entry: &MapsEntry) -> Result<(), ScanError> {
        if SKIP_SUBSTRINGS.iter().any(|s| entry.rest.contains(s)) {
            debug!("skipping {}", entry.rest);
            self.stats.mappings_skipped += 1;
            return Ok(());
        }
        let Some(meta) = self.store.lookup(entry.first) else {
            debug!("file metadata not found for: {}", entry.rest);
            self.stats.mappings_skipped += 1;
            return Ok(());
        };
        if !entry.execute {
            trace!("not executable, skipping: {}", entry.rest);
            self.stats.mappings_skipped += 1;
            return Ok(());
        }

        // Narrow the mapping to the range containing exactly only executable sections.
        let l_addr = meta.l_addr;
        let from = meta.section_boundary((entry.first - l_addr) as u64, Direction::Down);
        let to = meta.section_boundary((entry.second - l_addr) as u64, Direction::Up);
        let (Some(from), Some(to)) = (from, to) else {
            debug!("no executable sections in {}", entry.rest);
            self.stats.mappings_skipped += 1;
            return Ok(());
        };
        let sections_from = (l_addr + from as usize).clamp(entry.first, entry.second);
        let sections_to = (l_addr + to as usize).clamp(entry.first, entry.second);
        assert!(
            entry.first <= sections_from && sections_from <= sections_to && sections_to <= entry.second
        );
        debug!(
            "mapping {} goes from ({:#x}-){:#x}-{:#x}(-{:#x})",
            entry.rest, entry.first, sections_from, sections_to, entry.second
        );
        self.instrument_range(entry, sections_from, sections_to)
    }

    /// Looks through `[from, to)` for floating-point instructions and displaces each one found
    /// with a branch to a freshly generated trampoline.
    unsafe fn instrument_range(
        &mut self,
        entry: &MapsEntry,
        from: usize,
        to: usize,
    ) -> Result<(), ScanError> {
        let mut start = from;
        if to - from >= 4 {
            let head = slice::from_raw_parts(from as *const u8, 4);
            if head == meta::ELF_MAGIC.as_slice() {
                // Probably an ELF header, skip past it and its program header table.
                let bytes = slice::from_raw_parts(from as *const u8, to - from);
                if let Some(skip) = meta::end_of_header(bytes) {
                    start = from + skip.min(to - from);
                    debug!("ELF header spotted at {from:#x}, skipping to {start:#x}");
                }
            }
        }
        assert!(start >= entry.first && start <= entry.second);

        self.stats.mappings_scanned += 1;
        let mut writable = entry.write;
        trace!("scanning through {start:#x}-{to:#x} for fp instructions");
        let mut p = start;
        while p + 4 <= to {
            let word = (p as *const u32).read_unaligned();
            let ins = classify::classify(word);
            let Some(handler) = emulate::handler_for(&ins) else {
                p += 2;
                continue;
            };
            let tramp = trampoline::generate(p, &handler)?;
            debug!("trampoline written for fp instruction at {p:#x}, at {tramp:#x}");
            if !writable {
                mem::make_writable(entry.first, entry.second)?;
                writable = true;
                self.stats.permission_raises += 1;
            }
            probe::install(p, tramp)?;
            self.stats.probes_installed += 1;
            p += 2;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::{branch_displacement, movw, INT24_MIN};
    use crate::emulate::vadd_f32;
    use crate::maps::MapsEntry;
    use crate::meta::{ImageMetadata, MetadataStore};
    use crate::trampoline::{MOVW_LOWER_OFFSET, MOVW_UPPER_OFFSET, RETURN_OFFSET, SKELETON};
    use std::slice;

    fn empty_store() -> MetadataStore {
        MetadataStore { images: Vec::new() }
    }

    /// Store claiming one image mapped 1:1 over `[start, end)` with a single executable
    /// section covering the whole range.
    fn store_for(start: usize, end: usize) -> MetadataStore {
        MetadataStore {
            images: vec![ImageMetadata {
                path: "/bin/app".into(),
                l_addr: start,
                ranges: vec![(start, end)],
                exec_sections: vec![(0, (end - start) as u64)],
            }],
        }
    }

    fn entry_over(start: usize, end: usize, perms: &str) -> MapsEntry {
        MapsEntry::parse(&format!("{start:x}-{end:x} {perms} 00000000 b3:02 42   /bin/app"))
            .unwrap()
    }

    #[test]
    fn test_skip_filtered_paths() {
        let store = empty_store();
        let mut scanner = Scanner::new(&store);
        for rest in [
            "00:00 0   [stack]",
            "00:00 0   [vdso]",
            "b3:02 7   /lib/libm-2.31.so",
            "b3:02 8   /usr/lib/libvfpemu.so",
        ] {
            let entry = MapsEntry::parse(&format!("10000-20000 r-xp 00000000 {rest}")).unwrap();
            unsafe { scanner.handle_entry(&entry).unwrap() };
        }
        assert_eq!(scanner.stats.mappings_skipped, 4);
        assert_eq!(scanner.stats.mappings_scanned, 0);
        assert_eq!(scanner.stats.permission_raises, 0);
    }

    #[test]
    fn test_skip_anonymous_mapping() {
        // Executable mapping with no file metadata available.
        let store = empty_store();
        let mut scanner = Scanner::new(&store);
        let entry = entry_over(0x700000, 0x701000, "r-xp");
        unsafe { scanner.handle_entry(&entry).unwrap() };
        assert_eq!(scanner.stats.mappings_skipped, 1);
        assert_eq!(scanner.stats.probes_installed, 0);
    }

    #[test]
    fn test_skip_not_executable() {
        let buf = vec![0u32; 16];
        let start = buf.as_ptr() as usize;
        let store = store_for(start, start + 64);
        let mut scanner = Scanner::new(&store);
        let entry = entry_over(start, start + 64, "rw-p");
        unsafe { scanner.handle_entry(&entry).unwrap() };
        assert_eq!(scanner.stats.mappings_skipped, 1);
    }

    #[test]
    fn test_single_vadd_patched() {
        // A writable executable "mapping" holding one vadd.f32 s0, s0, s1.
        let mut buf = vec![0u32; 1024];
        buf[32] = 0xee30_0a20;
        let start = buf.as_ptr() as usize;
        let end = start + buf.len() * 4;
        let site = start + 32 * 4;

        let store = store_for(start, end);
        let mut scanner = Scanner::new(&store);
        let entry = entry_over(start, end, "rwxp");
        unsafe { scanner.handle_entry(&entry).unwrap() };
        assert_eq!(scanner.stats.probes_installed, 1);
        assert_eq!(scanner.stats.permission_raises, 0);

        // The site now holds a branch to the trampoline base.
        let site_word = unsafe { (site as *const u32).read() };
        assert_eq!(site_word & 0xff00_0000, 0xea00_0000);
        let forward = branch_displacement(site_word);
        let tramp = (site as i64 + forward) as usize;

        let words = unsafe { slice::from_raw_parts(tramp as *const u32, 12) };
        // Push, address assembly and call come straight from the skeleton.
        assert_eq!(words[0], SKELETON[0]);
        assert_eq!(words[2], SKELETON[2]);
        assert_eq!(words[4], SKELETON[4]);
        assert_eq!(words[9], SKELETON[9]);
        assert_eq!(words[10], SKELETON[10]);
        // The movw pair materialises the vadd_f32 routine address.
        let routine = vadd_f32 as usize;
        assert_eq!(words[MOVW_UPPER_OFFSET / 4], movw(5, (routine >> 16) as u16).unwrap());
        assert_eq!(words[MOVW_LOWER_OFFSET / 4], movw(6, routine as u16).unwrap());
        // Operand arguments: sd, sn, sm, padding.
        assert_eq!(words[5], movw(0, 0).unwrap());
        assert_eq!(words[6], movw(1, 0).unwrap());
        assert_eq!(words[7], movw(2, 1).unwrap());
        assert_eq!(words[8], movw(3, 0).unwrap());
        // The return branch leads back to the instruction after the site.
        let back = branch_displacement(words[RETURN_OFFSET / 4]);
        assert_eq!((tramp + RETURN_OFFSET) as i64 + back, site as i64 + 4);
        // The trampoline page is within branch reach.
        assert!(tramp >= (site as i64 + INT24_MIN) as usize);
    }

    #[test]
    fn test_wrong_operands_not_patched() {
        // vadd.f32 s2, s3, s4: opcode accepted, operands rejected.
        let mut buf = vec![0u32; 64];
        buf[8] = 0xee31_1a82;
        let start = buf.as_ptr() as usize;
        let end = start + buf.len() * 4;

        let store = store_for(start, end);
        let mut scanner = Scanner::new(&store);
        let entry = entry_over(start, end, "rwxp");
        unsafe { scanner.handle_entry(&entry).unwrap() };
        assert_eq!(scanner.stats.mappings_scanned, 1);
        assert_eq!(scanner.stats.probes_installed, 0);
        let word = unsafe { ((start + 8 * 4) as *const u32).read() };
        assert_eq!(word, 0xee31_1a82);
    }

    #[test]
    fn test_read_only_text_raised_then_patched() {
        // A page mapped read+execute only, holding one vadd: the scanner must raise
        // permissions before patching.
        let page = mem::page_size();
        let mapping = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(mapping, libc::MAP_FAILED);
        let start = mapping as usize;
        unsafe {
            ((start + 0x80) as *mut u32).write(0xee30_0a20);
            let ret = libc::mprotect(mapping, page, libc::PROT_READ | libc::PROT_EXEC);
            assert_eq!(ret, 0);
        }

        let store = store_for(start, start + page);
        let mut scanner = Scanner::new(&store);
        let entry = entry_over(start, start + page, "r-xp");
        unsafe { scanner.handle_entry(&entry).unwrap() };
        assert_eq!(scanner.stats.probes_installed, 1);
        assert_eq!(scanner.stats.permission_raises, 1);
        let site_word = unsafe { ((start + 0x80) as *const u32).read() };
        assert_eq!(site_word & 0xff00_0000, 0xea00_0000);
    }

    #[test]
    fn test_elf_header_skipped() {
        // A range starting with an ELF header: a vadd placed inside the header and program
        // header table range must not be probed, one placed after it must.
        let mut buf = vec![0u32; 1024];
        let header = hex::decode(concat!(
            "7f454c46010101000000000000000000",
            "0200",
            "2800",
            "01000000",
            "00000000",
            "34000000",
            "00000000",
            "00000000",
            "3400",
            "2000",
            "0200",
            "2800",
            "0000",
            "0000",
        ))
        .unwrap();
        let bytes =
            unsafe { slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u8, buf.len() * 4) };
        bytes[..52].copy_from_slice(&header);
        // Inside the skipped range (52 + 2 * 32 = 116 bytes).
        buf[20] = 0xee30_0a20;
        // Past it.
        buf[40] = 0xee30_0a20;
        let start = buf.as_ptr() as usize;
        let end = start + buf.len() * 4;

        let store = store_for(start, end);
        let mut scanner = Scanner::new(&store);
        let entry = entry_over(start, end, "rwxp");
        unsafe { scanner.handle_entry(&entry).unwrap() };
        assert_eq!(scanner.stats.probes_installed, 1);
        let in_header = unsafe { ((start + 20 * 4) as *const u32).read() };
        let past_header = unsafe { ((start + 40 * 4) as *const u32).read() };
        assert_eq!(in_header, 0xee30_0a20);
        assert_ne!(past_header, 0xee30_0a20);
    }

    #[test]
    fn test_vadd_in_last_word_considered() {
        // A vadd occupying the final 4 bytes before sections_to is still scanned.
        let mut buf = vec![0u32; 64];
        buf[63] = 0xee30_0a20;
        let start = buf.as_ptr() as usize;
        let end = start + buf.len() * 4;

        let store = store_for(start, end);
        let mut scanner = Scanner::new(&store);
        let entry = entry_over(start, end, "rwxp");
        unsafe { scanner.handle_entry(&entry).unwrap() };
        assert_eq!(scanner.stats.probes_installed, 1);
    }
}
