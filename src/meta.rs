//! ELF metadata for mapped files.
//!
//! Plays the role of the runtime's file-metadata service: for every file-backed mapping it
//! provides the load bias and the extents of executable-flagged sections, which the scanner uses
//! to narrow a mapping down to the bytes that actually hold code.

use crate::align::Align;
use crate::maps::MapsEntry;
use crate::mem;
use object::elf::{FileHeader32, SHF_EXECINSTR};
use object::read::elf::FileHeader;
use object::{Endianness, Object, ObjectSection, ObjectSegment, SectionFlags};
use std::fs;

/// Magic identifying an ELF file header.
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Search direction for [ImageMetadata::section_boundary].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Towards lower addresses: used for the lower bound of a scan range.
    Down,
    /// Towards higher addresses: used for the upper bound of a scan range.
    Up,
}

/// Metadata of one loaded ELF object.
pub struct ImageMetadata {
    /// Backing file path.
    pub path: String,
    /// Load bias: the difference between a file virtual address and its runtime address.
    pub l_addr: usize,
    /// Runtime ranges this file's mappings cover.
    pub(crate) ranges: Vec<(usize, usize)>,
    /// Extents `[start, end)` of sections carrying the executable flag, in file virtual
    /// addresses, sorted.
    pub(crate) exec_sections: Vec<(u64, u64)>,
}

impl ImageMetadata {
    fn parse(path: &str, mappings: &[&MapsEntry]) -> Option<Self> {
        let data = fs::read(path).ok()?;
        let file = object::File::parse(&*data).ok()?;
        let min_vaddr = file.segments().map(|s| s.address()).min()?;
        let base = mappings.iter().map(|m| m.first).min()?;
        let l_addr = base - (min_vaddr as usize).align(mem::page_size());
        let mut exec_sections: Vec<(u64, u64)> = file
            .sections()
            .filter(|s| match s.flags() {
                SectionFlags::Elf { sh_flags } => sh_flags & SHF_EXECINSTR as u64 != 0,
                _ => false,
            })
            .map(|s| (s.address(), s.address() + s.size()))
            .collect();
        exec_sections.sort_unstable();
        Some(Self {
            path: path.into(),
            l_addr,
            ranges: mappings.iter().map(|m| (m.first, m.second)).collect(),
            exec_sections,
        })
    }

    /// Returns true when `addr` falls inside one of this image's runtime mappings.
    pub fn contains(&self, addr: usize) -> bool {
        self.ranges.iter().any(|&(a, b)| addr >= a && addr < b)
    }

    /// Walks the executable-flagged section extents and returns the boundary nearest to `addr`.
    ///
    /// `addr` is a file virtual address. When it already lies inside a flagged section it is its
    /// own boundary. Otherwise [Direction::Down] (queried with a range start) returns the start
    /// of the first flagged section at or above `addr`, and [Direction::Up] (queried with a
    /// range end) returns the end of the last flagged section at or below it. `None` means no
    /// flagged byte exists on the queried side.
    pub fn section_boundary(&self, addr: u64, direction: Direction) -> Option<u64> {
        if self
            .exec_sections
            .iter()
            .any(|&(a, b)| addr >= a && addr < b)
        {
            return Some(addr);
        }
        match direction {
            Direction::Down => self
                .exec_sections
                .iter()
                .map(|&(a, _)| a)
                .filter(|&a| a >= addr)
                .min(),
            Direction::Up => self
                .exec_sections
                .iter()
                .map(|&(_, b)| b)
                .filter(|&b| b <= addr)
                .max(),
        }
    }
}

/// Metadata for every parseable file-backed image, built from one enumeration pass.
pub struct MetadataStore {
    pub(crate) images: Vec<ImageMetadata>,
}

impl MetadataStore {
    /// Groups mappings by backing path and parses each backing file.
    ///
    /// Files which cannot be read or parsed contribute no metadata; the scanner later skips
    /// their mappings, the same treatment dynamically generated anonymous regions get.
    pub fn from_entries(entries: &[MapsEntry]) -> Self {
        let mut by_path: Vec<(&str, Vec<&MapsEntry>)> = Vec::new();
        for entry in entries {
            let Some(path) = entry.pathname() else {
                continue;
            };
            if !path.starts_with('/') {
                continue;
            }
            match by_path.iter_mut().find(|(p, _)| *p == path) {
                Some((_, group)) => group.push(entry),
                None => by_path.push((path, vec![entry])),
            }
        }
        let mut images = Vec::new();
        for (path, mappings) in by_path {
            match ImageMetadata::parse(path, &mappings) {
                Some(meta) => {
                    log::debug!("metadata for {path}: l_addr {:#x}", meta.l_addr);
                    images.push(meta);
                }
                None => log::debug!("no usable ELF metadata for {path}"),
            }
        }
        Self { images }
    }

    /// Returns metadata for the image whose mappings contain `addr`.
    pub fn lookup(&self, addr: usize) -> Option<&ImageMetadata> {
        self.images.iter().find(|m| m.contains(addr))
    }
}

/// Returns the number of bytes occupied by an in-memory ELF header plus its program header
/// table, or `None` when `bytes` does not start with a well-formed 32-bit ELF header.
pub fn end_of_header(bytes: &[u8]) -> Option<usize> {
    let header = FileHeader32::<Endianness>::parse(bytes).ok()?;
    let endian = header.endian().ok()?;
    Some(
        header.e_phoff.get(endian) as usize
            + header.e_phnum.get(endian) as usize * header.e_phentsize.get(endian) as usize,
    )
}
