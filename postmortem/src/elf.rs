// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The small part of ELF needed to read cores and identify modules: file
//! and program headers, notes and GNU build ids.

#![allow(non_camel_case_types, dead_code)]

use smallvec::SmallVec;
use std::fmt::Write;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const EI_MAG0: usize = 0;
pub const EI_MAG3: usize = 3;
pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;
pub const EI_VERSION: usize = 6;

pub const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// ELF version
pub const EV_CURRENT: u8 = 1;

/// Executable file
pub const ET_EXEC: u16 = 2;
/// Shared object file
pub const ET_DYN: u16 = 3;
/// Core file
pub const ET_CORE: u16 = 4;
/// ELF class
pub const ELFCLASS64: u8 = 2;
/// Endianness
pub const ELFDATA2LSB: u8 = 1;

/// Loadable program segment
pub const PT_LOAD: u32 = 1;
/// Auxiliary information
pub const PT_NOTE: u32 = 4;

/// Segment is executable
pub const PF_X: u32 = 1;

// ELF note types

/// Program status note
pub const NT_PRSTATUS: u32 = 1;
/// Program floating point registers note
pub const NT_PRFPREG: u32 = 2;
/// Program information note
pub const NT_PRPSINFO: u32 = 3;
/// Auxiliary vector note
pub const NT_AUXV: u32 = 6;
/// Signal information note
pub const NT_SIGINFO: u32 = 0x5349_4749;
/// Mapped files note
pub const NT_FILE: u32 = 0x4649_4c45;
/// Build id note, owned by "GNU"
pub const NT_GNU_BUILD_ID: u32 = 3;

/// Auxiliary vector entry holding the address of the vDSO image
pub const AT_SYSINFO_EHDR: u64 = 33;

/// Upper bound on the size of note segments read from a target image
const MAX_NOTE_SEGMENT: u64 = 0x1_0000;

/// Size of the identifiers carried in module records
pub const MD_GUID_SIZE: usize = 16;

/// ELF auxiliary vector entry
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct Elf64_Auxv {
    /// AUXV type
    pub a_type: u64, // from auxvec.h
    /// AUXV value
    pub a_val: u64,
}

/// ELF note header
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct Elf64_Nhdr {
    pub namesz: u32,
    pub descsz: u32,
    pub ntype: u32,
}

/// ELF header
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct Elf64_Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Elf64_Ehdr {
    /// Checks the identification bytes of a 64-bit little-endian ELF file.
    pub fn is_elf64(&self) -> bool {
        self.e_ident[EI_MAG0..=EI_MAG3] == ELFMAG
            && self.e_ident[EI_CLASS] == ELFCLASS64
            && self.e_ident[EI_DATA] == ELFDATA2LSB
            && self.e_ident[EI_VERSION] == EV_CURRENT
    }

    /// True for executables and shared objects with usable program headers.
    pub fn is_loadable_image(&self) -> bool {
        self.is_elf64()
            && (self.e_type == ET_EXEC || self.e_type == ET_DYN)
            && self.e_phentsize as usize == std::mem::size_of::<Elf64_Phdr>()
    }
}

/// ELF program header
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct Elf64_Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

/// One entry of a note segment
#[derive(Debug)]
pub struct Note<'a> {
    /// Owner name without the terminating NUL
    pub name: &'a [u8],
    pub ntype: u32,
    pub desc: &'a [u8],
}

/// Iterates the notes of a note segment; stops at the first malformed entry.
pub struct NoteIter<'a> {
    data: &'a [u8],
}

impl<'a> NoteIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

fn note_align(n: usize) -> Option<usize> {
    n.checked_add(3).map(|n| n & !3)
}

impl<'a> Iterator for NoteIter<'a> {
    type Item = Note<'a>;

    fn next(&mut self) -> Option<Note<'a>> {
        let (nhdr, rest) = Elf64_Nhdr::read_from_prefix(self.data).ok()?;
        let name_len = nhdr.namesz as usize;
        let name_span = note_align(name_len)?;
        let desc_len = nhdr.descsz as usize;
        let desc_span = note_align(desc_len)?;

        let name = rest.get(..name_len)?;
        let desc = rest.get(name_span..name_span.checked_add(desc_len)?)?;
        self.data = rest.get(name_span.checked_add(desc_span)?..).unwrap_or(&[]);

        let name = match name.split_last() {
            Some((0, head)) => head,
            _ => name,
        };
        Some(Note {
            name,
            ntype: nhdr.ntype,
            desc,
        })
    }
}

/// Finds the GNU build id among the notes of a segment.
pub fn find_build_id(notes: &[u8]) -> Option<Vec<u8>> {
    NoteIter::new(notes)
        .find(|note| note.ntype == NT_GNU_BUILD_ID && note.name == b"GNU")
        .map(|note| note.desc.to_vec())
        .filter(|id| !id.is_empty())
}

/// Reads the build id of an ELF image through `read`.
///
/// With `loaded` set, `base` is the address the image is mapped at and note
/// segments are located by their virtual address. Otherwise `read` works on
/// file offsets and `base` is ignored.
pub fn build_id_from_image(
    read: &mut dyn FnMut(u64, &mut [u8]) -> bool,
    base: u64,
    loaded: bool,
) -> Option<Vec<u8>> {
    let origin = if loaded { base } else { 0 };

    let mut ehdr_bytes = [0_u8; std::mem::size_of::<Elf64_Ehdr>()];
    if !read(origin, &mut ehdr_bytes) {
        return None;
    }
    let ehdr = Elf64_Ehdr::read_from_bytes(&ehdr_bytes).ok()?;
    if !ehdr.is_loadable_image() {
        return None;
    }

    let mut phdrs: SmallVec<[Elf64_Phdr; 16]> = SmallVec::new();
    for i in 0..ehdr.e_phnum as u64 {
        let mut phdr_bytes = [0_u8; std::mem::size_of::<Elf64_Phdr>()];
        let at = origin
            .checked_add(ehdr.e_phoff)?
            .checked_add(i * std::mem::size_of::<Elf64_Phdr>() as u64)?;
        if !read(at, &mut phdr_bytes) {
            return None;
        }
        phdrs.push(Elf64_Phdr::read_from_bytes(&phdr_bytes).ok()?);
    }

    // Shared objects are linked at zero, executables at their final address.
    let bias = if loaded {
        let first_load = phdrs.iter().find(|p| p.p_type == PT_LOAD)?;
        base.wrapping_sub(first_load.p_vaddr & !0xfff)
    } else {
        0
    };

    for phdr in phdrs.iter().filter(|p| p.p_type == PT_NOTE) {
        let len = phdr.p_filesz.min(MAX_NOTE_SEGMENT) as usize;
        let at = if loaded {
            bias.wrapping_add(phdr.p_vaddr)
        } else {
            phdr.p_offset
        };
        let mut notes = vec![0_u8; len];
        if read(at, &mut notes) {
            if let Some(id) = find_build_id(&notes) {
                return Some(id);
            }
        }
    }

    None
}

/// Derives an identifier from the first page of code when no build id exists.
///
/// The page is folded into 16 bytes by XOR.
pub fn text_hash_identifier(text: &[u8]) -> Vec<u8> {
    let mut id = vec![0_u8; MD_GUID_SIZE];
    for chunk in text.chunks(MD_GUID_SIZE) {
        for (i, b) in chunk.iter().enumerate() {
            id[i] ^= b;
        }
    }
    id
}

/// Formats the debug identifier used to look up symbols: the first 16 bytes
/// of the build id as a GUID followed by a zero age.
pub fn debug_identifier(build_id: &[u8]) -> String {
    let mut guid = [0_u8; MD_GUID_SIZE];
    let n = build_id.len().min(MD_GUID_SIZE);
    guid[..n].copy_from_slice(&build_id[..n]);

    let data1 = u32::from_le_bytes([guid[0], guid[1], guid[2], guid[3]]);
    let data2 = u16::from_le_bytes([guid[4], guid[5]]);
    let data3 = u16::from_le_bytes([guid[6], guid[7]]);
    let mut out = format!("{data1:08X}{data2:04X}{data3:04X}");
    for b in &guid[8..] {
        let _ = write!(out, "{b:02X}");
    }
    out.push('0');
    out
}

/// Formats the code identifier: the full build id in lowercase hex.
pub fn code_identifier(build_id: &[u8]) -> String {
    build_id.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(name: &[u8], ntype: u32, desc: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let nhdr = Elf64_Nhdr {
            namesz: name.len() as u32,
            descsz: desc.len() as u32,
            ntype,
        };
        out.extend_from_slice(nhdr.as_bytes());
        out.extend_from_slice(name);
        out.resize((out.len() + 3) & !3, 0);
        out.extend_from_slice(desc);
        out.resize((out.len() + 3) & !3, 0);
        out
    }

    #[test]
    fn identifier_byte_order() {
        let id: Vec<u8> = (0..16).map(|i| i * 0x11).collect();
        assert_eq!(debug_identifier(&id), "33221100554477668899AABBCCDDEEFF0");
        assert_eq!(code_identifier(&id[..4]), "00112233");
    }

    #[test]
    fn short_build_id_is_zero_padded() {
        assert_eq!(
            debug_identifier(&[0xab, 0xcd]),
            concat!("0000CDAB000000000000000000000000", "0")
        );
    }

    #[test]
    fn build_id_note_is_found_after_other_notes() {
        let mut notes = note(b"CORE\0", NT_PRSTATUS, &[1, 2, 3]);
        notes.extend(note(b"GNU\0", NT_GNU_BUILD_ID, &[0xde, 0xad, 0xbe, 0xef, 0x01]));
        assert_eq!(
            find_build_id(&notes),
            Some(vec![0xde, 0xad, 0xbe, 0xef, 0x01])
        );
    }

    #[test]
    fn truncated_notes_stop_iteration() {
        let mut notes = note(b"GNU\0", NT_GNU_BUILD_ID, &[1; 20]);
        notes.truncate(notes.len() - 8);
        assert_eq!(NoteIter::new(&notes).count(), 0);
    }

    #[test]
    fn text_hash_folds_pages() {
        let mut page = vec![0_u8; 4096];
        page[0] = 0x0f;
        page[16] = 0xf0;
        page[17] = 0x01;
        let id = text_hash_identifier(&page);
        assert_eq!(id[0], 0xff);
        assert_eq!(id[1], 0x01);
    }
}
