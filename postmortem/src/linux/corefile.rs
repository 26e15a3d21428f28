// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Gathering process information from an ELF core file.
//!
//! The kernel already froze the process, so nothing is suspended. Threads,
//! registers and the crash come from the notes; memory from the `PT_LOAD`
//! segments. A copy of the process' proc directory, when available, adds
//! the memory map and the text files a live capture would read.

use super::procfs::{self, copied_proc_path};
use crate::arch::{self, EM_AARCH64, EM_X86_64};
use crate::elf::{
    Elf64_Ehdr, Elf64_Phdr, NoteIter, ELFCLASS64, ELFDATA2LSB, ELFMAG, EI_CLASS, EI_DATA,
    EI_VERSION, ET_CORE, EV_CURRENT, NT_AUXV, NT_FILE, NT_PRFPREG, NT_PRPSINFO, NT_PRSTATUS,
    NT_SIGINFO, PT_LOAD, PT_NOTE,
};
use crate::snapshot::{
    stack_range, CrashInfo, MemoryMapping, ModuleMapping, ProcFile, SystemDescription,
    ThreadView, VaProtection,
};
use crate::{CoreError, DumpOptions, ProcessInfoSource, ReadProcessMemory, SoftError};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use zerocopy::FromBytes;

// elf_prstatus
const PRSTATUS_CURSIG: usize = 12;
const PRSTATUS_PID: usize = 32;
const PRSTATUS_PPID: usize = 36;
const PRSTATUS_REG: usize = 112;

// siginfo_t
const SIGINFO_CODE: usize = 8;
const SIGINFO_ADDR: usize = 16;
const SIGINFO_SYSCALL: usize = 24;
const SIGINFO_ARCH: usize = 28;

// elf_prpsinfo
const PRPSINFO_PID: usize = 24;
const PRPSINFO_FNAME: usize = 40;
const PRPSINFO_PSARGS: usize = 56;
const PRPSINFO_PSARGS_LEN: usize = 80;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

const DEFAULT_PAGE_SIZE: u64 = 0x1000;

fn u16_at(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2).map(LittleEndian::read_u16)
}

fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4).map(LittleEndian::read_u32)
}

fn u64_at(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset + 8).map(LittleEndian::read_u64)
}

fn c_string(data: &[u8]) -> &[u8] {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    &data[..end]
}

/// File-backed part of a `PT_LOAD` segment
#[derive(Clone, Copy, Debug)]
struct LoadSegment {
    vaddr: u64,
    memsz: u64,
    filesz: u64,
    offset: u64,
    flags: u32,
}

#[derive(Debug)]
struct CoreImage {
    data: Vec<u8>,
    segments: Vec<LoadSegment>,
}

impl CoreImage {
    /// Longest prefix of `[address, address + len)` stored in one segment
    fn backed(&self, address: u64, len: usize) -> Option<&[u8]> {
        let segment = self
            .segments
            .iter()
            .find(|s| address >= s.vaddr && address - s.vaddr < s.filesz)?;
        let skip = address - segment.vaddr;
        let available = (segment.filesz - skip).min(len as u64) as usize;
        let start = (segment.offset + skip) as usize;
        self.data.get(start..start + available)
    }
}

/// Reads the memory saved in a core file.
///
/// Ranges the kernel did not store (read-only file mappings, filtered
/// segments) cannot be read: they are never padded with zeros.
#[derive(Clone, Debug)]
pub struct CoreMemoryReader {
    image: Arc<CoreImage>,
}

impl ReadProcessMemory for CoreMemoryReader {
    fn read_process_memory(&mut self, base: usize, buf: &mut [u8]) -> Result<usize, CoreError> {
        let mut done = 0;
        while done < buf.len() {
            let Some(bytes) = self.image.backed((base + done) as u64, buf.len() - done) else {
                break;
            };
            if bytes.is_empty() {
                break;
            }
            buf[done..done + bytes.len()].copy_from_slice(bytes);
            done += bytes.len();
        }

        if done == 0 && !buf.is_empty() {
            return Err(CoreError::MemoryRead {
                address: base as u64,
                len: buf.len(),
            });
        }
        Ok(done)
    }
}

struct CoreThread {
    tid: i32,
    ppid: i32,
    gpr: Vec<u8>,
    fpr: Vec<u8>,
}

/// Everything the notes tell about the process
#[derive(Default)]
struct NoteFacts {
    threads: Vec<CoreThread>,
    crash: Option<CrashInfo>,
    pid: Option<i32>,
    comm: Option<String>,
    psargs: Option<Vec<u8>>,
    auxv: Option<Vec<u8>>,
    files: Vec<(u64, u64, u64, String)>,
    file_page_size: Option<u64>,
}

/// View of a crashed process through its core file
pub struct CoreFileView {
    pid: i32,
    threads: Vec<ThreadView>,
    mappings: Vec<MemoryMapping>,
    modules: Vec<ModuleMapping>,
    crash: Option<CrashInfo>,
    system: SystemDescription,
    proc_files: HashMap<ProcFile, Vec<u8>>,
    page_size: usize,
    errors: Vec<SoftError>,
    image: Arc<CoreImage>,
}

impl CoreFileView {
    /// Loads `core_path`, with `procfs_dir` holding a copy of the files of
    /// `/proc/<pid>` taken when the process crashed.
    pub fn new(
        core_path: &Path,
        procfs_dir: Option<&Path>,
        options: &DumpOptions,
    ) -> Result<Self, CoreError> {
        tracing::debug!("Reading {}", core_path.display());
        let data = std::fs::read(core_path)?;
        Self::from_bytes(data, procfs_dir, options)
    }

    /// Same as [`CoreFileView::new`] with the core already in memory.
    pub fn from_bytes(
        data: Vec<u8>,
        procfs_dir: Option<&Path>,
        options: &DumpOptions,
    ) -> Result<Self, CoreError> {
        let (ehdr, _) = Elf64_Ehdr::read_from_prefix(&data)
            .map_err(|_| CoreError::InvalidCoreFile("file too short for an ELF header"))?;
        validate_header(&ehdr)?;
        let machine = ehdr.e_machine;

        let phdrs = program_headers(&data, &ehdr)?;
        let mut segments = Vec::new();
        for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
            let available = (data.len() as u64).saturating_sub(phdr.p_offset);
            if phdr.p_filesz > available {
                tracing::warn!(
                    "Segment at 0x{:x} is truncated in the core file",
                    phdr.p_vaddr
                );
            }
            segments.push(LoadSegment {
                vaddr: phdr.p_vaddr,
                memsz: phdr.p_memsz,
                filesz: phdr.p_filesz.min(available),
                offset: phdr.p_offset,
                flags: phdr.p_flags,
            });
        }
        tracing::info!("Core file has {} memory segments", segments.len());

        let mut errors = Vec::new();
        let mut facts = {
            let mut facts = NoteFacts::default();
            for phdr in phdrs.iter().filter(|p| p.p_type == PT_NOTE) {
                let start = phdr.p_offset as usize;
                let notes = start
                    .checked_add(phdr.p_filesz as usize)
                    .and_then(|end| data.get(start..end))
                    .ok_or(CoreError::InvalidCoreFile("note segment out of bounds"))?;
                read_notes(notes, machine, &mut facts)?;
            }
            if facts.threads.is_empty() {
                return Err(CoreError::InvalidCoreFile("no NT_PRSTATUS note"));
            }
            facts
        };

        let pid = facts
            .pid
            .or_else(|| facts.threads.first().map(|t| t.tid))
            .unwrap_or(0);

        let mut proc_files = HashMap::new();
        if let Some(dir) = procfs_dir {
            for file in [
                ProcFile::Maps,
                ProcFile::CmdLine,
                ProcFile::Environ,
                ProcFile::Status,
                ProcFile::Auxv,
            ] {
                let path = copied_proc_path(dir, file.node())?;
                if let Some(data) = procfs::read_optional(&path, &mut errors) {
                    proc_files.insert(file, data);
                }
            }
            for file in [ProcFile::CpuInfo, ProcFile::LsbRelease] {
                if let Ok(data) = std::fs::read(copied_proc_path(dir, file.node())?) {
                    proc_files.insert(file, data);
                }
            }
        }
        if let Some(auxv) = facts.auxv.take() {
            proc_files.entry(ProcFile::Auxv).or_insert(auxv);
        }
        if let Some(psargs) = &facts.psargs {
            // psargs is space separated, cmdline is NUL separated.
            proc_files
                .entry(ProcFile::CmdLine)
                .or_insert_with(|| psargs.iter().map(|b| if *b == b' ' { 0 } else { *b }).collect());
        }

        let page_size = facts.file_page_size.unwrap_or(DEFAULT_PAGE_SIZE) as usize;
        let mappings = match proc_files.get(&ProcFile::Maps) {
            Some(maps) => procfs::parse_maps(&String::from_utf8_lossy(maps))?,
            None => {
                tracing::info!("No maps file, deriving the memory map from the core file");
                mappings_from_segments(&segments, &facts.files)
            }
        };

        let mut threads = Vec::with_capacity(facts.threads.len());
        for thread in &facts.threads {
            let context = match arch::context_from_registers(machine, &thread.gpr, &thread.fpr) {
                Ok(context) => context,
                Err(e) => {
                    errors.push(SoftError::ThreadRegisters {
                        tid: thread.tid,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let sp = context.stack_pointer();
            if sp == 0 {
                tracing::warn!("Thread {} has a null stack pointer, dropping it", thread.tid);
                errors.push(SoftError::NullStackPointer(thread.tid));
                continue;
            }
            threads.push(ThreadView {
                tid: thread.tid,
                ppid: thread.ppid,
                comm: facts.comm.clone().unwrap_or_default(),
                stack: stack_range(sp, &mappings, page_size as u64, options.stack_cap),
                context,
            });
        }

        let image = Arc::new(CoreImage { data, segments });
        let mut reader = CoreMemoryReader {
            image: image.clone(),
        };

        let auxv = proc_files
            .get(&ProcFile::Auxv)
            .map(|a| procfs::parse_auxv(a))
            .unwrap_or_default();
        let modules = procfs::identify_modules(
            &mappings,
            procfs::vdso_address(&auxv),
            options.mapped_root.as_deref(),
            page_size,
            &mut reader,
            &mut errors,
        );

        let system = procfs::host_system_description(
            arch::arch_of_machine(machine)?,
            proc_files.get(&ProcFile::CpuInfo).map(Vec::as_slice),
        );

        if let Some(crash) = &facts.crash {
            tracing::info!(
                "Thread {} crashed with signal {} at 0x{:x}",
                crash.tid,
                crash.signal,
                crash.address
            );
        }

        Ok(Self {
            pid,
            threads,
            mappings,
            modules,
            crash: facts.crash,
            system,
            proc_files,
            page_size,
            errors,
            image,
        })
    }

    /// A reader of the memory saved in the core file
    pub fn memory_reader(&self) -> CoreMemoryReader {
        CoreMemoryReader {
            image: self.image.clone(),
        }
    }
}

fn validate_header(ehdr: &Elf64_Ehdr) -> Result<(), CoreError> {
    if ehdr.e_ident[..4] != ELFMAG {
        return Err(CoreError::InvalidCoreFile("not an ELF file"));
    }
    if ehdr.e_ident[EI_CLASS] != ELFCLASS64 {
        return Err(CoreError::InvalidCoreFile("not a 64-bit ELF file"));
    }
    if ehdr.e_ident[EI_DATA] != ELFDATA2LSB {
        return Err(CoreError::InvalidCoreFile("not a little-endian ELF file"));
    }
    if ehdr.e_ident[EI_VERSION] != EV_CURRENT || ehdr.e_version != EV_CURRENT as u32 {
        return Err(CoreError::InvalidCoreFile("unsupported ELF version"));
    }
    if ehdr.e_type != ET_CORE {
        return Err(CoreError::InvalidCoreFile("not a core file"));
    }
    if ehdr.e_machine != EM_X86_64 && ehdr.e_machine != EM_AARCH64 {
        return Err(CoreError::UnsupportedMachine(ehdr.e_machine));
    }
    if ehdr.e_phentsize as usize != std::mem::size_of::<Elf64_Phdr>() {
        return Err(CoreError::InvalidCoreFile("unexpected program header size"));
    }
    Ok(())
}

fn program_headers(data: &[u8], ehdr: &Elf64_Ehdr) -> Result<Vec<Elf64_Phdr>, CoreError> {
    (0..ehdr.e_phnum as u64)
        .map(|i| {
            let offset = ehdr
                .e_phoff
                .checked_add(i * ehdr.e_phentsize as u64)
                .and_then(|o| usize::try_from(o).ok())
                .ok_or(CoreError::InvalidCoreFile("program header out of bounds"))?;
            let bytes = data
                .get(offset..)
                .ok_or(CoreError::InvalidCoreFile("program header out of bounds"))?;
            Elf64_Phdr::read_from_prefix(bytes)
                .map(|(phdr, _)| phdr)
                .map_err(|_| CoreError::InvalidCoreFile("program header out of bounds"))
        })
        .collect()
}

fn read_notes(notes: &[u8], machine: u16, facts: &mut NoteFacts) -> Result<(), CoreError> {
    let gpr_size = match machine {
        EM_X86_64 => 27 * 8,
        _ => 34 * 8,
    };

    for note in NoteIter::new(notes) {
        match (note.name, note.ntype) {
            (b"CORE", NT_PRSTATUS) => {
                let bad = || CoreError::InvalidCoreFile("truncated NT_PRSTATUS");
                let tid = u32_at(note.desc, PRSTATUS_PID).ok_or_else(bad)? as i32;
                let ppid = u32_at(note.desc, PRSTATUS_PPID).ok_or_else(bad)? as i32;
                let gpr = note
                    .desc
                    .get(PRSTATUS_REG..PRSTATUS_REG + gpr_size)
                    .ok_or_else(bad)?;
                tracing::debug!("Found thread {}", tid);

                // The kernel writes the crashing thread first.
                if facts.threads.is_empty() {
                    let signal = u16_at(note.desc, PRSTATUS_CURSIG).ok_or_else(bad)?;
                    facts.crash = Some(CrashInfo {
                        tid,
                        signal: signal as u32,
                        ..CrashInfo::default()
                    });
                }
                facts.threads.push(CoreThread {
                    tid,
                    ppid,
                    gpr: gpr.to_vec(),
                    fpr: Vec::new(),
                });
            }
            (b"CORE", NT_PRFPREG) => {
                if let Some(thread) = facts.threads.last_mut() {
                    thread.fpr = note.desc.to_vec();
                }
            }
            (b"CORE", NT_SIGINFO) => {
                // Only the crashing thread's siginfo matters.
                if facts.threads.len() == 1 {
                    if let Some(crash) = facts.crash.as_mut() {
                        apply_siginfo(crash, note.desc);
                    }
                }
            }
            (b"CORE", NT_PRPSINFO) => {
                facts.pid = u32_at(note.desc, PRPSINFO_PID).map(|p| p as i32);
                if let Some(fname) = note.desc.get(PRPSINFO_FNAME..PRPSINFO_PSARGS) {
                    facts.comm = Some(String::from_utf8_lossy(c_string(fname)).into_owned());
                }
                if let Some(args) = note
                    .desc
                    .get(PRPSINFO_PSARGS..PRPSINFO_PSARGS + PRPSINFO_PSARGS_LEN)
                {
                    facts.psargs = Some(c_string(args).to_vec());
                }
            }
            (b"CORE", NT_AUXV) => facts.auxv = Some(note.desc.to_vec()),
            (b"CORE", NT_FILE) => read_file_note(note.desc, facts),
            _ => {}
        }
    }

    Ok(())
}

/// Fills code, address and extra information from a `siginfo_t`.
fn apply_siginfo(crash: &mut CrashInfo, siginfo: &[u8]) {
    crash.code = u32_at(siginfo, SIGINFO_CODE).unwrap_or(0);
    let signal = crash.signal as i32;
    // Only these signals fill si_addr.
    if [
        libc::SIGILL,
        libc::SIGTRAP,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGSEGV,
        libc::SIGSYS,
    ]
    .contains(&signal)
    {
        crash.address = u64_at(siginfo, SIGINFO_ADDR).unwrap_or(0);
    }
    if signal == libc::SIGSYS {
        crash.extra = vec![
            u32_at(siginfo, SIGINFO_SYSCALL).unwrap_or(0) as u64,
            u32_at(siginfo, SIGINFO_ARCH).unwrap_or(0) as u64,
        ];
    }
}

fn read_file_note(desc: &[u8], facts: &mut NoteFacts) {
    let (Some(count), Some(page_size)) = (u64_at(desc, 0), u64_at(desc, 8)) else {
        return;
    };
    let table_end = (count as usize)
        .checked_mul(24)
        .and_then(|n| n.checked_add(16))
        .filter(|end| *end <= desc.len());
    let Some(table_end) = table_end else {
        tracing::warn!("Malformed NT_FILE note");
        return;
    };

    let mut names = desc[table_end..].split(|b| *b == 0);
    for i in 0..count as usize {
        let at = 16 + i * 24;
        let (Some(start), Some(end), Some(page)) =
            (u64_at(desc, at), u64_at(desc, at + 8), u64_at(desc, at + 16))
        else {
            break;
        };
        let Some(name) = names.next() else {
            break;
        };
        facts.files.push((
            start,
            end,
            page.saturating_mul(page_size),
            String::from_utf8_lossy(name).into_owned(),
        ));
    }
    facts.file_page_size = Some(page_size).filter(|p| p.is_power_of_two());
}

/// Rebuilds the memory map from the load segments and the mapped files note.
fn mappings_from_segments(
    segments: &[LoadSegment],
    files: &[(u64, u64, u64, String)],
) -> Vec<MemoryMapping> {
    let mut mappings: Vec<MemoryMapping> = segments
        .iter()
        .map(|s| {
            let file = files
                .iter()
                .find(|(start, end, _, _)| s.vaddr >= *start && s.vaddr < *end);
            MemoryMapping {
                begin: s.vaddr,
                end: s.vaddr.saturating_add(s.memsz),
                offset: file.map_or(0, |(start, _, offset, _)| offset + (s.vaddr - start)),
                protection: VaProtection {
                    is_private: true,
                    read: s.flags & PF_R != 0,
                    write: s.flags & PF_W != 0,
                    execute: s.flags & PF_X != 0,
                },
                mapped_file_name: file.map(|(_, _, _, name)| name.clone()),
            }
        })
        .collect();
    mappings.sort_by_key(|m| m.begin);
    mappings
}

impl ProcessInfoSource for CoreFileView {
    fn pid(&self) -> i32 {
        self.pid
    }
    fn threads(&self) -> &[ThreadView] {
        &self.threads
    }
    fn mappings(&self) -> &[MemoryMapping] {
        &self.mappings
    }
    fn modules(&self) -> &[ModuleMapping] {
        &self.modules
    }
    fn crash_info(&self) -> Option<&CrashInfo> {
        self.crash.as_ref()
    }
    fn system_info(&self) -> &SystemDescription {
        &self.system
    }
    fn proc_file(&self, file: ProcFile) -> Option<&[u8]> {
        self.proc_files.get(&file).map(Vec::as_slice)
    }
    fn page_size(&self) -> usize {
        self.page_size
    }
    fn enumeration_errors(&self) -> &[SoftError] {
        &self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> CoreImage {
        let mut data = vec![0_u8; 0x40];
        data.extend((0..0x20_u8).collect::<Vec<_>>());
        data.extend((0x80..0x90_u8).collect::<Vec<_>>());
        CoreImage {
            data,
            segments: vec![
                LoadSegment {
                    vaddr: 0x1000,
                    memsz: 0x1000,
                    filesz: 0x20,
                    offset: 0x40,
                    flags: PF_R | PF_W,
                },
                LoadSegment {
                    vaddr: 0x1020,
                    memsz: 0x10,
                    filesz: 0x10,
                    offset: 0x60,
                    flags: PF_R,
                },
            ],
        }
    }

    #[test]
    fn reads_span_adjacent_segments() {
        let mut reader = CoreMemoryReader {
            image: Arc::new(image()),
        };
        let mut buf = [0_u8; 8];
        reader.read_exact(0x101c, &mut buf).unwrap();
        assert_eq!(buf, [0x1c, 0x1d, 0x1e, 0x1f, 0x80, 0x81, 0x82, 0x83]);
    }

    #[test]
    fn unbacked_memory_is_not_padded() {
        let mut reader = CoreMemoryReader {
            image: Arc::new(image()),
        };
        let mut buf = [0_u8; 8];
        assert!(matches!(
            reader.read_process_memory(0x2000, &mut buf),
            Err(CoreError::MemoryRead { .. })
        ));
        assert!(matches!(
            reader.read_exact(0x102c, &mut buf),
            Err(CoreError::PartialRead { read: 4, .. })
        ));
    }

    #[test]
    fn sigsys_details() {
        let mut siginfo = vec![0_u8; 128];
        siginfo[SIGINFO_CODE] = 1;
        siginfo[SIGINFO_ADDR..SIGINFO_ADDR + 8].copy_from_slice(&0x4000_u64.to_le_bytes());
        siginfo[SIGINFO_SYSCALL] = 59;
        siginfo[SIGINFO_ARCH..SIGINFO_ARCH + 4].copy_from_slice(&0xc000_003e_u32.to_le_bytes());

        let mut crash = CrashInfo {
            signal: libc::SIGSYS as u32,
            ..CrashInfo::default()
        };
        apply_siginfo(&mut crash, &siginfo);
        assert_eq!(crash.address, 0x4000);
        assert_eq!(crash.extra, [59, 0xc000_003e]);

        let mut abort = CrashInfo {
            signal: libc::SIGABRT as u32,
            ..CrashInfo::default()
        };
        apply_siginfo(&mut abort, &siginfo);
        assert_eq!(abort.address, 0);
        assert!(abort.extra.is_empty());
    }

    #[test]
    fn rejects_non_core_files() {
        let options = DumpOptions::default();
        assert!(CoreFileView::from_bytes(vec![0; 16], None, &options).is_err());
        let mut ehdr = vec![0_u8; 64];
        ehdr[..4].copy_from_slice(&ELFMAG);
        assert!(matches!(
            CoreFileView::from_bytes(ehdr, None, &options),
            Err(CoreError::InvalidCoreFile(_))
        ));
    }
}
