// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Point-in-time description of a target process.

use crate::context::CpuContext;
use crate::elf;
use crate::format::{CpuArch, StreamType};

/// Capture at most this much stack per thread by default
pub const DEFAULT_STACK_CAP: u64 = 32 * 1024;

/// A range of the target's address space
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryRange {
    /// First address
    pub start: u64,
    /// Length in bytes
    pub len: u64,
}

impl MemoryRange {
    /// Creates a new range
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// One past the last address, saturating
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.len)
    }

    /// Whether `address` falls in the range
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end()
    }
}

/// Access rights of a mapping
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VaProtection {
    /// Private (copy-on-write) rather than shared
    pub is_private: bool,
    /// Readable
    pub read: bool,
    /// Writable
    pub write: bool,
    /// Executable
    pub execute: bool,
}

/// One line of the target's memory map
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryMapping {
    /// Start address
    pub begin: u64,
    /// End address, exclusive
    pub end: u64,
    /// Offset into the mapped file
    pub offset: u64,
    /// Access rights
    pub protection: VaProtection,
    /// Backing file or pseudo file such as `[stack]`, `None` when anonymous
    pub mapped_file_name: Option<String>,
}

impl MemoryMapping {
    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    /// Whether `address` falls in the mapping
    pub fn contains(&self, address: u64) -> bool {
        address >= self.begin && address < self.end
    }
}

/// A loaded binary image
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleMapping {
    /// Path of the image, or a well-known name such as `linux-gate.so`
    pub name: String,
    /// Load address
    pub begin: u64,
    /// Size of the address range covered
    pub size: u64,
    /// GNU build id, or a hash of the code when the image carries none
    pub build_id: Vec<u8>,
}

impl ModuleMapping {
    /// One past the last address, saturating
    pub fn end(&self) -> u64 {
        self.begin.saturating_add(self.size)
    }

    /// Whether `address` falls in the module
    pub fn contains(&self, address: u64) -> bool {
        address >= self.begin && address < self.end()
    }

    /// Whether the module covers all of `other`
    pub fn covers(&self, other: &ModuleMapping) -> bool {
        other.begin >= self.begin && other.end() <= self.end()
    }

    /// Identifier symbol files are published under
    pub fn debug_identifier(&self) -> String {
        elf::debug_identifier(&self.build_id)
    }

    /// Full build id as hex
    pub fn code_identifier(&self) -> String {
        elf::code_identifier(&self.build_id)
    }

    /// File name without directories
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// A thread of the target at capture time
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadView {
    /// Thread id
    pub tid: i32,
    /// Parent process id
    pub ppid: i32,
    /// Command name of the thread
    pub comm: String,
    /// Registers
    pub context: CpuContext,
    /// Stack memory worth preserving, `None` when the stack pointer is not
    /// inside any mapping
    pub stack: Option<MemoryRange>,
}

/// The fault that terminated the target
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CrashInfo {
    /// Thread that received the signal
    pub tid: i32,
    /// Signal number
    pub signal: u32,
    /// `si_code` of the signal
    pub code: u32,
    /// Faulting address, zero when the signal has none
    pub address: u64,
    /// Machine-specific fault details stored as exception parameters
    pub extra: Vec<u64>,
}

/// Operating system and CPU of the capturing host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemDescription {
    /// Architecture of the target
    pub arch: CpuArch,
    /// CPU family
    pub processor_level: u16,
    /// Model and stepping
    pub processor_revision: u16,
    /// Number of CPUs, saturated at 255
    pub cpu_count: u8,
    /// Kernel version, major part
    pub major_version: u32,
    /// Kernel version, minor part
    pub minor_version: u32,
    /// Kernel version, patch level
    pub build_number: u32,
    /// Full `uname` description
    pub csd_version: String,
    /// CPU vendor id (x86 only)
    pub cpu_vendor: Option<[u8; 12]>,
}

impl SystemDescription {
    /// A description knowing only the architecture
    pub fn new(arch: CpuArch) -> Self {
        Self {
            arch,
            processor_level: 0,
            processor_revision: 0,
            cpu_count: 1,
            major_version: 0,
            minor_version: 0,
            build_number: 0,
            csd_version: String::new(),
            cpu_vendor: None,
        }
    }

    /// Fills the CPU fields from the text of `/proc/cpuinfo`.
    pub fn apply_cpuinfo(&mut self, cpuinfo: &str) {
        let mut count = 0_usize;
        let mut model = 0_u16;
        let mut stepping = 0_u16;
        for line in cpuinfo.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "processor" => count += 1,
                "vendor_id" if self.cpu_vendor.is_none() => {
                    let mut vendor = [0_u8; 12];
                    let n = value.len().min(12);
                    vendor[..n].copy_from_slice(&value.as_bytes()[..n]);
                    self.cpu_vendor = Some(vendor);
                }
                "cpu family" => self.processor_level = value.parse().unwrap_or(0),
                "model" => model = value.parse().unwrap_or(0),
                "stepping" => stepping = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        if count > 0 {
            self.cpu_count = count.min(u8::MAX as usize) as u8;
        }
        self.processor_revision = (model << 8) | (stepping & 0xff);
    }

    /// Fills the version fields from a kernel release such as `6.1.0-13-amd64`.
    pub fn apply_kernel_release(&mut self, release: &str) {
        let mut parts = release.split('.').map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().unwrap_or(0)
        });
        self.major_version = parts.next().unwrap_or(0);
        self.minor_version = parts.next().unwrap_or(0);
        self.build_number = parts.next().unwrap_or(0);
    }
}

/// Text files describing the target that are copied into dumps verbatim
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcFile {
    /// `/proc/<pid>/cmdline`
    CmdLine,
    /// `/proc/<pid>/environ`
    Environ,
    /// `/proc/<pid>/status`
    Status,
    /// `/proc/<pid>/maps`
    Maps,
    /// `/proc/<pid>/auxv`
    Auxv,
    /// `/proc/cpuinfo`
    CpuInfo,
    /// `/etc/lsb-release`
    LsbRelease,
}

impl ProcFile {
    /// Every file, in the order their streams are written
    pub const ALL: [ProcFile; 7] = [
        ProcFile::CmdLine,
        ProcFile::Environ,
        ProcFile::Status,
        ProcFile::LsbRelease,
        ProcFile::CpuInfo,
        ProcFile::Auxv,
        ProcFile::Maps,
    ];

    /// Node name under the process directory
    pub fn node(self) -> &'static str {
        match self {
            ProcFile::CmdLine => "cmdline",
            ProcFile::Environ => "environ",
            ProcFile::Status => "status",
            ProcFile::Maps => "maps",
            ProcFile::Auxv => "auxv",
            ProcFile::CpuInfo => "cpuinfo",
            ProcFile::LsbRelease => "lsb-release",
        }
    }

    /// Stream the file is stored in
    pub fn stream_type(self) -> StreamType {
        match self {
            ProcFile::CmdLine => StreamType::LinuxCmdLine,
            ProcFile::Environ => StreamType::LinuxEnviron,
            ProcFile::Status => StreamType::LinuxProcStatus,
            ProcFile::Maps => StreamType::LinuxMaps,
            ProcFile::Auxv => StreamType::LinuxAuxv,
            ProcFile::CpuInfo => StreamType::LinuxCpuInfo,
            ProcFile::LsbRelease => StreamType::LinuxLsbRelease,
        }
    }
}

/// Finds the stack memory worth keeping for a stack pointer.
///
/// The range starts at the page holding `sp` and runs to the end of its
/// mapping, at most `cap` bytes.
pub fn stack_range(
    sp: u64,
    mappings: &[MemoryMapping],
    page_size: u64,
    cap: u64,
) -> Option<MemoryRange> {
    let page_mask = !(page_size.max(1) - 1);
    let start = sp & page_mask;
    let mapping = mappings.iter().find(|m| m.contains(start))?;
    let len = (mapping.end - start).min(cap);
    (len > 0).then_some(MemoryRange::new(start, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(begin: u64, end: u64) -> MemoryMapping {
        MemoryMapping {
            begin,
            end,
            offset: 0,
            protection: VaProtection {
                is_private: true,
                read: true,
                write: true,
                execute: false,
            },
            mapped_file_name: Some("[stack]".to_string()),
        }
    }

    #[test]
    fn stack_is_page_aligned_and_capped() {
        let maps = [mapping(0x7000_0000, 0x7010_0000)];
        let r = stack_range(0x7000_1234, &maps, 0x1000, DEFAULT_STACK_CAP).unwrap();
        assert_eq!(r, MemoryRange::new(0x7000_1000, 0x8000));

        let r = stack_range(0x700f_f010, &maps, 0x1000, DEFAULT_STACK_CAP).unwrap();
        assert_eq!(r, MemoryRange::new(0x700f_f000, 0x1000));

        assert!(stack_range(0x1000, &maps, 0x1000, DEFAULT_STACK_CAP).is_none());
    }

    #[test]
    fn cpuinfo_fields() {
        let mut sys = SystemDescription::new(CpuArch::Amd64);
        sys.apply_cpuinfo(
            "processor\t: 0\nvendor_id\t: GenuineIntel\ncpu family\t: 6\nmodel\t\t: 158\n\
             stepping\t: 10\n\nprocessor\t: 1\nvendor_id\t: GenuineIntel\n",
        );
        assert_eq!(sys.cpu_count, 2);
        assert_eq!(&sys.cpu_vendor.unwrap(), b"GenuineIntel");
        assert_eq!(sys.processor_level, 6);
        assert_eq!(sys.processor_revision, (158 << 8) | 10);
    }

    #[test]
    fn kernel_release() {
        let mut sys = SystemDescription::new(CpuArch::Arm64);
        sys.apply_kernel_release("6.1.0-13-amd64");
        assert_eq!(
            (sys.major_version, sys.minor_version, sys.build_number),
            (6, 1, 0)
        );
    }

    #[test]
    fn module_identifiers() {
        let module = ModuleMapping {
            name: "/usr/lib/libc.so.6".to_string(),
            begin: 0x1000,
            size: 0x2000,
            build_id: (0..20).collect(),
        };
        assert_eq!(module.file_name(), "libc.so.6");
        assert_eq!(module.debug_identifier(), "030201000504070608090A0B0C0D0E0F0");
        assert_eq!(module.code_identifier().len(), 40);
        assert!(module.contains(0x2fff));
        assert!(!module.contains(0x3000));
    }
}
