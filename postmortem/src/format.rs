// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! On-disk layout of the minidump container.
//!
//! The structures mirror the fixed-width records of the format. They are laid
//! out without implicit padding so they can be written with [`IntoBytes`].

#![allow(non_camel_case_types, missing_docs)]

use serde::Serialize;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// "MDMP" read as a little-endian integer
pub const MD_HEADER_SIGNATURE: u32 = 0x504d_444d;
/// Format version stored in the low 16 bits of the header version
pub const MD_HEADER_VERSION: u32 = 0x0000_a793;

/// CodeView record holding an ELF build id, "BpEL"
pub const MD_CVINFOELF_SIGNATURE: u32 = 0x4270_454c;
/// CodeView record holding a PDB 7.0 GUID, "RSDS"
pub const MD_CVINFOPDB70_SIGNATURE: u32 = 0x5344_5352;

/// Exception code used when a dump was requested without a crash
pub const MD_EXCEPTION_CODE_LIN_DUMP_REQUESTED: u32 = 0xffff_ffff;

pub const MD_MISCINFO_FLAGS1_PROCESS_ID: u32 = 0x0000_0001;

pub const MD_BREAKPAD_INFO_VALID_DUMP_THREAD_ID: u32 = 1 << 0;
pub const MD_BREAKPAD_INFO_VALID_REQUESTING_THREAD_ID: u32 = 1 << 1;

pub const MD_OS_LINUX: u32 = 0x8201;

/// Maximum number of parameters an exception record holds
pub const MD_EXCEPTION_MAXIMUM_PARAMETERS: usize = 15;

/// Stream type tags of the directory
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StreamType {
    ThreadList = 3,
    ModuleList = 4,
    MemoryList = 5,
    Exception = 6,
    SystemInfo = 7,
    MiscInfo = 15,
    BreakpadInfo = 0x4767_0001,
    AssertionInfo = 0x4767_0002,
    LinuxCpuInfo = 0x4767_0003,
    LinuxProcStatus = 0x4767_0004,
    LinuxLsbRelease = 0x4767_0005,
    LinuxCmdLine = 0x4767_0006,
    LinuxEnviron = 0x4767_0007,
    LinuxAuxv = 0x4767_0008,
    LinuxMaps = 0x4767_0009,
    LinuxDsoDebug = 0x4767_000a,
}

impl StreamType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            3 => Self::ThreadList,
            4 => Self::ModuleList,
            5 => Self::MemoryList,
            6 => Self::Exception,
            7 => Self::SystemInfo,
            15 => Self::MiscInfo,
            0x4767_0001 => Self::BreakpadInfo,
            0x4767_0002 => Self::AssertionInfo,
            0x4767_0003 => Self::LinuxCpuInfo,
            0x4767_0004 => Self::LinuxProcStatus,
            0x4767_0005 => Self::LinuxLsbRelease,
            0x4767_0006 => Self::LinuxCmdLine,
            0x4767_0007 => Self::LinuxEnviron,
            0x4767_0008 => Self::LinuxAuxv,
            0x4767_0009 => Self::LinuxMaps,
            0x4767_000a => Self::LinuxDsoDebug,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ThreadList => "MD_THREAD_LIST_STREAM",
            Self::ModuleList => "MD_MODULE_LIST_STREAM",
            Self::MemoryList => "MD_MEMORY_LIST_STREAM",
            Self::Exception => "MD_EXCEPTION_STREAM",
            Self::SystemInfo => "MD_SYSTEM_INFO_STREAM",
            Self::MiscInfo => "MD_MISC_INFO_STREAM",
            Self::BreakpadInfo => "MD_BREAKPAD_INFO_STREAM",
            Self::AssertionInfo => "MD_ASSERTION_INFO_STREAM",
            Self::LinuxCpuInfo => "MD_LINUX_CPU_INFO",
            Self::LinuxProcStatus => "MD_LINUX_PROC_STATUS",
            Self::LinuxLsbRelease => "MD_LINUX_LSB_RELEASE",
            Self::LinuxCmdLine => "MD_LINUX_CMD_LINE",
            Self::LinuxEnviron => "MD_LINUX_ENVIRON",
            Self::LinuxAuxv => "MD_LINUX_AUXV",
            Self::LinuxMaps => "MD_LINUX_MAPS",
            Self::LinuxDsoDebug => "MD_LINUX_DSO_DEBUG",
        }
    }
}

/// Processor architecture recorded in the system info stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum CpuArch {
    X86,
    Amd64,
    Arm,
    Arm64,
    Mips,
    Mips64,
    Ppc,
    Ppc64,
    Sparc,
    Unknown(u16),
}

impl CpuArch {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::X86,
            1 => Self::Mips,
            3 => Self::Ppc,
            5 => Self::Arm,
            9 => Self::Amd64,
            12 | 0x8003 => Self::Arm64,
            0x8001 => Self::Sparc,
            0x8002 => Self::Ppc64,
            0x8004 => Self::Mips64,
            other => Self::Unknown(other),
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            Self::X86 => 0,
            Self::Mips => 1,
            Self::Ppc => 3,
            Self::Arm => 5,
            Self::Amd64 => 9,
            Self::Arm64 => 12,
            Self::Sparc => 0x8001,
            Self::Ppc64 => 0x8002,
            Self::Mips64 => 0x8004,
            Self::Unknown(raw) => raw,
        }
    }

    /// Size of a pointer on the target, in bytes
    pub fn pointer_width(self) -> usize {
        match self {
            Self::X86 | Self::Arm | Self::Mips | Self::Ppc | Self::Sparc => 4,
            _ => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::X86 => "x86",
            Self::Amd64 => "amd64",
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
            Self::Mips => "mips",
            Self::Mips64 => "mips64",
            Self::Ppc => "ppc",
            Self::Ppc64 => "ppc64",
            Self::Sparc => "sparc",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Context flag bits identifying the CPU family of a register context
pub mod context_flags {
    pub const MD_CONTEXT_X86: u32 = 0x0001_0000;
    pub const MD_CONTEXT_AMD64: u32 = 0x0010_0000;
    pub const MD_CONTEXT_ARM: u32 = 0x4000_0000;
    pub const MD_CONTEXT_ARM64: u32 = 0x0040_0000;
    pub const MD_CONTEXT_ARM64_OLD: u32 = 0x8000_0000;
    pub const MD_CONTEXT_MIPS: u32 = 0x0004_0000;
    pub const MD_CONTEXT_MIPS64: u32 = 0x0008_0000;
    pub const MD_CONTEXT_PPC: u32 = 0x2000_0000;
    pub const MD_CONTEXT_PPC64: u32 = 0x0100_0000;
    pub const MD_CONTEXT_SPARC: u32 = 0x1000_0000;

    pub const MD_CONTEXT_X86_FULL: u32 = MD_CONTEXT_X86 | 0x7;
    pub const MD_CONTEXT_AMD64_FULL: u32 = MD_CONTEXT_AMD64 | 0xb;
    pub const MD_CONTEXT_ARM_FULL: u32 = MD_CONTEXT_ARM | 0x6;
    pub const MD_CONTEXT_ARM64_FULL: u32 = MD_CONTEXT_ARM64 | 0x7;
    pub const MD_CONTEXT_MIPS_FULL: u32 = MD_CONTEXT_MIPS | 0x6;
    pub const MD_CONTEXT_MIPS64_FULL: u32 = MD_CONTEXT_MIPS64 | 0x6;
    pub const MD_CONTEXT_PPC_FULL: u32 = MD_CONTEXT_PPC | 0x7;
    pub const MD_CONTEXT_PPC64_FULL: u32 = MD_CONTEXT_PPC64 | 0x7;
    pub const MD_CONTEXT_SPARC_FULL: u32 = MD_CONTEXT_SPARC | 0x3;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MDRawHeader {
    pub signature: u32,
    pub version: u32,
    pub stream_count: u32,
    pub stream_directory_rva: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
    pub flags: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MDLocationDescriptor {
    pub data_size: u32,
    pub rva: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MDRawDirectory {
    pub stream_type: u32,
    pub location: MDLocationDescriptor,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MDMemoryDescriptor {
    pub start_of_memory_range: u64,
    pub memory: MDLocationDescriptor,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MDRawThread {
    pub thread_id: u32,
    pub suspend_count: u32,
    pub priority_class: u32,
    pub priority: u32,
    pub teb: u64,
    pub stack: MDMemoryDescriptor,
    pub thread_context: MDLocationDescriptor,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MDVSFixedFileInfo {
    pub signature: u32,
    pub struct_version: u32,
    pub file_version_hi: u32,
    pub file_version_lo: u32,
    pub product_version_hi: u32,
    pub product_version_lo: u32,
    pub file_flags_mask: u32,
    pub file_flags: u32,
    pub file_os: u32,
    pub file_type: u32,
    pub file_subtype: u32,
    pub file_date_hi: u32,
    pub file_date_lo: u32,
}

/// A module record, 108 bytes without trailing alignment
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MDRawModule {
    pub base_of_image: u64,
    pub size_of_image: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
    pub module_name_rva: u32,
    pub version_info: MDVSFixedFileInfo,
    pub cv_record: MDLocationDescriptor,
    pub misc_record: MDLocationDescriptor,
    pub reserved0: [u32; 2],
    pub reserved1: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MDException {
    pub exception_code: u32,
    pub exception_flags: u32,
    pub exception_record: u64,
    pub exception_address: u64,
    pub number_parameters: u32,
    pub __align: u32,
    pub exception_information: [u64; MD_EXCEPTION_MAXIMUM_PARAMETERS],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MDRawExceptionStream {
    pub thread_id: u32,
    pub __align: u32,
    pub exception_record: MDException,
    pub thread_context: MDLocationDescriptor,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MDRawSystemInfo {
    pub processor_architecture: u16,
    pub processor_level: u16,
    pub processor_revision: u16,
    pub number_of_processors: u8,
    pub product_type: u8,
    pub major_version: u32,
    pub minor_version: u32,
    pub build_number: u32,
    pub platform_id: u32,
    pub csd_version_rva: u32,
    pub suite_mask: u16,
    pub reserved2: u16,
    /// CPU information union; for x86 the first 12 bytes hold the vendor id
    pub cpu: [u8; 24],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MDRawMiscInfo {
    pub size_of_info: u32,
    pub flags1: u32,
    pub process_id: u32,
    pub process_create_time: u32,
    pub process_user_time: u32,
    pub process_kernel_time: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MDRawBreakpadInfo {
    pub validity: u32,
    pub dump_thread_id: u32,
    pub requesting_thread_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes() {
        assert_eq!(std::mem::size_of::<MDRawHeader>(), 32);
        assert_eq!(std::mem::size_of::<MDRawDirectory>(), 12);
        assert_eq!(std::mem::size_of::<MDMemoryDescriptor>(), 16);
        assert_eq!(std::mem::size_of::<MDRawThread>(), 48);
        assert_eq!(std::mem::size_of::<MDRawModule>(), 108);
        assert_eq!(std::mem::size_of::<MDRawExceptionStream>(), 168);
        assert_eq!(std::mem::size_of::<MDRawSystemInfo>(), 56);
        assert_eq!(std::mem::size_of::<MDRawMiscInfo>(), 24);
    }

    #[test]
    fn arch_codes() {
        for arch in [
            CpuArch::X86,
            CpuArch::Amd64,
            CpuArch::Arm,
            CpuArch::Arm64,
            CpuArch::Mips,
            CpuArch::Mips64,
            CpuArch::Ppc,
            CpuArch::Ppc64,
            CpuArch::Sparc,
        ] {
            assert_eq!(CpuArch::from_raw(arch.to_raw()), arch);
        }
        assert_eq!(CpuArch::from_raw(0x8003), CpuArch::Arm64);
        assert_eq!(CpuArch::Arm.pointer_width(), 4);
        assert_eq!(CpuArch::Ppc64.pointer_width(), 8);
    }
}
