// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{list_cursor, Minidump};
use crate::bytes::{ByteCursor, Endian};
use crate::context::CpuContext;
use crate::elf;
use crate::format::{
    CpuArch, MDLocationDescriptor, StreamType, MD_BREAKPAD_INFO_VALID_DUMP_THREAD_ID,
    MD_BREAKPAD_INFO_VALID_REQUESTING_THREAD_ID, MD_CVINFOELF_SIGNATURE, MD_CVINFOPDB70_SIGNATURE,
    MD_EXCEPTION_MAXIMUM_PARAMETERS, MD_MISCINFO_FLAGS1_PROCESS_ID,
};
use crate::ReadError;
use std::fmt::Write;

const THREAD_SIZE: usize = 48;
const MODULE_SIZE: usize = 108;
const MEMORY_DESCRIPTOR_SIZE: usize = 16;

fn location(cursor: &mut ByteCursor<'_>) -> Result<MDLocationDescriptor, ReadError> {
    Ok(MDLocationDescriptor {
        data_size: cursor.u32()?,
        rva: cursor.u32()?,
    })
}

/// A block of captured target memory
#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion<'a> {
    /// Address of the first byte
    pub base_address: u64,
    /// Captured contents
    pub bytes: &'a [u8],
    endian: Endian,
}

impl<'a> MemoryRegion<'a> {
    /// Creates a region over captured bytes.
    pub fn new(base_address: u64, bytes: &'a [u8], endian: Endian) -> Self {
        Self {
            base_address,
            bytes,
            endian,
        }
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// One past the last captured address
    pub fn end(&self) -> u64 {
        self.base_address.saturating_add(self.size())
    }

    /// Whether `address` was captured
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address < self.end()
    }

    fn slice(&self, address: u64, len: usize) -> Option<&'a [u8]> {
        let offset = usize::try_from(address.checked_sub(self.base_address)?).ok()?;
        self.bytes.get(offset..offset.checked_add(len)?)
    }

    /// Reads a `u32` at `address` in the target's byte order.
    pub fn read_u32(&self, address: u64) -> Option<u32> {
        self.slice(address, 4).map(|b| self.endian.read_u32(b))
    }

    /// Reads a `u64` at `address` in the target's byte order.
    pub fn read_u64(&self, address: u64) -> Option<u64> {
        self.slice(address, 8).map(|b| self.endian.read_u64(b))
    }

    /// Reads a pointer of `width` bytes.
    pub fn read_word(&self, address: u64, width: usize) -> Option<u64> {
        match width {
            4 => self.read_u32(address).map(u64::from),
            _ => self.read_u64(address),
        }
    }
}

/// A thread of the thread list
#[derive(Clone, Debug)]
pub struct MinidumpThread<'a> {
    /// Thread id
    pub thread_id: u32,
    /// Suspend count, zero on Linux
    pub suspend_count: u32,
    /// Priority class, zero on Linux
    pub priority_class: u32,
    /// Priority, zero on Linux
    pub priority: u32,
    /// Thread environment block address
    pub teb: u64,
    /// Captured stack, `None` when the stack is empty or out of bounds
    pub stack: Option<MemoryRegion<'a>>,
    /// Registers, `None` when the context could not be parsed
    pub context: Option<CpuContext>,
}

/// The thread list stream
#[derive(Clone, Debug, Default)]
pub struct ThreadList<'a> {
    /// Threads in stream order
    pub threads: Vec<MinidumpThread<'a>>,
}

impl ThreadList<'_> {
    /// Finds a thread by id.
    pub fn get_thread(&self, thread_id: u32) -> Option<&MinidumpThread<'_>> {
        self.threads.iter().find(|t| t.thread_id == thread_id)
    }
}

/// A module of the module list
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MinidumpModule {
    /// Load address
    pub base_address: u64,
    /// Size of the address range covered
    pub size: u64,
    /// Image checksum, zero on Linux
    pub checksum: u32,
    /// Image time stamp, zero on Linux
    pub time_date_stamp: u32,
    /// Path of the module in the target
    pub name: String,
    /// Name of the file its symbols are published under
    pub debug_file: String,
    /// Identifier its symbols are published under, empty when unknown
    pub debug_identifier: String,
    /// Build id in hex, empty when unknown
    pub code_identifier: String,
}

impl MinidumpModule {
    /// One past the last address of the module
    pub fn end(&self) -> u64 {
        self.base_address.saturating_add(self.size)
    }

    /// Whether `address` falls in the module
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address < self.end()
    }

    /// File name without directories
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// The module list stream
#[derive(Clone, Debug, Default)]
pub struct ModuleList {
    /// Modules in stream order
    pub modules: Vec<MinidumpModule>,
}

impl ModuleList {
    /// Finds the module holding `address`.
    pub fn module_at_address(&self, address: u64) -> Option<&MinidumpModule> {
        self.modules.iter().find(|m| m.contains(address))
    }
}

/// The memory list stream
#[derive(Clone, Debug, Default)]
pub struct MemoryList<'a> {
    /// Regions in stream order
    pub regions: Vec<MemoryRegion<'a>>,
}

impl<'a> MemoryList<'a> {
    /// Finds the region holding `address`.
    pub fn memory_at_address(&self, address: u64) -> Option<&MemoryRegion<'a>> {
        self.regions.iter().find(|r| r.contains(address))
    }
}

/// The exception stream
#[derive(Clone, Debug)]
pub struct MinidumpException {
    /// Thread that faulted or asked for the dump
    pub thread_id: u32,
    /// Signal number, or the dump requested marker
    pub code: u32,
    /// `si_code` of the signal
    pub flags: u32,
    /// Address of a nested exception record, unused on Linux
    pub record: u64,
    /// Faulting address
    pub address: u64,
    /// Machine-specific fault details
    pub parameters: Vec<u64>,
    /// Registers at the fault
    pub context: Option<CpuContext>,
}

/// The system info stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemInfo {
    /// CPU architecture of the target
    pub arch: CpuArch,
    /// CPU family
    pub processor_level: u16,
    /// CPU model and stepping
    pub processor_revision: u16,
    /// Number of CPUs
    pub cpu_count: u8,
    /// Product type, zero on Linux
    pub product_type: u8,
    /// OS version, major part
    pub major_version: u32,
    /// OS version, minor part
    pub minor_version: u32,
    /// OS build or patch level
    pub build_number: u32,
    /// OS family tag
    pub platform_id: u32,
    /// Free-form OS description
    pub csd_version: Option<String>,
    /// CPU vendor id, x86 only
    pub cpu_vendor: Option<String>,
}

impl SystemInfo {
    /// Name of the operating system family
    pub fn os_name(&self) -> &'static str {
        match self.platform_id {
            0 | 1 | 2 => "Windows",
            0x8000 => "Mac OS X",
            0x8001 => "iOS",
            0x8201 => "Linux",
            0x8202 => "Solaris",
            0x8203 => "Android",
            0x8204 => "PS3",
            0x8205 => "NaCl",
            0x8206 => "Fuchsia",
            _ => "unknown",
        }
    }
}

/// The misc info stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MiscInfo {
    /// Size of the stream as written
    pub size_of_info: u32,
    /// Which fields are valid
    pub flags1: u32,
    /// Process id, when recorded
    pub process_id: Option<u32>,
    /// Process start time
    pub process_create_time: u32,
    /// Seconds spent in user mode
    pub process_user_time: u32,
    /// Seconds spent in kernel mode
    pub process_kernel_time: u32,
}

/// The breakpad info stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakpadInfo {
    /// Thread that wrote the dump
    pub dump_thread_id: Option<u32>,
    /// Thread that crashed or asked for the dump
    pub requesting_thread_id: Option<u32>,
}

/// Formats a PDB 7.0 GUID and age the way symbol stores expect.
fn pdb70_identifier(guid: &[u8], age: u32, endian: Endian) -> String {
    let mut out = format!(
        "{:08X}{:04X}{:04X}",
        endian.read_u32(&guid[0..4]),
        endian.read_u16(&guid[4..6]),
        endian.read_u16(&guid[6..8])
    );
    for b in &guid[8..16] {
        let _ = write!(out, "{b:02X}");
    }
    let _ = write!(out, "{age:X}");
    out
}

impl Minidump {
    fn context_arch(&self) -> Option<CpuArch> {
        self.get_system_info().ok().map(|info| info.arch)
    }

    fn read_context(&self, location: MDLocationDescriptor, arch: Option<CpuArch>) -> Option<CpuContext> {
        let data = self.location(location).ok()?;
        match CpuContext::read(data, self.endian, arch) {
            Ok(context) => Some(context),
            Err(e) => {
                tracing::warn!("Context at 0x{:x}: {e}", location.rva);
                None
            }
        }
    }

    fn memory_region(&self, start: u64, location: MDLocationDescriptor) -> Option<MemoryRegion<'_>> {
        if location.data_size == 0 {
            return None;
        }
        match self.location(location) {
            Ok(bytes) => Some(MemoryRegion::new(start, bytes, self.endian)),
            Err(e) => {
                tracing::warn!("Memory at 0x{start:x}: {e}");
                None
            }
        }
    }

    /// The thread list, with contexts parsed for the recorded architecture.
    pub fn get_thread_list(&self) -> Result<ThreadList<'_>, ReadError> {
        let data = self.stream(StreamType::ThreadList)?;
        let (mut cursor, count) =
            list_cursor(data, self.endian, THREAD_SIZE, StreamType::ThreadList)?;
        let arch = self.context_arch();

        let mut threads = Vec::with_capacity(count);
        for _ in 0..count {
            let thread_id = cursor.u32()?;
            let suspend_count = cursor.u32()?;
            let priority_class = cursor.u32()?;
            let priority = cursor.u32()?;
            let teb = cursor.u64()?;
            let stack_start = cursor.u64()?;
            let stack = location(&mut cursor)?;
            let context = location(&mut cursor)?;
            threads.push(MinidumpThread {
                thread_id,
                suspend_count,
                priority_class,
                priority,
                teb,
                stack: self.memory_region(stack_start, stack),
                context: self.read_context(context, arch),
            });
        }
        Ok(ThreadList { threads })
    }

    fn module_identity(&self, name: &str, cv_record: MDLocationDescriptor) -> (String, String, String) {
        let file_name = name.rsplit('/').next().unwrap_or(name).to_string();
        let Ok(record) = self.location(cv_record) else {
            return (file_name, String::new(), String::new());
        };
        let mut cursor = ByteCursor::new(record, self.endian);
        match cursor.u32() {
            Ok(MD_CVINFOELF_SIGNATURE) => {
                let build_id = &record[4..];
                (
                    file_name,
                    elf::debug_identifier(build_id),
                    elf::code_identifier(build_id),
                )
            }
            Ok(MD_CVINFOPDB70_SIGNATURE) if record.len() >= 24 => {
                let age = self.endian.read_u32(&record[20..24]);
                let pdb_name: String = String::from_utf8_lossy(&record[24..])
                    .trim_end_matches('\0')
                    .to_string();
                let debug_file = pdb_name
                    .rsplit(['/', '\\'])
                    .next()
                    .filter(|n| !n.is_empty())
                    .map_or(file_name, str::to_string);
                (
                    debug_file,
                    pdb70_identifier(&record[4..20], age, self.endian),
                    String::new(),
                )
            }
            _ => (file_name, String::new(), String::new()),
        }
    }

    /// The module list with names and identifiers.
    pub fn get_module_list(&self) -> Result<ModuleList, ReadError> {
        let data = self.stream(StreamType::ModuleList)?;
        let (mut cursor, count) =
            list_cursor(data, self.endian, MODULE_SIZE, StreamType::ModuleList)?;

        let mut modules = Vec::with_capacity(count);
        for _ in 0..count {
            let base_address = cursor.u64()?;
            let size = u64::from(cursor.u32()?);
            let checksum = cursor.u32()?;
            let time_date_stamp = cursor.u32()?;
            let name_rva = cursor.u32()?;
            // Version info is not used on Linux.
            cursor.skip(13 * 4)?;
            let cv_record = location(&mut cursor)?;
            let _misc_record = location(&mut cursor)?;
            cursor.skip(16)?;

            let name = self.string_at(name_rva).unwrap_or_default();
            let (debug_file, debug_identifier, code_identifier) =
                self.module_identity(&name, cv_record);
            modules.push(MinidumpModule {
                base_address,
                size,
                checksum,
                time_date_stamp,
                name,
                debug_file,
                debug_identifier,
                code_identifier,
            });
        }
        Ok(ModuleList { modules })
    }

    /// The memory list.
    pub fn get_memory_list(&self) -> Result<MemoryList<'_>, ReadError> {
        let data = self.stream(StreamType::MemoryList)?;
        let (mut cursor, count) = list_cursor(
            data,
            self.endian,
            MEMORY_DESCRIPTOR_SIZE,
            StreamType::MemoryList,
        )?;

        let mut regions = Vec::with_capacity(count);
        for _ in 0..count {
            let start = cursor.u64()?;
            let memory = location(&mut cursor)?;
            if let Some(region) = self.memory_region(start, memory) {
                regions.push(region);
            }
        }
        Ok(MemoryList { regions })
    }

    /// The exception stream.
    pub fn get_exception(&self) -> Result<MinidumpException, ReadError> {
        let data = self.stream(StreamType::Exception)?;
        let mut cursor = ByteCursor::new(data, self.endian);
        let thread_id = cursor.u32()?;
        cursor.skip(4)?;
        let code = cursor.u32()?;
        let flags = cursor.u32()?;
        let record = cursor.u64()?;
        let address = cursor.u64()?;
        let count = cursor.u32()? as usize;
        cursor.skip(4)?;
        let information = cursor.u64_array::<MD_EXCEPTION_MAXIMUM_PARAMETERS>()?;
        let context = location(&mut cursor)?;

        Ok(MinidumpException {
            thread_id,
            code,
            flags,
            record,
            address,
            parameters: information[..count.min(MD_EXCEPTION_MAXIMUM_PARAMETERS)].to_vec(),
            context: self.read_context(context, self.context_arch()),
        })
    }

    /// The system info stream.
    pub fn get_system_info(&self) -> Result<SystemInfo, ReadError> {
        let data = self.stream(StreamType::SystemInfo)?;
        let mut cursor = ByteCursor::new(data, self.endian);
        let arch = CpuArch::from_raw(cursor.u16()?);
        let processor_level = cursor.u16()?;
        let processor_revision = cursor.u16()?;
        let cpu_count = cursor.u8()?;
        let product_type = cursor.u8()?;
        let major_version = cursor.u32()?;
        let minor_version = cursor.u32()?;
        let build_number = cursor.u32()?;
        let platform_id = cursor.u32()?;
        let csd_version_rva = cursor.u32()?;
        cursor.skip(4)?;
        let cpu = cursor.bytes(24)?;

        let cpu_vendor = matches!(arch, CpuArch::X86 | CpuArch::Amd64)
            .then(|| {
                let vendor = &cpu[..12];
                let len = vendor.iter().position(|b| *b == 0).unwrap_or(vendor.len());
                String::from_utf8_lossy(&vendor[..len]).into_owned()
            })
            .filter(|v| !v.is_empty());

        Ok(SystemInfo {
            arch,
            processor_level,
            processor_revision,
            cpu_count,
            product_type,
            major_version,
            minor_version,
            build_number,
            platform_id,
            csd_version: (csd_version_rva != 0)
                .then(|| self.string_at(csd_version_rva).ok())
                .flatten(),
            cpu_vendor,
        })
    }

    /// The misc info stream.
    pub fn get_misc_info(&self) -> Result<MiscInfo, ReadError> {
        let data = self.stream(StreamType::MiscInfo)?;
        let mut cursor = ByteCursor::new(data, self.endian);
        let size_of_info = cursor.u32()?;
        let flags1 = cursor.u32()?;
        let process_id = cursor.u32()?;
        Ok(MiscInfo {
            size_of_info,
            flags1,
            process_id: (flags1 & MD_MISCINFO_FLAGS1_PROCESS_ID != 0).then_some(process_id),
            process_create_time: cursor.u32()?,
            process_user_time: cursor.u32()?,
            process_kernel_time: cursor.u32()?,
        })
    }

    /// The breakpad info stream.
    pub fn get_breakpad_info(&self) -> Result<BreakpadInfo, ReadError> {
        let data = self.stream(StreamType::BreakpadInfo)?;
        let mut cursor = ByteCursor::new(data, self.endian);
        let validity = cursor.u32()?;
        let dump_thread_id = cursor.u32()?;
        let requesting_thread_id = cursor.u32()?;
        Ok(BreakpadInfo {
            dump_thread_id: (validity & MD_BREAKPAD_INFO_VALID_DUMP_THREAD_ID != 0)
                .then_some(dump_thread_id),
            requesting_thread_id: (validity & MD_BREAKPAD_INFO_VALID_REQUESTING_THREAD_ID != 0)
                .then_some(requesting_thread_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_reads_stay_inside() {
        let bytes = [1_u8, 0, 0, 0, 2, 0, 0, 0];
        let region = MemoryRegion::new(0x1000, &bytes, Endian::Little);
        assert_eq!(region.read_u32(0x1004), Some(2));
        assert_eq!(region.read_u64(0x1000), Some(0x2_0000_0001));
        assert_eq!(region.read_u32(0x1005), None);
        assert_eq!(region.read_u32(0xfff), None);
        assert_eq!(region.read_word(0x1000, 4), Some(1));
        assert!(!region.contains(0x1008));
    }

    #[test]
    fn pdb_identifiers() {
        let guid: Vec<u8> = (1..=16).collect();
        assert_eq!(
            pdb70_identifier(&guid, 2, Endian::Little),
            "0403020106050807090A0B0C0D0E0F102"
        );
    }
}
