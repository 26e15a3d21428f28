// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::Minidump;
use crate::format::StreamType;
use std::io::Write;

impl Minidump {
    /// Dumps every stream in human-readable form.
    ///
    /// Returns the number of core streams (thread, module and memory lists,
    /// system and misc info) that are missing or unreadable.
    pub fn print<W: Write>(&self, out: &mut W) -> std::io::Result<usize> {
        let mut errors = 0;

        writeln!(out, "MDRawHeader")?;
        writeln!(out, "  version            = 0x{:x}", self.version)?;
        writeln!(out, "  stream_count       = {}", self.directory.len())?;
        writeln!(out, "  time_date_stamp    = 0x{:x}", self.time_date_stamp)?;
        writeln!(out, "  flags              = 0x{:x}", self.flags)?;
        writeln!(out, "  endian             = {:?}", self.endian)?;
        writeln!(out)?;

        for (i, entry) in self.directory.iter().enumerate() {
            let name = StreamType::from_raw(entry.stream_type).map_or("unknown", StreamType::name);
            writeln!(out, "mDirectory[{i}]")?;
            writeln!(out, "  stream_type        = 0x{:x} ({name})", entry.stream_type)?;
            writeln!(out, "  location.data_size = {}", entry.size)?;
            writeln!(out, "  location.rva       = 0x{:x}", entry.rva)?;
        }
        writeln!(out)?;

        match self.get_thread_list() {
            Ok(list) => {
                writeln!(out, "MinidumpThreadList")?;
                writeln!(out, "  thread_count = {}", list.threads.len())?;
                for (i, thread) in list.threads.iter().enumerate() {
                    writeln!(out, "thread[{i}]")?;
                    writeln!(out, "  thread_id   = 0x{:x}", thread.thread_id)?;
                    match &thread.stack {
                        Some(stack) => writeln!(
                            out,
                            "  stack       = 0x{:x} (0x{:x} bytes)",
                            stack.base_address,
                            stack.size()
                        )?,
                        None => writeln!(out, "  stack       = (null)")?,
                    }
                    match &thread.context {
                        Some(context) => {
                            writeln!(out, "  context     = {}", context.arch().name())?;
                            for name in context.register_names() {
                                if let Some(value) = context.get_register(name) {
                                    writeln!(out, "    {name:<8} = 0x{value:x}")?;
                                }
                            }
                        }
                        None => writeln!(out, "  context     = (null)")?,
                    }
                }
                writeln!(out)?;
            }
            Err(e) => {
                errors += 1;
                tracing::error!("Thread list: {e}");
            }
        }

        match self.get_module_list() {
            Ok(list) => {
                writeln!(out, "MinidumpModuleList")?;
                writeln!(out, "  module_count = {}", list.modules.len())?;
                for (i, module) in list.modules.iter().enumerate() {
                    writeln!(out, "module[{i}]")?;
                    writeln!(out, "  base_address     = 0x{:x}", module.base_address)?;
                    writeln!(out, "  size             = 0x{:x}", module.size)?;
                    writeln!(out, "  name             = \"{}\"", module.name)?;
                    writeln!(out, "  debug_file       = \"{}\"", module.debug_file)?;
                    writeln!(out, "  debug_identifier = \"{}\"", module.debug_identifier)?;
                    writeln!(out, "  code_identifier  = \"{}\"", module.code_identifier)?;
                }
                writeln!(out)?;
            }
            Err(e) => {
                errors += 1;
                tracing::error!("Module list: {e}");
            }
        }

        match self.get_memory_list() {
            Ok(list) => {
                writeln!(out, "MinidumpMemoryList")?;
                writeln!(out, "  region_count = {}", list.regions.len())?;
                for (i, region) in list.regions.iter().enumerate() {
                    writeln!(
                        out,
                        "region[{i}] = 0x{:x}..0x{:x}",
                        region.base_address,
                        region.end()
                    )?;
                }
                writeln!(out)?;
            }
            Err(e) => {
                errors += 1;
                tracing::error!("Memory list: {e}");
            }
        }

        match self.get_exception() {
            Ok(exception) => {
                writeln!(out, "MDException")?;
                writeln!(out, "  thread_id          = 0x{:x}", exception.thread_id)?;
                writeln!(out, "  exception_code     = 0x{:x}", exception.code)?;
                writeln!(out, "  exception_flags    = 0x{:x}", exception.flags)?;
                writeln!(out, "  exception_address  = 0x{:x}", exception.address)?;
                for (i, p) in exception.parameters.iter().enumerate() {
                    writeln!(out, "  exception_information[{i}] = 0x{p:x}")?;
                }
                writeln!(out)?;
            }
            Err(e) => tracing::info!("Exception: {e}"),
        }

        match self.get_system_info() {
            Ok(info) => {
                writeln!(out, "MDRawSystemInfo")?;
                writeln!(out, "  processor_architecture = {}", info.arch.name())?;
                writeln!(out, "  processor_level        = {}", info.processor_level)?;
                writeln!(out, "  processor_revision     = 0x{:x}", info.processor_revision)?;
                writeln!(out, "  number_of_processors   = {}", info.cpu_count)?;
                writeln!(
                    out,
                    "  os                     = {} {}.{}.{}",
                    info.os_name(),
                    info.major_version,
                    info.minor_version,
                    info.build_number
                )?;
                if let Some(csd) = &info.csd_version {
                    writeln!(out, "  csd_version            = \"{csd}\"")?;
                }
                if let Some(vendor) = &info.cpu_vendor {
                    writeln!(out, "  cpu.vendor_id          = \"{vendor}\"")?;
                }
                writeln!(out)?;
            }
            Err(e) => {
                errors += 1;
                tracing::error!("System info: {e}");
            }
        }

        match self.get_misc_info() {
            Ok(info) => {
                writeln!(out, "MDRawMiscInfo")?;
                writeln!(out, "  size_of_info = {}", info.size_of_info)?;
                writeln!(out, "  flags1       = 0x{:x}", info.flags1)?;
                match info.process_id {
                    Some(pid) => writeln!(out, "  process_id   = {pid}")?,
                    None => writeln!(out, "  process_id   = (invalid)")?,
                }
                writeln!(out)?;
            }
            Err(e) => {
                errors += 1;
                tracing::error!("Misc info: {e}");
            }
        }

        match self.get_breakpad_info() {
            Ok(info) => {
                writeln!(out, "MDRawBreakpadInfo")?;
                match info.dump_thread_id {
                    Some(tid) => writeln!(out, "  dump_thread_id       = 0x{tid:x}")?,
                    None => writeln!(out, "  dump_thread_id       = (invalid)")?,
                }
                match info.requesting_thread_id {
                    Some(tid) => writeln!(out, "  requesting_thread_id = 0x{tid:x}")?,
                    None => writeln!(out, "  requesting_thread_id = (invalid)")?,
                }
                writeln!(out)?;
            }
            Err(e) => tracing::info!("Breakpad info: {e}"),
        }

        for stream_type in [StreamType::LinuxCmdLine, StreamType::LinuxEnviron] {
            if let Ok(data) = self.get_linux_stream(stream_type) {
                writeln!(out, "String array stream {}:", stream_type.name())?;
                for (i, s) in data
                    .split(|b| *b == 0)
                    .filter(|s| !s.is_empty())
                    .enumerate()
                {
                    writeln!(out, "{i:2}: {}", String::from_utf8_lossy(s))?;
                }
                writeln!(out)?;
            }
        }
        for stream_type in [
            StreamType::LinuxLsbRelease,
            StreamType::LinuxProcStatus,
            StreamType::LinuxCpuInfo,
            StreamType::LinuxMaps,
        ] {
            if let Ok(data) = self.get_linux_stream(stream_type) {
                writeln!(out, "Raw stream {}:", stream_type.name())?;
                writeln!(out, "{}", String::from_utf8_lossy(data))?;
            }
        }

        Ok(errors)
    }
}
