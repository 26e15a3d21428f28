// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A Rust library for capturing processes into minidumps and analyzing them
//! after the fact.
//!
//! The capture half suspends a live Linux process (or reads a core file) and
//! serializes its threads, modules and memory with [`MinidumpBuilder`]. The
//! analysis half reads minidumps from any host with [`Minidump`], resolves
//! addresses through Breakpad symbol files with [`Symbolizer`] and rebuilds
//! call stacks with [`process_minidump`].

#![warn(missing_docs)]

#[cfg(target_os = "linux")]
mod arch;
mod bytes;
mod context;
mod elf;
mod error;
mod exploitability;
mod format;
#[cfg(target_os = "linux")]
mod linux;
mod processor;
mod reader;
mod snapshot;
mod stackwalker;
mod symbols;
mod writer;

pub use bytes::Endian;
pub use context::{
    ContextAmd64, ContextArm, ContextArm64, ContextMips, ContextPpc, ContextPpc64, ContextSparc,
    ContextX86, CpuContext,
};
pub use error::{CoreError, ProcessError, ReadError, SoftError, SymbolError};
pub use exploitability::{classify, Exploitability, ExploitabilityOptions, Verdict};
pub use format::{CpuArch, StreamType};
#[cfg(target_os = "linux")]
pub use linux::{CoreFileView, CoreMemoryReader, ProcessView};
pub use processor::{
    crash_reason, process_minidump, signal_name, CrashSummary, ModuleState, ProcessState,
    ProcessorOptions, SystemSummary, ThreadState,
};
pub use reader::{
    BreakpadInfo, DirectoryEntry, MemoryList, MemoryRegion, Minidump, MinidumpException,
    MinidumpModule, MinidumpThread, MiscInfo, ModuleList, SystemInfo, ThreadList,
};
pub use snapshot::{
    CrashInfo, MemoryMapping, MemoryRange, ModuleMapping, ProcFile, SystemDescription,
    ThreadView, VaProtection, DEFAULT_STACK_CAP,
};
pub use stackwalker::{
    walk_stack, CallStack, FrameTrust, StackFrame, WalkStatus, WalkerOptions,
};
pub use symbols::{
    SimpleSymbolSupplier, StringSymbolSupplier, SymbolFile, SymbolFrame, SymbolInfo,
    SymbolStatus, SymbolSupplier, Symbolizer,
};
#[cfg(target_os = "linux")]
pub use writer::write_minidump;
pub use writer::{DumpOptions, DumpSummary, MinidumpBuilder};

/// Trait for those able to read the process virtual memory.
pub trait ReadProcessMemory {
    /// Read process memory into `buf` starting at the virtual address `base`,
    /// and returns the number of bytes and or the error.
    fn read_process_memory(&mut self, base: usize, buf: &mut [u8]) -> Result<usize, CoreError>;

    /// Fills all of `buf` from `address`, failing on short reads.
    fn read_exact(&mut self, address: u64, buf: &mut [u8]) -> Result<(), CoreError> {
        let len = buf.len();
        let base = usize::try_from(address).map_err(|_| CoreError::MemoryRead { address, len })?;
        let read = self.read_process_memory(base, buf)?;
        if read < len {
            return Err(CoreError::PartialRead { address, len, read });
        }
        Ok(())
    }
}

/// This trait provides abstraction for the [`MinidumpBuilder`] source information
///
/// By implementing this trait one can use the minidump output logic to capture
/// any process-like source of information, such as an emulator or a snapshot
/// taken by other means.
///
/// Example:
///
/// ```rust
/// use postmortem::{
///     CoreError, CpuArch, CpuContext, MemoryMapping, MemoryRange, Minidump, MinidumpBuilder,
///     ModuleMapping, ProcessInfoSource, ReadProcessMemory, SystemDescription, ThreadView,
///     VaProtection,
/// };
///
/// struct CustomSource {
///     threads: Vec<ThreadView>,
///     mappings: Vec<MemoryMapping>,
///     modules: Vec<ModuleMapping>,
///     system: SystemDescription,
/// }
///
/// impl ProcessInfoSource for CustomSource {
///     fn pid(&self) -> i32 {
///         42
///     }
///     fn threads(&self) -> &[ThreadView] {
///         &self.threads
///     }
///     fn mappings(&self) -> &[MemoryMapping] {
///         &self.mappings
///     }
///     fn modules(&self) -> &[ModuleMapping] {
///         &self.modules
///     }
///     fn system_info(&self) -> &SystemDescription {
///         &self.system
///     }
///     fn page_size(&self) -> usize {
///         4096
///     }
/// }
///
/// // Memory of the example process: one page of stack filled with 0xaa
/// struct CustomReader;
///
/// impl ReadProcessMemory for CustomReader {
///     fn read_process_memory(&mut self, base: usize, buf: &mut [u8]) -> Result<usize, CoreError> {
///         if !(0x7000..0x8000).contains(&base) {
///             return Err(CoreError::MemoryRead { address: base as u64, len: buf.len() });
///         }
///         let n = buf.len().min(0x8000 - base);
///         buf[..n].fill(0xaa);
///         Ok(n)
///     }
/// }
///
/// let mut context = CpuContext::empty(CpuArch::Amd64).unwrap();
/// context.set_instruction_pointer(0x40_1000);
/// context.set_stack_pointer(0x7800);
///
/// let source = CustomSource {
///     threads: vec![ThreadView {
///         tid: 42,
///         ppid: 1,
///         comm: "example".to_string(),
///         context,
///         stack: Some(MemoryRange::new(0x7800, 0x800)),
///     }],
///     mappings: vec![MemoryMapping {
///         begin: 0x7000,
///         end: 0x8000,
///         offset: 0,
///         protection: VaProtection { is_private: true, read: true, write: true, execute: false },
///         mapped_file_name: Some("[stack]".to_string()),
///     }],
///     modules: vec![ModuleMapping {
///         name: "/usr/bin/example".to_string(),
///         begin: 0x40_0000,
///         size: 0x1_0000,
///         build_id: vec![0x11; 20],
///     }],
///     system: SystemDescription::new(CpuArch::Amd64),
/// };
///
/// let mut builder = MinidumpBuilder::from_source(Box::new(source), Box::new(CustomReader));
/// let mut data = Vec::new();
/// let summary = builder.write(&mut data).unwrap();
/// assert_eq!(summary.error_count(), 0);
///
/// let dump = Minidump::read(data).unwrap();
/// let threads = dump.get_thread_list().unwrap();
/// assert_eq!(threads.threads[0].thread_id, 42);
/// ```
pub trait ProcessInfoSource {
    /// Retrieves the PID of the process
    fn pid(&self) -> i32;
    /// Retrieves a slice of [`ThreadView`] structures that describe the
    /// threads at the time of the capture
    fn threads(&self) -> &[ThreadView];
    /// Retrieves the memory map of the process
    fn mappings(&self) -> &[MemoryMapping];
    /// Retrieves the binary images loaded in the process
    fn modules(&self) -> &[ModuleMapping];
    /// The fault that stopped the process, if any
    fn crash_info(&self) -> Option<&CrashInfo> {
        None
    }
    /// Retrieves the operating system and CPU description
    fn system_info(&self) -> &SystemDescription;
    /// Contents of a file describing the process, such as its command line
    fn proc_file(&self, _file: ProcFile) -> Option<&[u8]> {
        None
    }
    /// Retrieves the page size of the target
    fn page_size(&self) -> usize;
    /// Recoverable failures met while enumerating the process
    fn enumeration_errors(&self) -> &[SoftError] {
        &[]
    }
}
