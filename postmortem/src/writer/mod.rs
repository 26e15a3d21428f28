// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Serializes a process snapshot into a minidump.

mod buffer;
mod streams;

use buffer::{DumpBuf, MemoryPool};
use streams::{ExceptionRecord, ThreadRecord};

use crate::bytes::Endian;
use crate::context::CpuContext;
use crate::format::{
    MDLocationDescriptor, MDMemoryDescriptor, MDRawDirectory, MDRawHeader, StreamType,
    MD_EXCEPTION_CODE_LIN_DUMP_REQUESTED, MD_HEADER_SIGNATURE, MD_HEADER_VERSION,
};
use crate::snapshot::{
    stack_range, CrashInfo, MemoryRange, ModuleMapping, ProcFile, DEFAULT_STACK_CAP,
};
use crate::{CoreError, ProcessInfoSource, ReadProcessMemory, SoftError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use zerocopy::IntoBytes;

/// Bytes of code captured around the crashing instruction
const CRASH_WINDOW: u64 = 256;

/// Streams that are always written
const FIXED_STREAMS: usize = 6;

/// Knobs of a capture.
#[derive(Clone, Debug)]
pub struct DumpOptions {
    /// Upper bound of stack memory kept per thread
    pub stack_cap: u64,
    /// Additional memory to store in the memory list
    pub extra_ranges: Vec<MemoryRange>,
    /// Crash to record, overriding whatever the source knows
    pub crash: Option<CrashInfo>,
    /// Registers of the crashing thread at the fault, replacing the
    /// registers the thread has at capture time
    pub crash_context: Option<CpuContext>,
    /// Thread that asked for the dump when there is no crash
    pub requesting_thread: Option<i32>,
    /// Modules known to the caller; enumerated modules inside one are dropped
    pub user_mappings: Vec<ModuleMapping>,
    /// Mount point of the proc file system
    pub procfs_root: PathBuf,
    /// Prefix under which module files are opened
    pub mapped_root: Option<PathBuf>,
    /// Store the code around the crashing instruction
    pub capture_crash_window: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            stack_cap: DEFAULT_STACK_CAP,
            extra_ranges: Vec::new(),
            crash: None,
            crash_context: None,
            requesting_thread: None,
            user_mappings: Vec::new(),
            procfs_root: PathBuf::from("/proc"),
            mapped_root: None,
            capture_crash_window: true,
        }
    }
}

/// Outcome of a successful capture.
#[derive(Debug, Default)]
pub struct DumpSummary {
    /// Size of the minidump
    pub bytes_written: usize,
    /// Everything that went wrong without stopping the capture
    pub soft_errors: Vec<SoftError>,
}

impl DumpSummary {
    /// Number of recoverable failures
    pub fn error_count(&self) -> usize {
        self.soft_errors.len()
    }
}

/// Builds a minidump from any [`ProcessInfoSource`].
pub struct MinidumpBuilder {
    source: Box<dyn ProcessInfoSource>,
    reader: Box<dyn ReadProcessMemory>,
    options: DumpOptions,
}

impl MinidumpBuilder {
    /// Suspends the threads of the live process `pid`.
    ///
    /// The threads are resumed when the builder is dropped.
    #[cfg(target_os = "linux")]
    pub fn new(pid: i32) -> Result<Self, CoreError> {
        Self::with_options(pid, DumpOptions::default())
    }

    /// Suspends the threads of the live process `pid` using `options`.
    #[cfg(target_os = "linux")]
    pub fn with_options(pid: i32, options: DumpOptions) -> Result<Self, CoreError> {
        let view = crate::linux::ProcessView::new(pid, &options)?;
        let reader = view.create_memory_reader()?;
        Ok(Self {
            source: Box::new(view),
            reader,
            options,
        })
    }

    /// Reads the core file at `core`, with an optional copy of the process'
    /// proc directory.
    #[cfg(target_os = "linux")]
    pub fn from_core_file(
        core: &Path,
        procfs_dir: Option<&Path>,
        options: DumpOptions,
    ) -> Result<Self, CoreError> {
        let view = crate::linux::CoreFileView::new(core, procfs_dir, &options)?;
        let reader = view.memory_reader();
        Ok(Self {
            source: Box::new(view),
            reader: Box::new(reader),
            options,
        })
    }

    /// Uses a caller-provided description of the process.
    pub fn from_source(
        source: Box<dyn ProcessInfoSource>,
        reader: Box<dyn ReadProcessMemory>,
    ) -> Self {
        Self {
            source,
            reader,
            options: DumpOptions::default(),
        }
    }

    /// Replaces the options used when writing.
    ///
    /// Options consumed while enumerating the process, such as the procfs
    /// root, have no effect after construction.
    pub fn options(mut self, options: DumpOptions) -> Self {
        self.options = options;
        self
    }

    /// Writes the minidump to `writer`.
    pub fn write<W: Write>(&mut self, mut writer: W) -> Result<DumpSummary, CoreError> {
        let (data, soft_errors) =
            assemble(self.source.as_ref(), self.reader.as_mut(), &self.options)?;
        writer.write_all(&data)?;
        writer.flush()?;

        tracing::info!("Wrote {} bytes for minidump", data.len());
        Ok(DumpSummary {
            bytes_written: data.len(),
            soft_errors,
        })
    }

    /// Writes the minidump to `path`.
    ///
    /// The data goes to a temporary file next to `path` that is renamed once
    /// complete, so `path` never holds a partial dump.
    pub fn write_to_file(&mut self, path: &Path) -> Result<DumpSummary, CoreError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(parent)?;
        let summary = self.write(file.as_file_mut())?;
        file.persist(path)?;
        Ok(summary)
    }
}

/// Writes a minidump of the live process `pid`.
///
/// # Arguments:
/// * `writer` - a `std::io::Write` the data is sent to.
/// * `pid` - the process to capture.
#[cfg(target_os = "linux")]
pub fn write_minidump<T: Write>(writer: T, pid: i32) -> Result<DumpSummary, CoreError> {
    MinidumpBuilder::new(pid)?.write(writer)
}

/// Directory entries, filled as streams are written
struct Directory {
    rva: u32,
    entries: Vec<MDRawDirectory>,
}

impl Directory {
    fn add(&mut self, stream_type: StreamType, location: MDLocationDescriptor) {
        self.entries.push(MDRawDirectory {
            stream_type: stream_type as u32,
            location,
        });
    }
}

fn estimate_size(source: &dyn ProcessInfoSource, options: &DumpOptions) -> usize {
    let threads: usize = source
        .threads()
        .iter()
        .map(|t| 64 + t.context.raw_size() + t.stack.map_or(0, |s| s.len as usize))
        .sum();
    let modules = (source.modules().len() + options.user_mappings.len()) * 512;
    let files: usize = ProcFile::ALL
        .iter()
        .filter_map(|f| source.proc_file(*f))
        .map(|data| data.len() + 8)
        .sum();
    let extra: usize = options.extra_ranges.iter().map(|r| r.len as usize).sum();
    threads + modules + files + extra + 16 * 1024
}

/// Modules of the dump: enumerated ones not covered by a user mapping,
/// followed by the user mappings.
fn module_list<'a>(
    enumerated: &'a [ModuleMapping],
    user: &'a [ModuleMapping],
) -> Vec<&'a ModuleMapping> {
    enumerated
        .iter()
        .filter(|module| !user.iter().any(|u| u.covers(module)))
        .chain(user.iter())
        .collect()
}

fn soft_error(errors: &mut Vec<SoftError>, error: SoftError) {
    tracing::warn!("{error}");
    errors.push(error);
}

/// Lays out the whole minidump in memory.
fn assemble(
    source: &dyn ProcessInfoSource,
    reader: &mut dyn ReadProcessMemory,
    options: &DumpOptions,
) -> Result<(Vec<u8>, Vec<SoftError>), CoreError> {
    if source.threads().is_empty() {
        return Err(CoreError::NoThreadsCaptured(source.pid()));
    }

    let endian = Endian::native();
    let mut errors = source.enumeration_errors().to_vec();
    let mut buf = DumpBuf::with_capacity(estimate_size(source, options));
    let mut pool = MemoryPool::default();

    tracing::info!(
        "Creating minidump for process {} with {} threads",
        source.pid(),
        source.threads().len()
    );

    let crash = options.crash.as_ref().or(source.crash_info());
    let requesting_tid = crash
        .map(|c| c.tid)
        .or(options.requesting_thread)
        .or(source.threads().first().map(|t| t.tid));
    let proc_files: Vec<(ProcFile, &[u8])> = ProcFile::ALL
        .iter()
        .filter_map(|f| source.proc_file(*f).map(|data| (*f, data)))
        .collect();
    let stream_count =
        FIXED_STREAMS + usize::from(requesting_tid.is_some()) + proc_files.len();

    let header_rva = buf.reserve(std::mem::size_of::<MDRawHeader>())?;
    let mut directory = Directory {
        rva: buf.reserve(stream_count * std::mem::size_of::<MDRawDirectory>())?,
        entries: Vec::with_capacity(stream_count),
    };

    // Stacks first, then contexts, then the list referencing both.
    let page_size = source.page_size() as u64;
    let mut records = Vec::with_capacity(source.threads().len());
    let mut exception_context = None;
    for thread in source.threads() {
        let mut context = &thread.context;
        let mut stack = thread.stack;
        if let (Some(crash_context), Some(tid)) = (&options.crash_context, requesting_tid) {
            if tid == thread.tid {
                tracing::debug!("Using the crash context for thread {}", thread.tid);
                context = crash_context;
                stack = stack_range(
                    crash_context.stack_pointer(),
                    source.mappings(),
                    page_size,
                    options.stack_cap,
                );
            }
        }

        let stack = match stack {
            Some(range) => match pool.add(&mut buf, reader, range) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    tracing::debug!("Stack of thread {}: {e}", thread.tid);
                    soft_error(
                        &mut errors,
                        SoftError::StackRead {
                            tid: thread.tid,
                            start: range.start,
                            len: range.len,
                        },
                    );
                    MDMemoryDescriptor {
                        start_of_memory_range: range.start,
                        ..Default::default()
                    }
                }
            },
            None => MDMemoryDescriptor::default(),
        };
        let location = streams::write_context(&mut buf, context, endian)?;
        if Some(thread.tid) == requesting_tid {
            exception_context = Some((context.clone(), location));
        }
        records.push(ThreadRecord {
            tid: thread.tid,
            stack,
            context: location,
        });
    }
    let location = streams::write_thread_list(&mut buf, &records)?;
    directory.add(StreamType::ThreadList, location);

    let modules = module_list(source.modules(), &options.user_mappings);
    let location = streams::write_module_list(&mut buf, &modules)?;
    directory.add(StreamType::ModuleList, location);

    if let Some(tid) = requesting_tid {
        // The crashing thread may be gone from the thread list.
        let (context, context_location) = match (exception_context, &options.crash_context) {
            (Some((context, location)), _) => (Some(context), location),
            (None, Some(context)) => (
                Some(context.clone()),
                streams::write_context(&mut buf, context, endian)?,
            ),
            (None, None) => (None, MDLocationDescriptor::default()),
        };
        let pc = context.as_ref().map_or(0, CpuContext::instruction_pointer);

        let location = match crash {
            Some(crash) => {
                if options.capture_crash_window && pc != 0 {
                    capture_crash_window(&mut buf, &mut pool, reader, source, pc);
                }
                streams::write_exception(
                    &mut buf,
                    &ExceptionRecord {
                        tid,
                        code: crash.signal,
                        flags: crash.code,
                        address: crash.address,
                        parameters: &crash.extra,
                        context: context_location,
                    },
                )?
            }
            None => streams::write_exception(
                &mut buf,
                &ExceptionRecord {
                    tid,
                    code: MD_EXCEPTION_CODE_LIN_DUMP_REQUESTED,
                    flags: 0,
                    address: pc,
                    parameters: &[],
                    context: context_location,
                },
            )?,
        };
        directory.add(StreamType::Exception, location);
    }

    for range in &options.extra_ranges {
        if let Err(e) = pool.add(&mut buf, reader, *range) {
            tracing::debug!("Extra range at 0x{:x}: {e}", range.start);
            soft_error(
                &mut errors,
                SoftError::MemoryRead {
                    start: range.start,
                    len: range.len,
                },
            );
        }
    }
    let location = streams::write_memory_list(&mut buf, pool.descriptors())?;
    directory.add(StreamType::MemoryList, location);

    let location = streams::write_system_info(&mut buf, source.system_info())?;
    directory.add(StreamType::SystemInfo, location);
    let location = streams::write_misc_info(&mut buf, source.pid())?;
    directory.add(StreamType::MiscInfo, location);
    let location =
        streams::write_breakpad_info(&mut buf, requesting_tid.unwrap_or(source.pid()))?;
    directory.add(StreamType::BreakpadInfo, location);

    for (file, data) in proc_files {
        tracing::debug!("Writing {} bytes of {}", data.len(), file.node());
        let location = buf.append(data)?;
        directory.add(file.stream_type(), location);
    }

    // Header and directory are finalized only once every stream is in place.
    buf.write_at(directory.rva, directory.entries.as_bytes())?;
    let header = MDRawHeader {
        signature: MD_HEADER_SIGNATURE,
        version: MD_HEADER_VERSION,
        stream_count: directory.entries.len() as u32,
        stream_directory_rva: directory.rva,
        checksum: 0,
        time_date_stamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as u32),
        flags: 0,
    };
    buf.write_at(header_rva, header.as_bytes())?;

    Ok((buf.into_inner(), errors))
}

/// Stores the code around `pc`, clipped to its mapping.
///
/// The window is a convenience for analysis, a failed read is not reported.
fn capture_crash_window(
    buf: &mut DumpBuf,
    pool: &mut MemoryPool,
    reader: &mut dyn ReadProcessMemory,
    source: &dyn ProcessInfoSource,
    pc: u64,
) {
    let Some(mapping) = source.mappings().iter().find(|m| m.contains(pc)) else {
        tracing::debug!("No mapping holds the crashing instruction 0x{pc:x}");
        return;
    };
    let start = pc.saturating_sub(CRASH_WINDOW / 2).max(mapping.begin);
    let end = start.saturating_add(CRASH_WINDOW).min(mapping.end);
    if let Err(e) = pool.add(buf, reader, MemoryRange::new(start, end - start)) {
        tracing::debug!("Code around 0x{pc:x} is not readable: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(name: &str, begin: u64, size: u64) -> ModuleMapping {
        ModuleMapping {
            name: name.to_string(),
            begin,
            size,
            build_id: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn user_mappings_replace_covered_modules() {
        let enumerated = [
            module("/lib/a.so", 0x1000, 0x1000),
            module("/lib/b.so", 0x4000, 0x1000),
        ];
        let user = [module("/apk/base.apk!lib.so", 0x3000, 0x3000)];
        let modules = module_list(&enumerated, &user);
        let names: Vec<&str> = modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["/lib/a.so", "/apk/base.apk!lib.so"]);
    }

    #[test]
    fn default_options() {
        let options = DumpOptions::default();
        assert_eq!(options.stack_cap, 32 * 1024);
        assert_eq!(options.procfs_root, Path::new("/proc"));
        assert!(options.capture_crash_window);
    }
}
