// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::exploitability::Exploitability;
use crate::stackwalker::{CallStack, FrameTrust, StackFrame};
use crate::symbols::SymbolStatus;
use serde::Serialize;
use std::io::{self, Write};

/// Operating system and CPU of the dumped process
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SystemSummary {
    /// Operating system family
    pub os: &'static str,
    /// Version numbers and the free-form OS description
    pub os_version: String,
    /// CPU architecture
    pub cpu: &'static str,
    /// CPU vendor, when recorded
    pub cpu_vendor: Option<String>,
    /// Number of CPUs
    pub cpu_count: u8,
}

/// What stopped the process
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CrashSummary {
    /// Signal and code, e.g. `SIGSEGV /SEGV_MAPERR`, or `DUMP_REQUESTED`
    pub reason: String,
    /// Faulting address
    pub address: u64,
    /// Thread that crashed or requested the dump
    pub thread_id: u32,
}

/// The walked stack of one thread
#[derive(Clone, Debug, Serialize)]
pub struct ThreadState {
    /// Thread id
    pub thread_id: u32,
    /// Frames and walk outcome
    #[serde(flatten)]
    pub stack: CallStack,
}

/// A loaded module and whether it could be symbolized
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModuleState {
    /// Load address
    pub base_address: u64,
    /// Size of the mapping
    pub size: u64,
    /// Path of the module
    pub name: String,
    /// Debug file name
    pub debug_file: String,
    /// Identifier matching the module to its symbol file
    pub debug_identifier: String,
    /// Build identifier
    pub code_identifier: String,
    /// Symbol loading outcome, `None` when no frame needed the symbols
    pub symbols: Option<SymbolStatus>,
}

/// Everything learned from a minidump.
///
/// Built once by [`crate::process_minidump`] and read-only afterwards.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessState {
    /// Process id, from the misc info stream
    pub process_id: Option<u32>,
    /// Time the dump was written, in seconds since the epoch
    pub time_date_stamp: u32,
    /// System information, when the stream is present
    pub system: Option<SystemSummary>,
    /// Crash details, when the exception stream is present
    pub crash: Option<CrashSummary>,
    /// Index in `threads` of the crashing or requesting thread
    pub requesting_thread: Option<usize>,
    /// Threads in thread list order
    pub threads: Vec<ThreadState>,
    /// Modules in module list order
    pub modules: Vec<ModuleState>,
    /// Exploitability rating of the crash
    pub exploitability: Option<Exploitability>,
}

impl ProcessState {
    /// Whether the dump records a crash rather than a dump request
    pub fn crashed(&self) -> bool {
        self.crash
            .as_ref()
            .is_some_and(|crash| crash.reason != "DUMP_REQUESTED")
    }

    /// The crashing or requesting thread
    pub fn requesting_thread(&self) -> Option<&ThreadState> {
        self.threads.get(self.requesting_thread?)
    }

    /// Modules whose symbols were needed but not found
    pub fn modules_without_symbols(&self) -> impl Iterator<Item = &ModuleState> {
        self.modules
            .iter()
            .filter(|m| m.symbols == Some(SymbolStatus::Missing))
    }

    /// Modules whose symbol files could not be parsed
    pub fn modules_with_corrupt_symbols(&self) -> impl Iterator<Item = &ModuleState> {
        self.modules
            .iter()
            .filter(|m| m.symbols == Some(SymbolStatus::Corrupt))
    }

    /// Writes the report as pretty-printed JSON.
    pub fn print_json<W: Write>(&self, out: W) -> serde_json::Result<()> {
        serde_json::to_writer_pretty(out, self)
    }

    /// Writes a human readable report.
    pub fn print<W: Write>(&self, out: &mut W) -> io::Result<()> {
        match &self.system {
            Some(system) => {
                writeln!(out, "Operating system: {}", system.os)?;
                writeln!(out, "                  {}", system.os_version)?;
                writeln!(out, "CPU: {}", system.cpu)?;
                if let Some(vendor) = &system.cpu_vendor {
                    writeln!(out, "     {vendor}")?;
                }
                writeln!(out, "     {} CPUs", system.cpu_count)?;
            }
            None => writeln!(out, "Operating system: unknown")?,
        }
        writeln!(out)?;

        match &self.crash {
            Some(crash) if self.crashed() => {
                writeln!(out, "Crash reason:  {}", crash.reason)?;
                writeln!(out, "Crash address: {:#x}", crash.address)?;
            }
            Some(_) => writeln!(out, "No crash, dump requested")?,
            None => writeln!(out, "No crash")?,
        }
        if let Some(exploitability) = &self.exploitability {
            writeln!(
                out,
                "Exploitability: {:?} ({})",
                exploitability.verdict, exploitability.rationale
            )?;
        }
        writeln!(out)?;

        for (index, thread) in self.threads.iter().enumerate() {
            let marker = match self.requesting_thread {
                Some(i) if i == index && self.crashed() => " (crashed)",
                Some(i) if i == index => " (requesting)",
                _ => "",
            };
            writeln!(out, "Thread {index}{marker}, tid {}", thread.thread_id)?;
            for (number, frame) in thread.stack.frames.iter().enumerate() {
                print_frame(out, number, frame)?;
            }
            writeln!(out, "    Walk ended: {:?}", thread.stack.status)?;
            writeln!(out)?;
        }

        writeln!(out, "Loaded modules:")?;
        for module in &self.modules {
            let note = match module.symbols {
                Some(SymbolStatus::Missing) => "  (WARNING: No symbols)",
                Some(SymbolStatus::Corrupt) => "  (WARNING: Corrupt symbols)",
                _ => "",
            };
            writeln!(
                out,
                "{:#010x} - {:#010x}  {}  {}{note}",
                module.base_address,
                module.base_address.saturating_add(module.size.saturating_sub(1)),
                module.name,
                module.debug_identifier
            )?;
        }
        Ok(())
    }
}

fn print_frame<W: Write>(out: &mut W, number: usize, frame: &StackFrame) -> io::Result<()> {
    let pc = frame.instruction();
    write!(out, "{number:2}  ")?;
    match (&frame.module, &frame.symbol) {
        (Some(module), Some(symbol)) => {
            let offset = pc
                .wrapping_sub(module.base_address)
                .wrapping_sub(symbol.function_base);
            let outer = symbol.outermost();
            write!(
                out,
                "{}!{}",
                module.file_name(),
                outer.map_or("<unknown>", |f| f.function.as_str())
            )?;
            match outer.and_then(|f| Some((f.source_file.as_ref()?, f.source_line?))) {
                Some((file, line)) => writeln!(out, " [{file} : {line} + {offset:#x}]")?,
                None => writeln!(out, " + {offset:#x}")?,
            }
            for inlined in symbol.frames.iter().rev().skip(1) {
                write!(out, "    inlined {}", inlined.function)?;
                match (&inlined.source_file, inlined.source_line) {
                    (Some(file), Some(line)) => writeln!(out, " [{file} : {line}]")?,
                    _ => writeln!(out)?,
                }
            }
        }
        (Some(module), None) => writeln!(
            out,
            "{} + {:#x}",
            module.file_name(),
            pc.wrapping_sub(module.base_address)
        )?,
        _ => writeln!(out, "{pc:#x}")?,
    }

    let context = &frame.context;
    if frame.trust == FrameTrust::Context {
        for chunk in context.register_names().chunks(4) {
            let line: Vec<String> = chunk
                .iter()
                .filter_map(|r| Some(format!("{r} = {:#x}", context.get_register(r)?)))
                .collect();
            writeln!(out, "    {}", line.join("  "))?;
        }
    } else {
        writeln!(
            out,
            "    {} = {:#x}  {} = {:#x}",
            context.instruction_pointer_register(),
            pc,
            context.stack_pointer_register(),
            context.stack_pointer()
        )?;
    }
    writeln!(out, "    Found by: {}", frame.trust.description())
}
