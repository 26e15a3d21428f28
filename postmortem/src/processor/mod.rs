// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Turns a minidump into a [`ProcessState`]: every thread walked and
//! symbolized, the crash described and optionally rated.

pub(crate) mod reason;
mod state;

pub use reason::{crash_reason, signal_name};
pub use state::{CrashSummary, ModuleState, ProcessState, SystemSummary, ThreadState};

use crate::context::CpuContext;
use crate::exploitability::{classify, ExploitabilityOptions};
use crate::reader::{MemoryList, Minidump, MinidumpThread, ModuleList};
use crate::stackwalker::{walk_stack, CallStack, WalkStatus, WalkerOptions};
use crate::symbols::Symbolizer;
use crate::{ProcessError, ReadError};
use std::collections::BTreeSet;

/// How a minidump is processed.
#[derive(Clone, Debug)]
pub struct ProcessorOptions {
    /// Limits of each stack walk
    pub walker: WalkerOptions,
    /// Rate the crash, `None` to skip the rating
    pub exploitability: Option<ExploitabilityOptions>,
    /// Walk threads concurrently
    pub parallel: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            walker: WalkerOptions::default(),
            exploitability: Some(ExploitabilityOptions::default()),
            parallel: false,
        }
    }
}

/// Reads an optional stream, logging why it is unavailable.
fn optional<T>(name: &str, stream: Result<T, ReadError>) -> Option<T> {
    match stream {
        Ok(stream) => Some(stream),
        Err(ReadError::StreamNotPresent(_)) => {
            tracing::debug!("No {name} stream");
            None
        }
        Err(e) => {
            tracing::warn!("Ignoring unreadable {name} stream: {e}");
            None
        }
    }
}

struct ThreadWalk<'a> {
    modules: &'a ModuleList,
    memory: &'a MemoryList<'a>,
    symbolizer: &'a Symbolizer,
    options: &'a WalkerOptions,
    exception_tid: Option<u32>,
    exception_context: Option<&'a CpuContext>,
}

impl ThreadWalk<'_> {
    fn walk(&self, thread: &MinidumpThread<'_>) -> CallStack {
        // The thread list holds the signal handler's registers for the
        // crashing thread, the exception stream the faulting ones.
        let context = match self.exception_context {
            Some(context) if self.exception_tid == Some(thread.thread_id) => Some(context),
            _ => thread.context.as_ref(),
        };
        let Some(context) = context else {
            tracing::warn!("Thread {} has no usable context", thread.thread_id);
            return CallStack {
                frames: Vec::new(),
                status: WalkStatus::MissingContext,
            };
        };
        let stack = thread
            .stack
            .as_ref()
            .filter(|s| s.contains(context.stack_pointer()))
            .or_else(|| self.memory.memory_at_address(context.stack_pointer()))
            .or(thread.stack.as_ref());
        if stack.is_none() {
            tracing::warn!("Thread {} has no stack memory", thread.thread_id);
        }
        let stack = walk_stack(context, stack, self.modules, self.symbolizer, self.options);
        tracing::debug!(
            "Thread {}: {} frames, {:?}",
            thread.thread_id,
            stack.frames.len(),
            stack.status
        );
        stack
    }
}

/// Walks every thread of `dump` and gathers the results.
///
/// Missing or corrupt streams other than the thread list only degrade the
/// report. Fails when the thread list is unusable or no thread yields a frame.
pub fn process_minidump(
    dump: &Minidump,
    symbolizer: &Symbolizer,
    options: &ProcessorOptions,
) -> Result<ProcessState, ProcessError> {
    let thread_list = dump.get_thread_list().map_err(ProcessError::NoThreadList)?;
    let modules = optional("module list", dump.get_module_list()).unwrap_or_default();
    let memory = optional("memory list", dump.get_memory_list()).unwrap_or_default();
    let system_info = optional("system info", dump.get_system_info());
    let exception = optional("exception", dump.get_exception());
    let misc_info = optional("misc info", dump.get_misc_info());
    let breakpad_info = optional("breakpad info", dump.get_breakpad_info());

    let requesting_tid = breakpad_info
        .and_then(|info| info.requesting_thread_id)
        .or(exception.as_ref().map(|e| e.thread_id));

    let walker = ThreadWalk {
        modules: &modules,
        memory: &memory,
        symbolizer,
        options: &options.walker,
        exception_tid: exception.as_ref().map(|e| e.thread_id),
        exception_context: exception.as_ref().and_then(|e| e.context.as_ref()),
    };
    let stacks: Vec<CallStack> = if options.parallel {
        let walker = &walker;
        std::thread::scope(|scope| {
            let handles: Vec<_> = thread_list
                .threads
                .iter()
                .map(|thread| scope.spawn(move || walker.walk(thread)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    } else {
        thread_list.threads.iter().map(|t| walker.walk(t)).collect()
    };

    if stacks.iter().all(|s| s.frames.is_empty()) {
        return Err(ProcessError::NoUsableThreads);
    }

    let threads: Vec<ThreadState> = thread_list
        .threads
        .iter()
        .zip(stacks)
        .map(|(thread, stack)| ThreadState {
            thread_id: thread.thread_id,
            stack,
        })
        .collect();
    let requesting_thread =
        requesting_tid.and_then(|tid| threads.iter().position(|t| t.thread_id == tid));

    let exploitability = options.exploitability.as_ref().map(|rating| {
        let frames = requesting_thread
            .map(|i| threads[i].stack.frames.as_slice())
            .unwrap_or_default();
        classify(exception.as_ref(), frames, &modules, rating)
    });

    // Symbol status is only meaningful for modules the walk needed.
    let used: BTreeSet<u64> = threads
        .iter()
        .flat_map(|t| t.stack.frames.iter())
        .filter_map(|f| f.module.as_ref().map(|m| m.base_address))
        .collect();
    let modules = modules
        .modules
        .iter()
        .map(|module| ModuleState {
            base_address: module.base_address,
            size: module.size,
            name: module.name.clone(),
            debug_file: module.debug_file.clone(),
            debug_identifier: module.debug_identifier.clone(),
            code_identifier: module.code_identifier.clone(),
            symbols: used
                .contains(&module.base_address)
                .then(|| symbolizer.status(module)),
        })
        .collect();

    let system = system_info.map(|info| {
        let mut os_version = format!(
            "{}.{}.{}",
            info.major_version, info.minor_version, info.build_number
        );
        if let Some(csd) = &info.csd_version {
            os_version.push(' ');
            os_version.push_str(csd);
        }
        SystemSummary {
            os: info.os_name(),
            os_version,
            cpu: info.arch.name(),
            cpu_vendor: info.cpu_vendor.clone(),
            cpu_count: info.cpu_count,
        }
    });
    let crash = exception.as_ref().map(|e| CrashSummary {
        reason: crash_reason(e.code, e.flags),
        address: e.address,
        thread_id: e.thread_id,
    });

    Ok(ProcessState {
        process_id: misc_info.and_then(|info| info.process_id),
        time_date_stamp: dump.time_date_stamp(),
        system,
        crash,
        requesting_thread,
        threads,
        modules,
        exploitability,
    })
}
