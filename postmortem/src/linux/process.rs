// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Code for linux specific functionality
//!
//! Gathering process information from a live, suspended process.

use super::memory::{vm_readv_available, PeekReader, ProcMemReader, VmReadvReader};
use super::procfs::{self, proc_path};
use super::ptrace::ptrace_interrupt;
use crate::arch;
use crate::snapshot::{
    stack_range, MemoryMapping, ModuleMapping, ProcFile, SystemDescription, ThreadView,
};
use crate::{CoreError, DumpOptions, ProcessInfoSource, ReadProcessMemory, SoftError};
use nix::sys;
use nix::sys::ptrace::{seize, Options};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const LSB_RELEASE_PATH: &str = "/etc/lsb-release";

fn get_thread_ids(procfs_root: &Path, pid: Pid) -> Result<Vec<Pid>, CoreError> {
    let mut threads = Vec::new();
    let task_dir = proc_path(procfs_root, pid.as_raw(), "task")?;
    tracing::debug!("Reading {}", task_dir.display());
    let paths = fs::read_dir(task_dir)?;

    tracing::debug!(
        "Enumerating threads(light-weight processes) for the process {}",
        pid
    );

    for entry in paths {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Ok(tid) = name.parse::<u32>() {
            tracing::debug!("Found thread {}", tid);
            threads.push(Pid::from_raw(tid as nix::libc::pid_t));
        }
    }

    threads.sort();
    threads.dedup();
    Ok(threads)
}

/// Seizes, interrupts and waits for one thread.
fn suspend_thread(tid: Pid) -> Result<(), nix::Error> {
    tracing::debug!("Seizing thread {}", tid);
    seize(tid, Options::empty())?;

    tracing::debug!("Interrupting thread {}", tid);
    let stopped = match ptrace_interrupt(tid) {
        Ok(()) => {
            tracing::debug!("Waiting for thread {} to stop", tid);
            waitpid(tid, Some(sys::wait::WaitPidFlag::__WALL)).map(|s| {
                tracing::debug!("Thread {} stopped, status {:?}", tid, s);
            })
        }
        Err(CoreError::NixError(e)) => Err(e),
        Err(_) => Err(nix::Error::EINVAL),
    };

    if stopped.is_err() {
        let _ = sys::ptrace::detach(tid, None);
    }
    stopped
}

/// Parent pid and command name of a thread.
///
/// A missing or malformed `stat` file only costs the thread its names.
fn read_thread_stat(stat_path: &Path, errors: &mut Vec<SoftError>) -> (i32, String) {
    tracing::debug!("Reading {}", stat_path.display());
    let parsed = fs::read_to_string(stat_path)
        .map_err(|e| e.to_string())
        .and_then(|stat| procfs::parse_stat(&stat).map_err(|e| e.to_string()));
    match parsed {
        Ok(names) => names,
        Err(reason) => {
            tracing::warn!("Cannot use {}: {}", stat_path.display(), reason);
            errors.push(SoftError::ProcFile {
                path: stat_path.display().to_string(),
                reason,
            });
            (0, String::new())
        }
    }
}

/// View of a live Linux process, suspended for as long as the view exists
pub struct ProcessView {
    pid: Pid,
    procfs_root: PathBuf,
    /// Every thread stopped under ptrace, resumed on drop
    suspended: Vec<Pid>,
    threads: Vec<ThreadView>,
    mappings: Vec<MemoryMapping>,
    modules: Vec<ModuleMapping>,
    system: SystemDescription,
    proc_files: HashMap<ProcFile, Vec<u8>>,
    page_size: usize,
    errors: Vec<SoftError>,
}

impl ProcessView {
    /// Suspends every thread of `pid` and gathers the process information.
    ///
    /// Threads that cannot be suspended are left out and reported through
    /// [`ProcessInfoSource::enumeration_errors`]; the capture only fails when
    /// not a single thread could be stopped.
    pub fn new(pid: libc::pid_t, options: &DumpOptions) -> Result<Self, CoreError> {
        let pid = Pid::from_raw(pid);
        let procfs_root = options.procfs_root.clone();

        // Guard against calling for itself. Fail early as seizing the threads
        // would fail with -EPERM later.
        if pid == nix::unistd::getpid() {
            return Err(CoreError::CantDumpItself);
        }
        let arch = arch::arch_of_machine(arch::HOST_MACHINE)?;

        let tids = get_thread_ids(&procfs_root, pid)?;
        tracing::info!("Attaching to {} threads of process {}", tids.len(), pid);

        let mut errors = Vec::new();
        let mut suspended = Vec::with_capacity(tids.len());
        for tid in &tids {
            match suspend_thread(*tid) {
                Ok(()) => suspended.push(*tid),
                Err(e) => {
                    tracing::warn!("Cannot suspend thread {}, leaving it out: {}", tid, e);
                    errors.push(SoftError::SuspendThread {
                        tid: tid.as_raw(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if suspended.is_empty() {
            return Err(CoreError::NoThreadsSuspended(pid.as_raw()));
        }

        // From here on dropping the view resumes the threads.
        let mut view = Self {
            pid,
            procfs_root,
            suspended,
            threads: Vec::new(),
            mappings: Vec::new(),
            modules: Vec::new(),
            system: SystemDescription::new(arch),
            proc_files: HashMap::new(),
            page_size: procfs::page_size(),
            errors,
        };

        // Threads may have been created or may have exited meanwhile. The
        // suspended ones are consistent with each other, new ones are missed.
        let tids_check = get_thread_ids(&view.procfs_root, pid)?;
        if tids != tids_check {
            tracing::warn!(
                "Threads of process {} changed while suspending: {:?} -> {:?}",
                pid,
                tids,
                tids_check
            );
        }

        view.read_proc_files(options)?;

        let maps = view
            .proc_files
            .get(&ProcFile::Maps)
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .unwrap_or_default();
        view.mappings = procfs::parse_maps(&maps)?;

        view.read_threads(options.stack_cap)?;

        let auxv = view
            .proc_files
            .get(&ProcFile::Auxv)
            .map(|a| procfs::parse_auxv(a))
            .unwrap_or_default();
        tracing::debug!("Auxiliary vector {:x?}", auxv);

        let mut reader = view.create_memory_reader()?;
        view.modules = procfs::identify_modules(
            &view.mappings,
            procfs::vdso_address(&auxv),
            options.mapped_root.as_deref(),
            view.page_size,
            reader.as_mut(),
            &mut view.errors,
        );

        view.system = procfs::host_system_description(
            view.system.arch,
            view.proc_files.get(&ProcFile::CpuInfo).map(Vec::as_slice),
        );

        Ok(view)
    }

    fn read_proc_files(&mut self, options: &DumpOptions) -> Result<(), CoreError> {
        let maps_path = proc_path(&self.procfs_root, self.pid.as_raw(), "maps")?;
        tracing::debug!("Reading {}", maps_path.display());
        self.proc_files.insert(ProcFile::Maps, fs::read(&maps_path)?);

        for file in [
            ProcFile::CmdLine,
            ProcFile::Environ,
            ProcFile::Status,
            ProcFile::Auxv,
        ] {
            let path = proc_path(&self.procfs_root, self.pid.as_raw(), file.node())?;
            if let Some(data) = procfs::read_optional(&path, &mut self.errors) {
                self.proc_files.insert(file, data);
            }
        }

        let cpuinfo = options.procfs_root.join("cpuinfo");
        if let Some(data) = procfs::read_optional(&cpuinfo, &mut self.errors) {
            self.proc_files.insert(ProcFile::CpuInfo, data);
        }
        // Only present on some distributions.
        if let Ok(data) = fs::read(LSB_RELEASE_PATH) {
            self.proc_files.insert(ProcFile::LsbRelease, data);
        }

        Ok(())
    }

    fn read_threads(&mut self, stack_cap: u64) -> Result<(), CoreError> {
        for tid in &self.suspended {
            let stat_path = self
                .procfs_root
                .join(self.pid.as_raw().to_string())
                .join("task")
                .join(tid.to_string())
                .join("stat");
            let (ppid, comm) = read_thread_stat(&stat_path, &mut self.errors);

            let context = match arch::capture_context(*tid) {
                Ok(context) => context,
                Err(e) => {
                    tracing::warn!("Cannot read registers of thread {}: {}", tid, e);
                    self.errors.push(SoftError::ThreadRegisters {
                        tid: tid.as_raw(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            // Threads confined by seccomp may report a null stack pointer.
            let sp = context.stack_pointer();
            if sp == 0 {
                tracing::warn!("Thread {} has a null stack pointer, dropping it", tid);
                self.errors.push(SoftError::NullStackPointer(tid.as_raw()));
                continue;
            }

            let stack = stack_range(sp, &self.mappings, self.page_size as u64, stack_cap);
            let thread = ThreadView {
                tid: tid.as_raw(),
                ppid,
                comm,
                context,
                stack,
            };
            tracing::debug!("Thread state: {:x?}", thread.stack);
            self.threads.push(thread);
        }

        Ok(())
    }

    /// Picks the fastest memory reader the system allows.
    pub(crate) fn create_memory_reader(&self) -> Result<Box<dyn ReadProcessMemory>, CoreError> {
        if vm_readv_available() {
            tracing::info!("Reading memory of {} with process_vm_readv", self.pid);
            return Ok(Box::new(VmReadvReader::new(self.pid)));
        }

        let mem_path = proc_path(&self.procfs_root, self.pid.as_raw(), "mem")?;
        match ProcMemReader::open(&mem_path) {
            Ok(reader) => {
                tracing::info!("Reading memory of {} through {}", self.pid, mem_path.display());
                Ok(Box::new(reader))
            }
            Err(e) => {
                tracing::info!("Cannot open {}: {e}, reading memory word by word", mem_path.display());
                let tid = self
                    .suspended
                    .first()
                    .copied()
                    .ok_or(CoreError::NoThreadsSuspended(self.pid.as_raw()))?;
                Ok(Box::new(PeekReader::new(tid)))
            }
        }
    }
}

impl ProcessInfoSource for ProcessView {
    fn pid(&self) -> i32 {
        self.pid.as_raw()
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

impl Drop for ProcessView {
    fn drop(&mut self) {
        tracing::info!(
            "Detaching from {} threads of process {}",
            self.suspended.len(),
            self.pid
        );

        for tid in &self.suspended {
            match sys::ptrace::detach(*tid, None) {
                Ok(_) => {
                    tracing::debug!("Thread {} resumed", tid);
                }
                Err(e) => {
                    tracing::error!("Thread {} failed to resume: {:?}", tid, e);
                }
            };
        }
    }
}
