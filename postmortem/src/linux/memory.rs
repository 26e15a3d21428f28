// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Readers of a live target's address space, fastest first.

use super::ptrace::ptrace_peek;
use crate::CoreError;
use crate::ReadProcessMemory;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;
use std::fs::File;
use std::io::IoSliceMut;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Reads through `process_vm_readv`, one system call per request.
pub(crate) struct VmReadvReader {
    pid: Pid,
}

impl VmReadvReader {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }
}

impl ReadProcessMemory for VmReadvReader {
    fn read_process_memory(&mut self, base: usize, buf: &mut [u8]) -> Result<usize, CoreError> {
        let remote = [RemoteIoVec {
            base,
            len: buf.len(),
        }];
        Ok(process_vm_readv(self.pid, &mut [IoSliceMut::new(buf)], &remote)?)
    }
}

/// Reads through positional reads of `/proc/<pid>/mem`.
///
/// A read crossing into an unmapped page returns the bytes before it.
pub(crate) struct ProcMemReader {
    mem: File,
}

impl ProcMemReader {
    pub fn open(mem_path: &Path) -> Result<Self, CoreError> {
        tracing::debug!("Opening {}", mem_path.display());
        Ok(Self {
            mem: File::open(mem_path)?,
        })
    }
}

impl ReadProcessMemory for ProcMemReader {
    fn read_process_memory(&mut self, base: usize, buf: &mut [u8]) -> Result<usize, CoreError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.mem.read_at(&mut buf[filled..], (base + filled) as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if filled == 0 => return Err(e.into()),
                Err(_) => break,
            }
        }
        Ok(filled)
    }
}

/// One `PTRACE_PEEKDATA` per word. Needs the thread stopped under ptrace.
pub(crate) struct PeekReader {
    tid: Pid,
}

impl PeekReader {
    pub fn new(tid: Pid) -> Self {
        Self { tid }
    }
}

impl ReadProcessMemory for PeekReader {
    fn read_process_memory(&mut self, base: usize, buf: &mut [u8]) -> Result<usize, CoreError> {
        let mut filled = 0;
        for chunk in buf.chunks_mut(std::mem::size_of::<u64>()) {
            match ptrace_peek(self.tid, (base + filled) as u64) {
                Ok(word) => chunk.copy_from_slice(&word.to_ne_bytes()[..chunk.len()]),
                Err(e) if filled == 0 => return Err(e),
                Err(_) => break,
            }
            filled += chunk.len();
        }
        Ok(filled)
    }
}

/// Checks that `process_vm_readv` is permitted and copies what it should by
/// reading a known value out of this very process.
pub(crate) fn vm_readv_available() -> bool {
    let marker = 0x6d65_6d6f_7279_2121_u64;
    let mut probe = VmReadvReader::new(nix::unistd::getpid());
    let mut copied = [0_u8; 8];
    match probe.read_process_memory(std::ptr::addr_of!(marker) as usize, &mut copied) {
        Ok(8) if u64::from_ne_bytes(copied) == marker => true,
        Ok(n) => {
            tracing::debug!("process_vm_readv copied {n} unexpected bytes, not using it");
            false
        }
        Err(e) => {
            tracing::debug!("process_vm_readv is unavailable: {e}");
            false
        }
    }
}
