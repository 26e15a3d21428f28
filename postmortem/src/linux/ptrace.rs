// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Raw ptrace requests nix does not wrap.

use std::ffi::c_void;

use crate::elf::{NT_PRFPREG, NT_PRSTATUS};
use crate::CoreError;
use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace::{self, AddressType, RequestType};
use nix::unistd::Pid;

/// Large enough for the general purpose and FP sets of supported machines
const REG_SET_CAPACITY: usize = 0x400;

/// Register sets read with `PTRACE_GETREGSET`
#[derive(Clone, Copy, Debug)]
pub(crate) enum RegSet {
    General,
    FloatingPoint,
}

impl RegSet {
    fn note_type(self) -> u32 {
        match self {
            RegSet::General => NT_PRSTATUS,
            RegSet::FloatingPoint => NT_PRFPREG,
        }
    }
}

/// Reads one register set of a stopped thread as raw bytes.
pub(crate) fn read_regset(tid: Pid, set: RegSet) -> Result<Vec<u8>, CoreError> {
    // u64 elements keep the buffer aligned for the kernel's structures.
    let mut storage = [0_u64; REG_SET_CAPACITY];
    let mut iov = libc::iovec {
        iov_base: storage.as_mut_ptr().cast::<c_void>(),
        iov_len: std::mem::size_of_val(&storage),
    };

    // SAFETY: the kernel writes at most `iov_len` bytes into `storage`, which
    // outlives the call, and shrinks `iov_len` to the size of the set.
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET as RequestType,
            tid.as_raw(),
            set.note_type() as usize as *mut c_void,
            std::ptr::addr_of_mut!(iov).cast::<c_void>(),
        )
    };
    Errno::result(ret)?;

    let len = iov.iov_len.min(std::mem::size_of_val(&storage));
    Ok(storage
        .iter()
        .flat_map(|word| word.to_ne_bytes())
        .take(len)
        .collect())
}

/// Stops a seized thread without sending it a signal.
pub(crate) fn ptrace_interrupt(tid: Pid) -> Result<(), CoreError> {
    // SAFETY: PTRACE_INTERRUPT takes no memory arguments.
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_INTERRUPT as RequestType,
            tid.as_raw(),
            std::ptr::null_mut::<c_void>(),
            std::ptr::null_mut::<c_void>(),
        )
    };
    Errno::result(ret)?;
    Ok(())
}

/// Reads one word of a stopped thread's memory.
pub(crate) fn ptrace_peek(tid: Pid, address: u64) -> Result<u64, CoreError> {
    let word = ptrace::read(tid, address as AddressType)?;
    Ok(word as u64)
}
