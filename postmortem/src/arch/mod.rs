// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Machine-specific register sets of Linux targets.
//!
//! Both ptrace and core files hand out the kernel's `elf_gregset_t` and
//! floating point area. They are converted here into the portable
//! [`CpuContext`] written to dumps.

use crate::context::CpuContext;
use crate::format::CpuArch;
use crate::CoreError;

#[cfg(target_os = "linux")]
use {
    super::linux::ptrace::{read_regset, RegSet},
    nix::unistd::Pid,
};

mod aarch64;
mod x86_64;

pub(crate) use aarch64::EM_AARCH64;
pub(crate) use x86_64::EM_X86_64;

/// ELF machine of the host; live targets always share it
#[cfg(target_arch = "x86_64")]
pub(crate) const HOST_MACHINE: u16 = EM_X86_64;
#[cfg(target_arch = "aarch64")]
pub(crate) const HOST_MACHINE: u16 = EM_AARCH64;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) const HOST_MACHINE: u16 = 0;

/// Architecture recorded in dumps of an ELF machine.
pub(crate) fn arch_of_machine(machine: u16) -> Result<CpuArch, CoreError> {
    match machine {
        EM_X86_64 => Ok(CpuArch::Amd64),
        EM_AARCH64 => Ok(CpuArch::Arm64),
        _ => Err(CoreError::UnsupportedMachine(machine)),
    }
}

/// Builds a context from the raw general purpose and floating point sets.
///
/// An empty or short floating point set leaves that part of the context
/// zeroed.
pub(crate) fn context_from_registers(
    machine: u16,
    gpr: &[u8],
    fpr: &[u8],
) -> Result<CpuContext, CoreError> {
    let context = match machine {
        EM_X86_64 => x86_64::to_context(gpr, fpr).map(CpuContext::Amd64),
        EM_AARCH64 => aarch64::to_context(gpr, fpr).map(CpuContext::Arm64),
        _ => return Err(CoreError::UnsupportedMachine(machine)),
    };
    context.ok_or(CoreError::InternalError("general purpose register set is too short"))
}

/// Captures the registers of a stopped thread.
#[cfg(target_os = "linux")]
pub(crate) fn capture_context(tid: Pid) -> Result<CpuContext, CoreError> {
    tracing::debug!("Getting GP registers for #{tid}");
    let gpr = read_regset(tid, RegSet::General)?;

    tracing::debug!("Getting FP registers for #{tid}");
    let fpr = match read_regset(tid, RegSet::FloatingPoint) {
        Ok(fpr) => fpr,
        Err(e) => {
            tracing::debug!("No floating point state for #{tid}: {e}");
            Vec::new()
        }
    };

    context_from_registers(HOST_MACHINE, &gpr, &fpr)
}
