// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Register contexts of every supported instruction set.
//!
//! A [`CpuContext`] is portable: it is produced from ptrace or a core file on
//! the capturing host and parsed back from a dump on any host. Registers are
//! addressed by the names symbol files use in CFI rules, with or without the
//! leading `$`.

mod amd64;
mod arm;
mod arm64;
mod mips;
mod ppc;
mod sparc;
mod x86;

pub use amd64::ContextAmd64;
pub use arm::ContextArm;
pub use arm64::ContextArm64;
pub use mips::ContextMips;
pub use ppc::{ContextPpc, ContextPpc64};
pub use sparc::ContextSparc;
pub use x86::ContextX86;

use crate::bytes::{ByteCursor, ByteSink, Endian};
use crate::format::context_flags::*;
use crate::format::CpuArch;
use crate::ReadError;

/// Layout and register naming of one architecture's context record.
pub(crate) trait RawContext: Sized {
    /// Size of the record in a dump
    const RAW_SIZE: usize;
    /// Canonical register names, in record order
    const REGISTERS: &'static [&'static str];
    /// Registers a callee must preserve
    const CALLEE_SAVED: &'static [&'static str];
    const STACK_POINTER: &'static str;
    const INSTRUCTION_POINTER: &'static str;

    fn read(cursor: &mut ByteCursor<'_>) -> Result<Self, ReadError>;
    fn write(&self, sink: &mut ByteSink);
    fn get(&self, name: &str) -> Option<u64>;
    fn set(&mut self, name: &str, value: u64) -> bool;

    /// Maps alternative spellings onto a canonical name.
    fn alias(_name: &str) -> Option<&'static str> {
        None
    }

    fn canonical(name: &str) -> Option<&'static str> {
        Self::REGISTERS
            .iter()
            .find(|r| **r == name)
            .copied()
            .or_else(|| Self::alias(name))
    }
}

/// Register state of one thread
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CpuContext {
    /// 32-bit x86
    X86(ContextX86),
    /// x86-64
    Amd64(ContextAmd64),
    /// 32-bit ARM
    Arm(ContextArm),
    /// AArch64
    Arm64(ContextArm64),
    /// MIPS, 32 or 64-bit
    Mips(ContextMips),
    /// 32-bit PowerPC
    Ppc(ContextPpc),
    /// 64-bit PowerPC
    Ppc64(ContextPpc64),
    /// SPARC
    Sparc(ContextSparc),
}

macro_rules! with_context {
    ($self:expr, $ctx:ident => $body:expr) => {
        match $self {
            CpuContext::X86($ctx) => $body,
            CpuContext::Amd64($ctx) => $body,
            CpuContext::Arm($ctx) => $body,
            CpuContext::Arm64($ctx) => $body,
            CpuContext::Mips($ctx) => $body,
            CpuContext::Ppc($ctx) => $body,
            CpuContext::Ppc64($ctx) => $body,
            CpuContext::Sparc($ctx) => $body,
        }
    };
}

macro_rules! with_layout {
    ($self:expr, $ty:ident => $body:expr) => {
        match $self {
            CpuContext::X86(_) => {
                type $ty = ContextX86;
                $body
            }
            CpuContext::Amd64(_) => {
                type $ty = ContextAmd64;
                $body
            }
            CpuContext::Arm(_) => {
                type $ty = ContextArm;
                $body
            }
            CpuContext::Arm64(_) => {
                type $ty = ContextArm64;
                $body
            }
            CpuContext::Mips(_) => {
                type $ty = ContextMips;
                $body
            }
            CpuContext::Ppc(_) => {
                type $ty = ContextPpc;
                $body
            }
            CpuContext::Ppc64(_) => {
                type $ty = ContextPpc64;
                $body
            }
            CpuContext::Sparc(_) => {
                type $ty = ContextSparc;
                $body
            }
        }
    };
}

/// Position of `name` in a register table.
pub(crate) fn index_of(names: &[&str], name: &str) -> Option<usize> {
    names.iter().position(|r| *r == name)
}

fn read_layout<T: RawContext>(data: &[u8], endian: Endian) -> Result<T, ReadError> {
    if data.len() < T::RAW_SIZE {
        return Err(ReadError::UnknownContext(data.len()));
    }
    T::read(&mut ByteCursor::new(data, endian))
}

impl CpuContext {
    /// Parses a context record.
    ///
    /// The architecture normally comes from the system info stream. Without
    /// it the record is recognized by its size and context flags.
    pub fn read(data: &[u8], endian: Endian, arch: Option<CpuArch>) -> Result<Self, ReadError> {
        let arch = match arch.filter(|a| !matches!(a, CpuArch::Unknown(_))) {
            Some(arch) => arch,
            None => Self::guess_arch(data, endian)?,
        };
        Ok(match arch {
            CpuArch::X86 => CpuContext::X86(read_layout(data, endian)?),
            CpuArch::Amd64 => CpuContext::Amd64(read_layout(data, endian)?),
            CpuArch::Arm => CpuContext::Arm(read_layout(data, endian)?),
            CpuArch::Arm64 => CpuContext::Arm64(read_layout(data, endian)?),
            CpuArch::Mips | CpuArch::Mips64 => CpuContext::Mips(read_layout(data, endian)?),
            CpuArch::Ppc => CpuContext::Ppc(read_layout(data, endian)?),
            CpuArch::Ppc64 => CpuContext::Ppc64(read_layout(data, endian)?),
            CpuArch::Sparc => CpuContext::Sparc(read_layout(data, endian)?),
            CpuArch::Unknown(_) => return Err(ReadError::UnknownContext(data.len())),
        })
    }

    fn guess_arch(data: &[u8], endian: Endian) -> Result<CpuArch, ReadError> {
        let flags_at = |offset: usize| {
            data.get(offset..offset + 4)
                .map(|b| endian.read_u32(b))
                .unwrap_or(0)
        };
        let len = data.len();
        let flags = flags_at(0);
        let arch = if len == ContextX86::RAW_SIZE && flags & MD_CONTEXT_X86 != 0 {
            CpuArch::X86
        } else if len == ContextAmd64::RAW_SIZE && flags_at(48) & MD_CONTEXT_AMD64 != 0 {
            CpuArch::Amd64
        } else if len == ContextArm::RAW_SIZE && flags & MD_CONTEXT_ARM != 0 {
            CpuArch::Arm
        } else if len == ContextArm64::RAW_SIZE
            && flags & (MD_CONTEXT_ARM64 | MD_CONTEXT_ARM64_OLD) != 0
        {
            CpuArch::Arm64
        } else if len == ContextMips::RAW_SIZE && flags & MD_CONTEXT_MIPS64 != 0 {
            CpuArch::Mips64
        } else if len == ContextMips::RAW_SIZE && flags & MD_CONTEXT_MIPS != 0 {
            CpuArch::Mips
        } else if len == ContextPpc::RAW_SIZE && flags & MD_CONTEXT_PPC != 0 {
            CpuArch::Ppc
        } else if len == ContextPpc64::RAW_SIZE {
            // The 64-bit flags word is not checked, its halves depend on byte order.
            CpuArch::Ppc64
        } else if len == ContextSparc::RAW_SIZE && flags & MD_CONTEXT_SPARC != 0 {
            CpuArch::Sparc
        } else {
            return Err(ReadError::UnknownContext(len));
        };
        Ok(arch)
    }

    /// Serializes the record in the given byte order.
    pub fn to_bytes(&self, endian: Endian) -> Vec<u8> {
        let mut sink = ByteSink::with_capacity(self.raw_size(), endian);
        with_context!(self, ctx => ctx.write(&mut sink));
        sink.into_inner()
    }

    /// Size of the serialized record
    pub fn raw_size(&self) -> usize {
        with_layout!(self, T => T::RAW_SIZE)
    }

    /// Architecture this context belongs to
    pub fn arch(&self) -> CpuArch {
        match self {
            CpuContext::X86(_) => CpuArch::X86,
            CpuContext::Amd64(_) => CpuArch::Amd64,
            CpuContext::Arm(_) => CpuArch::Arm,
            CpuContext::Arm64(_) => CpuArch::Arm64,
            CpuContext::Mips(ctx) if ctx.is_64bit() => CpuArch::Mips64,
            CpuContext::Mips(_) => CpuArch::Mips,
            CpuContext::Ppc(_) => CpuArch::Ppc,
            CpuContext::Ppc64(_) => CpuArch::Ppc64,
            CpuContext::Sparc(_) => CpuArch::Sparc,
        }
    }

    /// Size of a pointer, in bytes
    pub fn pointer_width(&self) -> usize {
        self.arch().pointer_width()
    }

    /// Canonical register names
    pub fn register_names(&self) -> &'static [&'static str] {
        with_layout!(self, T => T::REGISTERS)
    }

    /// Registers preserved across calls
    pub fn callee_saved_registers(&self) -> &'static [&'static str] {
        with_layout!(self, T => T::CALLEE_SAVED)
    }

    /// Canonical name of the stack pointer
    pub fn stack_pointer_register(&self) -> &'static str {
        with_layout!(self, T => T::STACK_POINTER)
    }

    /// Canonical name of the instruction pointer
    pub fn instruction_pointer_register(&self) -> &'static str {
        with_layout!(self, T => T::INSTRUCTION_POINTER)
    }

    /// Resolves a register name as written in symbol files.
    pub fn canonical_register(&self, name: &str) -> Option<&'static str> {
        let name = name.strip_prefix('$').unwrap_or(name);
        with_layout!(self, T => T::canonical(name))
    }

    /// Reads a register by name.
    pub fn get_register(&self, name: &str) -> Option<u64> {
        let name = self.canonical_register(name)?;
        with_context!(self, ctx => ctx.get(name))
    }

    /// Writes a register by name and returns its canonical name.
    ///
    /// Values are truncated to the register width.
    pub fn set_register(&mut self, name: &str, value: u64) -> Option<&'static str> {
        let name = self.canonical_register(name)?;
        let done = with_context!(self, ctx => ctx.set(name, value));
        done.then_some(name)
    }

    /// Current instruction address
    pub fn instruction_pointer(&self) -> u64 {
        let name = self.instruction_pointer_register();
        with_context!(self, ctx => ctx.get(name)).unwrap_or(0)
    }

    /// Current stack pointer
    pub fn stack_pointer(&self) -> u64 {
        let name = self.stack_pointer_register();
        with_context!(self, ctx => ctx.get(name)).unwrap_or(0)
    }

    /// Sets the instruction pointer.
    pub fn set_instruction_pointer(&mut self, value: u64) {
        let name = self.instruction_pointer_register();
        with_context!(self, ctx => ctx.set(name, value));
    }

    /// Sets the stack pointer.
    pub fn set_stack_pointer(&mut self, value: u64) {
        let name = self.stack_pointer_register();
        with_context!(self, ctx => ctx.set(name, value));
    }

    /// A zeroed context of the given architecture.
    pub fn empty(arch: CpuArch) -> Option<Self> {
        Some(match arch {
            CpuArch::X86 => CpuContext::X86(ContextX86::default()),
            CpuArch::Amd64 => CpuContext::Amd64(ContextAmd64::default()),
            CpuArch::Arm => CpuContext::Arm(ContextArm::default()),
            CpuArch::Arm64 => CpuContext::Arm64(ContextArm64::default()),
            CpuArch::Mips => CpuContext::Mips(ContextMips::default()),
            CpuArch::Mips64 => CpuContext::Mips(ContextMips::new_64bit()),
            CpuArch::Ppc => CpuContext::Ppc(ContextPpc::default()),
            CpuArch::Ppc64 => CpuContext::Ppc64(ContextPpc64::default()),
            CpuArch::Sparc => CpuContext::Sparc(ContextSparc::default()),
            CpuArch::Unknown(_) => return None,
        })
    }
}
