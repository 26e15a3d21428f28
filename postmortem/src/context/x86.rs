// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! 32-bit x86 register context.

use super::{index_of, RawContext};
use crate::bytes::{ByteCursor, ByteSink};
use crate::format::context_flags::MD_CONTEXT_X86_FULL;
use crate::ReadError;

const FLOAT_SAVE_SIZE: usize = 112;
const EXTENDED_SIZE: usize = 512;

/// Integer and control registers in record order
const REGISTERS: [&str; 16] = [
    "gs", "fs", "es", "ds", "edi", "esi", "ebx", "edx", "ecx", "eax", "ebp", "eip", "cs",
    "eflags", "esp", "ss",
];

/// x86 context as stored in a dump
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextX86 {
    /// Family and valid register groups
    pub context_flags: u32,
    /// dr0-dr3, dr6, dr7
    pub debug_registers: [u32; 6],
    /// x87 save area
    pub float_save: Vec<u8>,
    /// Registers in the order of the register table
    pub regs: [u32; 16],
    /// FXSAVE area
    pub extended_registers: Vec<u8>,
}

impl Default for ContextX86 {
    fn default() -> Self {
        Self {
            context_flags: MD_CONTEXT_X86_FULL,
            debug_registers: [0; 6],
            float_save: vec![0; FLOAT_SAVE_SIZE],
            regs: [0; 16],
            extended_registers: vec![0; EXTENDED_SIZE],
        }
    }
}

impl RawContext for ContextX86 {
    const RAW_SIZE: usize = 4 + 6 * 4 + FLOAT_SAVE_SIZE + 16 * 4 + EXTENDED_SIZE;
    const REGISTERS: &'static [&'static str] = &REGISTERS;
    const CALLEE_SAVED: &'static [&'static str] = &["ebp", "ebx", "esi", "edi"];
    const STACK_POINTER: &'static str = "esp";
    const INSTRUCTION_POINTER: &'static str = "eip";

    fn read(c: &mut ByteCursor<'_>) -> Result<Self, ReadError> {
        Ok(Self {
            context_flags: c.u32()?,
            debug_registers: c.u32_array()?,
            float_save: c.blob(FLOAT_SAVE_SIZE)?,
            regs: c.u32_array()?,
            extended_registers: c.blob(EXTENDED_SIZE)?,
        })
    }

    fn write(&self, sink: &mut ByteSink) {
        sink.u32(self.context_flags);
        sink.u32s(&self.debug_registers);
        sink.blob(&self.float_save, FLOAT_SAVE_SIZE);
        sink.u32s(&self.regs);
        sink.blob(&self.extended_registers, EXTENDED_SIZE);
    }

    fn get(&self, name: &str) -> Option<u64> {
        index_of(&REGISTERS, name).map(|i| self.regs[i] as u64)
    }

    fn set(&mut self, name: &str, value: u64) -> bool {
        match index_of(&REGISTERS, name) {
            Some(i) => {
                self.regs[i] = value as u32;
                true
            }
            None => false,
        }
    }

    fn alias(name: &str) -> Option<&'static str> {
        match name {
            "efl" => Some("eflags"),
            _ => None,
        }
    }
}
