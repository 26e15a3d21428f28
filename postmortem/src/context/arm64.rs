// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! AArch64 register context.

use super::{index_of, RawContext};
use crate::bytes::{ByteCursor, ByteSink};
use crate::format::context_flags::MD_CONTEXT_ARM64_FULL;
use crate::ReadError;

/// fpsr, fpcr, 32 128-bit vector registers
pub(crate) const FLOAT_SAVE_SIZE: usize = 4 + 4 + 32 * 16;
/// bcr, bvr, wcr, wvr
const DEBUG_SIZE: usize = 8 * 4 + 8 * 8 + 2 * 4 + 2 * 8;

const REGISTERS: [&str; 33] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "sp", "pc",
];

/// AArch64 context as stored in a dump
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextArm64 {
    /// Family and valid register groups
    pub context_flags: u32,
    pub cpsr: u32,
    /// x0-x30 then sp
    pub iregs: [u64; 32],
    pub pc: u64,
    pub float_save: Vec<u8>,
    /// Hardware breakpoint and watchpoint registers
    pub debug_registers: Vec<u8>,
}

impl Default for ContextArm64 {
    fn default() -> Self {
        Self {
            context_flags: MD_CONTEXT_ARM64_FULL,
            cpsr: 0,
            iregs: [0; 32],
            pc: 0,
            float_save: vec![0; FLOAT_SAVE_SIZE],
            debug_registers: vec![0; DEBUG_SIZE],
        }
    }
}

impl RawContext for ContextArm64 {
    const RAW_SIZE: usize = 4 + 4 + 32 * 8 + 8 + FLOAT_SAVE_SIZE + DEBUG_SIZE;
    const REGISTERS: &'static [&'static str] = &REGISTERS;
    const CALLEE_SAVED: &'static [&'static str] = &[
        "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27", "x28", "x29",
    ];
    const STACK_POINTER: &'static str = "sp";
    const INSTRUCTION_POINTER: &'static str = "pc";

    fn read(c: &mut ByteCursor<'_>) -> Result<Self, ReadError> {
        Ok(Self {
            context_flags: c.u32()?,
            cpsr: c.u32()?,
            iregs: c.u64_array()?,
            pc: c.u64()?,
            float_save: c.blob(FLOAT_SAVE_SIZE)?,
            debug_registers: c.blob(DEBUG_SIZE)?,
        })
    }

    fn write(&self, sink: &mut ByteSink) {
        sink.u32(self.context_flags);
        sink.u32(self.cpsr);
        sink.u64s(&self.iregs);
        sink.u64(self.pc);
        sink.blob(&self.float_save, FLOAT_SAVE_SIZE);
        sink.blob(&self.debug_registers, DEBUG_SIZE);
    }

    fn get(&self, name: &str) -> Option<u64> {
        match index_of(&REGISTERS, name)? {
            32 => Some(self.pc),
            i => Some(self.iregs[i]),
        }
    }

    fn set(&mut self, name: &str, value: u64) -> bool {
        match index_of(&REGISTERS, name) {
            Some(32) => self.pc = value,
            Some(i) => self.iregs[i] = value,
            None => return false,
        }
        true
    }

    fn alias(name: &str) -> Option<&'static str> {
        Some(match name {
            "fp" => "x29",
            "lr" => "x30",
            "x31" => "sp",
            _ => return None,
        })
    }
}
