// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! 32-bit ARM register context.

use super::{index_of, RawContext};
use crate::bytes::{ByteCursor, ByteSink};
use crate::format::context_flags::MD_CONTEXT_ARM_FULL;
use crate::ReadError;

/// fpscr, 32 double registers, 8 extra words
const FLOAT_SAVE_SIZE: usize = 8 + 32 * 8 + 8 * 4;

const REGISTERS: [&str; 16] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
    "pc",
];

/// ARM context as stored in a dump
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextArm {
    /// Family and valid register groups
    pub context_flags: u32,
    /// r0-r12, sp, lr, pc
    pub iregs: [u32; 16],
    pub cpsr: u32,
    pub float_save: Vec<u8>,
}

impl Default for ContextArm {
    fn default() -> Self {
        Self {
            context_flags: MD_CONTEXT_ARM_FULL,
            iregs: [0; 16],
            cpsr: 0,
            float_save: vec![0; FLOAT_SAVE_SIZE],
        }
    }
}

impl RawContext for ContextArm {
    const RAW_SIZE: usize = 4 + 16 * 4 + 4 + FLOAT_SAVE_SIZE;
    const REGISTERS: &'static [&'static str] = &REGISTERS;
    const CALLEE_SAVED: &'static [&'static str] =
        &["r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11"];
    const STACK_POINTER: &'static str = "sp";
    const INSTRUCTION_POINTER: &'static str = "pc";

    fn read(c: &mut ByteCursor<'_>) -> Result<Self, ReadError> {
        Ok(Self {
            context_flags: c.u32()?,
            iregs: c.u32_array()?,
            cpsr: c.u32()?,
            float_save: c.blob(FLOAT_SAVE_SIZE)?,
        })
    }

    fn write(&self, sink: &mut ByteSink) {
        sink.u32(self.context_flags);
        sink.u32s(&self.iregs);
        sink.u32(self.cpsr);
        sink.blob(&self.float_save, FLOAT_SAVE_SIZE);
    }

    fn get(&self, name: &str) -> Option<u64> {
        index_of(&REGISTERS, name).map(|i| self.iregs[i] as u64)
    }

    fn set(&mut self, name: &str, value: u64) -> bool {
        match index_of(&REGISTERS, name) {
            Some(i) => {
                self.iregs[i] = value as u32;
                true
            }
            None => false,
        }
    }

    fn alias(name: &str) -> Option<&'static str> {
        Some(match name {
            "r13" => "sp",
            "r14" => "lr",
            "r15" => "pc",
            "fp" => "r11",
            "ip" => "r12",
            _ => return None,
        })
    }
}
