// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SPARC register context.

use super::{index_of, RawContext};
use crate::bytes::{ByteCursor, ByteSink};
use crate::format::context_flags::MD_CONTEXT_SPARC_FULL;
use crate::ReadError;

/// 32 double registers, filler, fsr
const FLOAT_SAVE_SIZE: usize = 32 * 8 + 8 + 8;

/// Globals, outs, locals and ins of the current window, then pc and npc
const REGISTERS: [&str; 34] = [
    "g0", "g1", "g2", "g3", "g4", "g5", "g6", "g7", "o0", "o1", "o2", "o3", "o4", "o5", "o6",
    "o7", "l0", "l1", "l2", "l3", "l4", "l5", "l6", "l7", "i0", "i1", "i2", "i3", "i4", "i5",
    "i6", "i7", "pc", "npc",
];

/// SPARC context as stored in a dump
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextSparc {
    /// Family and valid register groups
    pub context_flags: u32,
    pub g_r: [u64; 32],
    pub ccr: u64,
    pub pc: u64,
    pub npc: u64,
    pub y: u64,
    pub asi: u64,
    pub fprs: u64,
    pub float_save: Vec<u8>,
}

impl Default for ContextSparc {
    fn default() -> Self {
        Self {
            context_flags: MD_CONTEXT_SPARC_FULL,
            g_r: [0; 32],
            ccr: 0,
            pc: 0,
            npc: 0,
            y: 0,
            asi: 0,
            fprs: 0,
            float_save: vec![0; FLOAT_SAVE_SIZE],
        }
    }
}

impl RawContext for ContextSparc {
    const RAW_SIZE: usize = 4 + 4 + 32 * 8 + 6 * 8 + FLOAT_SAVE_SIZE;
    const REGISTERS: &'static [&'static str] = &REGISTERS;
    const CALLEE_SAVED: &'static [&'static str] = &[
        "l0", "l1", "l2", "l3", "l4", "l5", "l6", "l7", "i0", "i1", "i2", "i3", "i4", "i5", "i6",
        "i7",
    ];
    const STACK_POINTER: &'static str = "o6";
    const INSTRUCTION_POINTER: &'static str = "pc";

    fn read(c: &mut ByteCursor<'_>) -> Result<Self, ReadError> {
        let context_flags = c.u32()?;
        c.skip(4)?;
        Ok(Self {
            context_flags,
            g_r: c.u64_array()?,
            ccr: c.u64()?,
            pc: c.u64()?,
            npc: c.u64()?,
            y: c.u64()?,
            asi: c.u64()?,
            fprs: c.u64()?,
            float_save: c.blob(FLOAT_SAVE_SIZE)?,
        })
    }

    fn write(&self, sink: &mut ByteSink) {
        sink.u32(self.context_flags);
        sink.u32(0);
        sink.u64s(&self.g_r);
        sink.u64s(&[self.ccr, self.pc, self.npc, self.y, self.asi, self.fprs]);
        sink.blob(&self.float_save, FLOAT_SAVE_SIZE);
    }

    fn get(&self, name: &str) -> Option<u64> {
        Some(match index_of(&REGISTERS, name)? {
            32 => self.pc,
            33 => self.npc,
            i => self.g_r[i],
        })
    }

    fn set(&mut self, name: &str, value: u64) -> bool {
        match index_of(&REGISTERS, name) {
            Some(32) => self.pc = value,
            Some(33) => self.npc = value,
            Some(i) => self.g_r[i] = value,
            None => return false,
        }
        true
    }

    fn alias(name: &str) -> Option<&'static str> {
        Some(match name {
            "sp" => "o6",
            "fp" => "i6",
            _ => return None,
        })
    }
}
