// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MIPS register context, shared by the 32 and 64-bit variants.

use super::{index_of, RawContext};
use crate::bytes::{ByteCursor, ByteSink};
use crate::format::context_flags::{MD_CONTEXT_MIPS64, MD_CONTEXT_MIPS64_FULL, MD_CONTEXT_MIPS_FULL};
use crate::ReadError;

/// 32 double registers, fpcsr, fir
const FLOAT_SAVE_SIZE: usize = 32 * 8 + 4 + 4;

/// General registers by number, followed by the program counter
const REGISTERS: [&str; 33] = [
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5", "t6",
    "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1", "gp", "sp",
    "fp", "ra", "pc",
];

/// MIPS context as stored in a dump
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextMips {
    /// Family and valid register groups
    pub context_flags: u32,
    pub iregs: [u64; 32],
    pub mdhi: u64,
    pub mdlo: u64,
    pub hi: [u32; 3],
    pub lo: [u32; 3],
    pub dsp_control: u32,
    pub epc: u64,
    pub badvaddr: u64,
    pub status: u32,
    pub cause: u32,
    pub float_save: Vec<u8>,
}

impl Default for ContextMips {
    fn default() -> Self {
        Self {
            context_flags: MD_CONTEXT_MIPS_FULL,
            iregs: [0; 32],
            mdhi: 0,
            mdlo: 0,
            hi: [0; 3],
            lo: [0; 3],
            dsp_control: 0,
            epc: 0,
            badvaddr: 0,
            status: 0,
            cause: 0,
            float_save: vec![0; FLOAT_SAVE_SIZE],
        }
    }
}

impl ContextMips {
    /// An empty context of a 64-bit target
    pub fn new_64bit() -> Self {
        Self {
            context_flags: MD_CONTEXT_MIPS64_FULL,
            ..Self::default()
        }
    }

    /// True when the context comes from a 64-bit target
    pub fn is_64bit(&self) -> bool {
        self.context_flags & MD_CONTEXT_MIPS64 != 0
    }

    fn clamp(&self, value: u64) -> u64 {
        if self.is_64bit() {
            value
        } else {
            value & 0xffff_ffff
        }
    }
}

impl RawContext for ContextMips {
    const RAW_SIZE: usize =
        4 + 4 + 32 * 8 + 8 + 8 + 3 * 4 + 3 * 4 + 4 + 4 + 8 + 8 + 4 + 4 + FLOAT_SAVE_SIZE;
    const REGISTERS: &'static [&'static str] = &REGISTERS;
    const CALLEE_SAVED: &'static [&'static str] =
        &["s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "gp", "fp"];
    const STACK_POINTER: &'static str = "sp";
    const INSTRUCTION_POINTER: &'static str = "pc";

    fn read(c: &mut ByteCursor<'_>) -> Result<Self, ReadError> {
        let context_flags = c.u32()?;
        c.skip(4)?;
        let iregs = c.u64_array()?;
        let mdhi = c.u64()?;
        let mdlo = c.u64()?;
        let hi = c.u32_array()?;
        let lo = c.u32_array()?;
        let dsp_control = c.u32()?;
        c.skip(4)?;
        Ok(Self {
            context_flags,
            iregs,
            mdhi,
            mdlo,
            hi,
            lo,
            dsp_control,
            epc: c.u64()?,
            badvaddr: c.u64()?,
            status: c.u32()?,
            cause: c.u32()?,
            float_save: c.blob(FLOAT_SAVE_SIZE)?,
        })
    }

    fn write(&self, sink: &mut ByteSink) {
        sink.u32(self.context_flags);
        sink.u32(0);
        sink.u64s(&self.iregs);
        sink.u64(self.mdhi);
        sink.u64(self.mdlo);
        sink.u32s(&self.hi);
        sink.u32s(&self.lo);
        sink.u32(self.dsp_control);
        sink.u32(0);
        sink.u64(self.epc);
        sink.u64(self.badvaddr);
        sink.u32(self.status);
        sink.u32(self.cause);
        sink.blob(&self.float_save, FLOAT_SAVE_SIZE);
    }

    fn get(&self, name: &str) -> Option<u64> {
        let value = match index_of(&REGISTERS, name)? {
            32 => self.epc,
            i => self.iregs[i],
        };
        Some(self.clamp(value))
    }

    fn set(&mut self, name: &str, value: u64) -> bool {
        let value = self.clamp(value);
        match index_of(&REGISTERS, name) {
            Some(32) => self.epc = value,
            Some(i) => self.iregs[i] = value,
            None => return false,
        }
        true
    }

    fn alias(name: &str) -> Option<&'static str> {
        Some(match name {
            "s8" => "fp",
            "epc" => "pc",
            _ => return None,
        })
    }
}
