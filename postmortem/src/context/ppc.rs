// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PowerPC register contexts.

use super::{index_of, RawContext};
use crate::bytes::{ByteCursor, ByteSink};
use crate::format::context_flags::{MD_CONTEXT_PPC64_FULL, MD_CONTEXT_PPC_FULL};
use crate::ReadError;

/// 32 double registers, padding, fpscr
const FLOAT_SAVE_SIZE: usize = 32 * 8 + 4 + 4;
/// 32 vector registers, vscr, padding, vrvalid, padding
const VECTOR_SAVE_SIZE: usize = 32 * 16 + 16 + 4 * 4 + 4 + 7 * 4;

const REGISTERS: [&str; 37] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
    "r15", "r16", "r17", "r18", "r19", "r20", "r21", "r22", "r23", "r24", "r25", "r26", "r27",
    "r28", "r29", "r30", "r31", "srr0", "lr", "ctr", "cr", "xer",
];

const CALLEE_SAVED: [&str; 19] = [
    "r13", "r14", "r15", "r16", "r17", "r18", "r19", "r20", "r21", "r22", "r23", "r24", "r25",
    "r26", "r27", "r28", "r29", "r30", "r31",
];

fn alias(name: &str) -> Option<&'static str> {
    Some(match name {
        "sp" => "r1",
        "pc" => "srr0",
        _ => return None,
    })
}

/// 32-bit PowerPC context as stored in a dump
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextPpc {
    /// Family and valid register groups
    pub context_flags: u32,
    /// Program counter
    pub srr0: u32,
    /// Machine state
    pub srr1: u32,
    pub gpr: [u32; 32],
    pub cr: u32,
    pub xer: u32,
    pub lr: u32,
    pub ctr: u32,
    pub mq: u32,
    pub vrsave: u32,
    pub float_save: Vec<u8>,
    pub vector_save: Vec<u8>,
}

impl Default for ContextPpc {
    fn default() -> Self {
        Self {
            context_flags: MD_CONTEXT_PPC_FULL,
            srr0: 0,
            srr1: 0,
            gpr: [0; 32],
            cr: 0,
            xer: 0,
            lr: 0,
            ctr: 0,
            mq: 0,
            vrsave: 0,
            float_save: vec![0; FLOAT_SAVE_SIZE],
            vector_save: vec![0; VECTOR_SAVE_SIZE],
        }
    }
}

impl RawContext for ContextPpc {
    const RAW_SIZE: usize = 3 * 4 + 32 * 4 + 6 * 4 + FLOAT_SAVE_SIZE + VECTOR_SAVE_SIZE;
    const REGISTERS: &'static [&'static str] = &REGISTERS;
    const CALLEE_SAVED: &'static [&'static str] = &CALLEE_SAVED;
    const STACK_POINTER: &'static str = "r1";
    const INSTRUCTION_POINTER: &'static str = "srr0";

    fn read(c: &mut ByteCursor<'_>) -> Result<Self, ReadError> {
        Ok(Self {
            context_flags: c.u32()?,
            srr0: c.u32()?,
            srr1: c.u32()?,
            gpr: c.u32_array()?,
            cr: c.u32()?,
            xer: c.u32()?,
            lr: c.u32()?,
            ctr: c.u32()?,
            mq: c.u32()?,
            vrsave: c.u32()?,
            float_save: c.blob(FLOAT_SAVE_SIZE)?,
            vector_save: c.blob(VECTOR_SAVE_SIZE)?,
        })
    }

    fn write(&self, sink: &mut ByteSink) {
        sink.u32(self.context_flags);
        sink.u32(self.srr0);
        sink.u32(self.srr1);
        sink.u32s(&self.gpr);
        sink.u32s(&[self.cr, self.xer, self.lr, self.ctr, self.mq, self.vrsave]);
        sink.blob(&self.float_save, FLOAT_SAVE_SIZE);
        sink.blob(&self.vector_save, VECTOR_SAVE_SIZE);
    }

    fn get(&self, name: &str) -> Option<u64> {
        let value = match index_of(&REGISTERS, name)? {
            32 => self.srr0,
            33 => self.lr,
            34 => self.ctr,
            35 => self.cr,
            36 => self.xer,
            i => self.gpr[i],
        };
        Some(value as u64)
    }

    fn set(&mut self, name: &str, value: u64) -> bool {
        let value = value as u32;
        match index_of(&REGISTERS, name) {
            Some(32) => self.srr0 = value,
            Some(33) => self.lr = value,
            Some(34) => self.ctr = value,
            Some(35) => self.cr = value,
            Some(36) => self.xer = value,
            Some(i) => self.gpr[i] = value,
            None => return false,
        }
        true
    }

    fn alias(name: &str) -> Option<&'static str> {
        alias(name)
    }
}

/// 64-bit PowerPC context as stored in a dump
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextPpc64 {
    /// Family and valid register groups
    pub context_flags: u64,
    /// Program counter
    pub srr0: u64,
    /// Machine state
    pub srr1: u64,
    pub gpr: [u64; 32],
    pub cr: u64,
    pub xer: u64,
    pub lr: u64,
    pub ctr: u64,
    pub vrsave: u64,
    pub float_save: Vec<u8>,
    pub vector_save: Vec<u8>,
}

impl Default for ContextPpc64 {
    fn default() -> Self {
        Self {
            context_flags: MD_CONTEXT_PPC64_FULL as u64,
            srr0: 0,
            srr1: 0,
            gpr: [0; 32],
            cr: 0,
            xer: 0,
            lr: 0,
            ctr: 0,
            vrsave: 0,
            float_save: vec![0; FLOAT_SAVE_SIZE],
            vector_save: vec![0; VECTOR_SAVE_SIZE],
        }
    }
}

impl RawContext for ContextPpc64 {
    const RAW_SIZE: usize = 3 * 8 + 32 * 8 + 5 * 8 + FLOAT_SAVE_SIZE + VECTOR_SAVE_SIZE;
    const REGISTERS: &'static [&'static str] = &REGISTERS;
    const CALLEE_SAVED: &'static [&'static str] = &CALLEE_SAVED;
    const STACK_POINTER: &'static str = "r1";
    const INSTRUCTION_POINTER: &'static str = "srr0";

    fn read(c: &mut ByteCursor<'_>) -> Result<Self, ReadError> {
        Ok(Self {
            context_flags: c.u64()?,
            srr0: c.u64()?,
            srr1: c.u64()?,
            gpr: c.u64_array()?,
            cr: c.u64()?,
            xer: c.u64()?,
            lr: c.u64()?,
            ctr: c.u64()?,
            vrsave: c.u64()?,
            float_save: c.blob(FLOAT_SAVE_SIZE)?,
            vector_save: c.blob(VECTOR_SAVE_SIZE)?,
        })
    }

    fn write(&self, sink: &mut ByteSink) {
        sink.u64(self.context_flags);
        sink.u64(self.srr0);
        sink.u64(self.srr1);
        sink.u64s(&self.gpr);
        sink.u64s(&[self.cr, self.xer, self.lr, self.ctr, self.vrsave]);
        sink.blob(&self.float_save, FLOAT_SAVE_SIZE);
        sink.blob(&self.vector_save, VECTOR_SAVE_SIZE);
    }

    fn get(&self, name: &str) -> Option<u64> {
        Some(match index_of(&REGISTERS, name)? {
            32 => self.srr0,
            33 => self.lr,
            34 => self.ctr,
            35 => self.cr,
            36 => self.xer,
            i => self.gpr[i],
        })
    }

    fn set(&mut self, name: &str, value: u64) -> bool {
        match index_of(&REGISTERS, name) {
            Some(32) => self.srr0 = value,
            Some(33) => self.lr = value,
            Some(34) => self.ctr = value,
            Some(35) => self.cr = value,
            Some(36) => self.xer = value,
            Some(i) => self.gpr[i] = value,
            None => return false,
        }
        true
    }

    fn alias(name: &str) -> Option<&'static str> {
        alias(name)
    }
}
