// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! x86-64 register context.

use super::{index_of, RawContext};
use crate::bytes::{ByteCursor, ByteSink};
use crate::format::context_flags::MD_CONTEXT_AMD64_FULL;
use crate::ReadError;

pub(crate) const FLOAT_SAVE_SIZE: usize = 512;
const VECTOR_SIZE: usize = 26 * 16;

/// General purpose registers in record order, followed by `rip`
const REGISTERS: [&str; 17] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip",
];

/// x86-64 context as stored in a dump
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextAmd64 {
    /// Register parameter home addresses
    pub p_home: [u64; 6],
    /// Family and valid register groups
    pub context_flags: u32,
    pub mx_csr: u32,
    /// cs, ds, es, fs, gs, ss
    pub segments: [u16; 6],
    pub eflags: u32,
    /// dr0-dr3, dr6, dr7
    pub debug_registers: [u64; 6],
    /// Registers in the order of the register table
    pub regs: [u64; 17],
    /// FXSAVE area
    pub float_save: Vec<u8>,
    pub vector_registers: Vec<u8>,
    pub vector_control: u64,
    pub debug_control: u64,
    /// Last branch to/from, last exception to/from
    pub last_branch: [u64; 4],
}

impl Default for ContextAmd64 {
    fn default() -> Self {
        Self {
            p_home: [0; 6],
            context_flags: MD_CONTEXT_AMD64_FULL,
            mx_csr: 0,
            segments: [0; 6],
            eflags: 0,
            debug_registers: [0; 6],
            regs: [0; 17],
            float_save: vec![0; FLOAT_SAVE_SIZE],
            vector_registers: vec![0; VECTOR_SIZE],
            vector_control: 0,
            debug_control: 0,
            last_branch: [0; 4],
        }
    }
}

impl RawContext for ContextAmd64 {
    const RAW_SIZE: usize =
        6 * 8 + 4 + 4 + 6 * 2 + 4 + 6 * 8 + 17 * 8 + FLOAT_SAVE_SIZE + VECTOR_SIZE + 2 * 8 + 4 * 8;
    const REGISTERS: &'static [&'static str] = &REGISTERS;
    const CALLEE_SAVED: &'static [&'static str] = &["rbx", "rbp", "r12", "r13", "r14", "r15"];
    const STACK_POINTER: &'static str = "rsp";
    const INSTRUCTION_POINTER: &'static str = "rip";

    fn read(c: &mut ByteCursor<'_>) -> Result<Self, ReadError> {
        let p_home = c.u64_array()?;
        let context_flags = c.u32()?;
        let mx_csr = c.u32()?;
        let mut segments = [0_u16; 6];
        for s in segments.iter_mut() {
            *s = c.u16()?;
        }
        Ok(Self {
            p_home,
            context_flags,
            mx_csr,
            segments,
            eflags: c.u32()?,
            debug_registers: c.u64_array()?,
            regs: c.u64_array()?,
            float_save: c.blob(FLOAT_SAVE_SIZE)?,
            vector_registers: c.blob(VECTOR_SIZE)?,
            vector_control: c.u64()?,
            debug_control: c.u64()?,
            last_branch: c.u64_array()?,
        })
    }

    fn write(&self, sink: &mut ByteSink) {
        sink.u64s(&self.p_home);
        sink.u32(self.context_flags);
        sink.u32(self.mx_csr);
        self.segments.iter().for_each(|s| sink.u16(*s));
        sink.u32(self.eflags);
        sink.u64s(&self.debug_registers);
        sink.u64s(&self.regs);
        sink.blob(&self.float_save, FLOAT_SAVE_SIZE);
        sink.blob(&self.vector_registers, VECTOR_SIZE);
        sink.u64(self.vector_control);
        sink.u64(self.debug_control);
        sink.u64s(&self.last_branch);
    }

    fn get(&self, name: &str) -> Option<u64> {
        index_of(&REGISTERS, name).map(|i| self.regs[i])
    }

    fn set(&mut self, name: &str, value: u64) -> bool {
        match index_of(&REGISTERS, name) {
            Some(i) => {
                self.regs[i] = value;
                true
            }
            None => false,
        }
    }
}
