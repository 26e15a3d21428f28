// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! x86_64 register sets.

use crate::context::ContextAmd64;
use zerocopy::{FromBytes, Immutable, KnownLayout};

// amd64 machine
pub const EM_X86_64: u16 = 62;

/// Offset of MXCSR in the FXSAVE image
const FXSAVE_MXCSR: usize = 24;
const FXSAVE_SIZE: usize = 512;

#[allow(non_camel_case_types, dead_code)]
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, Immutable, KnownLayout)]
pub struct elf_gregset_t {
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    rbp: u64,
    rbx: u64,
    r11: u64,
    r10: u64,
    r9: u64,
    r8: u64,
    rax: u64,
    rcx: u64,
    rdx: u64,
    rsi: u64,
    rdi: u64,
    orig_rax: u64,
    rip: u64,
    cs: u64,
    eflags: u64,
    rsp: u64,
    ss: u64,
    fs_base: u64,
    gs_base: u64,
    ds: u64,
    es: u64,
    fs: u64,
    gs: u64,
}

pub fn to_context(gpr: &[u8], fpr: &[u8]) -> Option<ContextAmd64> {
    let (g, _) = elf_gregset_t::read_from_prefix(gpr).ok()?;

    let mut ctx = ContextAmd64 {
        regs: [
            g.rax, g.rcx, g.rdx, g.rbx, g.rsp, g.rbp, g.rsi, g.rdi, g.r8, g.r9, g.r10, g.r11, g.r12,
            g.r13, g.r14, g.r15, g.rip,
        ],
        segments: [g.cs, g.ds, g.es, g.fs, g.gs, g.ss].map(|s| s as u16),
        eflags: g.eflags as u32,
        ..ContextAmd64::default()
    };

    if let Some(fxsave) = fpr.get(..FXSAVE_SIZE) {
        ctx.float_save = fxsave.to_vec();
        ctx.mx_csr = u32::from_le_bytes([
            fxsave[FXSAVE_MXCSR],
            fxsave[FXSAVE_MXCSR + 1],
            fxsave[FXSAVE_MXCSR + 2],
            fxsave[FXSAVE_MXCSR + 3],
        ]);
    }

    Some(ctx)
}
