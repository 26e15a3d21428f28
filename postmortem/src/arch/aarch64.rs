// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Aarch64 register sets.

use crate::context::ContextArm64;
use zerocopy::{FromBytes, Immutable, KnownLayout};

// aarch64 machine
pub const EM_AARCH64: u16 = 183;

/// `user_fpsimd_state`: 32 vector registers, then fpsr and fpcr
const VREGS_SIZE: usize = 32 * 16;

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, Immutable, KnownLayout)]
pub struct elf_gregset_t {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

pub fn to_context(gpr: &[u8], fpr: &[u8]) -> Option<ContextArm64> {
    let (g, _) = elf_gregset_t::read_from_prefix(gpr).ok()?;

    let mut ctx = ContextArm64 {
        cpsr: g.pstate as u32,
        pc: g.pc,
        ..ContextArm64::default()
    };
    ctx.iregs[..31].copy_from_slice(&g.regs);
    ctx.iregs[31] = g.sp;

    if let Some(state) = fpr.get(..VREGS_SIZE + 8) {
        // The dump keeps fpsr and fpcr ahead of the vector registers.
        ctx.float_save[..8].copy_from_slice(&state[VREGS_SIZE..]);
        ctx.float_save[8..8 + VREGS_SIZE].copy_from_slice(&state[..VREGS_SIZE]);
    }

    Some(ctx)
}
