// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{StackMemory, Unwinder};
use crate::context::CpuContext;

/// Offsets of the saved %i6 and %i7 in a register window save area
const SAVED_FP: u64 = 56;
const SAVED_PC: u64 = 60;
/// %i7 holds the call instruction; execution resumes after its delay slot
const RETURN_OFFSET: u64 = 8;

/// SPARC unwinding through register window save areas.
pub(crate) struct SparcUnwinder;

impl Unwinder for SparcUnwinder {
    fn frame_pointer_caller(&self, callee: &CpuContext, stack: &StackMemory<'_>) -> Option<CpuContext> {
        let fp = callee.get_register("i6")?;
        if fp == 0 || fp < callee.stack_pointer() {
            return None;
        }
        let call_site = stack.word(fp.checked_add(SAVED_PC)?)?;
        let caller_fp = stack.word(fp.checked_add(SAVED_FP)?)?;
        if call_site <= 1 || caller_fp <= 1 {
            return None;
        }

        let mut caller = callee.clone();
        caller.set_register("o6", fp);
        caller.set_register("i6", caller_fp);
        caller.set_instruction_pointer(call_site.checked_add(RETURN_OFFSET)?);
        Some(caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::Endian;
    use crate::format::CpuArch;
    use crate::reader::MemoryRegion;

    fn save_area(fp: u32, pc: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; 64];
        bytes[56..60].copy_from_slice(&fp.to_be_bytes());
        bytes[60..64].copy_from_slice(&pc.to_be_bytes());
        bytes
    }

    fn callee(sp: u64, fp: u64) -> CpuContext {
        let mut ctx = CpuContext::empty(CpuArch::Sparc).unwrap();
        ctx.set_register("o6", sp);
        ctx.set_register("i6", fp);
        ctx
    }

    #[test]
    fn follows_register_window_save_area() {
        let bytes = save_area(0x3000, 0x1_0040);
        let region = MemoryRegion::new(0x2000, &bytes, Endian::Big);
        let stack = StackMemory::new(Some(&region), 4);

        let caller = SparcUnwinder
            .frame_pointer_caller(&callee(0x1f00, 0x2000), &stack)
            .unwrap();
        assert_eq!(caller.stack_pointer(), 0x2000);
        assert_eq!(caller.get_register("i6"), Some(0x3000));
        assert_eq!(caller.instruction_pointer(), 0x1_0048);
    }

    #[test]
    fn null_saved_registers_end_the_chain() {
        let stack_of = |bytes: &[u8]| -> Option<CpuContext> {
            let region = MemoryRegion::new(0x2000, bytes, Endian::Big);
            let stack = StackMemory::new(Some(&region), 4);
            SparcUnwinder.frame_pointer_caller(&callee(0x1f00, 0x2000), &stack)
        };
        assert!(stack_of(&save_area(0x3000, 1)).is_none());
        assert!(stack_of(&save_area(0, 0x1_0040)).is_none());
    }

    #[test]
    fn frame_pointer_at_end_of_address_space_is_rejected() {
        let bytes = save_area(0x3000, 0x1_0040);
        let region = MemoryRegion::new(0x2000, &bytes, Endian::Big);
        let stack = StackMemory::new(Some(&region), 4);

        let context = callee(0x1f00, u64::MAX - 10);
        assert!(SparcUnwinder.frame_pointer_caller(&context, &stack).is_none());
    }
}
