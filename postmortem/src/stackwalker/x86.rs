// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{frame_chain_caller, StackMemory, Unwinder};
use crate::context::CpuContext;

pub(crate) struct X86Unwinder;

impl Unwinder for X86Unwinder {
    fn frame_pointer_caller(&self, callee: &CpuContext, stack: &StackMemory<'_>) -> Option<CpuContext> {
        frame_chain_caller(callee, stack, "ebp")
    }

    fn scanned_caller(
        &self,
        callee: &CpuContext,
        slot: u64,
        return_address: u64,
        stack: &StackMemory<'_>,
    ) -> Option<CpuContext> {
        pushed_frame_pointer_caller(callee, "ebp", slot, return_address, stack)
    }
}

/// Caller found by scanning on x86 and x86-64.
///
/// When the callee's frame pointer sits right below the return address, the
/// callee pushed it in its prologue and the slot holds the caller's value.
pub(crate) fn pushed_frame_pointer_caller(
    callee: &CpuContext,
    fp_register: &str,
    slot: u64,
    return_address: u64,
    stack: &StackMemory<'_>,
) -> Option<CpuContext> {
    let width = callee.pointer_width() as u64;
    let mut caller = callee.clone();
    caller.set_instruction_pointer(return_address);
    caller.set_stack_pointer(slot.checked_add(width)?);
    let pushed = slot.checked_sub(width);
    if pushed.is_some() && callee.get_register(fp_register) == pushed {
        if let Some(saved) = pushed.and_then(|address| stack.word(address)) {
            caller.set_register(fp_register, saved);
        }
    }
    Some(caller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::Endian;
    use crate::format::CpuArch;
    use crate::reader::MemoryRegion;

    #[test]
    fn follows_ebp_chain() {
        let bytes: Vec<u8> = [0x2000u32, 0x0804_8123]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let region = MemoryRegion::new(0x1000, &bytes, Endian::Little);
        let stack = StackMemory::new(Some(&region), 4);
        let mut callee = CpuContext::empty(CpuArch::X86).unwrap();
        callee.set_register("esp", 0xff0);
        callee.set_register("ebp", 0x1000);

        let caller = X86Unwinder.frame_pointer_caller(&callee, &stack).unwrap();
        assert_eq!(caller.get_register("ebp"), Some(0x2000));
        assert_eq!(caller.get_register("eip"), Some(0x0804_8123));
        assert_eq!(caller.stack_pointer(), 0x1008);

        callee.set_register("ebp", 0x1002);
        assert!(X86Unwinder.frame_pointer_caller(&callee, &stack).is_none());
    }

    #[test]
    fn scanning_recovers_pushed_ebp() {
        let bytes: Vec<u8> = [0x3000u32, 0x0804_8123]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let region = MemoryRegion::new(0x1000, &bytes, Endian::Little);
        let stack = StackMemory::new(Some(&region), 4);
        let mut callee = CpuContext::empty(CpuArch::X86).unwrap();
        callee.set_register("ebp", 0x1000);

        let caller = X86Unwinder
            .scanned_caller(&callee, 0x1004, 0x0804_8123, &stack)
            .unwrap();
        assert_eq!(caller.get_register("ebp"), Some(0x3000));
        assert_eq!(caller.stack_pointer(), 0x1008);
    }
}
