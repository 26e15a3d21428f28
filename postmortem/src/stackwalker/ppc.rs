// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{StackMemory, Unwinder};
use crate::context::CpuContext;

/// PowerPC unwinding through the stack back chain.
///
/// Every frame starts with a pointer to the caller's frame, and the caller's
/// frame holds the saved link register two words in.
pub(crate) struct PpcUnwinder;

impl Unwinder for PpcUnwinder {
    fn frame_pointer_caller(&self, callee: &CpuContext, stack: &StackMemory<'_>) -> Option<CpuContext> {
        let width = callee.pointer_width() as u64;
        let sp = callee.stack_pointer();
        let caller_sp = stack.word(sp)?;
        if caller_sp <= sp || caller_sp % width != 0 {
            return None;
        }
        let return_address = stack.word(caller_sp.checked_add(2 * width)?)?;

        let mut caller = callee.clone();
        caller.set_stack_pointer(caller_sp);
        caller.set_instruction_pointer(return_address);
        Some(caller)
    }

    fn link_register(&self) -> Option<&'static str> {
        Some("lr")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::Endian;
    use crate::format::CpuArch;
    use crate::reader::MemoryRegion;

    #[test]
    fn follows_back_chain() {
        let mut bytes = vec![0u8; 0x20];
        bytes[..4].copy_from_slice(&0x1010u32.to_be_bytes());
        bytes[0x18..0x1c].copy_from_slice(&0x1000_2000u32.to_be_bytes());
        let region = MemoryRegion::new(0x1000, &bytes, Endian::Big);
        let stack = StackMemory::new(Some(&region), 4);
        let mut callee = CpuContext::empty(CpuArch::Ppc).unwrap();
        callee.set_register("r1", 0x1000);

        let caller = PpcUnwinder.frame_pointer_caller(&callee, &stack).unwrap();
        assert_eq!(caller.stack_pointer(), 0x1010);
        assert_eq!(caller.get_register("srr0"), Some(0x1000_2000));
    }

    #[test]
    fn saved_lr_slot_is_read_two_words_in_on_ppc64() {
        let mut bytes = vec![0u8; 0x40];
        bytes[..8].copy_from_slice(&0x1020u64.to_be_bytes());
        bytes[0x30..0x38].copy_from_slice(&0x1000_3000u64.to_be_bytes());
        let region = MemoryRegion::new(0x1000, &bytes, Endian::Big);
        let stack = StackMemory::new(Some(&region), 8);
        let mut callee = CpuContext::empty(CpuArch::Ppc64).unwrap();
        callee.set_register("r1", 0x1000);

        let caller = PpcUnwinder.frame_pointer_caller(&callee, &stack).unwrap();
        assert_eq!(caller.stack_pointer(), 0x1020);
        assert_eq!(caller.instruction_pointer(), 0x1000_3000);
    }

    #[test]
    fn back_chain_at_end_of_address_space_is_rejected() {
        let bytes = 0xffff_ffff_ffff_fff8u64.to_be_bytes();
        let region = MemoryRegion::new(0x1000, &bytes, Endian::Big);
        let stack = StackMemory::new(Some(&region), 8);
        let mut callee = CpuContext::empty(CpuArch::Ppc64).unwrap();
        callee.set_register("r1", 0x1000);

        assert!(PpcUnwinder.frame_pointer_caller(&callee, &stack).is_none());
    }
}
