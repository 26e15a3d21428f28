// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::x86::pushed_frame_pointer_caller;
use super::{frame_chain_caller, StackMemory, Unwinder};
use crate::context::CpuContext;

pub(crate) struct Amd64Unwinder;

impl Unwinder for Amd64Unwinder {
    fn frame_pointer_caller(&self, callee: &CpuContext, stack: &StackMemory<'_>) -> Option<CpuContext> {
        frame_chain_caller(callee, stack, "rbp")
    }

    fn scanned_caller(
        &self,
        callee: &CpuContext,
        slot: u64,
        return_address: u64,
        stack: &StackMemory<'_>,
    ) -> Option<CpuContext> {
        pushed_frame_pointer_caller(callee, "rbp", slot, return_address, stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::Endian;
    use crate::format::CpuArch;
    use crate::reader::MemoryRegion;

    const TOP: u64 = u64::MAX - 7;

    fn words(values: &[u64]) -> Vec<u8> {
        values.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn follows_rbp_chain() {
        let bytes = words(&[0x7fff_2000, 0x5555_1234]);
        let region = MemoryRegion::new(0x7fff_1000, &bytes, Endian::Little);
        let stack = StackMemory::new(Some(&region), 8);
        let mut callee = CpuContext::empty(CpuArch::Amd64).unwrap();
        callee.set_register("rsp", 0x7fff_0f00);
        callee.set_register("rbp", 0x7fff_1000);

        let caller = Amd64Unwinder.frame_pointer_caller(&callee, &stack).unwrap();
        assert_eq!(caller.get_register("rbp"), Some(0x7fff_2000));
        assert_eq!(caller.instruction_pointer(), 0x5555_1234);
        assert_eq!(caller.stack_pointer(), 0x7fff_1010);
    }

    #[test]
    fn rbp_at_end_of_address_space_is_rejected() {
        let bytes = words(&[0x7fff_2000]);
        let region = MemoryRegion::new(TOP, &bytes, Endian::Little);
        let stack = StackMemory::new(Some(&region), 8);
        let mut callee = CpuContext::empty(CpuArch::Amd64).unwrap();
        callee.set_register("rsp", 0x7fff_0000);
        callee.set_register("rbp", TOP);

        assert!(Amd64Unwinder.frame_pointer_caller(&callee, &stack).is_none());
    }

    #[test]
    fn scanned_slot_at_end_of_address_space_is_rejected() {
        let bytes = words(&[0x5555_1234]);
        let region = MemoryRegion::new(TOP, &bytes, Endian::Little);
        let stack = StackMemory::new(Some(&region), 8);
        let mut callee = CpuContext::empty(CpuArch::Amd64).unwrap();
        callee.set_register("rbp", TOP - 8);

        assert!(Amd64Unwinder
            .scanned_caller(&callee, TOP, 0x5555_1234, &stack)
            .is_none());
    }
}
