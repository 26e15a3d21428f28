// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{frame_chain_caller, StackMemory, Unwinder};
use crate::context::CpuContext;

/// ARM unwinding, assuming the APCS frame layout with r11 as frame pointer.
pub(crate) struct ArmUnwinder;

impl Unwinder for ArmUnwinder {
    fn frame_pointer_caller(&self, callee: &CpuContext, stack: &StackMemory<'_>) -> Option<CpuContext> {
        let mut caller = frame_chain_caller(callee, stack, "r11")?;
        let return_address = caller.instruction_pointer();
        caller.set_register("lr", return_address);
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
    fn follows_r11_chain() {
        let bytes: Vec<u8> = [0x2000u32, 0x0001_8123]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let region = MemoryRegion::new(0x1000, &bytes, Endian::Little);
        let stack = StackMemory::new(Some(&region), 4);
        let mut callee = CpuContext::empty(CpuArch::Arm).unwrap();
        callee.set_register("sp", 0xff0);
        callee.set_register("fp", 0x1000);
        callee.set_register("lr", 0x0001_0004);

        let caller = ArmUnwinder.frame_pointer_caller(&callee, &stack).unwrap();
        assert_eq!(caller.get_register("r11"), Some(0x2000));
        assert_eq!(caller.instruction_pointer(), 0x0001_8123);
        assert_eq!(caller.get_register("lr"), Some(0x0001_8123));
        assert_eq!(caller.stack_pointer(), 0x1008);
    }

    #[test]
    fn frame_pointer_below_stack_pointer_is_rejected() {
        let bytes = [0_u8; 8];
        let region = MemoryRegion::new(0x1000, &bytes, Endian::Little);
        let stack = StackMemory::new(Some(&region), 4);
        let mut callee = CpuContext::empty(CpuArch::Arm).unwrap();
        callee.set_register("sp", 0x1004);
        callee.set_register("r11", 0x1000);

        assert!(ArmUnwinder.frame_pointer_caller(&callee, &stack).is_none());
        assert_eq!(ArmUnwinder.link_register(), Some("lr"));
    }
}
