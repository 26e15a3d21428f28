// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{frame_chain_caller, StackMemory, Unwinder};
use crate::context::CpuContext;

pub(crate) struct Arm64Unwinder;

impl Unwinder for Arm64Unwinder {
    fn frame_pointer_caller(&self, callee: &CpuContext, stack: &StackMemory<'_>) -> Option<CpuContext> {
        let mut caller = frame_chain_caller(callee, stack, "x29")?;
        let return_address = caller.instruction_pointer();
        caller.set_register("x30", return_address);
        Some(caller)
    }

    fn link_register(&self) -> Option<&'static str> {
        Some("x30")
    }
}
