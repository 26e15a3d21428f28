// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{StackMemory, Unwinder};
use crate::context::CpuContext;

/// MIPS has no frame pointer convention to follow; callers come from CFI,
/// the return address register or scanning.
pub(crate) struct MipsUnwinder;

impl Unwinder for MipsUnwinder {
    fn frame_pointer_caller(&self, _callee: &CpuContext, _stack: &StackMemory<'_>) -> Option<CpuContext> {
        None
    }

    fn link_register(&self) -> Option<&'static str> {
        Some("ra")
    }
}
