// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Snapshot sources on Linux: live processes under ptrace and core files.

mod corefile;
mod memory;
mod process;
pub(crate) mod procfs;
pub(crate) mod ptrace;

pub use corefile::{CoreFileView, CoreMemoryReader};
pub use process::ProcessView;
