// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg(target_os = "linux")]

mod common;

use common::build_core;
use postmortem::{
    process_minidump, CoreError, DumpOptions, Minidump, MinidumpBuilder, ProcessorOptions,
    Symbolizer,
};
use std::path::Path;

const STACK: u64 = 0x7ffd_0000;

#[test]
fn three_thread_core_keeps_the_crashing_thread() {
    let stack: Vec<u8> = (0..0x2000_u32).map(|i| i as u8).collect();
    let core = build_core(
        &[
            (300, 0x40_1000, STACK + 0x100),
            (301, 0x40_2000, STACK + 0x900),
            (302, 0x40_3000, STACK + 0x1100),
        ],
        11,
        0x10,
        STACK,
        &stack,
    );
    let dir = tempfile::tempdir().unwrap();
    let core_path = dir.path().join("core");
    std::fs::write(&core_path, core).unwrap();

    let mut builder =
        MinidumpBuilder::from_core_file(&core_path, None, DumpOptions::default()).unwrap();
    let mut data = Vec::new();
    builder.write(&mut data).unwrap();
    let dump = Minidump::read(data).unwrap();

    let threads = dump.get_thread_list().unwrap();
    let ids: Vec<u32> = threads.threads.iter().map(|t| t.thread_id).collect();
    assert_eq!(ids, [300, 301, 302]);
    let last = threads.threads[2].stack.as_ref().unwrap();
    assert_eq!(last.base_address, STACK + 0x1000);
    assert_eq!(last.bytes, &stack[0x1000..]);

    let exception = dump.get_exception().unwrap();
    assert_eq!(exception.thread_id, 300);
    assert_eq!(exception.code, 11);
    assert_eq!(exception.flags, 1);
    assert_eq!(exception.address, 0x10);

    let symbolizer = Symbolizer::from_paths::<&Path>(&[]);
    let state = process_minidump(&dump, &symbolizer, &ProcessorOptions::default()).unwrap();
    assert!(state.crashed());
    assert_eq!(state.requesting_thread, Some(0));
    assert_eq!(state.threads.len(), 3);
    assert_eq!(state.crash.unwrap().reason, "SIGSEGV /SEGV_MAPERR");
}

#[test]
fn missing_core_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        MinidumpBuilder::from_core_file(&dir.path().join("nothing"), None, DumpOptions::default()),
        Err(CoreError::IoError(_))
    ));
}
