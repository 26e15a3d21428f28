// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod common;

use common::{fgh_process, APP_BASE, PID, STACK_BASE};
use postmortem::{CpuArch, CrashInfo, MemoryRange, Minidump, MinidumpBuilder};

#[test]
fn threads_modules_and_memory_survive() {
    let (process, memory) = fgh_process(3);
    let expected_threads = process.threads.clone();
    let expected_modules = process.modules.clone();
    let blocks = memory.blocks.clone();

    let mut builder = MinidumpBuilder::from_source(Box::new(process), Box::new(memory));
    let mut data = Vec::new();
    let summary = builder.write(&mut data).unwrap();
    assert_eq!(summary.error_count(), 0);
    assert_eq!(summary.bytes_written, data.len());

    let dump = Minidump::read(data).unwrap();
    let threads = dump.get_thread_list().unwrap();
    assert_eq!(threads.threads.len(), expected_threads.len());
    let expected = expected_threads.iter().zip(&blocks);
    for (thread, (expected, (base, bytes))) in threads.threads.iter().zip(expected) {
        assert_eq!(thread.thread_id, expected.tid as u32);
        let context = thread.context.as_ref().unwrap();
        assert_eq!(context.instruction_pointer(), expected.context.instruction_pointer());
        assert_eq!(context.stack_pointer(), expected.context.stack_pointer());
        assert_eq!(context.get_register("rbp"), expected.context.get_register("rbp"));

        let stack = thread.stack.as_ref().unwrap();
        assert_eq!(stack.base_address, *base);
        assert_eq!(stack.bytes, bytes.as_slice());
    }

    let modules = dump.get_module_list().unwrap();
    assert_eq!(modules.modules.len(), 1);
    let module = &modules.modules[0];
    assert_eq!(module.base_address, APP_BASE);
    assert_eq!(module.size, expected_modules[0].size);
    assert_eq!(module.name, "/usr/bin/app");
    assert_eq!(module.debug_file, "app");
    assert_eq!(module.debug_identifier, expected_modules[0].debug_identifier());
    assert_eq!(module.code_identifier, expected_modules[0].code_identifier());

    let memory = dump.get_memory_list().unwrap();
    assert_eq!(memory.regions.len(), blocks.len());
    for (base, bytes) in &blocks {
        let region = memory.memory_at_address(*base).unwrap();
        assert_eq!(region.bytes, bytes.as_slice());
    }

    let system = dump.get_system_info().unwrap();
    assert_eq!(system.arch, CpuArch::Amd64);
    assert_eq!(system.os_name(), "Linux");
    assert_eq!(dump.get_misc_info().unwrap().process_id, Some(PID as u32));

    // Without a crash the first thread asks for the dump.
    let exception = dump.get_exception().unwrap();
    assert_eq!(exception.thread_id, PID as u32);
    assert_eq!(exception.code, 0xffff_ffff);
    assert_eq!(
        dump.get_breakpad_info().unwrap().requesting_thread_id,
        Some(PID as u32)
    );
}

#[test]
fn shared_stack_memory_is_stored_once() {
    let (mut process, memory) = fgh_process(2);
    process.threads[1].stack = process.threads[0].stack;

    let mut builder = MinidumpBuilder::from_source(Box::new(process), Box::new(memory));
    let mut data = Vec::new();
    builder.write(&mut data).unwrap();

    let dump = Minidump::read(data).unwrap();
    let threads = dump.get_thread_list().unwrap();
    let first = threads.threads[0].stack.as_ref().unwrap();
    let second = threads.threads[1].stack.as_ref().unwrap();
    assert_eq!(first.bytes.as_ptr(), second.bytes.as_ptr());
    assert_eq!(dump.get_memory_list().unwrap().regions.len(), 1);
}

#[test]
fn crash_is_recorded_with_code_window() {
    let (mut process, mut memory) = fgh_process(3);
    let pc = process.threads[1].context.instruction_pointer();
    process.crash = Some(CrashInfo {
        tid: PID + 1,
        signal: 11,
        code: 1,
        address: 0x10,
        extra: Vec::new(),
    });
    memory.blocks.push((APP_BASE, vec![0xcc; 0x1_0000]));

    let mut builder = MinidumpBuilder::from_source(Box::new(process), Box::new(memory));
    let mut data = Vec::new();
    let summary = builder.write(&mut data).unwrap();
    assert_eq!(summary.error_count(), 0);

    let dump = Minidump::read(data).unwrap();
    let exception = dump.get_exception().unwrap();
    assert_eq!(exception.thread_id, (PID + 1) as u32);
    assert_eq!(exception.code, 11);
    assert_eq!(exception.flags, 1);
    assert_eq!(exception.address, 0x10);
    assert_eq!(exception.context.unwrap().instruction_pointer(), pc);

    let memory = dump.get_memory_list().unwrap();
    let window = memory.memory_at_address(pc).unwrap();
    assert_eq!(window.size(), 256);
    assert!(window.contains(pc - 128));
    assert!(window.bytes.iter().all(|b| *b == 0xcc));
}

#[test]
fn write_to_file_leaves_only_the_dump() {
    let (process, memory) = fgh_process(1);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.dmp");

    let mut builder = MinidumpBuilder::from_source(Box::new(process), Box::new(memory));
    let summary = builder.write_to_file(&path).unwrap();

    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        summary.bytes_written as u64
    );
    let dump = Minidump::read_path(&path).unwrap();
    assert_eq!(dump.get_thread_list().unwrap().threads.len(), 1);
}

#[test]
fn extra_ranges_are_captured() {
    let (process, memory) = fgh_process(1);
    let options = postmortem::DumpOptions {
        extra_ranges: vec![MemoryRange::new(STACK_BASE + 0x10, 0x20)],
        ..Default::default()
    };

    let mut builder =
        MinidumpBuilder::from_source(Box::new(process), Box::new(memory)).options(options);
    let mut data = Vec::new();
    builder.write(&mut data).unwrap();

    let dump = Minidump::read(data).unwrap();
    let memory = dump.get_memory_list().unwrap();
    assert_eq!(memory.regions.len(), 2);
    let extra = memory
        .regions
        .iter()
        .find(|r| r.base_address == STACK_BASE + 0x10)
        .unwrap();
    assert_eq!(extra.size(), 0x20);
    assert_eq!(extra.read_u64(STACK_BASE + 0x10), Some(STACK_BASE + 0x30));
}
