// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod common;

use common::fgh_process;
use postmortem::{
    process_minidump, CrashInfo, Minidump, MinidumpBuilder, ProcessorOptions, ReadError,
    Symbolizer,
};
use std::path::Path;

const HEADER_SIZE: usize = 32;
const DIRECTORY_ENTRY_SIZE: usize = 12;

fn sample() -> Vec<u8> {
    let (mut process, memory) = fgh_process(2);
    process.crash = Some(CrashInfo {
        tid: common::PID,
        signal: 11,
        code: 2,
        address: 0xdead,
        extra: vec![1, 2],
    });
    let mut builder = MinidumpBuilder::from_source(Box::new(process), Box::new(memory));
    let mut data = Vec::new();
    builder.write(&mut data).unwrap();
    data
}

/// Touches every stream; only typed failures are acceptable.
fn exercise(dump: &Minidump) {
    let _ = dump.get_thread_list();
    let _ = dump.get_module_list();
    let _ = dump.get_memory_list();
    let _ = dump.get_exception();
    let _ = dump.get_system_info();
    let _ = dump.get_misc_info();
    let _ = dump.get_breakpad_info();
    let _ = dump.print(&mut std::io::sink());
    let symbolizer = Symbolizer::from_paths::<&Path>(&[]);
    let _ = process_minidump(dump, &symbolizer, &ProcessorOptions::default());
}

#[test]
fn out_of_range_directory_entries_fail_per_stream() {
    let data = sample();
    let dump = Minidump::read(data.clone()).unwrap();
    exercise(&dump);
    let directory_rva = u32::from_ne_bytes(data[12..16].try_into().unwrap()) as usize;
    let len = data.len() as u32;

    let bad: [(u32, u32); 6] = [
        (u32::MAX, 1),
        (u32::MAX - 3, 8),
        (len, 1),
        (len - 4, 8),
        (16, u32::MAX),
        (0, len + 1),
    ];
    for index in 0..dump.directory().len() {
        for (rva, size) in bad {
            let mut corrupt = data.clone();
            let entry = directory_rva + index * DIRECTORY_ENTRY_SIZE;
            corrupt[entry + 4..entry + 8].copy_from_slice(&size.to_ne_bytes());
            corrupt[entry + 8..entry + 12].copy_from_slice(&rva.to_ne_bytes());

            let dump = Minidump::read(corrupt).unwrap();
            let stream_type = dump.directory()[index].stream_type;
            assert!(matches!(
                dump.raw_stream(stream_type),
                Err(ReadError::StreamOutOfBounds { .. })
            ));
            exercise(&dump);
        }
    }
}

#[test]
fn garbage_inside_streams_is_contained() {
    let data = sample();
    let dump = Minidump::read(data.clone()).unwrap();
    let directory_rva = u32::from_ne_bytes(data[12..16].try_into().unwrap()) as usize;

    // Point every list count at huge values.
    for index in 0..dump.directory().len() {
        let entry = directory_rva + index * DIRECTORY_ENTRY_SIZE;
        let rva = u32::from_ne_bytes(data[entry + 8..entry + 12].try_into().unwrap()) as usize;
        let mut corrupt = data.clone();
        if rva + 4 <= corrupt.len() {
            corrupt[rva..rva + 4].copy_from_slice(&u32::MAX.to_ne_bytes());
        }
        exercise(&Minidump::read(corrupt).unwrap());
    }
}

#[test]
fn truncated_files_never_read_past_the_end() {
    let data = sample();
    for len in (0..data.len()).step_by(13) {
        if let Ok(dump) = Minidump::read(data[..len].to_vec()) {
            exercise(&dump);
        }
    }
    assert!(matches!(
        Minidump::read(data[..HEADER_SIZE - 1].to_vec()),
        Err(ReadError::Truncated { .. })
    ));
}

#[test]
fn header_signature_is_checked() {
    let mut data = sample();
    data[0] ^= 0xff;
    assert!(matches!(
        Minidump::read(data),
        Err(ReadError::HeaderMismatch)
    ));
}
