// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod common;

use common::{fgh_process, APP_SYMBOLS, PID, STACK_BASE};
use postmortem::{
    process_minidump, CrashInfo, FrameTrust, Minidump, MinidumpBuilder, ProcessError,
    ProcessorOptions, SymbolStatus, Symbolizer, Verdict, WalkStatus,
};
use std::path::Path;

fn dump_of(process: common::SyntheticProcess, memory: common::SyntheticMemory) -> Minidump {
    let mut builder = MinidumpBuilder::from_source(Box::new(process), Box::new(memory));
    let mut data = Vec::new();
    builder.write(&mut data).unwrap();
    Minidump::read(data).unwrap()
}

/// Stores the symbols of the app module the way a symbol server lays them out.
fn store_symbols(dump: &Minidump, root: &Path) {
    let modules = dump.get_module_list().unwrap();
    let module = &modules.modules[0];
    let dir = root.join(&module.debug_file).join(&module.debug_identifier);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{}.sym", module.debug_file)), APP_SYMBOLS).unwrap();
}

#[test]
fn walks_h_g_f_with_frame_pointers() {
    let (process, memory) = fgh_process(1);
    let dump = dump_of(process, memory);
    let symbols = tempfile::tempdir().unwrap();
    store_symbols(&dump, symbols.path());

    let symbolizer = Symbolizer::from_paths(&[symbols.path()]);
    let state = process_minidump(&dump, &symbolizer, &ProcessorOptions::default()).unwrap();

    assert_eq!(state.threads.len(), 1);
    let stack = &state.threads[0].stack;
    let names: Vec<_> = stack.frames.iter().map(|f| f.function_name()).collect();
    assert_eq!(names, [Some("h"), Some("g"), Some("f"), Some("main")]);
    let trust: Vec<_> = stack.frames.iter().map(|f| f.trust).collect();
    assert_eq!(
        trust,
        [
            FrameTrust::Context,
            FrameTrust::FramePointer,
            FrameTrust::FramePointer,
            FrameTrust::FramePointer
        ]
    );
    assert_eq!(stack.status, WalkStatus::Complete);

    let h = stack.frames[0].symbol.as_ref().unwrap().outermost().unwrap();
    assert_eq!(h.source_file.as_deref(), Some("app.c"));
    assert_eq!(h.source_line, Some(40));

    assert!(!state.crashed());
    assert_eq!(state.crash.as_ref().unwrap().reason, "DUMP_REQUESTED");
    assert_eq!(state.requesting_thread, Some(0));
    assert_eq!(state.process_id, Some(PID as u32));
    assert_eq!(state.modules[0].symbols, Some(SymbolStatus::Loaded));

    let mut text = Vec::new();
    state.print(&mut text).unwrap();
    let text = String::from_utf8(text).unwrap();
    assert!(text.contains("app!h [app.c : 40 + 0x10]"), "{text}");
    assert!(text.contains("Found by: previous frame's frame pointer"));

    let mut json = Vec::new();
    state.print_json(&mut json).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
    assert_eq!(
        value["threads"][0]["frames"][2]["symbol"]["frames"][0]["function"],
        "f"
    );
    assert_eq!(value["threads"][0]["frames"][1]["trust"], "frame_pointer");
}

#[test]
fn missing_symbols_still_yield_frames() {
    let (process, memory) = fgh_process(1);
    let dump = dump_of(process, memory);
    let empty = tempfile::tempdir().unwrap();

    let symbolizer = Symbolizer::from_paths(&[empty.path()]);
    let state = process_minidump(&dump, &symbolizer, &ProcessorOptions::default()).unwrap();

    let stack = &state.threads[0].stack;
    assert_eq!(stack.frames.len(), 4);
    assert!(stack.frames.iter().all(|f| f.symbol.is_none()));
    assert!(stack.frames.iter().all(|f| f.module.is_some()));
    assert_eq!(state.modules_without_symbols().count(), 1);
}

#[test]
fn corrupt_symbols_are_reported() {
    let (process, memory) = fgh_process(1);
    let dump = dump_of(process, memory);
    let symbols = tempfile::tempdir().unwrap();
    let modules = dump.get_module_list().unwrap();
    let module = &modules.modules[0];
    let dir = symbols.path().join(&module.debug_file).join(&module.debug_identifier);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("app.sym"), "FUNC zz 10 0 broken\n").unwrap();

    let symbolizer = Symbolizer::from_paths(&[symbols.path()]);
    let state = process_minidump(&dump, &symbolizer, &ProcessorOptions::default()).unwrap();
    assert_eq!(state.modules_with_corrupt_symbols().count(), 1);
    assert_eq!(state.threads[0].stack.frames.len(), 4);
}

#[test]
fn crashing_thread_is_identified() {
    let (mut process, memory) = fgh_process(3);
    process.crash = Some(CrashInfo {
        tid: PID + 2,
        signal: 11,
        code: 1,
        address: 0x8,
        extra: Vec::new(),
    });
    let dump = dump_of(process, memory);
    let symbols = tempfile::tempdir().unwrap();
    store_symbols(&dump, symbols.path());

    let symbolizer = Symbolizer::from_paths(&[symbols.path()]);
    let state = process_minidump(&dump, &symbolizer, &ProcessorOptions::default()).unwrap();

    assert!(state.crashed());
    assert_eq!(state.threads.len(), 3);
    assert_eq!(state.requesting_thread, Some(2));
    let crash = state.crash.as_ref().unwrap();
    assert_eq!(crash.thread_id, (PID + 2) as u32);
    assert_eq!(crash.reason, "SIGSEGV /SEGV_MAPERR");
    assert_eq!(crash.address, 0x8);
    assert_eq!(
        state.requesting_thread().unwrap().stack.frames[0].function_name(),
        Some("h")
    );
    assert_eq!(
        state.exploitability.as_ref().unwrap().verdict,
        Verdict::NotExploitable
    );
}

#[test]
fn parallel_walk_keeps_thread_order() {
    let (process, memory) = fgh_process(6);
    let dump = dump_of(process, memory);
    let symbols = tempfile::tempdir().unwrap();
    store_symbols(&dump, symbols.path());
    let symbolizer = Symbolizer::from_paths(&[symbols.path()]);

    let sequential = process_minidump(&dump, &symbolizer, &ProcessorOptions::default()).unwrap();
    let parallel = process_minidump(
        &dump,
        &symbolizer,
        &ProcessorOptions {
            parallel: true,
            ..Default::default()
        },
    )
    .unwrap();

    let ids = |s: &postmortem::ProcessState| -> Vec<u32> {
        s.threads.iter().map(|t| t.thread_id).collect()
    };
    assert_eq!(ids(&sequential), ids(&parallel));
    for (a, b) in sequential.threads.iter().zip(&parallel.threads) {
        let pcs = |t: &postmortem::ThreadState| -> Vec<u64> {
            t.stack.frames.iter().map(|f| f.instruction()).collect()
        };
        assert_eq!(pcs(a), pcs(b));
        assert_eq!(a.stack.frames.len(), 4);
    }
}

#[test]
fn cyclic_frame_chain_terminates() {
    let (process, mut memory) = fgh_process(1);
    // main's saved frame pointer leads back to h's frame.
    let stack = &mut memory.blocks[0].1;
    stack[0x70..0x78].copy_from_slice(&(STACK_BASE + 0x10).to_le_bytes());
    stack[0x78..0x80].copy_from_slice(&(common::APP_BASE + 0x1220).to_le_bytes());
    let dump = dump_of(process, memory);

    let options = ProcessorOptions {
        walker: postmortem::WalkerOptions {
            max_frames: 32,
            ..Default::default()
        },
        ..Default::default()
    };
    let symbolizer = Symbolizer::from_paths::<&Path>(&[]);
    let state = process_minidump(&dump, &symbolizer, &options).unwrap();
    let frames = &state.threads[0].stack.frames;
    assert!(frames.len() <= 32);
    let sps: Vec<u64> = frames.iter().map(|f| f.context.stack_pointer()).collect();
    assert!(sps.windows(2).all(|w| w[0] < w[1]), "{sps:x?}");
}

#[test]
fn dump_without_threads_is_unusable() {
    let (process, memory) = fgh_process(0);
    let dump = dump_of(process, memory);
    let symbolizer = Symbolizer::from_paths::<&Path>(&[]);
    assert!(matches!(
        process_minidump(&dump, &symbolizer, &ProcessorOptions::default()),
        Err(ProcessError::NoUsableThreads)
    ));
}
