// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg(target_os = "linux")]

use postmortem::{CoreError, Minidump, MinidumpBuilder};
use std::process::{Child, Command};
use std::time::Duration;

struct KillOnDrop(Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[test]
fn dumps_a_sleeping_child() {
    let child = KillOnDrop(Command::new("sleep").arg("30").spawn().unwrap());
    std::thread::sleep(Duration::from_millis(200));
    let pid = child.0.id() as i32;

    let mut builder = match MinidumpBuilder::new(pid) {
        Ok(builder) => builder,
        Err(CoreError::NoThreadsSuspended(_)) | Err(CoreError::NixError(_)) => {
            eprintln!("ptrace is not permitted here, skipping");
            return;
        }
        Err(e) => panic!("cannot attach to {pid}: {e}"),
    };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sleep.dmp");
    builder.write_to_file(&path).unwrap();
    drop(builder);

    let dump = Minidump::read_path(&path).unwrap();
    assert_eq!(dump.get_misc_info().unwrap().process_id, Some(pid as u32));
    let threads = dump.get_thread_list().unwrap();
    assert_eq!(threads.threads.len(), 1);
    assert_eq!(threads.threads[0].thread_id, pid as u32);
    assert!(threads.threads[0].stack.is_some());
    assert!(!dump.get_module_list().unwrap().modules.is_empty());
    assert!(dump.get_linux_stream(postmortem::StreamType::LinuxMaps).is_ok());
}

#[test]
fn refuses_to_dump_itself() {
    assert!(matches!(
        MinidumpBuilder::new(std::process::id() as i32),
        Err(CoreError::CantDumpItself)
    ));
}
