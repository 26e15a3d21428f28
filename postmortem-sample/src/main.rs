// Copyright (C) Microsoft Corporation.
// Licensed under the MIT License.

//! Sample front end for capturing and analyzing minidumps.
//!
//! `postmortem-sample dump <pid> <output_path> [mapped_root]`
//!
//! Writes a minidump of the live process `pid` to `output_path`.
//!
//! `postmortem-sample core <core_file> <procfs_dir> <output_path> [mapped_root]`
//!
//! Converts a core file to a minidump. `procfs_dir` is a copy of the
//! process' `/proc/<pid>` directory, or `-` when there is none.
//!
//! `postmortem-sample stackwalk [--json] <minidump> [symbol_paths...]`
//!
//! Walks every thread of a minidump and prints the report.
//!
//! `postmortem-sample print <minidump>`
//!
//! Prints every stream of a minidump.
//!
//! An optional `-v` parameter may be specified before any options to enable
//! debug level tracing. The exit code is non-zero when anything went wrong,
//! even if output was produced.

use anyhow::Context;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;

fn exit_code(failures: usize) -> ExitCode {
    ExitCode::from(u8::try_from(failures).unwrap_or(u8::MAX))
}

#[cfg(target_os = "linux")]
fn dump(mut args: impl Iterator<Item = String>) -> anyhow::Result<ExitCode> {
    let pid: i32 = args
        .next()
        .context("missing pid")?
        .parse()
        .context("failed to parse pid")?;
    let output_path = PathBuf::from(args.next().context("missing output_path")?);
    let options = postmortem::DumpOptions {
        mapped_root: args.next().map(PathBuf::from),
        ..Default::default()
    };
    if args.next().is_some() {
        anyhow::bail!("unexpected extra arguments");
    }

    let mut builder = postmortem::MinidumpBuilder::with_options(pid, options)
        .with_context(|| format!("unable to attach to process {pid}"))?;
    let summary = builder.write_to_file(&output_path)?;
    report_summary(&summary);
    Ok(exit_code(summary.error_count()))
}

#[cfg(target_os = "linux")]
fn core(mut args: impl Iterator<Item = String>) -> anyhow::Result<ExitCode> {
    let core_path = PathBuf::from(args.next().context("missing core_file")?);
    let procfs_dir = args
        .next()
        .context("missing procfs_dir")?;
    let procfs_dir = (procfs_dir != "-").then(|| PathBuf::from(procfs_dir));
    let output_path = PathBuf::from(args.next().context("missing output_path")?);
    let options = postmortem::DumpOptions {
        mapped_root: args.next().map(PathBuf::from),
        ..Default::default()
    };
    if args.next().is_some() {
        anyhow::bail!("unexpected extra arguments");
    }

    let mut builder =
        postmortem::MinidumpBuilder::from_core_file(&core_path, procfs_dir.as_deref(), options)
            .with_context(|| format!("unable to read {}", core_path.display()))?;
    let summary = builder.write_to_file(&output_path)?;
    report_summary(&summary);
    Ok(exit_code(summary.error_count()))
}

#[cfg(target_os = "linux")]
fn report_summary(summary: &postmortem::DumpSummary) {
    for error in &summary.soft_errors {
        tracing::warn!("{error}");
    }
    tracing::debug!(
        "wrote {} bytes with {} errors",
        summary.bytes_written,
        summary.error_count()
    );
}

fn stackwalk(args: impl Iterator<Item = String>) -> anyhow::Result<ExitCode> {
    let mut json = false;
    let mut paths = Vec::new();
    for arg in args {
        if arg == "--json" {
            json = true;
        } else {
            paths.push(PathBuf::from(arg));
        }
    }
    if paths.is_empty() {
        anyhow::bail!("missing minidump");
    }
    let dump_path = paths.remove(0);

    let dump = postmortem::Minidump::read_path(&dump_path)
        .with_context(|| format!("unable to read {}", dump_path.display()))?;
    let symbolizer = postmortem::Symbolizer::from_paths(&paths);
    let options = postmortem::ProcessorOptions {
        parallel: true,
        ..Default::default()
    };
    let state = postmortem::process_minidump(&dump, &symbolizer, &options)
        .context("unable to process minidump")?;

    let stdout = std::io::stdout();
    if json {
        state.print_json(stdout.lock())?;
        println!();
    } else {
        state.print(&mut stdout.lock())?;
    }

    let failures = state
        .threads
        .iter()
        .filter(|t| t.stack.frames.is_empty())
        .count()
        + state.modules_with_corrupt_symbols().count();
    Ok(exit_code(failures))
}

fn print(mut args: impl Iterator<Item = String>) -> anyhow::Result<ExitCode> {
    let dump_path = PathBuf::from(args.next().context("missing minidump")?);
    if args.next().is_some() {
        anyhow::bail!("unexpected extra arguments");
    }
    let dump = postmortem::Minidump::read_path(&dump_path)
        .with_context(|| format!("unable to read {}", dump_path.display()))?;
    let errors = dump.print(&mut std::io::stdout().lock())?;
    Ok(exit_code(errors))
}

pub fn main() -> anyhow::Result<ExitCode> {
    let mut args = std::env::args().skip(1).peekable();

    let level = if args.peek().is_some_and(|x| x == "-v") {
        args.next();
        Level::DEBUG
    } else {
        Level::WARN
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    let command = args.next().context("missing command")?;
    match command.as_str() {
        #[cfg(target_os = "linux")]
        "dump" => dump(args),
        #[cfg(target_os = "linux")]
        "core" => core(args),
        "stackwalk" => stackwalk(args),
        "print" => print(args),
        other => anyhow::bail!("unknown command {other}"),
    }
}
