// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Errors that might be seen when capturing, reading and analyzing minidumps.

use thiserror::Error;

/// Fatal error encountered while capturing a process into a minidump
#[derive(Debug, Error)]
pub enum CoreError {
    /// A process cannot dump itself
    #[error("cannot create a minidump for the process itself")]
    CantDumpItself,
    /// None of the threads of the target could be suspended
    #[error("no thread of process {0} could be suspended")]
    NoThreadsSuspended(i32),
    /// Every thread was dropped before its registers could be recorded
    #[error("no thread of process {0} could be captured")]
    NoThreadsCaptured(i32),
    /// A /proc file parsing error
    #[error("/proc parsing error: {0}")]
    ProcParsingError(String),
    /// A /proc file parsing error
    #[error("/proc integer parsing error")]
    ProcIntParsingError(#[from] std::num::ParseIntError),
    /// A path under the proc file system could not be built
    #[error("invalid proc path for pid {pid} and node {node:?}")]
    InvalidProcPath {
        /// Process id the path was requested for
        pid: i32,
        /// Node name under the process directory
        node: String,
    },
    /// The core file is malformed or unsupported
    #[error("invalid core file: {0}")]
    InvalidCoreFile(&'static str),
    /// The target machine type is not supported for capture
    #[error("unsupported machine type {0}")]
    UnsupportedMachine(u16),
    /// A memory read came back short or failed
    #[error("cannot read {len:#x} bytes of memory at {address:#x}")]
    MemoryRead {
        /// Start of the failed read
        address: u64,
        /// Requested length
        len: usize,
    },
    /// Fewer bytes than requested could be read
    #[error("read {read:#x} of {len:#x} bytes at {address:#x}")]
    PartialRead {
        /// Start of the read
        address: u64,
        /// Requested length
        len: usize,
        /// Bytes actually read
        read: usize,
    },
    /// The dump outgrew the 32-bit offsets of the container
    #[error("minidump exceeds the 4 GiB offset range")]
    DumpTooLarge,
    /// Internal error
    #[error("internal error: {0}")]
    InternalError(&'static str),
    /// OS error
    #[error("OS error")]
    NixError(#[from] nix::Error),
    /// I/O error
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
    /// The output file could not be moved into place
    #[error("cannot persist the output file")]
    PersistError(#[from] tempfile::PersistError),
}

/// A recoverable failure recorded during capture.
///
/// Soft errors never abort the dump; they are returned alongside a successful
/// [`crate::DumpSummary`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SoftError {
    /// A thread could not be suspended and was left out of the dump
    #[error("cannot suspend thread {tid}: {reason}")]
    SuspendThread {
        /// Thread id
        tid: i32,
        /// OS error description
        reason: String,
    },
    /// The registers of a suspended thread could not be read
    #[error("cannot read registers of thread {tid}: {reason}")]
    ThreadRegisters {
        /// Thread id
        tid: i32,
        /// OS error description
        reason: String,
    },
    /// A thread had a null stack pointer and was dropped
    #[error("thread {0} has a null stack pointer")]
    NullStackPointer(i32),
    /// The stack memory of a thread could not be captured
    #[error("cannot read {len:#x} bytes of stack of thread {tid} at {start:#x}")]
    StackRead {
        /// Thread id
        tid: i32,
        /// Start of the stack range
        start: u64,
        /// Length of the stack range
        len: u64,
    },
    /// An extra memory range could not be captured
    #[error("cannot read memory range {start:#x}+{len:#x}")]
    MemoryRead {
        /// Start of the range
        start: u64,
        /// Length of the range
        len: u64,
    },
    /// A file describing the process could not be read
    #[error("cannot read {path}: {reason}")]
    ProcFile {
        /// Path of the file
        path: String,
        /// I/O error description
        reason: String,
    },
    /// No identifier could be computed for a module
    #[error("cannot identify module {0}")]
    ModuleIdentifier(String),
}

/// Error encountered while reading a minidump
#[derive(Debug, Error)]
pub enum ReadError {
    /// I/O error while loading the file
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
    /// The header does not carry the minidump signature
    #[error("header signature mismatch")]
    HeaderMismatch,
    /// The header carries an unsupported version
    #[error("unsupported minidump version {0:#x}")]
    VersionMismatch(u32),
    /// Data ended before a structure could be read
    #[error("truncated data: {needed} bytes needed at offset {offset:#x}, {available} available")]
    Truncated {
        /// Offset of the read
        offset: usize,
        /// Bytes needed
        needed: usize,
        /// Bytes available
        available: usize,
    },
    /// The stream directory does not fit in the file
    #[error("stream directory out of bounds")]
    DirectoryOutOfBounds,
    /// The requested stream is not in the directory
    #[error("stream {0:#x} not present")]
    StreamNotPresent(u32),
    /// The requested stream points outside the file
    #[error("stream {stream_type:#x} at {rva:#x}+{size:#x} is out of bounds")]
    StreamOutOfBounds {
        /// Stream type tag
        stream_type: u32,
        /// Offset of the stream
        rva: u32,
        /// Declared size of the stream
        size: u32,
    },
    /// A stream is shorter than its declared contents
    #[error("stream {0:#x} has an inconsistent size")]
    StreamSizeMismatch(u32),
    /// A CPU context could not be recognized
    #[error("unknown CPU context of {0} bytes")]
    UnknownContext(usize),
}

/// Error encountered while loading symbols
#[derive(Debug, Error)]
pub enum SymbolError {
    /// No symbol file was found for the module
    #[error("symbols not found")]
    NotFound,
    /// I/O error while loading the symbol file
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
    /// A record of the symbol file could not be parsed
    #[error("parse error at line {line}: {reason}")]
    ParseError {
        /// One-based line number
        line: usize,
        /// What was wrong with the record
        reason: &'static str,
    },
}

/// Error encountered while producing a process state report
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The dump has no usable thread list
    #[error("minidump has no thread list")]
    NoThreadList(#[source] ReadError),
    /// None of the threads produced a single frame
    #[error("no thread could be walked")]
    NoUsableThreads,
}
