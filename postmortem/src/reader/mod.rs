// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Random access to the streams of a minidump.
//!
//! Every offset found in the file is checked against the file size before it
//! is followed, so truncated or corrupted dumps produce a [`ReadError`] rather
//! than an out of bounds access.

mod print;
mod streams;

pub use streams::{
    BreakpadInfo, MemoryList, MemoryRegion, MinidumpException, MinidumpModule, MinidumpThread,
    MiscInfo, ModuleList, SystemInfo, ThreadList,
};

use crate::bytes::{ByteCursor, Endian};
use crate::format::{
    MDLocationDescriptor, StreamType, MD_HEADER_SIGNATURE, MD_HEADER_VERSION,
};
use crate::ReadError;
use std::path::Path;

const HEADER_SIZE: usize = 32;
const DIRECTORY_ENTRY_SIZE: usize = 12;

/// One entry of the stream directory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Raw stream type tag
    pub stream_type: u32,
    /// Declared size of the stream
    pub size: u32,
    /// Offset of the stream from the start of the file
    pub rva: u32,
}

/// A minidump loaded in memory
pub struct Minidump {
    data: Vec<u8>,
    endian: Endian,
    version: u32,
    time_date_stamp: u32,
    flags: u64,
    directory: Vec<DirectoryEntry>,
}

impl std::fmt::Debug for Minidump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Minidump")
            .field("len", &self.data.len())
            .field("endian", &self.endian)
            .field("streams", &self.directory.len())
            .finish()
    }
}

impl Minidump {
    /// Loads the minidump at `path`.
    pub fn read_path(path: impl AsRef<Path>) -> Result<Self, ReadError> {
        let path = path.as_ref();
        tracing::debug!("Reading {}", path.display());
        Self::read(std::fs::read(path)?)
    }

    /// Parses the header and directory of an in-memory minidump.
    pub fn read(data: Vec<u8>) -> Result<Self, ReadError> {
        let raw_signature = data
            .get(..4)
            .map(|b| Endian::Little.read_u32(b))
            .ok_or(ReadError::HeaderMismatch)?;
        let endian = if raw_signature == MD_HEADER_SIGNATURE {
            Endian::Little
        } else if raw_signature.swap_bytes() == MD_HEADER_SIGNATURE {
            Endian::Big
        } else {
            return Err(ReadError::HeaderMismatch);
        };

        let mut cursor = ByteCursor::new(&data, endian);
        cursor.skip(4)?;
        let version = cursor.u32()?;
        if version & 0xffff != MD_HEADER_VERSION {
            return Err(ReadError::VersionMismatch(version));
        }
        let stream_count = cursor.u32()? as usize;
        let directory_rva = cursor.u32()? as usize;
        let _checksum = cursor.u32()?;
        let time_date_stamp = cursor.u32()?;
        let flags = cursor.u64()?;
        debug_assert_eq!(cursor.position(), HEADER_SIZE);

        let directory_end = stream_count
            .checked_mul(DIRECTORY_ENTRY_SIZE)
            .and_then(|len| len.checked_add(directory_rva))
            .filter(|end| *end <= data.len())
            .ok_or(ReadError::DirectoryOutOfBounds)?;
        tracing::debug!(
            "Directory of {stream_count} streams at 0x{directory_rva:x}..0x{directory_end:x}"
        );

        let mut cursor = ByteCursor::at(&data, directory_rva, endian)?;
        let mut directory = Vec::with_capacity(stream_count);
        for _ in 0..stream_count {
            directory.push(DirectoryEntry {
                stream_type: cursor.u32()?,
                size: cursor.u32()?,
                rva: cursor.u32()?,
            });
        }

        Ok(Self {
            data,
            endian,
            version,
            time_date_stamp,
            flags,
            directory,
        })
    }

    /// Byte order of the dump
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Header version, format version in the low 16 bits
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Capture time, seconds since the epoch
    pub fn time_date_stamp(&self) -> u32 {
        self.time_date_stamp
    }

    /// Header flags
    pub fn flags(&self) -> u64 {
        self.flags
    }

    /// Entries of the stream directory, in file order
    pub fn directory(&self) -> &[DirectoryEntry] {
        &self.directory
    }

    /// Whole file contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes of the first stream of type `stream_type`.
    pub fn raw_stream(&self, stream_type: u32) -> Result<&[u8], ReadError> {
        let entry = self
            .directory
            .iter()
            .find(|e| e.stream_type == stream_type)
            .ok_or(ReadError::StreamNotPresent(stream_type))?;
        let start = entry.rva as usize;
        start
            .checked_add(entry.size as usize)
            .and_then(|end| self.data.get(start..end))
            .ok_or(ReadError::StreamOutOfBounds {
                stream_type,
                rva: entry.rva,
                size: entry.size,
            })
    }

    pub(crate) fn stream(&self, stream_type: StreamType) -> Result<&[u8], ReadError> {
        self.raw_stream(stream_type as u32)
    }

    /// Bytes a location descriptor points at.
    pub(crate) fn location(&self, location: MDLocationDescriptor) -> Result<&[u8], ReadError> {
        let start = location.rva as usize;
        start
            .checked_add(location.data_size as usize)
            .and_then(|end| self.data.get(start..end))
            .ok_or(ReadError::Truncated {
                offset: start,
                needed: location.data_size as usize,
                available: self.data.len().saturating_sub(start),
            })
    }

    /// Reads the length-prefixed UTF-16 string at `rva`.
    pub(crate) fn string_at(&self, rva: u32) -> Result<String, ReadError> {
        let mut cursor = ByteCursor::at(&self.data, rva as usize, self.endian)?;
        let len = cursor.u32()? as usize;
        let bytes = cursor.bytes(len & !1)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|unit| self.endian.read_u16(unit))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    /// One of the raw text streams copied from the target.
    pub fn get_linux_stream(&self, stream_type: StreamType) -> Result<&[u8], ReadError> {
        self.stream(stream_type)
    }
}

/// Reads a `u32` count followed by `count` records of `entry_size` bytes.
///
/// Some writers pad the count to 8 bytes; that layout is accepted too.
pub(crate) fn list_cursor<'a>(
    data: &'a [u8],
    endian: Endian,
    entry_size: usize,
    stream_type: StreamType,
) -> Result<(ByteCursor<'a>, usize), ReadError> {
    let mut cursor = ByteCursor::new(data, endian);
    let count = cursor.u32()? as usize;
    let expected = count
        .checked_mul(entry_size)
        .ok_or(ReadError::StreamSizeMismatch(stream_type as u32))?;
    if data.len() - 4 == expected + 4 {
        cursor.skip(4)?;
    } else if data.len() - 4 < expected {
        return Err(ReadError::StreamSizeMismatch(stream_type as u32));
    }
    Ok((cursor, count))
}
