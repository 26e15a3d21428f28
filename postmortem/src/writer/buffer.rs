// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The flat output buffer of a minidump and the pool of captured memory.

use crate::format::{MDLocationDescriptor, MDMemoryDescriptor};
use crate::snapshot::MemoryRange;
use crate::{CoreError, ReadProcessMemory};
use std::collections::HashMap;
use zerocopy::{Immutable, IntoBytes};

/// Allocations are aligned like the structures they hold.
const ALIGNMENT: usize = 8;

/// Minidump contents, addressed by 32-bit offsets from the file start.
///
/// The buffer is sized up front so that capturing does not need to grow it
/// while the target is suspended; growing is still allowed as a fallback.
pub(crate) struct DumpBuf {
    data: Vec<u8>,
}

impl DumpBuf {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn position(&self) -> usize {
        self.data.len()
    }

    fn rva(offset: usize) -> Result<u32, CoreError> {
        u32::try_from(offset).map_err(|_| CoreError::DumpTooLarge)
    }

    /// Appends `len` zero bytes at an aligned offset and returns the offset.
    pub fn reserve(&mut self, len: usize) -> Result<u32, CoreError> {
        let start = self.data.len().next_multiple_of(ALIGNMENT);
        let end = start.checked_add(len).ok_or(CoreError::DumpTooLarge)?;
        Self::rva(end)?;
        self.data.resize(end, 0);
        Self::rva(start)
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<MDLocationDescriptor, CoreError> {
        let rva = self.reserve(bytes.len())?;
        let start = rva as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(MDLocationDescriptor {
            data_size: bytes.len() as u32,
            rva,
        })
    }

    pub fn append_struct<T: IntoBytes + Immutable>(
        &mut self,
        value: &T,
    ) -> Result<MDLocationDescriptor, CoreError> {
        self.append(value.as_bytes())
    }

    /// Overwrites bytes written earlier.
    pub fn write_at(&mut self, rva: u32, bytes: &[u8]) -> Result<(), CoreError> {
        let start = rva as usize;
        let target = start
            .checked_add(bytes.len())
            .and_then(|end| self.data.get_mut(start..end))
            .ok_or(CoreError::InternalError("patch outside of the dump buffer"))?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    /// Appends a length-prefixed, NUL terminated UTF-16 string in host byte
    /// order.
    pub fn append_string(&mut self, text: &str) -> Result<u32, CoreError> {
        let units: Vec<u16> = text.encode_utf16().collect();
        let mut bytes = Vec::with_capacity(4 + units.len() * 2 + 2);
        bytes.extend_from_slice(&((units.len() * 2) as u32).to_ne_bytes());
        for unit in units.iter().chain(std::iter::once(&0)) {
            bytes.extend_from_slice(&unit.to_ne_bytes());
        }
        Ok(self.append(&bytes)?.rva)
    }

    /// Copies `range` of the target straight into the buffer.
    ///
    /// On failure nothing is appended.
    pub fn capture(
        &mut self,
        reader: &mut dyn ReadProcessMemory,
        range: MemoryRange,
    ) -> Result<MDLocationDescriptor, CoreError> {
        let len = usize::try_from(range.len).map_err(|_| CoreError::DumpTooLarge)?;
        let rollback = self.data.len();
        let rva = self.reserve(len)?;
        let start = rva as usize;
        match reader.read_exact(range.start, &mut self.data[start..start + len]) {
            Ok(()) => Ok(MDLocationDescriptor {
                data_size: len as u32,
                rva,
            }),
            Err(e) => {
                self.data.truncate(rollback);
                Err(e)
            }
        }
    }

    /// Appends a `u32` count followed by the records.
    pub fn append_list<T: IntoBytes + Immutable>(
        &mut self,
        items: &[T],
    ) -> Result<MDLocationDescriptor, CoreError> {
        let mut bytes = Vec::with_capacity(4 + std::mem::size_of_val(items));
        bytes.extend_from_slice(&(items.len() as u32).to_ne_bytes());
        bytes.extend_from_slice(items.as_bytes());
        self.append(&bytes)
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// Captured memory, each distinct range stored once.
#[derive(Default)]
pub(crate) struct MemoryPool {
    locations: HashMap<MemoryRange, MDLocationDescriptor>,
    descriptors: Vec<MDMemoryDescriptor>,
}

impl MemoryPool {
    /// Returns the location of `range`, capturing it on first use.
    pub fn add(
        &mut self,
        buf: &mut DumpBuf,
        reader: &mut dyn ReadProcessMemory,
        range: MemoryRange,
    ) -> Result<MDMemoryDescriptor, CoreError> {
        let memory = match self.locations.get(&range) {
            Some(location) => *location,
            None => {
                let location = buf.capture(reader, range)?;
                tracing::debug!(
                    "Captured [0x{:x}; 0x{:x}] at offset 0x{:x}",
                    range.start,
                    range.end(),
                    location.rva
                );
                self.locations.insert(range, location);
                let descriptor = MDMemoryDescriptor {
                    start_of_memory_range: range.start,
                    memory: location,
                };
                self.descriptors.push(descriptor);
                location
            }
        };
        Ok(MDMemoryDescriptor {
            start_of_memory_range: range.start,
            memory,
        })
    }

    pub fn descriptors(&self) -> &[MDMemoryDescriptor] {
        &self.descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pattern {
        reads: usize,
    }

    impl ReadProcessMemory for Pattern {
        fn read_process_memory(&mut self, base: usize, buf: &mut [u8]) -> Result<usize, CoreError> {
            self.reads += 1;
            if base == 0 {
                return Err(CoreError::MemoryRead {
                    address: 0,
                    len: buf.len(),
                });
            }
            for (i, b) in buf.iter_mut().enumerate() {
                *b = (base + i) as u8;
            }
            Ok(buf.len())
        }
    }

    #[test]
    fn allocations_are_aligned() {
        let mut buf = DumpBuf::with_capacity(64);
        assert_eq!(buf.append(&[1, 2, 3]).unwrap().rva, 0);
        assert_eq!(buf.reserve(4).unwrap(), 8);
        buf.write_at(8, &[9; 4]).unwrap();
        assert!(buf.write_at(10, &[0; 4]).is_err());
        assert_eq!(buf.into_inner()[8..12], [9; 4]);
    }

    #[test]
    fn strings_are_utf16_with_terminator() {
        let mut buf = DumpBuf::with_capacity(64);
        let at = buf.append_string("ab").unwrap() as usize;
        let data = buf.into_inner();
        let mut expected = 4_u32.to_ne_bytes().to_vec();
        for unit in [b'a' as u16, b'b' as u16, 0] {
            expected.extend_from_slice(&unit.to_ne_bytes());
        }
        assert_eq!(data[at..at + 10], expected[..]);
    }

    #[test]
    fn pool_stores_each_range_once() {
        let mut buf = DumpBuf::with_capacity(256);
        let mut reader = Pattern { reads: 0 };
        let mut pool = MemoryPool::default();
        let range = MemoryRange::new(0x1000, 16);
        let a = pool.add(&mut buf, &mut reader, range).unwrap();
        let b = pool.add(&mut buf, &mut reader, range).unwrap();
        assert_eq!(a.memory.rva, b.memory.rva);
        assert_eq!(reader.reads, 1);
        assert_eq!(pool.descriptors().len(), 1);

        let before = buf.position();
        assert!(pool
            .add(&mut buf, &mut reader, MemoryRange::new(0, 16))
            .is_err());
        assert_eq!(buf.position(), before);
        assert_eq!(pool.descriptors().len(), 1);
    }
}
