// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Endian-aware, bounds-checked access to raw bytes.

use crate::ReadError;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::Serialize;

/// Byte order of the target a dump was captured from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Endian {
    /// Least significant byte first
    #[default]
    Little,
    /// Most significant byte first
    Big,
}

impl Endian {
    /// Byte order of the host
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    /// Reads a `u16`, `buf` must hold at least 2 bytes.
    pub fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(buf),
            Endian::Big => BigEndian::read_u16(buf),
        }
    }

    /// Reads a `u32`, `buf` must hold at least 4 bytes.
    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(buf),
            Endian::Big => BigEndian::read_u32(buf),
        }
    }

    /// Reads a `u64`, `buf` must hold at least 8 bytes.
    pub fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_u64(buf),
            Endian::Big => BigEndian::read_u64(buf),
        }
    }

    fn write_u16(self, buf: &mut [u8], v: u16) {
        match self {
            Endian::Little => LittleEndian::write_u16(buf, v),
            Endian::Big => BigEndian::write_u16(buf, v),
        }
    }

    fn write_u32(self, buf: &mut [u8], v: u32) {
        match self {
            Endian::Little => LittleEndian::write_u32(buf, v),
            Endian::Big => BigEndian::write_u32(buf, v),
        }
    }

    fn write_u64(self, buf: &mut [u8], v: u64) {
        match self {
            Endian::Little => LittleEndian::write_u64(buf, v),
            Endian::Big => BigEndian::write_u64(buf, v),
        }
    }
}

/// A forward-only reader over a byte slice that never reads out of bounds.
#[derive(Clone, Debug)]
pub(crate) struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8], endian: Endian) -> Self {
        Self {
            data,
            pos: 0,
            endian,
        }
    }

    /// Starts reading at `offset` within `data`.
    pub fn at(data: &'a [u8], offset: usize, endian: Endian) -> Result<Self, ReadError> {
        if offset > data.len() {
            return Err(ReadError::Truncated {
                offset,
                needed: 0,
                available: data.len(),
            });
        }
        Ok(Self {
            data,
            pos: offset,
            endian,
        })
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], ReadError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(ReadError::Truncated {
                offset: self.pos,
                needed: len,
                available: self.remaining(),
            })?;
        let data = self.data;
        let out = &data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), ReadError> {
        self.bytes(len).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, ReadError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ReadError> {
        let endian = self.endian;
        Ok(endian.read_u16(self.bytes(2)?))
    }

    pub fn u32(&mut self) -> Result<u32, ReadError> {
        let endian = self.endian;
        Ok(endian.read_u32(self.bytes(4)?))
    }

    pub fn u64(&mut self) -> Result<u64, ReadError> {
        let endian = self.endian;
        Ok(endian.read_u64(self.bytes(8)?))
    }

    pub fn u32_array<const N: usize>(&mut self) -> Result<[u32; N], ReadError> {
        let mut out = [0_u32; N];
        for v in out.iter_mut() {
            *v = self.u32()?;
        }
        Ok(out)
    }

    pub fn u64_array<const N: usize>(&mut self) -> Result<[u64; N], ReadError> {
        let mut out = [0_u64; N];
        for v in out.iter_mut() {
            *v = self.u64()?;
        }
        Ok(out)
    }

    pub fn blob(&mut self, len: usize) -> Result<Vec<u8>, ReadError> {
        Ok(self.bytes(len)?.to_vec())
    }
}

/// Appends fixed-width integers in a chosen byte order.
#[derive(Debug, Default)]
pub(crate) struct ByteSink {
    buf: Vec<u8>,
    endian: Endian,
}

impl ByteSink {
    pub fn with_capacity(capacity: usize, endian: Endian) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            endian,
        }
    }

    pub fn u16(&mut self, v: u16) {
        let mut b = [0_u8; 2];
        self.endian.write_u16(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub fn u32(&mut self, v: u32) {
        let mut b = [0_u8; 4];
        self.endian.write_u32(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub fn u64(&mut self, v: u64) {
        let mut b = [0_u8; 8];
        self.endian.write_u64(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub fn u32s(&mut self, values: &[u32]) {
        values.iter().for_each(|v| self.u32(*v));
    }

    pub fn u64s(&mut self, values: &[u64]) {
        values.iter().for_each(|v| self.u64(*v));
    }

    /// Writes exactly `len` bytes of `blob`, zero padding or cutting it.
    pub fn blob(&mut self, blob: &[u8], len: usize) {
        let n = blob.len().min(len);
        self.buf.extend_from_slice(&blob[..n]);
        self.buf.resize(self.buf.len() + (len - n), 0);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
