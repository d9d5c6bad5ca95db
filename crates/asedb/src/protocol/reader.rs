//! Token payload reading utilities.
//!
//! Every read returns `None` when the buffer does not hold enough bytes.
//! The codec relies on that to tell "wait for the next packet" apart from
//! real corruption.

#![allow(clippy::cast_possible_truncation)]

/// A cursor over little-endian TDS token data.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.read_array::<2>().map(u16::from_le_bytes)
    }

    pub fn read_i16(&mut self) -> Option<i16> {
        self.read_array::<2>().map(i16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.read_array::<4>().map(u32::from_le_bytes)
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        self.read_array::<4>().map(i32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        self.read_array::<8>().map(u64::from_le_bytes)
    }

    pub fn read_i64(&mut self) -> Option<i64> {
        self.read_array::<8>().map(i64::from_le_bytes)
    }

    pub fn read_f32(&mut self) -> Option<f32> {
        self.read_array::<4>().map(f32::from_le_bytes)
    }

    pub fn read_f64(&mut self) -> Option<f64> {
        self.read_array::<8>().map(f64::from_le_bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        self.read_bytes(n).map(|_| ())
    }

    /// Read a string prefixed by a one-byte length.
    pub fn read_b_varchar(&mut self) -> Option<String> {
        let len = usize::from(self.read_u8()?);
        self.read_bytes(len)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read a string prefixed by a two-byte length.
    pub fn read_us_varchar(&mut self) -> Option<String> {
        let len = usize::from(self.read_u16()?);
        self.read_bytes(len)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Split off a sub-reader over the next `len` bytes.
    pub fn sub_reader(&mut self, len: usize) -> Option<PacketReader<'a>> {
        self.read_bytes(len).map(PacketReader::new)
    }
}
