//! Token payload writing and packet framing.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{PacketHeader, packet_status};

/// A writer for little-endian TDS token data.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::with_capacity(128)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }

    /// Write a login-record field: `width` bytes zero-padded, then the used
    /// length as one byte. Longer input is truncated to `width`.
    pub fn write_fixed_field(&mut self, data: &[u8], width: usize) {
        let used = data.len().min(width).min(usize::from(u8::MAX));
        self.buffer.extend_from_slice(&data[..used]);
        self.write_zeros(width - used);
        self.write_u8(used as u8);
    }

    /// Write a string prefixed by a one-byte length, truncated to 255 bytes.
    pub fn write_b_varchar(&mut self, s: &str) {
        let bytes = &s.as_bytes()[..s.len().min(usize::from(u8::MAX))];
        self.write_u8(bytes.len() as u8);
        self.write_bytes(bytes);
    }
}

/// Split a message payload into packets no larger than `packet_size`.
///
/// The last packet carries the end-of-message status bit. An empty payload
/// still produces one header-only packet (attention uses this).
pub fn build_packets(packet_type: u8, payload: &[u8], packet_size: usize) -> Vec<u8> {
    let chunk_size = packet_size.saturating_sub(PacketHeader::SIZE).max(1);
    let packet_count = payload.len().div_ceil(chunk_size).max(1);
    let mut out = Vec::with_capacity(payload.len() + packet_count * PacketHeader::SIZE);

    let mut chunks = payload.chunks(chunk_size).peekable();
    if chunks.peek().is_none() {
        push_packet(&mut out, packet_type, packet_status::EOM, &[]);
        return out;
    }
    while let Some(chunk) = chunks.next() {
        let status = if chunks.peek().is_none() {
            packet_status::EOM
        } else {
            0
        };
        push_packet(&mut out, packet_type, status, chunk);
    }
    out
}

fn push_packet(out: &mut Vec<u8>, packet_type: u8, status: u8, chunk: &[u8]) {
    let header = PacketHeader {
        packet_type,
        status,
        length: (chunk.len() + PacketHeader::SIZE) as u16,
        channel: 0,
        number: 0,
        window: 0,
    };
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(chunk);
}
