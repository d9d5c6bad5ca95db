//! Request encoding and response framing.
//!
//! The codec turns requests into packet bytes and reassembles response
//! packets into a token stream. A token may straddle packets; the codec keeps
//! the unread tail of the buffer and pulls another packet from the
//! [`FrameSource`] when a token is incomplete.

use std::sync::Arc;

use asedb_core::Cx;
use asedb_core::error::Error;

use crate::protocol::login::{LoginParams, encode_login_payload};
use crate::protocol::reader::PacketReader;
use crate::protocol::token::{Column, Message, Parsed, TokenState, parse_token, protocol_error};
use crate::protocol::writer::{PacketWriter, build_packets};
use crate::protocol::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MAX_TOKEN_LEN, PacketHeader, cursor, packet_type,
    tokens,
};

/// Status of a CURINFO set-rows request: the row count field is present.
const CURINFO_STATUS_ROWCNT: [u8; 2] = [0x00, 0x20];

/// A byte source the codec reads packets from.
pub trait FrameSource {
    /// Fill `buf` completely or fail.
    fn read_exact(&mut self, cx: &Cx, buf: &mut [u8]) -> Result<(), Error>;
}

/// Packet framing state for one session.
#[derive(Debug)]
pub struct Codec {
    packet_size: usize,
    buffer: Vec<u8>,
    pos: usize,
    /// The last packet of the current response has been read
    eom: bool,
    state: TokenState,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_PACKET_SIZE)
    }
}

impl Codec {
    pub fn new(packet_size: usize) -> Self {
        Self {
            packet_size: packet_size.clamp(DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE),
            buffer: Vec::with_capacity(packet_size),
            pos: 0,
            eom: false,
            state: TokenState::default(),
        }
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Apply a negotiated packet size to outgoing and incoming packets.
    pub fn set_packet_size(&mut self, size: usize) {
        self.packet_size = size.clamp(DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE);
    }

    /// The row format most recently received.
    pub fn columns(&self) -> Option<Arc<[Column]>> {
        self.state.row_columns.clone()
    }

    /// Restore the row format rows will be decoded with.
    ///
    /// Fetch responses carry rows without a format, so a cursor reinstates
    /// its own before fetching.
    pub fn set_columns(&mut self, columns: Option<Arc<[Column]>>) {
        self.state.row_columns = columns;
    }

    /// No partially read response is buffered.
    pub fn is_idle(&self) -> bool {
        self.pos >= self.buffer.len() && !self.eom
    }

    /// Drop any partially read response.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pos = 0;
        self.eom = false;
    }

    /// Login packets are always framed at the pre-negotiation size.
    pub fn encode_login(&self, params: &LoginParams) -> Vec<u8> {
        build_packets(
            packet_type::LOGIN,
            &encode_login_payload(params),
            DEFAULT_PACKET_SIZE,
        )
    }

    /// A LANGUAGE token carrying `sql`.
    pub fn encode_query(&self, sql: &str) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(sql.len() + 6);
        w.write_u8(tokens::LANGUAGE);
        w.write_u32(len_u32(sql.len() + 1));
        // status: no parameters follow
        w.write_u8(0);
        w.write_bytes(sql.as_bytes());
        build_packets(packet_type::NORMAL, w.as_bytes(), self.packet_size)
    }

    /// Declare, size and open a read-only cursor in one message.
    pub fn encode_cursor_open(&self, name: &str, sql: &str, batch_size: usize) -> Vec<u8> {
        let name = &name.as_bytes()[..name.len().min(usize::from(u8::MAX))];
        let mut w = PacketWriter::with_capacity(sql.len() + name.len() * 3 + 40);

        w.write_u8(tokens::CURDECLARE);
        w.write_u16(len_u16(6 + name.len() + sql.len()));
        write_name(&mut w, name);
        w.write_u8(cursor::DECLARE_READ_ONLY);
        // status: no parameters
        w.write_u8(0);
        w.write_u16(len_u16(sql.len()));
        w.write_bytes(sql.as_bytes());
        // no updatable columns
        w.write_u8(0);

        w.write_u8(tokens::CURINFO);
        w.write_u16(len_u16(12 + name.len()));
        w.write_i32(0);
        write_name(&mut w, name);
        w.write_u8(cursor::CMD_SET_ROWS);
        w.write_bytes(&CURINFO_STATUS_ROWCNT);
        w.write_i32(batch_i32(batch_size));

        w.write_u8(tokens::CUROPEN);
        w.write_u16(len_u16(6 + name.len()));
        w.write_i32(0);
        write_name(&mut w, name);
        // status: no parameters
        w.write_u8(0);

        build_packets(packet_type::NORMAL, w.as_bytes(), self.packet_size)
    }

    /// Size the next fetch and request it.
    pub fn encode_fetch_more(&self, cursor_id: i32, batch_size: usize) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(24);
        w.write_u8(tokens::CURINFO);
        w.write_u16(11);
        w.write_i32(cursor_id);
        w.write_u8(cursor::CMD_SET_ROWS);
        w.write_bytes(&CURINFO_STATUS_ROWCNT);
        w.write_i32(batch_i32(batch_size));

        w.write_u8(tokens::CURFETCH);
        w.write_u16(5);
        w.write_i32(cursor_id);
        w.write_u8(cursor::FETCH_NEXT);
        build_packets(packet_type::NORMAL, w.as_bytes(), self.packet_size)
    }

    /// Close and deallocate a cursor.
    pub fn encode_cursor_close(&self, cursor_id: i32) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(8);
        w.write_u8(tokens::CURCLOSE);
        w.write_u16(5);
        w.write_i32(cursor_id);
        w.write_u8(cursor::CLOSE_DEALLOC);
        build_packets(packet_type::NORMAL, w.as_bytes(), self.packet_size)
    }

    pub fn encode_logout(&self) -> Vec<u8> {
        build_packets(packet_type::NORMAL, &[tokens::LOGOUT, 0], self.packet_size)
    }

    /// A header-only attention packet.
    pub fn encode_attention(&self) -> Vec<u8> {
        build_packets(packet_type::ATTENTION, &[], self.packet_size)
    }

    /// Decode the next message of the current response.
    ///
    /// Reads packets from `source` as needed. After the final DONE the codec
    /// is ready for the next response.
    pub fn decode_next<S: FrameSource + ?Sized>(
        &mut self,
        cx: &Cx,
        source: &mut S,
    ) -> Result<Message, Error> {
        loop {
            if self.pos < self.buffer.len() {
                let mut r = PacketReader::new(&self.buffer[self.pos..]);
                match parse_token(&mut r, &mut self.state)? {
                    Parsed::Message(message) => {
                        self.pos += r.position();
                        if let Message::Done(done) = &message {
                            if !done.has_more() {
                                self.finish_response()?;
                            }
                        }
                        return Ok(message);
                    }
                    Parsed::Skipped => {
                        self.pos += r.position();
                        continue;
                    }
                    Parsed::Incomplete => {
                        if self.eom {
                            return Err(protocol_error("response ended inside a token"));
                        }
                    }
                }
            } else if self.eom {
                return Err(protocol_error("response ended without a final DONE"));
            }
            self.read_packet(cx, source)?;
        }
    }

    fn finish_response(&mut self) -> Result<(), Error> {
        let trailing = self.buffer.len() - self.pos;
        let complete = self.eom;
        self.reset();
        if trailing > 0 {
            return Err(protocol_error(format!(
                "{} bytes after the final DONE",
                trailing
            )));
        }
        if !complete {
            return Err(protocol_error("final DONE before the end of the response"));
        }
        Ok(())
    }

    fn read_packet<S: FrameSource + ?Sized>(&mut self, cx: &Cx, source: &mut S) -> Result<(), Error> {
        let mut raw = [0u8; PacketHeader::SIZE];
        source.read_exact(cx, &mut raw)?;
        let header = PacketHeader::from_bytes(&raw);

        if header.packet_type != packet_type::RESPONSE {
            return Err(protocol_error(format!(
                "unexpected packet type 0x{:02X}",
                header.packet_type
            )));
        }
        let length = usize::from(header.length);
        if length < PacketHeader::SIZE || length > self.packet_size {
            return Err(protocol_error(format!(
                "invalid packet length {} (packet size {})",
                length, self.packet_size
            )));
        }

        if self.pos > 0 {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }
        if self.buffer.len() + header.payload_len() > MAX_TOKEN_LEN + MAX_PACKET_SIZE {
            return Err(protocol_error("token exceeds maximum length"));
        }

        let start = self.buffer.len();
        self.buffer.resize(start + header.payload_len(), 0);
        source.read_exact(cx, &mut self.buffer[start..])?;
        self.eom = header.is_eom();
        tracing::trace!(
            length,
            eom = self.eom,
            buffered = self.buffer.len(),
            "Read response packet"
        );
        Ok(())
    }
}

fn write_name(w: &mut PacketWriter, name: &[u8]) {
    w.write_u8(u8::try_from(name.len()).unwrap_or(u8::MAX));
    w.write_bytes(name);
}

fn len_u16(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn batch_i32(batch_size: usize) -> i32 {
    i32::try_from(batch_size).unwrap_or(i32::MAX)
}
