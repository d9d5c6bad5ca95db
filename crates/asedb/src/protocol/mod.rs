//! TDS 5.0 wire protocol implementation.
//!
//! Every TDS message is carried in one or more packets with an 8-byte header:
//! - 1 byte: packet type
//! - 1 byte: status (bit 0 marks the last packet of a message)
//! - 2 bytes: total packet length including the header (big-endian)
//! - 2 bytes: channel
//! - 1 byte: packet number
//! - 1 byte: window
//!
//! The payload of normal and response packets is a token stream. Integers
//! inside tokens use the byte order the client declared at login; this driver
//! always declares little-endian.

pub mod codec;
pub mod login;
pub mod reader;
pub mod token;
pub mod writer;

pub use codec::{Codec, FrameSource};
pub use login::LoginParams;
pub use reader::PacketReader;
pub use token::{
    Column, CursorInfo, Done, EnvChange, LoginAck, LoginStatus, Message, ServerMessage,
};
pub use writer::PacketWriter;

/// Packet size used until the server confirms a negotiated size.
pub const DEFAULT_PACKET_SIZE: usize = 512;

/// Largest packet size a client may request.
pub const MAX_PACKET_SIZE: usize = 65_535;

/// Upper bound on any declared token or value length.
///
/// Lengths above this are treated as corruption rather than allocated.
pub const MAX_TOKEN_LEN: usize = 16 * 1024 * 1024;

/// TDS packet types (header byte 0).
#[allow(dead_code)]
pub mod packet_type {
    pub const LANGUAGE: u8 = 0x01;
    pub const LOGIN: u8 = 0x02;
    pub const RPC: u8 = 0x03;
    pub const RESPONSE: u8 = 0x04;
    pub const UNFORMATTED: u8 = 0x05;
    pub const ATTENTION: u8 = 0x06;
    pub const BULK: u8 = 0x07;
    pub const SETUP: u8 = 0x08;
    pub const CLOSE: u8 = 0x09;
    pub const ERROR: u8 = 0x0A;
    pub const PROTOCOL_ACK: u8 = 0x0B;
    pub const ECHO: u8 = 0x0C;
    pub const LOGOUT: u8 = 0x0D;
    pub const ENDPARAM: u8 = 0x0E;
    pub const NORMAL: u8 = 0x0F;
    pub const URGENT: u8 = 0x10;
}

/// Packet header status bits.
pub mod packet_status {
    pub const EOM: u8 = 0x01;
    pub const ATTENTION_ACK: u8 = 0x02;
}

/// Token identifiers.
#[allow(dead_code)]
pub mod tokens {
    pub const CURCLOSE: u8 = 0x80;
    pub const CURDELETE: u8 = 0x81;
    pub const CURFETCH: u8 = 0x82;
    pub const CURINFO: u8 = 0x83;
    pub const CUROPEN: u8 = 0x84;
    pub const CURDECLARE: u8 = 0x86;
    pub const LANGUAGE: u8 = 0x21;
    pub const ORDERBY2: u8 = 0x22;
    pub const ROWFMT2: u8 = 0x61;
    pub const DYNAMIC2: u8 = 0x62;
    pub const MSG: u8 = 0x65;
    pub const LOGOUT: u8 = 0x71;
    pub const RETURNSTATUS: u8 = 0x79;
    pub const EVENTNOTICE: u8 = 0xA2;
    pub const TABNAME: u8 = 0xA4;
    pub const COLINFO: u8 = 0xA5;
    pub const OPTIONCMD: u8 = 0xA6;
    pub const ORDERBY: u8 = 0xA9;
    pub const ERROR: u8 = 0xAA;
    pub const INFO: u8 = 0xAB;
    pub const LOGINACK: u8 = 0xAD;
    pub const CONTROL: u8 = 0xAE;
    pub const ROW: u8 = 0xD1;
    pub const PARAMS: u8 = 0xD7;
    pub const CAPABILITY: u8 = 0xE2;
    pub const ENVCHANGE: u8 = 0xE3;
    pub const EED: u8 = 0xE5;
    pub const DYNAMIC: u8 = 0xE7;
    pub const PARAMFMT: u8 = 0xEC;
    pub const ROWFMT: u8 = 0xEE;
    pub const DONE: u8 = 0xFD;
    pub const DONEPROC: u8 = 0xFE;
    pub const DONEINPROC: u8 = 0xFF;
}

/// DONE token status bits.
#[allow(dead_code)]
pub mod done_status {
    pub const FINAL: u16 = 0x0000;
    pub const MORE: u16 = 0x0001;
    pub const ERROR: u16 = 0x0002;
    pub const INXACT: u16 = 0x0004;
    pub const PROC: u16 = 0x0008;
    pub const COUNT: u16 = 0x0010;
    pub const ATTN: u16 = 0x0020;
    pub const EVENT: u16 = 0x0040;
}

/// DONE token transaction state.
#[allow(dead_code)]
pub mod tran_state {
    pub const NOT_IN_TRAN: u16 = 0;
    pub const SUCCEED: u16 = 1;
    pub const IN_PROGRESS: u16 = 2;
    pub const STMT_ABORT: u16 = 3;
    pub const TRAN_ABORT: u16 = 4;
}

/// ENVCHANGE entry types.
pub mod env_type {
    pub const DATABASE: u8 = 1;
    pub const LANGUAGE: u8 = 2;
    pub const CHARSET: u8 = 3;
    pub const PACKET_SIZE: u8 = 4;
}

/// Cursor command and option codes.
#[allow(dead_code)]
pub mod cursor {
    /// CURDECLARE option: read only
    pub const DECLARE_READ_ONLY: u8 = 0x01;
    /// CURFETCH type: next
    pub const FETCH_NEXT: u8 = 0x01;
    /// CURCLOSE option: deallocate
    pub const CLOSE_DEALLOC: u8 = 0x01;
    /// CURINFO command: set cursor rows
    pub const CMD_SET_ROWS: u8 = 0x01;
    /// CURINFO command: inquire
    pub const CMD_INQUIRE: u8 = 0x02;
    /// CURINFO command: information
    pub const CMD_INFORM: u8 = 0x03;
}

/// A TDS packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: u8,
    pub status: u8,
    /// Total length, header included
    pub length: u16,
    pub channel: u16,
    pub number: u8,
    pub window: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 8;

    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        Self {
            packet_type: bytes[0],
            status: bytes[1],
            length: u16::from_be_bytes([bytes[2], bytes[3]]),
            channel: u16::from_be_bytes([bytes[4], bytes[5]]),
            number: bytes[6],
            window: bytes[7],
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let length = self.length.to_be_bytes();
        let channel = self.channel.to_be_bytes();
        [
            self.packet_type,
            self.status,
            length[0],
            length[1],
            channel[0],
            channel[1],
            self.number,
            self.window,
        ]
    }

    /// Is this the last packet of its message?
    pub fn is_eom(&self) -> bool {
        self.status & packet_status::EOM != 0
    }

    /// Payload bytes following the header.
    pub fn payload_len(&self) -> usize {
        usize::from(self.length).saturating_sub(Self::SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_big_endian() {
        let header = PacketHeader {
            packet_type: packet_type::NORMAL,
            status: packet_status::EOM,
            length: 0x0102,
            channel: 0,
            number: 0,
            window: 0,
        };
        assert_eq!(header.to_bytes(), [0x0F, 0x01, 0x01, 0x02, 0, 0, 0, 0]);
        assert_eq!(PacketHeader::from_bytes(&header.to_bytes()), header);
        assert!(header.is_eom());
        assert_eq!(header.payload_len(), 0x0102 - 8);
    }

    #[test]
    fn test_short_length_has_empty_payload() {
        let header = PacketHeader::from_bytes(&[0x04, 0x00, 0x00, 0x03, 0, 0, 0, 0]);
        assert!(!header.is_eom());
        assert_eq!(header.payload_len(), 0);
    }
}
