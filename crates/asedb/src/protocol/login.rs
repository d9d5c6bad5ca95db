//! Login record encoding.
//!
//! The TDS 5.0 login record is a fixed 568-byte layout of padded fields, each
//! followed by a one-byte used-length. A capability token follows it in the
//! same login message.

use crate::protocol::tokens;
use crate::protocol::writer::PacketWriter;

/// Size of the fixed login record.
pub const LOGIN_RECORD_LEN: usize = 568;

/// Offsets of login fields that tests and diagnostics inspect.
pub mod offsets {
    pub const HOSTNAME: usize = 0;
    pub const USERNAME: usize = 31;
    pub const PASSWORD: usize = 62;
    pub const APPNAME: usize = 140;
    pub const REMOTE_PASSWORD: usize = 202;
    pub const TDS_VERSION: usize = 458;
    pub const LANGUAGE: usize = 480;
    pub const CHARSET: usize = 525;
    pub const PACKET_SIZE: usize = 557;
}

/// Width of the standard name fields.
pub const NAME_FIELD_LEN: usize = 30;

const REMOTE_PASSWORD_LEN: usize = 255;
const PROGRAM_NAME_LEN: usize = 10;
const PACKET_SIZE_FIELD_LEN: usize = 6;

/// int2, int4, char, float, date, usedb: little-endian, ASCII, IEEE 754.
const BYTE_ORDER: [u8; 6] = [0x03, 0x01, 0x06, 0x0A, 0x09, 0x01];
const TDS_VERSION: [u8; 4] = [0x05, 0x00, 0x00, 0x00];
const PROGRAM_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];
/// lnoshort, lflt4 (IEEE 4-byte), ldate4 (4-byte date)
const SHORT_FORMATS: [u8; 3] = [0x00, 0x0D, 0x11];

const CAPABILITIES_LEN: u16 = 22;

/// Request and response capability bitmaps.
///
/// Requests language, cursor and row-format support; asks the server not to
/// send wide row formats or column status bytes.
const CAPABILITIES: [u8; CAPABILITIES_LEN as usize] = [
    0x01, 0x09, 0x00, 0x00, 0x06, 0x6D, 0x7F, 0xFF, 0xFF, 0xFF, 0xFE, //
    0x02, 0x09, 0x00, 0x00, 0x00, 0x00, 0x02, 0x68, 0x00, 0x00, 0x00,
];

/// Everything the login record carries.
#[derive(Debug, Clone)]
pub struct LoginParams {
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub host_process: String,
    pub app_name: String,
    pub server_name: String,
    pub program_name: String,
    /// Requested language; the configured locale
    pub language: String,
    pub charset: String,
    /// Requested packet size in bytes
    pub packet_size: usize,
}

impl LoginParams {
    /// Login parameters with the driver's defaults for everything but the
    /// credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            username: username.into(),
            password: password.into(),
            host_process: std::process::id().to_string(),
            app_name: "asedb".to_string(),
            server_name: String::new(),
            program_name: "asedb".to_string(),
            language: String::new(),
            charset: "utf8".to_string(),
            packet_size: crate::protocol::DEFAULT_PACKET_SIZE,
        }
    }
}

/// Encode the login message payload: the login record then capabilities.
pub fn encode_login_payload(params: &LoginParams) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(LOGIN_RECORD_LEN + 3 + CAPABILITIES.len());

    w.write_fixed_field(params.hostname.as_bytes(), NAME_FIELD_LEN);
    w.write_fixed_field(params.username.as_bytes(), NAME_FIELD_LEN);
    w.write_fixed_field(params.password.as_bytes(), NAME_FIELD_LEN);
    w.write_fixed_field(params.host_process.as_bytes(), NAME_FIELD_LEN);

    w.write_bytes(&BYTE_ORDER);
    // ldmpld, linterfacespare, ltype
    w.write_zeros(3);
    // lbufsize, lspare
    w.write_zeros(4 + 3);

    w.write_fixed_field(params.app_name.as_bytes(), NAME_FIELD_LEN);
    w.write_fixed_field(params.server_name.as_bytes(), NAME_FIELD_LEN);

    // Remote password: server name (empty = any) + length + password
    let limit = params.password.len().min(REMOTE_PASSWORD_LEN - 2);
    let password = &params.password.as_bytes()[..limit];
    let mut remote = Vec::with_capacity(password.len() + 2);
    remote.push(0);
    remote.push(u8::try_from(password.len()).unwrap_or(u8::MAX));
    remote.extend_from_slice(password);
    w.write_fixed_field(&remote, REMOTE_PASSWORD_LEN);

    w.write_bytes(&TDS_VERSION);
    w.write_fixed_field(params.program_name.as_bytes(), PROGRAM_NAME_LEN);
    w.write_bytes(&PROGRAM_VERSION);
    w.write_bytes(&SHORT_FORMATS);

    w.write_fixed_field(params.language.as_bytes(), NAME_FIELD_LEN);
    // lsetlang: ask to be notified of the language when one is requested
    w.write_u8(u8::from(!params.language.is_empty()));
    // loldsecure[2], lseclogin, lsecbulk, lhalogin, lhasessionid[6], lsecspare[2]
    w.write_zeros(2 + 1 + 1 + 1 + 6 + 2);

    w.write_fixed_field(params.charset.as_bytes(), NAME_FIELD_LEN);
    // lsetcharset
    w.write_u8(1);
    w.write_fixed_field(
        params.packet_size.to_string().as_bytes(),
        PACKET_SIZE_FIELD_LEN,
    );
    // ldummy
    w.write_zeros(4);

    debug_assert_eq!(w.len(), LOGIN_RECORD_LEN);

    w.write_u8(tokens::CAPABILITY);
    w.write_u16(CAPABILITIES_LEN);
    w.write_bytes(&CAPABILITIES);
    w.into_bytes()
}

/// Read a fixed login field back out of an encoded record.
pub fn read_fixed_field(record: &[u8], offset: usize, width: usize) -> Option<&[u8]> {
    let len = usize::from(*record.get(offset + width)?);
    record.get(offset..offset + len.min(width))
}
