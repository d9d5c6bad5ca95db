//! Server token decoding.
//!
//! `parse_token` decodes at most one token from the front of a buffer. It
//! distinguishes three outcomes: a decoded message, a token that carries
//! nothing the session needs (skipped by its length), and a buffer that
//! ends before the token does.

use std::sync::Arc;

use asedb_core::Value;
use asedb_core::error::{Error, ProtocolError, QueryError, QueryErrorKind};

use crate::protocol::reader::PacketReader;
use crate::protocol::{done_status, tokens, tran_state};
use crate::types::{DataType, TypeLayout, checked_len, decode_value};

/// Column status bits from row and parameter formats.
#[allow(dead_code)]
pub mod column_status {
    pub const HIDDEN: u8 = 0x01;
    pub const KEY: u8 = 0x02;
    pub const VERSION: u8 = 0x04;
    /// Each value in a row is preceded by a status byte
    pub const COLUMN_STATUS: u8 = 0x08;
    pub const UPDATABLE: u8 = 0x10;
    pub const NULLABLE: u8 = 0x20;
    pub const IDENTITY: u8 = 0x40;
}

/// One decoded server message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    LoginAck(LoginAck),
    EnvChange(Vec<EnvChange>),
    Capability,
    ColumnMetadata(Arc<[Column]>),
    RowData(Vec<Value>),
    ParamMetadata(Arc<[Column]>),
    ParamData(Vec<Value>),
    ServerMessage(ServerMessage),
    CursorInfo(CursorInfo),
    ReturnStatus(i32),
    Done(Done),
}

/// Column description from a row or parameter format token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub status: u8,
    pub user_type: i32,
    pub max_length: u32,
    pub precision: u8,
    pub scale: u8,
    /// Table name carried by text and image formats
    pub table: Option<String>,
    pub locale: String,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            status: 0,
            user_type: 0,
            max_length: 0,
            precision: 0,
            scale: 0,
            table: None,
            locale: String::new(),
        }
    }

    pub fn nullable(&self) -> bool {
        self.status & column_status::NULLABLE != 0
    }

    pub fn is_identity(&self) -> bool {
        self.status & column_status::IDENTITY != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    Succeeded,
    Failed,
    /// Server wants a security negotiation (password encryption)
    Negotiate,
    Other(u8),
}

impl LoginStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            5 => LoginStatus::Succeeded,
            6 => LoginStatus::Failed,
            7 => LoginStatus::Negotiate,
            other => LoginStatus::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    pub status: LoginStatus,
    pub tds_version: [u8; 4],
    pub server_program: String,
    pub server_version: [u8; 4],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvChange {
    pub kind: u8,
    pub new_value: String,
    pub old_value: String,
}

/// An error or informational message from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub number: i32,
    pub state: u8,
    pub severity: u8,
    pub sqlstate: Option<String>,
    pub message: String,
    pub server: String,
    pub procedure: String,
    pub line: u16,
}

impl ServerMessage {
    /// Severities above 10 are errors; 10 and below are informational.
    pub fn is_error(&self) -> bool {
        self.severity > 10
    }

    /// Severity 20 and above terminates the server-side session.
    pub fn is_fatal(&self) -> bool {
        self.severity >= 20
    }

    pub fn to_query_error(&self, sql: Option<&str>) -> Error {
        Error::Query(QueryError {
            kind: QueryErrorKind::from_server_number(self.number),
            sql: sql.map(str::to_string),
            sqlstate: self.sqlstate.clone(),
            message: self.message.trim_end().to_string(),
            number: Some(self.number),
            severity: Some(self.severity),
            state: Some(self.state),
            server: non_empty(&self.server),
            procedure: non_empty(&self.procedure),
            line: Some(self.line),
            source: None,
        })
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Completion of a statement, procedure, or batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    pub token: u8,
    pub status: u16,
    pub tran_state: u16,
    pub count: i32,
}

impl Done {
    /// Another DONE follows in the same response.
    pub fn has_more(&self) -> bool {
        self.status & done_status::MORE != 0
    }

    pub fn is_error(&self) -> bool {
        self.status & done_status::ERROR != 0
    }

    /// Acknowledges an attention (cancel) request.
    pub fn is_attention_ack(&self) -> bool {
        self.status & done_status::ATTN != 0
    }

    /// Rows affected, when the server reported a count.
    pub fn row_count(&self) -> Option<u64> {
        if self.status & done_status::COUNT != 0 {
            u64::try_from(self.count).ok()
        } else {
            None
        }
    }

    /// Is a transaction open once this statement completed?
    pub fn in_transaction(&self) -> bool {
        if self.tran_state == tran_state::TRAN_ABORT {
            return false;
        }
        self.status & done_status::INXACT != 0 || self.tran_state == tran_state::IN_PROGRESS
    }

    pub fn transaction_aborted(&self) -> bool {
        self.tran_state == tran_state::TRAN_ABORT
    }
}

/// Server report on a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorInfo {
    pub cursor_id: i32,
    pub name: Option<String>,
    pub command: u8,
    pub status: u16,
    pub row_count: Option<i32>,
}

/// Outcome of one `parse_token` call.
#[derive(Debug)]
pub(crate) enum Parsed {
    Message(Message),
    Skipped,
    Incomplete,
}

/// Formats needed to decode data tokens.
#[derive(Debug, Default)]
pub(crate) struct TokenState {
    pub row_columns: Option<Arc<[Column]>>,
    pub param_columns: Option<Arc<[Column]>>,
}

pub(crate) fn protocol_error(message: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: message.into(),
        raw_data: None,
        source: None,
    })
}

fn truncated(token: u8) -> Error {
    protocol_error(format!("truncated token 0x{:02X}", token))
}

/// Decode one token from the front of `r`.
#[allow(clippy::result_large_err)]
pub(crate) fn parse_token(r: &mut PacketReader<'_>, state: &mut TokenState) -> Result<Parsed, Error> {
    macro_rules! more {
        ($e:expr) => {
            match $e {
                Some(v) => v,
                None => return Ok(Parsed::Incomplete),
            }
        };
    }

    let token = more!(r.read_u8());
    match token {
        tokens::DONE | tokens::DONEPROC | tokens::DONEINPROC => {
            let status = more!(r.read_u16());
            let tran_state = more!(r.read_u16());
            let count = more!(r.read_i32());
            Ok(Parsed::Message(Message::Done(Done {
                token,
                status,
                tran_state,
                count,
            })))
        }
        tokens::RETURNSTATUS => Ok(Parsed::Message(Message::ReturnStatus(more!(r.read_i32())))),
        tokens::ROW | tokens::PARAMS => {
            let columns = if token == tokens::ROW {
                state.row_columns.clone()
            } else {
                state.param_columns.clone()
            }
            .ok_or_else(|| {
                protocol_error(format!("data token 0x{:02X} before its format", token))
            })?;
            let Some(values) = decode_row(r, &columns)? else {
                return Ok(Parsed::Incomplete);
            };
            Ok(Parsed::Message(if token == tokens::ROW {
                Message::RowData(values)
            } else {
                Message::ParamData(values)
            }))
        }
        tokens::MSG => {
            let len = usize::from(more!(r.read_u8()));
            more!(r.skip(len));
            Ok(Parsed::Skipped)
        }
        tokens::ROWFMT2 | tokens::ORDERBY2 | tokens::DYNAMIC2 => {
            let len = checked_len(more!(r.read_u32()), "token")?;
            let mut body = more!(r.sub_reader(len));
            if token == tokens::ROWFMT2 {
                let columns = parse_row_format2(&mut body).ok_or_else(|| truncated(token))??;
                state.row_columns = Some(Arc::clone(&columns));
                return Ok(Parsed::Message(Message::ColumnMetadata(columns)));
            }
            Ok(Parsed::Skipped)
        }
        tokens::LOGINACK
        | tokens::ENVCHANGE
        | tokens::EED
        | tokens::ERROR
        | tokens::INFO
        | tokens::ROWFMT
        | tokens::PARAMFMT
        | tokens::CURINFO
        | tokens::CAPABILITY
        | tokens::CONTROL
        | tokens::ORDERBY
        | tokens::TABNAME
        | tokens::COLINFO
        | tokens::OPTIONCMD
        | tokens::EVENTNOTICE
        | tokens::DYNAMIC => {
            let len = usize::from(more!(r.read_u16()));
            let mut body = more!(r.sub_reader(len));
            parse_short_token(token, &mut body, state)
        }
        other => Err(protocol_error(format!("unknown token 0x{:02X}", other))),
    }
}

/// Tokens with a two-byte length prefix, whose body is fully buffered.
#[allow(clippy::result_large_err)]
fn parse_short_token(
    token: u8,
    body: &mut PacketReader<'_>,
    state: &mut TokenState,
) -> Result<Parsed, Error> {
    let message = match token {
        tokens::LOGINACK => parse_login_ack(body).map(Message::LoginAck),
        tokens::ENVCHANGE => parse_env_change(body).map(Message::EnvChange),
        tokens::EED => parse_eed(body).map(Message::ServerMessage),
        tokens::ERROR | tokens::INFO => parse_error_info(body).map(Message::ServerMessage),
        tokens::CURINFO => parse_cursor_info(body).map(Message::CursorInfo),
        tokens::CAPABILITY => Some(Message::Capability),
        tokens::ROWFMT | tokens::PARAMFMT => {
            let columns = parse_row_format(body).ok_or_else(|| truncated(token))??;
            if token == tokens::ROWFMT {
                state.row_columns = Some(Arc::clone(&columns));
                Some(Message::ColumnMetadata(columns))
            } else {
                state.param_columns = Some(Arc::clone(&columns));
                Some(Message::ParamMetadata(columns))
            }
        }
        _ => return Ok(Parsed::Skipped),
    };
    message.map(Parsed::Message).ok_or_else(|| truncated(token))
}

fn parse_login_ack(r: &mut PacketReader<'_>) -> Option<LoginAck> {
    let status = LoginStatus::from_u8(r.read_u8()?);
    let mut tds_version = [0u8; 4];
    tds_version.copy_from_slice(r.read_bytes(4)?);
    let server_program = r.read_b_varchar()?;
    let mut server_version = [0u8; 4];
    server_version.copy_from_slice(r.read_bytes(4)?);
    Some(LoginAck {
        status,
        tds_version,
        server_program,
        server_version,
    })
}

fn parse_env_change(r: &mut PacketReader<'_>) -> Option<Vec<EnvChange>> {
    let mut changes = Vec::new();
    while !r.is_empty() {
        let kind = r.read_u8()?;
        let new_value = r.read_b_varchar()?;
        let old_value = r.read_b_varchar()?;
        changes.push(EnvChange {
            kind,
            new_value,
            old_value,
        });
    }
    Some(changes)
}

fn parse_eed(r: &mut PacketReader<'_>) -> Option<ServerMessage> {
    let number = r.read_i32()?;
    let state = r.read_u8()?;
    let severity = r.read_u8()?;
    let sqlstate = r.read_b_varchar()?;
    // status, transaction state
    r.skip(1 + 2)?;
    let message = r.read_us_varchar()?;
    let server = r.read_b_varchar()?;
    let procedure = r.read_b_varchar()?;
    let line = r.read_u16()?;
    Some(ServerMessage {
        number,
        state,
        severity,
        sqlstate: non_empty(&sqlstate),
        message,
        server,
        procedure,
        line,
    })
}

fn parse_error_info(r: &mut PacketReader<'_>) -> Option<ServerMessage> {
    let number = r.read_i32()?;
    let state = r.read_u8()?;
    let severity = r.read_u8()?;
    let message = r.read_us_varchar()?;
    let server = r.read_b_varchar()?;
    let procedure = r.read_b_varchar()?;
    let line = r.read_u16()?;
    Some(ServerMessage {
        number,
        state,
        severity,
        sqlstate: None,
        message,
        server,
        procedure,
        line,
    })
}

fn parse_cursor_info(r: &mut PacketReader<'_>) -> Option<CursorInfo> {
    let cursor_id = r.read_i32()?;
    let name = if cursor_id == 0 {
        Some(r.read_b_varchar()?)
    } else {
        None
    };
    let command = r.read_u8()?;
    let status = r.read_u16()?;
    let row_count = if r.remaining() >= 4 {
        r.read_i32()
    } else {
        None
    };
    Some(CursorInfo {
        cursor_id,
        name,
        command,
        status,
        row_count,
    })
}

/// Data type and its layout-dependent format info.
#[allow(clippy::result_large_err)]
fn parse_type_info(r: &mut PacketReader<'_>, column: &mut Column) -> Option<Result<(), Error>> {
    let code = r.read_u8()?;
    let Some(data_type) = DataType::from_u8(code) else {
        return Some(Err(protocol_error(format!(
            "unsupported data type 0x{:02X} for column '{}'",
            code, column.name
        ))));
    };
    column.data_type = data_type;
    match data_type.layout() {
        TypeLayout::Fixed(size) => column.max_length = size as u32,
        TypeLayout::ByteLength => column.max_length = u32::from(r.read_u8()?),
        TypeLayout::Scaled => {
            column.max_length = u32::from(r.read_u8()?);
            column.precision = r.read_u8()?;
            column.scale = r.read_u8()?;
        }
        TypeLayout::LongLength => column.max_length = r.read_u32()?,
        TypeLayout::TextPointer => {
            column.max_length = r.read_u32()?;
            column.table = Some(r.read_us_varchar()?);
        }
    }
    Some(Ok(()))
}

/// ROWFMT and PARAMFMT share one layout.
#[allow(clippy::result_large_err)]
fn parse_row_format(r: &mut PacketReader<'_>) -> Option<Result<Arc<[Column]>, Error>> {
    let count = usize::from(r.read_u16()?);
    let mut columns = Vec::with_capacity(count);
    for _ in 0..count {
        let mut column = Column::new(r.read_b_varchar()?, DataType::Int4);
        column.status = r.read_u8()?;
        column.user_type = r.read_i32()?;
        if let Err(e) = parse_type_info(r, &mut column)? {
            return Some(Err(e));
        }
        column.locale = r.read_b_varchar()?;
        columns.push(column);
    }
    Some(Ok(columns.into()))
}

#[allow(clippy::result_large_err)]
fn parse_row_format2(r: &mut PacketReader<'_>) -> Option<Result<Arc<[Column]>, Error>> {
    let count = usize::from(r.read_u16()?);
    let mut columns = Vec::with_capacity(count);
    for _ in 0..count {
        let label = r.read_b_varchar()?;
        // catalog, schema, table
        let _catalog = r.read_b_varchar()?;
        let _schema = r.read_b_varchar()?;
        let table = r.read_b_varchar()?;
        let column_name = r.read_b_varchar()?;
        let name = if label.is_empty() { column_name } else { label };
        let mut column = Column::new(name, DataType::Int4);
        column.status = (r.read_u32()? & 0xFF) as u8;
        column.user_type = r.read_i32()?;
        if let Err(e) = parse_type_info(r, &mut column)? {
            return Some(Err(e));
        }
        if column.table.is_none() && !table.is_empty() {
            column.table = Some(table);
        }
        column.locale = r.read_b_varchar()?;
        columns.push(column);
    }
    Some(Ok(columns.into()))
}

#[allow(clippy::result_large_err)]
fn decode_row(r: &mut PacketReader<'_>, columns: &[Column]) -> Result<Option<Vec<Value>>, Error> {
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        if column.status & column_status::COLUMN_STATUS != 0 {
            need!(r.read_u8());
        }
        values.push(need!(decode_value(r, column)?));
    }
    Ok(Some(values))
}
