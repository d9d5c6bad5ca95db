//! ASE type system and value conversion.
//!
//! This module provides:
//! - TDS 5.0 data type codes and their wire layouts
//! - Decoding of row data into `Value`
//! - Client-side interpolation of query arguments as ASE literals
//!
//! # Date and time encoding
//!
//! ASE counts days from 1900-01-01 and, for `datetime` and `time`, ticks of
//! 1/300 second since midnight. Decoded values are rebased to the Unix epoch:
//! `Value::Date` holds days, `Value::Time` microseconds since midnight and
//! `Value::Timestamp` microseconds.

#![allow(clippy::cast_possible_truncation)]

use asedb_core::Value;
use asedb_core::error::{Error, ProtocolError, TypeError};

use crate::protocol::reader::PacketReader;
use crate::protocol::token::Column;
use crate::protocol::MAX_TOKEN_LEN;

/// Days from 1900-01-01 to 1970-01-01.
pub const DAYS_1900_TO_1970: i64 = 25_567;

const MICROS_PER_DAY: i64 = 86_400_000_000;
const MONEY_SCALE: u32 = 4;

/// TDS 5.0 data type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Int1 = 0x30,
    Int2 = 0x34,
    Int4 = 0x38,
    Int8 = 0xBF,
    IntN = 0x26,
    UInt1 = 0x40,
    UInt2 = 0x41,
    UInt4 = 0x42,
    UInt8 = 0x43,
    UIntN = 0x44,
    Bit = 0x32,
    BitN = 0x68,
    Flt4 = 0x3B,
    Flt8 = 0x3E,
    FltN = 0x6D,
    Money = 0x3C,
    ShortMoney = 0x7A,
    MoneyN = 0x6E,
    DateTime = 0x3D,
    ShortDate = 0x3A,
    DateTimeN = 0x6F,
    Date = 0x31,
    Time = 0x33,
    DateN = 0x7B,
    TimeN = 0x93,
    Numeric = 0x6C,
    Decimal = 0x6A,
    Char = 0x2F,
    VarChar = 0x27,
    LongChar = 0xAF,
    Binary = 0x2D,
    VarBinary = 0x25,
    LongBinary = 0xE1,
    Text = 0x23,
    Image = 0x22,
}

/// How a type's format info and row data are laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeLayout {
    /// No format info; data is always this many bytes
    Fixed(usize),
    /// One-byte max length in the format; one-byte length per value
    ByteLength,
    /// Like `ByteLength` with precision and scale in the format
    Scaled,
    /// Four-byte max length in the format; four-byte length per value
    LongLength,
    /// Four-byte max length and table name in the format; text pointer,
    /// timestamp and four-byte length per value
    TextPointer,
}

impl DataType {
    /// Parse a data type code. Unknown codes cannot be skipped safely, so the
    /// caller must treat `None` as a protocol error.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x30 => DataType::Int1,
            0x34 => DataType::Int2,
            0x38 => DataType::Int4,
            0xBF => DataType::Int8,
            0x26 => DataType::IntN,
            0x40 => DataType::UInt1,
            0x41 => DataType::UInt2,
            0x42 => DataType::UInt4,
            0x43 => DataType::UInt8,
            0x44 => DataType::UIntN,
            0x32 => DataType::Bit,
            0x68 => DataType::BitN,
            0x3B => DataType::Flt4,
            0x3E => DataType::Flt8,
            0x6D => DataType::FltN,
            0x3C => DataType::Money,
            0x7A => DataType::ShortMoney,
            0x6E => DataType::MoneyN,
            0x3D => DataType::DateTime,
            0x3A => DataType::ShortDate,
            0x6F => DataType::DateTimeN,
            0x31 => DataType::Date,
            0x33 => DataType::Time,
            0x7B => DataType::DateN,
            0x93 => DataType::TimeN,
            0x6C => DataType::Numeric,
            0x6A => DataType::Decimal,
            0x2F => DataType::Char,
            0x27 => DataType::VarChar,
            0xAF => DataType::LongChar,
            0x2D => DataType::Binary,
            0x25 => DataType::VarBinary,
            0xE1 => DataType::LongBinary,
            0x23 => DataType::Text,
            0x22 => DataType::Image,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn layout(self) -> TypeLayout {
        match self {
            DataType::Int1 | DataType::UInt1 | DataType::Bit => TypeLayout::Fixed(1),
            DataType::Int2 | DataType::UInt2 => TypeLayout::Fixed(2),
            DataType::Int4
            | DataType::UInt4
            | DataType::Flt4
            | DataType::ShortMoney
            | DataType::ShortDate
            | DataType::Date
            | DataType::Time => TypeLayout::Fixed(4),
            DataType::Int8
            | DataType::UInt8
            | DataType::Flt8
            | DataType::Money
            | DataType::DateTime => TypeLayout::Fixed(8),
            DataType::Numeric | DataType::Decimal => TypeLayout::Scaled,
            DataType::LongChar | DataType::LongBinary => TypeLayout::LongLength,
            DataType::Text | DataType::Image => TypeLayout::TextPointer,
            _ => TypeLayout::ByteLength,
        }
    }

    /// The ASE type name, for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            DataType::Int1 => "tinyint",
            DataType::Int2 => "smallint",
            DataType::Int4 => "int",
            DataType::Int8 => "bigint",
            DataType::IntN => "intn",
            DataType::UInt1 => "unsigned tinyint",
            DataType::UInt2 => "unsigned smallint",
            DataType::UInt4 => "unsigned int",
            DataType::UInt8 => "unsigned bigint",
            DataType::UIntN => "uintn",
            DataType::Bit | DataType::BitN => "bit",
            DataType::Flt4 => "real",
            DataType::Flt8 => "float",
            DataType::FltN => "floatn",
            DataType::Money => "money",
            DataType::ShortMoney => "smallmoney",
            DataType::MoneyN => "moneyn",
            DataType::DateTime => "datetime",
            DataType::ShortDate => "smalldatetime",
            DataType::DateTimeN => "datetimn",
            DataType::Date | DataType::DateN => "date",
            DataType::Time | DataType::TimeN => "time",
            DataType::Numeric => "numeric",
            DataType::Decimal => "decimal",
            DataType::Char => "char",
            DataType::VarChar => "varchar",
            DataType::LongChar => "longchar",
            DataType::Binary => "binary",
            DataType::VarBinary => "varbinary",
            DataType::LongBinary => "longbinary",
            DataType::Text => "text",
            DataType::Image => "image",
        }
    }

    /// Is this a character type?
    #[must_use]
    pub const fn is_text(self) -> bool {
        matches!(
            self,
            DataType::Char | DataType::VarChar | DataType::LongChar | DataType::Text
        )
    }
}

fn invalid(message: String) -> Error {
    Error::Protocol(ProtocolError {
        message,
        raw_data: None,
        source: None,
    })
}

/// Check a declared length against `MAX_TOKEN_LEN`.
#[allow(clippy::result_large_err)]
pub(crate) fn checked_len(len: u32, what: &str) -> Result<usize, Error> {
    let len = len as usize;
    if len > MAX_TOKEN_LEN {
        return Err(invalid(format!(
            "{} length {} exceeds maximum {}",
            what, len, MAX_TOKEN_LEN
        )));
    }
    Ok(len)
}

/// Decode one column value from row data.
///
/// Returns `Ok(None)` when the buffer ends before the value does.
#[allow(clippy::result_large_err)]
pub fn decode_value(r: &mut PacketReader<'_>, column: &Column) -> Result<Option<Value>, Error> {
    let ty = column.data_type;
    let data = match ty.layout() {
        TypeLayout::Fixed(size) => need!(r.read_bytes(size)),
        TypeLayout::ByteLength | TypeLayout::Scaled => {
            let len = usize::from(need!(r.read_u8()));
            if len == 0 {
                return Ok(Some(Value::Null));
            }
            need!(r.read_bytes(len))
        }
        TypeLayout::LongLength => {
            let len = checked_len(need!(r.read_u32()), ty.name())?;
            if len == 0 {
                return Ok(Some(Value::Null));
            }
            need!(r.read_bytes(len))
        }
        TypeLayout::TextPointer => {
            let ptr_len = usize::from(need!(r.read_u8()));
            if ptr_len == 0 {
                return Ok(Some(Value::Null));
            }
            // text pointer, then 8-byte timestamp
            need!(r.skip(ptr_len + 8));
            let len = checked_len(need!(r.read_u32()), ty.name())?;
            need!(r.read_bytes(len))
        }
    };
    convert(ty, data, column.scale).map(Some)
}

fn le<const N: usize>(data: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[..N]);
    out
}

#[allow(clippy::result_large_err)]
fn convert(ty: DataType, data: &[u8], scale: u8) -> Result<Value, Error> {
    use DataType as T;

    let value = match (ty, data.len()) {
        (T::Int1 | T::IntN | T::UInt1 | T::UIntN, 1) => Value::TinyInt(data[0]),
        (T::Int2 | T::IntN, 2) => Value::SmallInt(i16::from_le_bytes(le(data))),
        (T::Int4 | T::IntN, 4) => Value::Int(i32::from_le_bytes(le(data))),
        (T::Int8 | T::IntN, 8) => Value::BigInt(i64::from_le_bytes(le(data))),
        (T::UInt2 | T::UIntN, 2) => Value::from(u16::from_le_bytes(le(data))),
        (T::UInt4 | T::UIntN, 4) => Value::from(u32::from_le_bytes(le(data))),
        (T::UInt8 | T::UIntN, 8) => Value::from_u64_clamped(u64::from_le_bytes(le(data))),
        (T::Bit | T::BitN, 1) => Value::Bool(data[0] != 0),
        (T::Flt4 | T::FltN, 4) => Value::Float(f32::from_le_bytes(le(data))),
        (T::Flt8 | T::FltN, 8) => Value::Double(f64::from_le_bytes(le(data))),
        (T::ShortMoney | T::MoneyN, 4) => {
            let cents = i64::from(i32::from_le_bytes(le(data)));
            Value::Decimal(format_scaled(cents < 0, u128::from(cents.unsigned_abs()), MONEY_SCALE))
        }
        (T::Money | T::MoneyN, 8) => {
            let high = i64::from(i32::from_le_bytes(le(&data[..4])));
            let low = i64::from(u32::from_le_bytes(le(&data[4..])));
            let cents = (high << 32) | low;
            Value::Decimal(format_scaled(cents < 0, u128::from(cents.unsigned_abs()), MONEY_SCALE))
        }
        (T::DateTime | T::DateTimeN, 8) => {
            let days = i64::from(i32::from_le_bytes(le(&data[..4])));
            let ticks = i64::from(u32::from_le_bytes(le(&data[4..])));
            Value::Timestamp((days - DAYS_1900_TO_1970) * MICROS_PER_DAY + ticks_to_micros(ticks))
        }
        (T::ShortDate | T::DateTimeN, 4) => {
            let days = i64::from(u16::from_le_bytes(le(&data[..2])));
            let minutes = i64::from(u16::from_le_bytes(le(&data[2..])));
            Value::Timestamp((days - DAYS_1900_TO_1970) * MICROS_PER_DAY + minutes * 60_000_000)
        }
        (T::Date | T::DateN, 4) => {
            let days = i64::from(i32::from_le_bytes(le(data)));
            Value::Date((days - DAYS_1900_TO_1970) as i32)
        }
        (T::Time | T::TimeN, 4) => {
            let ticks = i64::from(i32::from_le_bytes(le(data)));
            Value::Time(ticks_to_micros(ticks))
        }
        (T::Numeric | T::Decimal, len) if len >= 2 => decode_numeric(data, scale)?,
        (T::Char | T::VarChar | T::LongChar | T::Text, _) => {
            Value::Text(String::from_utf8_lossy(data).into_owned())
        }
        (T::Binary | T::VarBinary | T::LongBinary | T::Image, _) => Value::Bytes(data.to_vec()),
        (ty, len) => {
            return Err(invalid(format!(
                "invalid data length {} for {} column",
                len,
                ty.name()
            )));
        }
    };
    Ok(value)
}

fn ticks_to_micros(ticks: i64) -> i64 {
    ticks * 10_000 / 3
}

/// Sign byte (non-zero = negative) followed by a big-endian magnitude.
#[allow(clippy::result_large_err)]
fn decode_numeric(data: &[u8], scale: u8) -> Result<Value, Error> {
    let magnitude_bytes = &data[1..];
    if magnitude_bytes.len() > 16 {
        return Err(invalid(format!(
            "numeric magnitude of {} bytes exceeds 16",
            magnitude_bytes.len()
        )));
    }
    let magnitude = magnitude_bytes
        .iter()
        .fold(0u128, |acc, b| (acc << 8) | u128::from(*b));
    Ok(Value::Decimal(format_scaled(
        data[0] != 0,
        magnitude,
        u32::from(scale),
    )))
}

/// Render an unsigned magnitude with `scale` fractional digits.
pub fn format_scaled(negative: bool, magnitude: u128, scale: u32) -> String {
    let digits = magnitude.to_string();
    let scale = scale as usize;
    let mut out = String::with_capacity(digits.len() + scale + 3);
    if negative && magnitude != 0 {
        out.push('-');
    }
    if scale == 0 {
        out.push_str(&digits);
        return out;
    }
    let padded = format!("{:0>width$}", digits, width = scale + 1);
    let split = padded.len() - scale;
    out.push_str(&padded[..split]);
    out.push('.');
    out.push_str(&padded[split..]);
    out
}

/// Convert days since 1970-01-01 to a (year, month, day) civil date.
pub fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

fn format_date(days: i64) -> String {
    let (y, m, d) = civil_from_days(days);
    format!("{:04}-{:02}-{:02}", y, m, d)
}

fn format_time(micros: i64) -> String {
    let micros = micros.rem_euclid(MICROS_PER_DAY);
    let secs = micros / 1_000_000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        (micros % 1_000_000) / 1000
    )
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NULL".to_string()
    } else if f.is_infinite() {
        if f.is_sign_positive() {
            "1.7976931348623157e308".to_string()
        } else {
            "-1.7976931348623157e308".to_string()
        }
    } else {
        format!("{:?}", f)
    }
}

/// Quote a string as an ASE character literal.
fn escape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            result.push_str("''");
        } else {
            result.push(ch);
        }
    }
    result.push('\'');
    result
}

fn escape_bytes(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2 + 2);
    result.push_str("0x");
    for byte in data {
        result.push_str(&format!("{byte:02x}"));
    }
    result
}

/// Check that `s` is a plain exact numeric: optional sign, digits, at most
/// one decimal point.
#[allow(clippy::result_large_err)]
fn checked_decimal(s: &str) -> Result<&str, Error> {
    let trimmed = s.trim();
    let unsigned = trimmed
        .strip_prefix('-')
        .or_else(|| trimmed.strip_prefix('+'))
        .unwrap_or(trimmed);
    let (whole, frac) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let digits_only = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if (whole.is_empty() && frac.is_empty()) || !digits_only(whole) || !digits_only(frac) {
        return Err(Error::Type(TypeError {
            expected: "numeric literal",
            actual: format!("{:?}", s),
            column: None,
            rust_type: None,
        }));
    }
    Ok(trimmed)
}

/// Format a `Value` as an ASE SQL literal.
///
/// Fails only for a `Decimal` whose text is not a number.
#[allow(clippy::result_large_err)]
pub fn format_value_for_sql(value: &Value) -> Result<String, Error> {
    let literal = match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::TinyInt(i) => i.to_string(),
        Value::SmallInt(i) => i.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::Float(f) => format_float(f64::from(*f)),
        Value::Double(f) => format_float(*f),
        Value::Decimal(s) => checked_decimal(s)?.to_string(),
        Value::Text(s) => escape_string(s),
        Value::Bytes(b) => escape_bytes(b),
        Value::Date(d) => format!("'{}'", format_date(i64::from(*d))),
        Value::Time(t) => format!("'{}'", format_time(*t)),
        Value::Timestamp(t) => format!(
            "'{} {}'",
            format_date(t.div_euclid(MICROS_PER_DAY)),
            format_time(t.rem_euclid(MICROS_PER_DAY))
        ),
    };
    Ok(literal)
}

/// Copy a quoted section (string literal or delimited identifier) verbatim.
fn copy_quoted(
    open: char,
    close: char,
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    out: &mut String,
) {
    out.push(open);
    while let Some(ch) = chars.next() {
        out.push(ch);
        if ch == close {
            // Doubled delimiter is an escaped delimiter
            if chars.peek() == Some(&close) {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                break;
            }
        }
    }
}

/// A negative literal right after `-` would open a line comment.
fn push_literal(out: &mut String, literal: &str) {
    if literal.starts_with('-') && out.ends_with('-') {
        out.push(' ');
    }
    out.push_str(literal);
}

/// Interpolate arguments into a SQL string.
///
/// Replaces `?` placeholders in order and `$1`, `$2`, ... by position.
/// Placeholders inside string literals, quoted or bracketed identifiers and
/// comments are left alone.
#[allow(clippy::result_large_err)]
pub fn interpolate_params(sql: &str, params: &[Value]) -> Result<String, Error> {
    if params.is_empty() {
        return Ok(sql.to_string());
    }

    let mut result = String::with_capacity(sql.len() + params.len() * 16);
    let mut chars = sql.chars().peekable();
    let mut param_index = 0;

    while let Some(ch) = chars.next() {
        match ch {
            '?' => {
                if let Some(value) = params.get(param_index) {
                    push_literal(&mut result, &format_value_for_sql(value)?);
                    param_index += 1;
                } else {
                    result.push('?');
                }
            }
            '$' => {
                let mut num_str = String::new();
                while let Some(digit) = chars.next_if(char::is_ascii_digit) {
                    num_str.push(digit);
                }
                match num_str.parse::<usize>() {
                    Ok(n) if n > 0 && n <= params.len() => {
                        push_literal(&mut result, &format_value_for_sql(&params[n - 1])?);
                    }
                    _ => {
                        result.push('$');
                        result.push_str(&num_str);
                    }
                }
            }
            '\'' => copy_quoted('\'', '\'', &mut chars, &mut result),
            '"' => copy_quoted('"', '"', &mut chars, &mut result),
            '[' => copy_quoted('[', ']', &mut chars, &mut result),
            '-' if chars.peek() == Some(&'-') => {
                result.push(ch);
                for next in chars.by_ref() {
                    result.push(next);
                    if next == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                result.push(ch);
                let mut prev = '\0';
                for next in chars.by_ref() {
                    result.push(next);
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => result.push(ch),
        }
    }

    Ok(result)
}

/// Split SQL into lowercase words, skipping literals, identifiers in quotes
/// and comments. A `;` outside literals is reported as its own word.
fn sql_words(sql: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut chars = sql.chars().peekable();
    let mut scratch = String::new();

    let flush = |current: &mut String, words: &mut Vec<String>| {
        if !current.is_empty() {
            words.push(std::mem::take(current));
        }
    };

    while let Some(ch) = chars.next() {
        match ch {
            '\'' | '"' | '[' => {
                flush(&mut current, &mut words);
                let close = if ch == '[' { ']' } else { ch };
                scratch.clear();
                copy_quoted(ch, close, &mut chars, &mut scratch);
            }
            '-' if chars.peek() == Some(&'-') => {
                flush(&mut current, &mut words);
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                flush(&mut current, &mut words);
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            ';' => {
                flush(&mut current, &mut words);
                words.push(";".to_string());
            }
            c if c.is_alphanumeric() || c == '_' || c == '#' || c == '@' => {
                current.extend(c.to_lowercase());
            }
            _ => flush(&mut current, &mut words),
        }
    }
    flush(&mut current, &mut words);
    words
}

/// Can this statement run through a read-only server cursor?
///
/// Single `SELECT` statements qualify; `SELECT ... INTO`, `FOR UPDATE`,
/// `COMPUTE` clauses and batches do not.
pub fn is_cursor_query(sql: &str) -> bool {
    let words = sql_words(sql);
    let Some(first) = words.first() else {
        return false;
    };
    first == "select"
        && !words
            .iter()
            .any(|w| matches!(w.as_str(), "into" | "compute" | ";" | "update" | "for"))
}
