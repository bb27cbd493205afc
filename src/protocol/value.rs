//! Per-type encode / decode of column and parameter values.

use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::charset::Encoding;
use crate::constant::ColumnType;
use crate::error::{Error, Result};
use crate::protocol::command::FieldDescriptor;
use crate::protocol::primitive::*;
use crate::value::{DateTime, Time, Value};

/// DATE - 4 bytes (ymd)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct Timestamp4 {
    year: U16LE,
    month: u8,
    day: u8,
}

/// DATETIME without microseconds - 7 bytes
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct Timestamp7 {
    date: Timestamp4,
    hour: u8,
    minute: u8,
    second: u8,
}

/// DATETIME with microseconds - 11 bytes
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct Timestamp11 {
    base: Timestamp7,
    microsecond: U32LE,
}

/// TIME without microseconds - 8 bytes
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct Time8 {
    is_negative: u8,
    days: U32LE,
    hour: u8,
    minute: u8,
    second: u8,
}

/// TIME with microseconds - 12 bytes
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct Time12 {
    base: Time8,
    microsecond: U32LE,
}

fn bad_length(what: &str, len: u8) -> Error {
    Error::protocol(format!("invalid {what} length: {len}"))
}

fn cast<T: FromBytes + KnownLayout + Immutable + Copy>(data: &[u8]) -> Result<T> {
    T::read_from_bytes(data).map_err(|_| Error::protocol("temporal value truncated"))
}

fn decode_datetime(data: &[u8]) -> Result<(DateTime, &[u8])> {
    let (len, rest) = read_int_1(data)?;
    let (body, rest) = read_string_fix(rest, len as usize)?;
    let dt = match len {
        0 => DateTime::default(),
        4 => {
            let ts: Timestamp4 = cast(body)?;
            DateTime::date(ts.year.get(), ts.month, ts.day)
        }
        7 | 11 => {
            let ts: Timestamp7 = cast(&body[..7])?;
            let microsecond = if len == 11 {
                cast::<Timestamp11>(body)?.microsecond.get()
            } else {
                0
            };
            DateTime {
                year: ts.date.year.get(),
                month: ts.date.month,
                day: ts.date.day,
                hour: ts.hour,
                minute: ts.minute,
                second: ts.second,
                microsecond,
            }
        }
        _ => return Err(bad_length("datetime", len)),
    };
    Ok((dt, rest))
}

fn decode_time(data: &[u8]) -> Result<(Time, &[u8])> {
    let (len, rest) = read_int_1(data)?;
    let (body, rest) = read_string_fix(rest, len as usize)?;
    let time = match len {
        0 => Time::default(),
        8 | 12 => {
            let t: Time8 = cast(&body[..8])?;
            let microsecond = if len == 12 {
                cast::<Time12>(body)?.microsecond.get()
            } else {
                0
            };
            Time {
                negative: t.is_negative != 0,
                days: t.days.get(),
                hour: t.hour,
                minute: t.minute,
                second: t.second,
                microsecond,
            }
        }
        _ => return Err(bad_length("time", len)),
    };
    Ok((time, rest))
}

fn text_or_bytes(field: &FieldDescriptor, bytes: &[u8]) -> Result<Value> {
    match field.encoding {
        Encoding::Binary => Ok(Value::Bytes(bytes.to_vec())),
        encoding => encoding.decode(bytes).map(Value::Text),
    }
}

/// Decode one binary-protocol value. NULLs are signalled by the row bitmap and never reach here.
pub fn decode_binary<'a>(field: &FieldDescriptor, data: &'a [u8]) -> Result<(Value, &'a [u8])> {
    let unsigned = field.is_unsigned();
    match field.column_type {
        ColumnType::MYSQL_TYPE_NULL => Ok((Value::Null, data)),

        ColumnType::MYSQL_TYPE_TINY => {
            let (val, rest) = read_int_1(data)?;
            let value = if unsigned {
                Value::UInt(u64::from(val))
            } else {
                Value::Int(i64::from(val as i8))
            };
            Ok((value, rest))
        }

        ColumnType::MYSQL_TYPE_SHORT | ColumnType::MYSQL_TYPE_YEAR => {
            let (val, rest) = read_int_2(data)?;
            let value = if unsigned {
                Value::UInt(u64::from(val))
            } else {
                Value::Int(i64::from(val as i16))
            };
            Ok((value, rest))
        }

        ColumnType::MYSQL_TYPE_INT24 | ColumnType::MYSQL_TYPE_LONG => {
            let (val, rest) = read_int_4(data)?;
            let value = if unsigned {
                Value::UInt(u64::from(val))
            } else {
                Value::Int(i64::from(val as i32))
            };
            Ok((value, rest))
        }

        ColumnType::MYSQL_TYPE_LONGLONG => {
            let (val, rest) = read_int_8(data)?;
            let value = if unsigned {
                Value::UInt(val)
            } else {
                Value::Int(val as i64)
            };
            Ok((value, rest))
        }

        ColumnType::MYSQL_TYPE_FLOAT => {
            let (val, rest) = read_int_4(data)?;
            Ok((Value::Float(f32::from_bits(val)), rest))
        }

        ColumnType::MYSQL_TYPE_DOUBLE => {
            let (val, rest) = read_int_8(data)?;
            Ok((Value::Double(f64::from_bits(val)), rest))
        }

        ColumnType::MYSQL_TYPE_DATE
        | ColumnType::MYSQL_TYPE_NEWDATE
        | ColumnType::MYSQL_TYPE_DATETIME
        | ColumnType::MYSQL_TYPE_TIMESTAMP => {
            let (dt, rest) = decode_datetime(data)?;
            Ok((Value::DateTime(dt), rest))
        }

        ColumnType::MYSQL_TYPE_TIME => {
            let (time, rest) = decode_time(data)?;
            Ok((Value::Time(time), rest))
        }

        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => {
            let (bytes, rest) = read_binary_bytes(data)?;
            Ok((Value::Decimal(String::from_utf8_lossy(bytes).into_owned()), rest))
        }

        ColumnType::MYSQL_TYPE_BIT | ColumnType::MYSQL_TYPE_GEOMETRY => {
            let (bytes, rest) = read_binary_bytes(data)?;
            Ok((Value::Bytes(bytes.to_vec()), rest))
        }

        // VARCHAR, VAR_STRING, STRING, ENUM, SET, JSON, BLOBs
        _ => {
            let (bytes, rest) = read_binary_bytes(data)?;
            Ok((text_or_bytes(field, bytes)?, rest))
        }
    }
}

/// String/blob body of a binary-protocol value (4-byte `0xFE` length form)
fn read_binary_bytes(data: &[u8]) -> Result<(&[u8], &[u8])> {
    match read_packed_int(data)? {
        (Some(len), rest) => read_string_fix(rest, len as usize),
        (None, _) => Err(Error::protocol("NULL length inside a binary row")),
    }
}

fn write_binary_bytes(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| Error::PacketTooLarge {
        len: data.len(),
        max: u32::MAX as usize,
    })?;
    write_packed_int(out, len);
    out.extend_from_slice(data);
    Ok(())
}

/// Skip one binary-protocol value without decoding it.
pub fn skip_binary<'a>(field: &FieldDescriptor, data: &'a [u8]) -> Result<&'a [u8]> {
    let fixed = match field.column_type {
        ColumnType::MYSQL_TYPE_NULL => 0,
        ColumnType::MYSQL_TYPE_TINY => 1,
        ColumnType::MYSQL_TYPE_SHORT | ColumnType::MYSQL_TYPE_YEAR => 2,
        ColumnType::MYSQL_TYPE_INT24 | ColumnType::MYSQL_TYPE_LONG | ColumnType::MYSQL_TYPE_FLOAT => 4,
        ColumnType::MYSQL_TYPE_LONGLONG | ColumnType::MYSQL_TYPE_DOUBLE => 8,
        ColumnType::MYSQL_TYPE_DATE
        | ColumnType::MYSQL_TYPE_NEWDATE
        | ColumnType::MYSQL_TYPE_DATETIME
        | ColumnType::MYSQL_TYPE_TIMESTAMP
        | ColumnType::MYSQL_TYPE_TIME => {
            let (len, rest) = read_int_1(data)?;
            return read_string_fix(rest, len as usize).map(|(_, rest)| rest);
        }
        _ => return read_binary_bytes(data).map(|(_, rest)| rest),
    };
    read_string_fix(data, fixed).map(|(_, rest)| rest)
}

fn parse_num<T: std::str::FromStr>(field: &FieldDescriptor, text: &str) -> Result<T> {
    text.trim().parse().map_err(|_| {
        Error::protocol(format!(
            "column '{}' of type {:?} holds non-numeric text '{}'",
            field.name, field.column_type, text
        ))
    })
}

fn split_micros(text: &str) -> Result<(&str, u32)> {
    match text.split_once('.') {
        None => Ok((text, 0)),
        Some((head, frac)) => {
            let digits: String = frac.chars().chain(std::iter::repeat('0')).take(6).collect();
            let micros = digits
                .parse()
                .map_err(|_| Error::protocol(format!("bad fractional seconds '{frac}'")))?;
            Ok((head, micros))
        }
    }
}

fn parse_fields<const N: usize>(text: &str, sep: char) -> Option<[u32; N]> {
    let mut out = [0u32; N];
    let mut parts = text.split(sep);
    for slot in &mut out {
        *slot = parts.next()?.trim().parse().ok()?;
    }
    parts.next().is_none().then_some(out)
}

/// Parse `YYYY-MM-DD[ HH:MM:SS[.ffffff]]`.
pub fn parse_text_datetime(text: &str) -> Result<DateTime> {
    let bad = || Error::protocol(format!("bad datetime text '{text}'"));
    let (date, time) = match text.split_once(' ') {
        Some((date, time)) => (date, Some(time)),
        None => (text, None),
    };
    let [year, month, day] = parse_fields::<3>(date, '-').ok_or_else(bad)?;
    let mut dt = DateTime::date(year as u16, month as u8, day as u8);
    if let Some(time) = time {
        let (hms, microsecond) = split_micros(time)?;
        let [hour, minute, second] = parse_fields::<3>(hms, ':').ok_or_else(bad)?;
        dt.hour = hour as u8;
        dt.minute = minute as u8;
        dt.second = second as u8;
        dt.microsecond = microsecond;
    }
    Ok(dt)
}

/// Parse `[-]HHH:MM:SS[.ffffff]`. Hours beyond 24 carry into days.
pub fn parse_text_time(text: &str) -> Result<Time> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(body) => (true, body),
        None => (false, text),
    };
    let (hms, microsecond) = split_micros(body)?;
    let [hours, minute, second] = parse_fields::<3>(hms, ':')
        .ok_or_else(|| Error::protocol(format!("bad time text '{text}'")))?;
    Ok(Time {
        negative,
        days: hours / 24,
        hour: (hours % 24) as u8,
        minute: minute as u8,
        second: second as u8,
        microsecond,
    })
}

/// Decode one text-protocol value from its (non-NULL) bytes.
pub fn decode_text(field: &FieldDescriptor, bytes: &[u8]) -> Result<Value> {
    let ascii = || String::from_utf8_lossy(bytes);
    match field.column_type {
        ColumnType::MYSQL_TYPE_NULL => Ok(Value::Null),
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => {
            if field.is_unsigned() {
                parse_num(field, &ascii()).map(Value::UInt)
            } else {
                parse_num(field, &ascii()).map(Value::Int)
            }
        }
        ColumnType::MYSQL_TYPE_FLOAT => parse_num(field, &ascii()).map(Value::Float),
        ColumnType::MYSQL_TYPE_DOUBLE => parse_num(field, &ascii()).map(Value::Double),
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => {
            Ok(Value::Decimal(ascii().into_owned()))
        }
        ColumnType::MYSQL_TYPE_DATE
        | ColumnType::MYSQL_TYPE_NEWDATE
        | ColumnType::MYSQL_TYPE_DATETIME
        | ColumnType::MYSQL_TYPE_TIMESTAMP => parse_text_datetime(&ascii()).map(Value::DateTime),
        ColumnType::MYSQL_TYPE_TIME => parse_text_time(&ascii()).map(Value::Time),
        ColumnType::MYSQL_TYPE_BIT | ColumnType::MYSQL_TYPE_GEOMETRY => Ok(Value::Bytes(bytes.to_vec())),
        _ => text_or_bytes(field, bytes),
    }
}

/// Skip one text-protocol value (packed length prefix, NULL has no body).
pub fn skip_text(data: &[u8]) -> Result<&[u8]> {
    match read_packed_length(data)? {
        (Some(len), rest) => read_string_fix(rest, len as usize).map(|(_, rest)| rest),
        (None, rest) => Ok(rest),
    }
}

fn integer_bits(value: &Value) -> Result<u64> {
    match *value {
        Value::Int(v) => Ok(v as u64),
        Value::UInt(v) => Ok(v),
        _ => Err(Error::BadConfig(format!("{value:?} cannot be sent as an integer"))),
    }
}

fn float_value(value: &Value) -> Result<f64> {
    match *value {
        Value::Float(v) => Ok(f64::from(v)),
        Value::Double(v) => Ok(v),
        Value::Int(v) => Ok(v as f64),
        Value::UInt(v) => Ok(v as f64),
        _ => Err(Error::BadConfig(format!("{value:?} cannot be sent as a float"))),
    }
}

fn encode_datetime(dt: &DateTime, out: &mut Vec<u8>) {
    let date = Timestamp4 {
        year: U16LE::new(dt.year),
        month: dt.month,
        day: dt.day,
    };
    let base = Timestamp7 {
        date,
        hour: dt.hour,
        minute: dt.minute,
        second: dt.second,
    };
    if dt.is_zero() {
        out.push(0);
    } else if dt.microsecond != 0 {
        out.push(11);
        out.extend_from_slice(
            Timestamp11 {
                base,
                microsecond: U32LE::new(dt.microsecond),
            }
            .as_bytes(),
        );
    } else if dt.has_time() {
        out.push(7);
        out.extend_from_slice(base.as_bytes());
    } else {
        out.push(4);
        out.extend_from_slice(date.as_bytes());
    }
}

fn encode_time(time: &Time, out: &mut Vec<u8>) {
    let base = Time8 {
        is_negative: u8::from(time.negative),
        days: U32LE::new(time.days),
        hour: time.hour,
        minute: time.minute,
        second: time.second,
    };
    if time.is_zero() {
        out.push(0);
    } else if time.microsecond != 0 {
        out.push(12);
        out.extend_from_slice(
            Time12 {
                base,
                microsecond: U32LE::new(time.microsecond),
            }
            .as_bytes(),
        );
    } else {
        out.push(8);
        out.extend_from_slice(base.as_bytes());
    }
}

/// Binary-encode a non-NULL parameter as `column_type`.
///
/// Integers are truncated to the width of the type. Strings use `encoding`.
pub fn encode_binary(
    value: &Value,
    column_type: ColumnType,
    encoding: Encoding,
    out: &mut Vec<u8>,
) -> Result<()> {
    match column_type {
        ColumnType::MYSQL_TYPE_NULL => {}
        ColumnType::MYSQL_TYPE_TINY => write_int_1(out, integer_bits(value)? as u8),
        ColumnType::MYSQL_TYPE_SHORT | ColumnType::MYSQL_TYPE_YEAR => {
            write_int_2(out, integer_bits(value)? as u16)
        }
        ColumnType::MYSQL_TYPE_INT24 | ColumnType::MYSQL_TYPE_LONG => {
            write_int_4(out, integer_bits(value)? as u32)
        }
        ColumnType::MYSQL_TYPE_LONGLONG => write_int_8(out, integer_bits(value)?),
        ColumnType::MYSQL_TYPE_FLOAT => write_int_4(out, (float_value(value)? as f32).to_bits()),
        ColumnType::MYSQL_TYPE_DOUBLE => write_int_8(out, float_value(value)?.to_bits()),
        ColumnType::MYSQL_TYPE_DATE
        | ColumnType::MYSQL_TYPE_NEWDATE
        | ColumnType::MYSQL_TYPE_DATETIME
        | ColumnType::MYSQL_TYPE_TIMESTAMP => match value {
            Value::DateTime(dt) => encode_datetime(dt, out),
            _ => return Err(Error::BadConfig(format!("{value:?} cannot be sent as a datetime"))),
        },
        ColumnType::MYSQL_TYPE_TIME => match value {
            Value::Time(time) => encode_time(time, out),
            _ => return Err(Error::BadConfig(format!("{value:?} cannot be sent as a time"))),
        },
        _ => match value {
            Value::Text(s) => write_binary_bytes(out, &encoding.encode(s))?,
            Value::Decimal(s) => write_binary_bytes(out, s.as_bytes())?,
            Value::Bytes(b) => write_binary_bytes(out, b)?,
            Value::Int(v) => write_binary_bytes(out, v.to_string().as_bytes())?,
            Value::UInt(v) => write_binary_bytes(out, v.to_string().as_bytes())?,
            _ => return Err(Error::BadConfig(format!("{value:?} cannot be sent as a string"))),
        },
    }
    Ok(())
}
