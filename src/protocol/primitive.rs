use crate::error::{Error, Result};
use zerocopy::FromBytes;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE, U64 as U64LE};

/// Leading byte of a packed integer that denotes SQL NULL.
pub const PACKED_NULL: u8 = 0xFB;

#[inline]
fn short_packet(need: usize, have: usize) -> Error {
    Error::protocol(format!("packet too short: need {need} bytes, have {have}"))
}

/// Read 1-byte integer
pub fn read_int_1(data: &[u8]) -> Result<(u8, &[u8])> {
    match data.split_first() {
        Some((&first, rest)) => Ok((first, rest)),
        None => Err(short_packet(1, 0)),
    }
}

/// Read 2-byte little-endian integer
pub fn read_int_2(data: &[u8]) -> Result<(u16, &[u8])> {
    let (value, rest) = U16LE::read_from_prefix(data).map_err(|_| short_packet(2, data.len()))?;
    Ok((value.get(), rest))
}

/// Read 3-byte little-endian integer
pub fn read_int_3(data: &[u8]) -> Result<(u32, &[u8])> {
    if data.len() < 3 {
        return Err(short_packet(3, data.len()));
    }
    let value = u32::from_le_bytes([data[0], data[1], data[2], 0]);
    Ok((value, &data[3..]))
}

/// Read 4-byte little-endian integer
pub fn read_int_4(data: &[u8]) -> Result<(u32, &[u8])> {
    let (value, rest) = U32LE::read_from_prefix(data).map_err(|_| short_packet(4, data.len()))?;
    Ok((value.get(), rest))
}

/// Read 8-byte little-endian integer
pub fn read_int_8(data: &[u8]) -> Result<(u64, &[u8])> {
    let (value, rest) = U64LE::read_from_prefix(data).map_err(|_| short_packet(8, data.len()))?;
    Ok((value.get(), rest))
}

/// Read a packed length (field lengths, affected rows, insert ids, text row values).
///
/// `251` is NULL, `252`/`253`/`254` announce a following 2/3/8-byte integer.
/// Returns `None` for NULL.
pub fn read_packed_length(data: &[u8]) -> Result<(Option<u64>, &[u8])> {
    let (first, rest) = read_int_1(data)?;
    match first {
        PACKED_NULL => Ok((None, rest)),
        0xFC => {
            let (val, rest) = read_int_2(rest)?;
            Ok((Some(val as u64), rest))
        }
        0xFD => {
            let (val, rest) = read_int_3(rest)?;
            Ok((Some(val as u64), rest))
        }
        0xFE => {
            let (val, rest) = read_int_8(rest)?;
            Ok((Some(val), rest))
        }
        val => Ok((Some(val as u64), rest)),
    }
}

/// Read a packed integer as used for binary-protocol value lengths.
///
/// Same sentinels as [`read_packed_length`] except that `254` announces a
/// 4-byte integer. The two must stay distinct.
pub fn read_packed_int(data: &[u8]) -> Result<(Option<u32>, &[u8])> {
    let (first, rest) = read_int_1(data)?;
    match first {
        PACKED_NULL => Ok((None, rest)),
        0xFC => {
            let (val, rest) = read_int_2(rest)?;
            Ok((Some(val as u32), rest))
        }
        0xFD => read_int_3(rest).map(|(val, rest)| (Some(val), rest)),
        0xFE => read_int_4(rest).map(|(val, rest)| (Some(val), rest)),
        val => Ok((Some(val as u32), rest)),
    }
}

/// Read a packed length that must not be NULL
pub fn read_int_lenenc(data: &[u8]) -> Result<(u64, &[u8])> {
    match read_packed_length(data)? {
        (Some(val), rest) => Ok((val, rest)),
        (None, _) => Err(Error::protocol("unexpected NULL length")),
    }
}

/// Read fixed-length string
pub fn read_string_fix(data: &[u8], len: usize) -> Result<(&[u8], &[u8])> {
    if data.len() < len {
        return Err(short_packet(len, data.len()));
    }
    Ok(data.split_at(len))
}

/// Read null-terminated string. A missing terminator consumes the rest of the data.
pub fn read_string_null(data: &[u8]) -> (&[u8], &[u8]) {
    match data.iter().position(|&b| b == 0) {
        Some(i) => (&data[..i], &data[i + 1..]),
        None => (data, &[]),
    }
}

/// Read length-encoded string
pub fn read_string_lenenc(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let (len, rest) = read_int_lenenc(data)?;
    read_string_fix(rest, len as usize)
}

/// Write 1-byte integer
pub fn write_int_1(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

/// Write 2-byte little-endian integer
pub fn write_int_2(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write 3-byte little-endian integer
pub fn write_int_3(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes()[..3]);
}

/// Write 4-byte little-endian integer
pub fn write_int_4(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write 8-byte little-endian integer
pub fn write_int_8(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write a packed length (8-byte form for values >= 2^24)
pub fn write_int_lenenc(out: &mut Vec<u8>, value: u64) {
    if value < 251 {
        out.push(value as u8);
    } else if value < (1 << 16) {
        out.push(0xfc);
        write_int_2(out, value as u16);
    } else if value < (1 << 24) {
        out.push(0xfd);
        write_int_3(out, value as u32);
    } else {
        out.push(0xfe);
        write_int_8(out, value);
    }
}

/// Write a packed integer in the binary-protocol form (4-byte form for values >= 2^24)
pub fn write_packed_int(out: &mut Vec<u8>, value: u32) {
    if value < (1 << 24) {
        write_int_lenenc(out, u64::from(value));
    } else {
        out.push(0xfe);
        write_int_4(out, value);
    }
}

/// Write the NULL packed length
pub fn write_lenenc_null(out: &mut Vec<u8>) {
    out.push(PACKED_NULL);
}

/// Write null-terminated bytes
pub fn write_bytes_null(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(data);
    out.push(0);
}

/// Write length-encoded bytes
pub fn write_bytes_lenenc(out: &mut Vec<u8>, data: &[u8]) {
    write_int_lenenc(out, data.len() as u64);
    out.extend_from_slice(data);
}
